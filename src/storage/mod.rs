//! Distributed Storage Module
//!
//! Implements the networked coordination substrate behind the pending-work
//! ledger and the cluster locks.
//!
//! ## Core Concepts
//! - **Partitioning**: Data is divided into fixed partitions (shards) based on key hashing.
//! - **Placement**: `PartitionManager` assigns partitions to members (Primary + Backup).
//! - **Replication**: Mutations run on the Primary, which pushes the resulting state to the Backup.
//! - **Handoff**: After a membership change, held partitions are pushed to their new Primary.
//! - **Access**: `ReplicatedMap` acts as a smart client, handling routing (local vs remote) transparently.
//! - **Locks**: `PartitionedLock` keeps expiring leases on the Primary of the lock name's partition.

pub mod handlers;
pub mod lock;
pub mod memory;
pub mod partitioner;
pub mod protocol;
