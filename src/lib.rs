//! Distributed Task Execution Fabric
//!
//! This library crate defines the core modules that make up the distributed system.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`executor`**: The local engine of one member. A grouped fair queue drained by a
//!   fixed pool of workers, with execution hooks around every task.
//! - **`fabric`**: The distributed layer. Pending-work ledger, round-robin dispatch,
//!   lock-guarded rebalancing by work stealing and recovery of lost work.
//! - **`cluster`**: The coordination contracts the fabric consumes (map, lock, membership,
//!   remote calls), with an in-process implementation and an HTTP invoker.
//! - **`membership`**: The cluster coordination layer. Uses a UDP-based Gossip protocol
//!   (SWIM-like) to manage node discovery, failure detection, and cluster topology.
//! - **`storage`**: The distributed state layer. A sharded, replicated in-memory map
//!   (`ReplicatedMap`) backing the ledger, and partition-owned lease locks.

pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod fabric;
pub mod membership;
pub mod storage;
