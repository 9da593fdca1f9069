//! Membership & Discovery Module
//!
//! Implements a Gossip-based membership protocol (inspired by SWIM) to manage the cluster topology.
//! Members use this service to discover each other, detect failures, and disseminate cluster state updates.
//! It is the [`Membership`](crate::cluster::Membership) source of a networked node: the dispatcher
//! routes over its alive members and the invoker resolves their HTTP addresses here.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Members periodically exchange status updates via UDP to maintain a consistent view of the cluster.
//! - **Failure Detection**: Uses a "Suspect" -> "Dead" transition model with timeouts to handle crashes gracefully.
//! - **Incarnation Numbers**: Solves conflict resolution when member state (Alive/Suspect) is disputed.
//! - **Graceful Leave**: A departing member announces itself as `Left` and is never routed to again.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
