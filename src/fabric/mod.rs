//! Distributed Execution Layer
//!
//! Turns the per-member [`executor`](crate::executor) into a cluster-wide
//! fabric on top of the [`cluster`](crate::cluster) substrate.
//!
//! ## Flow
//! 1. **Submit**: the task is written to the [`ledger`] (insert-if-absent, so a
//!    repeated id is a no-op) and only then handed to the [`dispatcher`].
//! 2. **Dispatch**: round-robin over reachable members, one bounded
//!    `Enqueue` call. No member or a failed call leaves the task recorded but
//!    undispatched.
//! 3. **Complete**: a listener on every member removes the ledger entry after
//!    the task ran there.
//! 4. **Level**: the [`rebalance`] cycle moves queued work toward idle members.
//! 5. **Recover**: the [`recovery`] sweep resubmits ledger entries that no
//!    member holds any more.

pub mod dispatcher;
pub mod handlers;
pub mod ledger;
pub mod protocol;
pub mod rebalance;
pub mod recovery;
pub mod service;
