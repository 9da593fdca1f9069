//! Coordination Substrate Contracts
//!
//! The execution fabric consumes four cluster facilities and never builds them
//! itself:
//! - a cluster-wide key/value map (backs the pending-work ledger),
//! - a named cluster-wide mutual-exclusion lock (serialises rebalancing),
//! - membership enumeration (who is reachable right now),
//! - a bounded remote-invocation primitive (run a [`MemberCall`] on a member).
//!
//! Two implementations ship with the crate: [`local`] keeps every member in one
//! process (embedding, tests) and the networked one is assembled from the
//! gossip [`membership`](crate::membership), the partitioned
//! [`storage`](crate::storage) map and lock, and the [`http`] invoker.

pub mod backoff;
pub mod http;
pub mod local;
pub mod protocol;


pub use crate::membership::types::MemberId;
pub use protocol::{MemberCall, MemberReply, ShutdownMode};

use crate::executor::types::{Task, TaskId};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Cluster-visible map. Every mutation of one key is last-writer-wins.
#[async_trait]
pub trait ClusterMap<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>>;

    /// Unconditional overwrite.
    async fn put(&self, key: K, value: V) -> Result<()>;

    /// Inserts only when the key is absent. Returns the existing value otherwise.
    async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>>;

    async fn remove(&self, key: &K) -> Result<Option<V>>;

    /// Entries whose primary copy lives on the calling member. Across all
    /// members these cover the whole map exactly once.
    async fn local_entries(&self) -> Result<Vec<(K, V)>>;
}

/// Named cluster-wide mutual exclusion.
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Blocks until the lock is held by the calling member.
    async fn lock(&self, name: &str) -> Result<()>;

    async fn unlock(&self, name: &str) -> Result<()>;
}

pub trait Membership: Send + Sync {
    fn local_member(&self) -> MemberId;

    /// Currently reachable members, the local one included, in a stable order.
    fn reachable_members(&self) -> Vec<MemberId>;
}

/// Runs a call on a named member and returns its reply, or fails, within
/// `timeout`. Implementations must never exceed the timeout.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(
        &self,
        member: &MemberId,
        call: MemberCall,
        timeout: Duration,
    ) -> Result<MemberReply>;
}

/// Member-side entry point for [`MemberCall`]s.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, call: MemberCall) -> Result<MemberReply>;
}

/// The substrate handles one member works with.
#[derive(Clone)]
pub struct ClusterServices {
    pub membership: Arc<dyn Membership>,
    pub invoker: Arc<dyn RemoteInvoker>,
    pub lock: Arc<dyn ClusterLock>,
    pub pending_work: Arc<dyn ClusterMap<TaskId, Task>>,
}

impl ClusterServices {
    pub fn local_member(&self) -> MemberId {
        self.membership.local_member()
    }
}
