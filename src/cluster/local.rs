//! In-process substrate.
//!
//! Every member of a [`LocalCluster`] lives in the same process and shares one
//! map, one lock table and one member list. Remote calls are direct async calls
//! bounded by the same timeout contract as the networked invoker. Members can
//! be detached with [`LocalCluster::leave`] to simulate a crash.

use super::{
    CallHandler, ClusterLock, ClusterMap, ClusterServices, MemberCall, MemberId, MemberReply,
    Membership, RemoteInvoker,
};
use crate::error::FabricError;
use crate::executor::types::{Task, TaskId};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct LocalCluster {
    members: Arc<RwLock<Vec<MemberId>>>,
    /// Weak so that a registered executor does not keep itself alive through
    /// the invoker it holds.
    handlers: Arc<DashMap<MemberId, Weak<dyn CallHandler>>>,
    pending_work: Arc<InMemoryMap<TaskId, Task>>,
    locks: Arc<InMemoryLock>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: Arc::new(RwLock::new(Vec::new())),
            handlers: Arc::new(DashMap::new()),
            pending_work: Arc::new(InMemoryMap::new()),
            locks: Arc::new(InMemoryLock::new()),
        })
    }

    /// Adds a member and returns the substrate handles it should use.
    pub fn join(&self, member: MemberId) -> ClusterServices {
        {
            let mut members = self.members.write();
            if !members.contains(&member) {
                members.push(member.clone());
                members.sort();
            }
        }
        tracing::info!("Member {} joined the local cluster", member);

        ClusterServices {
            membership: Arc::new(LocalMembership {
                local: member,
                members: self.members.clone(),
            }),
            invoker: Arc::new(LoopbackInvoker {
                members: self.members.clone(),
                handlers: self.handlers.clone(),
            }),
            lock: self.locks.clone(),
            pending_work: self.pending_work.clone(),
        }
    }

    /// Makes `handler` the target of calls addressed to `member`.
    pub fn register(&self, member: &MemberId, handler: Arc<dyn CallHandler>) {
        self.handlers.insert(member.clone(), Arc::downgrade(&handler));
    }

    /// Removes a member: it is no longer reachable and calls to it fail.
    pub fn leave(&self, member: &MemberId) {
        self.members.write().retain(|m| m != member);
        self.handlers.remove(member);
        tracing::info!("Member {} left the local cluster", member);
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.members.read().clone()
    }

    pub fn pending_work(&self) -> Arc<InMemoryMap<TaskId, Task>> {
        self.pending_work.clone()
    }

    pub fn locks(&self) -> Arc<InMemoryLock> {
        self.locks.clone()
    }
}

struct LocalMembership {
    local: MemberId,
    members: Arc<RwLock<Vec<MemberId>>>,
}

impl Membership for LocalMembership {
    fn local_member(&self) -> MemberId {
        self.local.clone()
    }

    fn reachable_members(&self) -> Vec<MemberId> {
        self.members.read().clone()
    }
}

struct LoopbackInvoker {
    members: Arc<RwLock<Vec<MemberId>>>,
    handlers: Arc<DashMap<MemberId, Weak<dyn CallHandler>>>,
}

#[async_trait]
impl RemoteInvoker for LoopbackInvoker {
    async fn invoke(
        &self,
        member: &MemberId,
        call: MemberCall,
        timeout: Duration,
    ) -> Result<MemberReply> {
        if !self.members.read().contains(member) {
            return Err(anyhow::anyhow!("Member {} is not reachable", member));
        }

        let handler = self
            .handlers
            .get(member)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| anyhow::anyhow!("No handler registered for member {}", member))?;

        match tokio::time::timeout(timeout, handler.handle(call)).await {
            Ok(reply) => reply,
            Err(_) => Err(FabricError::Timeout {
                member: member.clone(),
                after: timeout,
            }
            .into()),
        }
    }
}

/// Map shared by every member of a [`LocalCluster`].
pub struct InMemoryMap<K, V> {
    entries: DashMap<K, V>,
}

impl<K, V> InMemoryMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_now(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<K, V> Default for InMemoryMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> ClusterMap<K, V> for InMemoryMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.get_now(key))
    }

    async fn put(&self, key: K, value: V) -> Result<()> {
        self.entries.insert(key, value);
        Ok(())
    }

    async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &K) -> Result<Option<V>> {
        Ok(self.entries.remove(key).map(|(_, value)| value))
    }

    async fn local_entries(&self) -> Result<Vec<(K, V)>> {
        // One shared copy: every member sees the whole map as its own.
        Ok(self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}

/// Lock table shared by every member of a [`LocalCluster`].
pub struct InMemoryLock {
    mutexes: DashMap<String, Arc<Mutex<()>>>,
    held: DashMap<String, OwnedMutexGuard<()>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self {
            mutexes: DashMap::new(),
            held: DashMap::new(),
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterLock for InMemoryLock {
    async fn lock(&self, name: &str) -> Result<()> {
        let mutex = self
            .mutexes
            .entry(name.to_string())
            .or_default()
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        self.held.insert(name.to_string(), guard);
        Ok(())
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        match self.held.remove(name) {
            Some(_) => Ok(()),
            None => Err(anyhow::anyhow!("Lock {} is not held", name)),
        }
    }
}
