//! Partition-owned lease locks.
//!
//! A lock name hashes to a partition like any map key; the primary of that
//! partition keeps the lease table entry. A lease expires on its own, so a
//! holder that crashes (or whose release reaches a new primary after a
//! membership change) blocks the lock for at most one lease.

use super::partitioner::PartitionManager;
use super::protocol::*;
use crate::cluster::ClusterLock;
use crate::cluster::backoff::Backoff;
use crate::executor::types::now_ms;
use crate::membership::{service::MembershipService, types::MemberId};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;

const LOCK_CALL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
enum LockOp {
    Acquire,
    Release,
}

impl LockOp {
    fn endpoint(self) -> &'static str {
        match self {
            LockOp::Acquire => ENDPOINT_LOCK_ACQUIRE,
            LockOp::Release => ENDPOINT_LOCK_RELEASE,
        }
    }
}

#[derive(Debug, Clone)]
struct Lease {
    holder: MemberId,
    expires_at: u64,
}

pub struct PartitionedLock {
    leases: DashMap<String, Lease>,
    membership: Arc<MembershipService>,
    partitioner: Arc<PartitionManager>,
    lease: Duration,
    http_client: reqwest::Client,
}

impl PartitionedLock {
    pub fn new(
        membership: Arc<MembershipService>,
        partitioner: Arc<PartitionManager>,
        lease: Duration,
    ) -> Self {
        Self {
            leases: DashMap::new(),
            membership,
            partitioner,
            lease,
            http_client: reqwest::Client::new(),
        }
    }

    /// Grants the lease when it is free, expired, or already held by `holder`.
    pub fn grant_local(&self, name: &str, holder: &MemberId, lease: Duration, now: u64) -> bool {
        let expires_at = now.saturating_add(lease.as_millis() as u64);

        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut current) => {
                let existing = current.get();
                if existing.holder != *holder && existing.expires_at > now {
                    return false;
                }
                if existing.holder != *holder {
                    tracing::warn!(
                        "Lease on {} held by {} expired, granting to {}",
                        name,
                        existing.holder,
                        holder
                    );
                }
                current.insert(Lease {
                    holder: holder.clone(),
                    expires_at,
                });
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Lease {
                    holder: holder.clone(),
                    expires_at,
                });
                true
            }
        }
    }

    /// Drops the lease if `holder` owns it.
    pub fn release_local(&self, name: &str, holder: &MemberId) -> bool {
        self.leases
            .remove_if(name, |_, lease| lease.holder == *holder)
            .is_some()
    }

    pub fn holder_of(&self, name: &str) -> Option<MemberId> {
        self.leases.get(name).map(|lease| lease.holder.clone())
    }

    async fn call_owner(&self, name: &str, op: LockOp) -> Result<bool> {
        let holder = self.membership.local_member.id.clone();
        let partition = self.partitioner.get_partition(name);

        let owner = match self.partitioner.primary_of(partition) {
            Some(owner) => owner,
            None => holder.clone(),
        };

        if owner == holder {
            return Ok(match op {
                LockOp::Acquire => self.grant_local(name, &holder, self.lease, now_ms()),
                LockOp::Release => self.release_local(name, &holder),
            });
        }

        let member = self
            .membership
            .get_member(&owner)
            .ok_or_else(|| anyhow::anyhow!("Lock owner {} not found", owner))?;
        let request = LockRequest {
            name: name.to_string(),
            holder,
            lease_ms: self.lease.as_millis() as u64,
        };

        let response = self
            .http_client
            .post(format!("http://{}{}", member.http_addr, op.endpoint()))
            .json(&request)
            .timeout(LOCK_CALL_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Lock call failed: {}", response.status()));
        }
        let reply: LockResponse = response.json().await?;
        Ok(reply.granted)
    }
}

#[async_trait]
impl ClusterLock for PartitionedLock {
    async fn lock(&self, name: &str) -> Result<()> {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1));

        loop {
            match self.call_owner(name, LockOp::Acquire).await {
                Ok(true) => {
                    tracing::debug!("Acquired cluster lock {}", name);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Lock {} acquire attempt failed: {}", name, e),
            }

            backoff.wait().await;
        }
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        if !self.call_owner(name, LockOp::Release).await? {
            tracing::warn!("Cluster lock {} was not held at release", name);
        }
        tracing::debug!("Released cluster lock {}", name);
        Ok(())
    }
}
