//! Stale-work recovery.
//!
//! A ledger entry older than every task any member still holds, and older
//! than the configured minimum age, belongs to work that was lost (its member
//! died, or dispatch never reached anyone). The sweep resubmits it.

use super::dispatcher::{Dispatcher, SubmitOutcome};
use super::ledger::PendingWorkLedger;
use crate::cluster::{ClusterServices, MemberCall, MemberReply};
use crate::executor::local::LocalExecutorService;
use crate::executor::types::now_ms;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Creation time before which a ledger entry counts as lost.
///
/// `oldest` holds one report per member; `None` means that member holds no
/// work. With no work anywhere the cutoff is `now`, always capped at
/// `now - min_age_ms`.
pub fn recovery_cutoff(oldest: &[Option<u64>], now: u64, min_age_ms: u64) -> u64 {
    let oldest_resident = oldest.iter().flatten().copied().min().unwrap_or(now);
    oldest_resident.min(now.saturating_sub(min_age_ms))
}

pub struct RecoverySweep {
    services: ClusterServices,
    local: Arc<LocalExecutorService>,
    ledger: Arc<PendingWorkLedger>,
    dispatcher: Arc<Dispatcher>,
    lock_name: String,
    call_timeout: Duration,
    min_age: Duration,
}

impl RecoverySweep {
    pub fn new(
        services: ClusterServices,
        local: Arc<LocalExecutorService>,
        ledger: Arc<PendingWorkLedger>,
        dispatcher: Arc<Dispatcher>,
        lock_name: impl Into<String>,
        call_timeout: Duration,
        min_age: Duration,
    ) -> Self {
        Self {
            services,
            local,
            ledger,
            dispatcher,
            lock_name: lock_name.into(),
            call_timeout,
            min_age,
        }
    }

    /// One sweep under the recovery lock. Returns how many entries were
    /// resubmitted.
    pub async fn run_cycle(&self) -> Result<usize> {
        if self.local.is_shutdown() {
            return Ok(0);
        }

        self.services.lock.lock(&self.lock_name).await?;
        let outcome = self.sweep().await;
        if let Err(e) = self.services.lock.unlock(&self.lock_name).await {
            tracing::warn!("Failed to release lock {}: {}", self.lock_name, e);
        }
        outcome
    }

    async fn sweep(&self) -> Result<usize> {
        let Some(oldest) = self.collect_oldest().await else {
            tracing::debug!("Not every member reported its oldest work, skipping recovery");
            return Ok(0);
        };

        let cutoff = recovery_cutoff(&oldest, now_ms(), self.min_age.as_millis() as u64);
        let stale = self.ledger.stale_entries(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        tracing::info!("Recovering {} lost tasks older than {}", stale.len(), cutoff);

        let mut resubmitted = 0;
        for task in stale {
            let task_id = task.id.clone();
            match self.dispatcher.resubmit(task).await {
                Ok(SubmitOutcome::Dispatched(member)) => {
                    tracing::debug!("Recovered task {} onto {}", task_id, member);
                    resubmitted += 1;
                }
                Ok(_) => resubmitted += 1,
                Err(e) => tracing::warn!("Could not resubmit task {}: {}", task_id, e),
            }
        }
        Ok(resubmitted)
    }

    /// Every member's oldest work time, or `None` if any member failed to answer.
    async fn collect_oldest(&self) -> Option<Vec<Option<u64>>> {
        let me = self.services.local_member();
        let mut oldest = Vec::new();
        let mut calls = JoinSet::new();

        for member in self.services.membership.reachable_members() {
            if member == me {
                oldest.push(self.local.oldest_work_time());
                continue;
            }

            let invoker = self.services.invoker.clone();
            let timeout = self.call_timeout;
            calls.spawn(async move {
                let reply = invoker
                    .invoke(&member, MemberCall::OldestWorkTime, timeout)
                    .await;
                (member, reply)
            });
        }

        let mut complete = true;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((_, Ok(MemberReply::OldestWorkTime { oldest: time }))) => oldest.push(time),
                Ok((member, Ok(other))) => {
                    tracing::warn!(
                        "Unexpected {} reply to oldest_work_time from {}",
                        other.kind(),
                        member
                    );
                    complete = false;
                }
                Ok((member, Err(e))) => {
                    tracing::warn!("Could not get oldest work time of {}: {}", member, e);
                    complete = false;
                }
                Err(e) => {
                    tracing::warn!("Oldest work time call aborted: {}", e);
                    complete = false;
                }
            }
        }

        complete.then_some(oldest)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            tracing::warn!("Recovery sweep failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Recovery sweep stopped");
        })
    }
}
