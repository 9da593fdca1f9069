//! Rebalancer
//!
//! Periodic load leveling. Under a cluster-wide lock one member at a time
//! compares its own queue against the cluster average and, when it is far
//! enough below, steals queued work from the members above it.
//!
//! The decision itself is the pure [`plan_steal`]; [`Rebalancer`] does the
//! remote calls around it.

use crate::cluster::{ClusterServices, MemberCall, MemberId, MemberReply};
use crate::executor::local::LocalExecutorService;
use crate::executor::types::Task;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Fraction of the optimal size below which the local member bothers to steal.
pub const REBALANCE_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceDecision {
    /// No member reported a size.
    NoData,
    /// The local member's own size is missing from the reports.
    LocalSizeUnknown,
    /// Close enough to the average; nothing to do.
    Balanced { optimal: u64, local: u64 },
    Steal(StealPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StealPlan {
    pub optimal: u64,
    pub need_to_take: u64,
    /// Donor and the number of tasks to request from it. Never contains a zero.
    pub requests: Vec<(MemberId, u64)>,
}

impl StealPlan {
    pub fn total_requested(&self) -> u64 {
        self.requests.iter().map(|(_, take)| take).sum()
    }
}

/// Computes what `local` should steal given every member's reported queue size.
///
/// `optimal` is the integer average. The local member steals only when it is
/// below `optimal` and below [`REBALANCE_THRESHOLD`] of it. Donors are the
/// members above `optimal`, each asked for a share of the deficit
/// proportional to its size among the donors.
pub fn plan_steal(local: &MemberId, sizes: &[(MemberId, u64)]) -> RebalanceDecision {
    if sizes.is_empty() {
        return RebalanceDecision::NoData;
    }

    let Some(local_size) = sizes
        .iter()
        .find(|(member, _)| member == local)
        .map(|(_, size)| *size)
    else {
        return RebalanceDecision::LocalSizeUnknown;
    };

    let total: u64 = sizes.iter().map(|(_, size)| size).sum();
    let optimal = total / sizes.len() as u64;

    if local_size >= optimal || optimal as f64 * REBALANCE_THRESHOLD <= local_size as f64 {
        return RebalanceDecision::Balanced {
            optimal,
            local: local_size,
        };
    }

    let donors: Vec<&(MemberId, u64)> = sizes
        .iter()
        .filter(|(member, size)| member != local && *size > optimal)
        .collect();
    let total_exceeding_ideal: u64 = donors.iter().map(|(_, size)| size).sum();
    let need_to_take = optimal - local_size;

    let requests = donors
        .into_iter()
        .filter_map(|(member, size)| {
            let share = *size as f64 / total_exceeding_ideal as f64;
            let take = (need_to_take as f64 * share).round() as u64;
            (take > 0).then(|| (member.clone(), take))
        })
        .collect();

    RebalanceDecision::Steal(StealPlan {
        optimal,
        need_to_take,
        requests,
    })
}

pub struct Rebalancer {
    services: ClusterServices,
    local: Arc<LocalExecutorService>,
    lock_name: String,
    call_timeout: Duration,
}

impl Rebalancer {
    pub fn new(
        services: ClusterServices,
        local: Arc<LocalExecutorService>,
        lock_name: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            services,
            local,
            lock_name: lock_name.into(),
            call_timeout,
        }
    }

    /// One full cycle under the cluster lock. Returns the number of tasks that
    /// landed in the local queue.
    pub async fn run_cycle(&self) -> Result<usize> {
        if self.local.is_shutdown() {
            return Ok(0);
        }

        self.services.lock.lock(&self.lock_name).await?;
        let outcome = self.rebalance().await;
        if let Err(e) = self.services.lock.unlock(&self.lock_name).await {
            tracing::warn!("Failed to release lock {}: {}", self.lock_name, e);
        }
        outcome
    }

    async fn rebalance(&self) -> Result<usize> {
        let me = self.services.local_member();
        let sizes = self.collect_sizes(&me).await;

        match plan_steal(&me, &sizes) {
            RebalanceDecision::NoData => {
                tracing::debug!("No queue sizes collected, skipping rebalance");
                Ok(0)
            }
            RebalanceDecision::LocalSizeUnknown => {
                tracing::warn!("Local queue size missing from reports, skipping rebalance");
                Ok(0)
            }
            RebalanceDecision::Balanced { optimal, local } => {
                tracing::debug!(
                    "Queue balanced enough (local {}, optimal {}), nothing to steal",
                    local,
                    optimal
                );
                Ok(0)
            }
            RebalanceDecision::Steal(plan) => {
                tracing::info!(
                    "Rebalancing: optimal {}, taking {} from {} members",
                    plan.optimal,
                    plan.need_to_take,
                    plan.requests.len()
                );
                Ok(self.execute_plan(plan).await)
            }
        }
    }

    async fn collect_sizes(&self, me: &MemberId) -> Vec<(MemberId, u64)> {
        let mut sizes = Vec::new();
        let mut calls = JoinSet::new();

        for member in self.services.membership.reachable_members() {
            if &member == me {
                sizes.push((member, self.local.queue_size() as u64));
                continue;
            }

            let invoker = self.services.invoker.clone();
            let timeout = self.call_timeout;
            calls.spawn(async move {
                let reply = invoker.invoke(&member, MemberCall::QueueSize, timeout).await;
                (member, reply)
            });
        }

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((member, Ok(MemberReply::QueueSize { size }))) => sizes.push((member, size)),
                Ok((member, Ok(other))) => {
                    tracing::warn!("Unexpected {} reply to queue_size from {}", other.kind(), member)
                }
                Ok((member, Err(e))) => {
                    tracing::warn!("Could not get queue size of {}: {}", member, e)
                }
                Err(e) => tracing::warn!("Queue size call aborted: {}", e),
            }
        }

        sizes
    }

    async fn execute_plan(&self, plan: StealPlan) -> usize {
        let mut calls = JoinSet::new();
        for (donor, take) in plan.requests {
            let invoker = self.services.invoker.clone();
            let timeout = self.call_timeout;
            calls.spawn(async move {
                let reply = invoker
                    .invoke(&donor, MemberCall::Steal { count: take }, timeout)
                    .await;
                (donor, take, reply)
            });
        }

        let mut received = 0;
        while let Some(joined) = calls.join_next().await {
            let tasks = match joined {
                Ok((donor, take, Ok(MemberReply::Tasks { tasks }))) => {
                    tracing::debug!("Stole {} of {} tasks from {}", tasks.len(), take, donor);
                    tasks
                }
                Ok((donor, _, Ok(other))) => {
                    tracing::warn!("Unexpected {} reply to steal from {}", other.kind(), donor);
                    continue;
                }
                Ok((donor, _, Err(e))) => {
                    tracing::warn!("Steal from {} failed: {}", donor, e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Steal call aborted: {}", e);
                    continue;
                }
            };
            received += self.accept_stolen(tasks);
        }

        tracing::info!("Rebalance cycle received {} tasks", received);
        received
    }

    fn accept_stolen(&self, tasks: Vec<Task>) -> usize {
        let mut accepted = 0;
        for mut task in tasks {
            task.mark_stolen();
            let task_id = task.id.clone();
            if self.local.execute(task) {
                accepted += 1;
            } else {
                // The ledger entry is untouched, recovery redispatches it.
                tracing::warn!("Stolen task {} refused by the local pool", task_id);
            }
        }
        accepted
    }

    /// Runs [`run_cycle`](Self::run_cycle) every `interval` until `stop` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            tracing::warn!("Rebalance cycle failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Rebalancer stopped");
        })
    }
}
