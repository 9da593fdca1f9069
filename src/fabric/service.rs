//! Distributed Executor
//!
//! The handle callers hold. Wires one member's [`LocalExecutorService`] to
//! the cluster: submissions go through the ledger and the dispatcher, the
//! rebalancer and the recovery sweep run on timers, and incoming
//! [`MemberCall`]s are answered through [`CallHandler`].

use super::dispatcher::{Dispatcher, SubmitOutcome};
use super::ledger::{LedgerCompletionListener, PendingWorkLedger};
use super::protocol::StatsResponse;
use super::rebalance::Rebalancer;
use super::recovery::RecoverySweep;
use crate::cluster::{CallHandler, ClusterServices, MemberCall, MemberId, MemberReply, ShutdownMode};
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::executor::listener::{ExecutorListener, TaskOutcome};
use crate::executor::local::LocalExecutorService;
use crate::executor::registry::TaskHandlerRegistry;
use crate::executor::types::{GroupKey, Task, TaskBody, TaskId};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

pub struct DistributedExecutor {
    config: FabricConfig,
    services: ClusterServices,
    local: Arc<LocalExecutorService>,
    ledger: Arc<PendingWorkLedger>,
    dispatcher: Arc<Dispatcher>,
    rebalancer: Arc<Rebalancer>,
    recovery: Arc<RecoverySweep>,
    timer_stop: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributedExecutor {
    pub fn new(
        config: FabricConfig,
        services: ClusterServices,
        registry: Arc<TaskHandlerRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let local = LocalExecutorService::new(registry, config.worker_count, config.outcome_capacity);
        let ledger = Arc::new(PendingWorkLedger::new(services.pending_work.clone()));
        local.add_listener(Arc::new(LedgerCompletionListener::new(
            ledger.clone(),
            local.abort_signal(),
        )));

        let dispatcher = Arc::new(Dispatcher::new(
            services.clone(),
            ledger.clone(),
            config.remote_call_timeout,
        ));
        let rebalancer = Arc::new(Rebalancer::new(
            services.clone(),
            local.clone(),
            config.rebalance_lock_name.clone(),
            config.remote_call_timeout,
        ));
        let recovery = Arc::new(RecoverySweep::new(
            services.clone(),
            local.clone(),
            ledger.clone(),
            dispatcher.clone(),
            config.recovery_lock_name.clone(),
            config.remote_call_timeout,
            config.recovery_min_age,
        ));

        Ok(Arc::new(Self {
            config,
            services,
            local,
            ledger,
            dispatcher,
            rebalancer,
            recovery,
            timer_stop: CancellationToken::new(),
            timers: Mutex::new(Vec::new()),
        }))
    }

    /// Starts the workers and the periodic rebalance and recovery cycles.
    pub fn start(&self) {
        let mut timers = self.timers.lock();
        if !timers.is_empty() || self.local.is_shutdown() {
            return;
        }

        self.local.start();

        if self.config.rebalance_enabled {
            timers.push(
                self.rebalancer
                    .clone()
                    .spawn(self.config.rebalance_interval, self.timer_stop.clone()),
            );
        }
        timers.push(
            self.recovery
                .clone()
                .spawn(self.config.recovery_interval, self.timer_stop.clone()),
        );

        tracing::info!(
            "Distributed executor started on {} ({} workers)",
            self.services.local_member(),
            self.config.worker_count
        );
    }

    pub fn member(&self) -> MemberId {
        self.services.local_member()
    }

    /// Submits new work. `false` only if this member stopped accepting.
    pub async fn submit(&self, group: impl Into<GroupKey>, body: TaskBody) -> Result<bool> {
        let task = Task::new(TaskId::new(), group.into(), body);
        match self.submit_task(task).await {
            Ok(_) => Ok(true),
            Err(FabricError::PoolShutDown) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Submits a caller-built task. Submitting the same id again while it is
    /// pending yields [`SubmitOutcome::Duplicate`].
    pub async fn submit_task(&self, task: Task) -> Result<SubmitOutcome> {
        if self.local.is_shutdown() {
            return Err(FabricError::PoolShutDown);
        }
        self.dispatcher.submit(task).await
    }

    /// Overwrites the ledger entry and dispatches the task again.
    pub async fn resubmit(&self, task: Task) -> Result<SubmitOutcome> {
        if self.local.is_shutdown() {
            return Err(FabricError::PoolShutDown);
        }
        self.dispatcher.resubmit(task).await
    }

    pub fn queue_size(&self) -> usize {
        self.local.queue_size()
    }

    pub fn queue_size_by_group(&self) -> HashMap<GroupKey, usize> {
        self.local.group_sizes()
    }

    pub fn oldest_queued_time(&self) -> Option<u64> {
        self.local.oldest_queued_time()
    }

    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            member: self.member(),
            run_state: self.local.run_state(),
            queue_size: self.local.queue_size(),
            queue_size_by_group: self.local.group_sizes().into_iter().collect(),
            oldest_queued_time: self.local.oldest_queued_time(),
            completed_tasks: self.local.completed_task_count(),
            workers: self.local.workers(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutorListener>) {
        self.local.add_listener(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.local.subscribe()
    }

    pub fn local(&self) -> &Arc<LocalExecutorService> {
        &self.local
    }

    pub fn ledger(&self) -> &Arc<PendingWorkLedger> {
        &self.ledger
    }

    /// Runs one rebalance cycle now, outside the timer.
    pub async fn rebalance_now(&self) -> anyhow::Result<usize> {
        self.rebalancer.run_cycle().await
    }

    /// Runs one recovery sweep now, outside the timer.
    pub async fn recover_now(&self) -> anyhow::Result<usize> {
        self.recovery.run_cycle().await
    }

    fn stop_timers(&self) {
        self.timer_stop.cancel();
        self.timers.lock().clear();
    }

    /// Graceful shutdown of this member: queued work still runs.
    pub fn shutdown(&self) {
        self.stop_timers();
        self.local.shutdown();
    }

    /// Forced shutdown of this member. Returns queued and interrupted tasks;
    /// their ledger entries stay for recovery elsewhere.
    pub fn shutdown_now(&self) -> Vec<Task> {
        self.stop_timers();
        self.local.shutdown_now()
    }

    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.local.await_termination(timeout).await
    }

    async fn call_members(&self, mode: ShutdownMode) -> Vec<(MemberId, Result<MemberReply>)> {
        let me = self.member();
        let mut calls = JoinSet::new();

        for member in self.services.membership.reachable_members() {
            if member == me {
                continue;
            }
            let invoker = self.services.invoker.clone();
            let timeout = self.config.remote_call_timeout;
            calls.spawn(async move {
                let reply = invoker
                    .invoke(&member, MemberCall::Shutdown { mode }, timeout)
                    .await
                    .map_err(|e| FabricError::RemoteCall {
                        member: member.clone(),
                        reason: e.to_string(),
                    });
                (member, reply)
            });
        }

        let mut replies = Vec::new();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(reply) => replies.push(reply),
                Err(e) => tracing::warn!("Shutdown call aborted: {}", e),
            }
        }
        replies
    }

    /// Gracefully shuts down every reachable member, this one last.
    pub async fn shutdown_cluster(&self) {
        tracing::info!("Shutting down the cluster");
        for (member, reply) in self.call_members(ShutdownMode::Graceful).await {
            if let Err(e) = reply {
                tracing::warn!("Member {} did not confirm shutdown: {}", member, e);
            }
        }
        self.shutdown();
    }

    /// Forcibly shuts down every reachable member and returns the union of
    /// their undone tasks.
    pub async fn shutdown_cluster_now(&self) -> Vec<Task> {
        tracing::info!("Forcing cluster shutdown");
        let mut undone = Vec::new();

        for (member, reply) in self.call_members(ShutdownMode::Immediate).await {
            let tasks = reply.and_then(|reply| match reply {
                MemberReply::Tasks { tasks } => Ok(tasks),
                _ => Err(FabricError::UnexpectedReply { expected: "tasks" }),
            });
            match tasks {
                Ok(tasks) => undone.extend(tasks),
                Err(e) => tracing::warn!("Member {} did not hand back its work: {}", member, e),
            }
        }

        undone.extend(self.shutdown_now());
        undone
    }
}

#[async_trait]
impl CallHandler for DistributedExecutor {
    async fn handle(&self, call: MemberCall) -> anyhow::Result<MemberReply> {
        match call {
            MemberCall::Shutdown {
                mode: ShutdownMode::Graceful,
            } => {
                self.shutdown();
                Ok(MemberReply::ShutdownStarted)
            }
            MemberCall::Shutdown {
                mode: ShutdownMode::Immediate,
            } => Ok(MemberReply::Tasks {
                tasks: self.shutdown_now(),
            }),
            other => self.local.handle(other).await,
        }
    }
}
