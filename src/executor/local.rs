//! Local Executor Service
//!
//! One member's engine: a [`GroupedQueue`] drained by a [`WorkerPool`], with
//! the listener chain wrapped around every execution. This is the member-side
//! target of every [`MemberCall`]: dispatch enqueues through
//! [`execute`](LocalExecutorService::execute), the rebalancer of another
//! member drains through [`steal_tasks`](LocalExecutorService::steal_tasks).

use super::listener::{ExecutorListener, ListenerChain, OutcomeListener, TaskOutcome};
use super::pool::{RunState, WorkerPool, WorkerSnapshot};
use super::queue::GroupedQueue;
use super::registry::TaskHandlerRegistry;
use super::types::*;
use crate::cluster::{CallHandler, MemberCall, MemberReply, ShutdownMode};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub struct LocalExecutorService {
    queue: Arc<GroupedQueue>,
    pool: Arc<WorkerPool>,
    listeners: Arc<ListenerChain>,
    outcomes: Arc<OutcomeListener>,
}

impl LocalExecutorService {
    pub fn new(
        registry: Arc<TaskHandlerRegistry>,
        worker_count: usize,
        outcome_capacity: usize,
    ) -> Arc<Self> {
        let queue = Arc::new(GroupedQueue::new());
        let listeners = Arc::new(ListenerChain::new());
        let outcomes = Arc::new(OutcomeListener::new(outcome_capacity));
        listeners.add(outcomes.clone());

        let pool = WorkerPool::new(queue.clone(), registry, listeners.clone(), worker_count);

        Arc::new(Self {
            queue,
            pool,
            listeners,
            outcomes,
        })
    }

    pub fn start(&self) {
        self.pool.start();
    }

    /// Registers a hook invoked around every execution on this member.
    pub fn add_listener(&self, listener: Arc<dyn ExecutorListener>) {
        self.listeners.add(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.outcomes.subscribe()
    }

    /// The accept path. Returns `false` only once the pool stopped accepting.
    ///
    /// A task whose id is already queued or running here is acknowledged
    /// without being enqueued a second time. The check is best effort: a
    /// concurrent accept of the same id can still slip through, which the
    /// at-least-once contract of task bodies covers.
    pub fn execute(&self, task: Task) -> bool {
        if self.pool.is_shutdown() {
            tracing::debug!("Refusing task {}: pool is shut down", task.id);
            return false;
        }

        if self.queue.contains(&task.id) || self.pool.is_in_progress(&task.id) {
            tracing::debug!("Task {} already resident, ignoring duplicate", task.id);
            return true;
        }

        tracing::debug!("Accepted task {} into group {}", task.id, task.group);
        self.queue.add(task)
    }

    /// Removes up to `count` queued tasks, proportionally across groups.
    pub fn steal_tasks(&self, count: usize) -> Vec<Task> {
        let stolen = self.queue.drain_proportional(count);
        if !stolen.is_empty() {
            tracing::info!("Gave away {} of {} requested tasks", stolen.len(), count);
        }
        stolen
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    pub fn group_sizes(&self) -> HashMap<GroupKey, usize> {
        self.queue.size_by_group()
    }

    pub fn oldest_queued_time(&self) -> Option<u64> {
        self.queue.oldest_creation_time()
    }

    /// Oldest creation time among queued and running tasks.
    pub fn oldest_work_time(&self) -> Option<u64> {
        let running = self
            .pool
            .tasks_in_progress()
            .into_iter()
            .map(|task| task.created_at)
            .min();

        match (self.queue.oldest_creation_time(), running) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn tasks_in_progress(&self) -> Vec<Task> {
        self.pool.tasks_in_progress()
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.pool.workers()
    }

    pub fn completed_task_count(&self) -> u64 {
        self.pool.completed_task_count()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn shutdown_now(&self) -> Vec<Task> {
        self.pool.shutdown_now()
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.pool.is_terminated()
    }

    pub fn run_state(&self) -> RunState {
        self.pool.run_state()
    }

    /// Cancelled once a forced shutdown begins. Bodies ending after that point
    /// were interrupted, not completed.
    pub fn abort_signal(&self) -> CancellationToken {
        self.pool.abort_signal()
    }

    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.pool.await_termination(timeout).await
    }
}

#[async_trait]
impl CallHandler for LocalExecutorService {
    async fn handle(&self, call: MemberCall) -> Result<MemberReply> {
        let reply = match call {
            MemberCall::Enqueue { task } => MemberReply::Accepted {
                accepted: self.execute(task),
            },
            MemberCall::QueueSize => MemberReply::QueueSize {
                size: self.queue_size() as u64,
            },
            MemberCall::OldestWorkTime => MemberReply::OldestWorkTime {
                oldest: self.oldest_work_time(),
            },
            MemberCall::Steal { count } => MemberReply::Tasks {
                tasks: self.steal_tasks(count as usize),
            },
            MemberCall::Shutdown {
                mode: ShutdownMode::Graceful,
            } => {
                self.shutdown();
                MemberReply::ShutdownStarted
            }
            MemberCall::Shutdown {
                mode: ShutdownMode::Immediate,
            } => MemberReply::Tasks {
                tasks: self.shutdown_now(),
            },
        };
        Ok(reply)
    }
}
