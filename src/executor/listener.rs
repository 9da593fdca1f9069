//! Execution hooks.
//!
//! Listeners run on the worker, before and after every task body. The chain
//! isolates them: a listener returning an error is logged and skipped, the
//! remaining listeners and the worker's bookkeeping still run.

use super::types::*;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[async_trait]
pub trait ExecutorListener: Send + Sync {
    async fn before_execute(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    /// `error` is the execution error of the body, if it failed.
    async fn after_execute(&self, task: &Task, error: Option<&str>) -> anyhow::Result<()>;
}

/// Ordered set of listeners invoked by every worker of a pool.
#[derive(Default)]
pub struct ListenerChain {
    listeners: RwLock<Vec<Arc<dyn ExecutorListener>>>,
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ExecutorListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The lock is never held across an await; listeners are cloned out first.
    fn snapshot(&self) -> Vec<Arc<dyn ExecutorListener>> {
        self.listeners.read().clone()
    }

    pub async fn before_execute(&self, task: &Task) {
        for listener in self.snapshot() {
            if let Err(e) = listener.before_execute(task).await {
                tracing::error!("before_execute listener failed for task {}: {}", task.id, e);
            }
        }
    }

    pub async fn after_execute(&self, task: &Task, error: Option<&str>) {
        for listener in self.snapshot() {
            if let Err(e) = listener.after_execute(task, error).await {
                tracing::error!("after_execute listener failed for task {}: {}", task.id, e);
            }
        }
    }
}

/// Result of one execution, as delivered to outcome subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub group: GroupKey,
    pub submission_count: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Publishes a [`TaskOutcome`] after every execution on this member.
pub struct OutcomeListener {
    sender: broadcast::Sender<TaskOutcome>,
}

impl OutcomeListener {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl ExecutorListener for OutcomeListener {
    async fn after_execute(&self, task: &Task, error: Option<&str>) -> anyhow::Result<()> {
        let outcome = TaskOutcome {
            task_id: task.id.clone(),
            group: task.group.clone(),
            submission_count: task.submission_count,
            result: task.result.clone(),
            error: error.map(str::to_string),
        };
        // No subscribers is not an error.
        let _ = self.sender.send(outcome);
        Ok(())
    }
}
