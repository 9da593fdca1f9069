//! Pending-Work Ledger
//!
//! Cluster-visible write-ahead record of every task that has been submitted
//! but not yet completed. Written before dispatch, removed by
//! [`LedgerCompletionListener`] after the task ran on some member.

use crate::cluster::ClusterMap;
use crate::error::{FabricError, Result};
use crate::executor::listener::ExecutorListener;
use crate::executor::types::{Task, TaskId};

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct PendingWorkLedger {
    map: Arc<dyn ClusterMap<TaskId, Task>>,
}

impl PendingWorkLedger {
    pub fn new(map: Arc<dyn ClusterMap<TaskId, Task>>) -> Self {
        Self { map }
    }

    /// Records a first submission. Returns `false` when an entry for the id
    /// already exists, in which case nothing is written.
    pub async fn record_if_absent(&self, task: &Task) -> Result<bool> {
        let existing = self
            .map
            .put_if_absent(task.id.clone(), task.clone())
            .await
            .map_err(FabricError::Ledger)?;
        Ok(existing.is_none())
    }

    /// Unconditional overwrite, used for resubmission.
    pub async fn record(&self, task: &Task) -> Result<()> {
        self.map
            .put(task.id.clone(), task.clone())
            .await
            .map_err(FabricError::Ledger)
    }

    pub async fn remove(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.map.remove(task_id).await.map_err(FabricError::Ledger)
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.map.get(task_id).await.map_err(FabricError::Ledger)
    }

    /// Entries this member is responsible for whose `created_at` is before
    /// `cutoff`, oldest first.
    pub async fn stale_entries(&self, cutoff: u64) -> Result<Vec<Task>> {
        let mut stale: Vec<Task> = self
            .map
            .local_entries()
            .await
            .map_err(FabricError::Ledger)?
            .into_iter()
            .map(|(_, task)| task)
            .filter(|task| task.created_at < cutoff)
            .collect();
        stale.sort_by_key(|task| task.created_at);
        Ok(stale)
    }
}

/// Removes the ledger entry of every task once it ran, successfully or not.
///
/// A body that ends after a forced shutdown began was interrupted; its entry
/// stays so the task can be recovered.
pub struct LedgerCompletionListener {
    ledger: Arc<PendingWorkLedger>,
    aborted: CancellationToken,
}

impl LedgerCompletionListener {
    pub fn new(ledger: Arc<PendingWorkLedger>, aborted: CancellationToken) -> Self {
        Self { ledger, aborted }
    }
}

#[async_trait]
impl ExecutorListener for LedgerCompletionListener {
    async fn after_execute(&self, task: &Task, error: Option<&str>) -> anyhow::Result<()> {
        if error.is_some() && self.aborted.is_cancelled() {
            tracing::debug!("Task {} interrupted by shutdown, keeping ledger entry", task.id);
            return Ok(());
        }

        self.ledger.remove(&task.id).await?;
        tracing::debug!("Removed ledger entry of completed task {}", task.id);
        Ok(())
    }
}
