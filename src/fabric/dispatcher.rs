//! Routing of submitted work to a member.

use super::ledger::PendingWorkLedger;
use crate::cluster::{ClusterServices, MemberCall, MemberId, MemberReply};
use crate::error::Result;
use crate::executor::types::Task;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Round-robin over whatever member list it is handed.
#[derive(Default)]
pub struct MemberRouter {
    next: AtomicUsize,
}

impl MemberRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, members: &[MemberId]) -> Option<MemberId> {
        if members.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % members.len();
        Some(members[idx].clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Enqueued on the named member.
    Dispatched(MemberId),
    /// An entry for the id already existed; nothing was dispatched.
    Duplicate,
    /// Recorded in the ledger but not enqueued anywhere yet. The recovery
    /// sweep picks it up.
    Undispatched,
}

pub struct Dispatcher {
    services: ClusterServices,
    ledger: Arc<PendingWorkLedger>,
    router: MemberRouter,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        services: ClusterServices,
        ledger: Arc<PendingWorkLedger>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            services,
            ledger,
            router: MemberRouter::new(),
            call_timeout,
        }
    }

    /// Records the task if its id is new, then dispatches it. A duplicate id
    /// is neither re-recorded nor re-dispatched.
    pub async fn submit(&self, task: Task) -> Result<SubmitOutcome> {
        if !self.ledger.record_if_absent(&task).await? {
            tracing::debug!("Task {} already pending, not dispatching again", task.id);
            return Ok(SubmitOutcome::Duplicate);
        }
        Ok(self.dispatch(task).await)
    }

    /// Overwrites the ledger entry with a refreshed copy and dispatches it.
    pub async fn resubmit(&self, mut task: Task) -> Result<SubmitOutcome> {
        task.mark_resubmitted();
        self.ledger.record(&task).await?;
        tracing::info!(
            "Resubmitting task {} (submission {})",
            task.id,
            task.submission_count
        );
        Ok(self.dispatch(task).await)
    }

    async fn dispatch(&self, task: Task) -> SubmitOutcome {
        let members = self.services.membership.reachable_members();
        let Some(target) = self.router.next(&members) else {
            tracing::warn!("No members to dispatch task {} to, it stays pending", task.id);
            return SubmitOutcome::Undispatched;
        };

        let task_id = task.id.clone();
        let reply = self
            .services
            .invoker
            .invoke(&target, MemberCall::Enqueue { task }, self.call_timeout)
            .await;

        match reply {
            Ok(MemberReply::Accepted { accepted: true }) => {
                tracing::debug!("Dispatched task {} to {}", task_id, target);
                SubmitOutcome::Dispatched(target)
            }
            Ok(MemberReply::Accepted { accepted: false }) => {
                tracing::warn!("Member {} refused task {}, it stays pending", target, task_id);
                SubmitOutcome::Undispatched
            }
            Ok(other) => {
                tracing::warn!(
                    "Unexpected {} reply dispatching task {} to {}",
                    other.kind(),
                    task_id,
                    target
                );
                SubmitOutcome::Undispatched
            }
            Err(e) => {
                tracing::warn!("Dispatch of task {} to {} failed: {}", task_id, target, e);
                SubmitOutcome::Undispatched
            }
        }
    }
}
