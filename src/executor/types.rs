use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a task within the cluster.
///
/// Callers may supply their own identity (for idempotent submission) or let
/// [`TaskId::new`] generate a UUID. The identity is also the ledger key, so it
/// is hashed to pick the storage partition that owns the ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Caller-assigned partition key used for fair scheduling.
///
/// Unrelated to cluster membership: every group is served round-robin by the
/// local queue regardless of how many tasks it holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(pub String);

impl GroupKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The executable part of a task.
///
/// Tasks travel between members (ledger, dispatch, steal), so the body is data:
/// the name of a handler registered in the [`TaskHandlerRegistry`] plus the JSON
/// payload handed to it.
///
/// [`TaskHandlerRegistry`]: super::registry::TaskHandlerRegistry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskBody {
    /// The name of the registered handler to invoke (e.g., "index_document").
    pub handler: String,
    /// Arbitrary JSON payload passed to the handler function.
    pub payload: serde_json::Value,
}

impl TaskBody {
    pub fn new(handler: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            handler: handler.into(),
            payload,
        }
    }
}

/// The unit of work.
///
/// Once enqueued a task is owned by exactly one of: a group sub-queue or a
/// worker's current-task slot. The ledger keeps its own copy as a durability
/// record until the task completes locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub group: GroupKey,
    pub body: TaskBody,
    /// Timestamp (ms) of the latest (re)submission. Used to estimate queue age
    /// and to detect lost work, never as a global ordering key.
    pub created_at: u64,
    /// Incremented on every resubmission and steal. Starts at 1.
    pub submission_count: u32,
    /// Value returned by a computation, set by the executing worker.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Execution error, set by the executing worker.
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, group: GroupKey, body: TaskBody) -> Self {
        Self {
            id,
            group,
            body,
            created_at: now_ms(),
            submission_count: 1,
            result: None,
            error: None,
        }
    }

    /// Prepares the task for another dispatch after it was lost or recovered.
    pub fn mark_resubmitted(&mut self) {
        self.submission_count = self.submission_count.saturating_add(1);
        self.created_at = now_ms();
    }

    /// Records that the task physically moved to another member's queue.
    pub fn mark_stolen(&mut self) {
        self.submission_count = self.submission_count.saturating_add(1);
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
