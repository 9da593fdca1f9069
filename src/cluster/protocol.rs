//! Member Call Protocol
//!
//! The small remote procedures one member runs on another. Sent as JSON over
//! HTTP by the networked invoker and passed by value by the in-process one.

use crate::executor::types::Task;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_MEMBER_CALL: &str = "/internal/call";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Drain the queue, then stop.
    Graceful,
    /// Stop now and hand back undone work.
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum MemberCall {
    /// Put the task into the member's local queue via its accept path.
    Enqueue { task: Task },
    QueueSize,
    /// Oldest `created_at` among queued and running tasks.
    OldestWorkTime,
    /// Remove up to `count` queued tasks, proportionally across groups.
    Steal { count: u64 },
    Shutdown { mode: ShutdownMode },
}

impl MemberCall {
    pub fn name(&self) -> &'static str {
        match self {
            MemberCall::Enqueue { .. } => "enqueue",
            MemberCall::QueueSize => "queue_size",
            MemberCall::OldestWorkTime => "oldest_work_time",
            MemberCall::Steal { .. } => "steal",
            MemberCall::Shutdown { .. } => "shutdown",
        }
    }

    /// Whether repeating the call after an ambiguous failure is harmless.
    /// A repeated steal could strand tasks, so it is never retried.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            MemberCall::Enqueue { .. } | MemberCall::QueueSize | MemberCall::OldestWorkTime
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum MemberReply {
    Accepted { accepted: bool },
    QueueSize { size: u64 },
    OldestWorkTime { oldest: Option<u64> },
    /// Stolen tasks, or the undone tasks of an immediate shutdown.
    Tasks { tasks: Vec<Task> },
    ShutdownStarted,
}

impl MemberReply {
    pub fn kind(&self) -> &'static str {
        match self {
            MemberReply::Accepted { .. } => "accepted",
            MemberReply::QueueSize { .. } => "queue_size",
            MemberReply::OldestWorkTime { .. } => "oldest_work_time",
            MemberReply::Tasks { .. } => "tasks",
            MemberReply::ShutdownStarted => "shutdown_started",
        }
    }
}
