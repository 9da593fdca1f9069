use super::dispatcher::SubmitOutcome;
use crate::cluster::{MemberId, ShutdownMode};
use crate::executor::pool::{RunState, WorkerSnapshot};
use crate::executor::types::{GroupKey, TaskId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ENDPOINT_SUBMIT: &str = "/task/submit";
pub const ENDPOINT_STATS: &str = "/task/stats";
pub const ENDPOINT_CLUSTER_SHUTDOWN: &str = "/cluster/shutdown";

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    /// Caller-chosen identity for idempotent submission. Generated if absent.
    #[serde(default)]
    pub id: Option<TaskId>,
    pub group: GroupKey,
    pub handler: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
    pub outcome: SubmitOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub member: MemberId,
    pub run_state: RunState,
    pub queue_size: usize,
    pub queue_size_by_group: BTreeMap<GroupKey, usize>,
    pub oldest_queued_time: Option<u64>,
    pub completed_tasks: u64,
    pub workers: Vec<WorkerSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterShutdownRequest {
    pub mode: ShutdownMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterShutdownResponse {
    /// Undone tasks handed back by an immediate shutdown.
    pub undone: Vec<TaskId>,
}
