use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

use super::protocol::{
    ClusterShutdownRequest, ClusterShutdownResponse, StatsResponse, SubmitTaskRequest,
    SubmitTaskResponse,
};
use super::service::DistributedExecutor;
use crate::cluster::ShutdownMode;
use crate::error::FabricError;
use crate::executor::types::{Task, TaskBody, TaskId};

pub async fn handle_submit_task(
    Extension(executor): Extension<Arc<DistributedExecutor>>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, (StatusCode, String)> {
    let task_id = req.id.unwrap_or_default();
    let task = Task::new(
        task_id.clone(),
        req.group,
        TaskBody::new(req.handler, req.payload),
    );

    tracing::debug!("Received submission of task {} via HTTP", task_id);

    match executor.submit_task(task).await {
        Ok(outcome) => Ok(Json(SubmitTaskResponse { task_id, outcome })),
        Err(FabricError::PoolShutDown) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            FabricError::PoolShutDown.to_string(),
        )),
        Err(e) => {
            tracing::error!("Submission of task {} failed: {}", task_id, e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn handle_stats(
    Extension(executor): Extension<Arc<DistributedExecutor>>,
) -> Json<StatsResponse> {
    Json(executor.stats())
}

pub async fn handle_cluster_shutdown(
    Extension(executor): Extension<Arc<DistributedExecutor>>,
    Json(req): Json<ClusterShutdownRequest>,
) -> Json<ClusterShutdownResponse> {
    let undone: Vec<TaskId> = match req.mode {
        ShutdownMode::Graceful => {
            executor.shutdown_cluster().await;
            Vec::new()
        }
        ShutdownMode::Immediate => executor
            .shutdown_cluster_now()
            .await
            .into_iter()
            .map(|task| task.id)
            .collect(),
    };
    Json(ClusterShutdownResponse { undone })
}
