use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use serde::{Serialize, de::DeserializeOwned};
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::lock::PartitionedLock;
use super::memory::ReplicatedMap;
use super::protocol::{
    ApplyRequest, ApplyResponse, GetResponse, LockRequest, LockResponse, ReplicateRequest,
    ReplicateResponse,
};
use crate::executor::types::now_ms;

fn to_json_response<V: Serialize>(value: Option<V>) -> (StatusCode, Json<GetResponse>) {
    match value {
        Some(value) => match serde_json::to_string(&value) {
            Ok(value_json) => (
                StatusCode::OK,
                Json(GetResponse {
                    value_json: Some(value_json),
                }),
            ),
            Err(e) => {
                tracing::error!("Failed to serialize value: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(GetResponse { value_json: None }),
                )
            }
        },
        None => (
            StatusCode::NOT_FOUND,
            Json(GetResponse { value_json: None }),
        ),
    }
}

pub async fn handle_apply<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Json(req): Json<ApplyRequest>,
) -> (StatusCode, Json<ApplyResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let partition = req.partition;

    match map.apply_request(req).await {
        Ok(previous) => {
            let previous_json = match previous.map(|value| serde_json::to_string(&value)).transpose() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize previous value: {}", e);
                    None
                }
            };
            (
                StatusCode::OK,
                Json(ApplyResponse {
                    success: true,
                    previous_json,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to apply mutation in partition {}: {}", partition, e);
            (
                StatusCode::BAD_REQUEST,
                Json(ApplyResponse {
                    success: false,
                    previous_json: None,
                }),
            )
        }
    }
}

pub async fn handle_replicate<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Json(req): Json<ReplicateRequest>,
) -> (StatusCode, Json<ReplicateResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let partition = req.partition;

    match map.store_replica(req) {
        Ok(()) => {
            tracing::debug!("Stored replica for partition {}", partition);
            (StatusCode::OK, Json(ReplicateResponse { success: true }))
        }
        Err(e) => {
            tracing::error!("Failed to store replica: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(ReplicateResponse { success: false }),
            )
        }
    }
}

pub async fn handle_get_internal<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<GetResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match key_str.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(GetResponse { value_json: None }),
            );
        }
    };

    to_json_response(map.get_local(&key))
}

pub async fn handle_get<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<GetResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match key_str.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(GetResponse { value_json: None }),
            );
        }
    };

    match map.get_routed(&key).await {
        Ok(value) => to_json_response(value),
        Err(e) => {
            tracing::error!("GET failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(GetResponse { value_json: None }),
            )
        }
    }
}

pub async fn handle_lock_acquire(
    Extension(lock): Extension<Arc<PartitionedLock>>,
    Json(req): Json<LockRequest>,
) -> (StatusCode, Json<LockResponse>) {
    let granted = lock.grant_local(
        &req.name,
        &req.holder,
        Duration::from_millis(req.lease_ms),
        now_ms(),
    );
    tracing::debug!("Lock {} requested by {}: granted={}", req.name, req.holder, granted);
    (StatusCode::OK, Json(LockResponse { granted }))
}

pub async fn handle_lock_release(
    Extension(lock): Extension<Arc<PartitionedLock>>,
    Json(req): Json<LockRequest>,
) -> (StatusCode, Json<LockResponse>) {
    let granted = lock.release_local(&req.name, &req.holder);
    (StatusCode::OK, Json(LockResponse { granted }))
}
