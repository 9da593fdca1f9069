//! Storage Network Protocol
//!
//! Defines the API endpoints and Data Transfer Objects (DTOs) used for
//! member-to-member map mutations, replication and lock leases.
//!
//! Map endpoints are relative to the map's base path (e.g. `/ledger`), so
//! several maps can share one HTTP server.

use crate::membership::types::MemberId;
use serde::{Deserialize, Serialize};

// --- Map Endpoints ---

/// Mutation forwarded from any member to the partition's primary.
pub const ENDPOINT_APPLY: &str = "/internal/apply";
/// Primary pushing the outcome of a mutation to the backup.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// Direct key retrieval on the member that holds the partition.
pub const ENDPOINT_GET_INTERNAL: &str = "/internal/get";
/// Public read with owner routing.
pub const ENDPOINT_GET: &str = "/get";

// --- Lock Endpoints ---

pub const ENDPOINT_LOCK_ACQUIRE: &str = "/internal/lock/acquire";
pub const ENDPOINT_LOCK_RELEASE: &str = "/internal/lock/release";

// --- Data Transfer Objects ---

/// A map mutation. Values travel as serialized JSON strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MapOp {
    Put { value_json: String },
    PutIfAbsent { value_json: String },
    Remove,
}

/// Sent to the primary of `partition`.
///
/// `op_id` lets the primary drop a retried request it already applied.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub partition: u32,
    pub op_id: String,
    pub key: String,
    pub op: MapOp,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub success: bool,
    /// Value held before a `Put`/`Remove`, or the value that blocked a
    /// `PutIfAbsent`.
    pub previous_json: Option<String>,
}

/// Resulting state of one key after a mutation on the primary.
/// `value_json: None` means the key was removed.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub partition: u32,
    pub op_id: String,
    pub key: String,
    pub value_json: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    /// `None` indicates the key does not exist.
    pub value_json: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub name: String,
    pub holder: MemberId,
    /// Only read on acquire.
    #[serde(default)]
    pub lease_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockResponse {
    /// Acquire: the caller now holds the lease. Release: a lease was dropped.
    pub granted: bool,
}
