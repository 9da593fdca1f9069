use crate::membership::types::MemberId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Local worker pool is shut down")]
    PoolShutDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Call to member {member} failed: {reason}")]
    RemoteCall { member: MemberId, reason: String },

    #[error("Call to member {member} timed out after {after:?}")]
    Timeout { member: MemberId, after: Duration },

    #[error("Pending-work ledger error: {0}")]
    Ledger(#[source] anyhow::Error),

    #[error("Unexpected reply, expected {expected}")]
    UnexpectedReply { expected: &'static str },
}

pub type Result<T> = std::result::Result<T, FabricError>;
