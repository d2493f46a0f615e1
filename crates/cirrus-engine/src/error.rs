use std::time::Duration;

use thiserror::Error;

use cirrus_api::{ApiError, RemoteStatus, DELETION_PROTECTION_MESSAGE};

/// Why the safety guard refused a change set. No remote call has been made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("{msg} (cluster {cluster_id}, step {step})", msg = DELETION_PROTECTION_MESSAGE)]
    ProtectedResource { cluster_id: String, step: String },

    #[error("step {index} ({step}) would leave shard {shard_name} without hosts")]
    WouldEmptyShard {
        shard_name: String,
        index: usize,
        step: String,
    },

    #[error("shard {shard_name} does not exist in cluster {cluster_id}")]
    UnknownShard {
        cluster_id: String,
        shard_name: String,
    },

    #[error("change set would leave cluster {cluster_id} without hosts")]
    WouldEmptyCluster { cluster_id: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("validation rejected: {0}")]
    ValidationRejected(#[from] GuardRejection),

    #[error("remote rejected {step}: {status}")]
    RemoteRejected { step: String, status: RemoteStatus },

    #[error("polling operation {operation_id} failed after {attempts} attempts: {error}")]
    PollFailed {
        operation_id: String,
        attempts: u32,
        error: ApiError,
    },

    #[error(
        "deadline elapsed after {waited:?} waiting on {}",
        .operation_id.as_deref().unwrap_or("the next step")
    )]
    Timeout {
        operation_id: Option<String>,
        waited: Duration,
    },

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("convergence cancelled")]
    Cancelled,

    #[error("control plane request failed: {0}")]
    Api(ApiError),
}

impl From<ApiError> for EngineError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthenticated(msg) => EngineError::AuthFailure(msg),
            other => EngineError::Api(other),
        }
    }
}
