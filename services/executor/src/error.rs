use fleet_proto::{InstantiationError, RemoteError};
use thiserror::Error;

use crate::state::StateStoreError;

/// Service runtime failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Startup code failed. `retryable` says whether another attempt may work.
    #[error("start failed: {reason}")]
    StartFailed { reason: String, retryable: bool },

    #[error("instance is not running")]
    NotRunning,

    #[error("runtime failure: {0}")]
    Other(String),
}

impl From<RuntimeError> for InstantiationError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::StartFailed { reason, retryable } => Self { reason, retryable },
            other => InstantiationError::retryable(other.to_string()),
        }
    }
}

/// Container lifecycle errors that do not cross the remote boundary.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container {0} was already activated")]
    AlreadyActivated(String),

    #[error("state store: {0}")]
    Store(#[from] StateStoreError),
}

/// Lease protocol failures on the executor side.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// The controller refused the registration.
    #[error("registration refused: {0}")]
    PermissionDenied(String),

    /// Every attempt failed with a retryable error.
    #[error("registration failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: RemoteError },

    #[error("membership client is shutting down")]
    ShuttingDown,
}
