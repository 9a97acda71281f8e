//! Failure taxonomy of the remote interfaces.

use std::time::Duration;

use fleet_id::LeaseId;
use thiserror::Error;

/// Communication failure on any remote call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The peer could not be reached.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The call did not complete within its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The peer refused the call; retrying will not help.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The lease is not (or no longer) known to the controller.
    #[error("unknown lease {0}")]
    UnknownLease(LeaseId),

    /// Any other failure; treated as indefinite and worth retrying.
    #[error("remote failure: {0}")]
    Uncategorized(String),
}

impl RemoteError {
    /// Whether reconnect/retry attempts are warranted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable(_) | RemoteError::Timeout(_) | RemoteError::Uncategorized(_)
        )
    }

    /// Whether the peer refused the caller outright.
    pub fn is_permission(&self) -> bool {
        matches!(self, RemoteError::PermissionDenied(_))
    }
}

/// The instance could not be started.
///
/// Declining for capacity reasons is not an instantiation error; the remote
/// call returns `Ok(None)` instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("instantiation failed: {reason}")]
pub struct InstantiationError {
    pub reason: String,
    /// Whether another attempt (possibly elsewhere) may succeed.
    pub retryable: bool,
}

impl InstantiationError {
    /// A failure another attempt may overcome (environment, transport).
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// A failure that will recur wherever the specification is placed.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

impl From<RemoteError> for InstantiationError {
    fn from(err: RemoteError) -> Self {
        Self {
            retryable: !err.is_permission(),
            reason: err.to_string(),
        }
    }
}
