//! Error types for event delivery.

use thiserror::Error;

/// Errors raised by event listeners.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The listener refused or failed to process the event.
    #[error("listener failed: {0}")]
    ListenerFailed(String),

    /// The listener's downstream sink is gone.
    #[error("listener closed")]
    Closed,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
