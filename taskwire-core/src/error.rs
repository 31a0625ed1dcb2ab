//! Error types for task streaming.

use thiserror::Error;

/// Result type for task streaming operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors that can occur while submitting or streaming a task.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The duplex connection dropped while the task was in flight.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A frame could not be handed to the transport.
    #[error("Send failed: {0}")]
    Send(String),

    /// A channel with this correlation key is already registered.
    #[error("Duplicate correlation key: {0}")]
    DuplicateKey(String),

    /// A request builder produced a request for a different key than its channel.
    #[error("Correlation key mismatch: channel {expected}, request {actual}")]
    KeyMismatch {
        /// Key of the channel that owns the request builder.
        expected: String,
        /// Key carried by the produced request.
        actual: String,
    },

    /// An inbound frame violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request builder failed to produce a request.
    #[error("Request build failed: {0}")]
    Request(String),

    /// The connection manager has been shut down.
    #[error("Connection manager shut down")]
    Shutdown,
}

impl TaskError {
    /// Returns true for transport-level failures that a reconnect can cure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Send(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
