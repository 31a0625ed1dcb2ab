//! # Wire Protocol
//!
//! JSON frames exchanged with the task server.
//!
//! ## Duplex endpoint (`/ws`)
//!
//! ### Client -> Server
//!
//! - `{"correlationKey": "...", "identifier": "...", "payload": {...}, "isInternal": false}`
//!
//! ### Server -> Client
//!
//! - `{"correlationKey": "...", "status": "working", "total": 1, "pending": 0, "message": "", "data": {"progress": 0.5}}`
//!
//! ## HTTP fallback
//!
//! - `POST /push {"task": "...", "params": {...}}` -> `{"uid": "..."}`
//! - `GET /status/{uid}` -> status frame without a correlation key

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;

/// Generate a fresh correlation key.
#[must_use]
pub fn new_correlation_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A task submission sent on the duplex connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Token tying this request to its status frames.
    pub correlation_key: String,
    /// Server-side task name.
    pub identifier: String,
    /// Opaque task parameters.
    #[serde(default)]
    pub payload: Value,
    /// Whether the request belongs to a housekeeping channel.
    #[serde(default)]
    pub is_internal: bool,
}

impl TaskRequest {
    /// Create an external task request.
    #[must_use]
    pub fn new(
        correlation_key: impl Into<String>,
        identifier: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            correlation_key: correlation_key.into(),
            identifier: identifier.into(),
            payload,
            is_internal: false,
        }
    }

    /// Mark the request as internal.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    /// Serialize into a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Protocol`] if the payload cannot be serialized.
    pub fn to_frame(&self) -> Result<String, TaskError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Queued behind other tasks.
    Pending,
    /// Executing.
    Working,
    /// Completed successfully.
    Finished,
    /// Failed on the server.
    Exception,
}

impl Status {
    /// `finished` and `exception` end a task.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Exception)
    }

    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Finished => "finished",
            Self::Exception => "exception",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress and result payloads attached to a status frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    /// Completion fraction in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Partial result, e.g. a preview.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate: Option<Value>,
    /// Final result, present once the task finished.
    #[serde(
        rename = "final",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub final_result: Option<Value>,
}

/// A status update for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusMessage {
    /// Key of the task this frame belongs to. Empty on HTTP status responses.
    #[serde(default)]
    pub correlation_key: String,
    /// Current status.
    pub status: Status,
    /// Total number of tasks known to the server.
    #[serde(default)]
    pub total: u64,
    /// Number of tasks queued ahead of this one.
    #[serde(default)]
    pub pending: u64,
    /// Human-readable detail; the failure reason for `exception`.
    #[serde(default)]
    pub message: String,
    /// Progress and result payloads.
    #[serde(default)]
    pub data: StatusData,
}

impl TaskStatusMessage {
    /// Create a status frame with empty counters and data.
    #[must_use]
    pub fn new(correlation_key: impl Into<String>, status: Status) -> Self {
        Self {
            correlation_key: correlation_key.into(),
            status,
            total: 0,
            pending: 0,
            message: String::new(),
            data: StatusData::default(),
        }
    }

    /// Set the queue counters.
    #[must_use]
    pub fn with_queue(mut self, total: u64, pending: u64) -> Self {
        self.total = total;
        self.pending = pending;
        self
    }

    /// Set the message text.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set the progress fraction.
    #[must_use]
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.data.progress = Some(progress);
        self
    }

    /// Set the final result.
    #[must_use]
    pub fn with_final(mut self, result: Value) -> Self {
        self.data.final_result = Some(result);
        self
    }

    /// Parse an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Protocol`] for malformed JSON, an unknown status,
    /// or a progress value outside `[0, 1]`.
    pub fn from_frame(text: &str) -> Result<Self, TaskError> {
        let message: Self = serde_json::from_str(text)?;
        if let Some(progress) = message.data.progress {
            if !(0.0..=1.0).contains(&progress) {
                return Err(TaskError::Protocol(format!(
                    "progress {progress} outside [0, 1]"
                )));
            }
        }
        Ok(message)
    }

    /// Serialize into a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Protocol`] if a payload cannot be serialized.
    pub fn to_frame(&self) -> Result<String, TaskError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Body of `POST /push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Server-side task name.
    pub task: String,
    /// Opaque task parameters.
    #[serde(default)]
    pub params: Value,
}

/// Response of `POST /push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Identifier to poll with `GET /status/{uid}`.
    pub uid: String,
}
