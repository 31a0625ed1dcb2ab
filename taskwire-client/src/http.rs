//! HTTP fallback transport.
//!
//! Submits tasks with `POST /push` and reads their status with
//! `GET /status/{uid}`. Paired with a [`Poller`](crate::Poller) this gives
//! the same status contract as the duplex connection without a socket.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use taskwire_core::{PushRequest, PushResponse, TaskError, TaskStatusMessage};
use thiserror::Error;
use url::Url;

use crate::poller::StatusSource;

/// Errors from the HTTP fallback transport.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The base URL is invalid or cannot carry a path.
    #[error("invalid task server URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed (connection, timeout, etc.).
    #[error("task server HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("task server returned {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// JSON parsing failed.
    #[error("failed to parse task server payload: {0}")]
    Json(#[from] serde_json::Error),
    /// The body parsed but violated the status contract.
    #[error("unexpected task server response: {0}")]
    UnexpectedResponse(String),
}

impl From<TaskError> for HttpError {
    fn from(err: TaskError) -> Self {
        Self::UnexpectedResponse(err.to_string())
    }
}

/// Client for the task server's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpTaskClient {
    inner: Arc<InnerClient>,
}

#[derive(Debug)]
struct InnerClient {
    http: Client,
    base: Url,
}

impl HttpTaskClient {
    /// Create a client for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidUrl`] if the URL is malformed or not
    /// hierarchical, and [`HttpError::Http`] if the HTTP client fails to build.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, HttpError> {
        let base =
            Url::parse(base_url.as_ref()).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(HttpError::InvalidUrl(format!("{base} cannot be a base")));
        }

        let http = Client::builder()
            .user_agent(concat!("taskwire-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            inner: Arc::new(InnerClient { http, base }),
        })
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.inner.base
    }

    /// Submit a task and return the identifier to poll with.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] on transport failure, a non-success status or a
    /// body without a `uid`.
    pub async fn push(&self, task: &str, params: Value) -> Result<String, HttpError> {
        let url = self.endpoint(&["push"])?;
        let body = PushRequest {
            task: task.to_string(),
            params,
        };
        let response = self.inner.http.post(url).json(&body).send().await?;
        let text = Self::success_body(response).await?;
        let pushed: PushResponse = serde_json::from_str(&text)?;
        if pushed.uid.is_empty() {
            return Err(HttpError::UnexpectedResponse("empty uid".into()));
        }
        tracing::debug!(task = %task, uid = %pushed.uid, "Task pushed");
        Ok(pushed.uid)
    }

    /// Fetch the current status of a pushed task.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] on transport failure, a non-success status or a
    /// body that is not a valid status frame.
    pub async fn status(&self, uid: &str) -> Result<TaskStatusMessage, HttpError> {
        let url = self.endpoint(&["status", uid])?;
        let response = self.inner.http.get(url).send().await?;
        let text = Self::success_body(response).await?;
        Ok(TaskStatusMessage::from_frame(&text)?)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, HttpError> {
        let mut url = self.inner.base.clone();
        url.path_segments_mut()
            .map_err(|()| HttpError::InvalidUrl(self.inner.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn success_body(response: reqwest::Response) -> Result<String, HttpError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(HttpError::Status {
                code: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl StatusSource for HttpTaskClient {
    type Error = HttpError;

    async fn status(&self, task_id: &str) -> Result<TaskStatusMessage, HttpError> {
        HttpTaskClient::status(self, task_id).await
    }
}
