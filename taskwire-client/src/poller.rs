//! Status polling for the HTTP fallback.
//!
//! A [`Poller`] checks one task until it finishes, fails or the status source
//! keeps failing. The interval between checks adapts to the queue:
//!
//! ```text
//! interval = base * (1 + r) * factor
//!     r      = uniform jitter in [0, 1)
//!     factor = max(1, pending)   while pending
//!              1                 otherwise
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use taskwire_core::{Status, TaskStatusMessage};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::metrics::record_poll_check;

/// Default number of transport failures tolerated.
pub const DEFAULT_FAILURE_PATIENCE: u32 = 3;

/// Default base interval between checks.
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(1000);

/// Where a poller reads task status from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Transport error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current status of `task_id`.
    async fn status(&self, task_id: &str) -> Result<TaskStatusMessage, Self::Error>;
}

/// Why polling stopped without a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// The status source failed too many times.
    #[error("status source failed {attempts} times, last error: {last_error}")]
    Exhausted {
        /// Failures observed.
        attempts: u32,
        /// Message of the final failure.
        last_error: String,
    },
    /// The server reported the task as failed.
    #[error("task failed: {reason}")]
    TaskFailed {
        /// Server-provided reason.
        reason: String,
    },
}

/// Poller tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Transport failures before giving up. Progress does not restore it.
    pub failure_patience: u32,
    /// Base interval between checks.
    pub base_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            failure_patience: DEFAULT_FAILURE_PATIENCE,
            base_interval: DEFAULT_BASE_INTERVAL,
        }
    }
}

/// Interval until the next check for a task in `status` with `pending`
/// tasks queued ahead of it. `jitter` is expected in `[0, 1)`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn adaptive_interval(base: Duration, status: Status, pending: u64, jitter: f64) -> Duration {
    let factor = match status {
        Status::Pending => pending.max(1) as f64,
        _ => 1.0,
    };
    base.mul_f64((1.0 + jitter) * factor)
}

/// Retargets a running [`Poller`].
#[derive(Debug, Clone)]
pub struct PollerHandle {
    reset_tx: mpsc::UnboundedSender<String>,
}

impl PollerHandle {
    /// Poll `task_id` instead, starting immediately with a fresh failure
    /// count. Returns `false` if the poller already stopped.
    pub fn reset(&self, task_id: impl Into<String>) -> bool {
        self.reset_tx.send(task_id.into()).is_ok()
    }
}

/// Polls one task's status until a terminal state.
pub struct Poller<S: StatusSource + ?Sized> {
    source: Arc<S>,
    task_id: String,
    failure_count: u32,
    config: PollerConfig,
    rng: StdRng,
    reset_tx: mpsc::UnboundedSender<String>,
    reset_rx: mpsc::UnboundedReceiver<String>,
}

impl<S: StatusSource + ?Sized> std::fmt::Debug for Poller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("task_id", &self.task_id)
            .field("failure_count", &self.failure_count)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Step {
    Reset(String),
    Checked(Result<TaskStatusMessage, String>),
}

impl<S: StatusSource + ?Sized> Poller<S> {
    /// Create a poller with default tuning.
    pub fn new(source: Arc<S>, task_id: impl Into<String>) -> Self {
        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        Self {
            source,
            task_id: task_id.into(),
            failure_count: 0,
            config: PollerConfig::default(),
            rng: StdRng::from_entropy(),
            reset_tx,
            reset_rx,
        }
    }

    /// Override the tuning.
    #[must_use]
    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed the jitter source for reproducible intervals.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Handle for retargeting this poller while it runs.
    #[must_use]
    pub fn handle(&self) -> PollerHandle {
        PollerHandle {
            reset_tx: self.reset_tx.clone(),
        }
    }

    /// Task currently polled.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Transport failures so far.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Draw the interval before the next check.
    pub fn next_interval(&mut self, status: Status, pending: u64) -> Duration {
        let jitter: f64 = self.rng.gen();
        adaptive_interval(self.config.base_interval, status, pending, jitter)
    }

    fn apply_reset(&mut self, task_id: String) {
        tracing::debug!(from = %self.task_id, to = %task_id, "Poller reset");
        self.task_id = task_id;
        self.failure_count = 0;
    }

    /// Poll until the task finishes.
    ///
    /// The first check happens immediately.
    ///
    /// # Errors
    ///
    /// - [`PollError::TaskFailed`] when the server reports `exception`
    /// - [`PollError::Exhausted`] after `failure_patience` transport failures
    pub async fn run(mut self) -> Result<TaskStatusMessage, PollError> {
        let mut delay = Duration::ZERO;

        loop {
            let step = tokio::select! {
                biased;
                Some(task_id) = self.reset_rx.recv() => Step::Reset(task_id),
                result = Self::check_after(&self.source, &self.task_id, delay) => Step::Checked(result),
            };

            let result = match step {
                Step::Reset(task_id) => {
                    self.apply_reset(task_id);
                    delay = Duration::ZERO;
                    continue;
                }
                Step::Checked(result) => result,
            };

            match result {
                Err(error) => {
                    self.failure_count += 1;
                    record_poll_check("error");
                    if self.failure_count >= self.config.failure_patience {
                        tracing::warn!(
                            task_id = %self.task_id,
                            attempts = self.failure_count,
                            error = %error,
                            "Status source exhausted"
                        );
                        return Err(PollError::Exhausted {
                            attempts: self.failure_count,
                            last_error: error,
                        });
                    }
                    tracing::debug!(
                        task_id = %self.task_id,
                        attempt = self.failure_count,
                        error = %error,
                        "Status check failed, retrying"
                    );
                    delay = self.config.base_interval;
                }
                Ok(message) => {
                    record_poll_check(message.status.as_str());
                    match message.status {
                        Status::Finished => return Ok(message),
                        Status::Exception => {
                            return Err(PollError::TaskFailed {
                                reason: message.message,
                            })
                        }
                        Status::Pending | Status::Working => {
                            delay = self.next_interval(message.status, message.pending);
                            tracing::trace!(
                                task_id = %self.task_id,
                                status = %message.status,
                                delay_ms = delay.as_millis(),
                                "Task still running"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn check_after(
        source: &S,
        task_id: &str,
        delay: Duration,
    ) -> Result<TaskStatusMessage, String> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        source.status(task_id).await.map_err(|e| e.to_string())
    }
}
