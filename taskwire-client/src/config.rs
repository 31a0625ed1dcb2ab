//! Client configuration.
//!
//! Environment variables read by [`ClientConfig::from_env`]:
//! - `TASKWIRE_WS_URL`: duplex endpoint (default: `ws://127.0.0.1:9474/ws`)
//! - `TASKWIRE_HTTP_URL`: HTTP fallback base (default: `http://127.0.0.1:9474`)
//! - `TASKWIRE_RECONNECT_MS`: reconnect interval (default: 1000)
//! - `TASKWIRE_RECONNECT_MAX_MS`: when set, reconnect with exponential backoff capped here
//! - `TASKWIRE_CONTINUATION_MS`: default continuation delay (default: 1000)

use std::time::Duration;

/// Default duplex endpoint.
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:9474/ws";
/// Default HTTP fallback base URL.
pub const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:9474";
/// Default reconnect interval in milliseconds.
pub const DEFAULT_RECONNECT_MS: u64 = 1000;
/// Default continuation delay in milliseconds.
pub const DEFAULT_CONTINUATION_MS: u64 = 1000;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_RECONNECT_MS,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt (0-indexed).
    ///
    /// `delay = initial * multiplier^attempt`, capped at `max_delay_ms`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base_delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// How long to wait before reconnecting the duplex connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt. Retries forever.
    Constant(Duration),
    /// Growing delay with a cap. Retries forever.
    Exponential(BackoffConfig),
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Constant(Duration::from_millis(DEFAULT_RECONNECT_MS))
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(delay) => *delay,
            Self::Exponential(backoff) => backoff.delay_for_attempt(attempt),
        }
    }
}

/// Configuration for the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Duplex endpoint URL.
    pub ws_url: String,
    /// HTTP fallback base URL.
    pub http_url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Delay applied to continuations that do not specify one.
    pub continuation_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            http_url: DEFAULT_HTTP_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            continuation_interval: Duration::from_millis(DEFAULT_CONTINUATION_MS),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given duplex endpoint.
    #[must_use]
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ..Self::default()
        }
    }

    /// Create a configuration from environment variables or defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let ws_url = std::env::var("TASKWIRE_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.into());
        let http_url =
            std::env::var("TASKWIRE_HTTP_URL").unwrap_or_else(|_| DEFAULT_HTTP_URL.into());
        let reconnect_ms = env_millis("TASKWIRE_RECONNECT_MS").unwrap_or(DEFAULT_RECONNECT_MS);
        let reconnect = match env_millis("TASKWIRE_RECONNECT_MAX_MS") {
            Some(max_delay_ms) => ReconnectPolicy::Exponential(BackoffConfig {
                initial_delay_ms: reconnect_ms,
                max_delay_ms,
                ..BackoffConfig::default()
            }),
            None => ReconnectPolicy::Constant(Duration::from_millis(reconnect_ms)),
        };
        let continuation_ms =
            env_millis("TASKWIRE_CONTINUATION_MS").unwrap_or(DEFAULT_CONTINUATION_MS);

        Self {
            ws_url,
            http_url,
            reconnect,
            continuation_interval: Duration::from_millis(continuation_ms),
        }
    }

    /// Override the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Override the default continuation delay.
    #[must_use]
    pub fn with_continuation_interval(mut self, interval: Duration) -> Self {
        self.continuation_interval = interval;
        self
    }

    /// Override the HTTP fallback base URL.
    #[must_use]
    pub fn with_http_url(mut self, http_url: impl Into<String>) -> Self {
        self.http_url = http_url.into();
        self
    }
}

fn env_millis(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
