//! Caller-facing submission API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskwire_core::{new_correlation_key, Status, TaskError, TaskStatusMessage};

use crate::channel::{Continuation, ErrorCallback, MessageHandler, RequestSource, TaskChannel};
use crate::connection::ConnectionManager;
use crate::poller::{PollError, Poller, StatusSource};
use crate::registry::Registry;

/// Options for [`submit_channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    key: String,
    is_internal: bool,
    update_interval: Option<Duration>,
    retry_interval: Option<Duration>,
    on_error: Option<ErrorCallback>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::new(new_correlation_key())
    }
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("key", &self.key)
            .field("is_internal", &self.is_internal)
            .field("update_interval", &self.update_interval)
            .field("retry_interval", &self.retry_interval)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl ChannelOptions {
    /// Options for a channel with the given correlation key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_internal: false,
            update_interval: None,
            retry_interval: None,
            on_error: None,
        }
    }

    /// Correlation key the request source must use.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Keep the channel across reconnects.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    /// Re-send the request on a fixed cadence.
    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Retry after `exception` frames the handler does not continue itself.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Notify `callback` of transport and consistency errors.
    #[must_use]
    pub fn with_on_error(mut self, callback: impl Fn(&TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// Turns an `exception` frame without caller continuation into a resend.
struct RetryOnException {
    inner: Arc<dyn MessageHandler>,
    retry: Duration,
}

#[async_trait]
impl MessageHandler for RetryOnException {
    async fn on_message(&self, message: TaskStatusMessage) -> Option<Continuation> {
        let status = message.status;
        let continuation = self.inner.on_message(message).await;
        if continuation.is_none() && status == Status::Exception {
            return Some(Continuation::after(self.retry));
        }
        continuation
    }
}

/// Handle to a submitted channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    key: String,
    generation: u64,
    registry: Registry,
}

impl ChannelHandle {
    /// Correlation key of the channel.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the channel is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.registry.is_registered(&self.key, self.generation)
    }

    /// Stop the channel and cancel its pending sends. Returns `false` if it
    /// had already finished or been cancelled.
    pub fn cancel(&self) -> bool {
        let removed = self.registry.remove_if_generation(&self.key, self.generation);
        if removed {
            tracing::debug!(key = %self.key, "Channel cancelled");
        }
        removed
    }
}

/// Submit a task over the duplex connection.
///
/// Waits for the link, registers the channel and sends the first request.
///
/// # Errors
///
/// - [`TaskError::DuplicateKey`] if a channel with `options.key()` exists
/// - [`TaskError::Shutdown`] if the manager shut down
/// - any error of the first send, after which the channel is removed again
pub async fn submit_channel(
    manager: &ConnectionManager,
    source: impl RequestSource + 'static,
    handler: impl MessageHandler + 'static,
    options: ChannelOptions,
) -> Result<ChannelHandle, TaskError> {
    manager.wait_until_open().await?;

    let ChannelOptions {
        key,
        is_internal,
        update_interval,
        retry_interval,
        on_error,
    } = options;

    let handler: Arc<dyn MessageHandler> = match retry_interval {
        Some(retry) => Arc::new(RetryOnException {
            inner: Arc::new(handler),
            retry,
        }),
        None => Arc::new(handler),
    };

    let mut channel =
        TaskChannel::from_parts(key.clone(), Arc::new(source), handler).with_error_callback(on_error);
    if is_internal {
        channel = channel.internal();
    }
    if let Some(interval) = update_interval {
        channel = channel.with_update_interval(interval);
    }
    if let Some(interval) = retry_interval {
        channel = channel.with_retry_interval(interval);
    }

    let registry = manager.registry().clone();
    let Some(generation) = registry.register_with_generation(channel) else {
        return Err(TaskError::DuplicateKey(key));
    };
    tracing::debug!(key = %key, internal = is_internal, "Channel submitted");

    if let Err(err) = manager.run(&key).await {
        registry.remove_if_generation(&key, generation);
        return Err(err);
    }

    Ok(ChannelHandle {
        key,
        generation,
        registry,
    })
}

/// Poll `task_id` on `source` until it finishes.
///
/// # Errors
///
/// See [`Poller::run`].
pub async fn submit_poll<S>(
    source: Arc<S>,
    task_id: impl Into<String>,
) -> Result<TaskStatusMessage, PollError>
where
    S: StatusSource + ?Sized,
{
    Poller::new(source, task_id).run().await
}
