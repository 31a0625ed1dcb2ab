//! Per-task channel state.
//!
//! A [`TaskChannel`] ties a correlation key to the code that produces its
//! requests ([`RequestSource`]) and the code that consumes its status frames
//! ([`MessageHandler`]). Channels are owned by the [`Registry`](crate::Registry).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskwire_core::{TaskError, TaskRequest, TaskStatusMessage};
use tokio::task::AbortHandle;

/// Callback notified of transport and consistency errors affecting a channel.
pub type ErrorCallback = Arc<dyn Fn(&TaskError) + Send + Sync>;

/// Produces the request a channel sends.
#[async_trait]
pub trait RequestSource: Send + Sync {
    /// Build the next request. Its correlation key must match the channel key.
    async fn build(&self) -> Result<TaskRequest, TaskError>;
}

#[async_trait]
impl<F, Fut> RequestSource for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskRequest, TaskError>> + Send + 'static,
{
    async fn build(&self) -> Result<TaskRequest, TaskError> {
        (self)().await
    }
}

/// A request source that always sends the same request.
#[derive(Debug, Clone)]
pub struct FixedRequest(pub TaskRequest);

#[async_trait]
impl RequestSource for FixedRequest {
    async fn build(&self) -> Result<TaskRequest, TaskError> {
        Ok(self.0.clone())
    }
}

/// Consumes status frames routed to a channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one frame. Returning a [`Continuation`] keeps the channel alive
    /// and schedules another send.
    async fn on_message(&self, message: TaskStatusMessage) -> Option<Continuation>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(TaskStatusMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Continuation>> + Send + 'static,
{
    async fn on_message(&self, message: TaskStatusMessage) -> Option<Continuation> {
        (self)(message).await
    }
}

/// Instruction from a handler to send another request after a delay.
#[derive(Clone, Default)]
pub struct Continuation {
    /// Request to send. `None` re-sends through the channel's own source.
    pub next_request: Option<Arc<dyn RequestSource>>,
    /// Delay before sending. `None` uses the configured base interval.
    pub delay: Option<Duration>,
}

impl Continuation {
    /// Re-send the channel's own request after the base interval.
    #[must_use]
    pub fn resend() -> Self {
        Self::default()
    }

    /// Re-send the channel's own request after `delay`.
    #[must_use]
    pub fn after(delay: Duration) -> Self {
        Self {
            next_request: None,
            delay: Some(delay),
        }
    }

    /// Send a different request.
    #[must_use]
    pub fn with_request(source: impl RequestSource + 'static) -> Self {
        Self {
            next_request: Some(Arc::new(source)),
            delay: None,
        }
    }

    /// Override the delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("next_request", &self.next_request.is_some())
            .field("delay", &self.delay)
            .finish()
    }
}

/// Which timer slot of a channel a scheduled send occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Fixed re-poll cadence from `update_interval`.
    Update,
    /// Server-driven follow-up from a [`Continuation`].
    Continuation,
}

/// Pending timers of one channel. Both kinds may be armed at once.
#[derive(Debug, Default)]
pub(crate) struct TimerSlots {
    update: Option<(u64, AbortHandle)>,
    continuation: Option<(u64, AbortHandle)>,
}

impl TimerSlots {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<(u64, AbortHandle)> {
        match kind {
            TimerKind::Update => &mut self.update,
            TimerKind::Continuation => &mut self.continuation,
        }
    }

    /// Arm a slot, aborting whatever timer it held.
    pub(crate) fn replace(&mut self, kind: TimerKind, id: u64, handle: AbortHandle) {
        if let Some((_, previous)) = self.slot(kind).replace((id, handle)) {
            previous.abort();
        }
    }

    /// Release a slot on behalf of the timer that is firing, without aborting it.
    pub(crate) fn release(&mut self, kind: TimerKind, id: u64) -> bool {
        let slot = self.slot(kind);
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.update.is_some() || self.continuation.is_some()
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, handle) in [self.update.take(), self.continuation.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Per-task stream state.
pub struct TaskChannel {
    key: String,
    source: Arc<dyn RequestSource>,
    handler: Arc<dyn MessageHandler>,
    on_error: Option<ErrorCallback>,
    update_interval: Option<Duration>,
    retry_interval: Option<Duration>,
    is_internal: bool,
    terminated: Arc<AtomicBool>,
    pub(crate) generation: u64,
    pub(crate) timers: TimerSlots,
}

impl TaskChannel {
    /// Create an external channel.
    pub fn new(
        key: impl Into<String>,
        source: impl RequestSource + 'static,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        Self::from_parts(key, Arc::new(source), Arc::new(handler))
    }

    /// Create an external channel from shared source and handler.
    pub fn from_parts(
        key: impl Into<String>,
        source: Arc<dyn RequestSource>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            key: key.into(),
            source,
            handler,
            on_error: None,
            update_interval: None,
            retry_interval: None,
            is_internal: false,
            terminated: Arc::new(AtomicBool::new(false)),
            generation: 0,
            timers: TimerSlots::default(),
        }
    }

    /// Mark the channel internal so it survives reconnects.
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

    /// Record the retry interval used after application exceptions.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Install an error callback.
    #[must_use]
    pub fn with_on_error(mut self, callback: impl Fn(&TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn with_error_callback(mut self, callback: Option<ErrorCallback>) -> Self {
        self.on_error = callback;
        self
    }

    /// Correlation key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the channel survives reconnects.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    /// Fixed re-send cadence, if any.
    #[must_use]
    pub fn update_interval(&self) -> Option<Duration> {
        self.update_interval
    }

    /// Retry interval after application exceptions, if any.
    #[must_use]
    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval
    }

    /// Whether the channel has been removed or finished.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn error_callback(&self) -> Option<ErrorCallback> {
        self.on_error.clone()
    }

    /// Stop the channel: no send happens after this returns.
    pub(crate) fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.timers.cancel_all();
    }

    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            key: self.key.clone(),
            generation: self.generation,
            source: Arc::clone(&self.source),
            handler: Arc::clone(&self.handler),
            on_error: self.on_error.clone(),
            update_interval: self.update_interval,
            terminated: Arc::clone(&self.terminated),
        }
    }

    pub(crate) fn info(&self) -> ChannelInfo {
        ChannelInfo {
            key: self.key.clone(),
            is_internal: self.is_internal,
            update_interval: self.update_interval,
            retry_interval: self.retry_interval,
            timer_pending: self.timers.is_armed(),
        }
    }
}

impl std::fmt::Debug for TaskChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskChannel")
            .field("key", &self.key)
            .field("is_internal", &self.is_internal)
            .field("update_interval", &self.update_interval)
            .field("retry_interval", &self.retry_interval)
            .field("terminated", &self.is_terminated())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Lock-free copy of the parts of a channel needed while awaiting.
#[derive(Clone)]
pub(crate) struct ChannelSnapshot {
    pub(crate) key: String,
    pub(crate) generation: u64,
    pub(crate) source: Arc<dyn RequestSource>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) update_interval: Option<Duration>,
    terminated: Arc<AtomicBool>,
}

impl ChannelSnapshot {
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn notify_error(&self, err: &TaskError) {
        if let Some(callback) = &self.on_error {
            callback(err);
        }
    }
}

/// Read-only view of a registered channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Correlation key.
    pub key: String,
    /// Whether the channel survives reconnects.
    pub is_internal: bool,
    /// Fixed re-send cadence.
    pub update_interval: Option<Duration>,
    /// Retry interval after application exceptions.
    pub retry_interval: Option<Duration>,
    /// Whether a scheduled send is pending.
    pub timer_pending: bool,
}
