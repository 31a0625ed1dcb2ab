//! Inbound frame routing.

use taskwire_core::TaskStatusMessage;

use crate::channel::Continuation;
use crate::metrics::record_frame_routed;
use crate::registry::Registry;

/// Schedules the follow-up send requested by a [`Continuation`].
pub(crate) trait ContinuationScheduler: Send + Sync {
    /// Whether the duplex connection is currently open.
    fn is_open(&self) -> bool;

    /// Arm the continuation timer of the registration `(key, generation)`.
    /// Returns `false` when that registration is gone and nothing was armed.
    fn schedule(&self, key: &str, generation: u64, continuation: Continuation) -> bool;
}

/// What happened to a routed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No channel owns the frame's key.
    Dropped,
    /// Handler ran; the channel keeps waiting for frames.
    Delivered,
    /// Handler asked for another send, which was scheduled.
    Continued,
    /// Terminal frame without continuation; the channel was removed.
    Completed,
}

impl DispatchOutcome {
    /// Metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dropped => "dropped",
            Self::Delivered => "delivered",
            Self::Continued => "continued",
            Self::Completed => "completed",
        }
    }
}

/// Delivers status frames to the channel that owns their correlation key.
pub(crate) struct Router<'a> {
    registry: &'a Registry,
    scheduler: &'a dyn ContinuationScheduler,
}

impl<'a> Router<'a> {
    pub(crate) fn new(registry: &'a Registry, scheduler: &'a dyn ContinuationScheduler) -> Self {
        Self {
            registry,
            scheduler,
        }
    }

    /// Route one frame and apply the handler's decision.
    pub(crate) async fn dispatch(&self, message: TaskStatusMessage) -> DispatchOutcome {
        let outcome = self.route(message).await;
        record_frame_routed(outcome.as_str());
        outcome
    }

    async fn route(&self, message: TaskStatusMessage) -> DispatchOutcome {
        let key = message.correlation_key.clone();
        let Some(channel) = self.registry.snapshot(&key) else {
            tracing::debug!(key = %key, status = %message.status, "No channel for frame, dropping");
            return DispatchOutcome::Dropped;
        };

        let terminal = message.status.is_terminal();
        let continuation = channel.handler.on_message(message).await;

        match continuation {
            Some(continuation) if self.scheduler.is_open() => {
                if !self.registry.is_registered(&key, channel.generation) {
                    tracing::debug!(key = %key, "Channel removed during handler, continuation discarded");
                    return DispatchOutcome::Delivered;
                }
                if self.scheduler.schedule(&key, channel.generation, continuation) {
                    DispatchOutcome::Continued
                } else {
                    DispatchOutcome::Delivered
                }
            }
            Some(_) => {
                tracing::debug!(key = %key, "Connection not open, continuation discarded");
                DispatchOutcome::Delivered
            }
            None if terminal => {
                if self.registry.remove_if_generation(&key, channel.generation) {
                    tracing::debug!(key = %key, "Task channel completed");
                    DispatchOutcome::Completed
                } else {
                    DispatchOutcome::Delivered
                }
            }
            None => DispatchOutcome::Delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FixedRequest, TaskChannel};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use taskwire_core::{Status, TaskRequest};

    #[derive(Default)]
    struct RecordingScheduler {
        closed: AtomicBool,
        refuse: AtomicBool,
        scheduled: Mutex<Vec<(String, u64, Option<Duration>)>>,
    }

    impl ContinuationScheduler for RecordingScheduler {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn schedule(&self, key: &str, generation: u64, continuation: Continuation) -> bool {
            if self.refuse.load(Ordering::SeqCst) {
                return false;
            }
            self.scheduled
                .lock()
                .expect("lock")
                .push((key.to_string(), generation, continuation.delay));
            true
        }
    }

    type Seen = Arc<Mutex<Vec<(String, Status)>>>;

    fn recording_channel(key: &str, seen: &Seen, continue_on: Option<Status>) -> TaskChannel {
        let seen = Arc::clone(seen);
        let owner = key.to_string();
        TaskChannel::new(
            key,
            FixedRequest(TaskRequest::new(key, "echo", json!({}))),
            move |message: TaskStatusMessage| {
                seen.lock()
                    .expect("lock")
                    .push((owner.clone(), message.status));
                async move {
                    (Some(message.status) == continue_on)
                        .then(|| Continuation::after(Duration::from_millis(10)))
                }
            },
        )
    }

    #[tokio::test]
    async fn unknown_key_is_dropped_silently() {
        let registry = Registry::new();
        let scheduler = RecordingScheduler::default();
        let seen = Seen::default();
        registry.register(recording_channel("a", &seen, None));
        registry.register(recording_channel("b", &seen, None));

        let router = Router::new(&registry, &scheduler);
        let outcome = router
            .dispatch(TaskStatusMessage::new("c", Status::Finished))
            .await;

        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn frames_reach_only_their_own_channel_in_order() {
        let registry = Registry::new();
        let scheduler = RecordingScheduler::default();
        let seen = Seen::default();
        registry.register(recording_channel("a", &seen, None));
        registry.register(recording_channel("b", &seen, None));

        let router = Router::new(&registry, &scheduler);
        for (key, status) in [
            ("a", Status::Pending),
            ("b", Status::Working),
            ("a", Status::Working),
            ("b", Status::Pending),
        ] {
            router.dispatch(TaskStatusMessage::new(key, status)).await;
        }

        let seen = seen.lock().expect("lock").clone();
        let for_a: Vec<Status> = seen.iter().filter(|(k, _)| k == "a").map(|(_, s)| *s).collect();
        let for_b: Vec<Status> = seen.iter().filter(|(k, _)| k == "b").map(|(_, s)| *s).collect();
        assert_eq!(for_a, vec![Status::Pending, Status::Working]);
        assert_eq!(for_b, vec![Status::Working, Status::Pending]);
    }

    #[tokio::test]
    async fn terminal_without_continuation_removes_channel() {
        let registry = Registry::new();
        let scheduler = RecordingScheduler::default();
        let seen = Seen::default();
        registry.register(recording_channel("k1", &seen, None));

        let router = Router::new(&registry, &scheduler);
        let working = router
            .dispatch(TaskStatusMessage::new("k1", Status::Working).with_progress(0.5))
            .await;
        assert_eq!(working, DispatchOutcome::Delivered);
        assert!(registry.has("k1"));

        let finished = router
            .dispatch(TaskStatusMessage::new("k1", Status::Finished))
            .await;
        assert_eq!(finished, DispatchOutcome::Completed);
        assert!(!registry.has("k1"));
    }

    #[tokio::test]
    async fn continuation_is_scheduled_while_open() {
        let registry = Registry::new();
        let scheduler = RecordingScheduler::default();
        let seen = Seen::default();
        registry.register(recording_channel("k1", &seen, Some(Status::Exception)));

        let router = Router::new(&registry, &scheduler);
        let outcome = router
            .dispatch(TaskStatusMessage::new("k1", Status::Exception))
            .await;

        assert_eq!(outcome, DispatchOutcome::Continued);
        assert!(registry.has("k1"));
        let scheduled = scheduler.scheduled.lock().expect("lock").clone();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0, "k1");
        assert_eq!(scheduled[0].2, Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn continuation_is_discarded_while_closed() {
        let registry = Registry::new();
        let scheduler = RecordingScheduler::default();
        scheduler.closed.store(true, Ordering::SeqCst);
        let seen = Seen::default();
        registry.register(recording_channel("k1", &seen, Some(Status::Working)));

        let router = Router::new(&registry, &scheduler);
        let outcome = router
            .dispatch(TaskStatusMessage::new("k1", Status::Working))
            .await;

        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert!(scheduler.scheduled.lock().expect("lock").is_empty());
        assert!(registry.has("k1"));
    }

    #[tokio::test]
    async fn refused_continuation_is_reported_as_delivered() {
        let registry = Registry::new();
        let scheduler = RecordingScheduler::default();
        scheduler.refuse.store(true, Ordering::SeqCst);
        let seen = Seen::default();
        registry.register(recording_channel("k1", &seen, Some(Status::Working)));

        let router = Router::new(&registry, &scheduler);
        let outcome = router
            .dispatch(TaskStatusMessage::new("k1", Status::Working))
            .await;

        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert!(scheduler.scheduled.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn replaced_registration_gets_no_continuation() {
        let registry = Registry::new();
        let scheduler = RecordingScheduler::default();
        let seen = Seen::default();
        let replacement = registry.clone();
        let stale = Arc::clone(&seen);
        // The handler replaces its own registration under the same key
        registry.register(TaskChannel::new(
            "k1",
            FixedRequest(TaskRequest::new("k1", "echo", json!({}))),
            move |_: TaskStatusMessage| {
                replacement.remove("k1");
                replacement.register(recording_channel("k1", &stale, None));
                async { Some(Continuation::resend()) }
            },
        ));

        let router = Router::new(&registry, &scheduler);
        let outcome = router
            .dispatch(TaskStatusMessage::new("k1", Status::Working))
            .await;

        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert!(scheduler.scheduled.lock().expect("lock").is_empty());
        assert!(registry.has("k1"));
    }
}
