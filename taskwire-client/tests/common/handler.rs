//! Recording message handler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskwire_client::{Continuation, MessageHandler};
use taskwire_core::TaskStatusMessage;
use tokio::sync::Notify;

/// Records every frame it is handed.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<TaskStatusMessage>>>,
    notify: Arc<Notify>,
    continue_after: Option<Duration>,
}

impl Recorder {
    /// Handler that never continues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that asks for a resend after `delay` on non-terminal frames.
    pub fn continuing_after(delay: Duration) -> Self {
        Self {
            continue_after: Some(delay),
            ..Self::default()
        }
    }

    /// Frames seen so far.
    pub fn messages(&self) -> Vec<TaskStatusMessage> {
        self.seen.lock().expect("recorder lock").clone()
    }

    /// Number of frames seen so far.
    pub fn count(&self) -> usize {
        self.seen.lock().expect("recorder lock").len()
    }

    /// Wait until at least `count` frames were seen.
    ///
    /// # Panics
    ///
    /// Panics after five seconds.
    pub async fn wait_for(&self, count: usize) -> Vec<TaskStatusMessage> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= count {
                    return self.messages();
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("expected {count} frames, saw {:?}", self.messages()))
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn on_message(&self, message: TaskStatusMessage) -> Option<Continuation> {
        let terminal = message.status.is_terminal();
        self.seen.lock().expect("recorder lock").push(message);
        self.notify.notify_waiters();
        match self.continue_after {
            Some(delay) if !terminal => Some(Continuation::after(delay)),
            _ => None,
        }
    }
}
