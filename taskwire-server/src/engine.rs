//! Task execution engine.
//!
//! Tasks are queued FIFO and executed one at a time by a single worker.
//! Every status change is broadcast as a [`TaskUpdate`]; transports decide
//! which subscriber owns which task.
//!
//! Built-in tasks:
//! - `echo`: runs `payload.steps` progress steps, then finishes with the
//!   payload as its final result
//! - `fail`: runs one step, then raises with `payload.reason`

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use taskwire_core::{Status, TaskStatusMessage};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics::{record_task_completed, set_queue_depth};

/// Capacity of the update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Finished tasks kept around for status queries.
const FINISHED_RETENTION: usize = 1024;

/// Upper bound for `payload.steps`.
pub const MAX_STEPS: u64 = 100;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Delay between progress steps.
    pub step_delay: Duration,
    /// Steps of an `echo` task without `payload.steps`.
    pub default_steps: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(250),
            default_steps: 4,
        }
    }
}

/// A status change of one task.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    /// Server-side task id.
    pub uid: String,
    /// New status, without correlation key.
    pub message: TaskStatusMessage,
}

struct TaskRecord {
    identifier: String,
    payload: Value,
    status: TaskStatusMessage,
}

#[derive(Default)]
struct EngineState {
    tasks: HashMap<String, TaskRecord>,
    queue: VecDeque<String>,
    finished: VecDeque<String>,
}

struct EngineInner {
    config: EngineConfig,
    state: Mutex<EngineState>,
    notify: Notify,
    updates: broadcast::Sender<TaskUpdate>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the task engine.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("config", &self.inner.config)
            .field("queued", &self.queue_len())
            .finish_non_exhaustive()
    }
}

impl TaskEngine {
    /// Create an engine and spawn its worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn start(config: EngineConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                state: Mutex::new(EngineState::default()),
                notify: Notify::new(),
                updates,
                worker: Mutex::new(None),
            }),
        };
        let worker = tokio::spawn(engine.clone().work());
        *engine
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(worker);
        engine
    }

    /// Subscribe to status changes of every task.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.inner.updates.subscribe()
    }

    /// Queue a task and return its id.
    ///
    /// The `pending` status is broadcast before this returns.
    pub fn enqueue(&self, identifier: &str, payload: Value) -> String {
        let uid = Uuid::new_v4().simple().to_string();
        let message = {
            let mut state = self.lock();
            let ahead = state.queue.len() as u64;
            let message = TaskStatusMessage::new("", Status::Pending)
                .with_queue(state.tasks.len() as u64 + 1, ahead)
                .with_message("queued");
            state.tasks.insert(
                uid.clone(),
                TaskRecord {
                    identifier: identifier.to_string(),
                    payload,
                    status: message.clone(),
                },
            );
            state.queue.push_back(uid.clone());
            set_queue_depth(state.queue.len());
            message
        };
        tracing::debug!(uid = %uid, identifier = %identifier, "Task queued");
        self.broadcast(&uid, message);
        self.inner.notify.notify_one();
        uid
    }

    /// Current status of a task, without correlation key.
    #[must_use]
    pub fn status(&self, uid: &str) -> Option<TaskStatusMessage> {
        self.lock().tasks.get(uid).map(|task| task.status.clone())
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether the worker task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stop the worker. Queued tasks stay queued.
    pub fn shutdown(&self) {
        if let Some(worker) = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, uid: &str, message: TaskStatusMessage) {
        // No subscribers is fine; HTTP clients read the stored status.
        let _ = self.inner.updates.send(TaskUpdate {
            uid: uid.to_string(),
            message,
        });
    }

    fn update(&self, uid: &str, message: TaskStatusMessage) {
        let message = {
            let mut state = self.lock();
            let message = message.with_queue(state.tasks.len() as u64, 0);
            let Some(task) = state.tasks.get_mut(uid) else {
                return;
            };
            task.status = message.clone();
            if message.status.is_terminal() {
                state.finished.push_back(uid.to_string());
                while state.finished.len() > FINISHED_RETENTION {
                    if let Some(old) = state.finished.pop_front() {
                        state.tasks.remove(&old);
                    }
                }
            }
            message
        };
        self.broadcast(uid, message);
    }

    /// Pop the next task and refresh the queue positions of the rest.
    fn next_task(&self) -> Option<(String, String, Value)> {
        let (next, positions) = {
            let mut state = self.lock();
            let uid = state.queue.pop_front()?;
            set_queue_depth(state.queue.len());
            let total = state.tasks.len() as u64;
            let mut positions = Vec::with_capacity(state.queue.len());
            let queued: Vec<String> = state.queue.iter().cloned().collect();
            for (ahead, queued_uid) in queued.into_iter().enumerate() {
                if let Some(task) = state.tasks.get_mut(&queued_uid) {
                    task.status = task.status.clone().with_queue(total, ahead as u64);
                    positions.push((queued_uid, task.status.clone()));
                }
            }
            let task = state.tasks.get(&uid)?;
            ((uid.clone(), task.identifier.clone(), task.payload.clone()), positions)
        };
        for (uid, message) in positions {
            self.broadcast(&uid, message);
        }
        Some(next)
    }

    async fn work(self) {
        loop {
            match self.next_task() {
                Some((uid, identifier, payload)) => self.execute(&uid, &identifier, &payload).await,
                None => self.inner.notify.notified().await,
            }
        }
    }

    async fn execute(&self, uid: &str, identifier: &str, payload: &Value) {
        tracing::debug!(uid = %uid, identifier = %identifier, "Task started");
        self.update(
            uid,
            TaskStatusMessage::new("", Status::Working)
                .with_progress(0.0)
                .with_message("started"),
        );

        let outcome = match identifier {
            "echo" => self.run_echo(uid, payload).await,
            "fail" => self.run_fail(uid, payload).await,
            other => Err(format!("unknown task: {other}")),
        };

        let message = match outcome {
            Ok(result) => TaskStatusMessage::new("", Status::Finished)
                .with_progress(1.0)
                .with_message("done")
                .with_final(result),
            Err(reason) => {
                tracing::debug!(uid = %uid, reason = %reason, "Task raised");
                TaskStatusMessage::new("", Status::Exception).with_message(reason)
            }
        };
        let label = if matches!(identifier, "echo" | "fail") {
            identifier
        } else {
            "other"
        };
        record_task_completed(label, message.status.as_str());
        self.update(uid, message);
    }

    #[allow(clippy::cast_precision_loss)]
    async fn run_echo(&self, uid: &str, payload: &Value) -> Result<Value, String> {
        let steps = payload
            .get("steps")
            .and_then(Value::as_u64)
            .unwrap_or(self.inner.config.default_steps)
            .clamp(1, MAX_STEPS);
        for step in 1..steps {
            tokio::time::sleep(self.inner.config.step_delay).await;
            let mut message = TaskStatusMessage::new("", Status::Working)
                .with_progress(step as f64 / steps as f64)
                .with_message(format!("step {step}/{steps}"));
            message.data.intermediate = Some(json!({ "step": step }));
            self.update(uid, message);
        }
        tokio::time::sleep(self.inner.config.step_delay).await;
        Ok(payload.clone())
    }

    async fn run_fail(&self, uid: &str, payload: &Value) -> Result<Value, String> {
        tokio::time::sleep(self.inner.config.step_delay).await;
        self.update(
            uid,
            TaskStatusMessage::new("", Status::Working)
                .with_progress(0.5)
                .with_message("about to fail"),
        );
        let reason = payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("task failed");
        Err(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> EngineConfig {
        EngineConfig {
            step_delay: Duration::from_millis(10),
            default_steps: 2,
        }
    }

    async fn updates_until_terminal(
        rx: &mut broadcast::Receiver<TaskUpdate>,
        uid: &str,
    ) -> Vec<TaskStatusMessage> {
        let mut seen = Vec::new();
        loop {
            let update = rx.recv().await.expect("update");
            if update.uid != uid {
                continue;
            }
            let terminal = update.message.status.is_terminal();
            seen.push(update.message);
            if terminal {
                return seen;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn echo_reports_progress_then_final() {
        let engine = TaskEngine::start(fast());
        let mut rx = engine.subscribe();
        let uid = engine.enqueue("echo", json!({"steps": 4, "text": "hi"}));

        let seen = updates_until_terminal(&mut rx, &uid).await;
        let statuses: Vec<Status> = seen.iter().map(|m| m.status).collect();
        assert_eq!(statuses.first(), Some(&Status::Pending));
        assert_eq!(statuses.last(), Some(&Status::Finished));

        let progress: Vec<f64> = seen.iter().filter_map(|m| m.data.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let last = seen.last().expect("terminal");
        assert_eq!(last.data.final_result, Some(json!({"steps": 4, "text": "hi"})));
        assert_eq!(engine.status(&uid).map(|m| m.status), Some(Status::Finished));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_and_unknown_raise() {
        let engine = TaskEngine::start(fast());
        let mut rx = engine.subscribe();

        let failing = engine.enqueue("fail", json!({"reason": "boom"}));
        let seen = updates_until_terminal(&mut rx, &failing).await;
        let last = seen.last().expect("terminal");
        assert_eq!(last.status, Status::Exception);
        assert_eq!(last.message, "boom");

        let unknown = engine.enqueue("paint", json!({}));
        let seen = updates_until_terminal(&mut rx, &unknown).await;
        let last = seen.last().expect("terminal");
        assert_eq!(last.status, Status::Exception);
        assert!(last.message.contains("paint"));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_positions_count_down() {
        let engine = TaskEngine::start(fast());
        let mut rx = engine.subscribe();
        let first = engine.enqueue("echo", json!({"steps": 1}));
        let second = engine.enqueue("echo", json!({"steps": 1}));
        let third = engine.enqueue("echo", json!({"steps": 1}));

        let pending = |uid: &str| engine.status(uid).map(|m| (m.status, m.pending));
        assert_eq!(pending(&third), Some((Status::Pending, 2)));

        updates_until_terminal(&mut rx, &first).await;
        updates_until_terminal(&mut rx, &second).await;
        updates_until_terminal(&mut rx, &third).await;
        assert_eq!(engine.queue_len(), 0);
    }

    #[tokio::test]
    async fn unknown_uid_has_no_status() {
        let engine = TaskEngine::start(fast());
        assert!(engine.status("missing").is_none());
        assert!(engine.is_running());
        engine.shutdown();
        tokio::task::yield_now().await;
    }
}
