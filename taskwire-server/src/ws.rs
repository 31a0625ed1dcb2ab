//! Duplex task endpoint.
//!
//! One socket carries many tasks. Each inbound [`TaskRequest`] with an unseen
//! correlation key enqueues a task; a request with a key that is still
//! running answers with the task's current status. Engine updates are
//! forwarded to the connection that owns the task, tagged with its key.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use taskwire_core::{Status, TaskRequest, TaskStatusMessage};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::{TaskEngine, TaskUpdate};
use crate::metrics::{
    dec_ws_connections, inc_ws_connections, record_task_submitted, record_validation_failure,
    record_ws_message,
};
use crate::validation::{validate_correlation_key, validate_identifier, validate_message_size};
use crate::AppState;

/// Upgrade handler for `/ws`.
#[tracing::instrument(name = "task_socket_connect", skip(ws, state))]
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    tracing::debug!("Task socket upgrade requested");
    ws.on_upgrade(move |socket| handle_task_socket(socket, state.engine))
}

/// Tasks owned by one connection.
struct Session {
    engine: TaskEngine,
    by_key: HashMap<String, String>,
    by_uid: HashMap<String, String>,
}

impl Session {
    fn new(engine: TaskEngine) -> Self {
        Self {
            engine,
            by_key: HashMap::new(),
            by_uid: HashMap::new(),
        }
    }

    /// Handle one inbound text frame. Returns the frame to answer with
    /// immediately, if any; new tasks answer through their `pending` update.
    fn handle_text(&mut self, text: &str) -> Option<TaskStatusMessage> {
        if let Err(e) = validate_message_size(text.len()) {
            record_validation_failure(e.kind());
            return Some(rejection("", e.to_string()));
        }

        let request: TaskRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "Unparsable task frame");
                return Some(rejection("", format!("parse error: {e}")));
            }
        };

        if let Err(e) = validate_correlation_key(&request.correlation_key)
            .and_then(|()| validate_identifier(&request.identifier))
        {
            record_validation_failure(e.kind());
            return Some(rejection(&request.correlation_key, e.to_string()));
        }

        if let Some(uid) = self.by_key.get(&request.correlation_key) {
            match self.engine.status(uid) {
                Some(mut status) => {
                    status.correlation_key = request.correlation_key;
                    return Some(status);
                }
                None => {
                    // Evicted from the engine's history; start over.
                    let uid = uid.clone();
                    self.forget(&uid);
                }
            }
        }

        let uid = self.engine.enqueue(&request.identifier, request.payload);
        record_task_submitted("ws");
        tracing::debug!(
            key = %request.correlation_key,
            uid = %uid,
            internal = request.is_internal,
            "Task accepted"
        );
        self.by_uid.insert(uid.clone(), request.correlation_key.clone());
        self.by_key.insert(request.correlation_key, uid);
        None
    }

    /// Tag an engine update with its key if this connection owns the task.
    fn route_update(&mut self, update: TaskUpdate) -> Option<TaskStatusMessage> {
        let key = self.by_uid.get(&update.uid)?.clone();
        let mut message = update.message;
        message.correlation_key = key;
        if message.status.is_terminal() {
            self.forget(&update.uid);
        }
        Some(message)
    }

    fn forget(&mut self, uid: &str) {
        if let Some(key) = self.by_uid.remove(uid) {
            self.by_key.remove(&key);
        }
    }

    fn owned(&self) -> usize {
        self.by_uid.len()
    }
}

fn rejection(key: &str, reason: String) -> TaskStatusMessage {
    TaskStatusMessage::new(key, Status::Exception).with_message(reason)
}

/// Serialize and send a status frame. Returns `false` once the peer is gone.
async fn send_status(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &TaskStatusMessage,
) -> bool {
    match message.to_frame() {
        Ok(json) => {
            record_ws_message("outbound", message.status.as_str());
            sender.send(Message::Text(json.into())).await.is_ok()
        }
        Err(e) => {
            tracing::error!(key = %message.correlation_key, "Failed to serialize status: {}", e);
            true
        }
    }
}

/// Serve one task socket until the peer disconnects.
pub async fn handle_task_socket(socket: WebSocket, engine: TaskEngine) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4().simple().to_string();

    // Subscribe before the first enqueue so no pending update is missed
    let mut updates = engine.subscribe();
    let mut session = Session::new(engine);

    inc_ws_connections();
    tracing::info!(conn_id = %conn_id, "Task socket connected");

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        record_ws_message("inbound", "request");
                        if let Some(reply) = session.handle_text(text.as_str()) {
                            if !send_status(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!(conn_id = %conn_id, "Binary frame ignored");
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(conn_id = %conn_id, "Peer closed task socket");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(conn_id = %conn_id, "Task socket error: {}", e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        if let Some(message) = session.route_update(update) {
                            if !send_status(&mut sender, &message).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(conn_id = %conn_id, "Task socket lagged behind by {} updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Engine update channel closed");
                        break;
                    }
                }
            }
        }
    }

    dec_ws_connections();
    tracing::info!(conn_id = %conn_id, running = session.owned(), "Task socket closed");
}
