//! Test server harnesses for integration tests.
//!
//! [`ScriptedServer`] records every request and only speaks when told to.
//! [`RealServer`] runs the reference task server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use taskwire_core::{TaskRequest, TaskStatusMessage};
use taskwire_server::{router, AppState, EngineConfig};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
enum Control {
    Frame(String),
    Kick,
}

#[derive(Clone)]
struct ScriptState {
    requests: mpsc::UnboundedSender<TaskRequest>,
    control: broadcast::Sender<Control>,
    connections: Arc<AtomicUsize>,
}

/// Serve `app` on a random localhost port.
async fn spawn(app: Router) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let port = portpicker::pick_unused_port().expect("no available port");
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    let actual_addr = listener.local_addr().expect("failed to get local addr");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("server error");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(10)).await;
    (actual_addr, shutdown_tx, handle)
}

async fn stop(shutdown_tx: oneshot::Sender<()>, mut handle: JoinHandle<()>) {
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(Duration::from_millis(500), &mut handle)
        .await
        .is_err()
    {
        handle.abort();
    }
}

/// A WebSocket server driven by the test.
pub struct ScriptedServer {
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<TaskRequest>,
    control: broadcast::Sender<Control>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    /// Start a scripted server on a random port.
    pub async fn start() -> Self {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let state = ScriptState {
            requests: requests_tx,
            control: control.clone(),
            connections: Arc::clone(&connections),
        };

        let app = Router::new()
            .route("/ws", get(scripted_ws_handler))
            .with_state(state);
        let (addr, shutdown_tx, handle) = spawn(app).await;

        Self {
            addr,
            requests,
            control,
            connections,
            shutdown_tx,
            handle,
        }
    }

    /// WebSocket URL of the server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Next request received on any connection.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within five seconds.
    pub async fn next_request(&mut self) -> TaskRequest {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("server stopped")
    }

    /// Whether another request arrives within `window`.
    pub async fn request_within(&mut self, window: Duration) -> Option<TaskRequest> {
        tokio::time::timeout(window, self.requests.recv())
            .await
            .ok()
            .flatten()
    }

    /// Send a status frame to every open connection.
    pub fn push(&self, message: &TaskStatusMessage) {
        self.push_raw(message.to_frame().expect("frame"));
    }

    /// Send a raw text frame to every open connection.
    pub fn push_raw(&self, text: impl Into<String>) {
        self.control
            .send(Control::Frame(text.into()))
            .expect("no open connection");
    }

    /// Close every open connection.
    pub fn kick(&self) {
        self.control.send(Control::Kick).expect("no open connection");
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Stop the server.
    pub async fn shutdown(self) {
        stop(self.shutdown_tx, self.handle).await;
    }
}

async fn scripted_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ScriptState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_scripted(socket, state))
}

async fn serve_scripted(mut socket: WebSocket, state: ScriptState) {
    let mut control = state.control.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(request) = serde_json::from_str::<TaskRequest>(text.as_str()) {
                        let _ = state.requests.send(request);
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = control.recv() => match command {
                Ok(Control::Frame(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Kick) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// The reference task server on a random port.
pub struct RealServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RealServer {
    /// Start a server whose tasks step every 20ms.
    pub async fn start() -> Self {
        let state = AppState::new(EngineConfig {
            step_delay: Duration::from_millis(20),
            default_steps: 2,
        });
        let (addr, shutdown_tx, handle) = spawn(router(state)).await;
        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    /// WebSocket URL of the server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// HTTP base URL of the server.
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the server.
    pub async fn shutdown(self) {
        stop(self.shutdown_tx, self.handle).await;
    }
}
