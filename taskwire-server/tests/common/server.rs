//! Test server harness for integration tests.
//!
//! Spins up the real task router on a random port for WebSocket and HTTP
//! clients.

use std::net::SocketAddr;
use std::time::Duration;

use taskwire_server::{router, AppState, EngineConfig, TaskEngine};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A test server instance with control handles.
pub struct TestServer {
    addr: SocketAddr,
    engine: TaskEngine,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start a server whose tasks step every 20ms.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or server fails to bind.
    pub async fn start() -> Self {
        Self::start_with(EngineConfig {
            step_delay: Duration::from_millis(20),
            default_steps: 2,
        })
        .await
    }

    /// Start a server with a custom engine configuration.
    pub async fn start_with(config: EngineConfig) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let state = AppState::new(config);
        let engine = state.engine.clone();
        let app = router(state);

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

        Self {
            addr: actual_addr,
            engine,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Get the WebSocket URL for connecting to the server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Get the HTTP base URL.
    #[allow(dead_code)]
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Engine behind the server (for test assertions).
    #[allow(dead_code)]
    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Gracefully shut down the server.
    ///
    /// Open WebSocket connections keep graceful shutdown waiting, so the
    /// serve task is aborted after a short grace period.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.engine.shutdown();
        if tokio::time::timeout(Duration::from_millis(500), &mut self.handle)
            .await
            .is_err()
        {
            self.handle.abort();
        }
    }
}
