//! Duplex connection management.
//!
//! One [`ConnectionManager`] owns one WebSocket link and multiplexes every
//! registered task channel over it:
//!
//! ```text
//!            ┌──────────────┐   TaskRequest    ┌────────┐
//!  run(key) ─┤ writer(mpsc) ├────────────────▶│        │
//!            └──────────────┘                  │ server │
//!            ┌──────────────┐  status frames   │        │
//!  Router ◀──┤  supervisor  │◀────────────────┤        │
//!            └──────────────┘                  └────────┘
//! ```
//!
//! The supervisor task reconnects forever until [`ConnectionManager::shutdown`].
//! Every successful handshake re-arms internal channels and drops external
//! ones, since the server forgets tasks of a closed connection.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use taskwire_core::{ConnectionState, TaskError, TaskStatusMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::channel::{ChannelSnapshot, Continuation, RequestSource, TimerKind};
use crate::config::ClientConfig;
use crate::metrics::{
    record_frame_rejected, record_frame_sent, record_reconnect, set_connection_state,
};
use crate::registry::Registry;
use crate::router::{ContinuationScheduler, DispatchOutcome, Router};

/// How long shutdown waits for the supervisor to close the link.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing link may take to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a live link ended.
enum LinkEnd {
    Shutdown,
    Lost(String),
}

struct Shared {
    config: ClientConfig,
    registry: Registry,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    force: watch::Sender<u64>,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a supervised duplex connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("ws_url", &self.shared.config.ws_url)
            .field("state", &self.state())
            .field("channels", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Start a manager and its supervisor task.
    ///
    /// The first connection attempt is made immediately. The supervisor keeps
    /// running until [`shutdown`](Self::shutdown) is called, even if every
    /// handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn connect(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let (force, _) = watch::channel(0);
        let manager = Self {
            shared: Arc::new(Shared {
                config,
                registry: Registry::new(),
                state,
                shutdown,
                force,
                outbound: RwLock::new(None),
                supervisor: Mutex::new(None),
            }),
        };
        set_connection_state(ConnectionState::Disconnected);

        let supervisor = tokio::spawn(manager.clone().supervise());
        *manager
            .shared
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);
        manager
    }

    /// Configuration this manager was started with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether the link is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The channel registry served by this connection.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Wait until the link is open.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Shutdown`] once the manager has been shut down.
    pub async fn wait_until_open(&self) -> Result<(), TaskError> {
        let mut state = self.shared.state.subscribe();
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return Err(TaskError::Shutdown);
            }
            if state.borrow_and_update().is_open() {
                return Ok(());
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(TaskError::Shutdown);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Err(TaskError::Shutdown);
                    }
                }
            }
        }
    }

    /// Send the current request of channel `key`.
    ///
    /// Waits for the link, builds the request, checks that it carries the
    /// channel's key and sends it. When the channel has an update interval the
    /// next send is scheduled afterwards. An unknown or terminated channel is
    /// not an error; nothing is sent.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Shutdown`] if the manager shut down while waiting
    /// - [`TaskError::KeyMismatch`] or [`TaskError::Request`] if the request
    ///   source misbehaved; the channel's error callback is notified
    /// - [`TaskError::Send`] if the link dropped before the frame was queued
    pub async fn run(&self, key: &str) -> Result<(), TaskError> {
        self.wait_until_open().await?;

        let Some(channel) = self.shared.registry.snapshot(key) else {
            tracing::warn!(key = %key, "Run requested for unknown channel");
            return Ok(());
        };

        self.send_request(&channel, channel.source.as_ref()).await?;

        if let Some(interval) = channel.update_interval {
            if !channel.is_terminated() {
                self.arm_timer(key, channel.generation, TimerKind::Update, interval, None);
            }
        }
        Ok(())
    }

    /// Route one status frame as if it had arrived on the link.
    pub async fn dispatch(&self, message: TaskStatusMessage) -> DispatchOutcome {
        Router::new(&self.shared.registry, self).dispatch(message).await
    }

    /// Drop the current link and reconnect through the normal backoff path.
    pub fn force_reconnect(&self) {
        tracing::info!("Forced reconnect requested");
        self.shared.force.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    /// Close the link, cancel every channel and stop reconnecting.
    ///
    /// Must not be awaited from inside a message handler, since the
    /// supervisor waits for the handler to return.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.shared.registry.clear();

        let supervisor = self
            .shared
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Supervisor did not stop in time, aborting");
                abort.abort();
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection manager shut down");
    }

    fn set_state(&self, state: ConnectionState) {
        let stopping = self.is_shutdown();
        if stopping && !matches!(state, ConnectionState::Closing | ConnectionState::Disconnected) {
            return;
        }
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
            set_connection_state(state);
        }
    }

    async fn send_request(
        &self,
        channel: &ChannelSnapshot,
        source: &dyn RequestSource,
    ) -> Result<(), TaskError> {
        let request = match source.build().await {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(key = %channel.key, error = %err, "Request source failed");
                channel.notify_error(&err);
                return Err(err);
            }
        };

        if request.correlation_key != channel.key {
            let err = TaskError::KeyMismatch {
                expected: channel.key.clone(),
                actual: request.correlation_key,
            };
            tracing::error!(key = %channel.key, error = %err, "Request not sent");
            channel.notify_error(&err);
            return Err(err);
        }

        if channel.is_terminated() {
            tracing::debug!(key = %channel.key, "Channel terminated before send");
            return Ok(());
        }

        let frame = request.to_frame()?;
        self.send_frame(frame)?;
        record_frame_sent(request.is_internal);
        tracing::trace!(key = %channel.key, identifier = %request.identifier, "Request sent");
        Ok(())
    }

    fn send_frame(&self, frame: String) -> Result<(), TaskError> {
        let outbound = self
            .shared
            .outbound
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Message::Text(frame))
                .map_err(|_| TaskError::Send("writer stopped".to_string())),
            None => Err(TaskError::Send("connection not open".to_string())),
        }
    }

    fn arm_timer(
        &self,
        key: &str,
        generation: u64,
        kind: TimerKind,
        delay: Duration,
        next: Option<Arc<dyn RequestSource>>,
    ) -> bool {
        let manager = self.clone();
        let owned_key = key.to_string();
        let armed = self
            .shared
            .registry
            .install_timer(key, generation, kind, move |id| {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !manager
                        .shared
                        .registry
                        .release_timer(&owned_key, generation, kind, id)
                    {
                        return;
                    }
                    manager.fire_timer(&owned_key, generation, kind, next).await;
                })
                .abort_handle()
            });
        if !armed {
            tracing::debug!(key = %key, ?kind, "Channel gone, timer not armed");
        }
        armed
    }

    async fn fire_timer(
        &self,
        key: &str,
        generation: u64,
        kind: TimerKind,
        next: Option<Arc<dyn RequestSource>>,
    ) {
        // Reconnection re-arms internal channels, so a timer never waits for the link.
        if !self.is_open() {
            tracing::debug!(key = %key, ?kind, "Connection not open, scheduled send skipped");
            return;
        }

        let result = match kind {
            TimerKind::Update => self.run(key).await,
            TimerKind::Continuation => {
                let Some(channel) = self.shared.registry.snapshot(key) else {
                    return;
                };
                if channel.generation != generation {
                    return;
                }
                let source = next.unwrap_or_else(|| Arc::clone(&channel.source));
                self.send_request(&channel, source.as_ref()).await
            }
        };
        if let Err(err) = result {
            tracing::debug!(key = %key, ?kind, error = %err, "Scheduled send failed");
        }
    }

    async fn supervise(self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut failures: u32 = 0;
        let mut immediate = true;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            if !immediate {
                let delay = self.shared.config.reconnect.delay_for_attempt(failures);
                failures = failures.saturating_add(1);
                tracing::debug!(delay_ms = delay.as_millis(), "Waiting before reconnect");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
            immediate = false;

            self.set_state(ConnectionState::Connecting);
            let url = self.shared.config.ws_url.as_str();
            let connected = tokio::select! {
                result = connect_async(url) => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok((socket, _response)) => {
                    failures = 0;
                    tracing::info!(url = %url, "Connected");
                    match self.drive(socket, &mut shutdown).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Lost(reason) => self.connection_lost(&reason),
                    }
                }
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "Connect failed");
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }

        tracing::debug!("Supervisor stopped");
    }

    async fn drive(&self, socket: Socket, shutdown: &mut watch::Receiver<bool>) -> LinkEnd {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    tracing::debug!(error = %err, "Writer stopped");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        *self
            .shared
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());
        let mut force = self.shared.force.subscribe();
        force.borrow_and_update();
        // Partition before publishing Open: a channel submitted by a waiter
        // of this link must not be dropped or re-run by the partition
        self.rearm();
        self.set_state(ConnectionState::Open);

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => break LinkEnd::Shutdown,
                _ = force.changed() => break LinkEnd::Lost("forced reconnect".to_string()),
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Ping(payload))) => {
                        if tx.send(Message::Pong(payload)).is_err() {
                            break LinkEnd::Lost("writer stopped".to_string());
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        tracing::warn!(len = bytes.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by server".to_string(),
                            |frame| format!("closed by server: {}", frame.reason),
                        );
                        break LinkEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break LinkEnd::Lost(err.to_string()),
                    None => break LinkEnd::Lost("stream ended".to_string()),
                },
            }
        };

        self.shared
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let _ = tx.send(Message::Close(None));
        drop(tx);
        let abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            abort.abort();
        }
        end
    }

    async fn handle_text(&self, text: &str) {
        match TaskStatusMessage::from_frame(text) {
            Ok(message) => {
                self.dispatch(message).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Dropping malformed frame");
                record_frame_rejected();
            }
        }
    }

    /// Fresh link: drop external channels, resend internal ones.
    fn rearm(&self) {
        let (internal, removed) = self.shared.registry.partition_for_reconnect();
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Dropped external channels of previous link");
        }
        for key in internal {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.run(&key).await {
                    tracing::warn!(key = %key, error = %err, "Re-arming internal channel failed");
                }
            });
        }
    }

    fn connection_lost(&self, reason: &str) {
        tracing::warn!(reason = %reason, "Connection lost");
        self.set_state(ConnectionState::Disconnected);
        record_reconnect();
        let err = TaskError::ConnectionLost(reason.to_string());
        for callback in self.shared.registry.error_callbacks() {
            callback(&err);
        }
    }
}

impl ContinuationScheduler for ConnectionManager {
    fn is_open(&self) -> bool {
        self.state().is_open()
    }

    fn schedule(&self, key: &str, generation: u64, continuation: Continuation) -> bool {
        let delay = continuation
            .delay
            .unwrap_or(self.shared.config.continuation_interval);
        self.arm_timer(
            key,
            generation,
            TimerKind::Continuation,
            delay,
            continuation.next_request,
        )
    }
}
