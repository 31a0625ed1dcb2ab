//! # Taskwire Client
//!
//! Submit long-running server tasks and stream their status.
//!
//! Two transports share one status contract ([`TaskStatusMessage`]):
//!
//! - **Duplex**: one WebSocket multiplexes many task channels. A
//!   [`ConnectionManager`] keeps the link up, a [`Registry`] maps correlation
//!   keys to channels and inbound frames are routed to the owning handler.
//! - **Polling**: [`HttpTaskClient`] pushes a task over HTTP and a [`Poller`]
//!   checks its status with adaptive backoff.
//!
//! ```no_run
//! use serde_json::json;
//! use taskwire_client::{
//!     submit_channel, ChannelOptions, ClientConfig, ConnectionManager, Continuation,
//! };
//! use taskwire_core::{TaskError, TaskRequest, TaskStatusMessage};
//!
//! # async fn demo() -> Result<(), TaskError> {
//! let manager = ConnectionManager::connect(ClientConfig::from_env());
//! let options = ChannelOptions::default();
//! let key = options.key().to_string();
//!
//! submit_channel(
//!     &manager,
//!     move || {
//!         let key = key.clone();
//!         async move { Ok::<_, TaskError>(TaskRequest::new(key, "echo", json!({"steps": 2}))) }
//!     },
//!     |message: TaskStatusMessage| async move {
//!         println!("{} {:?}", message.status, message.data.progress);
//!         None::<Continuation>
//!     },
//!     options,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod connection;
pub mod http;
pub mod metrics;
pub mod poller;
pub mod registry;
pub mod router;
pub mod submit;

pub use channel::{
    ChannelInfo, Continuation, ErrorCallback, FixedRequest, MessageHandler, RequestSource,
    TaskChannel,
};
pub use config::{BackoffConfig, ClientConfig, ReconnectPolicy};
pub use connection::ConnectionManager;
pub use http::{HttpError, HttpTaskClient};
pub use poller::{adaptive_interval, PollError, Poller, PollerConfig, PollerHandle, StatusSource};
pub use registry::Registry;
pub use router::DispatchOutcome;
pub use submit::{submit_channel, submit_poll, ChannelHandle, ChannelOptions};

pub use taskwire_core::{
    ConnectionState, Status, StatusData, TaskError, TaskRequest, TaskStatusMessage,
};
