//! # Taskwire Core
//!
//! Wire types shared by the taskwire client and server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                taskwire-core                │
//! ├─────────────────────────────────────────────┤
//! │  Protocol        │  Lifecycle               │
//! │  - TaskRequest   │  - ConnectionState       │
//! │  - Status frames │  - TaskError             │
//! │  - Push / poll   │                          │
//! └─────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod protocol;
pub mod state;

pub use error::{TaskError, TaskResult};
pub use protocol::{
    new_correlation_key, PushRequest, PushResponse, Status, StatusData, TaskRequest,
    TaskStatusMessage,
};
pub use state::ConnectionState;

/// Taskwire core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
