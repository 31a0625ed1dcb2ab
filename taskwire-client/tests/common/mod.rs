//! Shared integration test helpers.

#![allow(dead_code)]

mod handler;
mod server;

pub use handler::Recorder;
pub use server::{RealServer, ScriptedServer};

use std::time::Duration;

use taskwire_client::{ClientConfig, ReconnectPolicy};

/// Client config with a short constant reconnect delay.
pub fn fast_config(ws_url: String) -> ClientConfig {
    ClientConfig::new(ws_url)
        .with_reconnect(ReconnectPolicy::Constant(Duration::from_millis(50)))
        .with_continuation_interval(Duration::from_millis(50))
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
