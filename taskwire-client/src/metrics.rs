//! Client-side metrics.
//!
//! Emitted through the `metrics` facade; nothing is recorded unless the host
//! application installs a recorder.

use metrics::{counter, gauge};
use taskwire_core::ConnectionState;

const FRAMES_ROUTED_TOTAL: &str = "taskwire_client_frames_routed_total";
const FRAMES_SENT_TOTAL: &str = "taskwire_client_frames_sent_total";
const FRAMES_REJECTED_TOTAL: &str = "taskwire_client_frames_rejected_total";
const RECONNECTS_TOTAL: &str = "taskwire_client_reconnects_total";
const CONNECTION_STATE: &str = "taskwire_client_connection_state";
const CHANNELS_ACTIVE: &str = "taskwire_client_channels_active";
const POLL_CHECKS_TOTAL: &str = "taskwire_client_poll_checks_total";

/// Record the outcome of routing one inbound frame.
///
/// # Arguments
///
/// * `outcome` - "dropped", "delivered", "continued" or "completed"
pub fn record_frame_routed(outcome: &str) {
    counter!(FRAMES_ROUTED_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record a request frame handed to the transport.
pub fn record_frame_sent(internal: bool) {
    counter!(FRAMES_SENT_TOTAL, "internal" => internal.to_string()).increment(1);
}

/// Record an inbound frame that failed to parse.
pub fn record_frame_rejected() {
    counter!(FRAMES_REJECTED_TOTAL).increment(1);
}

/// Record an unexpected connection loss.
pub fn record_reconnect() {
    counter!(RECONNECTS_TOTAL).increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    // One gauge per state, exactly one of them at 1.
    for candidate in [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Open,
        ConnectionState::Closing,
    ] {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!(CONNECTION_STATE, "state" => candidate.as_str()).set(value);
    }
}

/// Update the registered channel count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_channels(count: usize) {
    gauge!(CHANNELS_ACTIVE).set(count as f64);
}

/// Record one poller status check.
///
/// # Arguments
///
/// * `outcome` - "pending", "working", "finished", "exception" or "error"
pub fn record_poll_check(outcome: &str) {
    counter!(POLL_CHECKS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}
