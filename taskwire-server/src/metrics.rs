//! Prometheus metrics for taskwire-server.
//!
//! Provides metrics collection and a Prometheus-compatible `/metrics` endpoint.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// Metric names as constants for consistency
const WS_CONNECTIONS_ACTIVE: &str = "taskwire_ws_connections_active";
const WS_MESSAGES_TOTAL: &str = "taskwire_ws_messages_total";
const TASKS_SUBMITTED_TOTAL: &str = "taskwire_tasks_submitted_total";
const TASKS_COMPLETED_TOTAL: &str = "taskwire_tasks_completed_total";
const TASK_QUEUE_DEPTH: &str = "taskwire_task_queue_depth";
const VALIDATION_FAILURES_TOTAL: &str = "taskwire_validation_failures_total";

/// Initialize metrics and return the Prometheus handle.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed
/// (e.g., if another recorder is already installed).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Increment active WebSocket connections.
pub fn inc_ws_connections() {
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement active WebSocket connections.
pub fn dec_ws_connections() {
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a WebSocket message.
///
/// # Arguments
///
/// * `direction` - "inbound" or "outbound"
/// * `status` - Status carried by the frame, or "request" for inbound frames
pub fn record_ws_message(direction: &'static str, status: &'static str) {
    counter!(
        WS_MESSAGES_TOTAL,
        "direction" => direction,
        "status" => status
    )
    .increment(1);
}

/// Record a submitted task.
///
/// # Arguments
///
/// * `transport` - "ws" or "http"
pub fn record_task_submitted(transport: &'static str) {
    counter!(TASKS_SUBMITTED_TOTAL, "transport" => transport).increment(1);
}

/// Record a task reaching a terminal status.
///
/// # Arguments
///
/// * `task` - Built-in task name, or "other"
/// * `status` - "finished" or "exception"
pub fn record_task_completed(task: &str, status: &'static str) {
    counter!(
        TASKS_COMPLETED_TOTAL,
        "task" => task.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Update the number of queued tasks.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(depth: usize) {
    gauge!(TASK_QUEUE_DEPTH).set(depth as f64);
}

/// Record an input validation failure.
///
/// # Arguments
///
/// * `validation_type` - Type of validation that failed (correlation_key, identifier, etc.)
pub fn record_validation_failure(validation_type: &'static str) {
    counter!(
        VALIDATION_FAILURES_TOTAL,
        "type" => validation_type
    )
    .increment(1);
}
