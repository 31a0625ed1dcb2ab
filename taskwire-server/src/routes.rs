//! HTTP polling fallback handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use taskwire_core::{PushRequest, PushResponse, TaskStatusMessage};

use crate::metrics::{record_task_submitted, record_validation_failure};
use crate::validation::validate_identifier;
use crate::AppState;

/// `POST /push`: queue a task and return its uid.
#[tracing::instrument(name = "push_task", skip(state, request), fields(task = %request.task))]
pub async fn push_handler(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, (StatusCode, Json<Value>)> {
    if let Err(e) = validate_identifier(&request.task) {
        record_validation_failure(e.kind());
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ));
    }

    let uid = state.engine.enqueue(&request.task, request.params);
    record_task_submitted("http");
    Ok(Json(PushResponse { uid }))
}

/// `GET /status/{uid}`: current status of a pushed task.
#[tracing::instrument(name = "task_status", skip(state))]
pub async fn status_handler(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<TaskStatusMessage>, StatusCode> {
    state.engine.status(&uid).map(Json).ok_or(StatusCode::NOT_FOUND)
}
