//! # Taskwire Server Library
//!
//! Reference task server speaking the taskwire protocol.
//! This library is used by both the binary and integration tests.

use axum::{
    routing::{get, post},
    Router,
};

pub mod engine;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod validation;
pub mod ws;

pub use engine::{EngineConfig, TaskEngine, TaskUpdate};

/// Shared application state.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Task engine executing submitted work.
    pub engine: TaskEngine,
}

impl AppState {
    /// Start an engine with `config` and wrap it.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            engine: TaskEngine::start(config),
        }
    }
}

/// Protocol and health routes, without metrics or HTTP layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/ws", get(ws::ws_handler))
        .route("/push", post(routes::push_handler))
        .route("/status/{uid}", get(routes::status_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        router(AppState::new(EngineConfig {
            step_delay: Duration::from_millis(10),
            default_steps: 1,
        }))
    }

    #[tokio::test]
    async fn liveness_is_ok() {
        let response = app()
            .oneshot(Request::get("/health/live").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_status_is_not_found() {
        let response = app()
            .oneshot(Request::get("/status/nope").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn push_returns_uid() {
        let response = app()
            .oneshot(
                Request::post("/push")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"task":"echo","params":{}}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let pushed: taskwire_core::PushResponse = serde_json::from_slice(&body).expect("json");
        assert_eq!(pushed.uid.len(), 32);
    }
}
