//! End-to-end tests against the reference task server.

mod common;

use std::sync::Arc;

use serde_json::json;
use taskwire_client::{
    submit_channel, submit_poll, ChannelOptions, ConnectionManager, FixedRequest, HttpTaskClient,
    PollError,
};
use taskwire_core::{Status, TaskRequest};

use common::{eventually, fast_config, Recorder, RealServer};

#[tokio::test]
async fn echo_over_websocket_runs_to_completion() {
    let server = RealServer::start().await;
    let manager = ConnectionManager::connect(fast_config(server.ws_url()));
    let recorder = Recorder::new();

    let options = ChannelOptions::default();
    let key = options.key().to_string();
    let payload = json!({"steps": 3, "text": "round trip"});

    submit_channel(
        &manager,
        FixedRequest(TaskRequest::new(key.clone(), "echo", payload.clone())),
        recorder.clone(),
        options,
    )
    .await
    .expect("submit");

    assert!(eventually(|| !manager.registry().has(&key)).await);

    let seen = recorder.messages();
    assert!(seen.iter().all(|m| m.correlation_key == key));
    assert_eq!(seen.first().map(|m| m.status), Some(Status::Pending));
    let last = seen.last().expect("terminal frame");
    assert_eq!(last.status, Status::Finished);
    assert_eq!(last.data.final_result, Some(payload));

    let progress: Vec<f64> = seen.iter().filter_map(|m| m.data.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

    manager.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn push_and_poll_over_http() {
    let server = RealServer::start().await;
    let client = HttpTaskClient::new(server.http_url()).expect("client");

    let uid = client
        .push("echo", json!({"steps": 2, "n": 1}))
        .await
        .expect("push");
    let finished = submit_poll(Arc::new(client), uid).await.expect("finished");

    assert_eq!(finished.status, Status::Finished);
    assert_eq!(finished.data.final_result, Some(json!({"steps": 2, "n": 1})));

    server.shutdown().await;
}

#[tokio::test]
async fn failing_task_rejects_poll() {
    let server = RealServer::start().await;
    let client = HttpTaskClient::new(server.http_url()).expect("client");

    let uid = client
        .push("fail", json!({"reason": "out of credits"}))
        .await
        .expect("push");
    let result = submit_poll(Arc::new(client), uid).await;

    assert_eq!(
        result,
        Err(PollError::TaskFailed {
            reason: "out of credits".to_string()
        })
    );

    server.shutdown().await;
}
