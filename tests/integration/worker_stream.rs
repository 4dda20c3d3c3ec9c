//! Streaming workers over the TCP server.

use std::time::Duration;

use crate::fixtures::{registration, Controller, StreamWorker};
use chrono::Utc;
use fleetctl::core::{ExecutorKind, TargetKind, TaskState};
use fleetctl::orchestration::{NewTask, WATCHDOG_ERROR};
use fleetctl::store::Store;
use fleetctl::worker::{ServerMessage, TaskResult, WorkerMessage, WorkerServer};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn start_server(ctl: &Controller) -> (WorkerServer, CancellationToken) {
    let shutdown = CancellationToken::new();
    let server = WorkerServer::start(
        &ctl.config.worker_listen,
        ctl.registry.clone(),
        shutdown.clone(),
    )
    .await
    .unwrap();
    (server, shutdown)
}

fn resize_on(node: &str) -> NewTask {
    let mut spec = NewTask::new("resize", ExecutorKind::Embedded);
    spec.target_kind = TargetKind::Node;
    spec.target_ref = node.to_string();
    spec.payload = json!({"width": 32});
    spec
}

#[tokio::test]
async fn test_push_and_result_round_trip() {
    let ctl = Controller::new().await;
    let (server, _shutdown) = start_server(&ctl).await;
    let mut worker =
        StreamWorker::connect(server.addr(), registration("w1", "n1", &["resize"])).await;
    assert_eq!(ctl.store.list_embedded_workers().await.unwrap().len(), 1);

    let id = ctl.tasks.create(resize_on("n1"), true).await.unwrap();
    ctl.schedule().await;
    assert_eq!(ctl.task(&id).await.state, TaskState::Running);

    let request = match worker.recv().await {
        Some(ServerMessage::TaskRequest(req)) => req,
        other => panic!("Expected task request, got {:?}", other),
    };
    assert_eq!(request.task_id, id.to_string());
    assert_eq!(request.name, "resize");
    assert_eq!(request.payload, json!({"width": 32}));

    worker
        .send(&WorkerMessage::Result(TaskResult {
            task_id: request.task_id,
            result: Some(json!({"done": true})),
            error: String::new(),
        }))
        .await;

    let task = ctl.wait_terminal(&id, Duration::from_secs(2)).await;
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.result, Some(json!({"done": true})));

    server.shutdown().await;
}

#[tokio::test]
async fn test_worker_error_result() {
    let ctl = Controller::new().await;
    let (server, _shutdown) = start_server(&ctl).await;
    let mut worker =
        StreamWorker::connect(server.addr(), registration("w1", "n1", &["resize"])).await;

    let id = ctl.tasks.create(resize_on("n1"), true).await.unwrap();
    ctl.schedule().await;
    let Some(ServerMessage::TaskRequest(request)) = worker.recv().await else {
        panic!("Expected task request");
    };
    worker
        .send(&WorkerMessage::Result(TaskResult {
            task_id: request.task_id,
            result: None,
            error: "disk full".into(),
        }))
        .await;

    let task = ctl.wait_terminal(&id, Duration::from_secs(2)).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error, "disk full");

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_removes_worker() {
    let ctl = Controller::new().await;
    let (server, _shutdown) = start_server(&ctl).await;
    let worker =
        StreamWorker::connect(server.addr(), registration("w1", "n1", &["resize"])).await;
    assert_eq!(ctl.registry.len().await, 1);

    drop(worker);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !ctl.registry.is_empty().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ctl.registry.is_empty().await);
    assert!(ctl.store.list_embedded_workers().await.unwrap().is_empty());

    // With the worker gone the task has nowhere to go.
    let id = ctl.tasks.create(resize_on("n1"), true).await.unwrap();
    ctl.schedule().await;
    assert_eq!(ctl.task(&id).await.error, "no suitable worker found");

    server.shutdown().await;
}

#[tokio::test]
async fn test_watchdog_beats_late_worker_result() {
    let ctl = Controller::new().await;
    let (server, _shutdown) = start_server(&ctl).await;
    let mut worker =
        StreamWorker::connect(server.addr(), registration("w1", "n1", &["resize"])).await;

    let mut spec = resize_on("n1");
    spec.timeout_sec = 1;
    let id = ctl.tasks.create(spec, true).await.unwrap();
    ctl.schedule().await;
    let Some(ServerMessage::TaskRequest(request)) = worker.recv().await else {
        panic!("Expected task request");
    };

    // Past timeout + grace.
    let later = Utc::now() + chrono::Duration::seconds(10);
    let report = ctl.scheduler.tick_at(later).await.unwrap();
    assert_eq!(report.watchdog_expired, 1);
    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error, WATCHDOG_ERROR);

    worker
        .send(&WorkerMessage::Result(TaskResult {
            task_id: request.task_id,
            result: Some(json!({"late": true})),
            error: String::new(),
        }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error, WATCHDOG_ERROR);

    server.shutdown().await;
}
