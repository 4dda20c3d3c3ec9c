//! Backends exercised through the scheduler: builtins, os_process, HTTP
//! workers and service endpoints.

use crate::fixtures::{spawn_http, Controller};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use fleetctl::core::{Endpoint, ExecutorKind, HttpWorker, TargetKind, TaskState};
use fleetctl::orchestration::NewTask;
use fleetctl::store::Store;
use serde_json::{json, Value};

async fn echo_handler(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({"handled": body["name"], "input": body["payload"]}))
}

async fn failing_handler() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

#[tokio::test]
async fn test_builtin_fail() {
    let ctl = Controller::new().await;
    let id = ctl
        .tasks
        .create(NewTask::new("builtin.fail", ExecutorKind::Builtin), true)
        .await
        .unwrap();
    ctl.schedule().await;

    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error, "builtin fail");
    assert_eq!(task.attempt, 1);
}

#[tokio::test]
async fn test_os_process_echo() {
    let ctl = Controller::new().await;
    let mut spec = NewTask::new("hello", ExecutorKind::OsProcess);
    spec.payload = json!({"command": "echo", "args": ["hi"]});
    let id = ctl.tasks.create(spec, true).await.unwrap();
    ctl.schedule().await;

    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Succeeded);
    let result = task.result.unwrap();
    assert_eq!(result["exitCode"], 0);
    assert_eq!(result["stdout"], "hi\n");
}

#[tokio::test]
async fn test_queued_task_waits_for_start() {
    let ctl = Controller::new().await;
    let id = ctl
        .tasks
        .create(NewTask::new("builtin.echo", ExecutorKind::Builtin), false)
        .await
        .unwrap();
    ctl.schedule().await;
    assert_eq!(ctl.task(&id).await.state, TaskState::Queued);

    ctl.tasks.start(&id).await.unwrap();
    ctl.schedule().await;
    assert_eq!(ctl.task(&id).await.state, TaskState::Succeeded);
}

#[tokio::test]
async fn test_http_worker_success() {
    let ctl = Controller::new().await;
    let addr = spawn_http(Router::new().route("/task", post(echo_handler))).await;
    ctl.store
        .upsert_http_worker(HttpWorker {
            id: "hw1".into(),
            node_id: "n1".into(),
            url: format!("http://{}/task", addr),
            tasks: vec!["resize".into()],
            labels: Default::default(),
            last_seen: Utc::now(),
        })
        .await
        .unwrap();

    let mut spec = NewTask::new("resize", ExecutorKind::Embedded);
    spec.target_kind = TargetKind::Node;
    spec.target_ref = "n1".into();
    spec.payload = json!({"width": 64});
    let id = ctl.tasks.create(spec, true).await.unwrap();
    ctl.schedule().await;

    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Succeeded, "error: {}", task.error);
    assert_eq!(
        task.result,
        Some(json!({"handled": "resize", "input": {"width": 64}}))
    );
}

#[tokio::test]
async fn test_http_worker_error_status() {
    let ctl = Controller::new().await;
    let addr = spawn_http(Router::new().route("/task", post(failing_handler))).await;
    ctl.store
        .upsert_http_worker(HttpWorker {
            id: "hw1".into(),
            node_id: "n1".into(),
            url: format!("http://{}/task", addr),
            tasks: vec!["resize".into()],
            labels: Default::default(),
            last_seen: Utc::now(),
        })
        .await
        .unwrap();

    let id = ctl
        .tasks
        .create(NewTask::new("resize", ExecutorKind::Embedded), true)
        .await
        .unwrap();
    ctl.schedule().await;

    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.contains("500"), "error: {}", task.error);
    assert!(task.error.contains("boom"), "error: {}", task.error);
}

#[tokio::test]
async fn test_embedded_no_worker() {
    let ctl = Controller::new().await;
    let id = ctl
        .tasks
        .create(NewTask::new("resize", ExecutorKind::Embedded), true)
        .await
        .unwrap();
    ctl.schedule().await;

    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error, "no suitable worker found");
}

#[tokio::test]
async fn test_service_endpoint_call() {
    let ctl = Controller::new().await;
    let addr = spawn_http(Router::new().route("/hooks/run", post(echo_handler))).await;
    ctl.store
        .upsert_endpoint(Endpoint {
            service_name: "images".into(),
            instance_id: "inst-1".into(),
            node_id: "n1".into(),
            ip: "127.0.0.1".into(),
            port: addr.port(),
            protocol: "http".into(),
            version: "v2".into(),
            labels: Default::default(),
            healthy: true,
        })
        .await
        .unwrap();

    let mut spec = NewTask::new("thumbnail", ExecutorKind::Service);
    spec.target_kind = TargetKind::Service;
    spec.target_ref = "images".into();
    spec.labels.insert("serviceVersion".into(), "v2".into());
    spec.labels.insert("servicePath".into(), "hooks/run".into());
    let id = ctl.tasks.create(spec, true).await.unwrap();
    ctl.schedule().await;

    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Succeeded, "error: {}", task.error);
    assert_eq!(task.result.unwrap()["handled"], "thumbnail");
}

#[tokio::test]
async fn test_service_version_mismatch() {
    let ctl = Controller::new().await;
    ctl.store
        .upsert_endpoint(Endpoint {
            service_name: "images".into(),
            instance_id: "inst-1".into(),
            node_id: "n1".into(),
            ip: "127.0.0.1".into(),
            port: 9,
            protocol: "http".into(),
            version: "v1".into(),
            labels: Default::default(),
            healthy: true,
        })
        .await
        .unwrap();

    let mut spec = NewTask::new("thumbnail", ExecutorKind::Service);
    spec.target_ref = "images".into();
    spec.labels.insert("serviceVersion".into(), "v2".into());
    let id = ctl.tasks.create(spec, true).await.unwrap();
    ctl.schedule().await;

    let task = ctl.task(&id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error, "no healthy endpoints");
}
