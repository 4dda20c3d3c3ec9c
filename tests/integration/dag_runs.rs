//! DAG runs driven end to end through the scheduler and the orchestrator.

use crate::fixtures::Controller;
use fleetctl::core::{
    BranchCondition, EdgeType, ExecutorKind, LoopCondition, Operator, RunState, TaskDefinition,
    TriggerRule, WorkflowDag, WorkflowNode,
};
use fleetctl::orchestration::NodeState;
use fleetctl::store::Store;
use serde_json::json;

/// A definition that prints a JSON object on stdout.
async fn json_printer(ctl: &Controller, status: &str) -> String {
    let def = TaskDefinition::new("report", ExecutorKind::OsProcess).with_default_payload(json!({
        "command": "echo",
        "args": [format!("{{\"status\":\"{}\"}}", status)]
    }));
    ctl.store.create_task_def(def).await.unwrap()
}

#[tokio::test]
async fn test_chain_runs_in_order() {
    let ctl = Controller::new().await;
    let echo = ctl.builtin_def("echo").await;
    let mut dag = WorkflowDag::new("chain");
    dag.add_node("a", WorkflowNode::task("A", &echo).with_payload(json!({"step": 1})))
        .add_node("b", WorkflowNode::task("B", &echo).with_payload(json!({"step": 2})))
        .add_edge("a", "b");
    let dag_id = ctl.store.create_dag(dag).await.unwrap();
    let run_id = ctl.orchestrator.start_dag_run(&dag_id).await.unwrap();

    assert_eq!(ctl.drive_run(&run_id, 10).await, RunState::Succeeded);

    let tasks = ctl.store.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    let a = tasks.iter().find(|t| t.labels["dagNodeId"] == "a").unwrap();
    let b = tasks.iter().find(|t| t.labels["dagNodeId"] == "b").unwrap();
    // B was only created once A had finished.
    assert!(b.created_at >= a.finished_at.unwrap());
    assert_eq!(b.result, Some(json!({"step": 2})));
    assert!(ctl.orchestrator.list_live_runs().await.is_empty());
}

#[tokio::test]
async fn test_branch_routes_on_process_output() {
    let ctl = Controller::new().await;
    let echo = ctl.builtin_def("echo").await;
    let report = json_printer(&ctl, "fail").await;

    let mut dag = WorkflowDag::new("branch");
    dag.add_node("a", WorkflowNode::task("A", &report))
        .add_node(
            "c",
            WorkflowNode::branch("C", BranchCondition::new("a", "status", Operator::Eq, "ok")),
        )
        .add_node("d", WorkflowNode::task("D", &echo))
        .add_node("e", WorkflowNode::task("E", &echo))
        .add_edge("a", "c")
        .add_typed_edge("c", "d", EdgeType::True)
        .add_typed_edge("c", "e", EdgeType::False);
    let dag_id = ctl.store.create_dag(dag).await.unwrap();
    let run_id = ctl.orchestrator.start_dag_run(&dag_id).await.unwrap();

    assert_eq!(ctl.drive_run(&run_id, 10).await, RunState::Succeeded);

    let tasks = ctl.store.list_tasks().await.unwrap();
    assert!(tasks.iter().all(|t| t.labels["dagNodeId"] != "d"));
    assert!(tasks.iter().any(|t| t.labels["dagNodeId"] == "e"));
}

#[tokio::test]
async fn test_failure_blocks_join_and_fails_run() {
    let ctl = Controller::new().await;
    let echo = ctl.builtin_def("echo").await;
    let fail = ctl.builtin_def("fail").await;

    let mut dag = WorkflowDag::new("join");
    dag.add_node("ok", WorkflowNode::task("Ok", &echo))
        .add_node("bad", WorkflowNode::task("Bad", &fail))
        .add_node("join", WorkflowNode::task("Join", &echo))
        .add_node(
            "cleanup",
            WorkflowNode::task("Cleanup", &echo).with_trigger_rule(TriggerRule::OneFailed),
        )
        .add_edge("ok", "join")
        .add_edge("bad", "join")
        .add_edge("bad", "cleanup");
    let dag_id = ctl.store.create_dag(dag).await.unwrap();
    let run_id = ctl.orchestrator.start_dag_run(&dag_id).await.unwrap();

    assert_eq!(ctl.drive_run(&run_id, 10).await, RunState::Failed);

    let tasks = ctl.store.list_tasks().await.unwrap();
    assert!(tasks.iter().all(|t| t.labels["dagNodeId"] != "join"));
    assert!(tasks.iter().any(|t| t.labels["dagNodeId"] == "cleanup"));

    let status = ctl.orchestrator.get_run_status(&run_id).await.unwrap();
    assert!(!status.live);
    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.nodes["bad"], NodeState::Failed);
    assert_eq!(status.nodes["join"], NodeState::Pending);
    assert_eq!(status.nodes["cleanup"], NodeState::Succeeded);
}

#[tokio::test]
async fn test_parallel_fan_out() {
    let ctl = Controller::new().await;
    let echo = ctl.builtin_def("echo").await;
    let mut dag = WorkflowDag::new("fan");
    dag.add_node("p", WorkflowNode::parallel("P"))
        .add_node("x", WorkflowNode::task("X", &echo))
        .add_node("y", WorkflowNode::task("Y", &echo))
        .add_node(
            "done",
            WorkflowNode::task("Done", &echo).with_trigger_rule(TriggerRule::AllDone),
        )
        .add_edge("p", "x")
        .add_edge("p", "y")
        .add_edge("x", "done")
        .add_edge("y", "done");
    let dag_id = ctl.store.create_dag(dag).await.unwrap();
    let run_id = ctl.orchestrator.start_dag_run(&dag_id).await.unwrap();

    ctl.orchestrator.tick().await;
    let status = ctl.orchestrator.get_run_status(&run_id).await.unwrap();
    assert!(status.live);
    assert_eq!(status.nodes["p"], NodeState::Succeeded);
    assert_eq!(status.nodes["x"], NodeState::Running);
    assert_eq!(status.nodes["y"], NodeState::Running);

    assert_eq!(ctl.drive_run(&run_id, 10).await, RunState::Succeeded);
    let status = ctl.orchestrator.get_run_status(&run_id).await.unwrap();
    assert_eq!(status.nodes["p"], NodeState::Succeeded);
    assert_eq!(status.nodes["done"], NodeState::Succeeded);
}

#[tokio::test]
async fn test_missing_definition_fails_run() {
    let ctl = Controller::new().await;
    let mut dag = WorkflowDag::new("broken");
    dag.add_node("a", WorkflowNode::task("A", "no-such-def"));
    let dag_id = ctl.store.create_dag(dag).await.unwrap();
    let run_id = ctl.orchestrator.start_dag_run(&dag_id).await.unwrap();

    assert_eq!(ctl.drive_run(&run_id, 3).await, RunState::Failed);
}

#[tokio::test]
async fn test_count_loop_then_downstream() {
    let ctl = Controller::new().await;
    let echo = ctl.builtin_def("echo").await;
    let mut dag = WorkflowDag::new("loop");
    dag.add_node(
        "l",
        WorkflowNode::looping("L", LoopCondition::count(3).with_loop_var("index")),
    )
    .add_node("body", WorkflowNode::task("Body", &echo))
    .add_node("after", WorkflowNode::task("After", &echo))
    .add_edge("l", "body")
    .add_edge("body", "after");
    let dag_id = ctl.store.create_dag(dag).await.unwrap();
    let run_id = ctl.orchestrator.start_dag_run(&dag_id).await.unwrap();

    assert_eq!(ctl.drive_run(&run_id, 20).await, RunState::Succeeded);

    let tasks = ctl.store.list_tasks().await.unwrap();
    let mut indexes: Vec<u64> = tasks
        .iter()
        .filter(|t| t.labels["dagNodeId"] == "body")
        .filter_map(|t| t.result.as_ref()?.get("index")?.as_u64())
        .collect();
    indexes.sort();
    assert_eq!(indexes, vec![0, 1, 2]);

    let body_done = tasks
        .iter()
        .filter(|t| t.labels["dagNodeId"] == "body")
        .filter_map(|t| t.finished_at)
        .max()
        .unwrap();
    let after = tasks.iter().find(|t| t.labels["dagNodeId"] == "after").unwrap();
    assert!(after.created_at >= body_done);

    let status = ctl.orchestrator.get_run_status(&run_id).await.unwrap();
    assert_eq!(status.nodes["l"], NodeState::Succeeded);
}
