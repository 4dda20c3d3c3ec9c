//! Failover sweeps over a small fleet.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetctl::config::Config;
use fleetctl::core::{Assignment, DesiredState, Node};
use fleetctl::orchestration::{FailoverLoop, NodeHealth};
use fleetctl::store::Store;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{test_config, Controller};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_800_000_000 + secs, 0).unwrap()
}

#[tokio::test]
async fn test_stale_node_assignments_move() {
    let ctl = Controller::new().await;
    ctl.store.upsert_node(Node::new("n", at(0))).await.unwrap();
    ctl.store.upsert_node(Node::new("m1", at(14))).await.unwrap();
    ctl.store.upsert_node(Node::new("m2", at(15))).await.unwrap();
    let mut wake_m1 = ctl.notifier.subscribe("m1");
    let mut wake_m2 = ctl.notifier.subscribe("m2");

    let first = Assignment::new("dep-1", "n");
    let second = Assignment::new("dep-2", "n");
    ctl.store.create_assignment(first.clone()).await.unwrap();
    ctl.store.create_assignment(second.clone()).await.unwrap();

    let health = ctl.failover.compute_health(at(16)).await.unwrap();
    assert_eq!(health["n"], NodeHealth::Unhealthy);
    assert_eq!(health["m1"], NodeHealth::Healthy);

    let report = ctl.failover.sweep_at(at(16)).await.unwrap();
    assert_eq!(report.unhealthy_nodes, vec!["n".to_string()]);
    assert_eq!(report.migrated.len(), 2);

    for old in [&first, &second] {
        let stopped = ctl.store.get_assignment(&old.instance_id).await.unwrap().unwrap();
        assert_eq!(stopped.desired, DesiredState::Stopped);
    }
    let mut moved = ctl.store.list_assignments_by_node("m1").await.unwrap();
    moved.extend(ctl.store.list_assignments_by_node("m2").await.unwrap());
    assert_eq!(moved.len(), 2);
    assert!(moved.iter().all(|a| a.desired == DesiredState::Running));
    assert!(moved
        .iter()
        .all(|a| a.instance_id != first.instance_id && a.instance_id != second.instance_id));
    assert!(wake_m1.try_recv() || wake_m2.try_recv());

    // Nothing left to move on the next sweep.
    let again = ctl.failover.sweep_at(at(17)).await.unwrap();
    assert!(again.migrated.is_empty());
}

#[tokio::test]
async fn test_disabled_loop_returns() {
    let ctl = Controller::new().await;
    let config = Config {
        failover_enabled: false,
        ..test_config()
    };
    let failover = Arc::new(FailoverLoop::new(
        ctl.store.clone(),
        ctl.notifier.clone(),
        &config,
    ));
    // Returns without waiting for the token.
    tokio::time::timeout(
        std::time::Duration::from_secs(1),
        failover.run(CancellationToken::new()),
    )
    .await
    .unwrap();
}
