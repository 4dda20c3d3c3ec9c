//! Failover loop.
//!
//! Every sweep classifies nodes by heartbeat age. Each `Running`
//! assignment on an unhealthy node is stopped and re-created under a fresh
//! instance id on a randomly chosen healthy node, which is then woken
//! through the notifier.

use crate::config::Config;
use crate::core::fleet::{Assignment, DesiredState};
use crate::error::Result;
use crate::notify::Notifier;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Heartbeat health of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverReport {
    pub unhealthy_nodes: Vec<String>,
    /// `(old instance id, new instance id, target node)`.
    pub migrated: Vec<(String, String, String)>,
    /// Assignments left in place for lack of a target.
    pub skipped: usize,
}

pub struct FailoverLoop {
    store: Arc<dyn Store>,
    notifier: Notifier,
    ttl: Duration,
    interval: Duration,
    jitter_max: Duration,
    enabled: bool,
}

impl FailoverLoop {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier, config: &Config) -> Self {
        Self {
            store,
            notifier,
            ttl: config.heartbeat_ttl(),
            interval: config.failover_interval(),
            jitter_max: config.failover_jitter_max(),
            enabled: config.failover_enabled,
        }
    }

    /// Health of every known node as of `now`.
    pub async fn compute_health(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, NodeHealth>> {
        let nodes = self.store.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .map(|n| {
                let health = if n.is_healthy(now, self.ttl) {
                    NodeHealth::Healthy
                } else {
                    NodeHealth::Unhealthy
                };
                (n.id, health)
            })
            .collect())
    }

    pub async fn sweep(&self) -> Result<FailoverReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<FailoverReport> {
        let health = self.compute_health(now).await?;
        let mut report = FailoverReport::default();

        let healthy: Vec<String> = health
            .iter()
            .filter(|(_, h)| **h == NodeHealth::Healthy)
            .map(|(id, _)| id.clone())
            .collect();
        report.unhealthy_nodes = health
            .iter()
            .filter(|(_, h)| **h == NodeHealth::Unhealthy)
            .map(|(id, _)| id.clone())
            .collect();

        if healthy.is_empty() {
            if !report.unhealthy_nodes.is_empty() {
                debug!(unhealthy = report.unhealthy_nodes.len(), "no healthy nodes, nothing to migrate to");
            }
            return Ok(report);
        }

        let mut first = true;
        for bad in report.unhealthy_nodes.clone() {
            let assignments = match self.store.list_assignments_by_node(&bad).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(node_id = %bad, error = %e, "failed to list assignments");
                    continue;
                }
            };
            let candidates: Vec<&String> = healthy.iter().filter(|id| **id != bad).collect();

            for assignment in assignments {
                if assignment.desired != DesiredState::Running {
                    continue;
                }
                let target = {
                    let mut rng = rand::thread_rng();
                    candidates.choose(&mut rng).map(|t| t.to_string())
                };
                let Some(target) = target else {
                    report.skipped += 1;
                    continue;
                };

                if !first {
                    self.jitter().await;
                }
                first = false;

                match self.migrate(&assignment, &target).await {
                    Ok(new_id) => {
                        info!(
                            instance_id = %assignment.instance_id,
                            deployment = %assignment.task_id,
                            from = %bad,
                            to = %target,
                            new_instance_id = %new_id,
                            "migrated assignment"
                        );
                        report
                            .migrated
                            .push((assignment.instance_id.clone(), new_id, target));
                    }
                    Err(e) => {
                        warn!(instance_id = %assignment.instance_id, to = %target, error = %e, "migration failed");
                    }
                }
            }
        }
        Ok(report)
    }

    async fn migrate(&self, assignment: &Assignment, target: &str) -> Result<String> {
        self.store
            .set_assignment_desired(&assignment.instance_id, DesiredState::Stopped)
            .await?;
        let moved = assignment.migrate_to(target);
        let new_id = moved.instance_id.clone();
        self.store.create_assignment(moved).await?;
        self.notifier.publish(target);
        Ok(new_id)
    }

    async fn jitter(&self) {
        let max = self.jitter_max.as_millis() as u64;
        if max == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(0..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Sweep until `shutdown` fires. Returns at once when failover is
    /// disabled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.enabled {
            info!("failover disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, ttl = ?self.ttl, "failover loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "failover sweep failed");
                    }
                }
            }
        }
    }
}
