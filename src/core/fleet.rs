//! Cluster-side records consumed by dispatch and failover: nodes,
//! assignments, service endpoints and worker capabilities.

use crate::core::labels::Labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A cluster node reporting heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub labels: Labels,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    pub fn new(id: &str, last_seen: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            ip: String::new(),
            labels: Labels::new(),
            last_seen,
        }
    }

    /// Whether the node heartbeat is within `ttl` of `now`.
    pub fn is_healthy(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.last_seen <= ttl,
            Err(_) => true,
        }
    }
}

/// Desired state of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
    /// Installed but not started.
    Deployed,
}

/// Binding of a workload instance to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub instance_id: String,
    /// Deployment (workload) this instance belongs to.
    pub task_id: String,
    pub node_id: String,
    pub desired: DesiredState,
    #[serde(default)]
    pub artifact_ref: String,
    #[serde(default)]
    pub start_cmd: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_version: String,
}

impl Assignment {
    /// A new `Running` assignment with a fresh instance id.
    pub fn new(task_id: &str, node_id: &str) -> Self {
        Self {
            instance_id: new_instance_id(),
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
            desired: DesiredState::Running,
            artifact_ref: String::new(),
            start_cmd: String::new(),
            app_name: String::new(),
            app_version: String::new(),
        }
    }

    /// Copy of this assignment bound to `node_id` under a new instance id.
    pub fn migrate_to(&self, node_id: &str) -> Self {
        Self {
            instance_id: new_instance_id(),
            node_id: node_id.to_string(),
            desired: DesiredState::Running,
            ..self.clone()
        }
    }
}

fn new_instance_id() -> String {
    format!("inst-{}", Uuid::new_v4().simple())
}

/// A discovered service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub service_name: String,
    pub instance_id: String,
    #[serde(default)]
    pub node_id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Labels,
    pub healthy: bool,
}

/// Worker reachable over plain HTTP callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpWorker {
    pub id: String,
    #[serde(default)]
    pub node_id: String,
    /// Callback URL receiving `POST {taskId, name, payload}`.
    pub url: String,
    /// Supported task names.
    pub tasks: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
    pub last_seen: DateTime<Utc>,
}

impl HttpWorker {
    pub fn supports(&self, task_name: &str) -> bool {
        self.tasks.iter().any(|t| t == task_name)
    }
}

/// Worker connected over the streaming channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedWorker {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_version: String,
    /// Peer address of the stream.
    #[serde(default)]
    pub address: String,
    pub tasks: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
    pub last_seen: DateTime<Utc>,
}
