//! Typed correlation keys carried in task labels.
//!
//! Task labels are a free-form string map, but only a handful of keys tie a
//! task back to the workflow machinery. This module keeps those keys in one
//! place and parses them into a [`Correlation`] at the boundary.

use std::collections::BTreeMap;

/// Free-form string labels.
pub type Labels = BTreeMap<String, String>;

/// Sequential workflow run id.
pub const RUN_ID: &str = "runId";
/// Sequential workflow step id.
pub const STEP_ID: &str = "stepId";
/// Task definition a task was built from.
pub const DEF_ID: &str = "defId";
/// DAG run id.
pub const DAG_RUN_ID: &str = "dagRunId";
/// DAG node id.
pub const DAG_NODE_ID: &str = "dagNodeId";
/// DAG node display name.
pub const DAG_NODE_NAME: &str = "dagNodeName";
/// Zero-based loop iteration a loop body task was created for.
pub const DAG_LOOP_ITERATION: &str = "dagLoopIteration";

/// How a task relates to a workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Task created for one step of a sequential workflow run.
    Step { run_id: String, step_id: String },
    /// Task created for one node of a DAG run.
    DagNode { run_id: String, node_id: String },
}

impl Correlation {
    /// Parse the correlation out of a label map.
    ///
    /// Returns `None` when the task is not part of any workflow. DAG keys
    /// win when both sets are present.
    pub fn from_labels(labels: &Labels) -> Option<Self> {
        let get = |key: &str| labels.get(key).filter(|v| !v.is_empty()).cloned();

        if let (Some(run_id), Some(node_id)) = (get(DAG_RUN_ID), get(DAG_NODE_ID)) {
            return Some(Correlation::DagNode { run_id, node_id });
        }
        if let (Some(run_id), Some(step_id)) = (get(RUN_ID), get(STEP_ID)) {
            return Some(Correlation::Step { run_id, step_id });
        }
        None
    }

    /// Write the correlation keys into a label map.
    pub fn apply(&self, labels: &mut Labels) {
        match self {
            Correlation::Step { run_id, step_id } => {
                labels.insert(RUN_ID.to_string(), run_id.clone());
                labels.insert(STEP_ID.to_string(), step_id.clone());
            }
            Correlation::DagNode { run_id, node_id } => {
                labels.insert(DAG_RUN_ID.to_string(), run_id.clone());
                labels.insert(DAG_NODE_ID.to_string(), node_id.clone());
            }
        }
    }

    /// The run this correlation belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Correlation::Step { run_id, .. } | Correlation::DagNode { run_id, .. } => run_id,
        }
    }
}
