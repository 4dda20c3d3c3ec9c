//! Workflow DAG definitions.
//!
//! A [`WorkflowDag`] is the immutable description of a multi-step workflow:
//! nodes keyed by id, typed edges between them, and the set of start nodes.
//! Structural checks (dangling edges, cycles, misplaced branch edges) run
//! over a petgraph view of the definition.
//!
//! A loop node owns the task nodes directly below it: its body. Each
//! iteration re-creates a task for every body node; nodes downstream of the
//! body run once the loop is done.

use crate::core::labels::Labels;
use crate::core::value::{BranchCondition, Operator};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Kind of DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Runs a task built from a task definition.
    Task,
    /// Routes execution along `true`/`false` edges.
    Branch,
    /// Pure fan-out control node.
    Parallel,
    /// Re-runs its body of task nodes while its condition holds.
    Loop,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Task => write!(f, "task"),
            NodeKind::Branch => write!(f, "branch"),
            NodeKind::Parallel => write!(f, "parallel"),
            NodeKind::Loop => write!(f, "loop"),
        }
    }
}

/// Policy deciding when a node with predecessors becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every predecessor succeeded.
    #[default]
    AllSuccess,
    /// At least one predecessor succeeded.
    OneSuccess,
    /// Every predecessor failed.
    AllFailed,
    /// At least one predecessor failed.
    OneFailed,
    /// Every predecessor reached a terminal state, skipped included.
    AllDone,
    /// Every predecessor is terminal and none failed.
    NoneFailed,
}

/// Edge type; `true`/`false` only make sense leaving a branch node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    #[default]
    #[serde(alias = "")]
    Normal,
    True,
    False,
}

impl EdgeType {
    /// The branch outcome this edge follows, if it is conditional.
    pub fn branch_value(self) -> Option<bool> {
        match self {
            EdgeType::Normal => None,
            EdgeType::True => Some(true),
            EdgeType::False => Some(false),
        }
    }
}

/// Hard cap on iterations of a single loop node.
pub const MAX_LOOP_ITERATIONS: u32 = 1000;

/// How a loop node decides whether to run another iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    /// Run the body a fixed number of times.
    Count,
    /// Run the body, then again while a result field matches.
    Condition,
}

/// Loop node configuration.
///
/// `condition` loops compare a field of `source_task`'s newest result after
/// every iteration, so the body always runs at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopCondition {
    #[serde(rename = "type")]
    pub kind: LoopKind,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub source_task: String,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub value: String,
    /// Payload key receiving the zero-based iteration index.
    #[serde(default)]
    pub loop_var_name: String,
}

impl LoopCondition {
    pub fn count(count: u32) -> Self {
        Self {
            kind: LoopKind::Count,
            count,
            source_task: String::new(),
            field: String::new(),
            operator: None,
            value: String::new(),
            loop_var_name: String::new(),
        }
    }

    /// Repeat while `condition` holds on its source's newest result.
    pub fn repeat_while(condition: BranchCondition) -> Self {
        Self {
            kind: LoopKind::Condition,
            source_task: condition.source_task,
            field: condition.field,
            operator: Some(condition.operator),
            value: condition.value,
            ..Self::count(0)
        }
    }

    pub fn with_loop_var(mut self, name: &str) -> Self {
        self.loop_var_name = name.to_string();
        self
    }

    /// The comparison of a `condition` loop.
    pub fn comparison(&self) -> Result<BranchCondition> {
        if self.source_task.is_empty() {
            return Err(Error::Validation(
                "loop condition requires sourceTask".to_string(),
            ));
        }
        let operator = self.operator.ok_or_else(|| {
            Error::Validation("loop condition requires operator".to_string())
        })?;
        Ok(BranchCondition::new(
            &self.source_task,
            &self.field,
            operator,
            &self.value,
        ))
    }
}

/// A node of a workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trigger_rule: TriggerRule,
    /// Task definition for `task` nodes.
    #[serde(default)]
    pub task_def_id: Option<String>,
    /// Payload overriding the definition's default payload.
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// Condition for `branch` nodes.
    #[serde(default)]
    pub condition: Option<BranchCondition>,
    /// Configuration for `loop` nodes.
    #[serde(default)]
    pub loop_condition: Option<LoopCondition>,
}

impl WorkflowNode {
    /// A task node referencing the given definition.
    pub fn task(name: &str, task_def_id: &str) -> Self {
        Self {
            kind: NodeKind::Task,
            name: name.to_string(),
            trigger_rule: TriggerRule::AllSuccess,
            task_def_id: Some(task_def_id.to_string()),
            payload: None,
            timeout_sec: 0,
            max_retries: 0,
            condition: None,
            loop_condition: None,
        }
    }

    /// A branch node with the given condition.
    pub fn branch(name: &str, condition: BranchCondition) -> Self {
        Self {
            kind: NodeKind::Branch,
            condition: Some(condition),
            task_def_id: None,
            ..Self::task(name, "")
        }
    }

    /// A parallel fan-out node.
    pub fn parallel(name: &str) -> Self {
        Self {
            kind: NodeKind::Parallel,
            task_def_id: None,
            ..Self::task(name, "")
        }
    }

    /// A loop node with the given configuration.
    pub fn looping(name: &str, condition: LoopCondition) -> Self {
        Self {
            kind: NodeKind::Loop,
            loop_condition: Some(condition),
            task_def_id: None,
            ..Self::task(name, "")
        }
    }

    pub fn with_trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_timeout(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub edge_type: EdgeType,
}

/// Immutable workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDag {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Nodes keyed by node id.
    pub nodes: BTreeMap<String, WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default)]
    pub start_nodes: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    2
}

impl WorkflowDag {
    /// Create an empty definition with a generated id.
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            version: default_version(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            start_nodes: Vec::new(),
            labels: Labels::new(),
            created_at: Utc::now(),
        }
    }

    /// Add a node, replacing any node with the same id.
    pub fn add_node(&mut self, id: &str, node: WorkflowNode) -> &mut Self {
        self.nodes.insert(id.to_string(), node);
        self
    }

    /// Add a plain edge.
    pub fn add_edge(&mut self, from: &str, to: &str) -> &mut Self {
        self.add_typed_edge(from, to, EdgeType::Normal)
    }

    /// Add an edge with an explicit type.
    pub fn add_typed_edge(&mut self, from: &str, to: &str, edge_type: EdgeType) -> &mut Self {
        self.edges.push(WorkflowEdge {
            from: from.to_string(),
            to: to.to_string(),
            edge_type,
        });
        self
    }

    /// Ids of the direct predecessors of a node.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Outgoing edges of a node.
    pub fn outgoing(&self, id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Ids of the direct successors of a node.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.outgoing(id).into_iter().map(|e| e.to.as_str()).collect()
    }

    /// Body of a loop node: its task successors. Empty for other nodes.
    pub fn loop_body(&self, id: &str) -> Vec<&str> {
        if self.nodes.get(id).map(|n| n.kind) != Some(NodeKind::Loop) {
            return Vec::new();
        }
        self.successors(id)
            .into_iter()
            .filter(|s| self.nodes.get(*s).map(|n| n.kind) == Some(NodeKind::Task))
            .collect()
    }

    /// The loop node owning `id`, if `id` is part of a loop body.
    pub fn loop_owner(&self, id: &str) -> Option<&str> {
        if self.nodes.get(id).map(|n| n.kind) != Some(NodeKind::Task) {
            return None;
        }
        self.predecessors(id)
            .into_iter()
            .find(|p| self.nodes.get(*p).map(|n| n.kind) == Some(NodeKind::Loop))
    }

    /// Build the petgraph view of this definition.
    ///
    /// Edges naming unknown nodes are rejected.
    fn graph(&self) -> Result<(DiGraph<&str, EdgeType>, HashMap<&str, NodeIndex>)> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in self.nodes.keys() {
            index.insert(id.as_str(), graph.add_node(id.as_str()));
        }
        for edge in &self.edges {
            let from = index.get(edge.from.as_str()).ok_or_else(|| {
                Error::Validation(format!("edge references unknown node: {}", edge.from))
            })?;
            let to = index.get(edge.to.as_str()).ok_or_else(|| {
                Error::Validation(format!("edge references unknown node: {}", edge.to))
            })?;
            graph.add_edge(*from, *to, edge.edge_type);
        }
        Ok((graph, index))
    }

    /// Check the definition is structurally sound.
    ///
    /// # Errors
    /// Returns `Error::Validation` if:
    /// - the DAG has no nodes
    /// - an edge or start node references an unknown node
    /// - the graph contains a cycle
    /// - a task node lacks a definition id, or a branch node lacks a condition
    /// - a loop node lacks a usable condition or a body, or a body node has
    ///   predecessors besides its loop
    /// - a `true`/`false` edge leaves a non-branch node
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Validation(format!("DAG {} has no nodes", self.name)));
        }
        let (graph, _) = self.graph()?;
        if is_cyclic_directed(&graph) {
            return Err(Error::Validation(format!("DAG {} contains a cycle", self.name)));
        }
        for start in &self.start_nodes {
            if !self.nodes.contains_key(start) {
                return Err(Error::Validation(format!(
                    "start node not found: {}",
                    start
                )));
            }
        }
        for (id, node) in &self.nodes {
            match node.kind {
                NodeKind::Task => {
                    if node.task_def_id.as_deref().unwrap_or("").is_empty() {
                        return Err(Error::Validation(format!(
                            "task node {} has no task definition",
                            id
                        )));
                    }
                }
                NodeKind::Branch => {
                    let cond = node.condition.as_ref().ok_or_else(|| {
                        Error::Validation(format!("branch node {} has no condition", id))
                    })?;
                    if !self.nodes.contains_key(&cond.source_task) {
                        return Err(Error::Validation(format!(
                            "branch node {} references unknown source task {}",
                            id, cond.source_task
                        )));
                    }
                }
                NodeKind::Parallel => {}
                NodeKind::Loop => self.validate_loop(id, node)?,
            }
        }
        for edge in &self.edges {
            let from_kind = self.nodes.get(&edge.from).map(|n| n.kind);
            if edge.edge_type != EdgeType::Normal && from_kind != Some(NodeKind::Branch) {
                return Err(Error::Validation(format!(
                    "{:?} edge from non-branch node {}",
                    edge.edge_type, edge.from
                )));
            }
        }
        Ok(())
    }

    fn validate_loop(&self, id: &str, node: &WorkflowNode) -> Result<()> {
        let cond = node
            .loop_condition
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("loop node {} has no condition", id)))?;
        match cond.kind {
            LoopKind::Count if cond.count == 0 => {
                return Err(Error::Validation(format!(
                    "loop node {} has invalid count: 0",
                    id
                )));
            }
            LoopKind::Count => {}
            LoopKind::Condition => {
                let comparison = cond.comparison()?;
                if !self.nodes.contains_key(&comparison.source_task) {
                    return Err(Error::Validation(format!(
                        "loop node {} references unknown source task {}",
                        id, comparison.source_task
                    )));
                }
            }
        }
        let body = self.loop_body(id);
        if body.is_empty() {
            return Err(Error::Validation(format!("loop node {} has no body", id)));
        }
        for member in body {
            if self.predecessors(member).len() > 1 {
                return Err(Error::Validation(format!(
                    "loop body node {} must have loop {} as its only predecessor",
                    member, id
                )));
            }
        }
        Ok(())
    }

    /// Node ids in an order where every node follows its predecessors.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let (graph, _) = self.graph()?;
        let sorted = toposort(&graph, None).map_err(|cycle| {
            let id = graph.node_weight(cycle.node_id()).copied().unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at node: {}", id))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|i| graph.node_weight(i).map(|id| id.to_string()))
            .collect())
    }
}
