//! Per-run DAG state machine.
//!
//! A [`DagExecutor`] owns the node states of one live DAG run. Each
//! [`tick`](DagExecutor::tick) first syncs node states from the tasks it
//! created, then schedules every pending node whose trigger rule is
//! satisfied. Task nodes create a task; branch and parallel nodes are
//! resolved in place.
//!
//! A loop node stays `Running` while it iterates. Its body nodes are never
//! scheduled on their own: each iteration resets them and creates fresh
//! tasks, and once every body node is terminal the loop either starts the
//! next iteration, succeeds, or fails.
//!
//! A pending node whose rule can no longer be satisfied is *blocked*: it
//! stays `Pending` forever, and [`is_finished`](DagExecutor::is_finished)
//! treats it as settled so the run still terminates.

use crate::core::dag::{
    LoopKind, NodeKind, TriggerRule, WorkflowDag, WorkflowNode, MAX_LOOP_ITERATIONS,
};
use crate::core::labels::{self, Correlation};
use crate::core::task::{Task, TaskId, TaskState};
use crate::core::workflow::RunState;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Execution state of one DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped
        )
    }

    /// Node state implied by a task state. `None` while the task has not
    /// started.
    pub fn from_task(state: TaskState) -> Option<Self> {
        match state {
            TaskState::Queued | TaskState::Pending => None,
            TaskState::Running => Some(NodeState::Running),
            TaskState::Succeeded => Some(NodeState::Succeeded),
            TaskState::Failed | TaskState::Timeout | TaskState::Canceled => {
                Some(NodeState::Failed)
            }
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Whether `rule` is satisfied by the given predecessor states.
///
/// An empty predecessor list satisfies every rule.
pub fn rule_satisfied(rule: TriggerRule, preds: &[NodeState]) -> bool {
    if preds.is_empty() {
        return true;
    }
    let count = |s: NodeState| preds.iter().filter(|p| **p == s).count();
    let all_done = preds.iter().all(|p| p.is_terminal());
    match rule {
        TriggerRule::AllSuccess => count(NodeState::Succeeded) == preds.len(),
        TriggerRule::OneSuccess => count(NodeState::Succeeded) > 0,
        TriggerRule::AllFailed => count(NodeState::Failed) == preds.len(),
        TriggerRule::OneFailed => count(NodeState::Failed) > 0,
        TriggerRule::AllDone => all_done,
        TriggerRule::NoneFailed => all_done && count(NodeState::Failed) == 0,
    }
}

/// Merge a JSON object printed on a result's `stdout` into the result.
fn merge_stdout_json(mut result: Value) -> Value {
    let parsed = result
        .get("stdout")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| serde_json::from_str::<Value>(s.trim()).ok());
    if let (Some(Value::Object(extra)), Some(object)) = (parsed, result.as_object_mut()) {
        object.extend(extra);
    }
    result
}

/// Ordering key for tasks of the same node: creation time, then loop iteration.
fn newness(task: &Task) -> (chrono::DateTime<chrono::Utc>, Option<u32>) {
    let iteration = task
        .labels
        .get(labels::DAG_LOOP_ITERATION)
        .and_then(|v| v.parse().ok());
    (task.created_at, iteration)
}

/// Set `name` to the iteration index on an object payload. A null payload
/// becomes an object; other payloads are left as they are.
fn inject_loop_var(payload: &mut Value, name: &str, iteration: u32) {
    if payload.is_null() {
        *payload = Value::Object(Default::default());
    }
    if let Some(object) = payload.as_object_mut() {
        object.insert(name.to_string(), Value::from(iteration));
    }
}

/// In-memory state of one live DAG run.
#[derive(Debug, Clone)]
pub struct DagExecutor {
    run_id: String,
    dag: WorkflowDag,
    /// Scheduling order; topological when the definition allows it.
    order: Vec<String>,
    node_states: BTreeMap<String, NodeState>,
    task_ids: BTreeMap<String, TaskId>,
    results: HashMap<TaskId, Value>,
    node_errors: BTreeMap<String, String>,
    branch_outcomes: BTreeMap<String, bool>,
    /// Iterations started per loop node.
    loop_iterations: BTreeMap<String, u32>,
}

impl DagExecutor {
    /// A fresh executor with every node `Pending`.
    pub fn new(run_id: &str, dag: WorkflowDag) -> Self {
        let order = dag
            .topological_order()
            .unwrap_or_else(|_| dag.nodes.keys().cloned().collect());
        let node_states = dag
            .nodes
            .keys()
            .map(|id| (id.clone(), NodeState::Pending))
            .collect();
        Self {
            run_id: run_id.to_string(),
            dag,
            order,
            node_states,
            task_ids: BTreeMap::new(),
            results: HashMap::new(),
            node_errors: BTreeMap::new(),
            branch_outcomes: BTreeMap::new(),
            loop_iterations: BTreeMap::new(),
        }
    }

    /// Rebuild an executor from the tasks a run already created.
    ///
    /// Each node is bound to its newest task and marked `Running`, so the
    /// next tick's sync settles its real state and reloads its result. A loop
    /// with body tasks resumes `Running` at the newest iteration they carry.
    pub fn restore(run_id: &str, dag: WorkflowDag, tasks: &[Task]) -> Self {
        let mut executor = Self::new(run_id, dag);
        let mut newest: HashMap<String, &Task> = HashMap::new();
        for task in tasks {
            let Some(Correlation::DagNode { run_id: r, node_id }) = task.correlation() else {
                continue;
            };
            if r != run_id || !executor.dag.nodes.contains_key(&node_id) {
                continue;
            }
            match newest.get(&node_id) {
                Some(existing) if newness(existing) >= newness(task) => {}
                _ => {
                    newest.insert(node_id, task);
                }
            }
        }
        for (node_id, task) in &newest {
            executor.task_ids.insert(node_id.clone(), task.id);
            executor.node_states.insert(node_id.clone(), NodeState::Running);
        }

        let mut resumed_loops = Vec::new();
        for (loop_id, node) in &executor.dag.nodes {
            if node.kind != NodeKind::Loop {
                continue;
            }
            let started = executor
                .dag
                .loop_body(loop_id)
                .into_iter()
                .filter_map(|member| newest.get(member))
                .map(|task| {
                    task.labels
                        .get(labels::DAG_LOOP_ITERATION)
                        .and_then(|v| v.parse::<u32>().ok())
                        .map_or(1, |i| i + 1)
                })
                .max();
            if let Some(started) = started {
                resumed_loops.push((loop_id.clone(), started));
            }
        }
        for (loop_id, started) in resumed_loops {
            executor.loop_iterations.insert(loop_id.clone(), started);
            executor.node_states.insert(loop_id, NodeState::Running);
        }
        executor
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dag(&self) -> &WorkflowDag {
        &self.dag
    }

    pub fn node_states(&self) -> BTreeMap<String, NodeState> {
        self.node_states.clone()
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.node_states.get(node_id).copied()
    }

    /// Task created for each task node so far.
    pub fn task_ids(&self) -> &BTreeMap<String, TaskId> {
        &self.task_ids
    }

    /// Cached result of a node's task, once it succeeded.
    pub fn result_for(&self, node_id: &str) -> Option<&Value> {
        self.task_ids
            .get(node_id)
            .and_then(|id| self.results.get(id))
    }

    /// Failure reason per failed node.
    pub fn node_errors(&self) -> &BTreeMap<String, String> {
        &self.node_errors
    }

    /// Evaluated outcome per branch node.
    pub fn branch_outcomes(&self) -> &BTreeMap<String, bool> {
        &self.branch_outcomes
    }

    /// Iterations started per loop node.
    pub fn loop_iterations(&self) -> &BTreeMap<String, u32> {
        &self.loop_iterations
    }

    /// Sync node states from tasks, then schedule ready nodes.
    ///
    /// Returns the number of nodes scheduled. Store failures are logged and
    /// confined to the node they hit.
    pub async fn tick(&mut self, store: &dyn Store) -> usize {
        self.sync(store).await;

        let mut scheduled = self.advance_loops(store).await;
        for node_id in self.order.clone() {
            if self.node_states.get(&node_id) != Some(&NodeState::Pending) {
                continue;
            }
            if self.dag.loop_owner(&node_id).is_some() {
                continue;
            }
            let Some(node) = self.dag.nodes.get(&node_id).cloned() else {
                continue;
            };
            if !self.is_ready(&node_id, node.trigger_rule) {
                continue;
            }
            self.node_states.insert(node_id.clone(), NodeState::Ready);
            match node.kind {
                NodeKind::Task => self.schedule_task(&node_id, &node, store).await,
                NodeKind::Branch => self.schedule_branch(&node_id, &node),
                NodeKind::Parallel => {
                    debug!(run_id = %self.run_id, node_id = %node_id, "parallel node activated");
                    self.node_states.insert(node_id.clone(), NodeState::Succeeded);
                }
                NodeKind::Loop => scheduled += self.start_loop(&node_id, &node, store).await,
            }
            scheduled += 1;
        }
        scheduled
    }

    async fn sync(&mut self, store: &dyn Store) {
        let running: Vec<(String, TaskId)> = self
            .task_ids
            .iter()
            .filter(|(node, _)| self.node_states.get(*node) == Some(&NodeState::Running))
            .map(|(node, id)| (node.clone(), *id))
            .collect();

        for (node_id, task_id) in running {
            let task = match store.get_task(&task_id).await {
                Ok(Some(t)) => t,
                Ok(None) => continue,
                Err(e) => {
                    warn!(run_id = %self.run_id, %node_id, error = %e, "failed to read node task");
                    continue;
                }
            };
            let Some(state) = NodeState::from_task(task.state) else {
                continue;
            };
            match state {
                NodeState::Succeeded => {
                    let result = merge_stdout_json(task.result.unwrap_or(Value::Null));
                    self.results.insert(task_id, result);
                    self.node_errors.remove(&node_id);
                }
                NodeState::Failed => {
                    self.node_errors.insert(node_id.clone(), task.error);
                }
                _ => {}
            }
            self.node_states.insert(node_id, state);
        }
    }

    fn predecessor_states(&self, node_id: &str) -> Vec<NodeState> {
        self.dag
            .predecessors(node_id)
            .into_iter()
            .map(|p| self.node_states.get(p).copied().unwrap_or(NodeState::Pending))
            .collect()
    }

    fn is_ready(&self, node_id: &str, rule: TriggerRule) -> bool {
        rule_satisfied(rule, &self.predecessor_states(node_id))
    }

    fn fail_node(&mut self, node_id: &str, reason: String) {
        warn!(run_id = %self.run_id, node_id, %reason, "node failed");
        self.node_states.insert(node_id.to_string(), NodeState::Failed);
        self.node_errors.insert(node_id.to_string(), reason);
    }

    async fn schedule_task(&mut self, node_id: &str, node: &WorkflowNode, store: &dyn Store) {
        let def_id = node.task_def_id.clone().unwrap_or_default();
        let definition = match store.get_task_def(&def_id).await {
            Ok(Some(def)) => def,
            Ok(None) => {
                return self.fail_node(node_id, format!("task definition not found: {}", def_id))
            }
            Err(e) => return self.fail_node(node_id, e.to_string()),
        };

        let mut task = definition.instantiate(node.payload.clone(), node.timeout_sec);
        task.max_retries = node.max_retries;
        Correlation::DagNode {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
        }
        .apply(&mut task.labels);
        task.labels
            .insert(labels::DAG_NODE_NAME.to_string(), node.name.clone());
        if let Some((var, iteration)) = self.loop_iteration_of(node_id) {
            task.labels
                .insert(labels::DAG_LOOP_ITERATION.to_string(), iteration.to_string());
            if !var.is_empty() {
                inject_loop_var(&mut task.payload, &var, iteration);
            }
        }

        match store.create_task(task).await {
            Ok(task_id) => {
                debug!(run_id = %self.run_id, node_id, %task_id, "scheduled task node");
                self.task_ids.insert(node_id.to_string(), task_id);
                self.node_states
                    .insert(node_id.to_string(), NodeState::Running);
            }
            Err(e) => self.fail_node(node_id, e.to_string()),
        }
    }

    fn schedule_branch(&mut self, node_id: &str, node: &WorkflowNode) {
        let Some(condition) = node.condition.as_ref() else {
            return self.fail_node(node_id, "branch node missing condition".to_string());
        };
        let result = match self.source_result(&condition.source_task) {
            Ok(r) => r,
            Err(reason) => return self.fail_node(node_id, reason),
        };
        let outcome = match condition.evaluate(result) {
            Ok(b) => b,
            Err(e) => return self.fail_node(node_id, e.to_string()),
        };

        self.node_states
            .insert(node_id.to_string(), NodeState::Succeeded);
        self.branch_outcomes.insert(node_id.to_string(), outcome);
        debug!(run_id = %self.run_id, node_id, outcome, "branch evaluated");

        let not_taken: Vec<String> = self
            .dag
            .outgoing(node_id)
            .into_iter()
            .filter(|e| e.edge_type.branch_value() == Some(!outcome))
            .map(|e| e.to.clone())
            .collect();
        for target in not_taken {
            self.skip_from(&target);
        }
    }

    /// Cached result of the newest task of node `source`.
    fn source_result(&self, source: &str) -> Result<&Value, String> {
        let task_id = self
            .task_ids
            .get(source)
            .ok_or_else(|| format!("source task not found: {}", source))?;
        self.results
            .get(task_id)
            .ok_or_else(|| "source task result not available".to_string())
    }

    // ========== Loops ==========

    /// Check the loop's configuration and start its first iteration.
    ///
    /// Returns the number of body tasks scheduled.
    async fn start_loop(&mut self, node_id: &str, node: &WorkflowNode, store: &dyn Store) -> usize {
        let Some(condition) = node.loop_condition.as_ref() else {
            self.fail_node(node_id, "loop node missing condition".to_string());
            return 0;
        };
        match condition.kind {
            LoopKind::Count if condition.count == 0 => {
                self.fail_node(node_id, "invalid loop count: 0".to_string());
                return 0;
            }
            LoopKind::Count => {}
            LoopKind::Condition => {
                if let Err(e) = condition.comparison() {
                    self.fail_node(node_id, e.to_string());
                    return 0;
                }
            }
        }
        self.node_states
            .insert(node_id.to_string(), NodeState::Running);
        self.begin_iteration(node_id, store).await
    }

    /// Reset the loop's body and create a task for every body node.
    async fn begin_iteration(&mut self, loop_id: &str, store: &dyn Store) -> usize {
        let iteration = self.loop_iterations.get(loop_id).copied().unwrap_or(0);
        self.loop_iterations
            .insert(loop_id.to_string(), iteration + 1);
        debug!(run_id = %self.run_id, loop_id, iteration, "loop iteration started");

        let body: Vec<String> = self
            .dag
            .loop_body(loop_id)
            .into_iter()
            .map(str::to_string)
            .collect();
        for member in &body {
            self.task_ids.remove(member);
            self.node_errors.remove(member);
            self.node_states.insert(member.clone(), NodeState::Ready);
            if let Some(node) = self.dag.nodes.get(member).cloned() {
                self.schedule_task(member, &node, store).await;
            }
        }
        body.len()
    }

    /// Settle every running loop whose body is done.
    async fn advance_loops(&mut self, store: &dyn Store) -> usize {
        let running: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.dag.nodes.get(*id).map(|n| n.kind) == Some(NodeKind::Loop)
                    && self.node_states.get(*id) == Some(&NodeState::Running)
            })
            .cloned()
            .collect();

        let mut scheduled = 0;
        for loop_id in running {
            let body: Vec<(String, NodeState)> = self
                .dag
                .loop_body(&loop_id)
                .into_iter()
                .map(|m| {
                    let state = self.node_states.get(m).copied().unwrap_or(NodeState::Pending);
                    (m.to_string(), state)
                })
                .collect();
            // Body nodes an interrupted iteration never created.
            let missing: Vec<String> = body
                .iter()
                .filter(|(_, s)| *s == NodeState::Pending)
                .map(|(m, _)| m.clone())
                .collect();
            for member in &missing {
                if let Some(node) = self.dag.nodes.get(member).cloned() {
                    self.node_states.insert(member.clone(), NodeState::Ready);
                    self.schedule_task(member, &node, store).await;
                    scheduled += 1;
                }
            }
            if body.iter().any(|(_, s)| !s.is_terminal()) {
                continue;
            }
            if let Some((member, _)) = body.iter().find(|(_, s)| *s == NodeState::Failed) {
                self.fail_node(&loop_id, format!("loop body node failed: {}", member));
                continue;
            }
            match self.loop_continues(&loop_id) {
                Err(reason) => self.fail_node(&loop_id, reason),
                Ok(false) => {
                    debug!(
                        run_id = %self.run_id,
                        loop_id = %loop_id,
                        iterations = self.loop_iterations.get(&loop_id).copied().unwrap_or(0),
                        "loop completed"
                    );
                    self.node_states.insert(loop_id, NodeState::Succeeded);
                }
                Ok(true) => {
                    let started = self.loop_iterations.get(&loop_id).copied().unwrap_or(0);
                    if started >= MAX_LOOP_ITERATIONS {
                        self.fail_node(
                            &loop_id,
                            format!("loop exceeded {} iterations", MAX_LOOP_ITERATIONS),
                        );
                    } else {
                        scheduled += self.begin_iteration(&loop_id, store).await;
                    }
                }
            }
        }
        scheduled
    }

    /// Whether a loop whose body just finished runs again.
    fn loop_continues(&self, loop_id: &str) -> Result<bool, String> {
        let condition = self
            .dag
            .nodes
            .get(loop_id)
            .and_then(|n| n.loop_condition.as_ref())
            .ok_or_else(|| "loop node missing condition".to_string())?;
        let started = self.loop_iterations.get(loop_id).copied().unwrap_or(0);
        match condition.kind {
            LoopKind::Count => Ok(started < condition.count),
            LoopKind::Condition => {
                let comparison = condition.comparison().map_err(|e| e.to_string())?;
                let result = self.source_result(&comparison.source_task)?;
                comparison.evaluate(result).map_err(|e| e.to_string())
            }
        }
    }

    /// Loop variable name and zero-based iteration for a loop body node.
    fn loop_iteration_of(&self, node_id: &str) -> Option<(String, u32)> {
        let owner = self.dag.loop_owner(node_id)?;
        let started = self.loop_iterations.get(owner).copied()?;
        let var = self
            .dag
            .nodes
            .get(owner)
            .and_then(|n| n.loop_condition.as_ref())
            .map(|c| c.loop_var_name.clone())
            .unwrap_or_default();
        Some((var, started.saturating_sub(1)))
    }

    /// Skip `start` and every pending node downstream of it. Nodes that
    /// already left `Pending` are left alone and not walked through.
    fn skip_from(&mut self, start: &str) {
        let mut stack = vec![start.to_string()];
        while let Some(id) = stack.pop() {
            match self.node_states.get(&id) {
                Some(NodeState::Pending) | Some(NodeState::Ready) => {}
                _ => continue,
            }
            self.node_states.insert(id.clone(), NodeState::Skipped);
            stack.extend(self.dag.successors(&id).into_iter().map(str::to_string));
        }
    }

    /// Pending nodes that can never become ready.
    pub fn blocked_nodes(&self) -> BTreeSet<String> {
        let mut blocked = BTreeSet::new();
        loop {
            let mut changed = false;
            for (id, state) in &self.node_states {
                if *state != NodeState::Pending || blocked.contains(id) {
                    continue;
                }
                // A loop body only runs through its loop.
                if let Some(owner) = self.dag.loop_owner(id) {
                    let owner_done = blocked.contains(owner)
                        || self
                            .node_states
                            .get(owner)
                            .map(|s| s.is_terminal())
                            .unwrap_or(true);
                    if owner_done {
                        blocked.insert(id.clone());
                        changed = true;
                    }
                    continue;
                }
                let preds = self.dag.predecessors(id);
                if preds.is_empty() {
                    continue;
                }
                let settled = preds.iter().all(|p| {
                    blocked.contains(*p)
                        || self
                            .node_states
                            .get(*p)
                            .map(|s| s.is_terminal())
                            .unwrap_or(true)
                });
                let rule = self
                    .dag
                    .nodes
                    .get(id)
                    .map(|n| n.trigger_rule)
                    .unwrap_or_default();
                if settled && !rule_satisfied(rule, &self.predecessor_states(id)) {
                    blocked.insert(id.clone());
                    changed = true;
                }
            }
            if !changed {
                return blocked;
            }
        }
    }

    /// Terminal run state once no node can make progress, else `None`.
    pub fn is_finished(&self) -> Option<RunState> {
        let blocked = self.blocked_nodes();
        let active = self.node_states.iter().any(|(id, s)| match s {
            NodeState::Ready | NodeState::Running => true,
            NodeState::Pending => !blocked.contains(id),
            _ => false,
        });
        if active {
            return None;
        }
        if self.node_states.values().any(|s| *s == NodeState::Failed) {
            Some(RunState::Failed)
        } else {
            Some(RunState::Succeeded)
        }
    }
}
