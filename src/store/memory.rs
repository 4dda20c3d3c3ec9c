//! In-memory [`Store`] implementation.
//!
//! Every operation takes the table lock once, so single-row operations are
//! atomic with respect to each other. Used by the `serve` binary and by the
//! test suites.

use super::{EndpointQuery, Store};
use crate::core::{
    Assignment, DesiredState, EmbeddedWorker, Endpoint, HttpWorker, Node, RunState, StepRun,
    Task, TaskDefinition, TaskId, TaskOutcome, TaskState, Workflow, WorkflowDag, WorkflowRun,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    task_defs: HashMap<String, TaskDefinition>,
    dags: HashMap<String, WorkflowDag>,
    workflows: HashMap<String, Workflow>,
    runs: HashMap<String, WorkflowRun>,
    step_runs: HashMap<(String, String), StepRun>,
    nodes: HashMap<String, Node>,
    assignments: HashMap<String, Assignment>,
    endpoints: HashMap<(String, String), Endpoint>,
    http_workers: HashMap<String, HttpWorker>,
    embedded_workers: HashMap<String, EmbeddedWorker>,
}

/// Store backed by hash maps behind a single async lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_tasks<'a>(tasks: impl Iterator<Item = &'a Task>) -> Vec<Task> {
    let mut out: Vec<Task> = tasks.cloned().collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<TaskId> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(Error::Store(format!("task {} already exists", task.id)));
        }
        let id = task.id;
        tables.tasks.insert(id, task);
        Ok(id)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(sorted_tasks(self.tables.read().await.tasks.values()))
    }

    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        let tables = self.tables.read().await;
        Ok(sorted_tasks(
            tables.tasks.values().filter(|t| t.state == state),
        ))
    }

    async fn mark_task_running(&self, id: &TaskId, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        if task.start(now).is_err() {
            return Ok(None);
        }
        Ok(Some(task.clone()))
    }

    async fn finish_task(
        &self,
        id: &TaskId,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        Ok(task.finish(outcome, now).is_ok())
    }

    async fn finish_running_task(
        &self,
        id: &TaskId,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        if task.state != TaskState::Running {
            return Ok(false);
        }
        Ok(task.finish(outcome, now).is_ok())
    }

    async fn release_task(&self, id: &TaskId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        Ok(task.release().is_ok())
    }

    async fn create_task_def(&self, def: TaskDefinition) -> Result<String> {
        let id = def.id.clone();
        self.tables.write().await.task_defs.insert(id.clone(), def);
        Ok(id)
    }

    async fn get_task_def(&self, id: &str) -> Result<Option<TaskDefinition>> {
        Ok(self.tables.read().await.task_defs.get(id).cloned())
    }

    async fn find_task_def_by_name(&self, name: &str) -> Result<Option<TaskDefinition>> {
        let tables = self.tables.read().await;
        Ok(tables
            .task_defs
            .values()
            .filter(|d| d.name == name)
            .min_by_key(|d| d.created_at)
            .cloned())
    }

    async fn list_task_defs(&self) -> Result<Vec<TaskDefinition>> {
        let mut defs: Vec<TaskDefinition> =
            self.tables.read().await.task_defs.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn create_dag(&self, dag: WorkflowDag) -> Result<String> {
        let mut tables = self.tables.write().await;
        if tables.dags.contains_key(&dag.id) {
            return Err(Error::Store(format!("DAG {} already exists", dag.id)));
        }
        let id = dag.id.clone();
        tables.dags.insert(id.clone(), dag);
        Ok(id)
    }

    async fn get_dag(&self, id: &str) -> Result<Option<WorkflowDag>> {
        Ok(self.tables.read().await.dags.get(id).cloned())
    }

    async fn create_workflow(&self, workflow: Workflow) -> Result<String> {
        let id = workflow.id.clone();
        self.tables
            .write()
            .await
            .workflows
            .insert(id.clone(), workflow);
        Ok(id)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.tables.read().await.workflows.get(id).cloned())
    }

    async fn create_run(&self, run: WorkflowRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.runs.contains_key(&run.id) {
            return Err(Error::Store(format!("run {} already exists", run.id)));
        }
        tables.runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.tables.read().await.runs.get(id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self.tables.read().await.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn finish_run(&self, id: &str, state: RunState, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("run", id))?;
        if run.state.is_terminal() || !state.is_terminal() {
            return Ok(false);
        }
        run.state = state;
        run.finished_at = Some(now);
        Ok(true)
    }

    async fn upsert_step_run(&self, step_run: StepRun) -> Result<()> {
        let key = (step_run.run_id.clone(), step_run.step_id.clone());
        self.tables.write().await.step_runs.insert(key, step_run);
        Ok(())
    }

    async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>> {
        let tables = self.tables.read().await;
        let mut out: Vec<StepRun> = tables
            .step_runs
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.ord);
        Ok(out)
    }

    async fn upsert_node(&self, node: Node) -> Result<()> {
        self.tables
            .write()
            .await
            .nodes
            .insert(node.id.clone(), node);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.tables.read().await.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn create_assignment(&self, assignment: Assignment) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.assignments.contains_key(&assignment.instance_id) {
            return Err(Error::Store(format!(
                "assignment {} already exists",
                assignment.instance_id
            )));
        }
        tables
            .assignments
            .insert(assignment.instance_id.clone(), assignment);
        Ok(())
    }

    async fn get_assignment(&self, instance_id: &str) -> Result<Option<Assignment>> {
        Ok(self.tables.read().await.assignments.get(instance_id).cloned())
    }

    async fn list_assignments_by_node(&self, node_id: &str) -> Result<Vec<Assignment>> {
        let tables = self.tables.read().await;
        let mut out: Vec<Assignment> = tables
            .assignments
            .values()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }

    async fn set_assignment_desired(
        &self,
        instance_id: &str,
        desired: DesiredState,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let assignment = tables
            .assignments
            .get_mut(instance_id)
            .ok_or_else(|| Error::not_found("assignment", instance_id))?;
        assignment.desired = desired;
        Ok(())
    }

    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        let key = (endpoint.service_name.clone(), endpoint.instance_id.clone());
        self.tables.write().await.endpoints.insert(key, endpoint);
        Ok(())
    }

    async fn discover_endpoints(&self, query: &EndpointQuery) -> Result<Vec<Endpoint>> {
        let tables = self.tables.read().await;
        let mut out: Vec<Endpoint> = tables
            .endpoints
            .values()
            .filter(|e| e.healthy && e.service_name == query.service)
            .filter(|e| query.version.is_empty() || e.version == query.version)
            .filter(|e| query.protocol.is_empty() || e.protocol.eq_ignore_ascii_case(&query.protocol))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }

    async fn upsert_http_worker(&self, worker: HttpWorker) -> Result<()> {
        self.tables
            .write()
            .await
            .http_workers
            .insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn list_http_workers(&self) -> Result<Vec<HttpWorker>> {
        let mut out: Vec<HttpWorker> = self
            .tables
            .read()
            .await
            .http_workers
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn upsert_embedded_worker(&self, worker: EmbeddedWorker) -> Result<()> {
        self.tables
            .write()
            .await
            .embedded_workers
            .insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn touch_embedded_worker(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(worker) = self.tables.write().await.embedded_workers.get_mut(id) {
            worker.last_seen = now;
        }
        Ok(())
    }

    async fn remove_embedded_worker(&self, id: &str) -> Result<()> {
        self.tables.write().await.embedded_workers.remove(id);
        Ok(())
    }

    async fn list_embedded_workers(&self) -> Result<Vec<EmbeddedWorker>> {
        let mut out: Vec<EmbeddedWorker> = self
            .tables
            .read()
            .await
            .embedded_workers
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
