//! Storage interface consumed by the controller core.
//!
//! The [`Store`] trait is the only way the scheduler, the DAG engine and
//! failover touch persistent state. Every operation is single-entity and
//! atomic; nothing in the core relies on multi-row transactions.
//!
//! Task state changes go through the conditional operations
//! (`mark_task_running`, `finish_task`, `release_task`) so the forward-only
//! state machine is enforced at the row level: a late backend response can
//! never overwrite a task the watchdog or a cancel already finished.

mod memory;

pub use memory::MemoryStore;

use crate::core::{
    Assignment, DesiredState, EmbeddedWorker, Endpoint, HttpWorker, Node, RunState, StepRun,
    Task, TaskDefinition, TaskId, TaskOutcome, TaskState, Workflow, WorkflowDag, WorkflowRun,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Filter for endpoint discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointQuery {
    pub service: String,
    /// Required version; empty matches any.
    pub version: String,
    /// Required protocol; empty matches any.
    pub protocol: String,
}

/// Storage trait for tasks, workflows and fleet records.
#[async_trait]
pub trait Store: Send + Sync {
    // ========== Tasks ==========

    /// Insert a new task.
    async fn create_task(&self, task: Task) -> Result<TaskId>;

    /// Get a task by id.
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// List all tasks, oldest first.
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// List tasks in the given state, oldest first.
    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<Task>>;

    /// `Pending -> Running`, bumping the attempt counter.
    ///
    /// Returns the updated task, or `None` if it was no longer `Pending`.
    async fn mark_task_running(&self, id: &TaskId, now: DateTime<Utc>) -> Result<Option<Task>>;

    /// Record a terminal outcome on a non-terminal task.
    ///
    /// Returns `false` without writing if the task was already terminal.
    async fn finish_task(
        &self,
        id: &TaskId,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a terminal outcome only if the task is `Running`.
    ///
    /// Worker results go through here so a stray result can never move a
    /// `Pending` or `Queued` task straight to a terminal state.
    async fn finish_running_task(
        &self,
        id: &TaskId,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Queued -> Pending`. Returns `false` if the task was not queued.
    async fn release_task(&self, id: &TaskId) -> Result<bool>;

    // ========== Task definitions ==========

    async fn create_task_def(&self, def: TaskDefinition) -> Result<String>;

    async fn get_task_def(&self, id: &str) -> Result<Option<TaskDefinition>>;

    async fn find_task_def_by_name(&self, name: &str) -> Result<Option<TaskDefinition>>;

    async fn list_task_defs(&self) -> Result<Vec<TaskDefinition>>;

    // ========== Workflows ==========

    async fn create_dag(&self, dag: WorkflowDag) -> Result<String>;

    async fn get_dag(&self, id: &str) -> Result<Option<WorkflowDag>>;

    async fn create_workflow(&self, workflow: Workflow) -> Result<String>;

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;

    async fn create_run(&self, run: WorkflowRun) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>>;

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>>;

    /// Move a `Running` run to a terminal state.
    ///
    /// Returns `false` if the run was already terminal.
    async fn finish_run(&self, id: &str, state: RunState, now: DateTime<Utc>) -> Result<bool>;

    /// Insert or replace the step run keyed by `(run_id, step_id)`.
    async fn upsert_step_run(&self, step_run: StepRun) -> Result<()>;

    /// Step runs of a run, ordered by `ord`.
    async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>>;

    // ========== Fleet ==========

    async fn upsert_node(&self, node: Node) -> Result<()>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn create_assignment(&self, assignment: Assignment) -> Result<()>;

    async fn get_assignment(&self, instance_id: &str) -> Result<Option<Assignment>>;

    async fn list_assignments_by_node(&self, node_id: &str) -> Result<Vec<Assignment>>;

    async fn set_assignment_desired(&self, instance_id: &str, desired: DesiredState)
        -> Result<()>;

    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<()>;

    /// Healthy endpoints matching the query.
    async fn discover_endpoints(&self, query: &EndpointQuery) -> Result<Vec<Endpoint>>;

    async fn upsert_http_worker(&self, worker: HttpWorker) -> Result<()>;

    async fn list_http_workers(&self) -> Result<Vec<HttpWorker>>;

    async fn upsert_embedded_worker(&self, worker: EmbeddedWorker) -> Result<()>;

    async fn touch_embedded_worker(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn remove_embedded_worker(&self, id: &str) -> Result<()>;

    async fn list_embedded_workers(&self) -> Result<Vec<EmbeddedWorker>>;
}
