//! Task operations exposed to callers: create, start, rerun, cancel and
//! running task definitions, plus starting sequential workflow runs.
//!
//! Every mutation publishes [`TASKS_TOPIC`](crate::notify::TASKS_TOPIC) so
//! watchers re-read the store.

use crate::core::labels::Labels;
use crate::core::task::{ExecutorKind, TargetKind, Task, TaskId, TaskOutcome, TaskState, BUILTIN_PREFIX};
use crate::core::workflow::{
    RunKind, TaskDefinition, WorkflowRun, DEFAULT_DEFINITION_TIMEOUT_SECS,
};
use crate::dispatch::builtin::BUILTINS;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::store::Store;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Request to create a task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    pub executor: ExecutorKind,
    #[serde(default)]
    pub target_kind: TargetKind,
    #[serde(default)]
    pub target_ref: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub labels: Labels,
}

impl NewTask {
    pub fn new(name: &str, executor: ExecutorKind) -> Self {
        Self {
            name: name.to_string(),
            executor,
            target_kind: TargetKind::Any,
            target_ref: String::new(),
            payload: Value::Null,
            timeout_sec: 0,
            max_retries: 0,
            labels: Labels::new(),
        }
    }

    fn into_task(self) -> Result<Task> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("task name is required".to_string()));
        }
        let mut task = Task::new(name, self.executor)
            .with_target(self.target_kind, &self.target_ref)
            .with_payload(self.payload)
            .with_timeout(self.timeout_sec);
        task.max_retries = self.max_retries;
        task.labels = self.labels;
        Ok(task)
    }
}

/// Overrides applied when running a task definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOverrides {
    pub payload: Option<Value>,
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn Store>,
    notifier: Notifier,
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Create a task, `Pending` when `auto_start`, else `Queued`.
    pub async fn create(&self, spec: NewTask, auto_start: bool) -> Result<TaskId> {
        let mut task = spec.into_task()?;
        if !auto_start {
            task = task.queued();
        }
        let state = task.state;
        let id = self.store.create_task(task).await?;
        debug!(task_id = %id, %state, "task created");
        self.notifier.publish_tasks();
        Ok(id)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| Error::not_found("task", id))
    }

    /// Release a queued task to the scheduler.
    pub async fn start(&self, id: &TaskId) -> Result<()> {
        if !self.store.release_task(id).await? {
            let task = self.get(id).await?;
            return Err(Error::Validation(format!(
                "task {} is {}, not queued",
                id, task.state
            )));
        }
        self.notifier.publish_tasks();
        Ok(())
    }

    /// Create a fresh `Pending` copy of a task. Returns the new id.
    pub async fn rerun(&self, id: &TaskId) -> Result<TaskId> {
        let source = self.get(id).await?;
        let new_id = self.store.create_task(source.rerun()).await?;
        info!(task_id = %id, %new_id, "task rerun");
        self.notifier.publish_tasks();
        Ok(new_id)
    }

    /// Cancel a non-terminal task. A terminal task is left as it is.
    ///
    /// Returns the task's state afterwards.
    pub async fn cancel(&self, id: &TaskId) -> Result<TaskState> {
        let task = self.get(id).await?;
        if task.state.is_terminal() {
            return Ok(task.state);
        }
        if self
            .store
            .finish_task(id, TaskOutcome::canceled(), Utc::now())
            .await?
        {
            info!(task_id = %id, "task canceled");
            self.notifier.publish_tasks();
            return Ok(TaskState::Canceled);
        }
        // Finished by someone else in the meantime.
        Ok(self.get(id).await?.state)
    }

    /// Create a `Pending` task from a definition.
    pub async fn run_definition(&self, def_id: &str, overrides: RunOverrides) -> Result<TaskId> {
        let def = self
            .store
            .get_task_def(def_id)
            .await?
            .ok_or_else(|| Error::not_found("task definition", def_id))?;
        let timeout = overrides
            .timeout_sec
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_DEFINITION_TIMEOUT_SECS);
        let mut task = def.instantiate(overrides.payload, timeout);
        task.labels.extend(overrides.labels);

        let id = self.store.create_task(task).await?;
        debug!(task_id = %id, def_id, "task created from definition");
        self.notifier.publish_tasks();
        Ok(id)
    }

    /// Start a sequential run of a stored workflow. The scheduler creates
    /// the step tasks.
    pub async fn start_workflow_run(&self, workflow_id: &str) -> Result<String> {
        if self.store.get_workflow(workflow_id).await?.is_none() {
            return Err(Error::not_found("workflow", workflow_id));
        }
        let run_id = format!("run-{}", Uuid::new_v4().simple());
        self.store
            .create_run(WorkflowRun::start(
                &run_id,
                workflow_id,
                RunKind::Sequential,
                Utc::now(),
            ))
            .await?;
        info!(%run_id, workflow_id, "workflow run started");
        self.notifier.publish_tasks();
        Ok(run_id)
    }
}

/// Create a definition for every builtin that has none yet.
///
/// Returns how many were created.
pub async fn seed_builtin_definitions(store: &dyn Store) -> Result<usize> {
    let mut created = 0;
    for name in BUILTINS {
        let full = format!("{}{}", BUILTIN_PREFIX, name);
        if store.find_task_def_by_name(&full).await?.is_some() {
            continue;
        }
        store
            .create_task_def(TaskDefinition::new(&full, ExecutorKind::Builtin))
            .await?;
        created += 1;
    }
    if created > 0 {
        info!(created, "seeded builtin task definitions");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::labels;
    use crate::core::workflow::{Workflow, WorkflowStep};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn service() -> (TaskService, Arc<MemoryStore>, Notifier) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new();
        (TaskService::new(store.clone(), notifier.clone()), store, notifier)
    }

    // ========== Create / Start Tests ==========

    #[tokio::test]
    async fn test_create_queued_then_start() {
        let (svc, _store, notifier) = service();
        let mut wake = notifier.subscribe(crate::notify::TASKS_TOPIC);

        let id = svc
            .create(NewTask::new("builtin.echo", ExecutorKind::Builtin), false)
            .await
            .unwrap();
        assert!(wake.try_recv());
        assert_eq!(svc.get(&id).await.unwrap().state, TaskState::Queued);

        svc.start(&id).await.unwrap();
        assert_eq!(svc.get(&id).await.unwrap().state, TaskState::Pending);

        let err = svc.start(&id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let (svc, _, _) = service();
        let err = svc
            .create(NewTask::new("  ", ExecutorKind::Builtin), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_new_task_from_json() {
        let spec: NewTask = serde_json::from_value(json!({
            "name": "resize",
            "executor": "embedded",
            "targetKind": "node",
            "targetRef": "n1",
            "payload": {"w": 10}
        }))
        .unwrap();
        assert_eq!(spec.executor, ExecutorKind::Embedded);
        assert_eq!(spec.target_kind, TargetKind::Node);
        assert!(serde_json::from_value::<NewTask>(json!({"name": "x", "executor": "bogus"})).is_err());
    }

    // ========== Rerun / Cancel Tests ==========

    #[tokio::test]
    async fn test_rerun_keeps_lineage() {
        let (svc, _, _) = service();
        let mut spec = NewTask::new("builtin.echo", ExecutorKind::Builtin);
        spec.payload = json!({"a": 1});
        spec.timeout_sec = 9;
        let first = svc.create(spec, true).await.unwrap();
        let second = svc.rerun(&first).await.unwrap();
        let third = svc.rerun(&second).await.unwrap();

        let t2 = svc.get(&second).await.unwrap();
        assert_eq!(t2.state, TaskState::Pending);
        assert_eq!(t2.payload, json!({"a": 1}));
        assert_eq!(t2.timeout_sec, 9);
        assert_eq!(t2.origin_task_id, Some(first));
        assert_eq!(svc.get(&third).await.unwrap().origin_task_id, Some(first));
    }

    #[tokio::test]
    async fn test_cancel() {
        let (svc, store, _) = service();
        let id = svc
            .create(NewTask::new("builtin.sleep", ExecutorKind::Builtin), true)
            .await
            .unwrap();
        assert_eq!(svc.cancel(&id).await.unwrap(), TaskState::Canceled);
        let task = svc.get(&id).await.unwrap();
        assert_eq!(task.error, "canceled");
        assert!(task.finished_at.is_some());

        let done = svc
            .create(NewTask::new("builtin.echo", ExecutorKind::Builtin), true)
            .await
            .unwrap();
        store.mark_task_running(&done, Utc::now()).await.unwrap();
        store
            .finish_task(&done, TaskOutcome::succeeded(json!(1)), Utc::now())
            .await
            .unwrap();
        assert_eq!(svc.cancel(&done).await.unwrap(), TaskState::Succeeded);
        assert!(svc.cancel(&TaskId::new()).await.is_err());
    }

    // ========== Definition Tests ==========

    #[tokio::test]
    async fn test_run_definition() {
        let (svc, store, _) = service();
        let mut def = TaskDefinition::new("builtin.echo", ExecutorKind::Builtin)
            .with_default_payload(json!({"d": true}));
        def.labels.insert("team".into(), "infra".into());
        let def_id = store.create_task_def(def).await.unwrap();

        let id = svc
            .run_definition(&def_id, RunOverrides::default())
            .await
            .unwrap();
        let task = svc.get(&id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.payload, json!({"d": true}));
        assert_eq!(task.timeout_sec, DEFAULT_DEFINITION_TIMEOUT_SECS);
        assert_eq!(task.labels["team"], "infra");
        assert_eq!(task.labels[labels::DEF_ID], def_id);

        let overrides = RunOverrides {
            payload: Some(json!("x")),
            timeout_sec: Some(12),
            ..Default::default()
        };
        let id = svc.run_definition(&def_id, overrides).await.unwrap();
        let task = svc.get(&id).await.unwrap();
        assert_eq!(task.payload, json!("x"));
        assert_eq!(task.timeout_sec, 12);

        assert!(svc.run_definition("missing", RunOverrides::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_seed_builtins_idempotent() {
        let store = MemoryStore::new();
        assert_eq!(seed_builtin_definitions(&store).await.unwrap(), BUILTINS.len());
        assert_eq!(seed_builtin_definitions(&store).await.unwrap(), 0);
        let def = store.find_task_def_by_name("builtin.delay").await.unwrap().unwrap();
        assert_eq!(def.executor, ExecutorKind::Builtin);
    }

    // ========== Workflow Run Tests ==========

    #[tokio::test]
    async fn test_start_workflow_run() {
        let (svc, store, _) = service();
        let wf = Workflow::new("wf", vec![WorkflowStep::new("builtin.echo", ExecutorKind::Builtin, 0)]);
        let wf_id = store.create_workflow(wf).await.unwrap();
        let run_id = svc.start_workflow_run(&wf_id).await.unwrap();
        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.kind, RunKind::Sequential);
        assert!(svc.start_workflow_run("nope").await.is_err());
    }
}
