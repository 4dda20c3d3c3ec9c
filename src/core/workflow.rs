//! Task definitions, sequential workflows and run records.

use crate::core::labels::{self, Correlation, Labels};
use crate::core::task::{ExecutorKind, TargetKind, Task, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default time budget for tasks built from a definition.
pub const DEFAULT_DEFINITION_TIMEOUT_SECS: u64 = 300;

/// Reusable template for creating tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub executor: ExecutorKind,
    #[serde(default)]
    pub target_kind: TargetKind,
    #[serde(default)]
    pub target_ref: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub default_payload: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TaskDefinition {
    pub fn new(name: &str, executor: ExecutorKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            executor,
            target_kind: TargetKind::Any,
            target_ref: String::new(),
            labels: Labels::new(),
            default_payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, kind: TargetKind, target_ref: &str) -> Self {
        self.target_kind = kind;
        self.target_ref = target_ref.to_string();
        self
    }

    pub fn with_default_payload(mut self, payload: Value) -> Self {
        self.default_payload = Some(payload);
        self
    }

    /// Build a `Pending` task from this definition.
    ///
    /// `payload` wins over the default payload. Labels are the definition
    /// labels plus `defId`.
    pub fn instantiate(&self, payload: Option<Value>, timeout_sec: u64) -> Task {
        let payload = payload
            .or_else(|| self.default_payload.clone())
            .unwrap_or(Value::Null);
        let mut task = Task::new(&self.name, self.executor)
            .with_target(self.target_kind, &self.target_ref)
            .with_payload(payload)
            .with_timeout(timeout_sec);
        task.labels = self.labels.clone();
        task.labels.insert(labels::DEF_ID.to_string(), self.id.clone());
        task
    }
}

/// One step of a sequential workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    /// Task name.
    pub name: String,
    #[serde(default)]
    pub executor: Option<ExecutorKind>,
    #[serde(default)]
    pub target_kind: Option<TargetKind>,
    #[serde(default)]
    pub target_ref: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// Position in the sequence.
    pub ord: u32,
    /// Optional task definition supplying defaults.
    #[serde(default)]
    pub definition_id: Option<String>,
}

impl WorkflowStep {
    pub fn new(name: &str, executor: ExecutorKind, ord: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            executor: Some(executor),
            target_kind: None,
            target_ref: String::new(),
            labels: Labels::new(),
            payload: None,
            timeout_sec: 0,
            max_retries: 0,
            ord,
            definition_id: None,
        }
    }

    /// Build the task for this step within `run_id`.
    ///
    /// Step fields override the definition's when set; step labels override
    /// definition labels. Returns `None` when neither the step nor the
    /// definition names an executor.
    pub fn to_task(&self, run_id: &str, definition: Option<&TaskDefinition>) -> Option<Task> {
        let executor = self.executor.or(definition.map(|d| d.executor))?;
        let name = if self.name.is_empty() {
            definition.map(|d| d.name.clone()).unwrap_or_default()
        } else {
            self.name.clone()
        };
        let target_kind = self
            .target_kind
            .or(definition.map(|d| d.target_kind))
            .unwrap_or_default();
        let target_ref = if self.target_ref.is_empty() {
            definition.map(|d| d.target_ref.clone()).unwrap_or_default()
        } else {
            self.target_ref.clone()
        };
        let payload = self
            .payload
            .clone()
            .or_else(|| definition.and_then(|d| d.default_payload.clone()))
            .unwrap_or(Value::Null);

        let mut task = Task::new(&name, executor)
            .with_target(target_kind, &target_ref)
            .with_payload(payload)
            .with_timeout(self.timeout_sec);
        task.max_retries = self.max_retries;
        if let Some(def) = definition {
            task.labels = def.labels.clone();
            task.labels.insert(labels::DEF_ID.to_string(), def.id.clone());
        }
        task.labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Correlation::Step {
            run_id: run_id.to_string(),
            step_id: self.id.clone(),
        }
        .apply(&mut task.labels);
        Some(task)
    }
}

/// A sequential workflow: steps run one after another in `ord` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(name: &str, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            labels: Labels::new(),
            steps,
        }
    }

    /// Steps sorted by `ord`.
    pub fn ordered_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.ord);
        steps
    }
}

/// Which engine drives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Driven by the task scheduler, one step at a time.
    #[default]
    Sequential,
    /// Driven by the DAG orchestrator.
    Dag,
}

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        self != RunState::Running
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub kind: RunKind,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// A new `Running` run.
    pub fn start(id: &str, workflow_id: &str, kind: RunKind, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            kind,
            state: RunState::Running,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
        }
    }
}

/// State of a step within a sequential run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepState {
    /// Mirror a task state onto the step.
    pub fn from_task(state: TaskState) -> Self {
        match state {
            TaskState::Queued | TaskState::Pending => StepState::Pending,
            TaskState::Running => StepState::Running,
            TaskState::Succeeded => StepState::Succeeded,
            TaskState::Failed | TaskState::Timeout | TaskState::Canceled => StepState::Failed,
        }
    }
}

/// Progress record of one step within a sequential run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub run_id: String,
    pub step_id: String,
    pub task_id: crate::core::task::TaskId,
    pub state: StepState,
    pub ord: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========== TaskDefinition Tests ==========

    #[test]
    fn test_instantiate_prefers_given_payload() {
        let def = TaskDefinition::new("builtin.echo", ExecutorKind::Builtin)
            .with_default_payload(json!({"msg": "default"}));
        let task = def.instantiate(Some(json!({"msg": "mine"})), 30);
        assert_eq!(task.payload, json!({"msg": "mine"}));
        assert_eq!(task.timeout_sec, 30);
        assert_eq!(task.labels.get(labels::DEF_ID), Some(&def.id));

        let task = def.instantiate(None, 30);
        assert_eq!(task.payload, json!({"msg": "default"}));
    }

    // ========== WorkflowStep Tests ==========

    #[test]
    fn test_step_to_task_labels() {
        let mut def = TaskDefinition::new("deploy", ExecutorKind::Service)
            .with_target(TargetKind::Service, "api");
        def.labels.insert("servicePath".into(), "/def".into());
        def.labels.insert("team".into(), "infra".into());

        let mut step = WorkflowStep::new("", ExecutorKind::Service, 0);
        step.executor = None;
        step.definition_id = Some(def.id.clone());
        step.labels.insert("servicePath".into(), "/step".into());

        let task = step.to_task("run-1", Some(&def)).unwrap();
        assert_eq!(task.name, "deploy");
        assert_eq!(task.executor, ExecutorKind::Service);
        assert_eq!(task.target_ref, "api");
        assert_eq!(task.labels["servicePath"], "/step");
        assert_eq!(task.labels["team"], "infra");
        assert_eq!(task.labels[labels::RUN_ID], "run-1");
        assert_eq!(task.labels[labels::STEP_ID], step.id);
        assert_eq!(task.labels[labels::DEF_ID], def.id);
    }

    #[test]
    fn test_step_without_executor() {
        let mut step = WorkflowStep::new("x", ExecutorKind::Builtin, 0);
        step.executor = None;
        assert!(step.to_task("run-1", None).is_none());
    }

    #[test]
    fn test_ordered_steps() {
        let wf = Workflow::new(
            "wf",
            vec![
                WorkflowStep::new("second", ExecutorKind::Builtin, 1),
                WorkflowStep::new("first", ExecutorKind::Builtin, 0),
            ],
        );
        let names: Vec<&str> = wf.ordered_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    // ========== Run State Tests ==========

    #[test]
    fn test_step_state_from_task() {
        assert_eq!(StepState::from_task(TaskState::Running), StepState::Running);
        assert_eq!(StepState::from_task(TaskState::Timeout), StepState::Failed);
        assert_eq!(StepState::from_task(TaskState::Canceled), StepState::Failed);
        assert_eq!(StepState::from_task(TaskState::Queued), StepState::Pending);
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Failed.is_terminal());
        let run = WorkflowRun::start("r", "w", RunKind::Dag, Utc::now());
        assert_eq!(run.state, RunState::Running);
        assert!(run.started_at.is_some());
    }
}
