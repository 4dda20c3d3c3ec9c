//! Task data model and lifecycle state machine.
//!
//! Tasks are the atomic units of dispatchable work. Each task tracks its
//! executor backend, target, payload, attempt counter and outcome. State
//! moves forward only: `Queued -> Pending -> Running -> terminal`.

use crate::core::labels::{Correlation, Labels};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Name prefix that routes a task to the in-process builtin backend.
pub const BUILTIN_PREFIX: &str = "builtin.";

/// Upper bound on a per-task time budget (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task state in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created but held until explicitly started.
    Queued,
    /// Waiting for the scheduler to pick it up.
    #[default]
    Pending,
    /// Dispatched to a backend.
    Running,
    Succeeded,
    Failed,
    /// The backend reported the work exceeded its time budget.
    Timeout,
    Canceled,
}

impl TaskState {
    /// Whether this state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Timeout | TaskState::Canceled
        )
    }

    fn rank(self) -> u8 {
        match self {
            TaskState::Queued => 0,
            TaskState::Pending => 1,
            TaskState::Running => 2,
            _ => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only
    /// ordering. Terminal states accept nothing.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Timeout => "timeout",
            TaskState::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Execution backend for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Builtin,
    Embedded,
    Service,
    OsProcess,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutorKind::Builtin => "builtin",
            ExecutorKind::Embedded => "embedded",
            ExecutorKind::Service => "service",
            ExecutorKind::OsProcess => "os_process",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "builtin" => Ok(ExecutorKind::Builtin),
            "embedded" => Ok(ExecutorKind::Embedded),
            "service" => Ok(ExecutorKind::Service),
            "os_process" => Ok(ExecutorKind::OsProcess),
            other => Err(Error::Validation(format!("unknown executor: {}", other))),
        }
    }
}

/// What the target reference of a task points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// No placement constraint.
    #[default]
    Any,
    Node,
    App,
    Deployment,
    Service,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetKind::Any => "any",
            TargetKind::Node => "node",
            TargetKind::App => "app",
            TargetKind::Deployment => "deployment",
            TargetKind::Service => "service",
        };
        write!(f, "{}", s)
    }
}

/// Final result produced by a backend for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Terminal state to record.
    pub state: TaskState,
    /// Result payload, if the backend produced one.
    pub result: Option<Value>,
    /// Error text; empty only for `Succeeded`.
    pub error: String,
}

impl TaskOutcome {
    pub fn succeeded(result: Value) -> Self {
        Self {
            state: TaskState::Succeeded,
            result: Some(result),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            result: None,
            error: error.into(),
        }
    }

    /// A failure that still carries a result payload (e.g. a non-2xx body
    /// or a process's captured output).
    pub fn failed_with(result: Value, error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            result: Some(result),
            error: error.into(),
        }
    }

    pub fn timeout(error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Timeout,
            result: None,
            error: error.into(),
        }
    }

    pub fn canceled() -> Self {
        Self {
            state: TaskState::Canceled,
            result: None,
            error: "canceled".to_string(),
        }
    }
}

/// A single unit of dispatchable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Task name; `builtin.*` names run in-process.
    pub name: String,
    /// Backend that executes the task.
    pub executor: ExecutorKind,
    /// Placement constraint kind.
    #[serde(default)]
    pub target_kind: TargetKind,
    /// Placement constraint value (node id, app name, service name...).
    #[serde(default)]
    pub target_ref: String,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Opaque input handed to the backend.
    #[serde(default)]
    pub payload: Value,
    /// Per-task time budget in seconds; 0 means the backend default.
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// Incremented once per transition into `Running`.
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    /// Failure detail; non-empty for every terminal state except `Succeeded`.
    #[serde(default)]
    pub error: String,
    /// Correlation labels (workflow run, step, DAG node).
    #[serde(default)]
    pub labels: Labels,
    /// The task this one was rerun from.
    pub origin_task_id: Option<TaskId>,
}

impl Task {
    /// Create a new `Pending` task with a generated ID and the current
    /// timestamp.
    pub fn new(name: &str, executor: ExecutorKind) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            executor,
            target_kind: TargetKind::Any,
            target_ref: String::new(),
            state: TaskState::Pending,
            payload: Value::Null,
            timeout_sec: 0,
            max_retries: 0,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: String::new(),
            labels: Labels::new(),
            origin_task_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_target(mut self, kind: TargetKind, target_ref: &str) -> Self {
        self.target_kind = kind;
        self.target_ref = target_ref.to_string();
        self
    }

    /// Set the time budget, clamped to [`MAX_TIMEOUT_SECS`].
    pub fn with_timeout(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec.min(MAX_TIMEOUT_SECS);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Hold the task in `Queued` until it is explicitly released.
    pub fn queued(mut self) -> Self {
        self.state = TaskState::Queued;
        self
    }

    /// Whether the task runs in-process.
    pub fn is_builtin(&self) -> bool {
        self.name.starts_with(BUILTIN_PREFIX)
    }

    /// Workflow correlation carried by the labels, if any.
    pub fn correlation(&self) -> Option<Correlation> {
        Correlation::from_labels(&self.labels)
    }

    /// Move `Queued -> Pending`.
    pub fn release(&mut self) -> Result<()> {
        if self.state != TaskState::Queued {
            return Err(self.invalid(TaskState::Pending));
        }
        self.state = TaskState::Pending;
        Ok(())
    }

    /// Move `Pending -> Running`, bumping the attempt counter.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != TaskState::Pending {
            return Err(self.invalid(TaskState::Running));
        }
        self.state = TaskState::Running;
        self.attempt += 1;
        self.started_at = Some(now);
        Ok(())
    }

    /// Record a terminal outcome. The attempt counter is left untouched.
    pub fn finish(&mut self, outcome: TaskOutcome, now: DateTime<Utc>) -> Result<()> {
        if !outcome.state.is_terminal() || !self.state.can_transition_to(outcome.state) {
            return Err(self.invalid(outcome.state));
        }
        self.state = outcome.state;
        self.result = outcome.result;
        self.error = if outcome.state != TaskState::Succeeded && outcome.error.is_empty() {
            outcome.state.to_string()
        } else {
            outcome.error
        };
        self.finished_at = Some(now);
        Ok(())
    }

    /// Time spent in `Running` so far.
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.state != TaskState::Running {
            return None;
        }
        let started = self.started_at?;
        (now - started).to_std().ok()
    }

    /// Build a fresh `Pending` copy for a rerun, keeping lineage.
    pub fn rerun(&self) -> Self {
        let mut copy = Task::new(&self.name, self.executor)
            .with_payload(self.payload.clone())
            .with_target(self.target_kind, &self.target_ref)
            .with_timeout(self.timeout_sec);
        copy.max_retries = self.max_retries;
        copy.labels = self.labels.clone();
        copy.origin_task_id = Some(self.origin_task_id.unwrap_or(self.id));
        copy
    }

    fn invalid(&self, to: TaskState) -> Error {
        Error::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}
