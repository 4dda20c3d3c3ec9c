//! Orchestration layer for the fleet controller.
//!
//! This module holds the periodic loops that move work forward: the task
//! scheduler, the DAG orchestrator with its per-run executors, and the
//! failover sweep. [`TaskService`] is the entry point for callers that
//! create and manage tasks.

mod executor;
mod failover;
mod orchestrator;
mod scheduler;
mod tasks;

pub use executor::{rule_satisfied, DagExecutor, NodeState};
pub use failover::{FailoverLoop, FailoverReport, NodeHealth};
pub use orchestrator::{new_run_id, reconstruct_states, DagOrchestrator, RunStatus};
pub use scheduler::{TaskScheduler, TickReport, WATCHDOG_ERROR};
pub use tasks::{seed_builtin_definitions, NewTask, RunOverrides, TaskService};
