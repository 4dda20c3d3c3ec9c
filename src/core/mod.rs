//! Core domain models for the controller.
//!
//! This module contains the data structures shared by the scheduler, the
//! DAG engine and failover: tasks and their state machine, workflow
//! definitions and runs, and the fleet records dispatch reads.

pub mod dag;
pub mod fleet;
pub mod labels;
pub mod task;
pub mod value;
pub mod workflow;

pub use dag::{
    EdgeType, LoopCondition, LoopKind, NodeKind, TriggerRule, WorkflowDag, WorkflowEdge,
    WorkflowNode, MAX_LOOP_ITERATIONS,
};
pub use fleet::{Assignment, DesiredState, EmbeddedWorker, Endpoint, HttpWorker, Node};
pub use labels::{Correlation, Labels};
pub use task::{ExecutorKind, TargetKind, Task, TaskId, TaskOutcome, TaskState};
pub use value::{BranchCondition, ConditionError, Operator, Scalar};
pub use workflow::{
    RunKind, RunState, StepRun, StepState, TaskDefinition, Workflow, WorkflowRun, WorkflowStep,
};
