//! Owner of every live DAG run.
//!
//! The orchestrator keeps one [`DagExecutor`] per running DAG run and ticks
//! them all on a fixed interval. Finished runs get their terminal state
//! persisted and are dropped from the live map. Status queries for runs
//! that are no longer live are answered by reconstructing node states from
//! the correlation labels on the run's tasks.

use crate::config::Config;
use crate::core::dag::{NodeKind, WorkflowDag};
use crate::core::labels::Correlation;
use crate::core::task::{Task, TaskOutcome, TaskState};
use crate::core::workflow::{RunKind, RunState, WorkflowRun};
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::orchestration::executor::{DagExecutor, NodeState};
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Node states of one run, live or reconstructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    /// Whether the states come from a live executor.
    pub live: bool,
    pub nodes: BTreeMap<String, NodeState>,
}

/// Generate a run id: `dagrun-YYYYMMDD-HHMMSS-<8 hex>`.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("dagrun-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Approximate node states of a run from its tasks.
///
/// The newest task per node wins. Nodes without a task are `Pending`.
/// Parallel and loop nodes are derived from their direct children (a loop's
/// body): `Failed` if any child failed, `Running` if any child is still
/// pending or running, else `Succeeded`.
pub fn reconstruct_states(
    dag: &WorkflowDag,
    run_id: &str,
    tasks: &[Task],
) -> BTreeMap<String, NodeState> {
    let mut newest: HashMap<String, &Task> = HashMap::new();
    for task in tasks {
        if let Some(Correlation::DagNode { run_id: r, node_id }) = task.correlation() {
            if r != run_id {
                continue;
            }
            match newest.get(&node_id) {
                Some(existing) if existing.created_at >= task.created_at => {}
                _ => {
                    newest.insert(node_id, task);
                }
            }
        }
    }

    let mut states: BTreeMap<String, NodeState> = dag
        .nodes
        .keys()
        .map(|id| {
            let state = match newest.get(id).map(|t| t.state) {
                Some(TaskState::Succeeded) => NodeState::Succeeded,
                Some(TaskState::Failed | TaskState::Timeout | TaskState::Canceled) => {
                    NodeState::Failed
                }
                Some(TaskState::Running) => NodeState::Running,
                _ => NodeState::Pending,
            };
            (id.clone(), state)
        })
        .collect();

    for (id, node) in &dag.nodes {
        let children = match node.kind {
            NodeKind::Parallel => dag.successors(id),
            NodeKind::Loop => dag.loop_body(id),
            _ => continue,
        };
        let children: Vec<NodeState> = children
            .into_iter()
            .map(|c| states.get(c).copied().unwrap_or(NodeState::Pending))
            .collect();
        if children.is_empty() {
            continue;
        }
        let derived = if children.contains(&NodeState::Failed) {
            NodeState::Failed
        } else if children
            .iter()
            .any(|c| matches!(c, NodeState::Pending | NodeState::Running))
        {
            NodeState::Running
        } else {
            NodeState::Succeeded
        };
        states.insert(id.clone(), derived);
    }
    states
}

type LiveMap = HashMap<String, Arc<Mutex<DagExecutor>>>;

/// Drives every live DAG run.
pub struct DagOrchestrator {
    store: Arc<dyn Store>,
    notifier: Notifier,
    interval: Duration,
    executors: RwLock<LiveMap>,
    tick_lock: Mutex<()>,
}

impl DagOrchestrator {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier, config: &Config) -> Self {
        Self {
            store,
            notifier,
            interval: config.dag_tick_interval(),
            executors: RwLock::new(HashMap::new()),
            tick_lock: Mutex::new(()),
        }
    }

    /// Start a run of the stored DAG `dag_id` and return its run id.
    pub async fn start_dag_run(&self, dag_id: &str) -> Result<String> {
        let dag = self
            .store
            .get_dag(dag_id)
            .await?
            .ok_or_else(|| Error::not_found("workflow", dag_id))?;
        dag.validate()?;

        let now = Utc::now();
        let run_id = new_run_id(now);
        self.store
            .create_run(WorkflowRun::start(&run_id, dag_id, RunKind::Dag, now))
            .await?;

        let executor = DagExecutor::new(&run_id, dag);
        self.executors
            .write()
            .await
            .insert(run_id.clone(), Arc::new(Mutex::new(executor)));
        info!(%run_id, dag_id, "started DAG run");
        Ok(run_id)
    }

    /// Tick every live executor once and retire the finished ones.
    ///
    /// Returns the runs that finished on this tick.
    pub async fn tick(&self) -> Vec<(String, RunState)> {
        let _tick = self.tick_lock.lock().await;
        let live: Vec<(String, Arc<Mutex<DagExecutor>>)> = self
            .executors
            .read()
            .await
            .iter()
            .map(|(id, exec)| (id.clone(), exec.clone()))
            .collect();

        let store = self.store.as_ref();
        let outcomes = join_all(live.iter().map(|(run_id, exec)| async move {
            let mut exec = exec.lock().await;
            let scheduled = exec.tick(store).await;
            (run_id.clone(), scheduled, exec.is_finished())
        }))
        .await;

        let mut scheduled_any = false;
        let mut finished = Vec::new();
        for (run_id, scheduled, state) in outcomes {
            scheduled_any |= scheduled > 0;
            let Some(state) = state else {
                continue;
            };
            match self.store.finish_run(&run_id, state, Utc::now()).await {
                Ok(_) => {
                    info!(%run_id, %state, "DAG run finished");
                    self.executors.write().await.remove(&run_id);
                    finished.push((run_id, state));
                }
                Err(e) => warn!(%run_id, error = %e, "failed to persist run state"),
            }
        }

        if scheduled_any || !finished.is_empty() {
            self.notifier.publish_tasks();
        }
        finished
    }

    /// Node states of a run.
    ///
    /// Live runs answer from their executor; others are reconstructed from
    /// task labels.
    pub async fn get_run_status(&self, run_id: &str) -> Result<RunStatus> {
        let live = self.executors.read().await.get(run_id).cloned();
        if let Some(exec) = live {
            return Ok(RunStatus {
                run_id: run_id.to_string(),
                state: RunState::Running,
                live: true,
                nodes: exec.lock().await.node_states(),
            });
        }

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        let dag = self
            .store
            .get_dag(&run.workflow_id)
            .await?
            .ok_or_else(|| Error::not_found("workflow", &run.workflow_id))?;
        let tasks = self.store.list_tasks().await?;
        Ok(RunStatus {
            run_id: run_id.to_string(),
            state: run.state,
            live: false,
            nodes: reconstruct_states(&dag, run_id, &tasks),
        })
    }

    /// Ids of the live runs, sorted.
    pub async fn list_live_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop a run: drop its executor, mark it `Failed` and cancel its
    /// unfinished tasks.
    ///
    /// Returns `false` when the run had already finished.
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        let was_live = self.executors.write().await.remove(run_id).is_some();
        if !was_live && self.store.get_run(run_id).await?.is_none() {
            return Err(Error::not_found("run", run_id));
        }

        let now = Utc::now();
        let changed = self.store.finish_run(run_id, RunState::Failed, now).await?;

        let mut canceled = 0;
        for task in self.store.list_tasks().await? {
            let belongs = task
                .correlation()
                .is_some_and(|c| matches!(c, Correlation::DagNode { .. }) && c.run_id() == run_id);
            if !belongs || task.state.is_terminal() {
                continue;
            }
            if self
                .store
                .finish_task(&task.id, TaskOutcome::canceled(), now)
                .await?
            {
                canceled += 1;
            }
        }

        info!(run_id, canceled, "DAG run canceled");
        self.notifier.publish_tasks();
        Ok(changed)
    }

    /// Rebuild executors for `Running` DAG runs that have none, e.g. after a
    /// restart. Runs whose definition is gone are failed.
    pub async fn resume_runs(&self) -> Result<usize> {
        let runs = self.store.list_runs().await?;
        let tasks = self.store.list_tasks().await?;
        let mut resumed = 0;

        for run in runs {
            if run.kind != RunKind::Dag || run.state != RunState::Running {
                continue;
            }
            if self.executors.read().await.contains_key(&run.id) {
                continue;
            }
            let Some(dag) = self.store.get_dag(&run.workflow_id).await? else {
                warn!(run_id = %run.id, workflow_id = %run.workflow_id, "workflow missing, failing run");
                self.store
                    .finish_run(&run.id, RunState::Failed, Utc::now())
                    .await?;
                continue;
            };
            let executor = DagExecutor::restore(&run.id, dag, &tasks);
            debug!(run_id = %run.id, tasks = executor.task_ids().len(), "restored DAG run");
            self.executors
                .write()
                .await
                .insert(run.id.clone(), Arc::new(Mutex::new(executor)));
            resumed += 1;
        }

        if resumed > 0 {
            info!(resumed, "resumed DAG runs");
        }
        Ok(resumed)
    }

    /// Tick until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "DAG orchestrator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("DAG orchestrator stopped");
    }
}
