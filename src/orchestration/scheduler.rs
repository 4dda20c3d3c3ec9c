//! Periodic task scheduler.
//!
//! Each tick runs four passes in order:
//!
//! 1. Reflect workflow-correlated task states into their step runs.
//! 2. Advance running sequential workflow runs to their next step.
//! 3. Move every `Pending` task to `Running` and dispatch it.
//! 4. Watchdog: fail any task `Running` longer than its budget plus grace.
//!
//! Dispatches run as spawned tasks so a slow backend never holds up the
//! next tick. Their outcomes are written through the store's conditional
//! `finish_task`, so a result arriving after the watchdog or a cancel is
//! dropped.

use crate::config::Config;
use crate::core::labels::Correlation;
use crate::core::task::{Task, TaskOutcome, TaskState};
use crate::core::workflow::{RunKind, RunState, StepRun, StepState, WorkflowRun};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error recorded on tasks failed by the watchdog.
pub const WATCHDOG_ERROR: &str = "controller watchdog timeout";

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Step runs whose state changed.
    pub steps_synced: usize,
    /// Steps whose task was created this tick.
    pub steps_started: usize,
    /// Sequential runs that reached a terminal state.
    pub runs_finished: usize,
    /// Tasks moved to `Running` and handed to a backend.
    pub dispatched: usize,
    /// Tasks failed by the watchdog.
    pub watchdog_expired: usize,
    /// Per-item store errors that were logged and skipped.
    pub errors: usize,
}

/// Drives task state forward on a fixed interval.
///
/// # Example
///
/// ```ignore
/// let scheduler = Arc::new(TaskScheduler::new(store, dispatcher, notifier, &config));
/// tokio::spawn(scheduler.clone().run(shutdown.clone()));
/// ```
pub struct TaskScheduler {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    interval: Duration,
    grace: Duration,
    /// Dispatches still in flight.
    in_flight: Mutex<JoinSet<()>>,
    /// Held for the whole of a tick.
    tick_lock: Mutex<()>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        notifier: Notifier,
        config: &Config,
    ) -> Self {
        Self {
            store,
            dispatcher,
            notifier,
            interval: config.sched_interval(),
            grace: config.watchdog_grace(),
            in_flight: Mutex::new(JoinSet::new()),
            tick_lock: Mutex::new(()),
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    ///
    /// Fails only when a whole pass cannot read its input; errors on a
    /// single task or run are logged, counted and skipped.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let _tick = self.tick_lock.lock().await;
        self.reap().await;

        let mut report = TickReport::default();
        self.sync_steps(&mut report).await?;
        self.advance_runs(now, &mut report).await?;
        self.dispatch_pending(now, &mut report).await?;
        self.watchdog(now, &mut report).await?;

        if report != TickReport::default() {
            debug!(?report, "scheduler tick");
        }
        Ok(report)
    }

    /// Wait for every in-flight dispatch to finish.
    pub async fn wait_idle(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
    }

    /// Tick until `shutdown` fires, then abort in-flight dispatches.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "task scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        self.in_flight.lock().await.shutdown().await;
        info!("task scheduler stopped");
    }

    /// Drop finished dispatch handles.
    async fn reap(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(joined) = in_flight.try_join_next() {
            log_join(joined);
        }
    }

    // ========== Step reflection ==========
    async fn sync_steps(&self, report: &mut TickReport) -> Result<()> {
        let tasks = self.store.list_tasks().await?;
        let mut step_runs: HashMap<String, Vec<StepRun>> = HashMap::new();

        for task in tasks {
            let Some(Correlation::Step { run_id, step_id }) = task.correlation() else {
                continue;
            };
            if !step_runs.contains_key(&run_id) {
                match self.store.list_step_runs(&run_id).await {
                    Ok(runs) => {
                        step_runs.insert(run_id.clone(), runs);
                    }
                    Err(e) => {
                        warn!(%run_id, error = %e, "failed to load step runs");
                        report.errors += 1;
                        continue;
                    }
                }
            }
            let Some(step_run) = step_runs
                .get(&run_id)
                .and_then(|runs| runs.iter().find(|s| s.step_id == step_id && s.task_id == task.id))
            else {
                continue;
            };

            let state = StepState::from_task(task.state);
            if step_run.state == state {
                continue;
            }
            let updated = StepRun {
                state,
                started_at: task.started_at.or(step_run.started_at),
                finished_at: task.finished_at,
                ..step_run.clone()
            };
            match self.store.upsert_step_run(updated).await {
                Ok(()) => report.steps_synced += 1,
                Err(e) => {
                    warn!(%run_id, %step_id, error = %e, "failed to sync step run");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    // ========== Sequential runs ==========

    async fn advance_runs(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let runs = self.store.list_runs().await?;
        for run in runs
            .into_iter()
            .filter(|r| r.kind == RunKind::Sequential && r.state == RunState::Running)
        {
            if let Err(e) = self.advance_run(&run, now, report).await {
                warn!(run_id = %run.id, error = %e, "failed to advance run");
                report.errors += 1;
            }
        }
        Ok(())
    }

    async fn advance_run(
        &self,
        run: &WorkflowRun,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let Some(workflow) = self.store.get_workflow(&run.workflow_id).await? else {
            warn!(run_id = %run.id, workflow_id = %run.workflow_id, "workflow missing, failing run");
            return self.finish_run(run, RunState::Failed, now, report).await;
        };
        let steps = workflow.ordered_steps();
        let step_runs = self.store.list_step_runs(&run.id).await?;

        let next = match step_runs.last() {
            None => 0,
            Some(last) => match last.state {
                StepState::Pending | StepState::Running => return Ok(()),
                StepState::Failed => {
                    return self.finish_run(run, RunState::Failed, now, report).await
                }
                StepState::Succeeded => {
                    match steps.iter().position(|s| s.id == last.step_id) {
                        Some(i) => i + 1,
                        None => steps.len(),
                    }
                }
            },
        };

        let Some(step) = steps.get(next) else {
            return self.finish_run(run, RunState::Succeeded, now, report).await;
        };

        let definition = match &step.definition_id {
            Some(id) => self.store.get_task_def(id).await?,
            None => None,
        };
        let Some(task) = step.to_task(&run.id, definition.as_ref()) else {
            warn!(run_id = %run.id, step_id = %step.id, "step has no executor, failing run");
            return self.finish_run(run, RunState::Failed, now, report).await;
        };

        let task_id = self.store.create_task(task).await?;
        self.store
            .upsert_step_run(StepRun {
                run_id: run.id.clone(),
                step_id: step.id.clone(),
                task_id,
                state: StepState::Pending,
                ord: step.ord,
                started_at: Some(now),
                finished_at: None,
            })
            .await?;
        debug!(run_id = %run.id, step_id = %step.id, %task_id, "step started");
        report.steps_started += 1;
        self.notifier.publish_tasks();
        Ok(())
    }

    async fn finish_run(
        &self,
        run: &WorkflowRun,
        state: RunState,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        if self.store.finish_run(&run.id, state, now).await? {
            info!(run_id = %run.id, %state, "workflow run finished");
            report.runs_finished += 1;
            self.notifier.publish_tasks();
        }
        Ok(())
    }

    // ========== Dispatch ==========

    async fn dispatch_pending(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let pending = self.store.list_tasks_by_state(TaskState::Pending).await?;
        for task in pending {
            let running = match self.store.mark_task_running(&task.id, now).await {
                Ok(Some(t)) => t,
                Ok(None) => continue,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "failed to mark task running");
                    report.errors += 1;
                    continue;
                }
            };
            report.dispatched += 1;
            self.spawn_dispatch(running).await;
        }
        if report.dispatched > 0 {
            self.notifier.publish_tasks();
        }
        Ok(())
    }

    async fn spawn_dispatch(&self, task: Task) {
        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        let notifier = self.notifier.clone();

        self.in_flight.lock().await.spawn(async move {
            debug!(task_id = %task.id, name = %task.name, executor = %task.executor, "dispatching");
            match dispatcher.dispatch(&task).await {
                Dispatch::Pushed { worker_id } => {
                    debug!(task_id = %task.id, %worker_id, "awaiting worker result");
                }
                Dispatch::Done(outcome) => {
                    let state = outcome.state;
                    match store.finish_task(&task.id, outcome, Utc::now()).await {
                        Ok(true) => {
                            debug!(task_id = %task.id, %state, "task finished");
                            notifier.publish_tasks();
                        }
                        Ok(false) => {
                            debug!(task_id = %task.id, %state, "late dispatch result ignored");
                        }
                        Err(e) => warn!(task_id = %task.id, error = %e, "failed to record outcome"),
                    }
                }
            }
        });
    }

    // ========== Watchdog ==========

    async fn watchdog(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let running = self.store.list_tasks_by_state(TaskState::Running).await?;
        for task in running {
            let Some(age) = task.running_for(now) else {
                continue;
            };
            let limit = self
                .dispatcher
                .effective_timeout(&task)
                .saturating_add(self.grace);
            if age < limit {
                continue;
            }
            match self
                .store
                .finish_task(&task.id, TaskOutcome::failed(WATCHDOG_ERROR), now)
                .await
            {
                Ok(true) => {
                    warn!(task_id = %task.id, ?age, ?limit, "watchdog failed task");
                    report.watchdog_expired += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "watchdog update failed");
                    report.errors += 1;
                }
            }
        }
        if report.watchdog_expired > 0 {
            self.notifier.publish_tasks();
        }
        Ok(())
    }
}

/// Log a dispatch task that panicked or was aborted.
fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined.map_err(Error::from) {
        warn!(error = %e, "dispatch task did not complete");
    }
}
