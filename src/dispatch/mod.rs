//! Executor backends.
//!
//! [`Dispatcher::dispatch`] routes a `Running` task to its backend and
//! returns what happened. Backend failures are folded into a `Failed` or
//! `Timeout` [`TaskOutcome`]; nothing here returns an error to the
//! scheduler.

pub mod builtin;
pub mod embedded;
pub mod http;
pub mod process;
pub mod service;

use crate::config::Config;
use crate::core::task::{ExecutorKind, Task, TaskOutcome, BUILTIN_PREFIX, MAX_TIMEOUT_SECS};
use crate::error::Result;
use crate::store::Store;
use crate::worker::WorkerRegistry;
use http::CallbackClient;
use std::sync::Arc;
use std::time::Duration;

/// Result of handing a task to a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The backend finished; record this outcome.
    Done(TaskOutcome),
    /// Queued on a streaming worker; its result message finishes the task.
    Pushed { worker_id: String },
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: WorkerRegistry,
    client: CallbackClient,
    config: Config,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, registry: WorkerRegistry, config: Config) -> Result<Self> {
        Ok(Self {
            store,
            registry,
            client: CallbackClient::new()?,
            config,
        })
    }

    /// Time budget for one task, also used by the watchdog.
    ///
    /// The task's own `timeout_sec` when set; otherwise the process default
    /// for `os_process` and builtins, and the embedded call timeout for
    /// remote calls.
    pub fn effective_timeout(&self, task: &Task) -> Duration {
        if task.timeout_sec > 0 {
            return Duration::from_secs(task.timeout_sec.min(MAX_TIMEOUT_SECS));
        }
        if task.is_builtin() {
            return self.config.process_default_timeout();
        }
        match task.executor {
            ExecutorKind::OsProcess | ExecutorKind::Builtin => {
                self.config.process_default_timeout()
            }
            ExecutorKind::Embedded | ExecutorKind::Service => self.config.embedded_timeout(),
        }
    }

    /// Budget for a remote call: the embedded timeout, or the task's own
    /// timeout when that is shorter.
    fn call_timeout(&self, task: &Task) -> Duration {
        let base = self.config.embedded_timeout();
        if task.timeout_sec > 0 {
            base.min(Duration::from_secs(task.timeout_sec))
        } else {
            base
        }
    }

    async fn run_builtin(&self, task: &Task) -> TaskOutcome {
        let name = task.name.strip_prefix(BUILTIN_PREFIX).unwrap_or(&task.name);
        builtin::run(name, &task.payload, self.effective_timeout(task)).await
    }

    pub async fn dispatch(&self, task: &Task) -> Dispatch {
        if task.is_builtin() {
            return Dispatch::Done(self.run_builtin(task).await);
        }
        match task.executor {
            ExecutorKind::Builtin => Dispatch::Done(self.run_builtin(task).await),
            ExecutorKind::Embedded => {
                embedded::dispatch(
                    self.store.as_ref(),
                    &self.registry,
                    &self.client,
                    task,
                    self.call_timeout(task),
                )
                .await
            }
            ExecutorKind::Service => Dispatch::Done(
                service::dispatch(
                    self.store.as_ref(),
                    &self.client,
                    task,
                    self.call_timeout(task),
                )
                .await,
            ),
            ExecutorKind::OsProcess => Dispatch::Done(
                process::run(&task.payload, self.effective_timeout(task)).await,
            ),
        }
    }
}
