//! `embedded` backend: streaming workers first, HTTP workers second.

use super::http::CallbackClient;
use super::Dispatch;
use crate::core::fleet::HttpWorker;
use crate::core::task::{TargetKind, Task, TaskOutcome};
use crate::store::Store;
use crate::worker::protocol::TaskRequest;
use crate::worker::WorkerRegistry;
use std::time::Duration;
use tracing::debug;

pub const NO_WORKER: &str = "no suitable worker found";

/// Push to a matching streaming worker, else call a matching HTTP worker.
pub(super) async fn dispatch(
    store: &dyn Store,
    registry: &WorkerRegistry,
    client: &CallbackClient,
    task: &Task,
    timeout: Duration,
) -> Dispatch {
    let candidates = registry
        .candidates(&task.name, task.target_kind, &task.target_ref)
        .await;
    for worker in candidates {
        match registry
            .push_task(&worker.id, TaskRequest::for_task(task))
            .await
        {
            Ok(()) => {
                debug!(task_id = %task.id, worker_id = %worker.id, "task pushed to stream worker");
                return Dispatch::Pushed {
                    worker_id: worker.id,
                };
            }
            Err(e) => debug!(task_id = %task.id, error = %e, "stream worker unavailable"),
        }
    }

    let workers = match store.list_http_workers().await {
        Ok(w) => w,
        Err(e) => return Dispatch::Done(TaskOutcome::failed(e.to_string())),
    };
    match select_http_worker(&workers, task) {
        Some(worker) => {
            debug!(task_id = %task.id, worker_id = %worker.id, "dispatching to http worker");
            Dispatch::Done(client.post_task(&worker.url, task, timeout).await)
        }
        None => Dispatch::Done(TaskOutcome::failed(NO_WORKER)),
    }
}

/// First HTTP worker supporting the task that satisfies its target.
fn select_http_worker<'a>(workers: &'a [HttpWorker], task: &Task) -> Option<&'a HttpWorker> {
    let reference = task.target_ref.as_str();
    let label_is = |w: &HttpWorker, key: &str| w.labels.get(key).map(String::as_str) == Some(reference);

    let mut candidates = workers
        .iter()
        .filter(|w| w.supports(&task.name) && !w.url.is_empty());
    if reference.is_empty() {
        return candidates.next();
    }
    match task.target_kind {
        TargetKind::Node => candidates.find(|w| w.node_id == reference),
        TargetKind::Deployment => candidates.find(|w| label_is(w, "deploymentId")),
        TargetKind::App => {
            candidates.find(|w| label_is(w, "appName") || label_is(w, "serviceName"))
        }
        _ => candidates.next(),
    }
}
