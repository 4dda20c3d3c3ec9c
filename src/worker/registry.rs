//! Registry of workers connected over the streaming channel.
//!
//! Each connected worker owns a bounded outbound queue. Pushing onto a full
//! queue fails immediately with [`PushError::QueueFull`] so the caller can
//! pick another worker or fall back to HTTP; nothing ever blocks on a slow
//! worker.
//!
//! A stream lives in [`WorkerRegistry::serve_stream`]: one receive loop
//! reading worker frames, one send loop draining the outbound queue. When
//! the stream closes or errors the worker is removed.

use crate::core::fleet::EmbeddedWorker;
use crate::core::task::{TargetKind, TaskId, TaskOutcome};
use crate::error::Result;
use crate::notify::Notifier;
use crate::store::Store;
use crate::worker::protocol::{
    read_frame, write_frame, Register, ServerMessage, TaskRequest, TaskResult, WorkerMessage,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a task could not be pushed to a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("worker {0} queue is full")]
    QueueFull(String),
    #[error("worker {0} disconnected")]
    Disconnected(String),
    #[error("worker {0} is not connected")]
    UnknownWorker(String),
}

/// A live stream connection.
struct WorkerConnection {
    info: EmbeddedWorker,
    /// Distinguishes a reconnect from the stream it replaced.
    conn_id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

/// Shared registry of streaming workers. Cheap to clone.
#[derive(Clone)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<HashMap<String, WorkerConnection>>>,
    store: Arc<dyn Store>,
    notifier: Notifier,
    queue_capacity: usize,
    next_conn: Arc<AtomicU64>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier, queue_capacity: usize) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            store,
            notifier,
            queue_capacity: queue_capacity.max(1),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a worker and return its connection id and outbound queue.
    ///
    /// A worker re-registering under the same id replaces the old
    /// connection; the old queue is closed.
    pub async fn register(
        &self,
        reg: Register,
        address: &str,
    ) -> Result<(u64, mpsc::Receiver<ServerMessage>)> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let info = EmbeddedWorker {
            id: reg.worker_id.clone(),
            node_id: reg.node_id,
            instance_id: reg.instance_id,
            app_name: reg.app_name,
            app_version: reg.app_version,
            address: address.to_string(),
            tasks: reg.tasks,
            labels: reg.labels,
            last_seen: Utc::now(),
        };
        self.store.upsert_embedded_worker(info.clone()).await?;
        info!(
            worker_id = %info.id,
            node_id = %info.node_id,
            tasks = ?info.tasks,
            "worker registered"
        );
        self.workers
            .write()
            .await
            .insert(info.id.clone(), WorkerConnection { info, conn_id, tx });
        Ok((conn_id, rx))
    }

    /// Remove a worker if `conn_id` is still its current connection.
    pub async fn remove(&self, worker_id: &str, conn_id: u64) -> Result<()> {
        let removed = {
            let mut workers = self.workers.write().await;
            match workers.get(worker_id) {
                Some(conn) if conn.conn_id == conn_id => workers.remove(worker_id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.store.remove_embedded_worker(worker_id).await?;
            info!(worker_id, "worker removed");
        }
        Ok(())
    }

    /// Refresh a worker's `last_seen`.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let now = Utc::now();
        if let Some(conn) = self.workers.write().await.get_mut(worker_id) {
            conn.info.last_seen = now;
        }
        self.store.touch_embedded_worker(worker_id, now).await
    }

    /// Snapshot of connected workers.
    pub async fn list(&self) -> Vec<EmbeddedWorker> {
        let mut out: Vec<EmbeddedWorker> = self
            .workers
            .read()
            .await
            .values()
            .map(|c| c.info.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Connected workers supporting `task_name`, ordered by id.
    async fn supporting(&self, task_name: &str) -> Vec<EmbeddedWorker> {
        self.list()
            .await
            .into_iter()
            .filter(|w| w.tasks.iter().any(|t| t == task_name))
            .collect()
    }

    /// Pick a worker for a task: exact node match, else exact app match,
    /// else the first candidate.
    pub async fn find_worker(
        &self,
        task_name: &str,
        target_kind: TargetKind,
        target_ref: &str,
    ) -> Option<EmbeddedWorker> {
        let candidates = self.supporting(task_name).await;
        let preferred = if target_ref.is_empty() {
            None
        } else {
            match target_kind {
                TargetKind::Node => candidates.iter().find(|w| w.node_id == target_ref),
                TargetKind::App => candidates.iter().find(|w| w.app_name == target_ref),
                _ => None,
            }
        };
        preferred.or(candidates.first()).cloned()
    }

    /// Workers allowed to run a task under strict placement: a `node` or
    /// `app` target must match exactly, any other target accepts all.
    pub async fn candidates(
        &self,
        task_name: &str,
        target_kind: TargetKind,
        target_ref: &str,
    ) -> Vec<EmbeddedWorker> {
        let candidates = self.supporting(task_name).await;
        if target_ref.is_empty() {
            return candidates;
        }
        match target_kind {
            TargetKind::Node => candidates
                .into_iter()
                .filter(|w| w.node_id == target_ref)
                .collect(),
            TargetKind::App => candidates
                .into_iter()
                .filter(|w| w.app_name == target_ref)
                .collect(),
            _ => candidates,
        }
    }

    /// Queue a task for a worker without waiting.
    pub async fn push_task(
        &self,
        worker_id: &str,
        request: TaskRequest,
    ) -> std::result::Result<(), PushError> {
        let workers = self.workers.read().await;
        let conn = workers
            .get(worker_id)
            .ok_or_else(|| PushError::UnknownWorker(worker_id.to_string()))?;
        match conn.tx.try_send(ServerMessage::TaskRequest(request)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(worker_id, "worker queue full, task push dropped");
                Err(PushError::QueueFull(worker_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PushError::Disconnected(worker_id.to_string()))
            }
        }
    }

    /// Close out a task from a worker's result message.
    ///
    /// Only `Running` tasks accept a result. Results with an empty or
    /// unparseable task id, or for tasks not running, are ignored.
    pub async fn handle_result(&self, result: TaskResult) -> Result<bool> {
        if result.task_id.is_empty() {
            return Ok(false);
        }
        let task_id: TaskId = match result.task_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(task_id = %result.task_id, "result for malformed task id ignored");
                return Ok(false);
            }
        };
        if self.store.get_task(&task_id).await?.is_none() {
            warn!(%task_id, "result for unknown task ignored");
            return Ok(false);
        }
        let outcome = if result.error.is_empty() {
            TaskOutcome::succeeded(result.result.unwrap_or(serde_json::Value::Null))
        } else {
            match result.result {
                Some(body) => TaskOutcome::failed_with(body, result.error),
                None => TaskOutcome::failed(result.error),
            }
        };
        let applied = self
            .store
            .finish_running_task(&task_id, outcome, Utc::now())
            .await?;
        if applied {
            self.notifier.publish_tasks();
        } else {
            debug!(%task_id, "result for task not running ignored");
        }
        Ok(applied)
    }

    /// Drive one worker stream until it closes or `shutdown` fires.
    ///
    /// The first `register` frame is honored; later ones are ignored.
    /// Frames other than heartbeats that arrive before registration are
    /// dropped.
    pub async fn serve_stream<R, W>(
        &self,
        reader: R,
        writer: W,
        peer: &str,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);
        let mut writer = Some(writer);
        let mut registered: Option<(String, u64)> = None;
        let mut send_loop: Option<tokio::task::JoinHandle<()>> = None;

        let outcome = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                frame = read_frame::<_, WorkerMessage>(&mut reader) => frame,
            };
            let message = match frame {
                Ok(Some(message)) => message,
                Ok(None) => break Ok(()),
                Err(crate::Error::Protocol(e)) => {
                    warn!(peer, error = %e, "dropping malformed worker frame");
                    continue;
                }
                Err(e) => break Err(e),
            };
            trace!(peer, ?message, "worker frame");

            match message {
                WorkerMessage::Register(reg) => {
                    if registered.is_some() {
                        debug!(peer, "duplicate registration ignored");
                        continue;
                    }
                    let Some(mut w) = writer.take() else {
                        continue;
                    };
                    let worker_id = reg.worker_id.clone();
                    let (conn_id, mut rx) = self.register(reg, peer).await?;
                    registered = Some((worker_id.clone(), conn_id));
                    send_loop = Some(tokio::spawn(async move {
                        let ack = ServerMessage::Registered {
                            worker_id: worker_id.clone(),
                        };
                        if let Err(e) = write_frame(&mut w, &ack).await {
                            warn!(%worker_id, error = %e, "failed to ack registration");
                            return;
                        }
                        while let Some(message) = rx.recv().await {
                            if let Err(e) = write_frame(&mut w, &message).await {
                                warn!(%worker_id, error = %e, "worker send failed");
                                return;
                            }
                        }
                    }));
                }
                WorkerMessage::Result(result) => {
                    if registered.is_none() {
                        debug!(peer, "result before registration ignored");
                        continue;
                    }
                    if let Err(e) = self.handle_result(result).await {
                        warn!(peer, error = %e, "failed to record worker result");
                    }
                }
                WorkerMessage::Heartbeat => {
                    if let Some((worker_id, _)) = &registered {
                        if let Err(e) = self.heartbeat(worker_id).await {
                            warn!(%worker_id, error = %e, "failed to record heartbeat");
                        }
                    }
                }
            }
        };

        if let Some(handle) = send_loop {
            handle.abort();
        }
        if let Some((worker_id, conn_id)) = registered {
            self.remove(&worker_id, conn_id).await?;
        }
        outcome
    }
}
