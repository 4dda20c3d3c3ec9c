//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building a wired controller over a `MemoryStore`
//! - Driving the scheduler and orchestrator by hand
//! - Fake HTTP workers and service endpoints (axum)
//! - A raw streaming worker client

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use fleetctl::config::Config;
use fleetctl::core::{RunState, Task, TaskId};
use fleetctl::dispatch::Dispatcher;
use fleetctl::notify::Notifier;
use fleetctl::orchestration::{
    seed_builtin_definitions, DagOrchestrator, FailoverLoop, TaskScheduler, TaskService,
};
use fleetctl::store::{MemoryStore, Store};
use fleetctl::worker::protocol::{read_frame, write_frame};
use fleetctl::worker::{Register, ServerMessage, WorkerMessage, WorkerRegistry};

/// Config with short timeouts and no failover jitter.
pub fn test_config() -> Config {
    Config {
        embedded_timeout_ms: 2000,
        failover_jitter_max_ms: 0,
        worker_listen: "127.0.0.1:0".to_string(),
        ..Config::default()
    }
}

/// Every controller component wired over one in-memory store.
pub struct Controller {
    pub store: Arc<MemoryStore>,
    pub notifier: Notifier,
    pub registry: WorkerRegistry,
    pub scheduler: TaskScheduler,
    pub orchestrator: DagOrchestrator,
    pub failover: FailoverLoop,
    pub tasks: TaskService,
    pub config: Config,
}

impl Controller {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new();
        seed_builtin_definitions(store.as_ref())
            .await
            .expect("Failed to seed builtins");

        let registry = WorkerRegistry::new(
            store.clone(),
            notifier.clone(),
            config.worker_queue_capacity,
        );
        let dispatcher = Dispatcher::new(store.clone(), registry.clone(), config.clone())
            .expect("Failed to build dispatcher");
        let scheduler = TaskScheduler::new(store.clone(), dispatcher, notifier.clone(), &config);
        let orchestrator = DagOrchestrator::new(store.clone(), notifier.clone(), &config);
        let failover = FailoverLoop::new(store.clone(), notifier.clone(), &config);
        let tasks = TaskService::new(store.clone(), notifier.clone());

        Self {
            store,
            notifier,
            registry,
            scheduler,
            orchestrator,
            failover,
            tasks,
            config,
        }
    }

    /// Id of the seeded definition for a builtin such as `"echo"`.
    pub async fn builtin_def(&self, name: &str) -> String {
        self.store
            .find_task_def_by_name(&format!("builtin.{}", name))
            .await
            .expect("Failed to query definitions")
            .expect("Builtin definition missing")
            .id
    }

    /// One scheduler tick with its dispatches drained.
    pub async fn schedule(&self) {
        self.scheduler.tick().await.expect("Scheduler tick failed");
        self.scheduler.wait_idle().await;
    }

    /// One scheduler round followed by one orchestrator tick.
    pub async fn round(&self) {
        self.schedule().await;
        self.orchestrator.tick().await;
    }

    /// Run rounds until the run is terminal or `max_rounds` pass.
    pub async fn drive_run(&self, run_id: &str, max_rounds: usize) -> RunState {
        for _ in 0..max_rounds {
            self.round().await;
            let run = self
                .store
                .get_run(run_id)
                .await
                .expect("Failed to read run")
                .expect("Run missing");
            if run.state.is_terminal() {
                return run.state;
            }
        }
        RunState::Running
    }

    pub async fn task(&self, id: &TaskId) -> Task {
        self.store
            .get_task(id)
            .await
            .expect("Failed to read task")
            .expect("Task missing")
    }

    /// Poll until the task is terminal.
    pub async fn wait_terminal(&self, id: &TaskId, timeout: Duration) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.task(id).await;
            if task.state.is_terminal() || tokio::time::Instant::now() >= deadline {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Serve `router` on an ephemeral local port.
pub async fn spawn_http(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("No local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// A streaming worker speaking the line protocol over TCP.
pub struct StreamWorker {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl StreamWorker {
    /// Connect and register, waiting for the ack.
    pub async fn connect(addr: SocketAddr, register: Register) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect worker");
        let (reader, writer) = stream.into_split();
        let mut worker = Self {
            reader: BufReader::new(reader),
            writer,
        };
        worker.send(&WorkerMessage::Register(register)).await;
        match worker.recv().await {
            Some(ServerMessage::Registered { .. }) => {}
            other => panic!("Expected registration ack, got {:?}", other),
        }
        worker
    }

    pub async fn send(&mut self, message: &WorkerMessage) {
        write_frame(&mut self.writer, message)
            .await
            .expect("Failed to send frame");
    }

    /// Next server frame, or `None` after two seconds or at end of stream.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        tokio::time::timeout(Duration::from_secs(2), read_frame(&mut self.reader))
            .await
            .ok()
            .and_then(|frame| frame.expect("Malformed server frame"))
    }
}

/// Registration for a worker on `node` serving `tasks`.
pub fn registration(worker_id: &str, node: &str, tasks: &[&str]) -> Register {
    Register {
        worker_id: worker_id.to_string(),
        node_id: node.to_string(),
        tasks: tasks.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}
