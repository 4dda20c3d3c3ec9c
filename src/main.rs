use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fleetctl::config::Config;
use fleetctl::core::WorkflowDag;
use fleetctl::dispatch::builtin::BUILTINS;
use fleetctl::dispatch::Dispatcher;
use fleetctl::log::LogLevel;
use fleetctl::notify::Notifier;
use fleetctl::orchestration::{
    seed_builtin_definitions, DagOrchestrator, FailoverLoop, TaskScheduler,
};
use fleetctl::store::{MemoryStore, Store};
use fleetctl::worker::{WorkerRegistry, WorkerServer};

/// fleetctl - fleet task scheduler, DAG engine and failover controller
#[derive(Parser, Debug)]
#[command(name = "fleetctl")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FLEETCTL_LOG=debug     Log filter (overrides --log-level)")]
pub struct Cli {
    /// Log level when FLEETCTL_LOG/RUST_LOG are unset
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the controller until Ctrl-C
    Serve {
        /// Config file (defaults to ~/.fleetctl/fleetctl.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Validate a DAG definition file and print its topological order
    Validate {
        /// Path to a JSON workflow DAG
        path: PathBuf,
    },

    /// List builtin task names
    Builtins,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    fleetctl::log::init(cli.log_level);

    match cli.command {
        Command::Serve { config } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(config))
        }
        Command::Validate { path } => validate(&path),
        Command::Builtins => {
            for name in BUILTINS {
                println!("builtin.{}", name);
            }
            Ok(())
        }
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let dag: WorkflowDag = serde_json::from_str(&raw).context("parsing DAG definition")?;
    dag.validate()?;
    let order = dag.topological_order()?;

    println!("DAG {} is valid ({} nodes, {} edges)", dag.name, dag.nodes.len(), dag.edges.len());
    for (i, id) in order.iter().enumerate() {
        let kind = dag.nodes.get(id).map(|n| n.kind.to_string()).unwrap_or_default();
        println!("  {:>3}. {} [{}]", i + 1, id, kind);
    }
    Ok(())
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref()).context("loading config")?;
    info!(?config, "fleetctl starting");

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let notifier = Notifier::new();
    seed_builtin_definitions(store.as_ref()).await?;

    let registry = WorkerRegistry::new(
        store.clone(),
        notifier.clone(),
        config.worker_queue_capacity,
    );
    let dispatcher = Dispatcher::new(store.clone(), registry.clone(), config.clone())?;

    let scheduler = Arc::new(TaskScheduler::new(
        store.clone(),
        dispatcher,
        notifier.clone(),
        &config,
    ));
    let orchestrator = Arc::new(DagOrchestrator::new(store.clone(), notifier.clone(), &config));
    let failover = Arc::new(FailoverLoop::new(store.clone(), notifier.clone(), &config));

    orchestrator.resume_runs().await?;

    let shutdown = CancellationToken::new();
    let server = WorkerServer::start(&config.worker_listen, registry, shutdown.clone())
        .await
        .with_context(|| format!("binding worker server on {}", config.worker_listen))?;
    println!("fleetctl serving, workers connect to {}", server.addr());

    let loops = vec![
        tokio::spawn(scheduler.run(shutdown.clone())),
        tokio::spawn(orchestrator.run(shutdown.clone())),
        tokio::spawn(failover.run(shutdown.clone())),
    ];

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();

    for handle in loops {
        if let Err(e) = handle.await {
            error!(error = %e, "loop task failed");
        }
    }
    server.shutdown().await;
    Ok(())
}
