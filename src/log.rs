//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Log levels:
//! - ERROR: failures that stop a loop or the server
//! - WARN: tick errors, dropped task pushes, unparseable config values
//! - INFO: startup, run completion, migrations, worker connect/disconnect
//! - DEBUG: per-task dispatch traces
//! - TRACE: stream frames
//!
//! The filter comes from `FLEETCTL_LOG` (full `EnvFilter` syntax), then
//! `RUST_LOG`, then the `--log-level` flag, then `info`. Output goes to
//! stderr.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "FLEETCTL_LOG";

/// Log levels selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Pick the filter directive: env first, then the flag.
fn filter_directive(
    lookup: impl Fn(&str) -> Option<String>,
    flag: Option<LogLevel>,
) -> String {
    lookup(LOG_ENV)
        .or_else(|| lookup("RUST_LOG"))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| flag.unwrap_or_default().as_str().to_string())
}

/// Install the global subscriber.
///
/// Calling it more than once is harmless; later calls are ignored.
pub fn init(flag: Option<LogLevel>) {
    let directive = filter_directive(|k| std::env::var(k).ok(), flag);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
