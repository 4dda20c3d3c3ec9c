use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const DEFAULT_SCHED_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_DAG_TICK_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_EMBEDDED_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WATCHDOG_GRACE_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_TTL_SECS: u64 = 15;
pub const DEFAULT_FAILOVER_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_FAILOVER_JITTER_MAX_MS: u64 = 200;
pub const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WORKER_LISTEN: &str = "127.0.0.1:7070";
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 10;

/// Controller configuration.
///
/// Defaults, then an optional TOML file, then environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task scheduler tick period.
    pub sched_interval_secs: u64,
    /// DAG orchestrator tick period.
    pub dag_tick_interval_secs: u64,
    /// Budget for one embedded or service dispatch call.
    pub embedded_timeout_ms: u64,
    /// Slack added to a task's timeout before the watchdog fires.
    pub watchdog_grace_secs: u64,
    /// Node heartbeat age after which a node is unhealthy.
    pub heartbeat_ttl_secs: u64,
    pub failover_interval_secs: u64,
    pub failover_enabled: bool,
    /// Upper bound of the random pause between two migrations.
    pub failover_jitter_max_ms: u64,
    /// os_process timeout when the task sets none.
    pub process_default_timeout_secs: u64,
    /// Address the worker stream server binds.
    pub worker_listen: String,
    /// Outbound queue size per streaming worker.
    pub worker_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sched_interval_secs: DEFAULT_SCHED_INTERVAL_SECS,
            dag_tick_interval_secs: DEFAULT_DAG_TICK_INTERVAL_SECS,
            embedded_timeout_ms: DEFAULT_EMBEDDED_TIMEOUT_MS,
            watchdog_grace_secs: DEFAULT_WATCHDOG_GRACE_SECS,
            heartbeat_ttl_secs: DEFAULT_HEARTBEAT_TTL_SECS,
            failover_interval_secs: DEFAULT_FAILOVER_INTERVAL_SECS,
            failover_enabled: true,
            failover_jitter_max_ms: DEFAULT_FAILOVER_JITTER_MAX_MS,
            process_default_timeout_secs: DEFAULT_PROCESS_TIMEOUT_SECS,
            worker_listen: DEFAULT_WORKER_LISTEN.to_string(),
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".fleetctl"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("fleetctl.toml"))
    }

    /// Load from `path` (or the default location), then apply the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        let mut config = Self::from_file(&path)?;
        config.apply_env_from(|k| std::env::var(k).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    /// Apply environment-style overrides read through `lookup`.
    ///
    /// Unparseable or non-positive numbers are ignored with a warning.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let positive = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    warn!(key, value = %raw, "ignoring invalid config value");
                    None
                }
            }
        };

        if let Some(n) = positive("TASK_SCHED_INTERVAL_SEC") {
            self.sched_interval_secs = n;
        }
        if let Some(n) = positive("TASK_EMBEDDED_TIMEOUT_MS") {
            self.embedded_timeout_ms = n;
        }
        if let Some(n) = positive("HEARTBEAT_TTL_SEC") {
            self.heartbeat_ttl_secs = n;
        }
        if let Some(n) = positive("FAILOVER_INTERVAL_SEC") {
            self.failover_interval_secs = n;
        }
        if let Some(raw) = lookup("FAILOVER_ENABLED") {
            if !raw.is_empty() {
                self.failover_enabled = parse_flag(&raw);
            }
        }
        if let Some(addr) = lookup("WORKER_LISTEN_ADDR").filter(|a| !a.is_empty()) {
            self.worker_listen = addr;
        }
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("sched_interval_secs", self.sched_interval_secs),
            ("dag_tick_interval_secs", self.dag_tick_interval_secs),
            ("embedded_timeout_ms", self.embedded_timeout_ms),
            ("heartbeat_ttl_secs", self.heartbeat_ttl_secs),
            ("failover_interval_secs", self.failover_interval_secs),
            ("process_default_timeout_secs", self.process_default_timeout_secs),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((name, _)) = zero {
            return Err(Error::Config(format!("{} must be positive", name)));
        }
        if self.worker_queue_capacity == 0 {
            return Err(Error::Config(
                "worker_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sched_interval(&self) -> Duration {
        Duration::from_secs(self.sched_interval_secs)
    }

    pub fn dag_tick_interval(&self) -> Duration {
        Duration::from_secs(self.dag_tick_interval_secs)
    }

    pub fn embedded_timeout(&self) -> Duration {
        Duration::from_millis(self.embedded_timeout_ms)
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_secs(self.watchdog_grace_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn failover_interval(&self) -> Duration {
        Duration::from_secs(self.failover_interval_secs)
    }

    pub fn failover_jitter_max(&self) -> Duration {
        Duration::from_millis(self.failover_jitter_max_ms)
    }

    pub fn process_default_timeout(&self) -> Duration {
        Duration::from_secs(self.process_default_timeout_secs)
    }
}

/// `1`, `true` and `yes` (any case) are true; anything else is false.
fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sched_interval(), Duration::from_secs(2));
        assert_eq!(config.embedded_timeout(), Duration::from_millis(5000));
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(15));
        assert_eq!(config.failover_interval(), Duration::from_secs(5));
        assert!(config.failover_enabled);
        assert_eq!(config.worker_queue_capacity, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_from(env(&[
            ("TASK_SCHED_INTERVAL_SEC", "7"),
            ("TASK_EMBEDDED_TIMEOUT_MS", "250"),
            ("HEARTBEAT_TTL_SEC", "30"),
            ("FAILOVER_INTERVAL_SEC", "9"),
            ("FAILOVER_ENABLED", "no"),
            ("WORKER_LISTEN_ADDR", "0.0.0.0:9000"),
        ]));
        assert_eq!(config.sched_interval_secs, 7);
        assert_eq!(config.embedded_timeout_ms, 250);
        assert_eq!(config.heartbeat_ttl_secs, 30);
        assert_eq!(config.failover_interval_secs, 9);
        assert!(!config.failover_enabled);
        assert_eq!(config.worker_listen, "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = Config::default();
        config.apply_env_from(env(&[
            ("TASK_SCHED_INTERVAL_SEC", "soon"),
            ("HEARTBEAT_TTL_SEC", "0"),
            ("FAILOVER_ENABLED", ""),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("on"));
        assert!(!parse_flag("0"));
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetctl.toml");
        fs::write(&path, "heartbeat_ttl_secs = 20\nfailover_enabled = false\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.heartbeat_ttl_secs, 20);
        assert!(!config.failover_enabled);
        assert_eq!(config.sched_interval_secs, DEFAULT_SCHED_INTERVAL_SECS);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = Config {
            sched_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
