//! In-process builtin tasks.

use crate::core::task::TaskOutcome;
use serde_json::{json, Value};
use std::time::Duration;

/// Names served by the builtin backend, without the `builtin.` prefix.
pub const BUILTINS: &[&str] = &["echo", "sleep", "delay", "fail"];

const DEFAULT_SLEEP_SECS: f64 = 1.0;
const DEFAULT_DELAY_SECS: f64 = 3.0;

/// Run builtin `name` with `payload`. Sleeps are cut off at `budget`.
pub async fn run(name: &str, payload: &Value, budget: Duration) -> TaskOutcome {
    match name {
        "echo" => TaskOutcome::succeeded(payload.clone()),
        "sleep" => {
            let secs = seconds(payload, DEFAULT_SLEEP_SECS);
            if let Err(outcome) = pause(name, secs, budget).await {
                return outcome;
            }
            TaskOutcome::succeeded(json!({ "slept": secs }))
        }
        "delay" => {
            let secs = seconds(payload, DEFAULT_DELAY_SECS);
            if let Err(outcome) = pause(name, secs, budget).await {
                return outcome;
            }
            TaskOutcome::succeeded(json!({
                "message": format!("Delayed for {:.1} seconds", secs),
                "seconds": secs,
            }))
        }
        "fail" => TaskOutcome::failed("builtin fail"),
        _ => TaskOutcome::failed("unknown builtin"),
    }
}

/// `payload.seconds` as a non-negative number, else `default`.
fn seconds(payload: &Value, default: f64) -> f64 {
    payload
        .get("seconds")
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .unwrap_or(default)
}

async fn pause(name: &str, secs: f64, budget: Duration) -> Result<(), TaskOutcome> {
    // Anything too large for a Duration is over budget too.
    let wanted = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
    if wanted > budget {
        tokio::time::sleep(budget).await;
        return Err(TaskOutcome::timeout(format!(
            "builtin {} exceeded timeout of {}s",
            name,
            budget.as_secs()
        )));
    }
    tokio::time::sleep(wanted).await;
    Ok(())
}
