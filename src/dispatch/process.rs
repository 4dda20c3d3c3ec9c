//! `os_process` backend: run an external command.
//!
//! Payload fields: `command` (required), `args` (strings), `workingDir`,
//! `env` (string map merged onto the inherited environment) and `input`
//! (written to stdin). Non-string entries are skipped.

use crate::core::task::TaskOutcome;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Default, PartialEq)]
struct ProcessSpec {
    command: String,
    args: Vec<String>,
    working_dir: String,
    env: Vec<(String, String)>,
    input: Option<String>,
}

impl ProcessSpec {
    fn from_payload(payload: &Value) -> Option<Self> {
        let command = payload.get("command")?.as_str()?.to_string();
        if command.is_empty() {
            return None;
        }
        let str_field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let args = payload
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let env = payload
            .get("env")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            command,
            args,
            working_dir: str_field("workingDir").unwrap_or_default(),
            env,
            input: str_field("input"),
        })
    }
}

/// Run the process described by `payload`, killing it after `timeout`.
pub async fn run(payload: &Value, timeout: Duration) -> TaskOutcome {
    let Some(spec) = ProcessSpec::from_payload(payload) else {
        return TaskOutcome::failed("command is required in payload");
    };

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !spec.working_dir.is_empty() {
        cmd.current_dir(&spec.working_dir);
    }

    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(command = %spec.command, error = %e, "process spawn failed");
            return TaskOutcome::failed(e.to_string());
        }
    };

    if let (Some(input), Some(mut stdin)) = (spec.input.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!(error = %e, "process stdin closed early");
            }
        });
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return TaskOutcome::failed(e.to_string()),
        Err(_) => return TaskOutcome::timeout("process timeout"),
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let result = json!({
        "command": spec.command,
        "args": spec.args,
        "workingDir": spec.working_dir,
        "exitCode": exit_code,
        "durationMs": started.elapsed().as_millis() as u64,
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    });

    if output.status.success() {
        TaskOutcome::succeeded(result)
    } else {
        TaskOutcome::failed_with(result, format!("process exited with code {}", exit_code))
    }
}
