//! HTTP callback client shared by the HTTP-worker fallback and the service
//! backend.
//!
//! Both POST `{taskId, name, payload}` and map the response the same way: a
//! 2xx body is the task result (JSON if it parses, else the raw text), any
//! other status fails the task with the status and body.

use crate::core::task::{Task, TaskOutcome};
use crate::error::Result;
use crate::worker::protocol::TaskRequest;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
}

impl CallbackClient {
    /// Workers and endpoints are addressed directly, never through a proxy.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().no_proxy().build()?,
        })
    }

    /// POST `task` to `url`, bounded by `timeout`.
    pub async fn post_task(&self, url: &str, task: &Task, timeout: Duration) -> TaskOutcome {
        debug!(task_id = %task.id, url, "posting task callback");
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&TaskRequest::for_task(task))
            .send()
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => return TaskOutcome::failed(e.to_string()),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return TaskOutcome::failed(e.to_string()),
        };
        let body = parse_body(&text);
        if status.is_success() {
            TaskOutcome::succeeded(body)
        } else {
            TaskOutcome::failed_with(body, format!("HTTP {}: {}", status, text.trim()))
        }
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
