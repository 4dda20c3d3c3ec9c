//! `service` backend: call a discovered service endpoint.

use super::http::CallbackClient;
use crate::core::task::{Task, TaskOutcome};
use crate::store::{EndpointQuery, Store};
use std::time::Duration;
use tracing::debug;

/// Task label selecting the endpoint version.
pub const LABEL_VERSION: &str = "serviceVersion";
/// Task label selecting the endpoint protocol (and URL scheme).
pub const LABEL_PROTOCOL: &str = "serviceProtocol";
/// Task label overriding the endpoint port.
pub const LABEL_PORT: &str = "servicePort";
/// Task label overriding the callback path.
pub const LABEL_PATH: &str = "servicePath";

pub const DEFAULT_CALLBACK_PATH: &str = "/task";

pub(super) async fn dispatch(
    store: &dyn Store,
    client: &CallbackClient,
    task: &Task,
    timeout: Duration,
) -> TaskOutcome {
    if task.target_ref.is_empty() {
        return TaskOutcome::failed("missing target ref (service name)");
    }
    let label = |key: &str| {
        task.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    };

    let query = EndpointQuery {
        service: task.target_ref.clone(),
        version: label(LABEL_VERSION).unwrap_or_default().to_string(),
        protocol: label(LABEL_PROTOCOL).unwrap_or_default().to_string(),
    };
    let endpoints = match store.discover_endpoints(&query).await {
        Ok(eps) => eps,
        Err(e) => return TaskOutcome::failed(e.to_string()),
    };
    let Some(endpoint) = endpoints.first() else {
        return TaskOutcome::failed("no healthy endpoints");
    };

    let scheme = if !query.protocol.is_empty() {
        query.protocol.as_str()
    } else if !endpoint.protocol.is_empty() {
        endpoint.protocol.as_str()
    } else {
        "http"
    };
    let port = label(LABEL_PORT)
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(endpoint.port);
    let path = match label(LABEL_PATH) {
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
        None => DEFAULT_CALLBACK_PATH.to_string(),
    };

    let url = format!(
        "{}://{}:{}{}",
        scheme.to_lowercase(),
        endpoint.ip,
        port,
        path
    );
    debug!(task_id = %task.id, instance_id = %endpoint.instance_id, %url, "calling service endpoint");
    client.post_task(&url, task, timeout).await
}
