//! Wire messages of the worker stream and their framing.
//!
//! One JSON object per line in each direction, tagged by `type`:
//!
//! ```text
//! worker -> controller: {"type":"register","workerId":..,"nodeId":..,"tasks":[..]}
//!                       {"type":"result","taskId":..,"result":{..},"error":""}
//!                       {"type":"heartbeat"}
//! controller -> worker: {"type":"registered","workerId":..}
//!                       {"type":"task_request","taskId":..,"name":..,"payload":{..}}
//! ```

use crate::core::labels::Labels;
use crate::core::task::Task;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Registration sent once at the start of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub worker_id: String,
    pub node_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_version: String,
    /// Task names this worker executes.
    pub tasks: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
}

/// Outcome of a task pushed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default)]
    pub result: Option<Value>,
    /// Non-empty when the task failed.
    #[serde(default)]
    pub error: String,
}

/// Work pushed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl TaskRequest {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            name: task.name.clone(),
            payload: task.payload.clone(),
        }
    }
}

/// Messages sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register(Register),
    Result(TaskResult),
    Heartbeat,
}

/// Messages sent by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered { worker_id: String },
    TaskRequest(TaskRequest),
}

/// Read the next frame. Returns `Ok(None)` at end of stream; blank lines
/// are skipped.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("malformed frame: {}", e)));
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_register_wire_shape() {
        let msg: WorkerMessage = serde_json::from_value(json!({
            "type": "register",
            "workerId": "w1",
            "nodeId": "n1",
            "appName": "api",
            "tasks": ["resize"]
        }))
        .unwrap();
        match msg {
            WorkerMessage::Register(r) => {
                assert_eq!(r.worker_id, "w1");
                assert_eq!(r.app_name, "api");
                assert!(r.labels.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_and_result() {
        let hb: WorkerMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(hb, WorkerMessage::Heartbeat);

        let res: WorkerMessage =
            serde_json::from_str(r#"{"type":"result","taskId":"t1","error":"boom"}"#).unwrap();
        assert_eq!(
            res,
            WorkerMessage::Result(TaskResult {
                task_id: "t1".into(),
                result: None,
                error: "boom".into()
            })
        );
    }

    #[test]
    fn test_server_message_shape() {
        let v = serde_json::to_value(ServerMessage::TaskRequest(TaskRequest {
            task_id: "t1".into(),
            name: "resize".into(),
            payload: json!({"w": 10}),
        }))
        .unwrap();
        assert_eq!(
            v,
            json!({"type": "task_request", "taskId": "t1", "name": "resize", "payload": {"w": 10}})
        );
        let v = serde_json::to_value(ServerMessage::Registered {
            worker_id: "w1".into(),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "registered", "workerId": "w1"}));
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, server) = tokio::io::duplex(1024);
        write_frame(&mut client, &WorkerMessage::Heartbeat).await.unwrap();
        client.write_all(b"\n").await.unwrap();
        write_frame(&mut client, &WorkerMessage::Heartbeat).await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let first: Option<WorkerMessage> = read_frame(&mut reader).await.unwrap();
        let second: Option<WorkerMessage> = read_frame(&mut reader).await.unwrap();
        let end: Option<WorkerMessage> = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Some(WorkerMessage::Heartbeat));
        assert_eq!(second, Some(WorkerMessage::Heartbeat));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"{not json}\n").await.unwrap();
        drop(client);
        let mut reader = BufReader::new(server);
        let err = read_frame::<_, WorkerMessage>(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
