//! Native backend boundary: the process that owns the pseudo-terminals.
//!
//! [`Backend`] is the seam the engine depends on; tests inject a mock.
//! [`RpcBackend`] speaks newline-delimited JSON-RPC 2.0 over a Unix socket,
//! one connection per request, plus one long-lived `subscribe` connection
//! that streams `output`/`shell_state`/`title`/`exit` notifications.

use std::future::Future;

use panemux_core::{AgentDetectionResult, AgentType, BackendEvent, ConnectionId, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Buffered backend events before the reader task applies backpressure.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cannot connect to backend at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed backend message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("backend closed the connection without a response")]
    Closed,
}

/// What the backend needs to spawn a pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub session_id: SessionId,
    pub working_directory: Option<String>,
    pub agent: Option<AgentType>,
}

pub trait Backend: Send + Sync + 'static {
    fn create(
        &self,
        request: CreateRequest,
    ) -> impl Future<Output = Result<ConnectionId, BackendError>> + Send;

    fn close(&self, connection_id: ConnectionId) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn write(
        &self,
        connection_id: ConnectionId,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn detect(
        &self,
        agent: AgentType,
    ) -> impl Future<Output = Result<AgentDetectionResult, BackendError>> + Send;

    /// Open the event stream. The receiver ends when the backend goes away.
    fn subscribe(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<BackendEvent>, BackendError>> + Send;
}

// ─── RpcBackend ──────────────────────────────────────────────────

pub struct RpcBackend {
    socket_path: String,
}

impl RpcBackend {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn connect(&self) -> Result<UnixStream, BackendError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| BackendError::Connect {
                path: self.socket_path.clone(),
                source,
            })
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();

        writer
            .write_all(encode_request(method, params)?.as_bytes())
            .await?;
        writer.shutdown().await?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(BackendError::Closed);
        }
        decode_response(&line)
    }
}

impl Backend for RpcBackend {
    async fn create(&self, request: CreateRequest) -> Result<ConnectionId, BackendError> {
        let result = self.call("create", serde_json::to_value(&request)?).await?;
        Ok(serde_json::from_value(result["connection_id"].clone())?)
    }

    async fn close(&self, connection_id: ConnectionId) -> Result<(), BackendError> {
        self.call("close", serde_json::json!({ "connection_id": connection_id }))
            .await?;
        Ok(())
    }

    async fn write(&self, connection_id: ConnectionId, data: Vec<u8>) -> Result<(), BackendError> {
        // Commands are text; lossy conversion only affects invalid UTF-8.
        let text = String::from_utf8_lossy(&data);
        self.call(
            "write",
            serde_json::json!({ "connection_id": connection_id, "data": text }),
        )
        .await?;
        Ok(())
    }

    async fn detect(&self, agent: AgentType) -> Result<AgentDetectionResult, BackendError> {
        let result = self
            .call("detect_agent", serde_json::json!({ "agent": agent }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>, BackendError> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(encode_request("subscribe", serde_json::json!({}))?.as_bytes())
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            // Keep the write half open for the life of the subscription.
            let _writer = writer;
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_notification(&line) {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("dropping backend notification: {e}"),
                    },
                    Ok(None) => {
                        tracing::info!("backend event stream closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("backend event stream error: {e}");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

// ─── Wire helpers ────────────────────────────────────────────────

pub(crate) fn encode_request(
    method: &str,
    params: serde_json::Value,
) -> Result<String, serde_json::Error> {
    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    Ok(line)
}

pub(crate) fn decode_response(line: &str) -> Result<serde_json::Value, BackendError> {
    let response: serde_json::Value = serde_json::from_str(line.trim())?;
    if let Some(error) = response.get("error") {
        return Err(BackendError::Rpc {
            code: error["code"].as_i64().unwrap_or(-32603),
            message: error["message"].as_str().unwrap_or("unknown").to_string(),
        });
    }
    Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

/// Map a `{"method": "<event>", "params": {...}}` notification onto a
/// [`BackendEvent`]. Lines without a method (the subscribe ack) yield `None`.
pub(crate) fn decode_notification(line: &str) -> Result<Option<BackendEvent>, BackendError> {
    let message: serde_json::Value = serde_json::from_str(line.trim())?;
    let Some(method) = message.get("method").and_then(|m| m.as_str()) else {
        return Ok(None);
    };
    let mut params = message
        .get("params")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    if let Some(obj) = params.as_object_mut() {
        obj.insert("event".into(), serde_json::Value::String(method.to_string()));
    }
    Ok(Some(serde_json::from_value(params)?))
}
