//! UDS JSON-RPC server: connection-per-request, newline-delimited JSON.
//!
//! Every method in [`Request::METHODS`] is forwarded to the engine. The
//! special `subscribe` method keeps the connection open and streams
//! [`Notification`]s as JSON-RPC notifications until the client hangs up.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, RpcBackend};
use crate::config::Config;
use crate::engine::{Engine, EngineError, EngineHandle, Notification, Request};

/// Run the engine against the configured backend and serve UI clients
/// until Ctrl-C.
pub async fn serve(config: Config, socket_path: &str) -> anyhow::Result<()> {
    let backend_path = config.backend_socket_path();
    let backend = Arc::new(RpcBackend::new(backend_path.clone()));
    let events = backend.subscribe().await?;
    tracing::info!("subscribed to backend at {backend_path}");

    let cancel = CancellationToken::new();
    let (engine, handle) = Engine::new(
        &config.workspace_config(),
        config.refresh_delay(),
        backend,
        events,
        cancel.clone(),
    );
    let engine_task = tokio::spawn(engine.run());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });

    let result = run_server(socket_path, handle, cancel.clone()).await;
    cancel.cancel();
    engine_task.await?;
    let _ = std::fs::remove_file(socket_path);
    result
}

/// Bind `socket_path` and accept clients until `cancel` fires.
pub async fn run_server(
    socket_path: &str,
    handle: EngineHandle,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = bind(socket_path).await?;
    tracing::info!("UDS server listening on {socket_path}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let handle = handle.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handle, cancel).await {
                        tracing::debug!("connection error: {e}");
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

async fn bind(socket_path: &str) -> anyhow::Result<UnixListener> {
    let socket_dir = Path::new(socket_path)
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid socket path"))?;
    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if Path::new(socket_path).exists() {
        if UnixStream::connect(socket_path).await.is_err() {
            std::fs::remove_file(socket_path)?;
            tracing::info!("removed stale socket at {socket_path}");
        } else {
            anyhow::bail!("another panemux server is already running at {socket_path}");
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(listener)
}

async fn handle_connection(
    stream: UnixStream,
    handle: EngineHandle,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let request: Value = match serde_json::from_str(line.trim()) {
        Ok(v) => v,
        Err(e) => {
            let response = error_response(Value::Null, -32700, &format!("parse error: {e}"));
            write_line(&mut writer, &response).await?;
            return Ok(());
        }
    };
    let method = request["method"].as_str().unwrap_or("");
    let id = request["id"].clone();

    if method == "subscribe" {
        let mut notifications = handle.subscribe();
        write_line(&mut writer, &json!({"jsonrpc": "2.0", "result": {}, "id": id})).await?;
        loop {
            tokio::select! {
                received = notifications.recv() => match received {
                    Ok(notification) => {
                        write_line(&mut writer, &notification_message(&notification)?).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber lagging, notifications dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        return Ok(());
    }

    let response = match decode_request(method, &request["params"]) {
        Ok(req) => match handle.call(req).await {
            Ok(result) => json!({"jsonrpc": "2.0", "result": result, "id": id}),
            Err(e @ EngineError::Rejected(_)) => error_response(id, -32602, &e.to_string()),
            Err(e) => error_response(id, -32603, &e.to_string()),
        },
        Err((code, message)) => error_response(id, code, &message),
    };
    write_line(&mut writer, &response).await?;
    Ok(())
}

/// Map a method name and params onto a [`Request`]. Errors carry the
/// JSON-RPC error code.
pub(crate) fn decode_request(method: &str, params: &Value) -> Result<Request, (i64, String)> {
    if !Request::METHODS.contains(&method) {
        return Err((-32601, "method not found".to_string()));
    }
    let params = if params.is_null() { json!({}) } else { params.clone() };
    serde_json::from_value(json!({"method": method, "params": params}))
        .map_err(|e| (-32602, format!("invalid params: {e}")))
}

fn notification_message(notification: &Notification) -> anyhow::Result<Value> {
    Ok(json!({
        "jsonrpc": "2.0",
        "method": "notification",
        "params": serde_json::to_value(notification)?,
    }))
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": id,
    })
}

async fn write_line(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    value: &Value,
) -> anyhow::Result<()> {
    let mut out = serde_json::to_string(value)?;
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    Ok(())
}
