//! UDS JSON-RPC client for CLI subcommands.

use panemux_core::AgentType;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub(crate) async fn rpc_call(socket_path: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to panemux at {socket_path}: {e}"))?;

    let (reader, mut writer) = stream.into_split();

    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut req = serde_json::to_string(&request)?;
    req.push('\n');
    writer.write_all(req.as_bytes()).await?;
    writer.shutdown().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Value = serde_json::from_str(line.trim())?;

    if let Some(error) = response.get("error") {
        anyhow::bail!("RPC error: {error}");
    }

    Ok(response["result"].clone())
}

/// `panemux status`: one line for busy state, one for the agent chain.
pub async fn cmd_status(socket_path: &str) -> anyhow::Result<()> {
    let status = rpc_call(socket_path, "status", json!({})).await?;
    println!("{}", format_status(&status));
    Ok(())
}

/// `panemux sessions`: one row per session.
pub async fn cmd_sessions(socket_path: &str) -> anyhow::Result<()> {
    let sessions = rpc_call(socket_path, "list_sessions", json!({})).await?;
    print!("{}", format_sessions(&sessions));
    Ok(())
}

pub async fn cmd_mark_rate_limited(
    socket_path: &str,
    agent: AgentType,
    cooldown_ms: Option<u64>,
) -> anyhow::Result<()> {
    let info = rpc_call(
        socket_path,
        "mark_rate_limited",
        json!({ "agent": agent, "cooldown_ms": cooldown_ms }),
    )
    .await?;
    let until = info["cooldown_until"].as_str().unwrap_or("?");
    println!("{agent} rate limited until {until}");
    Ok(())
}

pub async fn cmd_mark_available(socket_path: &str, agent: AgentType) -> anyhow::Result<()> {
    let status = rpc_call(socket_path, "mark_available", json!({ "agent": agent })).await?;
    println!("{}", format_fallback(&status));
    Ok(())
}

/// Pure formatting for `status`, separated for testability.
pub(crate) fn format_status(status: &Value) -> String {
    let sessions = status["sessions"].as_u64().unwrap_or(0);
    let busy = status["busy"].as_array().map_or(0, Vec::len);
    let detached = status["detached"].as_array().map_or(0, Vec::len);
    let mut out = format!("sessions: {sessions}  busy: {busy}  detached: {detached}");
    if status["any_busy"].as_bool() == Some(true) {
        out.push_str("  (keeping awake)");
    }
    out.push('\n');
    out.push_str(&format_fallback(&status["fallback"]));
    if let Some(limited) = status["rate_limited"].as_array().filter(|a| !a.is_empty()) {
        let names: Vec<&str> = limited.iter().filter_map(Value::as_str).collect();
        out.push_str(&format!("\nrate limited: {}", names.join(", ")));
    }
    out
}

pub(crate) fn format_fallback(fallback: &Value) -> String {
    let active = fallback["active_agent"].as_str().unwrap_or("?");
    let mut out = format!("agent: {active}");
    if fallback["all_unavailable"].as_bool() == Some(true) {
        out.push_str(" (all agents unavailable)");
    } else if fallback["using_fallback"].as_bool() == Some(true) {
        let primary = fallback["primary"].as_str().unwrap_or("?");
        out.push_str(&format!(" (fallback, primary {primary} unavailable)"));
    }
    out
}

pub(crate) fn format_sessions(sessions: &Value) -> String {
    let Some(rows) = sessions.as_array() else {
        return String::new();
    };
    let mut out = String::new();
    for s in rows {
        let id = s["id"].as_u64().unwrap_or(0);
        let name = s["display_name"].as_str().unwrap_or("");
        let shell = s["shell_state"].as_str().unwrap_or("unknown");
        let conn = s["backend_connection_id"].as_str().unwrap_or("-");
        let agent = s["bound_agent_type"].as_str().unwrap_or("-");
        let unread = if s["has_unread_activity"].as_bool() == Some(true) {
            "*"
        } else {
            " "
        };
        out.push_str(&format!(
            "s{id:<4}{unread} {shell:<8} {agent:<8} {conn:<12} {name}\n"
        ));
    }
    out
}
