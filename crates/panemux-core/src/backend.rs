//! Wire types for the native backend boundary.
//!
//! The backend owns the pseudo-terminals. It pushes one [`BackendEvent`] per
//! observation on a connection; the core never reads raw bytes itself.

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, ShellState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub connection_id: ConnectionId,
    #[serde(flatten)]
    pub kind: BackendEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackendEventKind {
    /// Output was produced. Only the size travels; contents stay in the backend.
    Output { bytes: usize },
    ShellState { state: ShellState },
    Title { title: String },
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
}

impl BackendEvent {
    pub fn new(connection_id: ConnectionId, kind: BackendEventKind) -> Self {
        Self {
            connection_id,
            kind,
        }
    }

    /// JSON-RPC notification method name for this event.
    pub fn method(&self) -> &'static str {
        match self.kind {
            BackendEventKind::Output { .. } => "output",
            BackendEventKind::ShellState { .. } => "shell_state",
            BackendEventKind::Title { .. } => "title",
            BackendEventKind::Exit { .. } => "exit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_flattens_kind_next_to_connection() {
        let json = r#"{"connection_id":"pty-1","event":"shell_state","state":"busy"}"#;
        let ev: BackendEvent = serde_json::from_str(json).expect("parse");
        assert_eq!(
            ev,
            BackendEvent::new(
                ConnectionId::new("pty-1"),
                BackendEventKind::ShellState {
                    state: ShellState::Busy
                }
            )
        );
        assert_eq!(ev.method(), "shell_state");
    }

    #[test]
    fn exit_code_is_optional() {
        let ev: BackendEvent =
            serde_json::from_str(r#"{"connection_id":"pty-2","event":"exit"}"#).expect("parse");
        assert_eq!(ev.kind, BackendEventKind::Exit { code: None });
    }
}
