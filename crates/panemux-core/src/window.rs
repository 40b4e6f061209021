//! Floating-window message contract.
//!
//! A floating window is addressed by an opaque label built from the session
//! id, the connection id and a display name. It never opens its own backend
//! connection. Messages between windows form a closed union so dispatch is
//! checked exhaustively at compile time.

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, SessionId, WindowHandle};

/// Everything a floating window is told when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingWindowSpec {
    pub session_id: SessionId,
    pub connection_id: Option<ConnectionId>,
    pub display_name: String,
}

impl FloatingWindowSpec {
    /// Stable label for the presentation layer. Characters outside
    /// `[A-Za-z0-9_-]` are replaced so the label is usable as a window key.
    pub fn handle(&self) -> WindowHandle {
        let conn = self
            .connection_id
            .as_ref()
            .map(ConnectionId::as_str)
            .unwrap_or("none");
        WindowHandle::new(format!(
            "float-{}-{}-{}",
            self.session_id.0,
            sanitize(conn),
            sanitize(&self.display_name)
        ))
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowMessageKind {
    Opened,
    Focused,
    ReadyToReattach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowMessage {
    /// The floating window finished creating its surface.
    Opened {
        session_id: SessionId,
        window: WindowHandle,
    },
    Focused {
        session_id: SessionId,
    },
    /// Emitted on user close and on connection exit; may arrive twice.
    ReadyToReattach {
        session_id: SessionId,
        connection_id: Option<ConnectionId>,
    },
}

impl WindowMessage {
    pub fn kind(&self) -> WindowMessageKind {
        match self {
            Self::Opened { .. } => WindowMessageKind::Opened,
            Self::Focused { .. } => WindowMessageKind::Focused,
            Self::ReadyToReattach { .. } => WindowMessageKind::ReadyToReattach,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Opened { session_id, .. }
            | Self::Focused { session_id }
            | Self::ReadyToReattach { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_deterministic_and_sanitized() {
        let spec = FloatingWindowSpec {
            session_id: SessionId(4),
            connection_id: Some(ConnectionId::new("pty:9")),
            display_name: "vim main.rs".into(),
        };
        assert_eq!(spec.handle().as_str(), "float-4-pty_9-vim_main_rs");
        assert_eq!(spec.handle(), spec.clone().handle());

        let unbound = FloatingWindowSpec {
            connection_id: None,
            ..spec
        };
        assert_eq!(unbound.handle().as_str(), "float-4-none-vim_main_rs");
    }

    #[test]
    fn messages_are_tagged_by_kind() {
        let msg = WindowMessage::ReadyToReattach {
            session_id: SessionId(2),
            connection_id: Some(ConnectionId::new("pty-2")),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["kind"], "ready_to_reattach");
        assert_eq!(json["session_id"], 2);

        let back: WindowMessage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.kind(), WindowMessageKind::ReadyToReattach);
        assert_eq!(back.session_id(), SessionId(2));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = serde_json::from_str::<WindowMessage>(r#"{"kind":"minimized","session_id":1}"#);
        assert!(err.is_err());
    }
}
