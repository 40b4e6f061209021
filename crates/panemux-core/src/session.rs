//! Session record and the value types used to create and update it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{
    AgentType, AwaitingInput, ConnectionId, SessionId, ShellState, UsageLimitKind,
};

/// Upper bound for percentage fields.
const MAX_PERCENT: u8 = 100;

/// One interactive pane. Only [`crate::registry::SessionRegistry`] mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Set once the backend confirms a connection, cleared on close.
    pub backend_connection_id: Option<ConnectionId>,
    pub display_name: String,
    /// Once true, automatic title updates are ignored.
    pub name_is_user_set: bool,
    pub working_directory: Option<String>,
    pub font_size: Option<f32>,
    pub awaiting_input: AwaitingInput,
    pub has_unread_activity: bool,
    pub progress_percent: Option<u8>,
    pub shell_state: ShellState,
    /// Agent backend the session launched with. Fixed at creation.
    pub bound_agent_type: Option<AgentType>,
    /// Written to the backend once, on the first transition into idle.
    pub pending_resume_command: Option<String>,
    pub usage_limit_percent: Option<u8>,
    pub usage_limit_kind: Option<UsageLimitKind>,
    pub last_output_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn from_spec(id: SessionId, spec: SessionSpec, now: DateTime<Utc>) -> Self {
        let display_name = spec
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(id));
        Self {
            id,
            backend_connection_id: None,
            display_name,
            name_is_user_set: false,
            working_directory: spec.working_directory,
            font_size: spec.font_size,
            awaiting_input: AwaitingInput::None,
            has_unread_activity: false,
            progress_percent: None,
            shell_state: ShellState::Unknown,
            bound_agent_type: spec.bound_agent_type,
            pending_resume_command: spec.pending_resume_command,
            usage_limit_percent: None,
            usage_limit_kind: None,
            last_output_at: None,
            created_at: now,
        }
    }

    /// Apply every field of `patch` except `shell_state`, which the registry
    /// routes through the busy debouncer first.
    pub(crate) fn apply_fields(&mut self, patch: SessionPatch) {
        if let Some(awaiting) = patch.awaiting_input {
            self.awaiting_input = awaiting;
        }
        if let Some(unread) = patch.has_unread_activity {
            self.has_unread_activity = unread;
        }
        if let Some(progress) = patch.progress_percent {
            self.progress_percent = progress.map(|p| p.min(MAX_PERCENT));
        }
        if let Some(cwd) = patch.working_directory {
            self.working_directory = cwd;
        }
        if let Some(size) = patch.font_size {
            self.font_size = size;
        }
        if let Some(cmd) = patch.pending_resume_command {
            self.pending_resume_command = cmd;
        }
        if let Some(percent) = patch.usage_limit_percent {
            self.usage_limit_percent = percent.map(|p| p.min(MAX_PERCENT));
        }
        if let Some(kind) = patch.usage_limit_kind {
            self.usage_limit_kind = kind;
        }
    }
}

fn default_name(id: SessionId) -> String {
    format!("Terminal {}", id.0)
}

/// Initial fields for a new session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSpec {
    pub display_name: Option<String>,
    pub working_directory: Option<String>,
    pub font_size: Option<f32>,
    pub bound_agent_type: Option<AgentType>,
    pub pending_resume_command: Option<String>,
}

/// Partial update. `None` leaves a field alone; for nullable fields
/// `Some(None)` clears it (JSON `null`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default)]
    pub awaiting_input: Option<AwaitingInput>,
    #[serde(default)]
    pub has_unread_activity: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub progress_percent: Option<Option<u8>>,
    #[serde(default)]
    pub shell_state: Option<ShellState>,
    #[serde(default, deserialize_with = "double_option")]
    pub working_directory: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub font_size: Option<Option<f32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub pending_resume_command: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub usage_limit_percent: Option<Option<u8>>,
    #[serde(default, deserialize_with = "double_option")]
    pub usage_limit_kind: Option<Option<UsageLimitKind>>,
}

impl SessionPatch {
    #[must_use]
    pub fn shell_state(state: ShellState) -> Self {
        Self {
            shell_state: Some(state),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn awaiting_input(awaiting: AwaitingInput) -> Self {
        Self {
            awaiting_input: Some(awaiting),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn progress(percent: Option<u8>) -> Self {
        Self {
            progress_percent: Some(percent),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn usage_limit(percent: Option<u8>, kind: Option<UsageLimitKind>) -> Self {
        Self {
            usage_limit_percent: Some(percent),
            usage_limit_kind: Some(kind),
            ..Self::default()
        }
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}
