//! Session registry: the authoritative, single-writer store of sessions.
//!
//! The registry owns the [`BusyDebouncer`] and the [`DetachmentBroker`] so
//! that closing a session cascades through both. Every shell-state change is
//! forwarded to the debouncer with the *prior* stored value before the new
//! value is committed.
//!
//! Operations on unknown ids are no-ops: the UI may race a just-closed session.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::busy::{BusyDebouncer, BusyToIdle, BusyToIdleCallback};
use crate::detach::{DetachmentBroker, DetachmentRecord};
use crate::session::{Session, SessionPatch, SessionSpec};
use crate::types::{ConnectionId, SessionId, ShellState, WindowHandle};

/// Change notification delivered to registry observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    Created {
        session_id: SessionId,
    },
    Closed {
        session_id: SessionId,
        connection_id: Option<ConnectionId>,
    },
    Updated {
        session_id: SessionId,
    },
    ShellStateChanged {
        session_id: SessionId,
        from: ShellState,
        to: ShellState,
    },
    ConnectionBound {
        session_id: SessionId,
        connection_id: ConnectionId,
    },
    Renamed {
        session_id: SessionId,
        display_name: String,
    },
    ActiveChanged {
        session_id: Option<SessionId>,
    },
}

pub type RegistryObserver = Box<dyn FnMut(&RegistryEvent) + Send>;

/// Result of [`SessionRegistry::update`] on a known session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// `(before, after)` when the shell state actually changed.
    pub shell_transition: Option<(ShellState, ShellState)>,
    /// Pending resume command consumed by the first transition into idle.
    pub resume_command: Option<String>,
}

pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
    connections: HashMap<ConnectionId, SessionId>,
    next_id: u64,
    active: Option<SessionId>,
    debouncer: BusyDebouncer,
    broker: DetachmentBroker,
    observers: Vec<RegistryObserver>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("active", &self.active)
            .field("detached", &self.broker.len())
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(BusyDebouncer::default())
    }
}

impl SessionRegistry {
    pub fn new(debouncer: BusyDebouncer) -> Self {
        Self {
            sessions: BTreeMap::new(),
            connections: HashMap::new(),
            next_id: 1,
            active: None,
            debouncer,
            broker: DetachmentBroker::new(),
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: RegistryObserver) {
        self.observers.push(observer);
    }

    fn emit(&mut self, event: RegistryEvent) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    pub fn create(&mut self, spec: SessionSpec, now: DateTime<Utc>) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        let session = Session::from_spec(id, spec, now);
        debug!(session_id = %id, name = %session.display_name, "session created");
        self.sessions.insert(id, session);
        self.emit(RegistryEvent::Created { session_id: id });
        id
    }

    /// Remove the session, cancel its busy hold and drop any detachment.
    /// Returns the removed record (with its last connection id) so the caller
    /// can release the backend connection.
    pub fn close(&mut self, id: SessionId) -> Option<Session> {
        let Some(session) = self.sessions.remove(&id) else {
            trace!(session_id = %id, "close on unknown session ignored");
            return None;
        };
        if let Some(conn) = &session.backend_connection_id {
            self.connections.remove(conn);
        }
        self.debouncer.remove(id);
        self.broker.reattach(id);
        if self.active == Some(id) {
            self.active = None;
            self.emit(RegistryEvent::ActiveChanged { session_id: None });
        }
        debug!(session_id = %id, "session closed");
        self.emit(RegistryEvent::Closed {
            session_id: id,
            connection_id: session.backend_connection_id.clone(),
        });
        Some(session)
    }

    /// Bind the backend connection once the backend confirms it. Rejected when
    /// the connection is already bound to another live session.
    pub fn confirm_connection(&mut self, id: SessionId, connection_id: ConnectionId) -> bool {
        if let Some(owner) = self.connections.get(&connection_id) {
            if *owner != id {
                warn!(
                    session_id = %id,
                    owner = %owner,
                    connection_id = %connection_id,
                    "connection already bound to another session"
                );
                return false;
            }
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if let Some(previous) = session.backend_connection_id.replace(connection_id.clone()) {
            self.connections.remove(&previous);
        }
        self.connections.insert(connection_id.clone(), id);
        self.emit(RegistryEvent::ConnectionBound {
            session_id: id,
            connection_id,
        });
        true
    }

    /// Consume the pending resume command of an idle, connected session.
    pub fn take_resume_command(&mut self, id: SessionId) -> Option<String> {
        let session = self.sessions.get_mut(&id)?;
        if session.shell_state != ShellState::Idle || session.backend_connection_id.is_none() {
            return None;
        }
        session.pending_resume_command.take()
    }

    pub fn session_for_connection(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        self.connections.get(connection_id).copied()
    }

    // ─── Mutation ────────────────────────────────────────────────

    pub fn update(
        &mut self,
        id: SessionId,
        patch: SessionPatch,
        now: DateTime<Utc>,
    ) -> Option<UpdateOutcome> {
        let Some(session) = self.sessions.get_mut(&id) else {
            trace!(session_id = %id, "update on unknown session ignored");
            return None;
        };

        let mut outcome = UpdateOutcome::default();
        if let Some(next) = patch.shell_state {
            let prev = session.shell_state;
            if prev != next {
                self.debouncer.transition(id, prev, next, now);
                session.shell_state = next;
                outcome.shell_transition = Some((prev, next));
                if next == ShellState::Idle && session.backend_connection_id.is_some() {
                    outcome.resume_command = session.pending_resume_command.take();
                }
            }
        }
        session.apply_fields(patch);

        if let Some((from, to)) = outcome.shell_transition {
            self.emit(RegistryEvent::ShellStateChanged {
                session_id: id,
                from,
                to,
            });
        }
        self.emit(RegistryEvent::Updated { session_id: id });
        Some(outcome)
    }

    pub fn set_shell_state(
        &mut self,
        id: SessionId,
        state: ShellState,
        now: DateTime<Utc>,
    ) -> Option<UpdateOutcome> {
        self.update(id, SessionPatch::shell_state(state), now)
    }

    /// Select the active session. Clears its unread flag, keeps its shell state.
    pub fn set_active(&mut self, id: Option<SessionId>) -> bool {
        if let Some(id) = id {
            let Some(session) = self.sessions.get_mut(&id) else {
                return false;
            };
            session.has_unread_activity = false;
        }
        if self.active != id {
            self.active = id;
            self.emit(RegistryEvent::ActiveChanged { session_id: id });
        }
        true
    }

    pub fn active(&self) -> Option<SessionId> {
        self.active
    }

    /// User rename: pins the name against automatic title updates.
    pub fn rename(&mut self, id: SessionId, name: impl Into<String>) -> bool {
        let name = name.into();
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        session.display_name = name.clone();
        session.name_is_user_set = true;
        self.emit(RegistryEvent::Renamed {
            session_id: id,
            display_name: name,
        });
        true
    }

    /// Title reported by the terminal. Ignored once the user has named the session.
    pub fn apply_auto_title(&mut self, id: SessionId, title: &str) -> bool {
        let title = title.trim();
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.name_is_user_set || title.is_empty() || session.display_name == title {
            return false;
        }
        session.display_name = title.to_string();
        self.emit(RegistryEvent::Renamed {
            session_id: id,
            display_name: title.to_string(),
        });
        true
    }

    /// Output arrived: stamp it and mark unread unless the session is active.
    pub fn record_output(&mut self, id: SessionId, now: DateTime<Utc>) -> bool {
        let is_active = self.active == Some(id);
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        session.last_output_at = Some(now);
        if !is_active && !session.has_unread_activity {
            session.has_unread_activity = true;
            self.emit(RegistryEvent::Updated { session_id: id });
        }
        true
    }

    // ─── Busy debounce ───────────────────────────────────────────

    pub fn busy(&self) -> &BusyDebouncer {
        &self.debouncer
    }

    pub fn on_busy_to_idle(&mut self, callback: BusyToIdleCallback) {
        self.debouncer.on_busy_to_idle(callback);
    }

    pub fn advance_busy(&mut self, now: DateTime<Utc>) -> Vec<BusyToIdle> {
        self.debouncer.advance(now)
    }

    // ─── Detachment ──────────────────────────────────────────────

    pub fn broker(&self) -> &DetachmentBroker {
        &self.broker
    }

    /// Move the session's presentation into `window`. The backend connection
    /// is left untouched.
    pub fn detach(&mut self, id: SessionId, window: WindowHandle, now: DateTime<Utc>) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };
        let connection_id = session.backend_connection_id.clone();
        let detached = self.broker.detach(id, window, connection_id, now);
        if detached {
            debug!(session_id = %id, "session detached");
            self.emit(RegistryEvent::Updated { session_id: id });
        }
        detached
    }

    /// Idempotent: only the first call for a detached session returns a record.
    pub fn reattach(&mut self, id: SessionId) -> Option<DetachmentRecord> {
        let record = self.broker.reattach(id)?;
        debug!(session_id = %id, "session reattached");
        self.emit(RegistryEvent::Updated { session_id: id });
        Some(record)
    }

    pub fn is_detached(&self, id: SessionId) -> bool {
        self.broker.is_detached(id)
    }

    pub fn attached_ids(&self) -> Vec<SessionId> {
        self.broker.attached_ids(self.sessions.keys().copied())
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Ids in creation order.
    pub fn list_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
