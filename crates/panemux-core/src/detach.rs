//! Detachment broker: which sessions currently live in a floating window.
//!
//! Detaching never touches the backend connection. The floating window
//! reconnects to the same connection id, and its teardown signal may arrive
//! twice (window close and connection exit race), so `reattach` is idempotent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{ConnectionId, SessionId, WindowHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetachmentRecord {
    pub session_id: SessionId,
    pub window: WindowHandle,
    /// Connection the floating window was told to attach to.
    pub connection_id: Option<ConnectionId>,
    pub detached_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DetachmentBroker {
    records: HashMap<SessionId, DetachmentRecord>,
}

impl DetachmentBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mapping. Returns `false` when the session is already
    /// detached; the existing record wins.
    pub fn detach(
        &mut self,
        session_id: SessionId,
        window: WindowHandle,
        connection_id: Option<ConnectionId>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.records.contains_key(&session_id) {
            return false;
        }
        self.records.insert(
            session_id,
            DetachmentRecord {
                session_id,
                window,
                connection_id,
                detached_at: now,
            },
        );
        true
    }

    pub fn is_detached(&self, session_id: SessionId) -> bool {
        self.records.contains_key(&session_id)
    }

    /// Remove the mapping. A second call returns `None`.
    pub fn reattach(&mut self, session_id: SessionId) -> Option<DetachmentRecord> {
        self.records.remove(&session_id)
    }

    pub fn record(&self, session_id: SessionId) -> Option<&DetachmentRecord> {
        self.records.get(&session_id)
    }

    pub fn session_for_window(&self, window: &WindowHandle) -> Option<SessionId> {
        self.records
            .values()
            .find(|r| &r.window == window)
            .map(|r| r.session_id)
    }

    /// Ids from `all` that have no detachment record, order preserved.
    pub fn attached_ids(&self, all: impl IntoIterator<Item = SessionId>) -> Vec<SessionId> {
        all.into_iter().filter(|id| !self.is_detached(*id)).collect()
    }

    pub fn detached_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.records.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
