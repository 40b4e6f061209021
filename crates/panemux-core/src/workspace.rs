//! Workspace: the explicitly constructed context that owns every component.
//!
//! Translates UI actions, backend events, window messages and timer ticks
//! into component calls, and queues [`WorkspaceEvent`]s for the owner to
//! drain. Nothing here performs IO; the runtime executes the side effects the
//! events describe (release a connection, write a resume command, refresh a
//! surface).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::backend::{BackendEvent, BackendEventKind};
use crate::busy::{BusyDebouncer, DEFAULT_HOLD_INTERVAL_MS};
use crate::detach::DetachmentRecord;
use crate::detection::{AgentDetectionResult, DetectionCache};
use crate::error::CoreError;
use crate::fallback::{FallbackChainConfig, FallbackController, FallbackEvent, FallbackStatus};
use crate::layout::{LayoutController, TabLayout};
use crate::rate_limit::{DEFAULT_COOLDOWN_MS, RateLimitInfo, RateLimitTracker};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionPatch, SessionSpec};
use crate::types::{
    AgentType, ConnectionId, SessionId, ShellState, SplitDirection, TabId, WindowHandle,
};
use crate::window::{FloatingWindowSpec, WindowMessage};

// ─── Config ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub hold_interval_ms: u64,
    pub default_cooldown_ms: u64,
    pub fallback: FallbackChainConfig,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            hold_interval_ms: DEFAULT_HOLD_INTERVAL_MS,
            default_cooldown_ms: DEFAULT_COOLDOWN_MS,
            fallback: FallbackChainConfig::default(),
        }
    }
}

impl WorkspaceConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.hold_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "hold_interval_ms must be greater than zero".into(),
            ));
        }
        self.fallback.validate()
    }
}

// ─── Events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkspaceEvent {
    SessionCreated {
        session_id: SessionId,
        tab_id: TabId,
    },
    /// The runtime releases `connection_id` on the backend.
    SessionClosed {
        session_id: SessionId,
        connection_id: Option<ConnectionId>,
    },
    SessionExited {
        session_id: SessionId,
        code: Option<i32>,
    },
    LayoutChanged {
        tab_id: TabId,
        layout: TabLayout,
    },
    TabClosed {
        tab_id: TabId,
    },
    /// The presentation layer opens a floating window for `spec`.
    Detached {
        spec: FloatingWindowSpec,
        window: WindowHandle,
    },
    /// The surface must be reselected and refreshed after a short delay.
    Reattached {
        session_id: SessionId,
        tab_id: Option<TabId>,
        connection_id: Option<ConnectionId>,
    },
    BusyToIdle {
        session_id: SessionId,
        duration_ms: u64,
    },
    /// Write `command` to the session's connection, once.
    ResumeCommand {
        session_id: SessionId,
        connection_id: Option<ConnectionId>,
        command: String,
    },
    RateLimited {
        agent: AgentType,
        info: RateLimitInfo,
    },
    Fallback {
        event: FallbackEvent,
    },
}

/// Snapshot served to UI clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceStatus {
    pub sessions: usize,
    pub active: Option<SessionId>,
    pub any_busy: bool,
    pub busy: Vec<SessionId>,
    pub detached: Vec<SessionId>,
    pub rate_limited: Vec<AgentType>,
    pub fallback: FallbackStatus,
}

// ─── Workspace ───────────────────────────────────────────────────

#[derive(Debug)]
pub struct Workspace {
    registry: SessionRegistry,
    layouts: LayoutController,
    rate_limits: RateLimitTracker,
    fallback: FallbackController,
    detection: DetectionCache,
    outbox: Vec<WorkspaceEvent>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new(&WorkspaceConfig::default())
    }
}

impl Workspace {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            registry: SessionRegistry::new(BusyDebouncer::new(config.hold_interval_ms)),
            layouts: LayoutController::new(),
            rate_limits: RateLimitTracker::new(config.default_cooldown_ms),
            fallback: FallbackController::new(config.fallback.clone()),
            detection: DetectionCache::new(),
            outbox: Vec::new(),
        }
    }

    /// Take every event queued since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<WorkspaceEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn push(&mut self, event: WorkspaceEvent) {
        self.outbox.push(event);
    }

    fn push_fallback(&mut self, events: Vec<FallbackEvent>) {
        self.outbox
            .extend(events.into_iter().map(|event| WorkspaceEvent::Fallback { event }));
    }

    fn push_layout(&mut self, tab_id: TabId) {
        if let Some(layout) = self.layouts.get(tab_id) {
            let layout = layout.clone();
            self.push(WorkspaceEvent::LayoutChanged { tab_id, layout });
        }
    }

    // ─── Sessions and tabs ───────────────────────────────────────

    /// New tab with one fresh session, which becomes active.
    pub fn open_tab(&mut self, spec: SessionSpec, now: DateTime<Utc>) -> (TabId, SessionId) {
        let session_id = self.registry.create(spec, now);
        let tab_id = self.layouts.open_tab(session_id);
        self.registry.set_active(Some(session_id));
        self.push(WorkspaceEvent::SessionCreated { session_id, tab_id });
        self.push_layout(tab_id);
        (tab_id, session_id)
    }

    /// Like [`Self::open_tab`], binding the session to the agent currently
    /// selected by the fallback chain unless `bound_agent_type` is already set.
    pub fn create_agent_session(
        &mut self,
        mut spec: SessionSpec,
        now: DateTime<Utc>,
    ) -> (TabId, SessionId) {
        let agent = *spec
            .bound_agent_type
            .get_or_insert(self.fallback.active_agent());
        if self.fallback.is_all_unavailable() {
            warn!(agent = %agent, "launching agent session while every backend is unavailable");
        }
        self.open_tab(spec, now)
    }

    pub fn close_session(&mut self, id: SessionId) -> Option<Session> {
        let session = self.registry.close(id)?;
        match self.layouts.tab_of(id) {
            Some(tab_id) => {
                if self.layouts.forget_session(id).is_some() {
                    self.push(WorkspaceEvent::TabClosed { tab_id });
                } else {
                    self.select_tab_focus(tab_id);
                    self.push_layout(tab_id);
                }
            }
            None => trace!(session_id = %id, "closed session had no tab"),
        }
        self.push(WorkspaceEvent::SessionClosed {
            session_id: id,
            connection_id: session.backend_connection_id.clone(),
        });
        Some(session)
    }

    pub fn close_tab(&mut self, tab_id: TabId) -> bool {
        let Some(layout) = self.layouts.close_tab(tab_id) else {
            return false;
        };
        for id in layout.panes().to_vec() {
            if let Some(session) = self.registry.close(id) {
                self.push(WorkspaceEvent::SessionClosed {
                    session_id: id,
                    connection_id: session.backend_connection_id,
                });
            }
        }
        self.push(WorkspaceEvent::TabClosed { tab_id });
        true
    }

    /// Bind the backend connection. A resume command held back because the
    /// session went idle before it had a connection is released now.
    pub fn confirm_connection(&mut self, id: SessionId, connection_id: ConnectionId) -> bool {
        if !self.registry.confirm_connection(id, connection_id) {
            return false;
        }
        if let Some(command) = self.registry.take_resume_command(id) {
            self.push_resume(id, command);
        }
        true
    }

    /// Apply a partial update coming from the UI. A shell-state change takes
    /// the same path as a backend hint.
    pub fn update_session(&mut self, id: SessionId, patch: SessionPatch, now: DateTime<Utc>) -> bool {
        let Some(outcome) = self.registry.update(id, patch, now) else {
            return false;
        };
        if let Some(command) = outcome.resume_command {
            self.push_resume(id, command);
        }
        true
    }

    pub fn rename(&mut self, id: SessionId, name: &str) -> bool {
        self.registry.rename(id, name)
    }

    /// Select the active session, bringing its pane into focus.
    pub fn set_active(&mut self, id: Option<SessionId>) -> bool {
        if !self.registry.set_active(id) {
            return false;
        }
        if let Some(id) = id {
            self.focus_pane_of(id);
        }
        true
    }

    /// Point the owning tab's focus at `id`. Returns the tab.
    fn focus_pane_of(&mut self, id: SessionId) -> Option<TabId> {
        let tab_id = self.layouts.tab_of(id)?;
        let layout = self.layouts.get_mut(tab_id)?;
        let index = layout.panes().iter().position(|p| *p == id)?;
        if layout.active_pane_index() != index {
            layout.set_active_pane_index(index);
            self.push_layout(tab_id);
        }
        Some(tab_id)
    }

    // ─── Layout ──────────────────────────────────────────────────

    pub fn split(
        &mut self,
        tab_id: TabId,
        direction: SplitDirection,
        now: DateTime<Utc>,
    ) -> Option<SessionId> {
        let layout = self.layouts.get_mut(tab_id)?;
        let new_id = layout.split(&mut self.registry, direction, now)?;
        self.registry.set_active(Some(new_id));
        self.push(WorkspaceEvent::SessionCreated {
            session_id: new_id,
            tab_id,
        });
        self.push_layout(tab_id);
        Some(new_id)
    }

    /// Close one pane of a split tab, and the session it showed.
    pub fn close_pane(&mut self, tab_id: TabId, index: usize) -> Option<SessionId> {
        let removed = self.layouts.get_mut(tab_id)?.close_pane(index)?;
        if let Some(session) = self.registry.close(removed) {
            self.push(WorkspaceEvent::SessionClosed {
                session_id: removed,
                connection_id: session.backend_connection_id,
            });
        }
        self.select_tab_focus(tab_id);
        self.push_layout(tab_id);
        Some(removed)
    }

    pub fn set_ratio(&mut self, tab_id: TabId, ratio: f64) -> Option<f64> {
        let stored = self.layouts.get_mut(tab_id)?.set_ratio(ratio);
        self.push_layout(tab_id);
        Some(stored)
    }

    pub fn set_active_pane(&mut self, tab_id: TabId, index: usize) -> bool {
        let Some(layout) = self.layouts.get_mut(tab_id) else {
            return false;
        };
        if !layout.set_active_pane_index(index) {
            return false;
        }
        self.select_tab_focus(tab_id);
        self.push_layout(tab_id);
        true
    }

    fn select_tab_focus(&mut self, tab_id: TabId) {
        if let Some(id) = self.layouts.get(tab_id).and_then(TabLayout::active_session) {
            self.registry.set_active(Some(id));
        }
    }

    // ─── Detachment ──────────────────────────────────────────────

    /// Move the session into a floating window. The backend connection is
    /// untouched; the window is told which connection to attach to.
    pub fn detach(&mut self, id: SessionId, now: DateTime<Utc>) -> Option<FloatingWindowSpec> {
        let session = self.registry.get(id)?;
        let spec = FloatingWindowSpec {
            session_id: id,
            connection_id: session.backend_connection_id.clone(),
            display_name: session.display_name.clone(),
        };
        let window = spec.handle();
        if !self.registry.detach(id, window.clone(), now) {
            return None;
        }
        if self.registry.active() == Some(id) {
            let next = self.registry.attached_ids().first().copied();
            self.registry.set_active(next);
        }
        self.push(WorkspaceEvent::Detached {
            spec: spec.clone(),
            window,
        });
        Some(spec)
    }

    /// Idempotent. Reselects the session and asks for a deferred refresh.
    pub fn reattach(&mut self, id: SessionId) -> Option<DetachmentRecord> {
        let record = self.registry.reattach(id)?;
        let tab_id = self.focus_pane_of(id);
        self.registry.set_active(Some(id));
        self.push(WorkspaceEvent::Reattached {
            session_id: id,
            tab_id,
            connection_id: record.connection_id.clone(),
        });
        Some(record)
    }

    pub fn handle_window_message(&mut self, message: WindowMessage) {
        match message {
            WindowMessage::Opened { session_id, window } => {
                let expected = self.registry.broker().record(session_id).map(|r| &r.window);
                if expected != Some(&window) {
                    warn!(session_id = %session_id, window = %window, "opened window has no matching detachment");
                } else {
                    debug!(session_id = %session_id, window = %window, "floating window opened");
                }
            }
            WindowMessage::Focused { session_id } => {
                if self.registry.is_detached(session_id) {
                    self.registry.set_active(Some(session_id));
                }
            }
            WindowMessage::ReadyToReattach {
                session_id,
                connection_id,
            } => {
                let Some(record) = self.registry.broker().record(session_id) else {
                    trace!(session_id = %session_id, "duplicate reattach signal ignored");
                    return;
                };
                if record.connection_id != connection_id {
                    warn!(
                        session_id = %session_id,
                        expected = ?record.connection_id,
                        got = ?connection_id,
                        "reattach signal for a different connection ignored"
                    );
                    return;
                }
                self.reattach(session_id);
            }
        }
    }

    // ─── Backend events ──────────────────────────────────────────

    /// Route one backend observation to its session. Unknown connections are
    /// ignored. Returns whether a session consumed the event.
    pub fn apply_backend_event(&mut self, event: BackendEvent, now: DateTime<Utc>) -> bool {
        let Some(id) = self.registry.session_for_connection(&event.connection_id) else {
            trace!(connection_id = %event.connection_id, "event for unbound connection ignored");
            return false;
        };
        match event.kind {
            BackendEventKind::Output { .. } => {
                self.registry.record_output(id, now);
            }
            BackendEventKind::ShellState { state } => self.apply_shell_state(id, state, now),
            BackendEventKind::Title { title } => {
                self.registry.apply_auto_title(id, &title);
            }
            BackendEventKind::Exit { code } => {
                self.apply_shell_state(id, ShellState::Unknown, now);
                self.push(WorkspaceEvent::SessionExited {
                    session_id: id,
                    code,
                });
                // Races the floating window's own reattach signal.
                if self.registry.is_detached(id) {
                    self.reattach(id);
                }
            }
        }
        true
    }

    fn apply_shell_state(&mut self, id: SessionId, state: ShellState, now: DateTime<Utc>) {
        let Some(outcome) = self.registry.set_shell_state(id, state, now) else {
            return;
        };
        if let Some(command) = outcome.resume_command {
            self.push_resume(id, command);
        }
    }

    fn push_resume(&mut self, id: SessionId, command: String) {
        let connection_id = self
            .registry
            .get(id)
            .and_then(|s| s.backend_connection_id.clone());
        self.push(WorkspaceEvent::ResumeCommand {
            session_id: id,
            connection_id,
            command,
        });
    }

    // ─── Agents ──────────────────────────────────────────────────

    pub fn mark_rate_limited(
        &mut self,
        agent: AgentType,
        cooldown_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> RateLimitInfo {
        let info = self.rate_limits.mark_rate_limited(agent, cooldown_ms, now);
        debug!(agent = %agent, until = %info.cooldown_until, "agent rate limited");
        self.push(WorkspaceEvent::RateLimited { agent, info });
        let events = self.fallback.mark_unavailable(agent, now);
        self.push_fallback(events);
        info
    }

    /// Recovery text was seen in output: clear the throttle and re-enable.
    pub fn mark_agent_available(&mut self, agent: AgentType, now: DateTime<Utc>) {
        self.rate_limits.clear(agent);
        let events = self.fallback.mark_available(agent, now);
        self.push_fallback(events);
    }

    pub fn mark_agent_unavailable(&mut self, agent: AgentType, now: DateTime<Utc>) {
        let events = self.fallback.mark_unavailable(agent, now);
        self.push_fallback(events);
    }

    /// Cache a detection result and feed availability into the chain. A
    /// missing binary stays excluded until a later detection finds it; a found
    /// binary is only re-enabled when it is not inside a cooldown.
    pub fn apply_detection(
        &mut self,
        agent: AgentType,
        result: AgentDetectionResult,
        now: DateTime<Utc>,
    ) {
        let available = result.available;
        self.detection.record(agent, result, now);
        if !available {
            let events = self.fallback.mark_missing(agent, now);
            self.push_fallback(events);
        } else if !self.fallback.is_available(agent)
            && !self.rate_limits.is_rate_limited(agent, now)
        {
            let events = self.fallback.mark_available(agent, now);
            self.push_fallback(events);
        }
    }

    pub fn configure_fallback(&mut self, config: FallbackChainConfig, now: DateTime<Utc>) {
        let events = self.fallback.configure(config, now);
        self.push_fallback(events);
    }

    // ─── Timers ──────────────────────────────────────────────────

    /// Fire every timer due at `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        for fired in self.registry.advance_busy(now) {
            self.push(WorkspaceEvent::BusyToIdle {
                session_id: fired.session_id,
                duration_ms: fired.duration_ms,
            });
        }
        let events = self.fallback.tick(now, &self.rate_limits);
        self.push_fallback(events);
        // The primary comes back through the recovery timer only.
        let primary = self.fallback.config().primary;
        for agent in self.rate_limits.prune_expired(now) {
            if agent == primary || self.fallback.is_missing(agent) {
                continue;
            }
            debug!(agent = %agent, "cooldown over");
            let events = self.fallback.mark_available(agent, now);
            self.push_fallback(events);
        }
    }

    /// Earliest pending timer across the busy holds, the recovery timer and
    /// the cooldown windows.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        [
            self.registry.busy().next_deadline(),
            self.fallback.next_deadline(),
            self.rate_limits.next_expiry(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn is_any_busy(&self) -> bool {
        self.registry.busy().is_any_busy()
    }

    pub fn status(&self, now: DateTime<Utc>) -> WorkspaceStatus {
        let busy = self.registry.busy();
        WorkspaceStatus {
            sessions: self.registry.len(),
            active: self.registry.active(),
            any_busy: busy.is_any_busy(),
            busy: self
                .registry
                .list_ids()
                .into_iter()
                .filter(|id| busy.is_busy(*id))
                .collect(),
            detached: self.registry.broker().detached_ids(),
            rate_limited: self.rate_limits.limited_agents(now),
            fallback: self.fallback.status(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub fn layouts(&self) -> &LayoutController {
        &self.layouts
    }

    pub fn fallback(&self) -> &FallbackController {
        &self.fallback
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    pub fn detection(&self) -> &DetectionCache {
        &self.detection
    }

    pub fn detection_mut(&mut self) -> &mut DetectionCache {
        &mut self.detection
    }
}
