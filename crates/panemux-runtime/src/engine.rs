//! Engine: single-writer event loop that owns the [`Workspace`].
//!
//! `select!` over UI requests, backend events, internal completions (spawned
//! backend calls, deferred refreshes), the nearest timer deadline and the
//! cancellation token. Backend IO never runs inside the loop; it is spawned
//! and its result fed back through the internal channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use panemux_core::{
    AgentDetectionResult, AgentType, BackendEvent, ConnectionId, FallbackChainConfig,
    RegistryEvent, SessionId, SessionPatch, SessionSpec, SplitDirection, TabId, WindowMessage,
    Workspace, WorkspaceConfig, WorkspaceEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, CreateRequest};

const REQUEST_CHANNEL_CAPACITY: usize = 256;
const INTERNAL_CHANNEL_CAPACITY: usize = 256;
const NOTIFY_CHANNEL_CAPACITY: usize = 1024;

// ─── Requests ────────────────────────────────────────────────────

/// UI request, decoded straight from a JSON-RPC `{method, params}` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    OpenTab {
        #[serde(default)]
        spec: SessionSpec,
        /// Bind the session to the fallback chain's active agent.
        #[serde(default)]
        agent: bool,
    },
    CloseSession {
        session_id: SessionId,
    },
    CloseTab {
        tab_id: TabId,
    },
    Split {
        tab_id: TabId,
        direction: SplitDirection,
    },
    ClosePane {
        tab_id: TabId,
        index: usize,
    },
    SetRatio {
        tab_id: TabId,
        ratio: f64,
    },
    SetActivePane {
        tab_id: TabId,
        index: usize,
    },
    SetActive {
        session_id: Option<SessionId>,
    },
    UpdateSession {
        session_id: SessionId,
        patch: SessionPatch,
    },
    Rename {
        session_id: SessionId,
        name: String,
    },
    Detach {
        session_id: SessionId,
    },
    Reattach {
        session_id: SessionId,
    },
    WindowMessage {
        message: WindowMessage,
    },
    MarkRateLimited {
        agent: AgentType,
        #[serde(default)]
        cooldown_ms: Option<u64>,
    },
    MarkAvailable {
        agent: AgentType,
    },
    MarkUnavailable {
        agent: AgentType,
    },
    ConfigureFallback {
        config: FallbackChainConfig,
    },
    /// Invalidate cached detection and detect again.
    Detect {
        #[serde(default)]
        agents: Option<Vec<AgentType>>,
    },
    Status {},
    ListSessions {},
    ListTabs {},
}

impl Request {
    pub const METHODS: &'static [&'static str] = &[
        "open_tab",
        "close_session",
        "close_tab",
        "split",
        "close_pane",
        "set_ratio",
        "set_active_pane",
        "set_active",
        "update_session",
        "rename",
        "detach",
        "reattach",
        "window_message",
        "mark_rate_limited",
        "mark_available",
        "mark_unavailable",
        "configure_fallback",
        "detect",
        "status",
        "list_sessions",
        "list_tabs",
    ];
}

/// Pushed to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    Workspace(WorkspaceEvent),
    Registry(RegistryEvent),
    /// Ask the rendering layer to redraw a surface that was hidden.
    RefreshSurface {
        session_id: SessionId,
        tab_id: Option<TabId>,
    },
    Detection {
        agent: AgentType,
        result: AgentDetectionResult,
    },
}

pub struct Command {
    pub request: Request,
    pub reply: oneshot::Sender<Result<Value, EngineError>>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine stopped")]
    Stopped,

    #[error("{0}")]
    Rejected(String),
}

/// Results of spawned work, fed back into the loop.
#[derive(Debug)]
enum Internal {
    Connected {
        session_id: SessionId,
        result: Result<ConnectionId, BackendError>,
    },
    Detected {
        agent: AgentType,
        result: Result<AgentDetectionResult, BackendError>,
    },
    Refresh {
        session_id: SessionId,
        tab_id: Option<TabId>,
    },
}

// ─── Handle ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    notify_tx: broadcast::Sender<Notification>,
}

impl EngineHandle {
    pub async fn call(&self, request: Request) -> Result<Value, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command { request, reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }
}

// ─── Engine ──────────────────────────────────────────────────────

pub struct Engine<B: Backend> {
    workspace: Workspace,
    backend: Arc<B>,
    requests: mpsc::Receiver<Command>,
    backend_events: mpsc::Receiver<BackendEvent>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    notify_tx: broadcast::Sender<Notification>,
    refresh_delay: Duration,
    cancel: CancellationToken,
}

impl<B: Backend> Engine<B> {
    pub fn new(
        config: &WorkspaceConfig,
        refresh_delay: Duration,
        backend: Arc<B>,
        backend_events: mpsc::Receiver<BackendEvent>,
        cancel: CancellationToken,
    ) -> (Self, EngineHandle) {
        let (tx, requests) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);

        let mut workspace = Workspace::new(config);
        let registry_tx = notify_tx.clone();
        workspace.registry_mut().subscribe(Box::new(move |event| {
            // No subscribers is fine.
            let _ = registry_tx.send(Notification::Registry(event.clone()));
        }));

        let handle = EngineHandle {
            tx,
            notify_tx: notify_tx.clone(),
        };
        let engine = Self {
            workspace,
            backend,
            requests,
            backend_events,
            internal_tx,
            internal_rx,
            notify_tx,
            refresh_delay,
            cancel,
        };
        (engine, handle)
    }

    /// Runs until cancelled, or until the request or backend channel closes.
    pub async fn run(mut self) {
        info!("engine: event loop started");
        self.detect_agents(&AgentType::ALL);
        loop {
            let deadline = self.workspace.next_deadline();
            tokio::select! {
                command = self.requests.recv() => {
                    let Some(Command { request, reply }) = command else {
                        info!("engine: request channel closed, shutting down");
                        break;
                    };
                    let result = self.handle_request(request, Utc::now());
                    // Caller may have gone away.
                    let _ = reply.send(result);
                }
                event = self.backend_events.recv() => {
                    let Some(event) = event else {
                        info!("engine: backend event stream closed, shutting down");
                        break;
                    };
                    self.workspace.apply_backend_event(event, Utc::now());
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal, Utc::now());
                }
                _ = sleep_until(deadline) => {
                    self.workspace.tick(Utc::now());
                }
                _ = self.cancel.cancelled() => {
                    info!("engine: cancellation requested, shutting down");
                    break;
                }
            }
            self.flush();
        }
    }

    fn handle_request(&mut self, request: Request, now: DateTime<Utc>) -> Result<Value, EngineError> {
        let ws = &mut self.workspace;
        let value = match request {
            Request::OpenTab { spec, agent } => {
                let (tab_id, session_id) = if agent {
                    ws.create_agent_session(spec, now)
                } else {
                    ws.open_tab(spec, now)
                };
                json!({ "tab_id": tab_id, "session_id": session_id })
            }
            Request::CloseSession { session_id } => json!(ws.close_session(session_id).is_some()),
            Request::CloseTab { tab_id } => json!(ws.close_tab(tab_id)),
            Request::Split { tab_id, direction } => json!(ws.split(tab_id, direction, now)),
            Request::ClosePane { tab_id, index } => json!(ws.close_pane(tab_id, index)),
            Request::SetRatio { tab_id, ratio } => json!(ws.set_ratio(tab_id, ratio)),
            Request::SetActivePane { tab_id, index } => json!(ws.set_active_pane(tab_id, index)),
            Request::SetActive { session_id } => json!(ws.set_active(session_id)),
            Request::UpdateSession { session_id, patch } => {
                json!(ws.update_session(session_id, patch, now))
            }
            Request::Rename { session_id, name } => json!(ws.rename(session_id, &name)),
            Request::Detach { session_id } => json!(ws.detach(session_id, now)),
            Request::Reattach { session_id } => json!(ws.reattach(session_id).is_some()),
            Request::WindowMessage { message } => {
                ws.handle_window_message(message);
                Value::Null
            }
            Request::MarkRateLimited { agent, cooldown_ms } => {
                json!(ws.mark_rate_limited(agent, cooldown_ms, now))
            }
            Request::MarkAvailable { agent } => {
                ws.mark_agent_available(agent, now);
                json!(ws.fallback().status())
            }
            Request::MarkUnavailable { agent } => {
                ws.mark_agent_unavailable(agent, now);
                json!(ws.fallback().status())
            }
            Request::ConfigureFallback { config } => {
                config
                    .validate()
                    .map_err(|e| EngineError::Rejected(e.to_string()))?;
                ws.configure_fallback(config, now);
                json!(ws.fallback().status())
            }
            Request::Detect { agents } => {
                let agents = agents.unwrap_or_else(|| AgentType::ALL.to_vec());
                for agent in &agents {
                    ws.detection_mut().invalidate(*agent);
                }
                self.detect_agents(&agents);
                json!(agents)
            }
            Request::Status {} => json!(ws.status(now)),
            Request::ListSessions {} => json!(ws.registry().iter().collect::<Vec<_>>()),
            Request::ListTabs {} => {
                let tabs: Vec<Value> = ws
                    .layouts()
                    .iter()
                    .map(|(tab_id, layout)| json!({ "tab_id": tab_id, "layout": layout }))
                    .collect();
                Value::Array(tabs)
            }
        };
        Ok(value)
    }

    fn handle_internal(&mut self, internal: Internal, now: DateTime<Utc>) {
        match internal {
            Internal::Connected { session_id, result } => match result {
                Ok(connection_id) => {
                    if !self.workspace.registry().contains(session_id) {
                        debug!(session_id = %session_id, "session closed before connect, releasing");
                        self.spawn_close(connection_id);
                    } else if !self
                        .workspace
                        .confirm_connection(session_id, connection_id.clone())
                    {
                        self.spawn_close(connection_id);
                    }
                }
                Err(e) => warn!(session_id = %session_id, "backend create failed: {e}"),
            },
            Internal::Detected { agent, result } => match result {
                Ok(result) => {
                    let _ = self.notify_tx.send(Notification::Detection {
                        agent,
                        result: result.clone(),
                    });
                    self.workspace.apply_detection(agent, result, now);
                }
                Err(e) => warn!(agent = %agent, "agent detection failed: {e}"),
            },
            Internal::Refresh { session_id, tab_id } => {
                let registry = self.workspace.registry();
                if registry.contains(session_id) && !registry.is_detached(session_id) {
                    let _ = self
                        .notify_tx
                        .send(Notification::RefreshSurface { session_id, tab_id });
                }
            }
        }
    }

    /// Broadcast queued workspace events and start their side effects.
    fn flush(&mut self) {
        for event in self.workspace.drain_events() {
            match &event {
                WorkspaceEvent::SessionCreated { session_id, .. } => {
                    self.spawn_create(*session_id);
                }
                WorkspaceEvent::SessionClosed {
                    connection_id: Some(connection_id),
                    ..
                } => self.spawn_close(connection_id.clone()),
                WorkspaceEvent::ResumeCommand {
                    session_id,
                    connection_id,
                    command,
                } => match connection_id {
                    Some(connection_id) => self.spawn_write(connection_id.clone(), command),
                    None => warn!(session_id = %session_id, "resume command with no connection dropped"),
                },
                WorkspaceEvent::Reattached {
                    session_id, tab_id, ..
                } => self.schedule_refresh(*session_id, *tab_id),
                _ => {}
            }
            let _ = self.notify_tx.send(Notification::Workspace(event));
        }
    }

    // ─── Spawned backend work ────────────────────────────────────

    fn spawn_create(&self, session_id: SessionId) {
        let Some(session) = self.workspace.registry().get(session_id) else {
            return;
        };
        let request = CreateRequest {
            session_id,
            working_directory: session.working_directory.clone(),
            agent: session.bound_agent_type,
        };
        let backend = Arc::clone(&self.backend);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.create(request).await;
            let _ = tx.send(Internal::Connected { session_id, result }).await;
        });
    }

    fn spawn_close(&self, connection_id: ConnectionId) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.close(connection_id.clone()).await {
                warn!(connection_id = %connection_id, "backend close failed: {e}");
            }
        });
    }

    fn spawn_write(&self, connection_id: ConnectionId, command: &str) {
        let backend = Arc::clone(&self.backend);
        let mut data = command.as_bytes().to_vec();
        data.push(b'\r');
        tokio::spawn(async move {
            if let Err(e) = backend.write(connection_id.clone(), data).await {
                warn!(connection_id = %connection_id, "resume command write failed: {e}");
            }
        });
    }

    fn detect_agents(&self, agents: &[AgentType]) {
        for &agent in agents {
            let backend = Arc::clone(&self.backend);
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = backend.detect(agent).await;
                let _ = tx.send(Internal::Detected { agent, result }).await;
            });
        }
    }

    fn schedule_refresh(&self, session_id: SessionId, tab_id: Option<TabId>) {
        let tx = self.internal_tx.clone();
        let delay = self.refresh_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Refresh { session_id, tab_id }).await;
        });
    }
}

async fn sleep_until(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(at) => {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending().await,
    }
}
