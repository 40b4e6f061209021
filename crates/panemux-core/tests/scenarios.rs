//! End-to-end behaviour of a workspace driven the way the runtime drives it:
//! UI actions, backend observations and timer ticks, then drained events.

use chrono::{DateTime, TimeDelta, Utc};
use panemux_core::layout::{DEFAULT_RATIO, MAX_RATIO, MIN_RATIO};
use panemux_core::{
    AgentDetectionResult, AgentType, ConnectionId, FallbackEvent, SessionPatch, SessionSpec,
    ShellState, SplitDirection, TabLayout, WindowMessage, Workspace, WorkspaceEvent,
};

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .expect("valid RFC3339")
        .with_timezone(&Utc)
}

fn ms(n: i64) -> TimeDelta {
    TimeDelta::milliseconds(n)
}

fn fallback_events(events: &[WorkspaceEvent]) -> Vec<FallbackEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkspaceEvent::Fallback { event } => Some(event.clone()),
            _ => None,
        })
        .collect()
}

// ─── Layout ──────────────────────────────────────────────────────

#[test]
fn split_then_close_second_pane_restores_single_layout() {
    let mut ws = Workspace::default();
    let (tab, s1) = ws.open_tab(SessionSpec::default(), t0());
    let before = ws.layouts().get(tab).expect("tab").clone();

    let s2 = ws
        .split(tab, SplitDirection::Horizontal, t0())
        .expect("split");
    assert_eq!(ws.close_pane(tab, 1), Some(s2));

    let after = ws.layouts().get(tab).expect("tab");
    assert_eq!(*after, before);
    assert_eq!(*after, TabLayout::single(s1));
    assert!(!ws.registry().contains(s2));
    assert_eq!(ws.registry().active(), Some(s1));
}

#[test]
fn ratio_is_always_clamped() {
    let mut ws = Workspace::default();
    let (tab, _) = ws.open_tab(SessionSpec::default(), t0());
    ws.split(tab, SplitDirection::Vertical, t0()).expect("split");

    for (input, expected) in [
        (-1.0, MIN_RATIO),
        (0.0, MIN_RATIO),
        (0.2, 0.2),
        (0.35, 0.35),
        (0.8, 0.8),
        (0.95, MAX_RATIO),
        (f64::INFINITY, MAX_RATIO),
        (f64::NAN, DEFAULT_RATIO),
    ] {
        let stored = ws.set_ratio(tab, input).expect("tab exists");
        assert_eq!(stored, expected, "input {input}");
        assert_eq!(ws.layouts().get(tab).expect("tab").ratio(), expected);
    }
}

#[test]
fn split_is_a_no_op_when_already_split() {
    let mut ws = Workspace::default();
    let (tab, _) = ws.open_tab(SessionSpec::default(), t0());
    ws.split(tab, SplitDirection::Vertical, t0()).expect("split");
    let sessions = ws.registry().len();
    ws.drain_events();

    assert_eq!(ws.split(tab, SplitDirection::Horizontal, t0()), None);
    assert_eq!(ws.registry().len(), sessions);
    assert!(ws.drain_events().is_empty());
    assert_eq!(
        ws.layouts().get(tab).expect("tab").direction,
        SplitDirection::Vertical
    );
}

#[test]
fn split_vertical_then_close_first_pane() {
    let mut ws = Workspace::default();
    let (tab, s1) = ws.open_tab(SessionSpec::default(), t0());

    let s2 = ws.split(tab, SplitDirection::Vertical, t0()).expect("split");
    let layout = ws.layouts().get(tab).expect("tab");
    assert_eq!(layout.direction, SplitDirection::Vertical);
    assert_eq!(layout.panes(), &[s1, s2]);
    assert_eq!(layout.ratio(), 0.5);
    assert_eq!(layout.active_pane_index(), 1);
    assert_eq!(ws.registry().active(), Some(s2));

    assert_eq!(ws.close_pane(tab, 0), Some(s1));
    let layout = ws.layouts().get(tab).expect("tab");
    assert_eq!(layout.direction, SplitDirection::None);
    assert_eq!(layout.panes(), &[s2]);
    assert_eq!(layout.ratio(), 0.5);
    assert_eq!(layout.active_pane_index(), 0);
    assert!(!ws.registry().contains(s1));
}

// ─── Busy debounce ───────────────────────────────────────────────

#[test]
fn busy_holds_for_the_full_interval_then_fires_once() {
    let mut ws = Workspace::default();
    let (_, s1) = ws.open_tab(SessionSpec::default(), t0());

    ws.update_session(s1, SessionPatch::shell_state(ShellState::Busy), t0());
    let idle_at = t0() + ms(3_000);
    ws.update_session(s1, SessionPatch::shell_state(ShellState::Idle), idle_at);
    assert_eq!(ws.next_deadline(), Some(idle_at + ms(2_000)));
    ws.drain_events();

    for offset in [0, 1, 1_000, 1_999] {
        ws.tick(idle_at + ms(offset));
        assert!(ws.registry().busy().is_busy(s1), "still busy at +{offset}ms");
        assert!(ws.is_any_busy());
    }
    assert!(ws.drain_events().is_empty());

    ws.tick(idle_at + ms(2_000));
    assert!(!ws.registry().busy().is_busy(s1));
    assert!(!ws.is_any_busy());
    assert_eq!(
        ws.drain_events(),
        vec![WorkspaceEvent::BusyToIdle {
            session_id: s1,
            duration_ms: 3_000,
        }]
    );

    ws.tick(idle_at + ms(10_000));
    assert!(ws.drain_events().is_empty());
}

#[test]
fn idle_blip_inside_the_hold_never_reports_idle() {
    let mut ws = Workspace::default();
    let (_, s1) = ws.open_tab(SessionSpec::default(), t0());

    ws.update_session(s1, SessionPatch::shell_state(ShellState::Busy), t0());
    ws.update_session(s1, SessionPatch::shell_state(ShellState::Idle), t0() + ms(1_000));
    ws.update_session(s1, SessionPatch::shell_state(ShellState::Busy), t0() + ms(1_500));
    ws.drain_events();

    ws.tick(t0() + ms(5_000));
    assert!(ws.registry().busy().is_busy(s1));
    assert!(ws.drain_events().is_empty());
    assert_eq!(ws.next_deadline(), None);
}

#[test]
fn closing_a_busy_session_cancels_its_hold() {
    let mut ws = Workspace::default();
    let (tab, s1) = ws.open_tab(SessionSpec::default(), t0());
    let s2 = ws.split(tab, SplitDirection::Vertical, t0()).expect("split");

    ws.update_session(s2, SessionPatch::shell_state(ShellState::Busy), t0());
    ws.update_session(s2, SessionPatch::shell_state(ShellState::Idle), t0() + ms(500));
    ws.close_pane(tab, 1);
    ws.drain_events();

    assert_eq!(ws.next_deadline(), None);
    ws.tick(t0() + ms(10_000));
    assert!(ws.drain_events().is_empty());
    assert!(ws.registry().contains(s1));
}

// ─── Detachment ──────────────────────────────────────────────────

#[test]
fn detach_reattach_round_trip_keeps_the_connection() {
    let mut ws = Workspace::default();
    let (tab, s1) = ws.open_tab(SessionSpec::default(), t0());
    let conn = ConnectionId::new("pty-7");
    assert!(ws.confirm_connection(s1, conn.clone()));

    let spec = ws.detach(s1, t0()).expect("detach");
    assert_eq!(spec.connection_id, Some(conn.clone()));
    assert!(ws.registry().is_detached(s1));
    assert_eq!(ws.registry().active(), None);

    let record = ws.reattach(s1).expect("reattach");
    assert_eq!(record.connection_id, Some(conn.clone()));
    assert!(!ws.registry().is_detached(s1));
    assert_eq!(
        ws.registry().get(s1).expect("session").backend_connection_id,
        Some(conn.clone())
    );
    assert_eq!(ws.registry().active(), Some(s1));

    let reattached_once = ws.drain_events();
    assert!(ws.reattach(s1).is_none());
    assert!(ws.drain_events().is_empty());
    assert!(reattached_once.contains(&WorkspaceEvent::Reattached {
        session_id: s1,
        tab_id: Some(tab),
        connection_id: Some(conn),
    }));
}

#[test]
fn duplicate_window_signals_reattach_once() {
    let mut ws = Workspace::default();
    let (_, s1) = ws.open_tab(SessionSpec::default(), t0());
    let conn = ConnectionId::new("pty-1");
    ws.confirm_connection(s1, conn.clone());
    ws.detach(s1, t0()).expect("detach");
    ws.drain_events();

    let signal = WindowMessage::ReadyToReattach {
        session_id: s1,
        connection_id: Some(conn),
    };
    ws.handle_window_message(signal.clone());
    ws.handle_window_message(signal);

    let reattached = ws
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, WorkspaceEvent::Reattached { .. }))
        .count();
    assert_eq!(reattached, 1);
    assert!(!ws.registry().is_detached(s1));
}

// ─── Agent fallback ──────────────────────────────────────────────

#[test]
fn primary_outage_switches_and_recovers() {
    let mut ws = Workspace::default();

    ws.mark_agent_unavailable(AgentType::Claude, t0());
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);
    assert!(ws.fallback().is_using_fallback());

    ws.mark_agent_available(AgentType::Claude, t0() + ms(1_000));
    assert_eq!(ws.fallback().active_agent(), AgentType::Claude);
    assert!(!ws.fallback().is_using_fallback());
    assert_eq!(ws.fallback().next_deadline(), None);
}

#[test]
fn exhaustion_keeps_last_selection_and_reports_it() {
    let mut ws = Workspace::default();
    ws.mark_agent_unavailable(AgentType::Claude, t0());
    ws.mark_agent_unavailable(AgentType::Codex, t0());
    assert_eq!(ws.fallback().active_agent(), AgentType::Gemini);
    ws.drain_events();

    ws.mark_agent_unavailable(AgentType::Gemini, t0());
    assert_eq!(ws.fallback().active_agent(), AgentType::Gemini);
    assert!(ws.status(t0()).fallback.all_unavailable);
    assert!(
        fallback_events(&ws.drain_events()).contains(&FallbackEvent::AllUnavailable {
            active: AgentType::Gemini,
        })
    );

    let (_, id) = ws.create_agent_session(SessionSpec::default(), t0());
    assert_eq!(
        ws.registry().get(id).expect("session").bound_agent_type,
        Some(AgentType::Gemini)
    );
}

#[test]
fn rate_limited_primary_recovers_after_cooldown() {
    let mut ws = Workspace::default();
    ws.mark_rate_limited(AgentType::Claude, Some(90_000), t0());
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);
    assert_eq!(ws.next_deadline(), Some(t0() + ms(60_000)));
    ws.drain_events();

    ws.tick(t0() + ms(60_000));
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);
    assert!(fallback_events(&ws.drain_events()).is_empty());

    ws.tick(t0() + ms(120_000));
    assert_eq!(ws.fallback().active_agent(), AgentType::Claude);
    let events = fallback_events(&ws.drain_events());
    assert!(events.contains(&FallbackEvent::Recovered {
        from: AgentType::Codex,
        to: AgentType::Claude,
    }));
    assert!(events.contains(&FallbackEvent::RecoveryStopped));
    assert!(ws.status(t0() + ms(120_000)).rate_limited.is_empty());
}

#[test]
fn fallback_returns_to_the_chain_after_its_cooldown() {
    let mut ws = Workspace::default();
    ws.mark_rate_limited(AgentType::Claude, Some(600_000), t0());
    ws.mark_rate_limited(AgentType::Codex, Some(1_000), t0());
    assert_eq!(ws.fallback().active_agent(), AgentType::Gemini);
    ws.drain_events();

    ws.tick(t0() + ms(61_000));
    assert_eq!(ws.fallback().active_agent(), AgentType::Gemini);
    assert_eq!(ws.status(t0() + ms(61_000)).rate_limited, vec![AgentType::Claude]);

    ws.mark_agent_unavailable(AgentType::Gemini, t0() + ms(62_000));
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);
    assert!(!ws.status(t0() + ms(62_000)).fallback.all_unavailable);
    assert!(
        fallback_events(&ws.drain_events()).contains(&FallbackEvent::Switched {
            from: AgentType::Gemini,
            to: AgentType::Codex,
            using_fallback: true,
        })
    );
}

#[test]
fn primary_missing_from_path_is_not_revived_by_recovery() {
    let mut ws = Workspace::default();
    ws.apply_detection(AgentType::Claude, AgentDetectionResult::missing(), t0());
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);

    ws.tick(t0() + ms(60_001));
    ws.tick(t0() + ms(120_002));
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);
    assert!(ws.fallback().is_using_fallback());
    assert!(
        !fallback_events(&ws.drain_events())
            .iter()
            .any(|e| matches!(e, FallbackEvent::Recovered { .. }))
    );
}

#[test]
fn extreme_cooldown_is_clamped_not_fatal() {
    let mut ws = Workspace::default();
    let info = ws.mark_rate_limited(AgentType::Claude, Some(u64::MAX), t0());
    assert!(info.cooldown_until > t0() + TimeDelta::days(36_500));
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);

    ws.tick(t0() + ms(60_000));
    assert_eq!(ws.fallback().active_agent(), AgentType::Codex);
    assert_eq!(ws.status(t0()).rate_limited, vec![AgentType::Claude]);

    ws.mark_agent_available(AgentType::Claude, t0() + ms(61_000));
    assert_eq!(ws.fallback().active_agent(), AgentType::Claude);
}

// ─── Resume commands ─────────────────────────────────────────────

#[test]
fn resume_command_held_until_the_connection_binds() {
    let mut ws = Workspace::default();
    let (_, s1) = ws.open_tab(
        SessionSpec {
            pending_resume_command: Some("gemini --resume last".into()),
            ..SessionSpec::default()
        },
        t0(),
    );
    ws.update_session(s1, SessionPatch::shell_state(ShellState::Idle), t0());
    assert!(
        !ws.drain_events()
            .iter()
            .any(|e| matches!(e, WorkspaceEvent::ResumeCommand { .. }))
    );

    let conn = ConnectionId::new("pty-2");
    ws.confirm_connection(s1, conn.clone());
    assert_eq!(
        ws.drain_events(),
        vec![WorkspaceEvent::ResumeCommand {
            session_id: s1,
            connection_id: Some(conn),
            command: "gemini --resume last".into(),
        }]
    );

    ws.update_session(s1, SessionPatch::shell_state(ShellState::Busy), t0());
    ws.update_session(s1, SessionPatch::shell_state(ShellState::Idle), t0());
    assert!(
        !ws.drain_events()
            .iter()
            .any(|e| matches!(e, WorkspaceEvent::ResumeCommand { .. }))
    );
}
