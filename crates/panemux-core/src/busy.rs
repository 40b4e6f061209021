//! Busy debouncer: hysteresis-smoothed busy/idle per session.
//!
//! - **Busy entry**: a `not-busy -> busy` transition cancels any pending hold,
//!   raises `debounced_busy` immediately and starts the busy clock.
//! - **Idle hold**: a `busy -> not-busy` transition freezes the busy duration
//!   and arms a [`HoldTimer`]. Only when the hold expires does the debounced
//!   flag drop and the busy-to-idle callbacks run.
//! - **Blip suppression**: re-entering busy during the hold cancels it, so the
//!   debounced flag never flickers false for a short idle blip.
//!
//! Time is passed in. The runtime sleeps until [`BusyDebouncer::next_deadline`]
//! and then calls [`BusyDebouncer::advance`].

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::clock::{deadline_after, millis};
use crate::types::{SessionId, ShellState};

/// Default hold interval before a busy -> idle transition is confirmed.
pub const DEFAULT_HOLD_INTERVAL_MS: u64 = 2_000;

/// Callback invoked with `(session, frozen_busy_duration_ms)` once a hold expires.
pub type BusyToIdleCallback = Box<dyn FnMut(SessionId, u64) + Send>;

/// Per-session cancellable hold timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HoldTimer {
    deadline: DateTime<Utc>,
}

impl HoldTimer {
    fn arm(now: DateTime<Utc>, hold: TimeDelta) -> Self {
        Self {
            deadline: deadline_after(now, hold),
        }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// Debounce state of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusyDebounceState {
    pub debounced_busy: bool,
    /// Non-null iff the raw shell state is busy.
    pub busy_since: Option<DateTime<Utc>>,
    /// Set once per busy -> idle transition, cleared on the next busy entry.
    pub frozen_duration_ms: Option<u64>,
    hold: Option<HoldTimer>,
}

impl BusyDebounceState {
    pub fn hold(&self) -> Option<&HoldTimer> {
        self.hold.as_ref()
    }
}

/// A confirmed busy -> idle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusyToIdle {
    pub session_id: SessionId,
    pub duration_ms: u64,
}

pub struct BusyDebouncer {
    hold_interval: TimeDelta,
    states: BTreeMap<SessionId, BusyDebounceState>,
    callbacks: Vec<BusyToIdleCallback>,
}

impl std::fmt::Debug for BusyDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyDebouncer")
            .field("hold_interval", &self.hold_interval)
            .field("states", &self.states)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Default for BusyDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD_INTERVAL_MS)
    }
}

impl BusyDebouncer {
    pub fn new(hold_interval_ms: u64) -> Self {
        Self {
            hold_interval: millis(hold_interval_ms),
            states: BTreeMap::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn hold_interval_ms(&self) -> u64 {
        self.hold_interval.num_milliseconds().max(0) as u64
    }

    /// Register a busy-to-idle listener.
    pub fn on_busy_to_idle(&mut self, callback: BusyToIdleCallback) {
        self.callbacks.push(callback);
    }

    /// Feed a raw shell-state transition. Must be called with the value the
    /// registry holds *before* committing `after`.
    pub fn transition(
        &mut self,
        id: SessionId,
        before: ShellState,
        after: ShellState,
        now: DateTime<Utc>,
    ) {
        let hold_interval = self.hold_interval;
        let state = self.states.entry(id).or_default();
        match (before.is_busy(), after.is_busy()) {
            (false, true) => {
                state.hold = None;
                state.debounced_busy = true;
                state.busy_since = Some(now);
                state.frozen_duration_ms = None;
            }
            (true, false) => {
                let elapsed = state.busy_since.map_or(0, |since| elapsed_ms(since, now));
                state.frozen_duration_ms = Some(elapsed);
                state.busy_since = None;
                state.hold = Some(HoldTimer::arm(now, hold_interval));
            }
            _ => {}
        }
    }

    /// Fire every hold that is due at `now`, in deadline order.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<BusyToIdle> {
        let mut due: Vec<(DateTime<Utc>, SessionId)> = self
            .states
            .iter()
            .filter_map(|(id, st)| {
                st.hold
                    .filter(|h| h.is_due(now))
                    .map(|h| (h.deadline(), *id))
            })
            .collect();
        due.sort();

        let mut fired = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(state) = self.states.get_mut(&id) else {
                continue;
            };
            state.hold = None;
            state.debounced_busy = false;
            let duration_ms = state.frozen_duration_ms.unwrap_or(0);
            for callback in &mut self.callbacks {
                callback(id, duration_ms);
            }
            fired.push(BusyToIdle {
                session_id: id,
                duration_ms,
            });
        }
        fired
    }

    /// Earliest pending hold deadline across all sessions.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.states
            .values()
            .filter_map(|st| st.hold.map(|h| h.deadline()))
            .min()
    }

    pub fn is_busy(&self, id: SessionId) -> bool {
        self.states.get(&id).is_some_and(|st| st.debounced_busy)
    }

    /// Drives the sleep-prevention policy.
    pub fn is_any_busy(&self) -> bool {
        self.states.values().any(|st| st.debounced_busy)
    }

    /// Live elapsed time while busy, else the last frozen duration, else 0.
    pub fn busy_duration_ms(&self, id: SessionId, now: DateTime<Utc>) -> u64 {
        let Some(state) = self.states.get(&id) else {
            return 0;
        };
        match state.busy_since {
            Some(since) => elapsed_ms(since, now),
            None => state.frozen_duration_ms.unwrap_or(0),
        }
    }

    pub fn state(&self, id: SessionId) -> Option<&BusyDebounceState> {
        self.states.get(&id)
    }

    /// Cancel the session's hold and discard its state.
    pub fn remove(&mut self, id: SessionId) -> bool {
        self.states.remove(&id).is_some()
    }
}

fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    now.signed_duration_since(since).num_milliseconds().max(0) as u64
}

// ─── Tests ───────────────────────────────────────────────────────────
