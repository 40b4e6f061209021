//! Fallback chain controller: which agent backend new launches use.
//!
//! Walks the ordered chain `[primary, ...fallbacks]` and selects the first
//! entry not currently unavailable. While a fallback is active (or the whole
//! chain is exhausted) and auto-recovery is enabled, a recovery timer
//! periodically asks the [`RateLimitTracker`] whether the primary's cooldown
//! has expired and, if so, marks the primary available again.
//!
//! Pure and deterministic: all time values are passed in. The runtime sleeps
//! until [`FallbackController::next_deadline`] and calls
//! [`FallbackController::tick`].

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{deadline_after, millis};
use crate::error::CoreError;
use crate::rate_limit::RateLimitTracker;
use crate::types::AgentType;

/// Default period of the recovery timer (1 minute).
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 60_000;

// ─── Config ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackChainConfig {
    pub primary: AgentType,
    /// Ordered preference after the primary. The primary is never listed.
    pub fallbacks: Vec<AgentType>,
    pub recovery_interval_ms: u64,
    pub auto_recovery: bool,
}

impl Default for FallbackChainConfig {
    fn default() -> Self {
        Self {
            primary: AgentType::Claude,
            fallbacks: vec![AgentType::Codex, AgentType::Gemini],
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
            auto_recovery: true,
        }
    }
}

impl FallbackChainConfig {
    /// Drop the primary and duplicates from `fallbacks`, keeping first order.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let mut seen = BTreeSet::from([self.primary]);
        self.fallbacks.retain(|agent| seen.insert(*agent));
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.recovery_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "recovery_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn chain(&self) -> Vec<AgentType> {
        std::iter::once(self.primary)
            .chain(self.fallbacks.iter().copied())
            .collect()
    }
}

// ─── Events ──────────────────────────────────────────────────────

/// Reported state changes. `AllUnavailable` is a status condition, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackEvent {
    Switched {
        from: AgentType,
        to: AgentType,
        using_fallback: bool,
    },
    Recovered {
        from: AgentType,
        to: AgentType,
    },
    /// Every agent in the chain is unavailable; `active` is left unchanged.
    AllUnavailable {
        active: AgentType,
    },
    /// A selection is possible again after exhaustion, without a switch.
    Resumed {
        agent: AgentType,
    },
    RecoveryStarted {
        interval_ms: u64,
    },
    RecoveryStopped,
}

// ─── Recovery timer ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryTimer {
    pub interval_ms: u64,
    pub next_check: DateTime<Utc>,
}

impl RecoveryTimer {
    fn start(interval_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            interval_ms,
            next_check: deadline_after(now, interval(interval_ms)),
        }
    }
}

fn interval(ms: u64) -> TimeDelta {
    millis(ms.max(1))
}

/// Read-only snapshot for UI consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackStatus {
    pub primary: AgentType,
    pub active_agent: AgentType,
    pub using_fallback: bool,
    pub all_unavailable: bool,
    pub unavailable: Vec<AgentType>,
    /// Agents whose binary was not found; the recovery timer skips them.
    pub missing: Vec<AgentType>,
    pub recovery: Option<RecoveryTimer>,
}

// ─── Controller ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FallbackController {
    config: FallbackChainConfig,
    active_agent: AgentType,
    using_fallback: bool,
    unavailable: BTreeSet<AgentType>,
    missing: BTreeSet<AgentType>,
    recovery: Option<RecoveryTimer>,
    exhausted: bool,
}

impl Default for FallbackController {
    fn default() -> Self {
        Self::new(FallbackChainConfig::default())
    }
}

impl FallbackController {
    pub fn new(config: FallbackChainConfig) -> Self {
        let config = config.normalized();
        Self {
            active_agent: config.primary,
            config,
            using_fallback: false,
            unavailable: BTreeSet::new(),
            missing: BTreeSet::new(),
            recovery: None,
            exhausted: false,
        }
    }

    /// Store a new chain. Leaves a fallback selection in place; otherwise the
    /// new primary becomes active. A running recovery timer is restarted under
    /// the new interval, or stopped when auto-recovery is now off.
    pub fn configure(&mut self, config: FallbackChainConfig, now: DateTime<Utc>) -> Vec<FallbackEvent> {
        let mut events = Vec::new();
        self.config = config.normalized();

        if !self.using_fallback && self.active_agent != self.config.primary {
            let from = self.active_agent;
            self.active_agent = self.config.primary;
            events.push(FallbackEvent::Switched {
                from,
                to: self.active_agent,
                using_fallback: false,
            });
        }
        self.using_fallback = self.active_agent != self.config.primary;

        let was_running = self.recovery.is_some();
        events.extend(self.stop_recovery_checks());
        if self.needs_recovery() && (was_running || self.using_fallback) {
            events.extend(self.start_recovery_checks(now));
        }
        events
    }

    pub fn mark_unavailable(&mut self, agent: AgentType, now: DateTime<Utc>) -> Vec<FallbackEvent> {
        self.unavailable.insert(agent);
        if agent == self.active_agent {
            return self.switch_to_fallback(now);
        }
        Vec::new()
    }

    /// Detection found no binary for `agent`. Unlike a rate limit this does
    /// not expire: only [`Self::mark_available`] lifts it.
    pub fn mark_missing(&mut self, agent: AgentType, now: DateTime<Utc>) -> Vec<FallbackEvent> {
        self.missing.insert(agent);
        self.mark_unavailable(agent, now)
    }

    /// Select the first available entry of the chain. When every entry is
    /// unavailable the active agent is left unchanged and `AllUnavailable` is
    /// reported.
    pub fn switch_to_fallback(&mut self, now: DateTime<Utc>) -> Vec<FallbackEvent> {
        let mut events = Vec::new();
        let selected = self
            .config
            .chain()
            .into_iter()
            .find(|agent| !self.unavailable.contains(agent));

        let Some(next) = selected else {
            self.exhausted = true;
            warn!(
                active = %self.active_agent,
                chain = ?self.config.chain(),
                "all agent backends unavailable, keeping current selection"
            );
            events.push(FallbackEvent::AllUnavailable {
                active: self.active_agent,
            });
            if self.needs_recovery() && self.recovery.is_none() {
                events.extend(self.start_recovery_checks(now));
            }
            return events;
        };

        let was_exhausted = std::mem::replace(&mut self.exhausted, false);
        let from = self.active_agent;
        self.active_agent = next;
        self.using_fallback = next != self.config.primary;

        if from != next {
            info!(from = %from, to = %next, using_fallback = self.using_fallback, "agent backend switched");
            events.push(FallbackEvent::Switched {
                from,
                to: next,
                using_fallback: self.using_fallback,
            });
        } else if was_exhausted {
            events.push(FallbackEvent::Resumed { agent: next });
        }

        if self.needs_recovery() {
            if self.recovery.is_none() {
                events.extend(self.start_recovery_checks(now));
            }
        } else {
            events.extend(self.stop_recovery_checks());
        }
        events
    }

    pub fn mark_available(&mut self, agent: AgentType, now: DateTime<Utc>) -> Vec<FallbackEvent> {
        self.unavailable.remove(&agent);
        self.missing.remove(&agent);
        if agent == self.config.primary && self.using_fallback {
            return self.try_recover_to_primary(now);
        }
        if self.exhausted || self.unavailable.contains(&self.active_agent) {
            return self.switch_to_fallback(now);
        }
        Vec::new()
    }

    /// Return to the primary if it is no longer unavailable.
    pub fn try_recover_to_primary(&mut self, _now: DateTime<Utc>) -> Vec<FallbackEvent> {
        let primary = self.config.primary;
        if self.unavailable.contains(&primary) {
            return Vec::new();
        }
        let mut events = Vec::new();
        let from = self.active_agent;
        let changed = from != primary || self.using_fallback || self.exhausted;
        self.active_agent = primary;
        self.using_fallback = false;
        self.exhausted = false;
        if changed {
            info!(from = %from, to = %primary, "recovered to primary agent backend");
            events.push(FallbackEvent::Recovered { from, to: primary });
        }
        events.extend(self.stop_recovery_checks());
        events
    }

    /// Run the recovery timer if due. Marks the primary available once its
    /// rate limit has expired, unless detection reported its binary missing.
    pub fn tick(&mut self, now: DateTime<Utc>, rate_limits: &RateLimitTracker) -> Vec<FallbackEvent> {
        let Some(timer) = self.recovery.as_mut() else {
            return Vec::new();
        };
        if now < timer.next_check {
            return Vec::new();
        }
        timer.next_check = deadline_after(now, interval(timer.interval_ms));

        let primary = self.config.primary;
        if self.missing.contains(&primary) || rate_limits.is_rate_limited(primary, now) {
            return Vec::new();
        }
        self.mark_available(primary, now)
    }

    /// Idempotent; safe when no timer is running.
    pub fn stop_recovery_checks(&mut self) -> Option<FallbackEvent> {
        self.recovery.take().map(|_| FallbackEvent::RecoveryStopped)
    }

    fn start_recovery_checks(&mut self, now: DateTime<Utc>) -> Option<FallbackEvent> {
        if !self.config.auto_recovery {
            return None;
        }
        let timer = RecoveryTimer::start(self.config.recovery_interval_ms, now);
        self.recovery = Some(timer);
        Some(FallbackEvent::RecoveryStarted {
            interval_ms: timer.interval_ms,
        })
    }

    fn needs_recovery(&self) -> bool {
        self.config.auto_recovery && (self.using_fallback || self.exhausted)
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn active_agent(&self) -> AgentType {
        self.active_agent
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    pub fn is_all_unavailable(&self) -> bool {
        self.exhausted
    }

    pub fn is_available(&self, agent: AgentType) -> bool {
        !self.unavailable.contains(&agent)
    }

    pub fn is_missing(&self, agent: AgentType) -> bool {
        self.missing.contains(&agent)
    }

    pub fn unavailable(&self) -> Vec<AgentType> {
        self.unavailable.iter().copied().collect()
    }

    pub fn config(&self) -> &FallbackChainConfig {
        &self.config
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.recovery.map(|t| t.next_check)
    }

    pub fn status(&self) -> FallbackStatus {
        FallbackStatus {
            primary: self.config.primary,
            active_agent: self.active_agent,
            using_fallback: self.using_fallback,
            all_unavailable: self.exhausted,
            unavailable: self.unavailable(),
            missing: self.missing.iter().copied().collect(),
            recovery: self.recovery,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use AgentType::{Claude as A, Codex as B, Gemini as C};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("valid RFC3339")
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    fn config(auto_recovery: bool) -> FallbackChainConfig {
        FallbackChainConfig {
            primary: A,
            fallbacks: vec![B, C],
            recovery_interval_ms: 10_000,
            auto_recovery,
        }
    }

    #[test]
    fn normalized_drops_primary_and_duplicates() {
        let cfg = FallbackChainConfig {
            primary: B,
            fallbacks: vec![A, B, C, A],
            ..FallbackChainConfig::default()
        }
        .normalized();
        assert_eq!(cfg.fallbacks, vec![A, C]);
        assert_eq!(cfg.chain(), vec![B, A, C]);
    }

    #[test]
    fn zero_interval_rejected() {
        let cfg = FallbackChainConfig {
            recovery_interval_ms: 0,
            ..FallbackChainConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(FallbackChainConfig::default().validate().is_ok());
    }

    #[test]
    fn primary_unavailable_switches_then_recovers() {
        let mut ctl = FallbackController::new(config(false));
        assert_eq!(ctl.active_agent(), A);

        let events = ctl.mark_unavailable(A, t0());
        assert_eq!(ctl.active_agent(), B);
        assert!(ctl.is_using_fallback());
        assert_eq!(
            events,
            vec![FallbackEvent::Switched {
                from: A,
                to: B,
                using_fallback: true
            }]
        );

        let events = ctl.mark_available(A, t0());
        assert_eq!(ctl.active_agent(), A);
        assert!(!ctl.is_using_fallback());
        assert_eq!(events, vec![FallbackEvent::Recovered { from: B, to: A }]);
    }

    #[test]
    fn non_active_unavailable_does_not_switch() {
        let mut ctl = FallbackController::new(config(true));
        assert!(ctl.mark_unavailable(C, t0()).is_empty());
        assert_eq!(ctl.active_agent(), A);
        assert!(!ctl.is_available(C));
    }

    #[test]
    fn exhaustion_keeps_last_selection_and_reports() {
        let mut ctl = FallbackController::new(config(false));
        ctl.mark_unavailable(A, t0());
        ctl.mark_unavailable(B, t0());
        assert_eq!(ctl.active_agent(), C);

        let events = ctl.mark_unavailable(C, t0());
        assert_eq!(ctl.active_agent(), C);
        assert!(ctl.is_all_unavailable());
        assert_eq!(events, vec![FallbackEvent::AllUnavailable { active: C }]);
        assert!(ctl.status().all_unavailable);
    }

    #[test]
    fn fallback_becoming_available_after_exhaustion_is_reselected() {
        let mut ctl = FallbackController::new(config(false));
        for agent in [A, B, C] {
            ctl.mark_unavailable(agent, t0());
        }
        let events = ctl.mark_available(B, t0());
        assert_eq!(ctl.active_agent(), B);
        assert!(!ctl.is_all_unavailable());
        assert_eq!(
            events,
            vec![FallbackEvent::Switched {
                from: C,
                to: B,
                using_fallback: true
            }]
        );
    }

    #[test]
    fn auto_recovery_timer_starts_and_stops() {
        let mut ctl = FallbackController::new(config(true));
        let events = ctl.mark_unavailable(A, t0());
        assert!(events.contains(&FallbackEvent::RecoveryStarted { interval_ms: 10_000 }));
        assert_eq!(ctl.next_deadline(), Some(t0() + secs(10)));

        let events = ctl.mark_available(A, t0() + secs(1));
        assert!(events.contains(&FallbackEvent::RecoveryStopped));
        assert!(ctl.next_deadline().is_none());
    }

    #[test]
    fn recovery_tick_waits_for_rate_limit_expiry() {
        let mut ctl = FallbackController::new(config(true));
        let mut limits = RateLimitTracker::default();
        limits.mark_rate_limited(A, Some(25_000), t0());
        ctl.mark_unavailable(A, t0());

        // Not yet due.
        assert!(ctl.tick(t0() + secs(5), &limits).is_empty());
        // Due, but still throttled: reschedules.
        assert!(ctl.tick(t0() + secs(10), &limits).is_empty());
        assert_eq!(ctl.next_deadline(), Some(t0() + secs(20)));
        assert!(ctl.tick(t0() + secs(20), &limits).is_empty());
        assert_eq!(ctl.active_agent(), B);

        // Cooldown over at 25s; next tick at 30s recovers.
        let events = ctl.tick(t0() + secs(30), &limits);
        assert_eq!(ctl.active_agent(), A);
        assert!(!ctl.is_using_fallback());
        assert!(events.contains(&FallbackEvent::Recovered { from: B, to: A }));
        assert!(ctl.next_deadline().is_none());
    }

    #[test]
    fn configure_restarts_running_timer_with_new_interval() {
        let mut ctl = FallbackController::new(config(true));
        ctl.mark_unavailable(A, t0());
        assert_eq!(ctl.next_deadline(), Some(t0() + secs(10)));

        let mut next = config(true);
        next.recovery_interval_ms = 3_000;
        let events = ctl.configure(next, t0() + secs(4));
        assert_eq!(
            events,
            vec![
                FallbackEvent::RecoveryStopped,
                FallbackEvent::RecoveryStarted { interval_ms: 3_000 }
            ]
        );
        assert_eq!(ctl.next_deadline(), Some(t0() + secs(7)));
        // Still on the fallback.
        assert_eq!(ctl.active_agent(), B);
    }

    #[test]
    fn configure_disabling_auto_recovery_cancels_timer() {
        let mut ctl = FallbackController::new(config(true));
        ctl.mark_unavailable(A, t0());
        let events = ctl.configure(config(false), t0());
        assert_eq!(events, vec![FallbackEvent::RecoveryStopped]);
        assert!(ctl.next_deadline().is_none());
    }

    #[test]
    fn configure_on_primary_adopts_new_primary() {
        let mut ctl = FallbackController::new(config(false));
        let cfg = FallbackChainConfig {
            primary: C,
            fallbacks: vec![A],
            ..config(false)
        };
        let events = ctl.configure(cfg, t0());
        assert_eq!(ctl.active_agent(), C);
        assert!(!ctl.is_using_fallback());
        assert_eq!(
            events,
            vec![FallbackEvent::Switched {
                from: A,
                to: C,
                using_fallback: false
            }]
        );
    }

    #[test]
    fn stop_recovery_is_idempotent() {
        let mut ctl = FallbackController::new(config(true));
        assert_eq!(ctl.stop_recovery_checks(), None);
        ctl.mark_unavailable(A, t0());
        assert_eq!(ctl.stop_recovery_checks(), Some(FallbackEvent::RecoveryStopped));
        assert_eq!(ctl.stop_recovery_checks(), None);
    }

    #[test]
    fn missing_primary_is_not_revived_by_recovery_tick() {
        let mut ctl = FallbackController::new(config(true));
        let limits = RateLimitTracker::default();
        ctl.mark_missing(A, t0());
        assert_eq!(ctl.active_agent(), B);
        assert!(ctl.is_missing(A));

        for n in 1..=5 {
            assert!(ctl.tick(t0() + secs(10 * n), &limits).is_empty());
        }
        assert_eq!(ctl.active_agent(), B);
        assert!(ctl.is_using_fallback());

        // A later detection that finds the binary lifts it.
        let events = ctl.mark_available(A, t0() + secs(60));
        assert!(events.contains(&FallbackEvent::Recovered { from: B, to: A }));
        assert!(!ctl.is_missing(A));
        assert!(ctl.status().missing.is_empty());
    }

    #[test]
    fn huge_recovery_interval_saturates() {
        let cfg = FallbackChainConfig {
            recovery_interval_ms: u64::MAX,
            ..config(true)
        };
        let mut ctl = FallbackController::new(cfg);
        let limits = RateLimitTracker::default();
        ctl.mark_unavailable(A, t0());
        assert_eq!(ctl.next_deadline(), Some(DateTime::<Utc>::MAX_UTC));
        assert!(ctl.tick(t0() + secs(86_400), &limits).is_empty());
        assert_eq!(ctl.active_agent(), B);
    }

    #[test]
    fn exhaustion_on_primary_recovers_through_tick() {
        let cfg = FallbackChainConfig {
            primary: A,
            fallbacks: vec![],
            recovery_interval_ms: 1_000,
            auto_recovery: true,
        };
        let mut ctl = FallbackController::new(cfg);
        let mut limits = RateLimitTracker::default();
        limits.mark_rate_limited(A, Some(1_500), t0());

        let events = ctl.mark_unavailable(A, t0());
        assert!(events.contains(&FallbackEvent::AllUnavailable { active: A }));
        assert!(ctl.next_deadline().is_some());

        assert!(ctl.tick(t0() + secs(1), &limits).is_empty());
        let events = ctl.tick(t0() + secs(2), &limits);
        assert!(events.contains(&FallbackEvent::Resumed { agent: A }));
        assert!(!ctl.is_all_unavailable());
        assert!(ctl.next_deadline().is_none());
    }
}
