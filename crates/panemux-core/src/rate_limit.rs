//! Rate-limit tracker: a time-windowed set of throttled agent backends.
//!
//! No retries of its own. The fallback controller's recovery timer queries
//! it to learn when a cooldown has run out.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::clock::{deadline_after, millis};
use crate::types::AgentType;

/// Cooldown used when the caller has no estimate (5 minutes).
pub const DEFAULT_COOLDOWN_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub detected_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}

impl RateLimitInfo {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.cooldown_until
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        self.cooldown_until
            .signed_duration_since(now)
            .num_milliseconds()
            .max(0) as u64
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitTracker {
    entries: BTreeMap<AgentType, RateLimitInfo>,
    default_cooldown: TimeDelta,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_MS)
    }
}

impl RateLimitTracker {
    pub fn new(default_cooldown_ms: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            default_cooldown: millis(default_cooldown_ms),
        }
    }

    /// Record a throttle. A later detection replaces the earlier window.
    pub fn mark_rate_limited(
        &mut self,
        agent: AgentType,
        cooldown_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> RateLimitInfo {
        let cooldown = cooldown_ms.map(millis).unwrap_or(self.default_cooldown);
        let info = RateLimitInfo {
            detected_at: now,
            cooldown_until: deadline_after(now, cooldown),
        };
        self.entries.insert(agent, info);
        info
    }

    /// True iff `now` is inside the recorded cooldown window.
    pub fn is_rate_limited(&self, agent: AgentType, now: DateTime<Utc>) -> bool {
        self.entries.get(&agent).is_some_and(|i| i.is_active(now))
    }

    pub fn clear(&mut self, agent: AgentType) -> bool {
        self.entries.remove(&agent).is_some()
    }

    pub fn info(&self, agent: AgentType) -> Option<&RateLimitInfo> {
        self.entries.get(&agent)
    }

    /// Drop windows that have run out; returns the agents released.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Vec<AgentType> {
        let expired: Vec<AgentType> = self
            .entries
            .iter()
            .filter(|(_, info)| !info.is_active(now))
            .map(|(agent, _)| *agent)
            .collect();
        for agent in &expired {
            self.entries.remove(agent);
        }
        expired
    }

    /// Earliest cooldown end still on record. Pruning at that instant
    /// releases the agent back to the fallback chain.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|info| info.cooldown_until).min()
    }

    pub fn limited_agents(&self, now: DateTime<Utc>) -> Vec<AgentType> {
        self.entries
            .iter()
            .filter(|(_, info)| info.is_active(now))
            .map(|(agent, _)| *agent)
            .collect()
    }
}
