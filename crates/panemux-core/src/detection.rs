//! Agent binary detection results, cached until explicitly invalidated.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AgentType;

/// What the backend found when probing for an agent binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDetectionResult {
    pub available: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl AgentDetectionResult {
    pub fn missing() -> Self {
        Self {
            available: false,
            path: None,
            version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedDetection {
    pub result: AgentDetectionResult,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DetectionCache {
    entries: BTreeMap<AgentType, CachedDetection>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. Returns the previous availability, if any, so callers
    /// can react only to changes.
    pub fn record(
        &mut self,
        agent: AgentType,
        result: AgentDetectionResult,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        self.entries
            .insert(
                agent,
                CachedDetection {
                    result,
                    detected_at: now,
                },
            )
            .map(|prev| prev.result.available)
    }

    pub fn get(&self, agent: AgentType) -> Option<&CachedDetection> {
        self.entries.get(&agent)
    }

    pub fn is_available(&self, agent: AgentType) -> Option<bool> {
        self.entries.get(&agent).map(|c| c.result.available)
    }

    pub fn invalidate(&mut self, agent: AgentType) -> bool {
        self.entries.remove(&agent).is_some()
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Agents with no cached result, in `AgentType::ALL` order.
    pub fn stale(&self) -> Vec<AgentType> {
        AgentType::ALL
            .into_iter()
            .filter(|a| !self.entries.contains_key(a))
            .collect()
    }
}
