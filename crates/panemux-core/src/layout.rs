//! Tab layouts: one or two panes, split orientation, ratio and focus.
//!
//! Invariants held by every [`TabLayout`]:
//! - `direction == None` iff `panes.len() <= 1`
//! - `MIN_RATIO <= ratio <= MAX_RATIO`
//! - `active_pane_index < panes.len()` whenever panes exist
//!
//! Violated preconditions (split when already split, close-pane when not
//! split, out-of-range ratio) are corrected locally: ignored or clamped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::registry::SessionRegistry;
use crate::session::SessionSpec;
use crate::types::{SessionId, SplitDirection, TabId};

pub const MIN_RATIO: f64 = 0.2;
pub const MAX_RATIO: f64 = 0.8;
pub const DEFAULT_RATIO: f64 = 0.5;

/// Built only through its constructors and [`LayoutController`]; serialized
/// for clients but never deserialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabLayout {
    pub direction: SplitDirection,
    panes: Vec<SessionId>,
    ratio: f64,
    active_pane_index: usize,
}

impl Default for TabLayout {
    fn default() -> Self {
        Self::empty()
    }
}

impl TabLayout {
    pub fn empty() -> Self {
        Self {
            direction: SplitDirection::None,
            panes: Vec::new(),
            ratio: DEFAULT_RATIO,
            active_pane_index: 0,
        }
    }

    pub fn single(id: SessionId) -> Self {
        Self {
            panes: vec![id],
            ..Self::empty()
        }
    }

    pub fn panes(&self) -> &[SessionId] {
        &self.panes
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn active_pane_index(&self) -> usize {
        self.active_pane_index
    }

    pub fn is_split(&self) -> bool {
        self.panes.len() == 2
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.panes.get(self.active_pane_index).copied()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.panes.contains(&id)
    }

    /// Split the single pane. The new session clones the source's working
    /// directory and font size and takes focus. Returns `None` (no-op) when
    /// already split, when there is no source pane, or for `SplitDirection::None`.
    pub fn split(
        &mut self,
        registry: &mut SessionRegistry,
        direction: SplitDirection,
        now: DateTime<Utc>,
    ) -> Option<SessionId> {
        if direction == SplitDirection::None || self.direction != SplitDirection::None {
            return None;
        }
        let &[source_id] = self.panes.as_slice() else {
            return None;
        };
        let source = registry.get(source_id)?;
        let spec = SessionSpec {
            working_directory: source.working_directory.clone(),
            font_size: source.font_size,
            ..SessionSpec::default()
        };
        let new_id = registry.create(spec, now);

        self.direction = direction;
        self.panes.push(new_id);
        self.ratio = DEFAULT_RATIO;
        self.active_pane_index = 1;
        debug!(source = %source_id, new = %new_id, direction = direction.as_str(), "pane split");
        Some(new_id)
    }

    /// Close pane `index` of a split layout. The other pane survives and the
    /// layout reverts to a single pane. Returns the removed session id; the
    /// caller decides whether to close that session.
    pub fn close_pane(&mut self, index: usize) -> Option<SessionId> {
        if !self.is_split() || index > 1 {
            return None;
        }
        let removed = self.panes.remove(index);
        self.direction = SplitDirection::None;
        self.ratio = DEFAULT_RATIO;
        self.active_pane_index = 0;
        debug!(removed = %removed, "pane closed");
        Some(removed)
    }

    /// Store `value` clamped to `[MIN_RATIO, MAX_RATIO]`. NaN resets to default.
    pub fn set_ratio(&mut self, value: f64) -> f64 {
        self.ratio = clamp_ratio(value);
        self.ratio
    }

    pub fn set_active_pane_index(&mut self, index: usize) -> bool {
        if index >= self.panes.len() {
            return false;
        }
        self.active_pane_index = index;
        true
    }

    /// Drop a session that went away without going through `close_pane`.
    pub fn forget(&mut self, id: SessionId) -> bool {
        match self.panes.iter().position(|p| *p == id) {
            Some(index) if self.is_split() => self.close_pane(index).is_some(),
            Some(_) => {
                self.panes.clear();
                self.direction = SplitDirection::None;
                self.ratio = DEFAULT_RATIO;
                self.active_pane_index = 0;
                true
            }
            None => false,
        }
    }
}

pub fn clamp_ratio(value: f64) -> f64 {
    if value.is_nan() {
        DEFAULT_RATIO
    } else {
        value.clamp(MIN_RATIO, MAX_RATIO)
    }
}

/// All tab layouts, keyed by tab id.
#[derive(Debug, Default)]
pub struct LayoutController {
    tabs: BTreeMap<TabId, TabLayout>,
    next_id: u64,
}

impl LayoutController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_tab(&mut self, session: SessionId) -> TabId {
        self.next_id += 1;
        let id = TabId(self.next_id);
        self.tabs.insert(id, TabLayout::single(session));
        id
    }

    pub fn close_tab(&mut self, tab: TabId) -> Option<TabLayout> {
        self.tabs.remove(&tab)
    }

    pub fn get(&self, tab: TabId) -> Option<&TabLayout> {
        self.tabs.get(&tab)
    }

    pub fn get_mut(&mut self, tab: TabId) -> Option<&mut TabLayout> {
        self.tabs.get_mut(&tab)
    }

    pub fn tab_of(&self, session: SessionId) -> Option<TabId> {
        self.tabs
            .iter()
            .find(|(_, layout)| layout.contains(session))
            .map(|(id, _)| *id)
    }

    /// Remove a closed session from whichever tab shows it. A tab left with
    /// no panes is dropped and its id returned.
    pub fn forget_session(&mut self, session: SessionId) -> Option<TabId> {
        let tab = self.tab_of(session)?;
        let layout = self.tabs.get_mut(&tab)?;
        layout.forget(session);
        if layout.panes().is_empty() {
            self.tabs.remove(&tab);
            return Some(tab);
        }
        None
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TabId, &TabLayout)> {
        self.tabs.iter()
    }
}
