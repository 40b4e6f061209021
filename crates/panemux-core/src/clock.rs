//! Saturating deadline arithmetic for caller-supplied intervals.
//!
//! Intervals arrive as `u64` milliseconds from config files and RPC params;
//! an absurd value clamps to the far future instead of overflowing.

use chrono::{DateTime, TimeDelta, Utc};

pub(crate) fn millis(ms: u64) -> TimeDelta {
    TimeDelta::try_milliseconds(i64::try_from(ms).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

pub(crate) fn deadline_after(now: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
