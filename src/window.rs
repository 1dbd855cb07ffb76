//! Time window calculation.
//!
//! Connectors are polled over a monotone-increasing "requested range". The
//! effective range a connector actually queries is derived from that request,
//! a per-source floor (never fetch before this instant), and a lookback
//! buffer that compensates for records whose visibility lags their creation
//! time — a call whose transcript only becomes queryable minutes after the
//! call's metadata record, a file whose mtime is set on upload completion.

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A half-open `[start, end)` time range in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The full range from the Unix epoch to now. Used for full resyncs.
    pub fn unbounded() -> Self {
        Self {
            start: DateTime::<Utc>::UNIX_EPOCH,
            end: Utc::now(),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Compute the effective polling window for one sync cycle.
///
/// The start is clamped up to the source floor (capped at the requested end
/// so an aggressive floor cannot invert the window), then pushed back by the
/// lookback buffer. The end is taken as requested.
pub fn effective_window(
    requested: TimeWindow,
    floor: Option<DateTime<Utc>>,
    lookback: Duration,
) -> TimeWindow {
    let floor = floor.unwrap_or(DateTime::<Utc>::UNIX_EPOCH).min(requested.end);
    let lookback = chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::zero());
    TimeWindow {
        start: requested.start.max(floor) - lookback,
        end: requested.end,
    }
}

/// Split a window into UTC calendar-day sub-windows.
///
/// Sources without server-side cursor pagination checkpoint at day
/// boundaries instead: the checkpoint records the current sub-window and a
/// restarted run resumes at that day, giving the same resumability
/// guarantees without a true cursor.
pub fn day_buckets(window: TimeWindow) -> Vec<TimeWindow> {
    let mut buckets = Vec::new();
    let mut cursor = window.start;
    while cursor < window.end {
        let next_midnight = (cursor.date_naive() + Days::new(1))
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let bucket_end = next_midnight.min(window.end);
        buckets.push(TimeWindow::new(cursor, bucket_end));
        cursor = bucket_end;
    }
    buckets
}
