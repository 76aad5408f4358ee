//! Timestamps for run records and device states.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// UTC timestamp used for `start_time`, `end_time` and state samples.
pub type Timestamp = DateTime<Utc>;

#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Wall-clock time between two timestamps, clamped at zero.
#[must_use]
pub fn elapsed(start: Timestamp, end: Timestamp) -> Duration {
    (end - start).to_std().unwrap_or(Duration::ZERO)
}
