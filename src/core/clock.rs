//! Wall-clock capture.
//!
//! The processing pipeline passes millisecond timestamps explicitly so tests
//! control the clock; only the polling tasks and the notification dispatcher
//! sample real time, through this helper.

use time::OffsetDateTime;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}
