//! General time utility functions

use chrono;
use std::time::Duration;

/// Number of nanoseconds in a second
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Convert a duration into a number of seconds, or `None` if overflow
pub fn duration_to_seconds(duration: chrono::Duration) -> Option<f64> {
    duration
        .num_nanoseconds()
        .map(|ns| ns as f64 / NANOS_PER_SECOND as f64)
}

/// Get the period of a loop running at the given frequency.
///
/// Frequencies which are not strictly positive give a zero period.
pub fn period_from_hz(frequency_hz: f64) -> Duration {
    if frequency_hz > 0.0 {
        Duration::from_secs_f64(1.0 / frequency_hz)
    }
    else {
        Duration::from_secs(0)
    }
}
