//! Wall-clock helpers
//!
//! The crawl protocol reasons in epoch seconds (request pacing, cache
//! expiry, quota periods), matching the timestamps the remote API hands
//! back. Everything that needs testable time takes `now` as a parameter;
//! these helpers only feed the live paths.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current epoch time in seconds, with sub-second precision.
pub fn epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current epoch time in whole seconds.
pub fn epoch_secs() -> u64 {
    epoch() as u64
}

/// Current epoch time in milliseconds.
pub fn epoch_ms() -> u64 {
    (epoch() * 1000.0) as u64
}
