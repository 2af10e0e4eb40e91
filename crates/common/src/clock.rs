//! Wall-clock helpers
//!
//! Every persisted timestamp in the engine is a unix epoch in milliseconds.
//! `Instant` is not used for stored records because it does not survive a
//! process restart.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
///
/// A clock set before 1970 yields 0 rather than panicking.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Absolute expiry (epoch ms) for a record created at `created_at` with `ttl`.
pub fn expires_at(created_at: u64, ttl: Duration) -> u64 {
    created_at.saturating_add(ttl.as_millis() as u64)
}
