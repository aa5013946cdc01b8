//! Helper utilities for Phantom Portal
//!
//! Shared constants and small formatting helpers.

use std::time::Duration;

/// Pause after a failed `accept()` before trying again
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Capacity of per-session and registry event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Format a `host:port` pair
pub fn endpoint(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Render a duration in milliseconds for log fields
pub fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
