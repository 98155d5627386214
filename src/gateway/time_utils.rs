//! Time utilities for safe timestamp handling.
//!
//! Token expiry is tracked in wall-clock milliseconds because the cached
//! token is shared with other processes. Local waits use tokio's monotonic
//! clock instead.

use crate::gateway::error::GatewayError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current time in milliseconds since Unix epoch.
///
/// Returns an error instead of panicking if the system clock is before the
/// Unix epoch.
pub(crate) fn current_timestamp_millis() -> Result<i64, GatewayError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .map_err(|_| GatewayError::Config("System time is before Unix epoch".to_string()))
}

/// Milliseconds of a duration, saturating at `i64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
