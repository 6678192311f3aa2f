//! Shared helpers for the compute daemon.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Map a poisoned std lock into an internal error.
pub(crate) fn poisoned(what: &str) -> crate::error::ControlError {
    tracing::error!("{} lock poisoned", what);
    crate::error::ControlError::Internal(anyhow::anyhow!("{} lock poisoned", what))
}
