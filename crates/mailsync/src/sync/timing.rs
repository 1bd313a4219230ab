//! Sync timing utilities for cooldown and retry management
//!
//! Pure functions that can be tested without a server.

use chrono::{DateTime, Duration, Utc};

use crate::config::RetryPolicy;

/// Check if enough time has elapsed since the last sync to allow a new sync.
///
/// # Arguments
/// * `last_sync_at` - When the last successful sync completed (None if never synced)
/// * `cooldown_secs` - Minimum seconds that must elapse between syncs
///
/// # Returns
/// `true` if enough time has passed (or never synced), `false` if still in cooldown
pub fn cooldown_elapsed(last_sync_at: Option<DateTime<Utc>>, cooldown_secs: u64) -> bool {
    match last_sync_at {
        Some(last) => {
            let elapsed = Utc::now() - last;
            elapsed.num_seconds() >= cooldown_secs as i64
        }
        None => true, // Never synced, so cooldown has "elapsed"
    }
}

/// Delay before retry number `attempt` (1-based): the base delay doubled for
/// each earlier attempt, capped at the policy maximum.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let secs = policy
        .base_delay_secs
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_secs);
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}
