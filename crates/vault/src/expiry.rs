//! Expiry policy: when a stored token must be refreshed before hand-off.

use chrono::{DateTime, Duration, Utc};

use crate::types::{TokenKind, VaultEntry};

/// Default safety margin before the real expiry, in seconds.
pub const DEFAULT_SKEW_SECS: u64 = 300;

fn secs(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Absolute expiry for a token issued at `now` with the given lifetime.
pub fn compute_expiry(now: DateTime<Utc>, lifetime_secs: u64) -> DateTime<Utc> {
    now.checked_add_signed(secs(lifetime_secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// True when the entry has no known expiry or expires within `skew` of `now`.
///
/// API keys never expire and are never refreshed.
pub fn is_refresh_needed(entry: &VaultEntry, now: DateTime<Utc>, skew: Duration) -> bool {
    if entry.kind == TokenKind::ApiKey {
        return false;
    }
    match entry.expires_at {
        None => true,
        Some(expires_at) => now
            .checked_add_signed(skew)
            .is_none_or(|deadline| deadline >= expires_at),
    }
}

/// Expiry policy with a fixed skew.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    skew: Duration,
}

impl ExpiryPolicy {
    pub fn new(skew: Duration) -> Self {
        Self { skew }
    }

    pub fn from_secs(skew_secs: u64) -> Self {
        Self::new(secs(skew_secs))
    }

    pub fn skew(&self) -> Duration {
        self.skew
    }

    pub fn is_refresh_needed(&self, entry: &VaultEntry, now: DateTime<Utc>) -> bool {
        is_refresh_needed(entry, now, self.skew)
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::from_secs(DEFAULT_SKEW_SECS)
    }
}
