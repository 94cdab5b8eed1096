//! Crypto policy: expiration, caching, timestamp precision, and rotation rules.
//!
//! A policy holds configuration only. Its answers depend on that configuration
//! and the wall clock, never on engine state.

pub mod basic;
pub mod never_expired;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

pub use basic::{BasicExpiringCryptoPolicy, BasicExpiringCryptoPolicyBuilder};
pub use never_expired::NeverExpiredCryptoPolicy;

/// How expired keys are replaced on the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRotationStrategy {
    /// Create a replacement key synchronously inside the write that found the
    /// expired key.
    #[default]
    Inline,
    /// Keep writing with an expired (but not revoked) key and leave the
    /// replacement to a background process.
    Queued,
}

/// Decisions the envelope engine delegates to configuration.
pub trait CryptoPolicy: Send + Sync {
    /// Whether a key created at `created` is past its expiration.
    fn is_key_expired(&self, created: DateTime<Utc>) -> bool;

    /// How long a cached key is trusted before revocation is re-checked
    /// against the metastore.
    fn revoke_check_period(&self) -> Duration;

    fn can_cache_system_keys(&self) -> bool;

    fn can_cache_intermediate_keys(&self) -> bool;

    fn can_cache_sessions(&self) -> bool;

    /// Maximum number of sessions kept when session caching is enabled.
    fn session_cache_max_size(&self) -> usize;

    /// Idle time after which a cached session is evicted.
    fn session_cache_expire(&self) -> Duration;

    fn notify_expired_system_key_on_read(&self) -> bool {
        false
    }

    fn notify_expired_intermediate_key_on_read(&self) -> bool {
        false
    }

    fn key_rotation_strategy(&self) -> KeyRotationStrategy;

    fn is_inline_key_rotation(&self) -> bool {
        self.key_rotation_strategy() == KeyRotationStrategy::Inline
    }

    fn is_queued_key_rotation(&self) -> bool {
        self.key_rotation_strategy() == KeyRotationStrategy::Queued
    }

    /// Quantise `now` for a new system key so that concurrent writers converge
    /// on the same timestamp.
    fn truncate_to_system_key_precision(&self, now: DateTime<Utc>) -> DateTime<Utc>;

    /// Quantise `now` for a new intermediate key.
    fn truncate_to_intermediate_key_precision(&self, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// Truncate `ts` down to a whole multiple of `precision` since the epoch.
///
/// A zero precision, or one that cannot be represented, falls back to whole
/// seconds.
pub fn truncate(ts: DateTime<Utc>, precision: Duration) -> DateTime<Utc> {
    let step = precision.as_secs() as i64;
    if step <= 0 {
        return common::protocol::truncate_to_seconds(ts);
    }
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(step), 0)
        .unwrap_or_else(|| common::protocol::truncate_to_seconds(ts))
}
