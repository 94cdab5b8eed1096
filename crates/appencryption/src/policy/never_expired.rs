//! [`NeverExpiredCryptoPolicy`]: keys never expire. Development and tests only.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{truncate, CryptoPolicy, KeyRotationStrategy};

/// Policy whose keys never expire and whose caches are never re-validated.
///
/// Do not use in production: a revoked key stays in use until the process restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverExpiredCryptoPolicy;

impl CryptoPolicy for NeverExpiredCryptoPolicy {
    fn is_key_expired(&self, _created: DateTime<Utc>) -> bool {
        false
    }

    fn revoke_check_period(&self) -> Duration {
        Duration::MAX
    }

    fn can_cache_system_keys(&self) -> bool {
        true
    }

    fn can_cache_intermediate_keys(&self) -> bool {
        true
    }

    fn can_cache_sessions(&self) -> bool {
        false
    }

    fn session_cache_max_size(&self) -> usize {
        usize::MAX
    }

    fn session_cache_expire(&self) -> Duration {
        Duration::MAX
    }

    fn key_rotation_strategy(&self) -> KeyRotationStrategy {
        KeyRotationStrategy::Inline
    }

    fn truncate_to_system_key_precision(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        truncate(now, Duration::from_secs(60))
    }

    fn truncate_to_intermediate_key_precision(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        truncate(now, Duration::from_secs(60))
    }
}
