//! [`BasicExpiringCryptoPolicy`]: day-based expiration with minute precision.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{truncate, CryptoPolicy, KeyRotationStrategy};

const MINUTE: Duration = Duration::from_secs(60);
const DEFAULT_REVOKE_CHECK_MINUTES: u64 = 60;
const DEFAULT_SESSION_CACHE_MAX_SIZE: usize = 1000;
const DEFAULT_SESSION_CACHE_EXPIRE_MINUTES: u64 = 120;

/// Policy where keys expire a fixed number of days after creation and new key
/// timestamps are truncated to the minute.
#[derive(Debug, Clone)]
pub struct BasicExpiringCryptoPolicy {
    key_expiration: chrono::Duration,
    revoke_check_period: Duration,
    rotation_strategy: KeyRotationStrategy,
    can_cache_system_keys: bool,
    can_cache_intermediate_keys: bool,
    can_cache_sessions: bool,
    session_cache_max_size: usize,
    session_cache_expire: Duration,
    notify_expired_system_key_on_read: bool,
    notify_expired_intermediate_key_on_read: bool,
}

impl BasicExpiringCryptoPolicy {
    /// Start a builder. Only the expiration days are mandatory.
    pub fn builder(key_expiration_days: u32) -> BasicExpiringCryptoPolicyBuilder {
        BasicExpiringCryptoPolicyBuilder::new(key_expiration_days)
    }
}

impl CryptoPolicy for BasicExpiringCryptoPolicy {
    /// An expiry past the representable date range never arrives.
    fn is_key_expired(&self, created: DateTime<Utc>) -> bool {
        created
            .checked_add_signed(self.key_expiration)
            .is_some_and(|expires| Utc::now() > expires)
    }

    fn revoke_check_period(&self) -> Duration {
        self.revoke_check_period
    }

    fn can_cache_system_keys(&self) -> bool {
        self.can_cache_system_keys
    }

    fn can_cache_intermediate_keys(&self) -> bool {
        self.can_cache_intermediate_keys
    }

    fn can_cache_sessions(&self) -> bool {
        self.can_cache_sessions
    }

    fn session_cache_max_size(&self) -> usize {
        self.session_cache_max_size
    }

    fn session_cache_expire(&self) -> Duration {
        self.session_cache_expire
    }

    fn notify_expired_system_key_on_read(&self) -> bool {
        self.notify_expired_system_key_on_read
    }

    fn notify_expired_intermediate_key_on_read(&self) -> bool {
        self.notify_expired_intermediate_key_on_read
    }

    fn key_rotation_strategy(&self) -> KeyRotationStrategy {
        self.rotation_strategy
    }

    fn truncate_to_system_key_precision(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        truncate(now, MINUTE)
    }

    fn truncate_to_intermediate_key_precision(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        truncate(now, MINUTE)
    }
}

/// Builder for [`BasicExpiringCryptoPolicy`].
#[derive(Debug, Clone)]
pub struct BasicExpiringCryptoPolicyBuilder {
    inner: BasicExpiringCryptoPolicy,
}

impl BasicExpiringCryptoPolicyBuilder {
    fn new(key_expiration_days: u32) -> Self {
        Self {
            inner: BasicExpiringCryptoPolicy {
                key_expiration: chrono::Duration::days(i64::from(key_expiration_days)),
                revoke_check_period: MINUTE * DEFAULT_REVOKE_CHECK_MINUTES as u32,
                rotation_strategy: KeyRotationStrategy::Inline,
                can_cache_system_keys: true,
                can_cache_intermediate_keys: true,
                can_cache_sessions: false,
                session_cache_max_size: DEFAULT_SESSION_CACHE_MAX_SIZE,
                session_cache_expire: MINUTE * DEFAULT_SESSION_CACHE_EXPIRE_MINUTES as u32,
                notify_expired_system_key_on_read: false,
                notify_expired_intermediate_key_on_read: false,
            },
        }
    }

    pub fn with_revoke_check_minutes(mut self, minutes: u32) -> Self {
        self.inner.revoke_check_period = MINUTE * minutes;
        self
    }

    pub fn with_rotation_strategy(mut self, strategy: KeyRotationStrategy) -> Self {
        self.inner.rotation_strategy = strategy;
        self
    }

    pub fn with_can_cache_system_keys(mut self, enabled: bool) -> Self {
        self.inner.can_cache_system_keys = enabled;
        self
    }

    pub fn with_can_cache_intermediate_keys(mut self, enabled: bool) -> Self {
        self.inner.can_cache_intermediate_keys = enabled;
        self
    }

    pub fn with_can_cache_sessions(mut self, enabled: bool) -> Self {
        self.inner.can_cache_sessions = enabled;
        self
    }

    pub fn with_session_cache_max_size(mut self, size: usize) -> Self {
        self.inner.session_cache_max_size = size;
        self
    }

    pub fn with_session_cache_expire_minutes(mut self, minutes: u32) -> Self {
        self.inner.session_cache_expire = MINUTE * minutes;
        self
    }

    pub fn with_notify_expired_system_key_on_read(mut self, enabled: bool) -> Self {
        self.inner.notify_expired_system_key_on_read = enabled;
        self
    }

    pub fn with_notify_expired_intermediate_key_on_read(mut self, enabled: bool) -> Self {
        self.inner.notify_expired_intermediate_key_on_read = enabled;
        self
    }

    pub fn build(self) -> BasicExpiringCryptoPolicy {
        self.inner
    }
}
