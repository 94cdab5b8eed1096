#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use appencryption::policy::truncate;
use appencryption::{
    CryptoPolicy, DataRowRecord, InMemoryMetastore, KeyRecord, KeyRotationStrategy, Metastore,
    Result, SessionFactory,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

pub const MASTER_KEY: &[u8; 32] = b"thisIsAStaticMasterKeyForTesting";
pub const SK_ID: &str = "_SK_svc_prod";
pub const IK_ID: &str = "_IK_p1_svc_prod";

/// A whole minute, so that truncation is a no-op at the start of a test.
pub fn start() -> DateTime<Utc> {
    Utc.timestamp_opt(1_752_685_260, 0).unwrap()
}

/// Policy driven by a manual clock instead of the wall clock.
///
/// Both expiry and new key timestamps read the manual clock, so tests can
/// cross expiry and truncation boundaries without sleeping.
pub struct ManualClockPolicy {
    now: Mutex<DateTime<Utc>>,
    expire_after: chrono::Duration,
    revoke_check_period: Duration,
    rotation: KeyRotationStrategy,
}

impl ManualClockPolicy {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(start()),
            expire_after: chrono::Duration::days(1),
            revoke_check_period: Duration::from_secs(3600),
            rotation: KeyRotationStrategy::Inline,
        }
    }

    /// Cached keys are never trusted; every lookup goes back to the metastore.
    pub fn always_recheck(mut self) -> Self {
        self.revoke_check_period = Duration::ZERO;
        self
    }

    pub fn queued(mut self) -> Self {
        self.rotation = KeyRotationStrategy::Queued;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl CryptoPolicy for ManualClockPolicy {
    fn is_key_expired(&self, created: DateTime<Utc>) -> bool {
        created
            .checked_add_signed(self.expire_after)
            .is_some_and(|expires| self.now() > expires)
    }

    fn revoke_check_period(&self) -> Duration {
        self.revoke_check_period
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
        0
    }

    fn session_cache_expire(&self) -> Duration {
        Duration::ZERO
    }

    fn key_rotation_strategy(&self) -> KeyRotationStrategy {
        self.rotation
    }

    fn truncate_to_system_key_precision(&self, _now: DateTime<Utc>) -> DateTime<Utc> {
        truncate(self.now(), Duration::from_secs(60))
    }

    fn truncate_to_intermediate_key_precision(&self, _now: DateTime<Utc>) -> DateTime<Utc> {
        truncate(self.now(), Duration::from_secs(60))
    }
}

/// In-memory metastore that can report the next stores as lost races.
///
/// A "lost" store is still persisted, as if another writer had inserted an
/// identical key first.
#[derive(Default)]
pub struct ConflictingMetastore {
    inner: InMemoryMetastore,
    pending_conflicts: AtomicUsize,
    conflicts_reported: AtomicUsize,
}

impl ConflictingMetastore {
    pub fn conflict_next_stores(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn conflicts_reported(&self) -> usize {
        self.conflicts_reported.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryMetastore {
        &self.inner
    }
}

#[async_trait]
impl Metastore for ConflictingMetastore {
    async fn try_load(&self, key_id: &str, created: DateTime<Utc>) -> Result<Option<KeyRecord>> {
        self.inner.try_load(key_id, created).await
    }

    async fn try_load_latest(&self, key_id: &str) -> Result<Option<KeyRecord>> {
        self.inner.try_load_latest(key_id).await
    }

    async fn store(
        &self,
        key_id: &str,
        created: DateTime<Utc>,
        record: &KeyRecord,
    ) -> Result<bool> {
        let stored = self.inner.store(key_id, created, record).await?;
        let conflict = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            self.conflicts_reported.fetch_add(1, Ordering::SeqCst);
            return Ok(false);
        }
        Ok(stored)
    }
}

pub fn factory(metastore: Arc<dyn Metastore>, policy: Arc<dyn CryptoPolicy>) -> SessionFactory {
    SessionFactory::builder("prod", "svc")
        .with_metastore(metastore)
        .with_crypto_policy(policy)
        .with_static_key_management_service(MASTER_KEY)
        .unwrap()
        .build()
        .unwrap()
}

/// `ParentKeyMeta` of a serialised data row record.
pub fn parent_of(drr: &[u8]) -> (String, DateTime<Utc>) {
    let drr = DataRowRecord::from_json_bytes(drr).unwrap();
    let parent = drr.key.unwrap().parent_key_meta.unwrap();
    (parent.key_id.unwrap(), parent.created.unwrap())
}
