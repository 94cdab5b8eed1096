//! [`SecureKeyCache`]: thread-safe cache of decrypted keys, keyed by creation time.
//!
//! # Ownership
//!
//! The cache is the sole long-lived owner of the keys it retains. Callers borrow
//! an `Arc<CryptoKey>` and must not treat it as theirs to wipe; the secret is
//! zeroed when the last reference goes away, which after [`SecureKeyCache::dispose`]
//! is the last outstanding borrow.
//!
//! # Revocation re-checks
//!
//! An entry is only handed out while it is younger than the revoke-check period.
//! Past that, lookups miss so the engine reloads the record from the metastore
//! and calls [`SecureKeyCache::put_and_get_usable`], which refreshes the entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::crypto::CryptoKey;

#[derive(Debug)]
struct CacheEntry {
    key: Arc<CryptoKey>,
    cached_at: Instant,
}

/// Cache of shared decrypted keys.
///
/// Two instances exist per session: the process-wide system key cache owned by
/// the session factory, and the intermediate key cache owned by the session.
#[derive(Debug)]
pub struct SecureKeyCache {
    entries: RwLock<BTreeMap<DateTime<Utc>, CacheEntry>>,
    revoke_check_period: Duration,
    disposed: AtomicBool,
}

impl SecureKeyCache {
    /// Create an empty cache whose entries are re-validated after `revoke_check_period`.
    pub fn new(revoke_check_period: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            revoke_check_period,
            disposed: AtomicBool::new(false),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.cached_at.elapsed() < self.revoke_check_period
    }

    /// Borrow the key created at `created`, if cached and still fresh.
    pub fn get(&self, created: DateTime<Utc>) -> Option<Arc<CryptoKey>> {
        let entries = self.entries.read();
        entries
            .get(&created)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.key.clone())
    }

    /// Borrow the most recently created cached key, if still fresh.
    pub fn get_latest(&self) -> Option<Arc<CryptoKey>> {
        let entries = self.entries.read();
        entries
            .last_key_value()
            .map(|(_, entry)| entry)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.key.clone())
    }

    /// Insert `key` unless an entry for `created` already exists, and return the
    /// copy callers should use.
    ///
    /// Exactly one caller wins an insert race. When an entry already exists it
    /// is kept, its freshness is renewed, it inherits a revocation carried by
    /// `key`, and `key` itself is dropped (wiped). After [`SecureKeyCache::dispose`]
    /// nothing is retained and `key` comes back as a sole-owner `Arc`.
    pub fn put_and_get_usable(&self, created: DateTime<Utc>, key: CryptoKey) -> Arc<CryptoKey> {
        let mut entries = self.entries.write();
        if self.disposed.load(Ordering::Acquire) {
            return Arc::new(key);
        }

        if let Some(existing) = entries.get_mut(&created) {
            if key.is_revoked() {
                existing.key.mark_revoked();
            }
            existing.cached_at = Instant::now();
            return existing.key.clone();
        }

        let key = Arc::new(key);
        entries.insert(
            created,
            CacheEntry {
                key: key.clone(),
                cached_at: Instant::now(),
            },
        );
        key
    }

    /// Release every retained key. Idempotent.
    pub fn dispose(&self) {
        let mut entries = self.entries.write();
        self.disposed.store(true, Ordering::Release);
        entries.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of retained entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
