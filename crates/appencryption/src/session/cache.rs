//! Per-partition session reuse: bounded, least-recently-used, idle-expiring.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::envelope::EnvelopeEncryption;

struct CachedSession {
    engine: Arc<EnvelopeEncryption>,
    last_used: Instant,
}

/// Shares one engine (and so one intermediate key cache) per partition id.
pub(crate) struct SessionCache {
    entries: Mutex<HashMap<String, CachedSession>>,
    max_size: usize,
    expire_after: Duration,
}

impl SessionCache {
    pub(crate) fn new(max_size: usize, expire_after: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size,
            expire_after,
        }
    }

    /// Return the cached engine for `partition_id`, building it with `make` on a miss.
    ///
    /// Idle entries are evicted first; if the cache is still full, the least
    /// recently used entry makes room. Evicted engines are disposed.
    pub(crate) fn get_or_insert_with(
        &self,
        partition_id: &str,
        make: impl FnOnce() -> EnvelopeEncryption,
    ) -> Arc<EnvelopeEncryption> {
        if self.max_size == 0 {
            return Arc::new(make());
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();

        entries.retain(|id, cached| {
            let alive = now.duration_since(cached.last_used) < self.expire_after;
            if !alive {
                debug!(partition_id = %id, "evicting idle session");
                cached.engine.dispose();
            }
            alive
        });

        if let Some(cached) = entries.get_mut(partition_id) {
            cached.last_used = now;
            return cached.engine.clone();
        }

        if entries.len() >= self.max_size {
            let lru = entries
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(id, _)| id.clone());
            if let Some((id, evicted)) = lru.and_then(|id| entries.remove_entry(&id)) {
                debug!(partition_id = %id, "evicting least recently used session");
                evicted.engine.dispose();
            }
        }

        let engine = Arc::new(make());
        entries.insert(
            partition_id.to_owned(),
            CachedSession {
                engine: engine.clone(),
                last_used: now,
            },
        );
        engine
    }

    /// Dispose and drop every cached engine.
    pub(crate) fn dispose_all(&self) {
        let mut entries = self.entries.lock();
        for (_, cached) in entries.drain() {
            cached.engine.dispose();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SecureKeyCache;
    use crate::kms::StaticKeyManagementService;
    use crate::metastore::InMemoryMetastore;
    use crate::partition::Partition;
    use crate::policy::NeverExpiredCryptoPolicy;

    fn make(partition_id: &'static str) -> impl FnOnce() -> EnvelopeEncryption {
        move || {
            EnvelopeEncryption::new(
                Partition::new(partition_id, "svc", "prod"),
                Arc::new(InMemoryMetastore::new()),
                Arc::new(StaticKeyManagementService::new(&[3u8; 32]).unwrap()),
                Arc::new(NeverExpiredCryptoPolicy),
                Arc::new(SecureKeyCache::new(Duration::from_secs(60))),
            )
        }
    }

    #[test]
    fn reuses_engine_per_partition() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        let a = cache.get_or_insert_with("p1", make("p1"));
        let b = cache.get_or_insert_with("p1", make("p1"));
        let c = cache.get_or_insert_with("p2", make("p2"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = SessionCache::new(2, Duration::from_secs(60));
        let p1 = cache.get_or_insert_with("p1", make("p1"));
        std::thread::sleep(Duration::from_millis(2));
        cache.get_or_insert_with("p2", make("p2"));
        std::thread::sleep(Duration::from_millis(2));
        // Touch p1 so that p2 becomes the eviction candidate.
        cache.get_or_insert_with("p1", make("p1"));
        std::thread::sleep(Duration::from_millis(2));
        cache.get_or_insert_with("p3", make("p3"));

        assert_eq!(cache.len(), 2);
        assert!(Arc::ptr_eq(&p1, &cache.get_or_insert_with("p1", make("p1"))));
    }

    #[test]
    fn idle_sessions_expire() {
        let cache = SessionCache::new(10, Duration::ZERO);
        let first = cache.get_or_insert_with("p1", make("p1"));
        let second = cache.get_or_insert_with("p1", make("p1"));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_capacity_never_caches() {
        let cache = SessionCache::new(0, Duration::from_secs(60));
        let a = cache.get_or_insert_with("p1", make("p1"));
        let b = cache.get_or_insert_with("p1", make("p1"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn dispose_all_empties_cache() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        cache.get_or_insert_with("p1", make("p1"));
        cache.dispose_all();
        assert_eq!(cache.len(), 0);
    }
}
