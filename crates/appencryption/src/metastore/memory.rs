//! [`InMemoryMetastore`]: process-local metastore for tests and development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KeyRecord, Result};
use parking_lot::RwLock;
use tracing::debug;

use super::Metastore;

/// Records are grouped per key id and ordered by creation time.
#[derive(Debug, Default)]
pub struct InMemoryMetastore {
    records: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, KeyRecord>>>,
    suffix: Option<String>,
}

impl InMemoryMetastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metastore that reports `suffix` as its key suffix.
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        Self {
            records: RwLock::default(),
            suffix: Some(suffix.into()),
        }
    }

    /// Mark the record at `(key_id, created)` revoked.
    ///
    /// This is an administrative operation outside the normal append-only flow.
    /// Returns `false` if there is no such record.
    pub fn revoke(&self, key_id: &str, created: DateTime<Utc>) -> bool {
        let mut records = self.records.write();
        match records.get_mut(key_id).and_then(|by_time| by_time.get_mut(&created)) {
            Some(record) => {
                *record = record.with_revoked(true);
                debug!(key_id, created = created.timestamp(), "key record revoked");
                true
            }
            None => false,
        }
    }

    /// Number of records stored under `key_id`.
    pub fn count(&self, key_id: &str) -> usize {
        self.records.read().get(key_id).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl Metastore for InMemoryMetastore {
    async fn try_load(&self, key_id: &str, created: DateTime<Utc>) -> Result<Option<KeyRecord>> {
        let records = self.records.read();
        Ok(records
            .get(key_id)
            .and_then(|by_time| by_time.get(&created))
            .cloned())
    }

    async fn try_load_latest(&self, key_id: &str) -> Result<Option<KeyRecord>> {
        let records = self.records.read();
        Ok(records
            .get(key_id)
            .and_then(|by_time| by_time.last_key_value())
            .map(|(_, record)| record.clone()))
    }

    async fn store(
        &self,
        key_id: &str,
        created: DateTime<Utc>,
        record: &KeyRecord,
    ) -> Result<bool> {
        let mut records = self.records.write();
        let by_time = records.entry(key_id.to_owned()).or_default();
        if by_time.contains_key(&created) {
            return Ok(false);
        }
        by_time.insert(created, record.clone());
        Ok(true)
    }

    fn key_suffix(&self) -> Option<String> {
        self.suffix.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(created: i64) -> KeyRecord {
        KeyRecord::system(ts(created), &[created as u8; 8], Some(false))
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = InMemoryMetastore::new();
        assert!(store.try_load("_SK_a_b", ts(1)).await.unwrap().is_none());
        assert!(store.try_load_latest("_SK_a_b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_then_load() {
        let store = InMemoryMetastore::new();
        assert!(store.store("_SK_a_b", ts(10), &record(10)).await.unwrap());
        assert_eq!(
            store.try_load("_SK_a_b", ts(10)).await.unwrap(),
            Some(record(10))
        );
        assert!(store.try_load("_SK_a_b", ts(11)).await.unwrap().is_none());
        assert!(store.try_load("_SK_other", ts(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_store_is_rejected() {
        let store = InMemoryMetastore::new();
        assert!(store.store("k", ts(10), &record(10)).await.unwrap());
        assert!(!store.store("k", ts(10), &record(99)).await.unwrap());
        assert_eq!(store.try_load("k", ts(10)).await.unwrap(), Some(record(10)));
        assert_eq!(store.count("k"), 1);
    }

    #[tokio::test]
    async fn latest_is_max_created() {
        let store = InMemoryMetastore::new();
        for created in [20, 40, 10, 30] {
            store.store("k", ts(created), &record(created)).await.unwrap();
        }
        let latest = store.try_load_latest("k").await.unwrap().unwrap();
        assert_eq!(latest.created(), ts(40));
    }

    #[tokio::test]
    async fn revoke_marks_record() {
        let store = InMemoryMetastore::new();
        store.store("k", ts(10), &record(10)).await.unwrap();
        assert!(store.revoke("k", ts(10)));
        assert!(!store.revoke("k", ts(11)));
        assert!(store.try_load("k", ts(10)).await.unwrap().unwrap().is_revoked());
    }

    #[test]
    fn suffix() {
        assert_eq!(InMemoryMetastore::new().key_suffix(), None);
        assert_eq!(
            InMemoryMetastore::with_suffix("us-west-2").key_suffix(),
            Some("us-west-2".to_owned())
        );
    }
}
