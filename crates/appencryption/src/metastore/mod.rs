//! Key record persistence.
//!
//! The engine never updates a record: new keys are appended with a conditional
//! insert, and the first writer for a `(key_id, created)` pair wins. Concurrent
//! creators converge by re-reading the latest record after losing the insert.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KeyRecord, Result};

pub use memory::InMemoryMetastore;

/// Storage backend for system and intermediate key records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Metastore: Send + Sync {
    /// Load the record stored under exactly `(key_id, created)`.
    async fn try_load(&self, key_id: &str, created: DateTime<Utc>) -> Result<Option<KeyRecord>>;

    /// Load the record with the greatest `created` for `key_id`.
    async fn try_load_latest(&self, key_id: &str) -> Result<Option<KeyRecord>>;

    /// Insert `record` unless `(key_id, created)` already exists.
    ///
    /// Returns `Ok(false)` when another writer got there first. Must be atomic
    /// with respect to concurrent callers, across processes for shared backends.
    async fn store(&self, key_id: &str, created: DateTime<Utc>, record: &KeyRecord) -> Result<bool>;

    /// Suffix appended to derived key ids, e.g. a region for multi-region backends.
    fn key_suffix(&self) -> Option<String> {
        None
    }
}
