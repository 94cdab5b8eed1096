//! [`SessionFactory`] and [`Session`]: the public entry points.
//!
//! A factory is built once per `(product, service)` and owns the process-wide
//! system key cache. Each [`Session`] is scoped to one partition and owns (or,
//! with session caching, shares) an intermediate key cache.
//!
//! ```no_run
//! # async fn demo() -> common::Result<()> {
//! use appencryption::SessionFactory;
//!
//! let factory = SessionFactory::builder("prod", "svc")
//!     .with_in_memory_metastore()
//!     .with_never_expired_crypto_policy()
//!     .with_static_key_management_service(b"thisIsAStaticMasterKeyForTesting")?
//!     .build()?;
//!
//! let session = factory.session("p1")?;
//! let drr = session.encrypt(b"123-45-6789").await?;
//! assert_eq!(session.decrypt(&drr).await?, b"123-45-6789");
//! # Ok(())
//! # }
//! ```

mod cache;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{AppEncryptionError, Result};
use tracing::{debug, info};

use crate::cache::SecureKeyCache;
use crate::envelope::EnvelopeEncryption;
use crate::kms::{KeyManagementService, StaticKeyManagementService};
use crate::metastore::{InMemoryMetastore, Metastore};
use crate::partition::Partition;
use crate::policy::{CryptoPolicy, NeverExpiredCryptoPolicy};

use self::cache::SessionCache;

/// Encrypt/decrypt handle for one partition.
///
/// Cloning is cheap and clones share the same intermediate key cache.
#[derive(Clone)]
pub struct Session {
    engine: Arc<EnvelopeEncryption>,
}

impl Session {
    /// Encrypt `payload` and return the serialised data row record.
    pub async fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.engine.encrypt_payload(payload).await
    }

    /// Decrypt a serialised data row record.
    pub async fn decrypt(&self, data_row_record: &[u8]) -> Result<Vec<u8>> {
        self.engine.decrypt_data_row_record(data_row_record).await
    }

    pub fn partition(&self) -> &Partition {
        self.engine.partition()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("partition", self.partition())
            .finish()
    }
}

/// Creates [`Session`]s that share a metastore, a key management service, a
/// crypto policy, and the system key cache.
pub struct SessionFactory {
    product_id: String,
    service_id: String,
    metastore: Arc<dyn Metastore>,
    kms: Arc<dyn KeyManagementService>,
    policy: Arc<dyn CryptoPolicy>,
    system_key_cache: Arc<SecureKeyCache>,
    sessions: Option<SessionCache>,
    disposed: AtomicBool,
}

impl SessionFactory {
    pub fn builder(
        product_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            product_id: product_id.into(),
            service_id: service_id.into(),
            metastore: None,
            policy: None,
            kms: None,
        }
    }

    /// Session for `partition_id`.
    ///
    /// # Errors
    ///
    /// - [`AppEncryptionError::InvalidArgument`] if `partition_id` is empty.
    /// - [`AppEncryptionError::AppEncryption`] if the factory has been disposed.
    pub fn session(&self, partition_id: &str) -> Result<Session> {
        if partition_id.is_empty() {
            return Err(AppEncryptionError::InvalidArgument(
                "partition id cannot be empty".into(),
            ));
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(AppEncryptionError::app("session factory has been disposed"));
        }

        let engine = match &self.sessions {
            Some(sessions) => {
                sessions.get_or_insert_with(partition_id, || self.new_engine(partition_id))
            }
            None => Arc::new(self.new_engine(partition_id)),
        };
        Ok(Session { engine })
    }

    fn new_engine(&self, partition_id: &str) -> EnvelopeEncryption {
        let partition = Partition::with_suffix(
            partition_id,
            self.service_id.as_str(),
            self.product_id.as_str(),
            self.metastore.key_suffix(),
        );
        debug!(%partition, "creating session");
        EnvelopeEncryption::new(
            partition,
            self.metastore.clone(),
            self.kms.clone(),
            self.policy.clone(),
            self.system_key_cache.clone(),
        )
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Number of sessions currently held by the session cache.
    pub fn cached_session_count(&self) -> usize {
        self.sessions.as_ref().map_or(0, SessionCache::len)
    }

    /// Release the system key cache and every cached session. Idempotent; also
    /// runs on drop.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.system_key_cache.dispose();
        if let Some(sessions) = &self.sessions {
            sessions.dispose_all();
        }
        info!(
            product_id = %self.product_id,
            service_id = %self.service_id,
            "session factory disposed"
        );
    }
}

impl Drop for SessionFactory {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Builder for [`SessionFactory`]. A metastore, a crypto policy, and a key
/// management service are all required.
pub struct SessionFactoryBuilder {
    product_id: String,
    service_id: String,
    metastore: Option<Arc<dyn Metastore>>,
    policy: Option<Arc<dyn CryptoPolicy>>,
    kms: Option<Arc<dyn KeyManagementService>>,
}

impl SessionFactoryBuilder {
    pub fn with_metastore(mut self, metastore: Arc<dyn Metastore>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    /// Process-local metastore. Keys are lost when the process exits.
    pub fn with_in_memory_metastore(self) -> Self {
        self.with_metastore(Arc::new(InMemoryMetastore::new()))
    }

    pub fn with_crypto_policy(mut self, policy: Arc<dyn CryptoPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_never_expired_crypto_policy(self) -> Self {
        self.with_crypto_policy(Arc::new(NeverExpiredCryptoPolicy))
    }

    pub fn with_key_management_service(mut self, kms: Arc<dyn KeyManagementService>) -> Self {
        self.kms = Some(kms);
        self
    }

    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] if `master_key` is not 32 bytes.
    pub fn with_static_key_management_service(self, master_key: impl AsRef<[u8]>) -> Result<Self> {
        let kms = StaticKeyManagementService::new(master_key.as_ref())?;
        Ok(self.with_key_management_service(Arc::new(kms)))
    }

    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] if an id is empty or a
    /// collaborator was not supplied.
    pub fn build(self) -> Result<SessionFactory> {
        if self.product_id.is_empty() {
            return Err(AppEncryptionError::InvalidArgument(
                "product id cannot be empty".into(),
            ));
        }
        if self.service_id.is_empty() {
            return Err(AppEncryptionError::InvalidArgument(
                "service id cannot be empty".into(),
            ));
        }
        let metastore = self
            .metastore
            .ok_or_else(|| AppEncryptionError::InvalidArgument("a metastore is required".into()))?;
        let policy = self.policy.ok_or_else(|| {
            AppEncryptionError::InvalidArgument("a crypto policy is required".into())
        })?;
        let kms = self.kms.ok_or_else(|| {
            AppEncryptionError::InvalidArgument("a key management service is required".into())
        })?;

        let system_key_cache = Arc::new(SecureKeyCache::new(policy.revoke_check_period()));
        let sessions = policy.can_cache_sessions().then(|| {
            SessionCache::new(policy.session_cache_max_size(), policy.session_cache_expire())
        });

        Ok(SessionFactory {
            product_id: self.product_id,
            service_id: self.service_id,
            metastore,
            kms,
            policy,
            system_key_cache,
            sessions,
            disposed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::BasicExpiringCryptoPolicy;

    const MASTER: &[u8; 32] = b"thisIsAStaticMasterKeyForTesting";

    fn builder() -> SessionFactoryBuilder {
        SessionFactory::builder("prod", "svc")
            .with_in_memory_metastore()
            .with_never_expired_crypto_policy()
            .with_static_key_management_service(MASTER)
            .unwrap()
    }

    #[test]
    fn build_requires_ids() {
        let err = SessionFactory::builder("", "svc")
            .with_in_memory_metastore()
            .with_never_expired_crypto_policy()
            .with_static_key_management_service(MASTER)
            .unwrap()
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AppEncryptionError::InvalidArgument(_)));

        let err = SessionFactory::builder("prod", "")
            .with_in_memory_metastore()
            .with_never_expired_crypto_policy()
            .with_static_key_management_service(MASTER)
            .unwrap()
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AppEncryptionError::InvalidArgument(_)));
    }

    #[test]
    fn build_requires_collaborators() {
        let missing_kms = SessionFactory::builder("prod", "svc")
            .with_in_memory_metastore()
            .with_never_expired_crypto_policy()
            .build();
        assert!(matches!(missing_kms, Err(AppEncryptionError::InvalidArgument(_))));

        let missing_metastore = SessionFactory::builder("prod", "svc")
            .with_never_expired_crypto_policy()
            .with_static_key_management_service(MASTER)
            .unwrap()
            .build();
        assert!(matches!(missing_metastore, Err(AppEncryptionError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_bad_static_master_key() {
        assert!(SessionFactory::builder("prod", "svc")
            .with_static_key_management_service(b"short")
            .is_err());
    }

    #[test]
    fn session_ids_follow_partition() {
        let factory = builder().build().unwrap();
        let session = factory.session("p1").unwrap();
        assert_eq!(session.partition().intermediate_key_id(), "_IK_p1_svc_prod");
        assert_eq!(session.partition().system_key_id(), "_SK_svc_prod");
    }

    #[test]
    fn suffix_comes_from_metastore() {
        let factory = SessionFactory::builder("prod", "svc")
            .with_metastore(Arc::new(InMemoryMetastore::with_suffix("us-west-2")))
            .with_never_expired_crypto_policy()
            .with_static_key_management_service(MASTER)
            .unwrap()
            .build()
            .unwrap();
        let session = factory.session("p1").unwrap();
        assert_eq!(
            session.partition().intermediate_key_id(),
            "_IK_p1_svc_prod_us-west-2"
        );
    }

    #[test]
    fn empty_partition_rejected() {
        let factory = builder().build().unwrap();
        assert!(matches!(
            factory.session(""),
            Err(AppEncryptionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn disposed_factory_refuses_sessions() {
        let factory = builder().build().unwrap();
        factory.dispose();
        factory.dispose();
        assert!(matches!(
            factory.session("p1"),
            Err(AppEncryptionError::AppEncryption { .. })
        ));
    }

    #[test]
    fn sessions_cached_only_when_policy_allows() {
        let uncached = builder().build().unwrap();
        let a = uncached.session("p1").unwrap();
        let b = uncached.session("p1").unwrap();
        assert!(!Arc::ptr_eq(&a.engine, &b.engine));
        assert_eq!(uncached.cached_session_count(), 0);

        let policy = BasicExpiringCryptoPolicy::builder(30)
            .with_can_cache_sessions(true)
            .build();
        let cached = SessionFactory::builder("prod", "svc")
            .with_in_memory_metastore()
            .with_crypto_policy(Arc::new(policy))
            .with_static_key_management_service(MASTER)
            .unwrap()
            .build()
            .unwrap();
        let a = cached.session("p1").unwrap();
        let b = cached.session("p1").unwrap();
        assert!(Arc::ptr_eq(&a.engine, &b.engine));
        assert_eq!(cached.cached_session_count(), 1);
    }

    #[tokio::test]
    async fn session_round_trip() {
        let factory = builder().build().unwrap();
        let session = factory.session("p1").unwrap();
        let drr = session.encrypt(b"123-45-6789").await.unwrap();
        assert_eq!(session.decrypt(&drr).await.unwrap(), b"123-45-6789");
    }
}
