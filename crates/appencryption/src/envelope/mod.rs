//! The envelope encryption engine for one partition.
//!
//! # Key resolution
//!
//! Writes always use the latest usable intermediate key (IK), creating one (and
//! if needed a system key, SK) when there is none. New key timestamps are
//! truncated by the [`CryptoPolicy`] so that concurrent creators, in this or
//! another process, race on the same metastore primary key: exactly one
//! conditional insert wins and every loser re-reads the winner.
//!
//! Reads resolve exactly the `(key_id, created)` named in the data row record
//! and never create keys.
//!
//! # Key lifetime
//!
//! Resolved keys travel as [`KeyHandle`]s. An owned key is wiped when its handle
//! drops at the end of the operation; a cached key is only released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{AppEncryptionError, DataRowRecord, KeyMeta, KeyRecord, Result};
use tracing::{debug, info, warn};

use crate::cache::SecureKeyCache;
use crate::crypto::{AeadEnvelopeCrypto, CryptoKey, KeyHandle};
use crate::kms::KeyManagementService;
use crate::metastore::Metastore;
use crate::partition::Partition;
use crate::policy::CryptoPolicy;

/// Outcome of resolving a parent key.
#[derive(Debug)]
pub(crate) enum KeyLookup {
    Found(KeyHandle),
    /// The record exists but is expired or revoked and the caller asked to
    /// treat that as missing.
    Unusable,
    NotFound,
}

/// Encrypts payloads into data row records, and back, for one [`Partition`].
pub struct EnvelopeEncryption {
    partition: Partition,
    metastore: Arc<dyn Metastore>,
    kms: Arc<dyn KeyManagementService>,
    policy: Arc<dyn CryptoPolicy>,
    crypto: AeadEnvelopeCrypto,
    system_key_cache: Arc<SecureKeyCache>,
    intermediate_key_cache: SecureKeyCache,
}

impl EnvelopeEncryption {
    /// `system_key_cache` is shared with every other engine of the same factory;
    /// the intermediate key cache is private to this engine.
    pub fn new(
        partition: Partition,
        metastore: Arc<dyn Metastore>,
        kms: Arc<dyn KeyManagementService>,
        policy: Arc<dyn CryptoPolicy>,
        system_key_cache: Arc<SecureKeyCache>,
    ) -> Self {
        let intermediate_key_cache = SecureKeyCache::new(policy.revoke_check_period());
        Self {
            partition,
            metastore,
            kms,
            policy,
            crypto: AeadEnvelopeCrypto::new(),
            system_key_cache,
            intermediate_key_cache,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Encrypt `payload` under a fresh data key and return the serialised
    /// data row record.
    ///
    /// # Errors
    ///
    /// Collaborator and crypto failures are returned as
    /// [`AppEncryptionError::AppEncryption`]; KMS outages as [`AppEncryptionError::Kms`].
    pub async fn encrypt_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let ik = self.intermediate_key_for_write().await?;

        let result = self.crypto.envelope_encrypt(payload, &ik)?;
        let parent = KeyMeta::new(self.partition.intermediate_key_id(), ik.created());
        let drr = DataRowRecord::new(
            result.created,
            &result.encrypted_key,
            parent,
            &result.cipher_text,
        );
        drr.to_json_bytes()
    }

    /// Decrypt a data row record produced by [`EnvelopeEncryption::encrypt_payload`].
    ///
    /// # Errors
    ///
    /// - [`AppEncryptionError::InvalidArgument`] if `data_row_record` is not a
    ///   well-formed record.
    /// - [`AppEncryptionError::MetadataMissing`] if the parent pointer is absent,
    ///   belongs to another partition, or names a key that cannot be found.
    /// - [`AppEncryptionError::AppEncryption`] if decryption fails.
    pub async fn decrypt_data_row_record(&self, data_row_record: &[u8]) -> Result<Vec<u8>> {
        let drr = DataRowRecord::from_json_bytes(data_row_record)?;

        let data_key = drr.key.as_ref().ok_or_else(|| {
            AppEncryptionError::MetadataMissing("data row record has no Key".into())
        })?;
        let parent = data_key
            .parent_key_meta
            .as_ref()
            .ok_or_else(|| {
                AppEncryptionError::MetadataMissing("could not find parentKeyMeta".into())
            })?
            .to_key_meta()
            .ok_or_else(|| {
                AppEncryptionError::MetadataMissing(
                    "parentKeyMeta needs both KeyId and Created".into(),
                )
            })?;

        if !self.partition.is_valid_intermediate_key_id(parent.key_id()) {
            return Err(AppEncryptionError::MetadataMissing(format!(
                "could not find parentKeyMeta {} for {}",
                parent.key_id(),
                self.partition
            )));
        }

        let encrypted_data_key = data_key.encrypted_key_bytes()?;
        let cipher_text = drr.ciphertext_bytes()?;

        let ik = self.intermediate_key_for_read(&parent).await?;
        let plaintext = self.crypto.envelope_decrypt(
            &cipher_text,
            &encrypted_data_key,
            data_key.created,
            &ik,
        )?;
        Ok(plaintext)
    }

    /// Release the intermediate keys cached by this engine. Idempotent.
    pub fn dispose(&self) {
        self.intermediate_key_cache.dispose();
    }

    // -----------------------------------------------------------------------
    // Usability
    // -----------------------------------------------------------------------

    /// Whether a key may protect new data.
    ///
    /// Under queued rotation an expired key stays in service until a background
    /// process replaces it.
    fn is_usable_for_write(&self, key_id: &str, created: DateTime<Utc>, revoked: bool) -> bool {
        if revoked {
            return false;
        }
        if !self.policy.is_key_expired(created) {
            return true;
        }
        if self.policy.is_queued_key_rotation() {
            warn!(
                key_id,
                created = created.timestamp(),
                "key expired, rotation deferred to queue"
            );
            return true;
        }
        false
    }

    fn is_record_usable_for_write(&self, key_id: &str, record: &KeyRecord) -> bool {
        self.is_usable_for_write(key_id, record.created(), record.is_revoked())
    }

    // -----------------------------------------------------------------------
    // Intermediate keys
    // -----------------------------------------------------------------------

    async fn intermediate_key_for_write(&self) -> Result<KeyHandle> {
        let ik_id = self.partition.intermediate_key_id();

        if self.policy.can_cache_intermediate_keys() {
            if let Some(ik) = self.intermediate_key_cache.get_latest() {
                if self.is_usable_for_write(ik_id, ik.created(), ik.is_revoked()) {
                    return Ok(KeyHandle::Cached(ik));
                }
            }
        }

        let ik = self.latest_or_create_intermediate_key().await?;
        Ok(self.retain_intermediate_key(ik))
    }

    async fn latest_or_create_intermediate_key(&self) -> Result<CryptoKey> {
        let ik_id = self.partition.intermediate_key_id();

        if let Some(record) = self.metastore.try_load_latest(ik_id).await? {
            if self.is_record_usable_for_write(ik_id, &record) {
                match record.parent_key_meta() {
                    Some(parent) => match self.get_system_key(parent, true).await? {
                        KeyLookup::Found(sk) => {
                            return self.decrypt_intermediate_key_record(&record, &sk);
                        }
                        KeyLookup::Unusable => {
                            warn!(
                                key_id = ik_id,
                                parent = %parent,
                                "parent system key is unusable, creating new intermediate key"
                            );
                        }
                        KeyLookup::NotFound => {
                            warn!(
                                key_id = ik_id,
                                parent = %parent,
                                "parent system key not found, creating new intermediate key"
                            );
                        }
                    },
                    None => {
                        warn!(
                            key_id = ik_id,
                            "latest intermediate key has no parent, creating new key"
                        );
                    }
                }
            }
        }

        let created = self
            .policy
            .truncate_to_intermediate_key_precision(Utc::now());
        let ik = self.crypto.generate_key(created);
        let record = {
            let sk = self.system_key_for_write().await?;
            let encrypted_ik = self.crypto.encrypt_key(&ik, &sk)?;
            KeyRecord::intermediate(
                ik.created(),
                &encrypted_ik,
                Some(false),
                KeyMeta::new(self.partition.system_key_id(), sk.created()),
            )
        };

        if self.metastore.store(ik_id, ik.created(), &record).await? {
            debug!(key_id = ik_id, created = ik.created().timestamp(), "created intermediate key");
            return Ok(ik);
        }

        // Another writer stored the same key id first. Use theirs.
        drop(ik);
        debug!(key_id = ik_id, "lost intermediate key creation race, reloading latest");
        let record = self.metastore.try_load_latest(ik_id).await?.ok_or_else(|| {
            AppEncryptionError::app(format!(
                "unable to retrieve intermediate key {ik_id} after store conflict"
            ))
        })?;
        let parent = record.parent_key_meta().ok_or_else(|| {
            AppEncryptionError::MetadataMissing(format!(
                "intermediate key {ik_id} has no parent system key"
            ))
        })?;
        let sk = self.system_key_for_read(parent).await?;
        self.decrypt_intermediate_key_record(&record, &sk)
    }

    async fn intermediate_key_for_read(&self, meta: &KeyMeta) -> Result<KeyHandle> {
        // Keys of sibling suffixes share timestamps with ours, so only our own
        // id is cached.
        let cacheable = self.policy.can_cache_intermediate_keys()
            && meta.key_id() == self.partition.intermediate_key_id();

        let ik = match cacheable
            .then(|| self.intermediate_key_cache.get(meta.created()))
            .flatten()
        {
            Some(ik) => KeyHandle::Cached(ik),
            None => {
                let ik = self.load_intermediate_key(meta).await?;
                if cacheable {
                    self.retain_intermediate_key(ik)
                } else {
                    KeyHandle::Owned(ik)
                }
            }
        };

        if self.policy.notify_expired_intermediate_key_on_read()
            && self.policy.is_key_expired(ik.created())
        {
            info!(
                key_id = meta.key_id(),
                created = ik.created().timestamp(),
                "read with expired intermediate key"
            );
        }
        Ok(ik)
    }

    async fn load_intermediate_key(&self, meta: &KeyMeta) -> Result<CryptoKey> {
        let record = self
            .metastore
            .try_load(meta.key_id(), meta.created())
            .await?
            .ok_or_else(|| {
                AppEncryptionError::MetadataMissing(format!(
                    "could not find intermediate key {meta}"
                ))
            })?;
        let parent = record.parent_key_meta().ok_or_else(|| {
            AppEncryptionError::MetadataMissing(format!(
                "could not find parentKeyMeta (system key) for intermediate key {meta}"
            ))
        })?;
        let sk = self.system_key_for_read(parent).await?;
        self.decrypt_intermediate_key_record(&record, &sk)
    }

    fn decrypt_intermediate_key_record(
        &self,
        record: &KeyRecord,
        sk: &CryptoKey,
    ) -> Result<CryptoKey> {
        let encrypted = record.encrypted_key_bytes()?;
        Ok(self
            .crypto
            .decrypt_key(&encrypted, record.created(), sk, record.is_revoked())?)
    }

    fn retain_intermediate_key(&self, ik: CryptoKey) -> KeyHandle {
        if self.policy.can_cache_intermediate_keys() {
            KeyHandle::Cached(self.intermediate_key_cache.put_and_get_usable(ik.created(), ik))
        } else {
            KeyHandle::Owned(ik)
        }
    }

    // -----------------------------------------------------------------------
    // System keys
    // -----------------------------------------------------------------------

    async fn system_key_for_write(&self) -> Result<KeyHandle> {
        let sk_id = self.partition.system_key_id();

        if self.policy.can_cache_system_keys() {
            if let Some(sk) = self.system_key_cache.get_latest() {
                if self.is_usable_for_write(sk_id, sk.created(), sk.is_revoked()) {
                    return Ok(KeyHandle::Cached(sk));
                }
            }
        }

        let sk = self.latest_or_create_system_key().await?;
        Ok(self.retain_system_key(sk))
    }

    async fn latest_or_create_system_key(&self) -> Result<CryptoKey> {
        let sk_id = self.partition.system_key_id();

        if let Some(record) = self.metastore.try_load_latest(sk_id).await? {
            if self.is_record_usable_for_write(sk_id, &record) {
                return self.decrypt_system_key_record(&record).await;
            }
        }

        let created = self.policy.truncate_to_system_key_precision(Utc::now());
        let sk = self.crypto.generate_key(created);
        let encrypted_sk = self.kms.encrypt_key(&sk).await?;
        let record = KeyRecord::system(sk.created(), &encrypted_sk, Some(false));

        if self.metastore.store(sk_id, sk.created(), &record).await? {
            debug!(key_id = sk_id, created = sk.created().timestamp(), "created system key");
            return Ok(sk);
        }

        drop(sk);
        debug!(key_id = sk_id, "lost system key creation race, reloading latest");
        let record = self.metastore.try_load_latest(sk_id).await?.ok_or_else(|| {
            AppEncryptionError::app(format!(
                "unable to retrieve system key {sk_id} after store conflict"
            ))
        })?;
        self.decrypt_system_key_record(&record).await
    }

    /// Resolve the system key `meta`.
    ///
    /// With `treat_expired_as_missing`, a key that may not protect new data is
    /// reported as [`KeyLookup::Unusable`] instead of being decrypted.
    pub(crate) async fn get_system_key(
        &self,
        meta: &KeyMeta,
        treat_expired_as_missing: bool,
    ) -> Result<KeyLookup> {
        // The cache is keyed by timestamp alone, which is only unambiguous for our own id.
        let cacheable =
            self.policy.can_cache_system_keys() && meta.key_id() == self.partition.system_key_id();

        if cacheable {
            if let Some(sk) = self.system_key_cache.get(meta.created()) {
                if treat_expired_as_missing
                    && !self.is_usable_for_write(meta.key_id(), sk.created(), sk.is_revoked())
                {
                    return Ok(KeyLookup::Unusable);
                }
                return Ok(KeyLookup::Found(KeyHandle::Cached(sk)));
            }
        }

        let Some(record) = self.metastore.try_load(meta.key_id(), meta.created()).await? else {
            return Ok(KeyLookup::NotFound);
        };
        if treat_expired_as_missing && !self.is_record_usable_for_write(meta.key_id(), &record) {
            return Ok(KeyLookup::Unusable);
        }

        let sk = self.decrypt_system_key_record(&record).await?;
        let sk = if cacheable {
            self.retain_system_key(sk)
        } else {
            KeyHandle::Owned(sk)
        };
        Ok(KeyLookup::Found(sk))
    }

    async fn system_key_for_read(&self, meta: &KeyMeta) -> Result<KeyHandle> {
        match self.get_system_key(meta, false).await? {
            KeyLookup::Found(sk) => {
                if self.policy.notify_expired_system_key_on_read()
                    && self.policy.is_key_expired(sk.created())
                {
                    info!(
                        key_id = meta.key_id(),
                        created = sk.created().timestamp(),
                        "read with expired system key"
                    );
                }
                Ok(sk)
            }
            KeyLookup::Unusable | KeyLookup::NotFound => Err(AppEncryptionError::MetadataMissing(
                format!("could not find system key {meta}"),
            )),
        }
    }

    async fn decrypt_system_key_record(&self, record: &KeyRecord) -> Result<CryptoKey> {
        let encrypted = record.encrypted_key_bytes()?;
        self.kms
            .decrypt_key(&encrypted, record.created(), record.is_revoked())
            .await
    }

    fn retain_system_key(&self, sk: CryptoKey) -> KeyHandle {
        if self.policy.can_cache_system_keys() {
            KeyHandle::Cached(self.system_key_cache.put_and_get_usable(sk.created(), sk))
        } else {
            KeyHandle::Owned(sk)
        }
    }
}
