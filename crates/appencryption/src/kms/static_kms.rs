//! [`StaticKeyManagementService`]: fixed in-process master key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AppEncryptionError, Result};

use super::KeyManagementService;
use crate::crypto::{AeadEnvelopeCrypto, CryptoKey, KEY_LEN};

/// Master key held in memory. For development and tests only: anyone with the
/// key string can decrypt every system key.
pub struct StaticKeyManagementService {
    master_key: CryptoKey,
    crypto: AeadEnvelopeCrypto,
}

impl StaticKeyManagementService {
    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] unless `master_key` is exactly
    /// [`KEY_LEN`] bytes.
    pub fn new(master_key: &[u8]) -> Result<Self> {
        let master_key = CryptoKey::from_bytes(master_key, Utc::now(), false).map_err(|_| {
            AppEncryptionError::InvalidArgument(format!(
                "static master key must be {KEY_LEN} bytes"
            ))
        })?;
        Ok(Self {
            master_key,
            crypto: AeadEnvelopeCrypto::new(),
        })
    }
}

impl std::fmt::Debug for StaticKeyManagementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyManagementService").finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyManagementService for StaticKeyManagementService {
    async fn encrypt_key(&self, key: &CryptoKey) -> Result<Vec<u8>> {
        Ok(self.crypto.encrypt_key(key, &self.master_key)?)
    }

    async fn decrypt_key(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        revoked: bool,
    ) -> Result<CryptoKey> {
        Ok(self
            .crypto
            .decrypt_key(encrypted_key, created, &self.master_key, revoked)?)
    }
}
