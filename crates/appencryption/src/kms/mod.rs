//! Master key operations: wrapping and unwrapping system keys.

pub mod aws;
pub mod static_kms;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;

use crate::crypto::CryptoKey;

pub use aws::{AwsKeyManagementService, GeneratedDataKey, KmsRegionClient, RegionKeyArn};
pub use static_kms::StaticKeyManagementService;

/// Wraps system keys under a master key the process never sees in the clear
/// (except for [`StaticKeyManagementService`]).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Encrypt the system key `key`, returning an opaque blob for the metastore.
    async fn encrypt_key(&self, key: &CryptoKey) -> Result<Vec<u8>>;

    /// Decrypt a blob produced by [`KeyManagementService::encrypt_key`].
    async fn decrypt_key(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        revoked: bool,
    ) -> Result<CryptoKey>;
}
