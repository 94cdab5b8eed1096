//! Application-layer envelope encryption.
//!
//! Payloads are encrypted under single-use data keys. Data keys are wrapped by
//! an intermediate key per partition, intermediate keys by a system key per
//! service and product, and system keys by a master key held in a key
//! management service:
//!
//! ```text
//! KMS master key ─► system key ─► intermediate key ─► data key ─► payload
//! ```
//!
//! Start with [`SessionFactory::builder`].

pub mod cache;
pub mod crypto;
pub mod envelope;
pub mod kms;
pub mod metastore;
pub mod partition;
pub mod policy;
pub mod session;

pub use cache::SecureKeyCache;
pub use crypto::{AeadEnvelopeCrypto, CryptoKey, KeyHandle};
pub use envelope::EnvelopeEncryption;
pub use kms::{
    AwsKeyManagementService, KeyManagementService, KmsRegionClient, RegionKeyArn,
    StaticKeyManagementService,
};
pub use metastore::{InMemoryMetastore, Metastore};
pub use partition::Partition;
pub use policy::{
    BasicExpiringCryptoPolicy, CryptoPolicy, KeyRotationStrategy, NeverExpiredCryptoPolicy,
};
pub use session::{Session, SessionFactory, SessionFactoryBuilder};

pub use common::{AppEncryptionError, DataRowRecord, KeyMeta, KeyRecord, Result};
