//! AES-256-GCM-SIV primitives and key ownership types.
//!
//! This module is free of metastore and KMS concerns. It provides the key type
//! shared by every tier of the hierarchy and the AEAD operations the engine
//! applies at each tier.

pub mod cipher;
pub mod key;

pub use cipher::{AeadEnvelopeCrypto, CipherError, EnvelopeEncryptResult};
pub use key::{CryptoKey, KeyHandle, KEY_LEN};
