//! AES-256-GCM-SIV payload and key encryption.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant, so
//! an accidental nonce repeat under a long-lived intermediate key does not break
//! confidentiality or authentication.
//!
//! Every ciphertext produced here is laid out as
//!
//! ```text
//! ciphertext || tag (16 bytes) || nonce (12 bytes)
//! ```

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use chrono::{DateTime, Utc};
use common::protocol::truncate_to_seconds;
use common::AppEncryptionError;
use thiserror::Error;
use zeroize::Zeroizing;

use super::key::{CryptoKey, KEY_LEN};

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag.
pub const TAG_LEN: usize = 16;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Key material is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// AES-GCM-SIV encryption or decryption failed.
    #[error("aead operation failed")]
    AeadFailure,

    /// The ciphertext is too short to hold a tag and nonce.
    #[error("ciphertext is truncated")]
    Truncated,
}

impl From<CipherError> for AppEncryptionError {
    fn from(e: CipherError) -> Self {
        AppEncryptionError::wrap("cipher operation failed", e)
    }
}

/// Output of [`AeadEnvelopeCrypto::envelope_encrypt`].
#[derive(Debug, Clone)]
pub struct EnvelopeEncryptResult {
    /// Payload ciphertext, encrypted under the data key.
    pub cipher_text: Vec<u8>,
    /// Data key, encrypted under the key encryption key.
    pub encrypted_key: Vec<u8>,
    /// Creation time of the data key.
    pub created: DateTime<Utc>,
}

/// The AEAD engine used at every level of the key hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AeadEnvelopeCrypto;

impl AeadEnvelopeCrypto {
    pub fn new() -> Self {
        Self
    }

    /// Generate a new random key stamped with `created`.
    pub fn generate_key(&self, created: DateTime<Utc>) -> CryptoKey {
        CryptoKey::generate(created)
    }

    /// Encrypt `plaintext` under `key` with a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::AeadFailure`] on an internal AEAD error.
    pub fn encrypt(&self, plaintext: &[u8], key: &CryptoKey) -> Result<Vec<u8>, CipherError> {
        let cipher = build_cipher(key.secret())?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut out = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::AeadFailure)?;
        out.extend_from_slice(&nonce_bytes);
        Ok(out)
    }

    /// Decrypt a buffer produced by [`AeadEnvelopeCrypto::encrypt`].
    ///
    /// The plaintext is returned in a buffer that is zeroed when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Truncated`] if the input cannot hold a tag and nonce,
    /// and [`CipherError::AeadFailure`] if authentication fails (wrong key or
    /// tampered data).
    pub fn decrypt(
        &self,
        cipher_text: &[u8],
        key: &CryptoKey,
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        if cipher_text.len() < TAG_LEN + NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let cipher = build_cipher(key.secret())?;
        let (body, nonce_bytes) = cipher_text.split_at(cipher_text.len() - NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, body)
            .map(Zeroizing::new)
            .map_err(|_| CipherError::AeadFailure)
    }

    /// Wrap `key` under `key_encryption_key`.
    pub fn encrypt_key(
        &self,
        key: &CryptoKey,
        key_encryption_key: &CryptoKey,
    ) -> Result<Vec<u8>, CipherError> {
        self.encrypt(key.secret(), key_encryption_key)
    }

    /// Unwrap a key produced by [`AeadEnvelopeCrypto::encrypt_key`].
    pub fn decrypt_key(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        key_encryption_key: &CryptoKey,
        revoked: bool,
    ) -> Result<CryptoKey, CipherError> {
        let secret = self.decrypt(encrypted_key, key_encryption_key)?;
        CryptoKey::from_bytes(&secret, created, revoked)
    }

    /// Encrypt `plaintext` under a freshly generated data key and wrap that data
    /// key under `key_encryption_key`. The data key is wiped before returning.
    pub fn envelope_encrypt(
        &self,
        plaintext: &[u8],
        key_encryption_key: &CryptoKey,
    ) -> Result<EnvelopeEncryptResult, CipherError> {
        let data_key = self.generate_key(truncate_to_seconds(Utc::now()));
        let cipher_text = self.encrypt(plaintext, &data_key)?;
        let encrypted_key = self.encrypt_key(&data_key, key_encryption_key)?;
        Ok(EnvelopeEncryptResult {
            cipher_text,
            encrypted_key,
            created: data_key.created(),
        })
    }

    /// Reverse [`AeadEnvelopeCrypto::envelope_encrypt`].
    pub fn envelope_decrypt(
        &self,
        cipher_text: &[u8],
        encrypted_key: &[u8],
        key_created: DateTime<Utc>,
        key_encryption_key: &CryptoKey,
    ) -> Result<Vec<u8>, CipherError> {
        let data_key = self.decrypt_key(encrypted_key, key_created, key_encryption_key, false)?;
        let plaintext = self.decrypt(cipher_text, &data_key)?;
        Ok(plaintext.to_vec())
    }
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}
