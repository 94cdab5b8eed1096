//! [`CryptoKey`]: owned, self-wiping key material, and [`KeyHandle`], the
//! ownership wrapper handed out by key resolution.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use chrono::{DateTime, Utc};
use common::protocol::truncate_to_seconds;
use zeroize::Zeroize;

use super::cipher::CipherError;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// A decrypted key together with its creation time and revocation state.
///
/// `CryptoKey` is deliberately not `Clone`: each instance is one ownership unit
/// and its secret is overwritten with zeroes exactly once, when it is dropped.
/// Two instances may hold the same logical key if it was loaded twice.
pub struct CryptoKey {
    secret: Box<[u8; KEY_LEN]>,
    created: DateTime<Utc>,
    revoked: AtomicBool,
}

impl CryptoKey {
    /// Generate fresh random key material stamped with `created`.
    pub fn generate(created: DateTime<Utc>) -> Self {
        let mut secret = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut secret[..]);
        Self {
            secret,
            created: truncate_to_seconds(created),
            revoked: AtomicBool::new(false),
        }
    }

    /// Copy `bytes` into a new key. The caller remains responsible for wiping
    /// its own buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] unless `bytes` is exactly [`KEY_LEN`] long.
    pub fn from_bytes(
        bytes: &[u8],
        created: DateTime<Utc>,
        revoked: bool,
    ) -> Result<Self, CipherError> {
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength);
        }
        let mut secret = Box::new([0u8; KEY_LEN]);
        secret.copy_from_slice(bytes);
        Ok(Self {
            secret,
            created: truncate_to_seconds(created),
            revoked: AtomicBool::new(revoked),
        })
    }

    /// Raw key bytes. Only borrow for the duration of a single crypto call.
    pub fn secret(&self) -> &[u8] {
        &self.secret[..]
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Flag a shared key as revoked. Revocation is one-way.
    pub fn mark_revoked(&self) {
        self.revoked.store(true, Ordering::Release);
    }
}

impl Drop for CryptoKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("CryptoKey")
            .field("secret", &"[REDACTED]")
            .field("created", &self.created.timestamp())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// A resolved key, tagged with who is responsible for wiping it.
///
/// - [`KeyHandle::Owned`]: the holder owns the key; dropping the handle wipes it.
/// - [`KeyHandle::Cached`]: the key belongs to a [`crate::cache::SecureKeyCache`];
///   dropping the handle only releases the borrow.
#[derive(Debug)]
pub enum KeyHandle {
    Owned(CryptoKey),
    Cached(Arc<CryptoKey>),
}

impl KeyHandle {
    pub fn is_cached(&self) -> bool {
        matches!(self, KeyHandle::Cached(_))
    }
}

impl Deref for KeyHandle {
    type Target = CryptoKey;

    fn deref(&self) -> &CryptoKey {
        match self {
            KeyHandle::Owned(key) => key,
            KeyHandle::Cached(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn generate_produces_distinct_keys() {
        let a = CryptoKey::generate(ts(1));
        let b = CryptoKey::generate(ts(1));
        assert_ne!(a.secret(), b.secret());
        assert_eq!(a.secret().len(), KEY_LEN);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(CryptoKey::from_bytes(&[0u8; 16], ts(1), false).is_err());
    }

    #[test]
    fn from_bytes_keeps_state() {
        let key = CryptoKey::from_bytes(&[7u8; KEY_LEN], ts(42), true).unwrap();
        assert_eq!(key.secret(), &[7u8; KEY_LEN]);
        assert_eq!(key.created(), ts(42));
        assert!(key.is_revoked());
    }

    #[test]
    fn mark_revoked_is_visible_through_shared_handles() {
        let shared = Arc::new(CryptoKey::generate(ts(1)));
        let handle = KeyHandle::Cached(shared.clone());
        assert!(!handle.is_revoked());
        shared.mark_revoked();
        assert!(handle.is_revoked());
    }

    #[test]
    fn dropping_cached_handle_leaves_key_alive() {
        let shared = Arc::new(CryptoKey::from_bytes(&[9u8; KEY_LEN], ts(1), false).unwrap());
        let handle = KeyHandle::Cached(shared.clone());
        assert!(handle.is_cached());
        drop(handle);
        assert_eq!(Arc::strong_count(&shared), 1);
        assert_eq!(shared.secret(), &[9u8; KEY_LEN]);
    }

    #[test]
    fn key_redacted_in_debug() {
        let key = CryptoKey::from_bytes(&[0xFF; KEY_LEN], ts(1), false).unwrap();
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("255"));
    }
}
