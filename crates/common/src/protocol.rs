//! Persisted key records and the data row record wire format.
//!
//! Every `Created` field is serialised as an integer count of Unix seconds, in
//! both metastore records and data row records.
//!
//! ```text
//! KeyRecord:     {"Created":1752685260,"Key":"<b64>","Revoked":false,"ParentKeyMeta":{"KeyId":"_SK_svc_prod","Created":1752685200}}
//! DataRowRecord: {"Key":{"Created":1752685310,"Key":"<b64>","ParentKeyMeta":{"KeyId":"_IK_p1_svc_prod","Created":1752685260}},"Data":"<b64>"}
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppEncryptionError, Result};

/// Drop the sub-second part of `ts`. Key creation times are always whole seconds
/// so that they survive a round trip through the wire format unchanged.
pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

// ---------------------------------------------------------------------------
// Key metadata
// ---------------------------------------------------------------------------

/// Pointer to exactly one [`KeyRecord`]: the metastore primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyMeta {
    #[serde(rename = "KeyId")]
    key_id: String,
    #[serde(rename = "Created", with = "chrono::serde::ts_seconds")]
    created: DateTime<Utc>,
}

impl KeyMeta {
    pub fn new(key_id: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            key_id: key_id.into(),
            created: truncate_to_seconds(created),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

impl std::fmt::Display for KeyMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMeta[keyId={}, created={}]", self.key_id, self.created.timestamp())
    }
}

// ---------------------------------------------------------------------------
// Metastore record
// ---------------------------------------------------------------------------

/// Persisted, encrypted system or intermediate key.
///
/// System key records carry no parent; intermediate key records always point at
/// the system key that wraps them. Records are immutable: a newer `created`
/// supersedes an older record rather than modifying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(rename = "Created", with = "chrono::serde::ts_seconds")]
    created: DateTime<Utc>,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Revoked", default, skip_serializing_if = "Option::is_none")]
    revoked: Option<bool>,
    #[serde(
        rename = "ParentKeyMeta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    parent_key_meta: Option<KeyMeta>,
}

impl KeyRecord {
    /// Record for a system key, wrapped directly by the key management service.
    pub fn system(created: DateTime<Utc>, encrypted_key: &[u8], revoked: Option<bool>) -> Self {
        Self {
            created: truncate_to_seconds(created),
            key: STANDARD.encode(encrypted_key),
            revoked,
            parent_key_meta: None,
        }
    }

    /// Record for an intermediate key wrapped by the system key `parent`.
    pub fn intermediate(
        created: DateTime<Utc>,
        encrypted_key: &[u8],
        revoked: Option<bool>,
        parent: KeyMeta,
    ) -> Self {
        Self {
            created: truncate_to_seconds(created),
            key: STANDARD.encode(encrypted_key),
            revoked,
            parent_key_meta: Some(parent),
        }
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Base64 form of the encrypted key, as stored.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn revoked(&self) -> Option<bool> {
        self.revoked
    }

    /// `true` only when the record is explicitly marked revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked.unwrap_or(false)
    }

    pub fn parent_key_meta(&self) -> Option<&KeyMeta> {
        self.parent_key_meta.as_ref()
    }

    /// Copy of this record with the revoked flag set. Used by administrative
    /// tooling; normal operation never rewrites a record.
    pub fn with_revoked(&self, revoked: bool) -> Self {
        Self {
            revoked: Some(revoked),
            ..self.clone()
        }
    }

    /// Decode the stored key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AppEncryptionError::AppEncryption`] if the stored value is not
    /// valid base64; a corrupt metastore row is not a caller error.
    pub fn encrypted_key_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.key)
            .map_err(|e| AppEncryptionError::wrap("key record holds invalid base64", e))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppEncryptionError::wrap("failed to serialise key record", e))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AppEncryptionError::wrap("failed to deserialise key record", e))
    }
}

// ---------------------------------------------------------------------------
// Data row record
// ---------------------------------------------------------------------------

/// Parent pointer as it appears in a data row record.
///
/// Both fields are optional at the parsing layer so that an incomplete pointer
/// is reported as missing metadata instead of malformed JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireKeyMeta {
    #[serde(rename = "KeyId", default)]
    pub key_id: Option<String>,
    #[serde(rename = "Created", default, with = "chrono::serde::ts_seconds_option")]
    pub created: Option<DateTime<Utc>>,
}

impl WireKeyMeta {
    /// The complete [`KeyMeta`], or `None` if either field is absent.
    pub fn to_key_meta(&self) -> Option<KeyMeta> {
        match (&self.key_id, self.created) {
            (Some(key_id), Some(created)) => Some(KeyMeta::new(key_id.clone(), created)),
            _ => None,
        }
    }
}

impl From<KeyMeta> for WireKeyMeta {
    fn from(meta: KeyMeta) -> Self {
        Self {
            key_id: Some(meta.key_id),
            created: Some(meta.created),
        }
    }
}

/// The `Key` object of a data row record: the wrapped per-call data key.
///
/// Data keys are never revoked, so there is no revoked flag here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRowRecordKey {
    #[serde(rename = "Created", with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "ParentKeyMeta", default)]
    pub parent_key_meta: Option<WireKeyMeta>,
}

/// Self-describing encrypted payload returned by encrypt and accepted by decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRowRecord {
    #[serde(rename = "Key", default)]
    pub key: Option<DataRowRecordKey>,
    #[serde(rename = "Data", default)]
    pub data: Option<String>,
}

impl DataRowRecord {
    /// Build a record from raw bytes, base64-encoding the binary parts.
    pub fn new(
        data_key_created: DateTime<Utc>,
        encrypted_data_key: &[u8],
        parent: KeyMeta,
        ciphertext: &[u8],
    ) -> Self {
        Self {
            key: Some(DataRowRecordKey {
                created: truncate_to_seconds(data_key_created),
                key: STANDARD.encode(encrypted_data_key),
                parent_key_meta: Some(parent.into()),
            }),
            data: Some(STANDARD.encode(ciphertext)),
        }
    }

    /// Parse UTF-8 JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] for empty input, input that
    /// is not JSON, or a JSON `null`.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(AppEncryptionError::InvalidArgument(
                "data row record bytes cannot be empty".into(),
            ));
        }
        let parsed: Option<Self> = serde_json::from_slice(bytes).map_err(|e| {
            AppEncryptionError::InvalidArgument(format!(
                "invalid JSON format in data row record: {e}"
            ))
        })?;
        parsed.ok_or_else(|| {
            AppEncryptionError::InvalidArgument("data row record cannot be null".into())
        })
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| AppEncryptionError::wrap("failed to serialise data row record", e))
    }

    /// Decode the `Data` field.
    ///
    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] if `Data` is absent or not base64.
    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>> {
        let data = self.data.as_deref().ok_or_else(|| {
            AppEncryptionError::InvalidArgument("data row record has no Data".into())
        })?;
        STANDARD.decode(data).map_err(|e| {
            AppEncryptionError::InvalidArgument(format!("data row record Data is not base64: {e}"))
        })
    }
}

impl DataRowRecordKey {
    /// Decode the wrapped data key.
    ///
    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] if `Key` is not base64.
    pub fn encrypted_key_bytes(&self) -> Result<Vec<u8>> {
        STANDARD.decode(&self.key).map_err(|e| {
            AppEncryptionError::InvalidArgument(format!("data row record Key is not base64: {e}"))
        })
    }
}
