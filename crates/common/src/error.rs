//! Common error types shared across crates.

use thiserror::Error;

/// Boxed cause carried by [`AppEncryptionError::AppEncryption`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for envelope encryption operations.
///
/// Variants follow how a caller is expected to react:
/// - [`AppEncryptionError::InvalidArgument`] → the input bytes are unusable, do not retry
/// - [`AppEncryptionError::MetadataMissing`] → the key chain cannot be resolved
/// - [`AppEncryptionError::AppEncryption`] → a collaborator failed unexpectedly
/// - [`AppEncryptionError::Kms`] → no configured KMS region could serve the request
#[derive(Debug, Error)]
pub enum AppEncryptionError {
    /// Malformed caller input, e.g. a data row record that is not valid JSON.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A key record, or the parent pointer needed to reach it, could not be found.
    #[error("metadata missing: {0}")]
    MetadataMissing(String),

    /// Unexpected failure from the metastore, the AEAD layer, or an operation
    /// applied to a resolved key.
    #[error("app encryption failure: {message}")]
    AppEncryption {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// All configured key management regions failed.
    #[error("kms failure: {0}")]
    Kms(String),
}

impl AppEncryptionError {
    /// Construct an [`AppEncryptionError::AppEncryption`] without an underlying cause.
    pub fn app(message: impl Into<String>) -> Self {
        Self::AppEncryption {
            message: message.into(),
            source: None,
        }
    }

    /// Construct an [`AppEncryptionError::AppEncryption`] wrapping `source`.
    pub fn wrap(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::AppEncryption {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Short machine-readable code for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            AppEncryptionError::InvalidArgument(_) => "invalid_argument",
            AppEncryptionError::MetadataMissing(_) => "metadata_missing",
            AppEncryptionError::AppEncryption { .. } => "app_encryption",
            AppEncryptionError::Kms(_) => "kms",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T, E = AppEncryptionError> = std::result::Result<T, E>;
