//! Key records, wire formats, and errors shared across the envelope encryption crates.

pub mod error;
pub mod protocol;

pub use error::{AppEncryptionError, Result};
pub use protocol::{DataRowRecord, DataRowRecordKey, KeyMeta, KeyRecord, WireKeyMeta};
