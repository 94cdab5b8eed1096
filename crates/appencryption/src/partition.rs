//! Key id derivation for a `(partition, service, product)` triple.

use std::fmt;

const SYSTEM_KEY_PREFIX: &str = "_SK_";
const INTERMEDIATE_KEY_PREFIX: &str = "_IK_";
const SEPARATOR: &str = "_";

/// Logical scope of a session: one intermediate key series per partition,
/// one system key series per `(service, product)`.
///
/// A suffix (typically a region) is appended to both key ids when the
/// metastore supplies one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    partition_id: String,
    service_id: String,
    product_id: String,
    suffix: Option<String>,
    system_key_id: String,
    intermediate_key_id: String,
    base_intermediate_key_id: String,
}

impl Partition {
    pub fn new(
        partition_id: impl Into<String>,
        service_id: impl Into<String>,
        product_id: impl Into<String>,
    ) -> Self {
        Self::with_suffix(partition_id, service_id, product_id, None)
    }

    /// Build a partition whose key ids carry `suffix`. An empty suffix is
    /// treated as no suffix.
    pub fn with_suffix(
        partition_id: impl Into<String>,
        service_id: impl Into<String>,
        product_id: impl Into<String>,
        suffix: Option<String>,
    ) -> Self {
        let partition_id = partition_id.into();
        let service_id = service_id.into();
        let product_id = product_id.into();
        let suffix = suffix.filter(|s| !s.is_empty());

        let base_key_part = format!("{service_id}{SEPARATOR}{product_id}");
        let base_system_key_id = format!("{SYSTEM_KEY_PREFIX}{base_key_part}");
        let base_intermediate_key_id =
            format!("{INTERMEDIATE_KEY_PREFIX}{partition_id}{SEPARATOR}{base_key_part}");

        let (system_key_id, intermediate_key_id) = match &suffix {
            Some(s) => (
                format!("{base_system_key_id}{SEPARATOR}{s}"),
                format!("{base_intermediate_key_id}{SEPARATOR}{s}"),
            ),
            None => (base_system_key_id, base_intermediate_key_id.clone()),
        };

        Self {
            partition_id,
            service_id,
            product_id,
            suffix,
            system_key_id,
            intermediate_key_id,
            base_intermediate_key_id,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    pub fn system_key_id(&self) -> &str {
        &self.system_key_id
    }

    pub fn intermediate_key_id(&self) -> &str {
        &self.intermediate_key_id
    }

    /// Whether a data row record pointing at `key_id` may be decrypted in this partition.
    ///
    /// Suffixed partitions also accept the un-suffixed id and ids written under a
    /// different suffix, so records survive a move between regions.
    pub fn is_valid_intermediate_key_id(&self, key_id: &str) -> bool {
        if key_id == self.intermediate_key_id {
            return true;
        }
        if self.suffix.is_none() {
            return false;
        }
        key_id == self.base_intermediate_key_id
            || key_id
                .strip_prefix(self.base_intermediate_key_id.as_str())
                .is_some_and(|rest| rest.starts_with(SEPARATOR))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Partition[partitionId={}, serviceId={}, productId={}",
            self.partition_id, self.service_id, self.product_id
        )?;
        if let Some(suffix) = &self.suffix {
            write!(f, ", suffix={suffix}")?;
        }
        f.write_str("]")
    }
}
