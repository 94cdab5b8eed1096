//! Configuration loading and validation for the reference application.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is invalid.

use anyhow::{Context, Result};
use appencryption::{BasicExpiringCryptoPolicy, KeyRotationStrategy, RegionKeyArn};
use serde::Deserialize;

/// Where the master key lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsType {
    /// Fixed master key from `STATIC_MASTER_KEY`. Development only.
    Static,
    /// AWS KMS keys from `REGION_KEY_ARNS`.
    Aws,
}

/// Validated reference application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_service_id")]
    pub service_id: String,

    #[serde(default = "default_product_id")]
    pub product_id: String,

    #[serde(default = "default_partition_id")]
    pub partition_id: String,

    /// Plaintext to round-trip.
    #[serde(default = "default_payload")]
    pub payload: String,

    #[serde(default = "default_iterations")]
    pub iterations: u32,

    #[serde(default = "default_kms_type")]
    pub kms_type: KmsType,

    /// 32-character master key used when `KMS_TYPE=static`.
    #[serde(default = "default_static_master_key")]
    pub static_master_key: String,

    /// Comma-separated `region=arn` pairs. **Required** when `KMS_TYPE=aws`.
    #[serde(default)]
    pub region_key_arns: Option<String>,

    /// Region tried first for KMS calls. **Required** when `KMS_TYPE=aws`.
    #[serde(default)]
    pub preferred_region: Option<String>,

    #[serde(default = "default_key_expiration_days")]
    pub key_expiration_days: u32,

    #[serde(default = "default_revoke_check_minutes")]
    pub revoke_check_minutes: u32,

    #[serde(default = "default_true")]
    pub can_cache_system_keys: bool,

    #[serde(default = "default_true")]
    pub can_cache_intermediate_keys: bool,

    #[serde(default)]
    pub can_cache_sessions: bool,

    #[serde(default)]
    pub key_rotation_strategy: KeyRotationStrategy,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP/gRPC endpoint. Spans are only exported when this is set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
}

fn default_service_id() -> String {
    "reference_app".into()
}
fn default_product_id() -> String {
    "productId".into()
}
fn default_partition_id() -> String {
    "partitionId-1".into()
}
fn default_payload() -> String {
    "mysupersecretpayload".into()
}
fn default_iterations() -> u32 {
    1
}
fn default_kms_type() -> KmsType {
    KmsType::Static
}
fn default_static_master_key() -> String {
    "thisIsAStaticMasterKeyForTesting".into()
}
fn default_key_expiration_days() -> u32 {
    90
}
fn default_revoke_check_minutes() -> u32 {
    60
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.service_id, "SERVICE_ID")?;
        ensure_non_empty(&self.product_id, "PRODUCT_ID")?;
        ensure_non_empty(&self.partition_id, "PARTITION_ID")?;

        if self.iterations == 0 {
            anyhow::bail!("ITERATIONS must be > 0");
        }
        if self.key_expiration_days == 0 {
            anyhow::bail!("KEY_EXPIRATION_DAYS must be > 0");
        }
        if self.revoke_check_minutes == 0 {
            anyhow::bail!("REVOKE_CHECK_MINUTES must be > 0");
        }

        match self.kms_type {
            KmsType::Static => {
                if self.static_master_key.len() != 32 {
                    anyhow::bail!("STATIC_MASTER_KEY must be exactly 32 bytes");
                }
            }
            KmsType::Aws => {
                self.region_key_arns()?;
                ensure_non_empty(
                    self.preferred_region.as_deref().unwrap_or_default(),
                    "PREFERRED_REGION",
                )?;
            }
        }
        Ok(())
    }

    /// Parse `REGION_KEY_ARNS`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is absent, empty, or has a malformed pair.
    pub fn region_key_arns(&self) -> Result<Vec<RegionKeyArn>> {
        let raw = self
            .region_key_arns
            .as_deref()
            .context("REGION_KEY_ARNS is required when KMS_TYPE=aws")?;

        let arns = raw
            .split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (region, arn) = pair
                    .split_once('=')
                    .with_context(|| format!("REGION_KEY_ARNS entry {pair:?} is not region=arn"))?;
                let (region, arn) = (region.trim(), arn.trim());
                if region.is_empty() || arn.is_empty() {
                    anyhow::bail!("REGION_KEY_ARNS entry {pair:?} has an empty region or ARN");
                }
                Ok(RegionKeyArn::new(region, arn))
            })
            .collect::<Result<Vec<_>>>()?;

        if arns.is_empty() {
            anyhow::bail!("REGION_KEY_ARNS must name at least one region");
        }
        Ok(arns)
    }

    pub fn crypto_policy(&self) -> BasicExpiringCryptoPolicy {
        BasicExpiringCryptoPolicy::builder(self.key_expiration_days)
            .with_revoke_check_minutes(self.revoke_check_minutes)
            .with_can_cache_system_keys(self.can_cache_system_keys)
            .with_can_cache_intermediate_keys(self.can_cache_intermediate_keys)
            .with_can_cache_sessions(self.can_cache_sessions)
            .with_rotation_strategy(self.key_rotation_strategy)
            .build()
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
