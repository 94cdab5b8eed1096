//! `reference-app`: round-trips a payload through envelope encryption.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`](config::Config) from environment variables.
//! 2. Initialise structured JSON logging and optional OTLP export.
//! 3. Build the key management service and an in-memory metastore.
//! 4. Build the session factory.
//! 5. Encrypt, decrypt, and verify the payload `ITERATIONS` times.
//! 6. Dispose the factory and flush telemetry.

mod config;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use appencryption::{
    AppEncryptionError, AwsKeyManagementService, InMemoryMetastore, KeyManagementService,
    SessionFactory, StaticKeyManagementService,
};
use tracing::{info, warn};

use crate::config::{Config, KmsType};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        eprintln!("ERROR: reference-app configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;

    let result = run(&cfg).await;
    if let Err(e) = &result {
        tracing::error!(
            code = error_code(e),
            error = %format!("{e:#}"),
            "reference-app failed"
        );
    }

    telemetry::shutdown_telemetry();
    result
}

/// Code of the first [`AppEncryptionError`] in the chain, or `"other"`.
fn error_code(e: &anyhow::Error) -> &'static str {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<AppEncryptionError>())
        .map_or("other", AppEncryptionError::code)
}

async fn run(cfg: &Config) -> Result<()> {
    // -----------------------------------------------------------------------
    // 3. Key management service and metastore
    // -----------------------------------------------------------------------
    let kms = key_management_service(cfg).await?;

    // -----------------------------------------------------------------------
    // 4. Session factory
    // -----------------------------------------------------------------------
    let factory = SessionFactory::builder(&cfg.product_id, &cfg.service_id)
        .with_metastore(Arc::new(InMemoryMetastore::new()))
        .with_crypto_policy(Arc::new(cfg.crypto_policy()))
        .with_key_management_service(kms)
        .build()
        .context("failed to build session factory")?;

    info!(
        product_id = %cfg.product_id,
        service_id = %cfg.service_id,
        kms = ?cfg.kms_type,
        "session factory ready"
    );

    // -----------------------------------------------------------------------
    // 5. Round trips
    // -----------------------------------------------------------------------
    let outcome = round_trips(&factory, cfg).await;

    // -----------------------------------------------------------------------
    // 6. Shutdown
    // -----------------------------------------------------------------------
    factory.dispose();
    outcome
}

async fn key_management_service(cfg: &Config) -> Result<Arc<dyn KeyManagementService>> {
    match cfg.kms_type {
        KmsType::Static => {
            warn!("using a static master key; do not use in production");
            let kms = StaticKeyManagementService::new(cfg.static_master_key.as_bytes())
                .context("invalid static master key")?;
            Ok(Arc::new(kms))
        }
        KmsType::Aws => {
            let preferred = cfg.preferred_region.as_deref().unwrap_or_default();
            let kms = AwsKeyManagementService::connect(cfg.region_key_arns()?, preferred)
                .await
                .context("failed to set up AWS KMS clients")?;
            Ok(Arc::new(kms))
        }
    }
}

async fn round_trips(factory: &SessionFactory, cfg: &Config) -> Result<()> {
    let session = factory
        .session(&cfg.partition_id)
        .context("failed to open session")?;

    for iteration in 1..=cfg.iterations {
        let drr = session
            .encrypt(cfg.payload.as_bytes())
            .await
            .with_context(|| format!("encrypt failed on iteration {iteration}"))?;

        info!(
            iteration,
            data_row_record = %String::from_utf8_lossy(&drr),
            "payload encrypted"
        );

        let decrypted = session
            .decrypt(&drr)
            .await
            .with_context(|| format!("decrypt failed on iteration {iteration}"))?;

        if decrypted != cfg.payload.as_bytes() {
            anyhow::bail!("decrypted payload does not match on iteration {iteration}");
        }
        info!(iteration, "payload verified");
    }

    info!(
        iterations = cfg.iterations,
        partition = %session.partition(),
        "all round trips succeeded"
    );
    Ok(())
}
