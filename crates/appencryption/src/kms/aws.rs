//! [`AwsKeyManagementService`]: multi-region AWS KMS master keys.
//!
//! A system key is wrapped once under a KMS-generated data key, and that data
//! key is itself wrapped under the master key of every configured region:
//!
//! ```text
//! {"encryptedKey":"<b64>","kmsKeks":[{"region":"us-west-2","arn":"arn:...","encryptedKek":"<b64>"}]}
//! ```
//!
//! Any one region is enough to unwrap, so a regional KMS outage does not block
//! reads. The preferred region is always tried first.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use common::{AppEncryptionError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::KeyManagementService;
use crate::crypto::{AeadEnvelopeCrypto, CryptoKey};

/// A KMS master key and the region it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionKeyArn {
    pub region: String,
    pub arn: String,
}

impl RegionKeyArn {
    pub fn new(region: impl Into<String>, arn: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            arn: arn.into(),
        }
    }
}

/// Output of [`KmsRegionClient::generate_data_key`].
pub struct GeneratedDataKey {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub ciphertext: Vec<u8>,
}

/// The three KMS calls the service needs, against one region.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsRegionClient: Send + Sync {
    async fn generate_data_key(&self, key_arn: &str) -> Result<GeneratedDataKey>;

    async fn encrypt(&self, key_arn: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    async fn decrypt(&self, key_arn: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

#[async_trait]
impl KmsRegionClient for aws_sdk_kms::Client {
    async fn generate_data_key(&self, key_arn: &str) -> Result<GeneratedDataKey> {
        let resp = self
            .generate_data_key()
            .key_id(key_arn)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| AppEncryptionError::wrap("KMS GenerateDataKey failed", e))?;

        let plaintext = resp
            .plaintext()
            .ok_or_else(|| AppEncryptionError::app("KMS GenerateDataKey returned no plaintext"))?;
        let ciphertext = resp.ciphertext_blob().ok_or_else(|| {
            AppEncryptionError::app("KMS GenerateDataKey returned no ciphertext")
        })?;

        Ok(GeneratedDataKey {
            plaintext: Zeroizing::new(plaintext.as_ref().to_vec()),
            ciphertext: ciphertext.as_ref().to_vec(),
        })
    }

    async fn encrypt(&self, key_arn: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let resp = self
            .encrypt()
            .key_id(key_arn)
            .plaintext(Blob::new(plaintext.to_vec()))
            .send()
            .await
            .map_err(|e| AppEncryptionError::wrap("KMS Encrypt failed", e))?;

        resp.ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| AppEncryptionError::app("KMS Encrypt returned no ciphertext"))
    }

    async fn decrypt(&self, key_arn: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let resp = self
            .decrypt()
            .key_id(key_arn)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|e| AppEncryptionError::wrap("KMS Decrypt failed", e))?;

        resp.plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or_else(|| AppEncryptionError::app("KMS Decrypt returned no plaintext"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KmsKeyEnvelope {
    #[serde(rename = "encryptedKey")]
    encrypted_key: String,
    #[serde(rename = "kmsKeks", default)]
    kms_keks: Vec<KmsKek>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KmsKek {
    region: String,
    arn: String,
    #[serde(rename = "encryptedKek")]
    encrypted_kek: String,
}

struct RegionalClient {
    region: String,
    arn: String,
    client: Arc<dyn KmsRegionClient>,
}

/// [`KeyManagementService`] backed by AWS KMS in one or more regions.
pub struct AwsKeyManagementService {
    // Preferred region first.
    clients: Vec<RegionalClient>,
    crypto: AeadEnvelopeCrypto,
}

impl AwsKeyManagementService {
    /// Build one SDK client per region using the default credential chain.
    ///
    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] if `region_key_arns` is empty.
    pub async fn connect(
        region_key_arns: Vec<RegionKeyArn>,
        preferred_region: &str,
    ) -> Result<Self> {
        let mut clients: Vec<(RegionKeyArn, Arc<dyn KmsRegionClient>)> =
            Vec::with_capacity(region_key_arns.len());
        for entry in region_key_arns {
            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_sdk_kms::config::Region::new(entry.region.clone()))
                .load()
                .await;
            let client = aws_sdk_kms::Client::new(&sdk_config);
            clients.push((entry, Arc::new(client)));
        }
        Self::with_clients(clients, preferred_region)
    }

    /// Build the service from pre-constructed regional clients.
    ///
    /// # Errors
    ///
    /// Returns [`AppEncryptionError::InvalidArgument`] if `clients` is empty.
    pub fn with_clients(
        clients: Vec<(RegionKeyArn, Arc<dyn KmsRegionClient>)>,
        preferred_region: &str,
    ) -> Result<Self> {
        if clients.is_empty() {
            return Err(AppEncryptionError::InvalidArgument(
                "at least one region key ARN is required".into(),
            ));
        }

        let mut clients: Vec<RegionalClient> = clients
            .into_iter()
            .map(|(entry, client)| RegionalClient {
                region: entry.region,
                arn: entry.arn,
                client,
            })
            .collect();
        // Stable: configured order is kept among the non-preferred regions.
        clients.sort_by_key(|c| c.region != preferred_region);

        Ok(Self {
            clients,
            crypto: AeadEnvelopeCrypto::new(),
        })
    }

    /// Configured regions, preferred first.
    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.region.as_str())
    }

    async fn generate_data_key(&self) -> Result<(usize, GeneratedDataKey)> {
        for (idx, regional) in self.clients.iter().enumerate() {
            match regional.client.generate_data_key(&regional.arn).await {
                Ok(data_key) => return Ok((idx, data_key)),
                Err(e) => {
                    warn!(region = %regional.region, arn = %regional.arn, error = %e,
                        "failed to generate data key, trying next region");
                }
            }
        }
        Err(AppEncryptionError::Kms(
            "could not successfully generate data key using any regions".into(),
        ))
    }
}

#[async_trait]
impl KeyManagementService for AwsKeyManagementService {
    async fn encrypt_key(&self, key: &CryptoKey) -> Result<Vec<u8>> {
        let (origin, data_key) = self.generate_data_key().await?;

        let kek = CryptoKey::from_bytes(&data_key.plaintext, key.created(), false)
            .map_err(|e| AppEncryptionError::Kms(format!("unusable KMS data key: {e}")))?;
        let encrypted_key = self
            .crypto
            .encrypt_key(key, &kek)
            .map_err(|e| AppEncryptionError::Kms(format!("failed to wrap key: {e}")))?;

        let mut kms_keks = Vec::with_capacity(self.clients.len());
        for (idx, regional) in self.clients.iter().enumerate() {
            let encrypted_kek = if idx == origin {
                data_key.ciphertext.clone()
            } else {
                regional
                    .client
                    .encrypt(&regional.arn, &data_key.plaintext)
                    .await
                    .map_err(|e| {
                        warn!(
                            region = %regional.region,
                            arn = %regional.arn,
                            error = %e,
                            "failed to wrap data key for region"
                        );
                        AppEncryptionError::Kms(format!(
                            "could not wrap data key in region {}",
                            regional.region
                        ))
                    })?
            };
            kms_keks.push(KmsKek {
                region: regional.region.clone(),
                arn: regional.arn.clone(),
                encrypted_kek: STANDARD.encode(encrypted_kek),
            });
        }

        let envelope = KmsKeyEnvelope {
            encrypted_key: STANDARD.encode(encrypted_key),
            kms_keks,
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| AppEncryptionError::wrap("failed to serialise KMS key envelope", e))
    }

    async fn decrypt_key(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        revoked: bool,
    ) -> Result<CryptoKey> {
        let envelope: KmsKeyEnvelope = serde_json::from_slice(encrypted_key)
            .map_err(|e| AppEncryptionError::wrap("invalid KMS key envelope", e))?;
        let wrapped_key = STANDARD
            .decode(&envelope.encrypted_key)
            .map_err(|e| AppEncryptionError::wrap("KMS key envelope holds invalid base64", e))?;

        for regional in &self.clients {
            let Some(kek) = envelope.kms_keks.iter().find(|k| k.region == regional.region) else {
                continue;
            };
            let Ok(encrypted_kek) = STANDARD.decode(&kek.encrypted_kek) else {
                warn!(
                    region = %regional.region,
                    "KMS KEK holds invalid base64, trying next region"
                );
                continue;
            };

            let plaintext = match regional.client.decrypt(&kek.arn, &encrypted_kek).await {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(region = %regional.region, arn = %kek.arn, error = %e,
                        "failed to decrypt KEK, trying next region");
                    continue;
                }
            };

            let unwrapped = CryptoKey::from_bytes(&plaintext, created, false)
                .and_then(|kek| self.crypto.decrypt_key(&wrapped_key, created, &kek, revoked));
            match unwrapped {
                Ok(key) => {
                    debug!(region = %regional.region, "system key unwrapped");
                    return Ok(key);
                }
                Err(e) => {
                    warn!(region = %regional.region, error = %e,
                        "failed to unwrap key with regional KEK, trying next region");
                }
            }
        }

        Err(AppEncryptionError::Kms(
            "could not successfully decrypt key using any regions".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::protocol::truncate_to_seconds;

    const DATA_KEY: [u8; 32] = [7u8; 32];

    fn generated() -> GeneratedDataKey {
        GeneratedDataKey {
            plaintext: Zeroizing::new(DATA_KEY.to_vec()),
            ciphertext: b"kek-west".to_vec(),
        }
    }

    fn entry(region: &str) -> RegionKeyArn {
        RegionKeyArn::new(region, format!("arn:aws:kms:{region}:123:key/abc"))
    }

    fn failing_client() -> MockKmsRegionClient {
        let mut client = MockKmsRegionClient::new();
        client
            .expect_generate_data_key()
            .returning(|_| Err(AppEncryptionError::app("region down")));
        client
            .expect_encrypt()
            .returning(|_, _| Err(AppEncryptionError::app("region down")));
        client
            .expect_decrypt()
            .returning(|_, _| Err(AppEncryptionError::app("region down")));
        client
    }

    fn healthy_client(kek: &'static [u8]) -> MockKmsRegionClient {
        let mut client = MockKmsRegionClient::new();
        client.expect_generate_data_key().returning(move |_| {
            Ok(GeneratedDataKey {
                plaintext: Zeroizing::new(DATA_KEY.to_vec()),
                ciphertext: kek.to_vec(),
            })
        });
        client
            .expect_encrypt()
            .returning(move |_, _| Ok(kek.to_vec()));
        client
            .expect_decrypt()
            .withf(move |_, ciphertext| ciphertext == kek)
            .returning(|_, _| Ok(Zeroizing::new(DATA_KEY.to_vec())));
        client
    }

    fn service(
        clients: Vec<(&str, MockKmsRegionClient)>,
        preferred: &str,
    ) -> AwsKeyManagementService {
        let clients = clients
            .into_iter()
            .map(|(region, client)| (entry(region), Arc::new(client) as Arc<dyn KmsRegionClient>))
            .collect();
        AwsKeyManagementService::with_clients(clients, preferred).unwrap()
    }

    #[test]
    fn empty_region_list_rejected() {
        assert!(matches!(
            AwsKeyManagementService::with_clients(Vec::new(), "us-west-2"),
            Err(AppEncryptionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn preferred_region_sorted_first() {
        let kms = service(
            vec![
                ("us-east-1", MockKmsRegionClient::new()),
                ("eu-west-1", MockKmsRegionClient::new()),
                ("us-west-2", MockKmsRegionClient::new()),
            ],
            "us-west-2",
        );
        let regions: Vec<&str> = kms.regions().collect();
        assert_eq!(regions, ["us-west-2", "us-east-1", "eu-west-1"]);
    }

    #[tokio::test]
    async fn envelope_has_a_kek_per_region() {
        let mut west = MockKmsRegionClient::new();
        west.expect_generate_data_key()
            .times(1)
            .returning(|_| Ok(generated()));
        let mut east = MockKmsRegionClient::new();
        east.expect_encrypt()
            .withf(|_, plaintext| plaintext == &DATA_KEY[..])
            .times(1)
            .returning(|_, _| Ok(b"kek-east".to_vec()));

        let kms = service(vec![("us-east-1", east), ("us-west-2", west)], "us-west-2");
        let key = CryptoKey::generate(truncate_to_seconds(Utc::now()));
        let blob = kms.encrypt_key(&key).await.unwrap();

        let envelope: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        let keks = envelope["kmsKeks"].as_array().unwrap();
        assert_eq!(keks.len(), 2);
        assert_eq!(keks[0]["region"], "us-west-2");
        assert_eq!(keks[0]["encryptedKek"], STANDARD.encode(b"kek-west"));
        assert_eq!(keks[1]["region"], "us-east-1");
        assert_eq!(keks[1]["encryptedKek"], STANDARD.encode(b"kek-east"));
        assert!(envelope["encryptedKey"].is_string());
    }

    #[tokio::test]
    async fn generate_falls_back_to_next_region() {
        let mut west = MockKmsRegionClient::new();
        west.expect_generate_data_key()
            .times(1)
            .returning(|_| Err(AppEncryptionError::app("throttled")));
        west.expect_encrypt()
            .withf(|_, plaintext| plaintext == &DATA_KEY[..])
            .times(1)
            .returning(|_, _| Ok(b"kek-west".to_vec()));

        let kms = service(
            vec![("us-west-2", west), ("us-east-1", healthy_client(b"kek-east"))],
            "us-west-2",
        );
        let key = CryptoKey::generate(Utc::now());
        let blob = kms.encrypt_key(&key).await.unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        let keks = envelope["kmsKeks"].as_array().unwrap();
        assert_eq!(keks.len(), 2);
        assert_eq!(keks[0]["region"], "us-west-2");
        assert_eq!(keks[0]["encryptedKek"], STANDARD.encode(b"kek-west"));
        assert_eq!(keks[1]["region"], "us-east-1");
        assert_eq!(keks[1]["encryptedKek"], STANDARD.encode(b"kek-east"));
    }

    #[tokio::test]
    async fn wrap_failure_in_any_region_is_kms_error() {
        let mut west = MockKmsRegionClient::new();
        west.expect_generate_data_key()
            .times(1)
            .returning(|_| Ok(generated()));
        let mut east = MockKmsRegionClient::new();
        east.expect_encrypt()
            .times(1)
            .returning(|_, _| Err(AppEncryptionError::app("region down")));

        let kms = service(vec![("us-west-2", west), ("us-east-1", east)], "us-west-2");
        let key = CryptoKey::generate(Utc::now());
        assert!(matches!(
            kms.encrypt_key(&key).await,
            Err(AppEncryptionError::Kms(msg)) if msg.contains("us-east-1")
        ));
    }

    #[tokio::test]
    async fn all_regions_failing_is_kms_error() {
        let kms = service(
            vec![("us-west-2", failing_client()), ("us-east-1", failing_client())],
            "us-west-2",
        );
        let key = CryptoKey::generate(Utc::now());
        assert!(matches!(
            kms.encrypt_key(&key).await,
            Err(AppEncryptionError::Kms(_))
        ));
    }

    #[tokio::test]
    async fn round_trip_through_preferred_region() {
        let kms = service(vec![("us-west-2", healthy_client(b"kek-west"))], "us-west-2");
        let key = CryptoKey::generate(truncate_to_seconds(Utc::now()));
        let blob = kms.encrypt_key(&key).await.unwrap();
        let unwrapped = kms.decrypt_key(&blob, key.created(), false).await.unwrap();
        assert_eq!(unwrapped.secret(), key.secret());
        assert_eq!(unwrapped.created(), key.created());
    }

    #[tokio::test]
    async fn decrypt_falls_back_when_preferred_region_fails() {
        let writer = service(
            vec![
                ("us-west-2", healthy_client(b"kek-west")),
                ("us-east-1", healthy_client(b"kek-east")),
            ],
            "us-west-2",
        );
        let key = CryptoKey::generate(truncate_to_seconds(Utc::now()));
        let blob = writer.encrypt_key(&key).await.unwrap();

        let reader = service(
            vec![("us-west-2", failing_client()), ("us-east-1", healthy_client(b"kek-east"))],
            "us-west-2",
        );
        let unwrapped = reader.decrypt_key(&blob, key.created(), true).await.unwrap();
        assert_eq!(unwrapped.secret(), key.secret());
        assert!(unwrapped.is_revoked());
    }

    #[tokio::test]
    async fn decrypt_with_no_working_region_is_kms_error() {
        let writer = service(vec![("us-west-2", healthy_client(b"kek-west"))], "us-west-2");
        let key = CryptoKey::generate(Utc::now());
        let blob = writer.encrypt_key(&key).await.unwrap();

        let reader = service(vec![("us-west-2", failing_client())], "us-west-2");
        assert!(matches!(
            reader.decrypt_key(&blob, key.created(), false).await,
            Err(AppEncryptionError::Kms(_))
        ));
    }

    #[tokio::test]
    async fn malformed_envelope_is_app_error() {
        let kms = service(vec![("us-west-2", MockKmsRegionClient::new())], "us-west-2");
        assert!(matches!(
            kms.decrypt_key(b"not json", Utc::now(), false).await,
            Err(AppEncryptionError::AppEncryption { .. })
        ));
    }
}
