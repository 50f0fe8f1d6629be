//! Runtime configuration: the typed structs `initialize()` accepts and the
//! on-device identity record persisted across restarts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::consent::CloudConfig as ConsentCloudConfig;
use crate::error::HsiError;
use crate::storage::SecureStore;
use crate::upload::UploadConfig as UploadCloudConfig;

const DEVICE_ID_KEY: &str = "synheart_device_id";

/// Stable per-install identity, persisted once and reused across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub platform: String,
}

impl DeviceIdentity {
    /// Loads the persisted device id, or mints and persists a fresh UUID
    /// v4 on first run.
    pub async fn load_or_create(storage: &Arc<dyn SecureStore>, platform: impl Into<String>) -> Result<Self, HsiError> {
        if let Some(bytes) = storage.get(DEVICE_ID_KEY).await? {
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let identity = Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            platform: platform.into(),
        };
        storage.put(DEVICE_ID_KEY, &serde_json::to_vec(&identity)?).await?;
        Ok(identity)
    }
}

/// Cloud integration configuration: the consent service endpoint and the
/// upload endpoint, each with their own credentials. Both are optional
/// independently — a deployment may run fully on-device with neither.
#[derive(Clone)]
pub struct CloudUploadConfig {
    pub consent: ConsentCloudConfig,
    pub upload: UploadCloudConfig,
}

/// Top-level configuration accepted by `SynheartEngine::initialize`.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub user_id: Option<String>,
    pub device: DeviceIdentity,
    pub cloud: Option<CloudUploadConfig>,
    pub auto_start: bool,
    pub fusion_cadence_hz: f64,
}

impl RuntimeConfig {
    pub fn new(device: DeviceIdentity) -> Self {
        Self {
            user_id: None,
            device,
            cloud: None,
            auto_start: false,
            fusion_cadence_hz: 2.0,
        }
    }

    pub fn with_cloud(mut self, cloud: CloudUploadConfig) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// `InvalidConfig` if cloud upload is requested without complete
    /// credentials — mirrors the facade's `enableCloud` validation.
    pub fn validate(&self) -> Result<(), HsiError> {
        if let Some(cloud) = &self.cloud {
            if cloud.consent.app_id.is_empty() {
                return Err(HsiError::InvalidConfig("cloud consent app_id is empty".into()));
            }
            if cloud.consent.app_api_key.is_empty() {
                return Err(HsiError::InvalidConfig("cloud consent app_api_key is empty".into()));
            }
            if cloud.upload.tenant_secret.is_empty() {
                return Err(HsiError::InvalidConfig("cloud upload tenant_secret is empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    #[tokio::test]
    async fn device_identity_persists_across_loads() {
        let storage: Arc<dyn SecureStore> = Arc::new(InMemoryStore::new());
        let first = DeviceIdentity::load_or_create(&storage, "ios").await.unwrap();
        let second = DeviceIdentity::load_or_create(&storage, "ios").await.unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[test]
    fn validate_rejects_empty_cloud_secrets() {
        let config = RuntimeConfig::new(DeviceIdentity {
            device_id: "d1".into(),
            platform: "ios".into(),
        })
        .with_cloud(CloudUploadConfig {
            consent: ConsentCloudConfig {
                base_url: "https://example.invalid".into(),
                app_id: "app1".into(),
                app_api_key: String::new(),
                device_id: "d1".into(),
                platform: "ios".into(),
                consent_profile_id: "default".into(),
                user_id: None,
                region: None,
            },
            upload: UploadCloudConfig::new("https://example.invalid", "tenant", "secret"),
        });
        assert!(config.validate().is_err());
    }
}
