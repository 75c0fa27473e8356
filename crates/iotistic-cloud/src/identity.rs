//! Device identity lifecycle: first-boot uuid, one-shot provisioning,
//! key verification, reset.

use std::sync::Arc;

use chrono::Utc;
use iotistic_domain::{DeviceIdentity, ProvisioningState};
use iotistic_store::DeviceStore;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::api::{CloudClient, RegisterRequest};
use crate::error::CloudError;

pub struct IdentityManager {
    store: Arc<dyn DeviceStore>,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    /// Load the identity, generating and persisting one at first boot.
    /// The uuid is written exactly once and never rewritten after.
    pub async fn ensure_identity(
        &self,
        device_name: &str,
        device_type: &str,
    ) -> Result<DeviceIdentity, CloudError> {
        if let Some(identity) = self.store.get_identity().await? {
            return Ok(identity);
        }
        let identity = DeviceIdentity::new(
            Uuid::new_v4().to_string(),
            device_name.to_string(),
            device_type.to_string(),
        );
        self.store.put_identity(&identity).await?;
        info!(uuid = %identity.uuid, "generated device identity");
        Ok(identity)
    }

    /// Register with the cloud. One-shot: fails with `AlreadyRegistered` if
    /// the device is already provisioned.
    ///
    /// The device generates its own api-key, sends it with the request, and
    /// persists only the hash. The plaintext is returned exactly once for
    /// the caller to hand to the features that need it; nothing writes it
    /// to disk.
    pub async fn provision(
        &self,
        client: &CloudClient,
        provisioning_key: &str,
        supervisor_version: &str,
    ) -> Result<String, CloudError> {
        let mut identity = self
            .store
            .get_identity()
            .await?
            .ok_or_else(|| CloudError::Status {
                status: 0,
                message: "no identity; call ensure_identity first".into(),
            })?;

        if identity.is_registered() {
            return Err(CloudError::AlreadyRegistered);
        }

        let api_key = generate_api_key();
        let request = RegisterRequest {
            uuid: identity.uuid.clone(),
            device_name: identity.device_name.clone(),
            device_type: identity.device_type.clone(),
            device_api_key: api_key.clone(),
            mac_address: None,
            os_version: sysinfo::System::long_os_version(),
            supervisor_version: Some(supervisor_version.to_string()),
        };

        let response = client.register(&request, provisioning_key).await?;

        identity.provisioning_state = ProvisioningState::Registered;
        identity.api_key_hash = Some(hash_key(&api_key));
        identity.api_endpoint = Some(client.base_url().to_string());
        identity.device_id = Some(response.id);
        identity.fleet_id = Some(response.fleet_id);
        identity.provisioned_at = Some(Utc::now());
        self.store.put_identity(&identity).await?;

        info!(uuid = %identity.uuid, fleet_id = response.fleet_id, "device registered");
        Ok(api_key)
    }

    /// Key-exchange support: does `candidate` match the stored key hash?
    /// Comparison is constant-time over the digest bytes.
    pub async fn verify_key(&self, candidate: &str) -> Result<bool, CloudError> {
        let Some(identity) = self.store.get_identity().await? else {
            return Ok(false);
        };
        let Some(stored_hash) = identity.api_key_hash else {
            return Ok(false);
        };
        Ok(constant_time_eq(
            hash_key(candidate).as_bytes(),
            stored_hash.as_bytes(),
        ))
    }

    /// Clear registration state. The uuid survives.
    pub async fn reset(&self) -> Result<DeviceIdentity, CloudError> {
        let mut identity = self
            .store
            .get_identity()
            .await?
            .ok_or_else(|| CloudError::Status {
                status: 0,
                message: "no identity to reset".into(),
            })?;
        identity.reset();
        self.store.put_identity(&identity).await?;
        info!(uuid = %identity.uuid, "device identity reset");
        Ok(identity)
    }
}

fn generate_api_key() -> String {
    // Two v4 uuids' worth of entropy, hex-flattened
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

pub fn hash_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotistic_store::InMemoryStore;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn register_ok(uuid: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 1,
            "uuid": uuid,
            "deviceName": "dev",
            "deviceType": "generic",
            "fleetId": 2,
            "createdAt": "2025-01-01T00:00:00Z"
        }))
    }

    #[tokio::test]
    async fn first_boot_generates_stable_uuid() {
        let store = Arc::new(InMemoryStore::new());
        let manager = IdentityManager::new(store.clone());

        let first = manager.ensure_identity("dev", "generic").await.unwrap();
        assert_eq!(first.uuid.len(), 36);
        assert_eq!(first.provisioning_state, ProvisioningState::Unprovisioned);

        let second = manager.ensure_identity("dev", "generic").await.unwrap();
        assert_eq!(first.uuid, second.uuid);
    }

    #[tokio::test]
    async fn provision_persists_only_the_hash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/device/register"))
            .respond_with(register_ok("whatever"))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let manager = IdentityManager::new(store.clone());
        manager.ensure_identity("dev", "generic").await.unwrap();

        let client = CloudClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let plaintext = manager.provision(&client, "PK123", "0.1.0").await.unwrap();

        let identity = store.get_identity().await.unwrap().unwrap();
        assert!(identity.is_registered());
        let hash = identity.api_key_hash.unwrap();
        assert_ne!(hash, plaintext);
        assert_eq!(hash, hash_key(&plaintext));
    }

    #[tokio::test]
    async fn provisioning_is_one_shot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/device/register"))
            .respond_with(register_ok("u"))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let manager = IdentityManager::new(store);
        manager.ensure_identity("dev", "generic").await.unwrap();

        let client = CloudClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        manager.provision(&client, "PK123", "0.1.0").await.unwrap();
        let err = manager.provision(&client, "PK123", "0.1.0").await.unwrap_err();
        assert!(matches!(err, CloudError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn verify_key_accepts_only_the_real_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/device/register"))
            .respond_with(register_ok("u"))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let manager = IdentityManager::new(store);
        manager.ensure_identity("dev", "generic").await.unwrap();
        let client = CloudClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let key = manager.provision(&client, "PK123", "0.1.0").await.unwrap();

        assert!(manager.verify_key(&key).await.unwrap());
        assert!(!manager.verify_key("not-the-key").await.unwrap());
    }

    #[tokio::test]
    async fn reset_preserves_uuid_and_allows_reprovisioning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/device/register"))
            .respond_with(register_ok("u"))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let manager = IdentityManager::new(store);
        let before = manager.ensure_identity("dev", "generic").await.unwrap();
        let client = CloudClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        manager.provision(&client, "PK123", "0.1.0").await.unwrap();

        let after = manager.reset().await.unwrap();
        assert_eq!(before.uuid, after.uuid);
        assert_eq!(after.provisioning_state, ProvisioningState::Unprovisioned);
        assert!(after.api_key_hash.is_none());

        manager.provision(&client, "PK123", "0.1.0").await.unwrap();
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
