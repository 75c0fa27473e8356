//! Typed client for the cloud device API.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use iotistic_domain::{AppId, AppSpec, CurrentApp, LogEntry, TargetState};
use serde::{Deserialize, Serialize};

use crate::error::CloudError;
use crate::metrics::HostMetrics;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub uuid: String,
    pub device_name: String,
    pub device_type: String,
    pub device_api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub id: u64,
    pub uuid: String,
    pub device_name: String,
    pub device_type: String,
    pub fleet_id: u64,
    pub created_at: DateTime<Utc>,
}

/// Result of a conditional target-state fetch.
#[derive(Debug, Clone)]
pub enum TargetFetch {
    NotModified,
    Modified {
        apps: BTreeMap<AppId, AppSpec>,
        etag: Option<String>,
    },
}

/// The apps section of the wire body, keyed by this device's uuid.
#[derive(Debug, Deserialize)]
struct WireTargetState {
    #[serde(default)]
    apps: BTreeMap<AppId, AppSpec>,
}

/// Body of the `PATCH /api/v1/device/state` report, nested under the uuid.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeviceStateReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps: Option<BTreeMap<AppId, CurrentApp>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temp: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl DeviceStateReport {
    pub fn with_metrics(mut self, metrics: &HostMetrics) -> Self {
        self.uptime = Some(metrics.uptime);
        self.cpu_usage = Some(metrics.cpu_usage);
        self.cpu_temp = metrics.cpu_temp;
        self.memory_usage = Some(metrics.memory_usage);
        self.memory_total = Some(metrics.memory_total);
        self.storage_usage = Some(metrics.storage_usage);
        self.storage_total = Some(metrics.storage_total);
        self.temperature = metrics.cpu_temp;
        self
    }
}

#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /api/v1/device/register`, authorized by the fleet-scoped
    /// provisioning key.
    pub async fn register(
        &self,
        request: &RegisterRequest,
        provisioning_key: &str,
    ) -> Result<RegisterResponse, CloudError> {
        let response = self
            .http
            .post(format!("{}/api/v1/device/register", self.base_url))
            .bearer_auth(provisioning_key)
            .json(request)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            401 => Err(CloudError::Unauthorized),
            409 => Err(CloudError::AlreadyRegistered),
            429 => Err(CloudError::RateLimited),
            status => Err(CloudError::Status {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// `POST /api/v1/device/{uuid}/key-exchange`: the cloud confirms the
    /// device still holds its key.
    pub async fn key_exchange(
        &self,
        uuid: &str,
        device_api_key: &str,
    ) -> Result<(), CloudError> {
        let response = self
            .http
            .post(format!("{}/api/v1/device/{}/key-exchange", self.base_url, uuid))
            .bearer_auth(device_api_key)
            .json(&serde_json::json!({ "deviceApiKey": device_api_key }))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(()),
            401 => Err(CloudError::Unauthorized),
            status => Err(CloudError::Status {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Conditional `GET /api/v1/device/{uuid}/state`. The ETag is opaque to
    /// the device; equal states produce equal tags server-side.
    pub async fn fetch_target_state(
        &self,
        uuid: &str,
        device_api_key: &str,
        last_etag: Option<&str>,
    ) -> Result<TargetFetch, CloudError> {
        let mut request = self
            .http
            .get(format!("{}/api/v1/device/{}/state", self.base_url, uuid))
            .bearer_auth(device_api_key);
        if let Some(etag) = last_etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let response = request.send().await?;

        match response.status().as_u16() {
            304 => Ok(TargetFetch::NotModified),
            200 => {
                let etag = response
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                let body: BTreeMap<String, WireTargetState> = response.json().await?;
                let apps = body.into_iter().next().map(|(_, w)| w.apps).unwrap_or_default();
                Ok(TargetFetch::Modified { apps, etag })
            }
            401 => Err(CloudError::Unauthorized),
            status => Err(CloudError::Status {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// `PATCH /api/v1/device/state`, the current-state report doubling as a
    /// heartbeat.
    pub async fn report_state(
        &self,
        uuid: &str,
        device_api_key: &str,
        report: &DeviceStateReport,
    ) -> Result<(), CloudError> {
        let body = serde_json::json!({ uuid: report });
        let response = self
            .http
            .patch(format!("{}/api/v1/device/state", self.base_url))
            .bearer_auth(device_api_key)
            .json(&body)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(()),
            401 => Err(CloudError::Unauthorized),
            status => Err(CloudError::Status {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// `POST /api/v1/device/{uuid}/logs` with a gzipped JSON array body.
    pub async fn upload_logs(
        &self,
        uuid: &str,
        device_api_key: &str,
        entries: &[LogEntry],
    ) -> Result<(), CloudError> {
        let json = serde_json::to_vec(entries)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;

        let response = self
            .http
            .post(format!("{}/api/v1/device/{}/logs", self.base_url, uuid))
            .bearer_auth(device_api_key)
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(compressed)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(()),
            401 => Err(CloudError::Unauthorized),
            status => Err(CloudError::Status {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Build the device's next [`TargetState`] from a fetched apps section,
/// bumping the stored version.
pub fn target_from_fetch(
    apps: BTreeMap<AppId, AppSpec>,
    previous: Option<&TargetState>,
) -> TargetState {
    TargetState {
        apps,
        version: previous.map(|t| t.version + 1).unwrap_or(1),
    }
}
