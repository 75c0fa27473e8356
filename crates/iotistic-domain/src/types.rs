use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Fleet-unique application id. Stable across deploys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AppId(pub u32);

impl AppId {
    pub fn new(id: u32) -> Self {
        AppId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service id, unique within an app.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ServiceId(pub u32);

impl ServiceId {
    pub fn new(id: u32) -> Self {
        ServiceId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    Always,
    UnlessStopped,
    OnFailure,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Lifecycle state of a single service, as surfaced to the admin UI.
///
/// Transitions are driven by reconcile step outcomes:
///   Deploying → Running | Error
///   Running → Restarting → Running
///   Running → Stopped → Removed
/// `Error` is latched until the target changes or a manual restart is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Deploying,
    Running,
    Stopped,
    Restarting,
    Error,
    Removed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Deploying => "deploying",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Restarting => "restarting",
            ServiceStatus::Error => "error",
            ServiceStatus::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

/// Derived per-service comparison between target and current. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
pub enum ReconciliationStatus {
    InSync,
    NeedsUpdate(String),
    Missing(String),
    Extra(String),
}

impl ReconciliationStatus {
    /// Compare one service's desired spec against its observed entry.
    /// `None` when the service exists on neither side.
    pub fn derive(
        target: Option<&ServiceSpec>,
        current: Option<&CurrentService>,
    ) -> Option<ReconciliationStatus> {
        match (target, current) {
            (None, None) => None,
            (Some(_), None) => Some(ReconciliationStatus::Missing("no container".into())),
            (None, Some(_)) => Some(ReconciliationStatus::Extra("not in target".into())),
            (Some(spec), Some(observed)) => {
                if observed.spec_hash != crate::hash::spec_hash(spec) {
                    Some(ReconciliationStatus::NeedsUpdate("spec changed".into()))
                } else if observed.container_id.is_none() {
                    Some(ReconciliationStatus::Missing("no container".into()))
                } else {
                    Some(ReconciliationStatus::InSync)
                }
            }
        }
    }

    /// The admin-UI status chip.
    pub fn chip(&self) -> &'static str {
        match self {
            ReconciliationStatus::InSync => "in-sync",
            ReconciliationStatus::NeedsUpdate(_) => "needs-update",
            ReconciliationStatus::Missing(_) => "missing",
            ReconciliationStatus::Extra(_) => "extra",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ReconciliationStatus::InSync => None,
            ReconciliationStatus::NeedsUpdate(reason)
            | ReconciliationStatus::Missing(reason)
            | ReconciliationStatus::Extra(reason) => Some(reason),
        }
    }
}

// ── Service / app specs ───────────────────────────────────────────────────────

/// Desired configuration of one container.
///
/// BTreeMaps keep serialization key order deterministic, which the spec-hash
/// depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_id: ServiceId,
    pub service_name: String,
    /// registry/repo:tag or repo@digest.
    pub image_ref: String,
    /// "host:container" port mappings, optionally "host:container/proto".
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// "host-or-named:container[:flags]" bind specs.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Short network names, scoped to the app at runtime as `{app_id}_{name}`.
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub network_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub app_id: AppId,
    pub app_name: String,
    pub app_uuid: String,
    pub services: Vec<ServiceSpec>,
}

impl AppSpec {
    pub fn service(&self, id: ServiceId) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.service_id == id)
    }

    /// All app-scoped network names referenced by this app's services.
    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .flat_map(|s| s.networks.iter())
            .map(|n| scoped_network_name(self.app_id, n))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

// ── Target / current state ────────────────────────────────────────────────────

/// What the cloud wants running on this device. Single row, replaced atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    #[serde(default)]
    pub apps: BTreeMap<AppId, AppSpec>,
    /// Monotonically increasing; bumped on every accepted replacement.
    #[serde(default)]
    pub version: u64,
}

/// One observed container, as the reconciler last saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentService {
    pub service_id: ServiceId,
    pub service_name: String,
    pub image_ref: String,
    pub container_id: Option<String>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    /// Hash of the spec the container was created from; drives replacement.
    pub spec_hash: String,
    /// Populated while `status == Error`.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentApp {
    pub app_id: AppId,
    pub app_name: String,
    #[serde(default)]
    pub services: Vec<CurrentService>,
    /// Observed managed networks scoped to this app, including ones no
    /// container is attached to anymore.
    #[serde(default)]
    pub networks: Vec<String>,
}

impl CurrentApp {
    pub fn service(&self, id: ServiceId) -> Option<&CurrentService> {
        self.services.iter().find(|s| s.service_id == id)
    }

    pub fn service_mut(&mut self, id: ServiceId) -> Option<&mut CurrentService> {
        self.services.iter_mut().find(|s| s.service_id == id)
    }
}

/// What the device actually has running. Updated after every successful
/// reconcile step and by periodic runtime polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentState {
    #[serde(default)]
    pub apps: BTreeMap<AppId, CurrentApp>,
}

// ── Device identity ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningState {
    #[default]
    Unprovisioned,
    Registered,
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Unprovisioned => write!(f, "unprovisioned"),
            ProvisioningState::Registered => write!(f, "registered"),
        }
    }
}

/// One row per device. `uuid` is generated at first boot and never rewritten;
/// a reset clears the registration fields but keeps the uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub uuid: String,
    pub device_name: String,
    pub device_type: String,
    pub fleet_id: Option<u64>,
    pub provisioning_state: ProvisioningState,
    /// SHA-256 hex of the device api-key. The plaintext is never persisted.
    pub api_key_hash: Option<String>,
    pub api_endpoint: Option<String>,
    /// Cloud-side row id assigned at registration.
    pub device_id: Option<u64>,
    pub provisioned_at: Option<DateTime<Utc>>,
}

impl DeviceIdentity {
    pub fn new(uuid: String, device_name: String, device_type: String) -> Self {
        Self {
            uuid,
            device_name,
            device_type,
            fleet_id: None,
            provisioning_state: ProvisioningState::Unprovisioned,
            api_key_hash: None,
            api_endpoint: None,
            device_id: None,
            provisioned_at: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.provisioning_state == ProvisioningState::Registered
    }

    /// Clear registration state. The uuid survives, by contract.
    pub fn reset(&mut self) {
        self.provisioning_state = ProvisioningState::Unprovisioned;
        self.api_key_hash = None;
        self.device_id = None;
        self.fleet_id = None;
        self.provisioned_at = None;
    }
}

// ── Log entries ───────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Container,
    System,
    Supervisor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    #[serde(default)]
    pub app_id: Option<AppId>,
    #[serde(default)]
    pub service_id: Option<ServiceId>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub is_stderr: bool,
    pub message: String,
}

impl LogEntry {
    /// A supervisor-internal entry (startup, reconcile progress, errors).
    pub fn supervisor(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: LogSource::Supervisor,
            app_id: None,
            service_id: None,
            service_name: None,
            container_id: None,
            is_stderr: false,
            message: message.into(),
        }
    }
}

// ── Naming & labels ───────────────────────────────────────────────────────────

/// Label keys stamped onto every managed container and network. These are a
/// compatibility contract with operator tooling; do not rename.
pub mod labels {
    pub const APP_ID: &str = "iotistic.app-id";
    pub const APP_NAME: &str = "iotistic.app-name";
    pub const SERVICE_ID: &str = "iotistic.service-id";
    pub const SERVICE_NAME: &str = "iotistic.service-name";
    pub const MANAGED: &str = "iotistic.managed";
    pub const MANAGED_VALUE: &str = "true";
    /// Digest of the spec the container was created from; lets a restarted
    /// supervisor detect replacement needs without any local state.
    pub const SPEC_HASH: &str = "iotistic.spec-hash";
}

/// App-scoped runtime network name: `{app_id}_{short_name}`.
pub fn scoped_network_name(app_id: AppId, short_name: &str) -> String {
    format!("{}_{}", app_id, short_name)
}

/// Container naming convention: `{app_name}_{service_name}_{service_id}`.
pub fn container_name(app_name: &str, service_name: &str, service_id: ServiceId) -> String {
    format!("{}_{}_{}", app_name, service_name, service_id)
}

/// The full label set for a managed container of `service` in `app`.
pub fn managed_labels(app: &AppSpec, service: &ServiceSpec) -> BTreeMap<String, String> {
    let mut out = service.labels.clone();
    out.insert(labels::APP_ID.into(), app.app_id.to_string());
    out.insert(labels::APP_NAME.into(), app.app_name.clone());
    out.insert(labels::SERVICE_ID.into(), service.service_id.to_string());
    out.insert(labels::SERVICE_NAME.into(), service.service_name.clone());
    out.insert(labels::MANAGED.into(), labels::MANAGED_VALUE.into());
    out
}
