use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use iotistic_domain::RestartPolicy;

use crate::error::RuntimeError;

/// Everything needed to create one container. Built by the reconciler from
/// an app/service spec pair; network names arrive fully scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image_ref: String,
    /// "host:container[/proto]" mappings.
    pub ports: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// "host-or-named:container[:flags]" binds.
    pub volumes: Vec<String>,
    /// Scoped network names (`{app_id}_{short}`). The first is attached at
    /// create time; the rest are connected before start.
    pub networks: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub labels: BTreeMap<String, String>,
    pub network_mode: Option<String>,
}

/// Requested network configuration. Creation is idempotent iff an existing
/// network's config equals this one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCfg {
    /// Defaults to "bridge" when empty.
    pub driver: String,
    pub labels: BTreeMap<String, String>,
    pub ipam_subnet: Option<String>,
}

impl NetworkCfg {
    pub fn driver_or_default(&self) -> &str {
        if self.driver.is_empty() {
            "bridge"
        } else {
            &self.driver
        }
    }
}

/// Coarse container run state from inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRunState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub state: ContainerRunState,
    pub exit_code: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub state: ContainerRunState,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<String>,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub name: String,
    pub driver: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct LogsOpts {
    pub stdout: bool,
    pub stderr: bool,
    pub follow: bool,
}

impl Default for LogsOpts {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            follow: true,
        }
    }
}

/// One demultiplexed chunk from a container's output streams.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub is_stderr: bool,
    pub bytes: Bytes,
    pub timestamp: DateTime<Utc>,
}

pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogChunk, RuntimeError>> + Send>>;

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Thin capability wrapper over a container runtime.
///
/// All operations fail with a typed [`RuntimeError`]; pulls for the same
/// image ref coalesce; `create_network` is idempotent iff the existing
/// configuration equals the requested one.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    // ── Images ────────────────────────────────────────────────────────────────

    async fn image_present(&self, image_ref: &str) -> Result<bool, RuntimeError>;
    async fn pull_image(&self, image_ref: &str) -> Result<(), RuntimeError>;

    // ── Containers ────────────────────────────────────────────────────────────

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        name: &str,
    ) -> Result<String, RuntimeError>;
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError>;
    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    // ── Networks ──────────────────────────────────────────────────────────────

    async fn create_network(&self, name: &str, cfg: &NetworkCfg) -> Result<(), RuntimeError>;
    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;
    async fn connect_network(&self, container_id: &str, name: &str)
        -> Result<(), RuntimeError>;
    async fn list_networks(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<NetworkSummary>, RuntimeError>;

    // ── Logs & exec ───────────────────────────────────────────────────────────

    async fn logs_attach(
        &self,
        container_id: &str,
        opts: &LogsOpts,
    ) -> Result<LogStream, RuntimeError>;

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecResult, RuntimeError>;
}
