//! In-memory [`ContainerRuntime`] test double.
//!
//! Deterministic, no I/O. Supports failure injection for pull/start and
//! records every mutating call so tests can assert ordering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerRuntime, ContainerRunState, ContainerSnapshot, ContainerSpec, ContainerSummary,
    ExecResult, LogChunk, LogStream, LogsOpts, NetworkCfg, NetworkSummary,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    spec: ContainerSpec,
    state: ContainerRunState,
    networks: Vec<String>,
    log_lines: Vec<(bool, String)>,
}

#[derive(Default)]
struct Inner {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, NetworkCfg>,
    next_id: u64,
    /// Remaining injected pull failures per image ref.
    pull_failures: HashMap<String, Vec<RuntimeError>>,
    /// Container names whose start should fail once.
    start_failures: HashSet<String>,
    pull_counts: HashMap<String, u64>,
    /// Every mutating call, in order, e.g. "pull nginx:alpine".
    ops: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_image(&self, image_ref: &str) {
        self.inner.lock().await.images.insert(image_ref.to_string());
    }

    pub async fn seed_log_lines(&self, container_id: &str, lines: Vec<(bool, String)>) {
        if let Some(c) = self.inner.lock().await.containers.get_mut(container_id) {
            c.log_lines = lines;
        }
    }

    /// Queue failures for the next pulls of `image_ref`, consumed in order.
    pub async fn fail_next_pulls(&self, image_ref: &str, failures: Vec<RuntimeError>) {
        self.inner
            .lock()
            .await
            .pull_failures
            .insert(image_ref.to_string(), failures);
    }

    /// Make the next start of the container named `name` fail.
    pub async fn fail_next_start(&self, name: &str) {
        self.inner.lock().await.start_failures.insert(name.to_string());
    }

    pub async fn ops(&self) -> Vec<String> {
        self.inner.lock().await.ops.clone()
    }

    pub async fn pull_count(&self, image_ref: &str) -> u64 {
        self.inner
            .lock()
            .await
            .pull_counts
            .get(image_ref)
            .copied()
            .unwrap_or(0)
    }

    pub async fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .await
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().await.networks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Seed a container that the supervisor does not manage (no labels).
    pub async fn seed_unmanaged_container(&self, name: &str, image_ref: &str) -> String {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = format!("unmanaged-{}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                spec: ContainerSpec {
                    image_ref: image_ref.to_string(),
                    ports: vec![],
                    environment: BTreeMap::new(),
                    volumes: vec![],
                    networks: vec![],
                    restart_policy: Default::default(),
                    labels: BTreeMap::new(),
                    network_mode: None,
                },
                state: ContainerRunState::Running,
                networks: vec![],
                log_lines: vec![],
            },
        );
        id
    }
}

fn summary_of(c: &FakeContainer) -> ContainerSummary {
    ContainerSummary {
        id: c.id.clone(),
        name: c.name.clone(),
        image_ref: c.spec.image_ref.clone(),
        state: c.state,
        labels: c.spec.labels.clone(),
        ports: c.spec.ports.clone(),
        networks: c.networks.clone(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn image_present(&self, image_ref: &str) -> Result<bool, RuntimeError> {
        Ok(self.inner.lock().await.images.contains(image_ref))
    }

    async fn pull_image(&self, image_ref: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        inner.ops.push(format!("pull {}", image_ref));
        *inner.pull_counts.entry(image_ref.to_string()).or_insert(0) += 1;

        if let Some(failures) = inner.pull_failures.get_mut(image_ref) {
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        inner.images.insert(image_ref.to_string());
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        name: &str,
    ) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().await;
        if !inner.images.contains(&spec.image_ref) {
            return Err(RuntimeError::ImageNotFound(spec.image_ref.clone()));
        }
        if inner.containers.values().any(|c| c.name == name) {
            return Err(RuntimeError::Internal(format!(
                "container name '{}' already in use",
                name
            )));
        }
        inner.next_id += 1;
        let id = format!("ctr-{}", inner.next_id);
        inner.ops.push(format!("create {}", name));
        let networks = spec.networks.first().cloned().into_iter().collect();
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                spec: spec.clone(),
                state: ContainerRunState::Created,
                networks,
                log_lines: vec![],
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        let name = inner
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        inner.ops.push(format!("start {}", name));
        if inner.start_failures.remove(&name) {
            return Err(RuntimeError::Internal(format!(
                "container '{}' exited during startup",
                name
            )));
        }
        if let Some(c) = inner.containers.get_mut(id) {
            c.state = ContainerRunState::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        let name = inner
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        inner.ops.push(format!("stop {}", name));
        if let Some(c) = inner.containers.get_mut(id) {
            c.state = ContainerRunState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        let name = inner
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        inner.ops.push(format!("remove {}", name));
        inner.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let inner = self.inner.lock().await;
        let c = inner
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        Ok(ContainerSnapshot {
            id: c.id.clone(),
            name: c.name.clone(),
            image_ref: c.spec.image_ref.clone(),
            state: c.state,
            exit_code: None,
            labels: c.spec.labels.clone(),
            networks: c.networks.clone(),
        })
    }

    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<ContainerSummary> = inner
            .containers
            .values()
            .filter(|c| c.spec.labels.get(label).map(String::as_str) == Some(value))
            .map(summary_of)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create_network(&self, name: &str, cfg: &NetworkCfg) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.networks.get(name) {
            if existing == cfg {
                return Ok(());
            }
            return Err(RuntimeError::ResourceRecreationAttempt(name.to_string()));
        }
        inner.ops.push(format!("network_create {}", name));
        inner.networks.insert(name.to_string(), cfg.clone());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        if inner.networks.remove(name).is_none() {
            return Err(RuntimeError::NetworkNotFound(name.to_string()));
        }
        inner.ops.push(format!("network_remove {}", name));
        Ok(())
    }

    async fn connect_network(
        &self,
        container_id: &str,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        if !inner.networks.contains_key(name) {
            return Err(RuntimeError::NetworkNotFound(name.to_string()));
        }
        let c = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        if !c.networks.contains(&name.to_string()) {
            c.networks.push(name.to_string());
        }
        Ok(())
    }

    async fn list_networks(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<NetworkSummary>, RuntimeError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<NetworkSummary> = inner
            .networks
            .iter()
            .filter(|(_, cfg)| cfg.labels.get(label).map(String::as_str) == Some(value))
            .map(|(name, cfg)| NetworkSummary {
                name: name.clone(),
                driver: cfg.driver_or_default().to_string(),
                labels: cfg.labels.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn logs_attach(
        &self,
        container_id: &str,
        _opts: &LogsOpts,
    ) -> Result<LogStream, RuntimeError> {
        let inner = self.inner.lock().await;
        let c = inner
            .containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        let chunks: Vec<Result<LogChunk, RuntimeError>> = c
            .log_lines
            .iter()
            .map(|(is_stderr, line)| {
                Ok(LogChunk {
                    is_stderr: *is_stderr,
                    bytes: Bytes::from(line.clone()),
                    timestamp: Utc::now(),
                })
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecResult, RuntimeError> {
        let inner = self.inner.lock().await;
        if !inner.containers.contains_key(container_id) {
            return Err(RuntimeError::ContainerNotFound(container_id.to_string()));
        }
        Ok(ExecResult {
            stdout: format!("exec: {}\n", cmd.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}
