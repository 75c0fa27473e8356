//! Docker-backed [`ContainerRuntime`] over the daemon's Unix socket.
//!
//! Pulls for the same image ref coalesce behind a per-ref async lock, and
//! the framed log stream is demultiplexed into [`LogChunk`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{
    ContainerCreateBody, EndpointSettings, ExecConfig, HostConfig, Ipam, IpamConfig,
    NetworkConnectRequest, NetworkCreateRequest, PortBinding, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, ListContainersOptions, ListNetworksOptions,
    LogsOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerRuntime, ContainerRunState, ContainerSnapshot, ContainerSpec, ContainerSummary,
    ExecResult, LogChunk, LogStream, LogsOpts, NetworkCfg, NetworkSummary,
};

pub struct DockerRuntime {
    client: Docker,
    /// Per-image-ref locks; concurrent pulls for the same ref coalesce here.
    pull_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DockerRuntime {
    /// Connect to the daemon. Empty `socket_path` uses the environment
    /// defaults (`DOCKER_HOST` or the platform socket).
    pub fn connect(socket_path: &str) -> Result<Self, RuntimeError> {
        let client = if socket_path.is_empty() {
            Docker::connect_with_defaults()
                .map_err(|e| RuntimeError::Unavailable(e.to_string()))?
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, &bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::Unavailable(e.to_string()))?
        };
        Ok(Self {
            client,
            pull_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn pull_lock_for(&self, image_ref: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pull_locks.lock().await;
        locks
            .entry(image_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Split "repo:tag" into (repo, tag). Digest refs pass through whole.
fn split_image_ref(image_ref: &str) -> (String, Option<String>) {
    if image_ref.contains('@') {
        return (image_ref.to_string(), None);
    }
    // The tag separator is a ':' after the last '/'
    match image_ref.rfind(':') {
        Some(idx) if idx > image_ref.rfind('/').unwrap_or(0) => (
            image_ref[..idx].to_string(),
            Some(image_ref[idx + 1..].to_string()),
        ),
        _ => (image_ref.to_string(), Some("latest".to_string())),
    }
}

fn run_state_from_str(s: &str) -> ContainerRunState {
    match s {
        "created" => ContainerRunState::Created,
        "running" => ContainerRunState::Running,
        "paused" => ContainerRunState::Paused,
        "restarting" => ContainerRunState::Restarting,
        "exited" => ContainerRunState::Exited,
        "dead" => ContainerRunState::Dead,
        _ => ContainerRunState::Unknown,
    }
}

fn restart_policy_enum(policy: &iotistic_domain::RestartPolicy) -> RestartPolicyNameEnum {
    use iotistic_domain::RestartPolicy as P;
    match policy {
        P::No => RestartPolicyNameEnum::NO,
        P::Always => RestartPolicyNameEnum::ALWAYS,
        P::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        P::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    }
}

/// "host:container[/proto]" → (container key "80/tcp", binding).
fn parse_port_mapping(spec: &str) -> Result<(String, PortBinding), RuntimeError> {
    let (mapping, proto) = match spec.split_once('/') {
        Some((m, p)) => (m, p),
        None => (spec, "tcp"),
    };
    let (host, container) = mapping
        .split_once(':')
        .ok_or_else(|| RuntimeError::InvalidSpec(format!("port spec '{}'", spec)))?;
    Ok((
        format!("{}/{}", container, proto),
        PortBinding {
            host_ip: None,
            host_port: Some(host.to_string()),
        },
    ))
}

/// Converts a framed log chunk. The daemon with `timestamps: true` prepends
/// an RFC3339Nano timestamp, "2023-01-01T00:00:00.000000000Z message".
fn convert_log_output(output: LogOutput) -> LogChunk {
    let (is_stderr, raw_bytes) = match output {
        LogOutput::StdErr { message } => (true, message),
        LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => (false, message),
    };

    let split_idx = raw_bytes.iter().position(|&b| b == b' ');
    let (timestamp, bytes) = match split_idx {
        Some(idx) => match std::str::from_utf8(&raw_bytes[..idx])
            .ok()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        {
            Some(dt) => {
                let msg_start = idx + 1;
                let content = if msg_start < raw_bytes.len() {
                    raw_bytes.slice(msg_start..)
                } else {
                    Bytes::new()
                };
                (dt.with_timezone(&Utc), content)
            }
            None => (Utc::now(), raw_bytes),
        },
        None => (Utc::now(), raw_bytes),
    };

    LogChunk {
        is_stderr,
        bytes,
        timestamp,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn image_present(&self, image_ref: &str) -> Result<bool, RuntimeError> {
        match self.client.inspect_image(image_ref).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::from(e)),
        }
    }

    async fn pull_image(&self, image_ref: &str) -> Result<(), RuntimeError> {
        let lock = self.pull_lock_for(image_ref).await;
        let _guard = lock.lock().await;

        // A concurrent caller may have finished the pull while we waited.
        if self.image_present(image_ref).await? {
            return Ok(());
        }

        let (from_image, tag) = split_image_ref(image_ref);
        let options = Some(CreateImageOptions {
            from_image: Some(from_image),
            tag,
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    debug!(status = ?info.status, image = %image_ref, "image pull progress");
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                }) => return Err(RuntimeError::ImageNotFound(message)),
                Err(e) => return Err(RuntimeError::from(e)),
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        name: &str,
    ) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut exposed_ports: Vec<String> = Vec::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.ports {
            let (key, binding) = parse_port_mapping(port)?;
            exposed_ports.push(key.clone());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(binding);
        }

        let host_config = HostConfig {
            binds: if spec.volumes.is_empty() {
                None
            } else {
                Some(spec.volumes.clone())
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(restart_policy_enum(&spec.restart_policy)),
                maximum_retry_count: None,
            }),
            network_mode: spec.network_mode.clone(),
            ..Default::default()
        };

        // The first network is attached at create time; callers connect the
        // rest before start (one endpoint per create is a daemon limitation).
        let networking_config = if spec.network_mode.is_none() {
            spec.networks.first().map(|net| {
                let mut endpoints: HashMap<String, EndpointSettings> = HashMap::new();
                endpoints.insert(net.clone(), EndpointSettings::default());
                bollard::models::NetworkingConfig {
                    endpoints_config: Some(endpoints),
                }
            })
        } else {
            None
        };

        let body = ContainerCreateBody {
            image: Some(spec.image_ref.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        });

        let response = self
            .client
            .create_container(options, body)
            .await
            .map_err(RuntimeError::from)?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::ContainerNotFound(id.to_string()),
                other => RuntimeError::from(other),
            })
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = Some(StopContainerOptions {
            t: Some(grace.as_secs() as i32),
            ..Default::default()
        });
        match self.client.stop_container(id, options).await {
            Ok(()) => Ok(()),
            // Already stopped is success for our purposes
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::ContainerNotFound(id.to_string())),
            Err(e) => Err(RuntimeError::from(e)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = Some(RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        });
        match self.client.remove_container(id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::ContainerNotFound(id.to_string())),
            Err(e) => Err(RuntimeError::from(e)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let details = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::ContainerNotFound(id.to_string()),
                other => RuntimeError::from(other),
            })?;

        let state = details
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| run_state_from_str(&s.to_string().to_lowercase()))
            .unwrap_or(ContainerRunState::Unknown);
        let exit_code = details.state.as_ref().and_then(|s| s.exit_code);

        let networks: Vec<String> = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|nets| nets.keys().cloned().collect())
            .unwrap_or_default();

        Ok(ContainerSnapshot {
            id: details.id.unwrap_or_else(|| id.to_string()),
            name: details
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image_ref: details
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            state,
            exit_code,
            labels: details
                .config
                .and_then(|c| c.labels)
                .map(|l| l.into_iter().collect())
                .unwrap_or_default(),
            networks,
        })
    }

    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = Some(ListContainersOptions {
            all: true,
            ..Default::default()
        });
        let containers = self
            .client
            .list_containers(options)
            .await
            .map_err(RuntimeError::from)?;

        Ok(containers
            .into_iter()
            .filter(|c| {
                c.labels
                    .as_ref()
                    .and_then(|l| l.get(label))
                    .map(|v| v == value)
                    .unwrap_or(false)
            })
            .map(|c| {
                let ports: Vec<String> = c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| {
                        p.public_port
                            .map(|host| format!("{}:{}", host, p.private_port))
                    })
                    .collect();
                ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .as_deref()
                        .and_then(|n| n.first())
                        .map(|n| n.trim_start_matches('/'))
                        .unwrap_or("unknown")
                        .to_string(),
                    image_ref: c.image.unwrap_or_default(),
                    state: c
                        .state
                        .map(|s| run_state_from_str(&s.to_string().to_lowercase()))
                        .unwrap_or(ContainerRunState::Unknown),
                    labels: c
                        .labels
                        .map(|l| l.into_iter().collect())
                        .unwrap_or_default(),
                    ports,
                    networks: c
                        .network_settings
                        .and_then(|ns| ns.networks)
                        .map(|nets| nets.keys().cloned().collect())
                        .unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn create_network(&self, name: &str, cfg: &NetworkCfg) -> Result<(), RuntimeError> {
        // Idempotent iff an existing network's config equals the request
        let existing = self
            .client
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(RuntimeError::from)?
            .into_iter()
            .find(|n| n.name.as_deref() == Some(name));

        if let Some(net) = existing {
            let driver_matches = net.driver.as_deref() == Some(cfg.driver_or_default());
            let existing_labels: BTreeMap<String, String> = net
                .labels
                .unwrap_or_default()
                .into_iter()
                .collect();
            if driver_matches && existing_labels == cfg.labels {
                return Ok(());
            }
            return Err(RuntimeError::ResourceRecreationAttempt(name.to_string()));
        }

        let ipam = cfg.ipam_subnet.as_ref().map(|subnet| Ipam {
            config: Some(vec![IpamConfig {
                subnet: Some(subnet.clone()),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some(cfg.driver_or_default().to_string()),
            labels: Some(cfg.labels.clone().into_iter().collect()),
            ipam,
            ..Default::default()
        };

        self.client
            .create_network(request)
            .await
            .map_err(RuntimeError::from)?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        match self.client.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::NetworkNotFound(name.to_string())),
            Err(e) => Err(RuntimeError::from(e)),
        }
    }

    async fn connect_network(
        &self,
        container_id: &str,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let request = NetworkConnectRequest {
            container: container_id.to_string(),
            ..Default::default()
        };
        self.client
            .connect_network(name, request)
            .await
            .map_err(RuntimeError::from)
    }

    async fn list_networks(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<NetworkSummary>, RuntimeError> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(RuntimeError::from)?;

        Ok(networks
            .into_iter()
            .filter(|n| {
                n.labels
                    .as_ref()
                    .and_then(|l| l.get(label))
                    .map(|v| v == value)
                    .unwrap_or(false)
            })
            .map(|n| NetworkSummary {
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
                labels: n
                    .labels
                    .map(|l| l.into_iter().collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn logs_attach(
        &self,
        container_id: &str,
        opts: &LogsOpts,
    ) -> Result<LogStream, RuntimeError> {
        let options = LogsOptions {
            follow: opts.follow,
            stdout: opts.stdout,
            stderr: opts.stderr,
            since: 0,
            until: 0,
            timestamps: true,
            tail: "all".to_string(),
        };

        let stream = self
            .client
            .logs(container_id, Some(options))
            .map(|result| match result {
                Ok(output) => Ok(convert_log_output(output)),
                Err(e) => Err(RuntimeError::from(e)),
            });

        Ok(Box::pin(stream))
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecResult, RuntimeError> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd.to_vec()),
            ..Default::default()
        };

        let created = self
            .client
            .create_exec(container_id, config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::ContainerNotFound(container_id.to_string()),
                other => RuntimeError::from(other),
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .client
            .start_exec(&created.id, None::<bollard::exec::StartExecOptions>)
            .await
            .map_err(RuntimeError::from)?
        {
            bollard::exec::StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(RuntimeError::from)? {
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdOut { message }
                        | LogOutput::StdIn { message }
                        | LogOutput::Console { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                    }
                }
            }
            bollard::exec::StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&created.id)
            .await
            .map_err(RuntimeError::from)?;

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_ref_defaults_latest() {
        assert_eq!(
            split_image_ref("nginx"),
            ("nginx".to_string(), Some("latest".to_string()))
        );
    }

    #[test]
    fn split_tagged_ref() {
        assert_eq!(
            split_image_ref("nginx:alpine"),
            ("nginx".to_string(), Some("alpine".to_string()))
        );
    }

    #[test]
    fn split_registry_with_port() {
        // The ':' in the registry host must not be mistaken for a tag
        assert_eq!(
            split_image_ref("registry.example:5000/app"),
            (
                "registry.example:5000/app".to_string(),
                Some("latest".to_string())
            )
        );
        assert_eq!(
            split_image_ref("registry.example:5000/app:v2"),
            (
                "registry.example:5000/app".to_string(),
                Some("v2".to_string())
            )
        );
    }

    #[test]
    fn digest_refs_pass_through() {
        let r = "nginx@sha256:0000000000000000000000000000000000000000000000000000000000000000";
        assert_eq!(split_image_ref(r), (r.to_string(), None));
    }

    #[test]
    fn port_mapping_parses_proto() {
        let (key, binding) = parse_port_mapping("8080:80").unwrap();
        assert_eq!(key, "80/tcp");
        assert_eq!(binding.host_port.as_deref(), Some("8080"));

        let (key, _) = parse_port_mapping("53:53/udp").unwrap();
        assert_eq!(key, "53/udp");
    }

    #[test]
    fn log_output_timestamp_is_stripped() {
        let output = LogOutput::StdOut {
            message: Bytes::from("2024-01-15T10:30:45.123456789Z hello world"),
        };
        let chunk = convert_log_output(output);
        assert!(!chunk.is_stderr);
        assert_eq!(chunk.bytes, Bytes::from("hello world"));
        assert_eq!(chunk.timestamp.timestamp(), 1705314645);
    }

    #[test]
    fn log_output_without_timestamp_survives() {
        let output = LogOutput::StdErr {
            message: Bytes::from("plain line"),
        };
        let chunk = convert_log_output(output);
        assert!(chunk.is_stderr);
        assert_eq!(chunk.bytes, Bytes::from("plain line"));
    }
}
