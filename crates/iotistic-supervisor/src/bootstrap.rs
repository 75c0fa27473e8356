//! Ordered component bring-up and teardown.
//!
//! Startup: store → identity → messaging → logging → runtime → reconciler →
//! sync loop → admin API. Shutdown reverses it: stop taking target updates,
//! let the in-flight step finish, flush logs, close the fabric, close the
//! store.

use std::sync::Arc;
use std::time::Duration;

use iotistic_api::{build_app, AppState};
use iotistic_cloud::{CloudClient, IdentityManager, MetricsCollector, SyncConfig, SyncLoop};
use iotistic_logging::{
    LocalBackend, LogAttacher, LogBackend, LogPipeline, MqttBackend, RemoteConfig,
    DEFAULT_RING_CAPACITY,
};
use iotistic_messaging::{Fabric, FabricConfig};
use iotistic_reconciler::{Executor, ExecutorConfig, ReconcileTrigger, ReconcileWorker};
use iotistic_runtime::{ContainerRuntime, DockerRuntime, FakeRuntime};
use iotistic_store::{DeviceStore, RedbStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;

const LOG_FILE_MAX_BYTES: u64 = 5 * 1024 * 1024;
const LOG_FILE_MAX_COUNT: usize = 5;
const LOG_RETENTION_ENTRIES: u64 = 100_000;
const LOG_RETENTION_DAYS: i64 = 7;
const PROVISION_ATTEMPTS: u32 = 5;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum FatalError {
    /// Exit code 1.
    Config(String),
    /// Exit code 2.
    Runtime(String),
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalError::Config(msg) => write!(f, "configuration error: {}", msg),
            FatalError::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

pub async fn run(config: Config) -> Result<(), FatalError> {
    // 1. Persistent store
    let store: Arc<dyn DeviceStore> = Arc::new(
        RedbStore::open(&config.store_path())
            .map_err(|e| FatalError::Runtime(format!("opening store: {}", e)))?,
    );
    info!(path = %config.store_path().display(), "store open");

    // 2. Identity
    let identity = Arc::new(IdentityManager::new(store.clone()));
    let device = identity
        .ensure_identity(&config.device_name, &config.device_type)
        .await
        .map_err(|e| FatalError::Runtime(format!("loading identity: {}", e)))?;
    let cloud = CloudClient::new(&config.cloud_api_url, Duration::from_secs(30))
        .map_err(|e| FatalError::Config(format!("cloud client: {}", e)))?;
    let api_key = resolve_api_key(&config, &identity, &cloud, &device.uuid).await?;

    // 3. Messaging fabric
    let fabric = config.broker_host_port().map(|(host, port)| {
        Fabric::init(FabricConfig {
            broker_host: host,
            broker_port: port,
            client_id: format!("iotistic-{}", device.uuid),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            debug_packets: config.mqtt_debug,
            ..Default::default()
        })
    });

    // 4. Log pipeline
    let local_logs = Arc::new(
        LocalBackend::new(store.clone(), DEFAULT_RING_CAPACITY)
            .with_files(config.logs_dir(), LOG_FILE_MAX_BYTES, LOG_FILE_MAX_COUNT)
            .await
            .map_err(|e| FatalError::Runtime(format!("opening log files: {}", e)))?,
    );
    let mut backends: Vec<Arc<dyn LogBackend>> = vec![local_logs.clone()];
    if let Some(fabric) = &fabric {
        backends.push(Arc::new(MqttBackend::new(
            fabric.clone(),
            RemoteConfig {
                qos: config.mqtt_qos(),
                max_batch: config.mqtt_batch,
                ..Default::default()
            },
        )));
    }
    let pipeline = LogPipeline::new(backends);
    pipeline
        .supervisor_log(
            iotistic_domain::LogLevel::Info,
            format!("supervisor {} starting", env!("CARGO_PKG_VERSION")),
        )
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_task = pipeline.spawn_flush_timer(Duration::from_secs(5), shutdown_rx.clone());

    // 5. Runtime adapter
    let runtime: Arc<dyn ContainerRuntime> = if config.use_real_docker {
        Arc::new(
            DockerRuntime::connect(&config.docker_socket)
                .map_err(|e| FatalError::Runtime(format!("docker: {}", e)))?,
        )
    } else {
        warn!("USE_REAL_DOCKER unset: driving the in-memory runtime");
        Arc::new(FakeRuntime::new())
    };
    let attacher = Arc::new(LogAttacher::new(runtime.clone(), pipeline.clone()));
    reattach_running_containers(runtime.as_ref(), &attacher).await;

    // 6. Reconciler
    let executor = Executor::new(
        runtime.clone(),
        store.clone(),
        Some(attacher.clone()),
        ExecutorConfig::default(),
    );
    let (reconcile, worker) = ReconcileWorker::new(
        store.clone(),
        runtime.clone(),
        executor,
        shutdown_rx.clone(),
    );
    let worker_task = tokio::spawn(worker.run());
    // Converge whatever survived the restart before the first poll lands
    reconcile.trigger(ReconcileTrigger::TargetChanged);

    // 7. Cloud sync loop
    let metrics = Arc::new(MetricsCollector::new());
    let sync = SyncLoop::new(
        cloud.clone(),
        store.clone(),
        reconcile.clone(),
        metrics.clone(),
        device.uuid.clone(),
        api_key,
        env!("CARGO_PKG_VERSION").to_string(),
        SyncConfig {
            poll_interval: config.poll_interval(),
            report_interval: config.report_interval(),
            metrics_interval: config.metrics_interval(),
            ..Default::default()
        },
    );
    let poll_task = tokio::spawn(sync.clone().run_target_poll(shutdown_rx.clone()));
    let report_task = tokio::spawn(sync.clone().run_state_report(shutdown_rx.clone()));
    // Logs ride the fabric when a broker is configured; otherwise ship
    // them over HTTP.
    let upload_task = if fabric.is_none() {
        Some(tokio::spawn(sync.clone().run_log_upload(shutdown_rx.clone())))
    } else {
        None
    };
    let retention_task = tokio::spawn(log_retention(store.clone(), shutdown_rx.clone()));

    // 8. Admin API
    let app = build_app(AppState {
        store: store.clone(),
        runtime,
        local_logs,
        reconcile,
        identity,
        cloud: Some(cloud),
        metrics,
        supervisor_version: Arc::new(env!("CARGO_PKG_VERSION").to_string()),
    });
    let addr = format!("{}:{}", config.admin_bind, config.admin_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FatalError::Config(format!("binding {}: {}", addr, e)))?;
    info!(addr = %addr, uuid = %device.uuid, "supervisor up");

    let mut serve_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let shutdown = async move {
            loop {
                if serve_shutdown.changed().await.is_err() || *serve_shutdown.borrow() {
                    return;
                }
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "admin API server error");
        }
    });

    // Run until SIGTERM/SIGINT
    wait_for_signal().await;
    info!("shutdown signal received");

    // Reverse order: stop intake, finish the in-flight step, flush, close
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = worker_task.await;
        let _ = poll_task.await;
        let _ = report_task.await;
        if let Some(task) = upload_task {
            let _ = task.await;
        }
        let _ = retention_task.await;
        let _ = server_task.await;
        let _ = flush_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("grace period elapsed, hard-stopping remaining tasks");
    }

    attacher.shutdown().await;
    pipeline.shutdown_all().await;
    if let Some(fabric) = &fabric {
        if let Err(e) = fabric.disconnect().await {
            warn!(error = %e, "fabric disconnect failed");
        }
    }
    info!("orderly shutdown complete");
    Ok(())
}

/// Provision if needed and produce the in-memory device api-key.
async fn resolve_api_key(
    config: &Config,
    identity: &IdentityManager,
    cloud: &CloudClient,
    uuid: &str,
) -> Result<String, FatalError> {
    use iotistic_cloud::CloudError;

    let device = match identity.ensure_identity(&config.device_name, &config.device_type).await {
        Ok(d) => d,
        Err(e) => return Err(FatalError::Runtime(format!("identity: {}", e))),
    };

    if device.is_registered() {
        let Some(key) = config.device_api_key.clone() else {
            return Err(FatalError::Config(
                "device is registered but DEVICE_API_KEY is not set".into(),
            ));
        };
        match identity.verify_key(&key).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(FatalError::Config(
                    "DEVICE_API_KEY does not match the stored key hash".into(),
                ))
            }
            Err(e) => return Err(FatalError::Runtime(format!("verifying key: {}", e))),
        }
        // Confirm with the cloud as well; an offline boot just proceeds
        match cloud.key_exchange(uuid, &key).await {
            Ok(()) => {}
            Err(CloudError::Unauthorized) => {
                return Err(FatalError::Config(
                    "cloud rejected the device api-key".into(),
                ))
            }
            Err(e) => warn!(error = %e, "key exchange unavailable, continuing"),
        }
        return Ok(key);
    }

    let Some(provisioning_key) = config.provisioning_key.clone() else {
        return Err(FatalError::Config(
            "PROVISIONING_KEY or a pre-provisioned identity is required".into(),
        ));
    };

    let mut backoff = Duration::from_secs(2);
    for attempt in 1..=PROVISION_ATTEMPTS {
        match identity
            .provision(cloud, &provisioning_key, env!("CARGO_PKG_VERSION"))
            .await
        {
            Ok(key) => return Ok(key),
            Err(CloudError::Unauthorized) => {
                return Err(FatalError::Config(
                    "provisioning key rejected by the cloud".into(),
                ))
            }
            Err(CloudError::AlreadyRegistered) => {
                return Err(FatalError::Config(format!(
                    "device {} already registered; provide DEVICE_API_KEY",
                    uuid
                )))
            }
            Err(e) if e.is_retriable() && attempt < PROVISION_ATTEMPTS => {
                warn!(attempt, error = %e, retry_in = ?backoff, "provisioning failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
            Err(e) => {
                return Err(FatalError::Runtime(format!(
                    "provisioning failed after {} attempts: {}",
                    attempt, e
                )))
            }
        }
    }
    Err(FatalError::Runtime("provisioning retries exhausted".into()))
}

/// Containers that survived a supervisor restart keep streaming: re-attach
/// log workers to every running managed container.
async fn reattach_running_containers(runtime: &dyn ContainerRuntime, attacher: &LogAttacher) {
    use iotistic_domain::{labels, AppId, ServiceId};
    use iotistic_logging::ContainerLogContext;
    use iotistic_runtime::ContainerRunState;

    let containers = match runtime
        .list_containers(labels::MANAGED, labels::MANAGED_VALUE)
        .await
    {
        Ok(containers) => containers,
        Err(e) => {
            warn!(error = %e, "could not list containers for log re-attach");
            return;
        }
    };

    for container in containers {
        if container.state != ContainerRunState::Running {
            continue;
        }
        let identity = container
            .labels
            .get(labels::APP_ID)
            .and_then(|v| v.parse::<u32>().ok())
            .zip(
                container
                    .labels
                    .get(labels::SERVICE_ID)
                    .and_then(|v| v.parse::<u32>().ok()),
            );
        let Some((app_id, service_id)) = identity else {
            continue;
        };
        let service_name = container
            .labels
            .get(labels::SERVICE_NAME)
            .cloned()
            .unwrap_or_else(|| container.name.clone());
        attacher
            .attach(ContainerLogContext {
                container_id: container.id,
                app_id: AppId::new(app_id),
                service_id: ServiceId::new(service_id),
                service_name,
            })
            .await;
    }
}

async fn log_retention(store: Arc<dyn DeviceStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store
                    .prune_logs(LOG_RETENTION_ENTRIES, chrono::Duration::days(LOG_RETENTION_DAYS))
                    .await
                {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned old log entries"),
                    Err(e) => warn!(error = %e, "log retention pass failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
