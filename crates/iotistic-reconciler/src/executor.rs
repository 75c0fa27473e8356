//! Step executor.
//!
//! Steps run serially in plan order. Every successful step writes the
//! resulting CurrentState to the store before the next step runs; a failed
//! step aborts the remainder of the plan, except start failures, which latch
//! the service into `error` and let the rest of the plan proceed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use iotistic_domain::{
    container_name, labels, managed_labels, scoped_network_name, spec_hash, AppId, CurrentApp,
    CurrentService, CurrentState, ServiceSpec, ServiceStatus, TargetState,
};
use iotistic_logging::{ContainerLogContext, LogAttacher};
use iotistic_runtime::{
    ContainerRunState, ContainerRuntime, ContainerSpec, NetworkCfg, RuntimeError,
};
use iotistic_store::DeviceStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::plan::{Plan, Step};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub pull_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub stop_grace: Duration,
    /// Consecutive pull failures for one image before the error is surfaced
    /// in CurrentState for operator attention.
    pub pull_failure_threshold: u32,
    pub pull_failure_window: chrono::Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pull_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            pull_failure_threshold: 3,
            pull_failure_window: chrono::Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PullFailures {
    count: u32,
    last: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub completed: usize,
    pub aborted: bool,
    /// An operator override interrupted the plan after the current step.
    pub preempted: bool,
    pub errors: Vec<String>,
}

pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn DeviceStore>,
    attacher: Option<Arc<LogAttacher>>,
    config: ExecutorConfig,
    pull_failures: Mutex<HashMap<String, PullFailures>>,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn DeviceStore>,
        attacher: Option<Arc<LogAttacher>>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            attacher,
            config,
            pull_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Execute `plan` in order. `target` supplies app names for error
    /// reporting on services that have no current entry yet. `preempt`,
    /// when set mid-run, stops the plan after the step in flight.
    pub async fn execute(
        &self,
        plan: &Plan,
        target: &TargetState,
        preempt: Option<&AtomicBool>,
    ) -> Result<ExecutionReport, ReconcileError> {
        let mut report = ExecutionReport::default();
        let mut current = self
            .store
            .get_current_state()
            .await?
            .unwrap_or_default();

        for step in &plan.steps {
            if let Some(flag) = preempt {
                if flag.load(Ordering::SeqCst) {
                    report.preempted = true;
                    break;
                }
            }
            match step {
                Step::NoOp => {
                    report.completed += 1;
                }

                Step::DownloadImage { app_id, image_ref } => {
                    match tokio::time::timeout(
                        self.config.pull_timeout,
                        self.runtime.pull_image(image_ref),
                    )
                    .await
                    .map_err(|_| RuntimeError::Timeout(format!("pull {}", image_ref)))
                    .and_then(|r| r)
                    {
                        Ok(()) => {
                            self.pull_failures.lock().await.remove(image_ref);
                            report.completed += 1;
                        }
                        Err(e) => {
                            let escalate = if e.is_retriable() {
                                self.note_pull_failure(image_ref).await
                                    >= self.config.pull_failure_threshold
                            } else {
                                true
                            };
                            warn!(image = %image_ref, error = %e, escalate, "image pull failed");
                            if escalate {
                                latch_image_error(&mut current, target, image_ref, &e.to_string());
                                self.store.put_current_state(&current).await?;
                            }
                            report
                                .errors
                                .push(format!("pull {} (app {}): {}", image_ref, app_id, e));
                            report.aborted = true;
                            break;
                        }
                    }
                }

                Step::CreateNetwork {
                    app_id,
                    network_name,
                } => {
                    let mut cfg = NetworkCfg::default();
                    cfg.labels
                        .insert(labels::APP_ID.into(), app_id.to_string());
                    cfg.labels
                        .insert(labels::MANAGED.into(), labels::MANAGED_VALUE.into());
                    match self.runtime.create_network(network_name, &cfg).await {
                        Ok(()) => {
                            let app = get_or_create_app(&mut current, target, *app_id);
                            if !app.networks.contains(network_name) {
                                app.networks.push(network_name.clone());
                                app.networks.sort();
                            }
                            self.store.put_current_state(&current).await?;
                            report.completed += 1;
                        }
                        Err(e) => {
                            report
                                .errors
                                .push(format!("create network {}: {}", network_name, e));
                            report.aborted = true;
                            break;
                        }
                    }
                }

                Step::StopContainer {
                    app_id,
                    service_id,
                    container_id,
                } => {
                    let deadline = self.config.stop_grace + self.config.stop_timeout;
                    let result = tokio::time::timeout(
                        deadline,
                        self.runtime
                            .stop_container(container_id, self.config.stop_grace),
                    )
                    .await
                    .map_err(|_| RuntimeError::Timeout(format!("stop {}", container_id)))
                    .and_then(|r| r);

                    match result {
                        Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => {
                            if let Some(app) = current.apps.get_mut(app_id) {
                                if let Some(svc) = app.service_mut(*service_id) {
                                    svc.status = ServiceStatus::Stopped;
                                }
                            }
                            self.store.put_current_state(&current).await?;
                            report.completed += 1;
                        }
                        Err(e) => {
                            report
                                .errors
                                .push(format!("stop {}/{}: {}", app_id, service_id, e));
                            report.aborted = true;
                            break;
                        }
                    }
                }

                Step::RemoveContainer {
                    app_id,
                    service_id,
                    container_id,
                } => {
                    if let Some(attacher) = &self.attacher {
                        attacher.detach(container_id).await;
                    }
                    match self.runtime.remove_container(container_id, true).await {
                        Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => {
                            if let Some(app) = current.apps.get_mut(app_id) {
                                app.services.retain(|s| s.service_id != *service_id);
                                if app.services.is_empty() && app.networks.is_empty() {
                                    current.apps.remove(app_id);
                                }
                            }
                            self.store.put_current_state(&current).await?;
                            report.completed += 1;
                        }
                        Err(e) => {
                            report
                                .errors
                                .push(format!("remove {}/{}: {}", app_id, service_id, e));
                            report.aborted = true;
                            break;
                        }
                    }
                }

                Step::StartContainer {
                    app_id,
                    app_name,
                    service,
                } => {
                    match tokio::time::timeout(
                        self.config.start_timeout,
                        self.start_service(*app_id, app_name, service),
                    )
                    .await
                    .map_err(|_| {
                        RuntimeError::Timeout(format!("start {}", service.service_name))
                    })
                    .and_then(|r| r)
                    {
                        Ok(container_id) => {
                            info!(
                                app_id = %app_id,
                                service = %service.service_name,
                                container_id = %container_id,
                                "service started"
                            );
                            upsert_service(
                                &mut current,
                                *app_id,
                                app_name,
                                service,
                                Some(container_id.clone()),
                                ServiceStatus::Running,
                                None,
                            );
                            self.store.put_current_state(&current).await?;
                            if let Some(attacher) = &self.attacher {
                                attacher
                                    .attach(ContainerLogContext {
                                        container_id,
                                        app_id: *app_id,
                                        service_id: service.service_id,
                                        service_name: service.service_name.clone(),
                                    })
                                    .await;
                            }
                            report.completed += 1;
                        }
                        // Start failures are reported against the service;
                        // the rest of the plan still runs.
                        Err(e) => {
                            warn!(
                                app_id = %app_id,
                                service = %service.service_name,
                                error = %e,
                                "service start failed"
                            );
                            upsert_service(
                                &mut current,
                                *app_id,
                                app_name,
                                service,
                                None,
                                ServiceStatus::Error,
                                Some(e.to_string()),
                            );
                            self.store.put_current_state(&current).await?;
                            report.errors.push(format!(
                                "start {}/{}: {}",
                                app_id, service.service_name, e
                            ));
                        }
                    }
                }

                Step::RemoveNetwork {
                    app_id,
                    network_name,
                } => {
                    match self.runtime.remove_network(network_name).await {
                        Ok(()) | Err(RuntimeError::NetworkNotFound(_)) => {
                            if let Some(app) = current.apps.get_mut(app_id) {
                                app.networks.retain(|n| n != network_name);
                                if app.services.is_empty() && app.networks.is_empty() {
                                    current.apps.remove(app_id);
                                }
                            }
                            self.store.put_current_state(&current).await?;
                            report.completed += 1;
                        }
                        Err(e) => {
                            report
                                .errors
                                .push(format!("remove network {}: {}", network_name, e));
                            report.aborted = true;
                            break;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Create → connect remaining networks → start → verify. Idempotent: a
    /// container with the target name and an equal spec-hash is adopted.
    async fn start_service(
        &self,
        app_id: AppId,
        app_name: &str,
        service: &ServiceSpec,
    ) -> Result<String, RuntimeError> {
        let name = container_name(app_name, &service.service_name, service.service_id);
        let desired_hash = spec_hash(service);

        let managed = self
            .runtime
            .list_containers(labels::MANAGED, labels::MANAGED_VALUE)
            .await?;
        if let Some(existing) = managed.iter().find(|c| c.name == name) {
            let same_spec =
                existing.labels.get(labels::SPEC_HASH).map(String::as_str)
                    == Some(desired_hash.as_str());
            if same_spec && existing.state == ContainerRunState::Running {
                debug!(container = %name, "already running with equal spec, adopting");
                return Ok(existing.id.clone());
            }
            // Stale leftover with our name (aborted plan, changed spec)
            self.runtime.remove_container(&existing.id, true).await?;
        }

        let mut container_labels = managed_labels(
            &iotistic_domain::AppSpec {
                app_id,
                app_name: app_name.to_string(),
                app_uuid: String::new(),
                services: vec![],
            },
            service,
        );
        container_labels.insert(labels::SPEC_HASH.into(), desired_hash);

        let networks: Vec<String> = service
            .networks
            .iter()
            .map(|n| scoped_network_name(app_id, n))
            .collect();

        let spec = ContainerSpec {
            image_ref: service.image_ref.clone(),
            ports: service.ports.clone(),
            environment: service.environment.clone(),
            volumes: service.volumes.clone(),
            networks: networks.clone(),
            restart_policy: service.restart_policy.clone(),
            labels: container_labels,
            network_mode: service.network_mode.clone(),
        };

        let container_id = self.runtime.create_container(&spec, &name).await?;
        for network in networks.iter().skip(1) {
            self.runtime.connect_network(&container_id, network).await?;
        }
        self.runtime.start_container(&container_id).await?;

        let snapshot = self.runtime.inspect_container(&container_id).await?;
        if snapshot.state != ContainerRunState::Running {
            return Err(RuntimeError::Internal(format!(
                "container '{}' exited during startup (code {:?})",
                name, snapshot.exit_code
            )));
        }

        Ok(container_id)
    }

    /// Returns the consecutive-failure count within the window.
    async fn note_pull_failure(&self, image_ref: &str) -> u32 {
        let now = Utc::now();
        let mut tracker = self.pull_failures.lock().await;
        let record = tracker
            .entry(image_ref.to_string())
            .or_insert(PullFailures { count: 0, last: now });
        if now - record.last > self.config.pull_failure_window {
            record.count = 0;
        }
        record.count += 1;
        record.last = now;
        record.count
    }
}

fn get_or_create_app<'a>(
    current: &'a mut CurrentState,
    target: &TargetState,
    app_id: AppId,
) -> &'a mut CurrentApp {
    current.apps.entry(app_id).or_insert_with(|| CurrentApp {
        app_id,
        app_name: target
            .apps
            .get(&app_id)
            .map(|a| a.app_name.clone())
            .unwrap_or_default(),
        services: Vec::new(),
        networks: Vec::new(),
    })
}

#[allow(clippy::too_many_arguments)]
fn upsert_service(
    current: &mut CurrentState,
    app_id: AppId,
    app_name: &str,
    service: &ServiceSpec,
    container_id: Option<String>,
    status: ServiceStatus,
    error: Option<String>,
) {
    let hash = spec_hash(service);
    let networks: Vec<String> = service
        .networks
        .iter()
        .map(|n| scoped_network_name(app_id, n))
        .collect();
    let entry = CurrentService {
        service_id: service.service_id,
        service_name: service.service_name.clone(),
        image_ref: service.image_ref.clone(),
        container_id,
        status,
        ports: service.ports.clone(),
        networks,
        spec_hash: hash,
        error,
    };

    let app = current.apps.entry(app_id).or_insert_with(|| CurrentApp {
        app_id,
        app_name: app_name.to_string(),
        services: Vec::new(),
        networks: Vec::new(),
    });
    match app.service_mut(service.service_id) {
        Some(existing) => *existing = entry,
        None => app.services.push(entry),
    }
    app.services.sort_by_key(|s| s.service_id);
}

/// Latch an error onto every target service that references `image_ref`.
fn latch_image_error(
    current: &mut CurrentState,
    target: &TargetState,
    image_ref: &str,
    reason: &str,
) {
    for app in target.apps.values() {
        for service in &app.services {
            if service.image_ref == image_ref {
                upsert_service(
                    current,
                    app.app_id,
                    &app.app_name,
                    service,
                    None,
                    ServiceStatus::Error,
                    Some(reason.to_string()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan;
    use iotistic_domain::{AppSpec, RestartPolicy, ServiceId};
    use iotistic_runtime::FakeRuntime;
    use iotistic_store::InMemoryStore;
    use std::collections::BTreeMap;

    fn service(id: u32, name: &str, image: &str) -> ServiceSpec {
        ServiceSpec {
            service_id: ServiceId::new(id),
            service_name: name.to_string(),
            image_ref: image.to_string(),
            ports: vec![],
            environment: BTreeMap::new(),
            volumes: vec![],
            networks: vec![],
            restart_policy: RestartPolicy::Always,
            labels: BTreeMap::new(),
            network_mode: None,
        }
    }

    fn target_one_app(services: Vec<ServiceSpec>) -> TargetState {
        let app = AppSpec {
            app_id: AppId::new(1),
            app_name: "app1".into(),
            app_uuid: "u1".into(),
            services,
        };
        TargetState {
            apps: [(app.app_id, app)].into_iter().collect(),
            version: 1,
        }
    }

    fn executor(rt: &FakeRuntime, store: &Arc<InMemoryStore>) -> Executor {
        Executor::new(
            Arc::new(rt.clone()),
            store.clone(),
            None,
            ExecutorConfig::default(),
        )
    }

    #[tokio::test]
    async fn deploy_executes_in_plan_order_and_converges() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        let target = target_one_app(vec![service(1, "web", "nginx:alpine")]);
        let p = plan(&target, &CurrentState::default()).unwrap();
        let report = exec.execute(&p, &target, None).await.unwrap();

        assert!(!report.aborted);
        assert!(report.errors.is_empty());
        assert_eq!(
            rt.ops().await,
            vec!["pull nginx:alpine", "create app1_web_1", "start app1_web_1"]
        );

        let current = store.get_current_state().await.unwrap().unwrap();
        let svc = current.apps[&AppId::new(1)].service(ServiceId::new(1)).unwrap();
        assert_eq!(svc.status, ServiceStatus::Running);
        assert!(svc.container_id.is_some());

        // Convergence: the next plan over the written state is a NoOp
        let p2 = plan(&target, &current).unwrap();
        assert!(p2.is_noop());
    }

    #[tokio::test]
    async fn networked_app_creates_networks_before_containers() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        let mut api = service(1, "api", "api:1");
        api.networks = vec!["backend".into()];
        let mut web = service(2, "web", "nginx:alpine");
        web.networks = vec!["backend".into(), "frontend".into()];
        let target = target_one_app(vec![api, web]);

        let p = plan(&target, &CurrentState::default()).unwrap();
        exec.execute(&p, &target, None).await.unwrap();

        let ops = rt.ops().await;
        let first_create = ops.iter().position(|o| o.starts_with("create")).unwrap();
        let net_creates: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|(_, o)| o.starts_with("network_create"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(net_creates.len(), 2);
        assert!(net_creates.iter().all(|&i| i < first_create));
        assert_eq!(
            rt.network_names().await,
            vec!["1_backend".to_string(), "1_frontend".to_string()]
        );
    }

    #[tokio::test]
    async fn image_update_replaces_the_container() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        let old_target = target_one_app(vec![service(1, "web", "nginx:1.25")]);
        let p = plan(&old_target, &CurrentState::default()).unwrap();
        exec.execute(&p, &old_target, None).await.unwrap();

        let new_target = target_one_app(vec![service(1, "web", "nginx:1.27")]);
        let current = store.get_current_state().await.unwrap().unwrap();
        let p2 = plan(&new_target, &current).unwrap();
        exec.execute(&p2, &new_target, None).await.unwrap();

        let ops = rt.ops().await;
        let tail = &ops[3..];
        assert_eq!(
            tail,
            [
                "pull nginx:1.27",
                "stop app1_web_1",
                "remove app1_web_1",
                "create app1_web_1",
                "start app1_web_1"
            ]
        );

        let current = store.get_current_state().await.unwrap().unwrap();
        let svc = current.apps[&AppId::new(1)].service(ServiceId::new(1)).unwrap();
        assert_eq!(svc.image_ref, "nginx:1.27");
        assert_eq!(svc.status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn retriable_pull_failure_aborts_without_latching() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        rt.fail_next_pulls(
            "nginx:alpine",
            vec![RuntimeError::Unavailable("connection reset".into())],
        )
        .await;

        let target = target_one_app(vec![service(1, "web", "nginx:alpine")]);
        let p = plan(&target, &CurrentState::default()).unwrap();
        let report = exec.execute(&p, &target, None).await.unwrap();

        assert!(report.aborted);
        // No CurrentState entry yet: the next reconcile retries the pull
        let current = store.get_current_state().await.unwrap().unwrap_or_default();
        assert!(current.apps.is_empty());
    }

    #[tokio::test]
    async fn third_consecutive_pull_failure_latches_error() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        rt.fail_next_pulls(
            "nginx:alpine",
            vec![
                RuntimeError::Unavailable("reset".into()),
                RuntimeError::Unavailable("reset".into()),
                RuntimeError::Unavailable("reset".into()),
            ],
        )
        .await;

        let target = target_one_app(vec![service(1, "web", "nginx:alpine")]);
        for _ in 0..3 {
            let current = store.get_current_state().await.unwrap().unwrap_or_default();
            let p = plan(&target, &current).unwrap();
            exec.execute(&p, &target, None).await.unwrap();
        }

        let current = store.get_current_state().await.unwrap().unwrap();
        let svc = current.apps[&AppId::new(1)].service(ServiceId::new(1)).unwrap();
        assert_eq!(svc.status, ServiceStatus::Error);
        assert!(svc.error.is_some());

        // Latched: replanning the unchanged target emits only NoOp
        let p = plan(&target, &current).unwrap();
        assert!(p.is_noop());
    }

    #[tokio::test]
    async fn image_not_found_latches_immediately() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        rt.fail_next_pulls(
            "ghost:latest",
            vec![RuntimeError::ImageNotFound("ghost:latest".into())],
        )
        .await;

        let target = target_one_app(vec![service(1, "web", "ghost:latest")]);
        let p = plan(&target, &CurrentState::default()).unwrap();
        let report = exec.execute(&p, &target, None).await.unwrap();

        assert!(report.aborted);
        let current = store.get_current_state().await.unwrap().unwrap();
        let svc = current.apps[&AppId::new(1)].service(ServiceId::new(1)).unwrap();
        assert_eq!(svc.status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn start_failure_latches_but_other_services_continue() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        rt.fail_next_start("app1_bad_1").await;

        let target = target_one_app(vec![
            service(1, "bad", "img-a:1"),
            service(2, "good", "img-b:1"),
        ]);
        let p = plan(&target, &CurrentState::default()).unwrap();
        let report = exec.execute(&p, &target, None).await.unwrap();

        assert!(!report.aborted);
        assert_eq!(report.errors.len(), 1);

        let current = store.get_current_state().await.unwrap().unwrap();
        let app = &current.apps[&AppId::new(1)];
        assert_eq!(
            app.service(ServiceId::new(1)).unwrap().status,
            ServiceStatus::Error
        );
        assert_eq!(
            app.service(ServiceId::new(2)).unwrap().status,
            ServiceStatus::Running
        );
    }

    #[tokio::test]
    async fn preempt_flag_stops_the_plan_between_steps() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        let target = target_one_app(vec![service(1, "web", "nginx:alpine")]);
        let p = plan(&target, &CurrentState::default()).unwrap();

        let flag = AtomicBool::new(true);
        let report = exec.execute(&p, &target, Some(&flag)).await.unwrap();

        assert!(report.preempted);
        assert_eq!(report.completed, 0);
        assert!(rt.ops().await.is_empty());
    }

    #[tokio::test]
    async fn applying_a_plan_twice_equals_applying_it_once() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let exec = executor(&rt, &store);

        let target = target_one_app(vec![service(1, "web", "nginx:alpine")]);
        let p = plan(&target, &CurrentState::default()).unwrap();
        exec.execute(&p, &target, None).await.unwrap();
        let report = exec.execute(&p, &target, None).await.unwrap();

        assert!(!report.aborted, "{:?}", report.errors);
        assert_eq!(rt.container_names().await, vec!["app1_web_1".to_string()]);
        let current = store.get_current_state().await.unwrap().unwrap();
        assert_eq!(
            current.apps[&AppId::new(1)]
                .service(ServiceId::new(1))
                .unwrap()
                .status,
            ServiceStatus::Running
        );
    }
}
