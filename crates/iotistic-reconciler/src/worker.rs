//! Reconcile worker: the single task that owns plan execution.
//!
//! Triggers (cloud poll, admin API, bootstrap) arrive over a bounded
//! channel; triggers arriving mid-run coalesce into one follow-up run. At
//! most one plan executes at any instant because this worker is the only
//! caller of the executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use iotistic_domain::{
    labels, AppId, CurrentApp, CurrentService, CurrentState, ServiceId, ServiceStatus,
};
use iotistic_runtime::{ContainerRunState, ContainerRuntime};
use iotistic_store::DeviceStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::executor::{ExecutionReport, Executor};
use crate::plan::plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTrigger {
    /// A new target state was persisted.
    TargetChanged,
    /// Operator-forced run; also clears latched service errors.
    Manual,
}

/// Cheap cloneable sender handed to the sync loop and the admin API.
#[derive(Clone)]
pub struct ReconcileHandle {
    tx: mpsc::Sender<ReconcileTrigger>,
    preempt: Arc<AtomicBool>,
}

impl ReconcileHandle {
    /// Queue a reconcile. A full channel means a run is already pending;
    /// the trigger coalesces into it. An operator override also preempts a
    /// plan in flight after its current step.
    pub fn trigger(&self, trigger: ReconcileTrigger) {
        if trigger == ReconcileTrigger::Manual {
            self.preempt.store(true, Ordering::SeqCst);
        }
        match self.tx.try_send(trigger) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("reconcile already pending, trigger coalesced");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("reconcile worker gone, trigger dropped");
            }
        }
    }
}

pub struct ReconcileWorker {
    store: Arc<dyn DeviceStore>,
    runtime: Arc<dyn ContainerRuntime>,
    executor: Executor,
    rx: mpsc::Receiver<ReconcileTrigger>,
    shutdown: watch::Receiver<bool>,
    preempt: Arc<AtomicBool>,
}

impl ReconcileWorker {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        executor: Executor,
        shutdown: watch::Receiver<bool>,
    ) -> (ReconcileHandle, ReconcileWorker) {
        let (tx, rx) = mpsc::channel(4);
        let preempt = Arc::new(AtomicBool::new(false));
        (
            ReconcileHandle {
                tx,
                preempt: preempt.clone(),
            },
            ReconcileWorker {
                store,
                runtime,
                executor,
                rx,
                shutdown,
                preempt,
            },
        )
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("reconcile worker shutting down");
                        return;
                    }
                }
                trigger = self.rx.recv() => {
                    let Some(mut trigger) = trigger else { return };
                    // Coalesce anything queued while we were idle
                    while let Ok(next) = self.rx.try_recv() {
                        if next == ReconcileTrigger::Manual {
                            trigger = next;
                        }
                    }
                    let manual = trigger == ReconcileTrigger::Manual;
                    match self.reconcile_once(manual).await {
                        Ok(report) => {
                            info!(
                                completed = report.completed,
                                errors = report.errors.len(),
                                aborted = report.aborted,
                                "reconcile finished"
                            );
                        }
                        Err(e) => warn!(error = %e, "reconcile failed"),
                    }
                }
            }
        }
    }

    /// One full cycle: observe, persist, plan, execute.
    pub async fn reconcile_once(
        &mut self,
        manual: bool,
    ) -> Result<ExecutionReport, ReconcileError> {
        self.preempt.store(false, Ordering::SeqCst);
        let target = self.store.get_target_state().await?.unwrap_or_default();
        let stored = self.store.get_current_state().await?.unwrap_or_default();

        let observed =
            refresh_current(self.runtime.as_ref(), &stored, !manual).await?;
        self.store.put_current_state(&observed).await?;

        let plan = plan(&target, &observed)?;
        if plan.is_noop() {
            debug!("already converged");
        }
        self.executor
            .execute(&plan, &target, Some(&self.preempt))
            .await
    }
}

/// Observe the runtime and rebuild CurrentState from managed containers and
/// networks. Containers without the managed label never enter the state, so
/// nothing downstream can ever touch them.
///
/// `keep_latched` carries stored `error` services forward so they are not
/// restarted until the target changes; a manual run drops them.
pub async fn refresh_current(
    runtime: &dyn ContainerRuntime,
    stored: &CurrentState,
    keep_latched: bool,
) -> Result<CurrentState, ReconcileError> {
    let mut state = CurrentState::default();

    let containers = runtime
        .list_containers(labels::MANAGED, labels::MANAGED_VALUE)
        .await?;
    for c in containers {
        let Some((app_id, service_id)) = parse_identity_labels(&c.labels) else {
            warn!(container = %c.name, "managed container with unparseable identity labels");
            continue;
        };
        let app_name = c
            .labels
            .get(labels::APP_NAME)
            .cloned()
            .unwrap_or_default();
        let service_name = c
            .labels
            .get(labels::SERVICE_NAME)
            .cloned()
            .unwrap_or_else(|| c.name.clone());

        let spec_hash = c
            .labels
            .get(labels::SPEC_HASH)
            .cloned()
            .or_else(|| {
                stored
                    .apps
                    .get(&app_id)
                    .and_then(|a| a.service(service_id))
                    .map(|s| s.spec_hash.clone())
            })
            .unwrap_or_default();

        let (status, error) = match c.state {
            ContainerRunState::Running => (ServiceStatus::Running, None),
            ContainerRunState::Restarting => (ServiceStatus::Restarting, None),
            ContainerRunState::Created => (ServiceStatus::Deploying, None),
            ContainerRunState::Dead => {
                (ServiceStatus::Error, Some("container is dead".to_string()))
            }
            ContainerRunState::Paused
            | ContainerRunState::Exited
            | ContainerRunState::Unknown => (ServiceStatus::Stopped, None),
        };

        let app = state.apps.entry(app_id).or_insert_with(|| CurrentApp {
            app_id,
            app_name: app_name.clone(),
            services: Vec::new(),
            networks: Vec::new(),
        });
        app.services.push(CurrentService {
            service_id,
            service_name,
            image_ref: c.image_ref,
            container_id: Some(c.id),
            status,
            ports: c.ports,
            networks: c.networks,
            spec_hash,
            error,
        });
    }

    let networks = runtime
        .list_networks(labels::MANAGED, labels::MANAGED_VALUE)
        .await?;
    for n in networks {
        let Some(app_id) = n
            .labels
            .get(labels::APP_ID)
            .and_then(|v| v.parse::<u32>().ok())
            .map(AppId::new)
        else {
            continue;
        };
        let app = state.apps.entry(app_id).or_insert_with(|| CurrentApp {
            app_id,
            app_name: String::new(),
            services: Vec::new(),
            networks: Vec::new(),
        });
        if !app.networks.contains(&n.name) {
            app.networks.push(n.name);
        }
    }

    // Carry latched errors forward for services with no live container
    if keep_latched {
        for (app_id, stored_app) in &stored.apps {
            for svc in &stored_app.services {
                if svc.status != ServiceStatus::Error {
                    continue;
                }
                let app = state.apps.entry(*app_id).or_insert_with(|| CurrentApp {
                    app_id: *app_id,
                    app_name: stored_app.app_name.clone(),
                    services: Vec::new(),
                    networks: Vec::new(),
                });
                match app.service_mut(svc.service_id) {
                    Some(observed) => {
                        observed.status = ServiceStatus::Error;
                        observed.error = svc.error.clone();
                    }
                    None => app.services.push(svc.clone()),
                }
            }
        }
    }

    for app in state.apps.values_mut() {
        app.services.sort_by_key(|s| s.service_id);
        app.networks.sort();
    }

    Ok(state)
}

fn parse_identity_labels(
    labels_map: &std::collections::BTreeMap<String, String>,
) -> Option<(AppId, ServiceId)> {
    let app_id = labels_map.get(labels::APP_ID)?.parse::<u32>().ok()?;
    let service_id = labels_map.get(labels::SERVICE_ID)?.parse::<u32>().ok()?;
    Some((AppId::new(app_id), ServiceId::new(service_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use iotistic_domain::{AppSpec, RestartPolicy, ServiceSpec, TargetState};
    use iotistic_runtime::{ContainerSpec, FakeRuntime};
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

    fn worker(
        rt: &FakeRuntime,
        store: &Arc<InMemoryStore>,
    ) -> (ReconcileHandle, ReconcileWorker) {
        let executor = Executor::new(
            Arc::new(rt.clone()),
            store.clone(),
            None,
            ExecutorConfig::default(),
        );
        let (_tx, shutdown_rx) = watch::channel(false);
        ReconcileWorker::new(store.clone(), Arc::new(rt.clone()), executor, shutdown_rx)
    }

    async fn seed_managed_container(rt: &FakeRuntime, app_id: u32, service_id: u32, name: &str) {
        rt.seed_image("stray:1").await;
        let mut labels_map = BTreeMap::new();
        labels_map.insert(labels::APP_ID.to_string(), app_id.to_string());
        labels_map.insert(labels::APP_NAME.to_string(), "app1".to_string());
        labels_map.insert(labels::SERVICE_ID.to_string(), service_id.to_string());
        labels_map.insert(labels::SERVICE_NAME.to_string(), "stray".to_string());
        labels_map.insert(labels::MANAGED.to_string(), labels::MANAGED_VALUE.to_string());
        let spec = ContainerSpec {
            image_ref: "stray:1".into(),
            ports: vec![],
            environment: BTreeMap::new(),
            volumes: vec![],
            networks: vec![],
            restart_policy: Default::default(),
            labels: labels_map,
            network_mode: None,
        };
        let id = rt.create_container(&spec, name).await.unwrap();
        rt.start_container(&id).await.unwrap();
    }

    #[tokio::test]
    async fn managed_extras_are_garbage_collected() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        seed_managed_container(&rt, 1, 9, "app1_stray_9").await;

        let (_handle, mut w) = worker(&rt, &store);
        store
            .put_target_state(&TargetState::default())
            .await
            .unwrap();
        w.reconcile_once(false).await.unwrap();

        assert!(rt.container_names().await.is_empty());
    }

    #[tokio::test]
    async fn unlabeled_containers_are_never_touched() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        rt.seed_unmanaged_container("operator-tooling", "busybox:1").await;

        let (_handle, mut w) = worker(&rt, &store);
        store
            .put_target_state(&TargetState::default())
            .await
            .unwrap();
        w.reconcile_once(false).await.unwrap();

        assert_eq!(
            rt.container_names().await,
            vec!["operator-tooling".to_string()]
        );
    }

    #[tokio::test]
    async fn restart_adopts_running_containers_via_labels() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let target = target_one_app(vec![service(1, "web", "nginx:alpine")]);
        store.put_target_state(&target).await.unwrap();

        let (_h, mut w) = worker(&rt, &store);
        w.reconcile_once(false).await.unwrap();
        let ops_before = rt.ops().await.len();

        // Simulate a restart: wipe the in-memory view of current state
        store.put_current_state(&CurrentState::default()).await.unwrap();
        let (_h2, mut w2) = worker(&rt, &store);
        w2.reconcile_once(false).await.unwrap();

        // Adoption: no new create/start ops were needed
        assert_eq!(rt.ops().await.len(), ops_before);
        assert_eq!(rt.container_names().await, vec!["app1_web_1".to_string()]);
    }

    #[tokio::test]
    async fn manual_run_clears_latched_errors_and_retries() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let target = target_one_app(vec![service(1, "web", "nginx:alpine")]);
        store.put_target_state(&target).await.unwrap();
        rt.fail_next_start("app1_web_1").await;

        let (_h, mut w) = worker(&rt, &store);
        let report = w.reconcile_once(false).await.unwrap();
        assert_eq!(report.errors.len(), 1);

        // Unchanged target, automatic run: the latch holds
        let report = w.reconcile_once(false).await.unwrap();
        assert!(report.errors.is_empty());
        let current = store.get_current_state().await.unwrap().unwrap();
        assert_eq!(
            current.apps[&AppId::new(1)]
                .service(ServiceId::new(1))
                .unwrap()
                .status,
            ServiceStatus::Error
        );

        // Manual run: latch cleared, service retried and now starts
        let report = w.reconcile_once(true).await.unwrap();
        assert!(report.errors.is_empty());
        let current = store.get_current_state().await.unwrap().unwrap();
        assert_eq!(
            current.apps[&AppId::new(1)]
                .service(ServiceId::new(1))
                .unwrap()
                .status,
            ServiceStatus::Running
        );
    }

    #[tokio::test]
    async fn trigger_on_full_channel_is_coalesced_not_lost() {
        let rt = FakeRuntime::new();
        let store = Arc::new(InMemoryStore::new());
        let (handle, _w) = worker(&rt, &store);
        for _ in 0..32 {
            handle.trigger(ReconcileTrigger::TargetChanged);
        }
        // No panic, no deadlock; excess triggers coalesce into the pending run.
    }
}
