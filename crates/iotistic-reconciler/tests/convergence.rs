//! Full-loop scenarios: observed state → plan → execute, repeated until the
//! device converges on the target.

use std::collections::BTreeMap;
use std::sync::Arc;

use iotistic_domain::{
    AppId, AppSpec, CurrentState, RestartPolicy, ServiceId, ServiceSpec, ServiceStatus,
    TargetState,
};
use iotistic_reconciler::{plan, Executor, ExecutorConfig, ReconcileWorker};
use iotistic_runtime::FakeRuntime;
use iotistic_store::{DeviceStore, InMemoryStore};
use tokio::sync::watch;

fn service(id: u32, name: &str, image: &str, networks: &[&str]) -> ServiceSpec {
    ServiceSpec {
        service_id: ServiceId::new(id),
        service_name: name.to_string(),
        image_ref: image.to_string(),
        ports: vec![],
        environment: BTreeMap::new(),
        volumes: vec![],
        networks: networks.iter().map(|n| n.to_string()).collect(),
        restart_policy: RestartPolicy::Always,
        labels: BTreeMap::new(),
        network_mode: None,
    }
}

fn target(version: u64, services: Vec<ServiceSpec>) -> TargetState {
    let app = AppSpec {
        app_id: AppId::new(1),
        app_name: "monitor".into(),
        app_uuid: "app-uuid-1".into(),
        services,
    };
    TargetState {
        apps: [(app.app_id, app)].into_iter().collect(),
        version,
    }
}

fn harness() -> (FakeRuntime, Arc<InMemoryStore>, ReconcileWorker) {
    let rt = FakeRuntime::new();
    let store = Arc::new(InMemoryStore::new());
    let executor = Executor::new(
        Arc::new(rt.clone()),
        store.clone(),
        None,
        ExecutorConfig::default(),
    );
    let (_handle, worker) = ReconcileWorker::new(
        store.clone(),
        Arc::new(rt.clone()),
        executor,
        watch::channel(false).1,
    );
    (rt, store, worker)
}

/// Repeatedly reconciling a stable target must reach a state where the
/// plan is a NoOp, and stay there.
#[tokio::test]
async fn reconcile_converges_and_stays_converged() {
    let (_rt, store, mut worker) = harness();
    let desired = target(
        1,
        vec![
            service(1, "api", "api:1", &["backend"]),
            service(2, "web", "nginx:alpine", &["backend", "frontend"]),
        ],
    );
    store.put_target_state(&desired).await.unwrap();

    for _ in 0..3 {
        worker.reconcile_once(false).await.unwrap();
    }

    let current = store.get_current_state().await.unwrap().unwrap();
    let replay = plan(&desired, &current).unwrap();
    assert!(replay.is_noop(), "converged state must replan to NoOp");

    let app = &current.apps[&AppId::new(1)];
    assert_eq!(app.services.len(), 2);
    assert!(app
        .services
        .iter()
        .all(|s| s.status == ServiceStatus::Running));
    assert_eq!(
        app.networks,
        vec!["1_backend".to_string(), "1_frontend".to_string()]
    );
}

/// Deploy, remove, redeploy the identical spec: the rebuilt containers
/// carry the same spec-hash as the originals.
#[tokio::test]
async fn redeploy_after_removal_restores_identical_spec_hash() {
    let (_rt, store, mut worker) = harness();
    let desired = target(1, vec![service(1, "web", "nginx:alpine", &[])]);

    store.put_target_state(&desired).await.unwrap();
    worker.reconcile_once(false).await.unwrap();
    let first_hash = store
        .get_current_state()
        .await
        .unwrap()
        .unwrap()
        .apps[&AppId::new(1)]
        .services[0]
        .spec_hash
        .clone();

    store
        .put_target_state(&TargetState {
            version: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    worker.reconcile_once(false).await.unwrap();
    assert!(store
        .get_current_state()
        .await
        .unwrap()
        .unwrap()
        .apps
        .is_empty());

    store
        .put_target_state(&target(3, vec![service(1, "web", "nginx:alpine", &[])]))
        .await
        .unwrap();
    worker.reconcile_once(false).await.unwrap();
    let second_hash = store
        .get_current_state()
        .await
        .unwrap()
        .unwrap()
        .apps[&AppId::new(1)]
        .services[0]
        .spec_hash
        .clone();

    assert_eq!(first_hash, second_hash);
}

/// A tag bump replaces exactly the changed service and leaves the
/// untouched one alone.
#[tokio::test]
async fn tag_update_replaces_only_the_changed_service() {
    let (rt, store, mut worker) = harness();
    store
        .put_target_state(&target(
            1,
            vec![
                service(1, "web", "nginx:1.25", &[]),
                service(2, "db", "postgres:16", &[]),
            ],
        ))
        .await
        .unwrap();
    worker.reconcile_once(false).await.unwrap();
    let ops_after_deploy = rt.ops().await.len();

    store
        .put_target_state(&target(
            2,
            vec![
                service(1, "web", "nginx:1.27", &[]),
                service(2, "db", "postgres:16", &[]),
            ],
        ))
        .await
        .unwrap();
    worker.reconcile_once(false).await.unwrap();

    let ops = rt.ops().await;
    let update_ops = &ops[ops_after_deploy..];
    assert_eq!(
        update_ops,
        [
            "pull nginx:1.27",
            "stop monitor_web_1",
            "remove monitor_web_1",
            "create monitor_web_1",
            "start monitor_web_1"
        ]
    );

    let current = store.get_current_state().await.unwrap().unwrap();
    let app = &current.apps[&AppId::new(1)];
    assert_eq!(
        app.service(ServiceId::new(1)).unwrap().image_ref,
        "nginx:1.27"
    );
    assert_eq!(
        app.service(ServiceId::new(2)).unwrap().image_ref,
        "postgres:16"
    );
}

/// The same inputs always produce the same plan bytes.
#[tokio::test]
async fn plans_are_reproducible_from_identical_inputs() {
    let desired = target(
        1,
        vec![
            service(3, "c", "c:1", &["net-a"]),
            service(1, "a", "a:1", &["net-a", "net-b"]),
            service(2, "b", "b:1", &[]),
        ],
    );
    let current = CurrentState::default();

    let first = serde_json::to_vec(&plan(&desired, &current).unwrap()).unwrap();
    for _ in 0..10 {
        let again = serde_json::to_vec(&plan(&desired, &current).unwrap()).unwrap();
        assert_eq!(first, again);
    }
}
