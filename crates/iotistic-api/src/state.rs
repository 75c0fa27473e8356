use std::sync::Arc;

use iotistic_cloud::{CloudClient, IdentityManager, MetricsCollector};
use iotistic_logging::LocalBackend;
use iotistic_reconciler::ReconcileHandle;
use iotistic_runtime::ContainerRuntime;
use iotistic_store::DeviceStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DeviceStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub local_logs: Arc<LocalBackend>,
    pub reconcile: ReconcileHandle,
    pub identity: Arc<IdentityManager>,
    /// Absent when the device runs fully disconnected.
    pub cloud: Option<CloudClient>,
    pub metrics: Arc<MetricsCollector>,
    pub supervisor_version: Arc<String>,
}
