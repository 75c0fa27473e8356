pub mod error;
pub mod hash;
pub mod types;
pub mod validate;

mod tests;

pub use error::DomainError;
pub use hash::{canonical_hash, spec_hash};
pub use types::{
    container_name, labels, managed_labels, scoped_network_name, AppId, AppSpec, CurrentApp,
    CurrentService, CurrentState, DeviceIdentity, LogEntry, LogLevel, LogSource,
    ProvisioningState, ReconciliationStatus, RestartPolicy, ServiceId, ServiceSpec,
    ServiceStatus, TargetState,
};
pub use validate::validate_target;
