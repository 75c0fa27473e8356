pub mod api;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod sync;

pub use api::{
    target_from_fetch, CloudClient, DeviceStateReport, RegisterRequest, RegisterResponse,
    TargetFetch,
};
pub use error::CloudError;
pub use identity::{hash_key, IdentityManager};
pub use metrics::{HostMetrics, MetricsCollector};
pub use sync::{SyncConfig, SyncLoop};
