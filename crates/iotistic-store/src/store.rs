use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iotistic_domain::{CurrentState, DeviceIdentity, LogEntry, LogLevel, TargetState};

use crate::error::StoreError;

/// Well-known keys in the generic kv table.
pub mod kv_keys {
    /// Last ETag returned by the cloud for the target state. Opaque.
    pub const TARGET_ETAG: &str = "target_etag";
    /// Timestamp of the newest log entry shipped over HTTP.
    pub const LAST_LOG_UPLOAD: &str = "last_log_upload";
}

/// Filter for log queries from the admin API.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub service_name: Option<String>,
    pub min_level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(name) = &self.service_name {
            if entry.service_name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_level {
            if entry.level < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Durable device-local state. One writer per row; readers see a consistent
/// snapshot.
#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    async fn get_identity(&self) -> Result<Option<DeviceIdentity>, StoreError>;
    async fn put_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError>;

    /// Single row, replaced atomically.
    async fn get_target_state(&self) -> Result<Option<TargetState>, StoreError>;
    async fn put_target_state(&self, state: &TargetState) -> Result<(), StoreError>;

    async fn get_current_state(&self) -> Result<Option<CurrentState>, StoreError>;
    async fn put_current_state(&self, state: &CurrentState) -> Result<(), StoreError>;

    async fn get_kv(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put_kv(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete_kv(&self, key: &str) -> Result<(), StoreError>;

    async fn append_log_batch(&self, entries: &[LogEntry]) -> Result<(), StoreError>;

    /// Most recent matching entries, oldest first, capped by `filter.limit`.
    async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, StoreError>;

    /// Drop entries beyond `max_entries` or older than `max_age`, oldest
    /// first. Returns the number removed.
    async fn prune_logs(
        &self,
        max_entries: u64,
        max_age: chrono::Duration,
    ) -> Result<u64, StoreError>;
}
