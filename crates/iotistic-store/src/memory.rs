use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use iotistic_domain::{CurrentState, DeviceIdentity, LogEntry, TargetState};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{DeviceStore, LogFilter};

#[derive(Debug, Default)]
struct Inner {
    identity: Option<DeviceIdentity>,
    target: Option<TargetState>,
    current: Option<CurrentState>,
    kv: HashMap<String, String>,
    logs: Vec<LogEntry>,
}

/// In-memory implementation of [`DeviceStore`].
///
/// All data is lost on process exit. Suitable for tests and the fake runtime.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn get_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        Ok(self.inner.read().await.identity.clone())
    }

    async fn put_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        self.inner.write().await.identity = Some(identity.clone());
        Ok(())
    }

    async fn get_target_state(&self) -> Result<Option<TargetState>, StoreError> {
        Ok(self.inner.read().await.target.clone())
    }

    async fn put_target_state(&self, state: &TargetState) -> Result<(), StoreError> {
        self.inner.write().await.target = Some(state.clone());
        Ok(())
    }

    async fn get_current_state(&self) -> Result<Option<CurrentState>, StoreError> {
        Ok(self.inner.read().await.current.clone())
    }

    async fn put_current_state(&self, state: &CurrentState) -> Result<(), StoreError> {
        self.inner.write().await.current = Some(state.clone());
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.kv.get(key).cloned())
    }

    async fn put_kv(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_kv(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().await.kv.remove(key);
        Ok(())
    }

    async fn append_log_batch(&self, entries: &[LogEntry]) -> Result<(), StoreError> {
        self.inner.write().await.logs.extend_from_slice(entries);
        Ok(())
    }

    async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, StoreError> {
        let guard = self.inner.read().await;
        let mut matched: Vec<LogEntry> = guard
            .logs
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let start = matched.len().saturating_sub(limit);
            matched.drain(..start);
        }
        Ok(matched)
    }

    async fn prune_logs(
        &self,
        max_entries: u64,
        max_age: chrono::Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - max_age;
        let mut guard = self.inner.write().await;
        let before = guard.logs.len();
        let excess = before.saturating_sub(max_entries as usize);
        guard.logs.drain(..excess);
        guard.logs.retain(|e| e.timestamp >= cutoff);
        Ok((before - guard.logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotistic_domain::{LogLevel, LogSource};

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            source: LogSource::Supervisor,
            app_id: None,
            service_id: None,
            service_name: None,
            container_id: None,
            is_stderr: false,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let store = InMemoryStore::new();
        let id = DeviceIdentity::new("u".into(), "dev".into(), "generic".into());
        store.put_identity(&id).await.unwrap();
        assert_eq!(store.get_identity().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn query_limit_keeps_newest() {
        let store = InMemoryStore::new();
        store
            .append_log_batch(&[entry("a"), entry("b"), entry("c")])
            .await
            .unwrap();
        let got = store
            .query_logs(&LogFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message, "b");
        assert_eq!(got[1].message, "c");
    }

    #[tokio::test]
    async fn prune_by_count() {
        let store = InMemoryStore::new();
        store
            .append_log_batch(&[entry("a"), entry("b"), entry("c")])
            .await
            .unwrap();
        let removed = store.prune_logs(1, chrono::Duration::days(1)).await.unwrap();
        assert_eq!(removed, 2);
        let left = store.query_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].message, "c");
    }
}
