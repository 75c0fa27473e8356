use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use iotistic_domain::{CurrentState, DeviceIdentity, LogEntry, TargetState};
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::{DeviceStore, LogFilter};

const STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");
const KV: TableDefinition<&str, &str> = TableDefinition::new("kv");
const LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("logs");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const ROW_IDENTITY: &str = "identity";
const ROW_TARGET: &str = "target";
const ROW_CURRENT: &str = "current";

/// Persistent device store backed by a single redb database file.
///
/// All state survives process restarts; this is the production store.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`. Parent directories are
    /// created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        // Ensure tables exist
        {
            let wtxn = db
                .begin_write()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            wtxn.open_table(STATE)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            wtxn.open_table(KV)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            wtxn.open_table(LOGS)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            wtxn.open_table(META)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            wtxn.commit()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn get_row<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let rtxn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = rtxn
            .open_table(STATE)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        match table
            .get(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            Some(guard) => {
                let value: T = serde_json::from_slice(guard.value())?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_row<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(STATE)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for RedbStore {
    async fn get_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        self.get_row(ROW_IDENTITY)
    }

    async fn put_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        self.put_row(ROW_IDENTITY, identity)
    }

    async fn get_target_state(&self) -> Result<Option<TargetState>, StoreError> {
        self.get_row(ROW_TARGET)
    }

    async fn put_target_state(&self, state: &TargetState) -> Result<(), StoreError> {
        self.put_row(ROW_TARGET, state)
    }

    async fn get_current_state(&self) -> Result<Option<CurrentState>, StoreError> {
        self.get_row(ROW_CURRENT)
    }

    async fn put_current_state(&self, state: &CurrentState) -> Result<(), StoreError> {
        self.put_row(ROW_CURRENT, state)
    }

    async fn get_kv(&self, key: &str) -> Result<Option<String>, StoreError> {
        let rtxn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = rtxn
            .open_table(KV)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(table
            .get(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map(|g| g.value().to_string()))
    }

    async fn put_kv(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(KV)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete_kv(&self, key: &str) -> Result<(), StoreError> {
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(KV)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn append_log_batch(&self, entries: &[LogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        {
            let mut meta = wtxn
                .open_table(META)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let mut seq = meta
                .get("log_seq")
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
                .map(|g| g.value())
                .unwrap_or(0);

            let mut logs = wtxn
                .open_table(LOGS)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            for entry in entries {
                seq += 1;
                let bytes = serde_json::to_vec(entry)?;
                logs.insert(seq, bytes.as_slice())
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
            meta.insert("log_seq", seq)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, StoreError> {
        let rtxn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let table = rtxn
            .open_table(LOGS)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut matched: Vec<LogEntry> = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            let (_k, v) = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let log: LogEntry = serde_json::from_slice(v.value())?;
            if filter.matches(&log) {
                matched.push(log);
            }
        }
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
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let removed = {
            let mut logs = wtxn
                .open_table(LOGS)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            let mut keys: Vec<u64> = Vec::new();
            for entry in logs
                .iter()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
            {
                let (k, _v) = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
                keys.push(k.value());
            }

            let mut doomed: Vec<u64> = Vec::new();
            // Oldest first beyond the entry cap
            let excess = keys.len().saturating_sub(max_entries as usize);
            doomed.extend(keys.iter().take(excess).copied());
            // Then anything older than the age cutoff
            for k in keys.iter().skip(excess) {
                let Some(guard) = logs
                    .get(k)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?
                else {
                    continue;
                };
                let log: LogEntry = serde_json::from_slice(guard.value())?;
                if log.timestamp < cutoff {
                    doomed.push(*k);
                }
            }

            for k in &doomed {
                logs.remove(k)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
            doomed.len() as u64
        };
        wtxn.commit()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv_keys;
    use iotistic_domain::{LogLevel, LogSource};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> RedbStore {
        RedbStore::open(&dir.path().join("supervisor.redb")).unwrap()
    }

    fn entry(service: &str, level: LogLevel, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level,
            source: LogSource::Container,
            app_id: None,
            service_id: None,
            service_name: Some(service.to_string()),
            container_id: None,
            is_stderr: false,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.get_identity().await.unwrap().is_none());

        let id = DeviceIdentity::new("u-1".into(), "dev".into(), "generic".into());
        store.put_identity(&id).await.unwrap();
        assert_eq!(store.get_identity().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn identity_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supervisor.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            let id = DeviceIdentity::new("stable-uuid".into(), "dev".into(), "generic".into());
            store.put_identity(&id).await.unwrap();
        }

        {
            let store = RedbStore::open(&path).unwrap();
            let got = store.get_identity().await.unwrap();
            assert_eq!(got.map(|i| i.uuid), Some("stable-uuid".to_string()));
        }
    }

    #[tokio::test]
    async fn target_state_atomic_replace() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut t = TargetState::default();
        t.version = 1;
        store.put_target_state(&t).await.unwrap();

        t.version = 2;
        store.put_target_state(&t).await.unwrap();
        assert_eq!(store.get_target_state().await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn kv_round_trip_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.put_kv(kv_keys::TARGET_ETAG, "\"abc\"").await.unwrap();
        assert_eq!(
            store.get_kv(kv_keys::TARGET_ETAG).await.unwrap(),
            Some("\"abc\"".to_string())
        );
        store.delete_kv(kv_keys::TARGET_ETAG).await.unwrap();
        assert!(store.get_kv(kv_keys::TARGET_ETAG).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logs_append_and_filter() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .append_log_batch(&[
                entry("web", LogLevel::Info, "hello"),
                entry("web", LogLevel::Error, "boom"),
                entry("api", LogLevel::Info, "ping"),
            ])
            .await
            .unwrap();

        let all = store.query_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let web_errors = store
            .query_logs(&LogFilter {
                service_name: Some("web".into()),
                min_level: Some(LogLevel::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(web_errors.len(), 1);
        assert_eq!(web_errors[0].message, "boom");
    }

    #[tokio::test]
    async fn prune_drops_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let entries: Vec<LogEntry> = (0..10)
            .map(|i| entry("web", LogLevel::Info, &format!("line {}", i)))
            .collect();
        store.append_log_batch(&entries).await.unwrap();

        let removed = store.prune_logs(4, chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 6);

        let left = store.query_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(left.len(), 4);
        assert_eq!(left[0].message, "line 6");
    }
}
