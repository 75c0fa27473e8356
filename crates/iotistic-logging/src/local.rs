//! Local log backend: bounded ring buffer, size-capped rotating files, and
//! write-through batches into the device store's log table.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use iotistic_domain::LogEntry;
use iotistic_store::{DeviceStore, LogFilter};
use tokio::sync::Mutex;
use tracing::warn;

use crate::backend::LogBackend;
use crate::error::PipelineError;

pub const DEFAULT_RING_CAPACITY: usize = 10_000;
const STORE_BATCH_SIZE: usize = 64;

struct RotatingWriter {
    dir: PathBuf,
    max_bytes: u64,
    max_files: usize,
    file: File,
    written: u64,
}

impl RotatingWriter {
    fn open(dir: PathBuf, max_bytes: u64, max_files: usize) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("supervisor.log");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir,
            max_bytes,
            max_files,
            file,
            written,
        })
    }

    fn write_line(&mut self, line: &str) -> Result<(), std::io::Error> {
        if self.written + line.len() as u64 + 1 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.written += line.len() as u64 + 1;
        Ok(())
    }

    /// supervisor.log → supervisor.log.1 → … up to max_files; oldest drops.
    fn rotate(&mut self) -> Result<(), std::io::Error> {
        let oldest = self.dir.join(format!("supervisor.log.{}", self.max_files));
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_files).rev() {
            let from = self.dir.join(format!("supervisor.log.{}", n));
            if from.exists() {
                std::fs::rename(&from, self.dir.join(format!("supervisor.log.{}", n + 1)))?;
            }
        }
        let active = self.dir.join("supervisor.log");
        if active.exists() {
            std::fs::rename(&active, self.dir.join("supervisor.log.1"))?;
        }
        self.file = OpenOptions::new().create(true).append(true).open(&active)?;
        self.written = 0;
        Ok(())
    }
}

struct Inner {
    ring: VecDeque<LogEntry>,
    pending: Vec<LogEntry>,
    writer: Option<RotatingWriter>,
}

pub struct LocalBackend {
    inner: Mutex<Inner>,
    ring_capacity: usize,
    store: Arc<dyn DeviceStore>,
}

impl LocalBackend {
    pub fn new(store: Arc<dyn DeviceStore>, ring_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(ring_capacity.min(1024)),
                pending: Vec::new(),
                writer: None,
            }),
            ring_capacity,
            store,
        }
    }

    /// Enable rotating files under `dir` (size-capped, `max_files` kept).
    pub async fn with_files(
        self,
        dir: PathBuf,
        max_bytes: u64,
        max_files: usize,
    ) -> Result<Self, PipelineError> {
        let writer = RotatingWriter::open(dir, max_bytes, max_files)?;
        self.inner.lock().await.writer = Some(writer);
        Ok(self)
    }

    /// Query for the admin API. The durable store is authoritative; the
    /// ring answers when the store is unavailable.
    pub async fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        match self.store.query_logs(filter).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "log store query failed, serving from ring buffer");
                let inner = self.inner.lock().await;
                let mut matched: Vec<LogEntry> = inner
                    .ring
                    .iter()
                    .filter(|entry| filter.matches(entry))
                    .cloned()
                    .collect();
                if let Some(limit) = filter.limit {
                    let start = matched.len().saturating_sub(limit);
                    matched.drain(..start);
                }
                matched
            }
        }
    }

    async fn flush_pending(&self) -> Result<(), PipelineError> {
        let pending: Vec<LogEntry> = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.pending)
        };
        if !pending.is_empty() {
            self.store.append_log_batch(&pending).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LogBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn deliver(&self, entry: &LogEntry) -> Result<(), PipelineError> {
        let flush_needed = {
            let mut inner = self.inner.lock().await;
            if inner.ring.len() >= self.ring_capacity {
                inner.ring.pop_front();
            }
            inner.ring.push_back(entry.clone());

            if let Some(writer) = inner.writer.as_mut() {
                let line = serde_json::to_string(entry)?;
                writer.write_line(&line)?;
            }

            inner.pending.push(entry.clone());
            inner.pending.len() >= STORE_BATCH_SIZE
        };

        if flush_needed {
            self.flush_pending().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), PipelineError> {
        self.flush_pending().await
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        self.flush_pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use iotistic_domain::{LogLevel, LogSource};
    use iotistic_store::InMemoryStore;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            source: LogSource::Container,
            app_id: None,
            service_id: None,
            service_name: Some("web".into()),
            container_id: None,
            is_stderr: false,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn ring_buffer_caps_entries() {
        let store = Arc::new(InMemoryStore::new());
        let backend = LocalBackend::new(store, 3);
        for i in 0..5 {
            backend.deliver(&entry(&format!("m{}", i))).await.unwrap();
        }
        let inner = backend.inner.lock().await;
        assert_eq!(inner.ring.len(), 3);
        assert_eq!(inner.ring.front().unwrap().message, "m2");
    }

    #[tokio::test]
    async fn flush_persists_pending_to_store() {
        let store = Arc::new(InMemoryStore::new());
        let backend = LocalBackend::new(store.clone(), 100);
        backend.deliver(&entry("a")).await.unwrap();
        backend.deliver(&entry("b")).await.unwrap();

        assert!(store
            .query_logs(&LogFilter::default())
            .await
            .unwrap()
            .is_empty());
        backend.flush().await.unwrap();
        assert_eq!(
            store.query_logs(&LogFilter::default()).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn query_uses_store_after_flush() {
        let store = Arc::new(InMemoryStore::new());
        let backend = LocalBackend::new(store, 100);
        backend.deliver(&entry("hello")).await.unwrap();
        backend.flush().await.unwrap();

        let got = backend
            .query(&LogFilter {
                service_name: Some("web".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message, "hello");
    }

    #[tokio::test]
    async fn rotating_files_rotate_at_cap() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let backend = LocalBackend::new(store, 100)
            .with_files(dir.path().to_path_buf(), 256, 2)
            .await
            .unwrap();

        for i in 0..32 {
            backend
                .deliver(&entry(&format!("a fairly long log line number {}", i)))
                .await
                .unwrap();
        }
        backend.flush().await.unwrap();

        assert!(dir.path().join("supervisor.log").exists());
        assert!(dir.path().join("supervisor.log.1").exists());
        assert!(!dir.path().join("supervisor.log.3").exists());
    }
}
