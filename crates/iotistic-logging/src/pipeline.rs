//! Fan-out pipeline and per-container attach workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use iotistic_domain::{AppId, LogEntry, LogLevel, LogSource, ServiceId};
use iotistic_runtime::{ContainerRuntime, LogsOpts};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::LogBackend;

/// Delivers every entry to every backend concurrently. A slow or failing
/// backend loses only its own copy; the others are unaffected.
pub struct LogPipeline {
    backends: Vec<Arc<dyn LogBackend>>,
}

impl LogPipeline {
    pub fn new(backends: Vec<Arc<dyn LogBackend>>) -> Arc<Self> {
        Arc::new(Self { backends })
    }

    pub async fn dispatch(&self, entry: LogEntry) {
        let deliveries = self.backends.iter().map(|backend| {
            let entry = &entry;
            async move {
                if let Err(e) = backend.deliver(entry).await {
                    warn!(backend = backend.name(), error = %e, "log delivery failed, entry dropped for this backend");
                }
            }
        });
        futures_util::future::join_all(deliveries).await;
    }

    /// Supervisor-internal entries flow through the same fan-out.
    pub async fn supervisor_log(&self, level: LogLevel, message: impl Into<String>) {
        self.dispatch(LogEntry::supervisor(level, message)).await;
    }

    pub async fn flush_all(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.flush().await {
                warn!(backend = backend.name(), error = %e, "log flush failed");
            }
        }
    }

    pub async fn shutdown_all(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.shutdown().await {
                warn!(backend = backend.name(), error = %e, "log backend shutdown failed");
            }
        }
    }

    /// Periodic flush driver for batching backends.
    pub fn spawn_flush_timer(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pipeline.flush_all().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            pipeline.flush_all().await;
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Identity of the container a log worker is attached to.
#[derive(Debug, Clone)]
pub struct ContainerLogContext {
    pub container_id: String,
    pub app_id: AppId,
    pub service_id: ServiceId,
    pub service_name: String,
}

/// One streaming worker per running container. Workers end when the stream
/// ends (container gone) or when the attacher shuts down.
pub struct LogAttacher {
    runtime: Arc<dyn ContainerRuntime>,
    pipeline: Arc<LogPipeline>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LogAttacher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, pipeline: Arc<LogPipeline>) -> Self {
        Self {
            runtime,
            pipeline,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn attach(&self, ctx: ContainerLogContext) {
        let mut workers = self.workers.lock().await;
        if let Some(old) = workers.remove(&ctx.container_id) {
            old.abort();
        }

        let runtime = self.runtime.clone();
        let pipeline = self.pipeline.clone();
        let container_id = ctx.container_id.clone();
        let handle = tokio::spawn(async move {
            let stream = match runtime
                .logs_attach(&ctx.container_id, &LogsOpts::default())
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(container_id = %ctx.container_id, error = %e, "log attach failed");
                    return;
                }
            };
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        let message =
                            String::from_utf8_lossy(&chunk.bytes).trim_end().to_string();
                        if message.is_empty() {
                            continue;
                        }
                        let entry = LogEntry {
                            timestamp: chunk.timestamp,
                            level: if chunk.is_stderr {
                                LogLevel::Error
                            } else {
                                LogLevel::Info
                            },
                            source: LogSource::Container,
                            app_id: Some(ctx.app_id),
                            service_id: Some(ctx.service_id),
                            service_name: Some(ctx.service_name.clone()),
                            container_id: Some(ctx.container_id.clone()),
                            is_stderr: chunk.is_stderr,
                            message,
                        };
                        pipeline.dispatch(entry).await;
                    }
                    Err(e) => {
                        debug!(container_id = %ctx.container_id, error = %e, "log stream ended");
                        break;
                    }
                }
            }
        });

        workers.insert(container_id, handle);
    }

    pub async fn detach(&self, container_id: &str) {
        if let Some(handle) = self.workers.lock().await.remove(container_id) {
            handle.abort();
        }
    }

    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for (_, handle) in workers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LogBackend for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }
        async fn deliver(&self, entry: &LogEntry) -> Result<(), PipelineError> {
            self.seen.lock().await.push(entry.message.clone());
            Ok(())
        }
        async fn flush(&self) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    struct AlwaysFails {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LogBackend for AlwaysFails {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn deliver(&self, _entry: &LogEntry) -> Result<(), PipelineError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::Io(std::io::Error::other("disk on fire")))
        }
        async fn flush(&self) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_backend_does_not_block_others() {
        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let broken = Arc::new(AlwaysFails {
            attempts: AtomicUsize::new(0),
        });
        let pipeline = LogPipeline::new(vec![broken.clone(), recording.clone()]);

        pipeline
            .dispatch(LogEntry::supervisor(LogLevel::Info, "still delivered"))
            .await;

        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
        let seen = recording.seen.lock().await;
        assert_eq!(seen.as_slice(), ["still delivered"]);
    }

    #[tokio::test]
    async fn attach_streams_container_logs_into_backends() {
        use iotistic_runtime::{ContainerSpec, FakeRuntime};

        let rt = FakeRuntime::new();
        rt.seed_image("nginx:alpine").await;
        let spec = ContainerSpec {
            image_ref: "nginx:alpine".into(),
            ports: vec![],
            environment: Default::default(),
            volumes: vec![],
            networks: vec![],
            restart_policy: Default::default(),
            labels: Default::default(),
            network_mode: None,
        };
        let id = rt.create_container(&spec, "app_web_1").await.unwrap();
        rt.seed_log_lines(
            &id,
            vec![(false, "ready".to_string()), (true, "oops".to_string())],
        )
        .await;

        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let pipeline = LogPipeline::new(vec![recording.clone() as Arc<dyn LogBackend>]);
        let attacher = LogAttacher::new(Arc::new(rt), pipeline);

        attacher
            .attach(ContainerLogContext {
                container_id: id.clone(),
                app_id: AppId::new(1),
                service_id: ServiceId::new(1),
                service_name: "web".into(),
            })
            .await;

        // The fake stream is finite; the worker drains it and exits
        let handle = attacher.workers.lock().await.remove(&id).unwrap();
        handle.await.unwrap();

        let seen = recording.seen.lock().await;
        assert_eq!(seen.as_slice(), ["ready", "oops"]);
    }
}
