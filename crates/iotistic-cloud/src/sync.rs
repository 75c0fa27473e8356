//! Cloud sync loop: two independent timers, both offline-tolerant.
//!
//! The target poll and the state report never share state beyond the store
//! and hold no locks across network calls. Failures back off exponentially
//! up to a cap; the first success after an outage is the catch-up cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use iotistic_domain::{canonical_hash, validate_target};
use iotistic_reconciler::{ReconcileHandle, ReconcileTrigger};
use iotistic_store::{kv_keys, DeviceStore, LogFilter};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::{target_from_fetch, CloudClient, DeviceStateReport, TargetFetch};
use crate::error::CloudError;
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub report_interval: Duration,
    /// Metrics ride along with the state report at this coarser cadence.
    pub metrics_interval: Duration,
    /// An unchanged report is still sent this often as a heartbeat.
    pub heartbeat_interval: Duration,
    pub max_backoff: Duration,
    pub log_upload_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            report_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            log_upload_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct ReportMemo {
    last_apps_hash: Option<String>,
    last_sent: Option<Instant>,
    last_metrics: Option<Instant>,
}

pub struct SyncLoop {
    client: CloudClient,
    store: Arc<dyn DeviceStore>,
    reconcile: ReconcileHandle,
    metrics: Arc<MetricsCollector>,
    uuid: String,
    api_key: String,
    supervisor_version: String,
    config: SyncConfig,
    memo: Mutex<ReportMemo>,
}

impl SyncLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: CloudClient,
        store: Arc<dyn DeviceStore>,
        reconcile: ReconcileHandle,
        metrics: Arc<MetricsCollector>,
        uuid: String,
        api_key: String,
        supervisor_version: String,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            reconcile,
            metrics,
            uuid,
            api_key,
            supervisor_version,
            config,
            memo: Mutex::new(ReportMemo::default()),
        })
    }

    /// One conditional fetch. Returns true when a new target was persisted.
    pub async fn poll_once(&self) -> Result<bool, CloudError> {
        let etag = self.store.get_kv(kv_keys::TARGET_ETAG).await?;
        let fetch = self
            .client
            .fetch_target_state(&self.uuid, &self.api_key, etag.as_deref())
            .await?;

        let (apps, new_etag) = match fetch {
            TargetFetch::NotModified => return Ok(false),
            TargetFetch::Modified { apps, etag } => (apps, etag),
        };

        let stored = self.store.get_target_state().await?;
        let unchanged = stored
            .as_ref()
            .map(|t| t.apps == apps)
            .unwrap_or(false);

        if let Some(etag) = &new_etag {
            self.store.put_kv(kv_keys::TARGET_ETAG, etag).await?;
        }
        if unchanged {
            return Ok(false);
        }

        let candidate = target_from_fetch(apps, stored.as_ref());
        validate_target(&candidate)?;
        self.store.put_target_state(&candidate).await?;
        info!(version = candidate.version, "new target state accepted");
        self.reconcile.trigger(ReconcileTrigger::TargetChanged);
        Ok(true)
    }

    /// One current-state report, coalesced when nothing changed since the
    /// last send and no heartbeat is due.
    pub async fn report_once(&self) -> Result<bool, CloudError> {
        let current = self.store.get_current_state().await?.unwrap_or_default();
        let apps_hash = canonical_hash(&current.apps);

        let (skip, include_metrics) = {
            let memo = self.memo.lock().await;
            let heartbeat_due = memo
                .last_sent
                .map(|t| t.elapsed() >= self.config.heartbeat_interval)
                .unwrap_or(true);
            let unchanged = memo.last_apps_hash.as_deref() == Some(apps_hash.as_str());
            let metrics_due = memo
                .last_metrics
                .map(|t| t.elapsed() >= self.config.metrics_interval)
                .unwrap_or(true);
            (unchanged && !heartbeat_due && !metrics_due, metrics_due)
        };
        if skip {
            return Ok(false);
        }

        let mut report = DeviceStateReport {
            apps: Some(current.apps),
            supervisor_version: Some(self.supervisor_version.clone()),
            ..Default::default()
        };
        if include_metrics {
            let metrics = self.metrics.collect().await;
            report.ip_address = metrics.ip_address.clone();
            report.os_version = metrics.os_version.clone();
            report = report.with_metrics(&metrics);
        }

        self.client
            .report_state(&self.uuid, &self.api_key, &report)
            .await?;

        let mut memo = self.memo.lock().await;
        memo.last_apps_hash = Some(apps_hash);
        memo.last_sent = Some(Instant::now());
        if include_metrics {
            memo.last_metrics = Some(Instant::now());
        }
        Ok(true)
    }

    /// Ship buffered log entries over HTTP with gzip. Used when the remote
    /// log backend is not carried by the messaging fabric.
    pub async fn upload_logs_once(&self) -> Result<usize, CloudError> {
        let since = self
            .store
            .get_kv(kv_keys::LAST_LOG_UPLOAD)
            .await?
            .and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok());

        let entries = self
            .store
            .query_logs(&LogFilter {
                since,
                limit: Some(1000),
                ..Default::default()
            })
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }

        self.client
            .upload_logs(&self.uuid, &self.api_key, &entries)
            .await?;

        let newest = entries
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        self.store
            .put_kv(
                kv_keys::LAST_LOG_UPLOAD,
                &(newest + chrono::Duration::nanoseconds(1)).to_rfc3339(),
            )
            .await?;
        Ok(entries.len())
    }

    pub async fn run_target_poll(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.poll_interval;
        run_timer(self, "target-poll", interval, shutdown, |s| {
            Box::pin(async move { s.poll_once().await.map(|_| ()) })
        })
        .await;
    }

    pub async fn run_state_report(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.report_interval;
        run_timer(self, "state-report", interval, shutdown, |s| {
            Box::pin(async move { s.report_once().await.map(|_| ()) })
        })
        .await;
    }

    pub async fn run_log_upload(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.log_upload_interval;
        run_timer(self, "log-upload", interval, shutdown, |s| {
            Box::pin(async move { s.upload_logs_once().await.map(|_| ()) })
        })
        .await;
    }
}

/// Shared timer skeleton: fixed cadence while healthy, bounded exponential
/// backoff while the cloud is unreachable.
async fn run_timer<F>(
    sync: Arc<SyncLoop>,
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) where
    F: Fn(
        Arc<SyncLoop>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CloudError>> + Send>>,
{
    // First cycle runs right away; a fresh boot polls within seconds.
    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(loop_name = name, "sync timer shutting down");
                    return;
                }
                continue;
            }
        }

        match tick(sync.clone()).await {
            Ok(()) => {
                delay = interval;
            }
            Err(e) if e.is_retriable() => {
                delay = (delay * 2).min(sync.config.max_backoff).max(interval);
                warn!(loop_name = name, error = %e, retry_in = ?delay, "cloud unreachable");
            }
            Err(e) => {
                // Auth and semantic failures are surfaced, not hammered
                warn!(loop_name = name, error = %e, "sync cycle failed");
                delay = sync.config.max_backoff;
            }
        }
    }
}
