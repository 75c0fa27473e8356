//! Remote log backend: publishes entries over the messaging fabric.
//!
//! Topics follow `{base}/{app_id}/{service_name}/{level}`; batches go to the
//! same topic with a `/batch` suffix and an array payload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use iotistic_domain::{LogEntry, LogSource};
use iotistic_messaging::{Fabric, PublishOpts, QoS};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::backend::LogBackend;
use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_topic: String,
    pub qos: QoS,
    /// Batch when > 1; single-entry publishes otherwise.
    pub max_batch: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_topic: "iotistic/logs".into(),
            qos: QoS::AtMostOnce,
            max_batch: 50,
        }
    }
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    count: usize,
    logs: &'a [LogEntry],
}

pub struct MqttBackend {
    fabric: Arc<Fabric>,
    config: RemoteConfig,
    batches: Mutex<HashMap<String, Vec<LogEntry>>>,
}

impl MqttBackend {
    pub fn new(fabric: Arc<Fabric>, config: RemoteConfig) -> Self {
        Self {
            fabric,
            config,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn topic_for(&self, entry: &LogEntry) -> String {
        let app = entry.app_id.map(|a| a.to_string()).unwrap_or_else(|| "0".into());
        let service = entry
            .service_name
            .clone()
            .unwrap_or_else(|| match entry.source {
                LogSource::Supervisor => "supervisor".into(),
                _ => "system".into(),
            });
        format!("{}/{}/{}/{}", self.config.base_topic, app, service, entry.level)
    }

    async fn publish_batch(&self, topic: &str, logs: &[LogEntry]) -> Result<(), PipelineError> {
        let payload = serde_json::to_vec(&BatchPayload {
            count: logs.len(),
            logs,
        })?;
        self.fabric
            .publish(
                &format!("{}/batch", topic),
                &payload,
                PublishOpts {
                    qos: self.config.qos,
                    retain: false,
                    queue_if_offline: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn flush_batches(&self) -> Result<(), PipelineError> {
        let drained: HashMap<String, Vec<LogEntry>> = {
            let mut batches = self.batches.lock().await;
            std::mem::take(&mut *batches)
        };
        for (topic, logs) in drained {
            if !logs.is_empty() {
                self.publish_batch(&topic, &logs).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LogBackend for MqttBackend {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn deliver(&self, entry: &LogEntry) -> Result<(), PipelineError> {
        let topic = self.topic_for(entry);

        if self.config.max_batch > 1 {
            let full = {
                let mut batches = self.batches.lock().await;
                let batch = batches.entry(topic.clone()).or_default();
                batch.push(entry.clone());
                batch.len() >= self.config.max_batch
            };
            if full {
                let logs = {
                    let mut batches = self.batches.lock().await;
                    batches.remove(&topic).unwrap_or_default()
                };
                self.publish_batch(&topic, &logs).await?;
            }
            return Ok(());
        }

        let payload = serde_json::to_vec(entry)?;
        self.fabric
            .publish(
                &topic,
                &payload,
                PublishOpts {
                    qos: self.config.qos,
                    retain: false,
                    queue_if_offline: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), PipelineError> {
        self.flush_batches().await
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        self.flush_batches().await
    }
}
