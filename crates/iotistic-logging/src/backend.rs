use async_trait::async_trait;
use iotistic_domain::LogEntry;

use crate::error::PipelineError;

/// A delivery target for log entries.
///
/// Backends are composed at startup. A failing backend loses only its own
/// copy of an entry; the pipeline never blocks the others on it.
#[async_trait]
pub trait LogBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn deliver(&self, entry: &LogEntry) -> Result<(), PipelineError>;

    /// Push out anything buffered (batches, file writers).
    async fn flush(&self) -> Result<(), PipelineError>;

    async fn shutdown(&self) -> Result<(), PipelineError>;
}
