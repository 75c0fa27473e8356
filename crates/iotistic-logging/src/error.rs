use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store backend error: {0}")]
    Store(#[from] iotistic_store::StoreError),

    #[error("messaging backend error: {0}")]
    Messaging(#[from] iotistic_messaging::FabricError),

    #[error("file backend error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
