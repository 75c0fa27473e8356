use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state-model violation: {0}")]
    Domain(#[from] iotistic_domain::DomainError),

    #[error("store error: {0}")]
    Store(#[from] iotistic_store::StoreError),

    #[error("runtime error: {0}")]
    Runtime(#[from] iotistic_runtime::RuntimeError),

    #[error("internal error: {0}")]
    Internal(String),
}
