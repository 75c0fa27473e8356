use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    /// Provisioning is one-shot; the device is already registered.
    #[error("device already registered")]
    AlreadyRegistered,

    /// Bad provisioning key or rejected device key. Never retried
    /// automatically with the same credentials.
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited by cloud")]
    RateLimited,

    /// Transport-level failure; retried with bounded backoff.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("store error: {0}")]
    Store(#[from] iotistic_store::StoreError),

    #[error("invalid target state from cloud: {0}")]
    Domain(#[from] iotistic_domain::DomainError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log compression error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// True for failures the sync loop should retry with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CloudError::Http(_)
                | CloudError::RateLimited
                | CloudError::Status { status: 500..=599, .. }
        )
    }
}
