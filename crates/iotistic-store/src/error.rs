use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient read/write failure (lock contention, I/O). Retriable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Schema or data corruption. Not retriable; the supervisor exits.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retriable()
    }
}
