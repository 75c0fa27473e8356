use thiserror::Error;

/// Runtime-layer errors, normalized into the supervisor's failure taxonomy.
///
/// `is_retriable` distinguishes transient transport trouble (retried with
/// backoff) from semantic failures (recorded against the service and only
/// retried on target change).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("port conflict: {0}")]
    PortConflict(String),

    #[error("network '{0}' exists with a different configuration")]
    ResourceRecreationAttempt(String),

    #[error("registry rate limit: {0}")]
    RateLimited(String),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal runtime error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// True for failures worth retrying with backoff without a target change.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Unavailable(_) | RuntimeError::Timeout(_) | RuntimeError::RateLimited(_)
        )
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match e {
            B::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::ContainerNotFound(message),
            B::DockerResponseServerError {
                status_code: 409,
                message,
            } => {
                if message.contains("port is already allocated") {
                    RuntimeError::PortConflict(message)
                } else {
                    RuntimeError::Internal(message)
                }
            }
            B::DockerResponseServerError {
                status_code: 429,
                message,
            } => RuntimeError::RateLimited(message),
            B::DockerResponseServerError {
                status_code: 500..=599,
                message,
            } => RuntimeError::Unavailable(message),
            B::IOError { err } => RuntimeError::Unavailable(err.to_string()),
            B::RequestTimeoutError => RuntimeError::Timeout("docker request".into()),
            other => RuntimeError::Internal(other.to_string()),
        }
    }
}
