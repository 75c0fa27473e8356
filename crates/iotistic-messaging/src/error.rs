use thiserror::Error;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("offline publish queue full ({0} entries)")]
    QueueFull(usize),

    #[error("client error: {0}")]
    Client(String),
}

impl From<rumqttc::ClientError> for FabricError {
    fn from(e: rumqttc::ClientError) -> Self {
        FabricError::Client(e.to_string())
    }
}
