pub mod backend;
pub mod error;
pub mod local;
pub mod pipeline;
pub mod remote;

pub use backend::LogBackend;
pub use error::PipelineError;
pub use local::{LocalBackend, DEFAULT_RING_CAPACITY};
pub use pipeline::{ContainerLogContext, LogAttacher, LogPipeline};
pub use remote::{MqttBackend, RemoteConfig};
