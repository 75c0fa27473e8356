pub mod docker;
pub mod error;
pub mod fake;
pub mod runtime;

pub use docker::DockerRuntime;
pub use error::RuntimeError;
pub use fake::FakeRuntime;
pub use runtime::{
    ContainerRunState, ContainerRuntime, ContainerSnapshot, ContainerSpec, ContainerSummary,
    ExecResult, LogChunk, LogStream, LogsOpts, NetworkCfg, NetworkSummary,
};
