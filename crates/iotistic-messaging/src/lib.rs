pub mod error;
pub mod fabric;
pub mod topic;

pub use error::FabricError;
pub use fabric::{Fabric, FabricConfig, Handler, PublishOpts};
pub use rumqttc::QoS;
pub use topic::topic_matches;
