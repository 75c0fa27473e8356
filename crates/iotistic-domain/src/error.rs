use thiserror::Error;

use crate::types::{AppId, ServiceId};

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("app {app_id}: duplicate service id {service_id}")]
    DuplicateServiceId { app_id: AppId, service_id: ServiceId },

    #[error("app {app_id}: duplicate service name '{name}'")]
    DuplicateServiceName { app_id: AppId, name: String },

    #[error("app {app_id} key does not match spec app_id {spec_app_id}")]
    AppIdMismatch { app_id: AppId, spec_app_id: AppId },

    #[error("service '{service}': image reference is empty")]
    MissingImage { service: String },

    #[error("service '{service}': invalid image reference '{image_ref}'")]
    InvalidImageRef { service: String, image_ref: String },

    #[error("service '{service}': invalid port spec '{spec}' (want host:container[/proto])")]
    InvalidPortSpec { service: String, spec: String },

    #[error("service '{service}': invalid network name '{name}'")]
    InvalidNetworkName { service: String, name: String },

    #[error("service '{service}': invalid volume spec '{spec}'")]
    InvalidVolumeSpec { service: String, spec: String },
}
