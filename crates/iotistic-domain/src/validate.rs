use std::collections::HashSet;

use crate::error::DomainError;
use crate::types::{AppSpec, TargetState};

/// Validate a target state on ingress (admin API or cloud poll).
///
/// Violations reject the whole state before any runtime call is made.
pub fn validate_target(target: &TargetState) -> Result<(), DomainError> {
    for (app_id, app) in &target.apps {
        if *app_id != app.app_id {
            return Err(DomainError::AppIdMismatch {
                app_id: *app_id,
                spec_app_id: app.app_id,
            });
        }
        validate_app(app)?;
    }
    Ok(())
}

fn validate_app(app: &AppSpec) -> Result<(), DomainError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();

    for service in &app.services {
        if !ids.insert(service.service_id) {
            return Err(DomainError::DuplicateServiceId {
                app_id: app.app_id,
                service_id: service.service_id,
            });
        }
        if !names.insert(service.service_name.as_str()) {
            return Err(DomainError::DuplicateServiceName {
                app_id: app.app_id,
                name: service.service_name.clone(),
            });
        }

        if service.image_ref.trim().is_empty() {
            return Err(DomainError::MissingImage {
                service: service.service_name.clone(),
            });
        }
        if service.image_ref.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidImageRef {
                service: service.service_name.clone(),
                image_ref: service.image_ref.clone(),
            });
        }

        for port in &service.ports {
            validate_port_spec(&service.service_name, port)?;
        }
        for network in &service.networks {
            if network.is_empty() || network.contains('/') || network.contains(char::is_whitespace)
            {
                return Err(DomainError::InvalidNetworkName {
                    service: service.service_name.clone(),
                    name: network.clone(),
                });
            }
        }
        for volume in &service.volumes {
            // host-or-named:container[:flags]
            let parts: Vec<&str> = volume.split(':').collect();
            if parts.len() < 2 || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
                return Err(DomainError::InvalidVolumeSpec {
                    service: service.service_name.clone(),
                    spec: volume.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Accepts "host:container" and "host:container/proto" with numeric ports.
fn validate_port_spec(service: &str, spec: &str) -> Result<(), DomainError> {
    let invalid = || DomainError::InvalidPortSpec {
        service: service.to_string(),
        spec: spec.to_string(),
    };

    let (mapping, proto) = match spec.split_once('/') {
        Some((m, p)) => (m, Some(p)),
        None => (spec, None),
    };
    if let Some(p) = proto {
        if p != "tcp" && p != "udp" {
            return Err(invalid());
        }
    }

    let (host, container) = mapping.split_once(':').ok_or_else(invalid)?;
    let host_ok = host.parse::<u16>().map(|p| p > 0).unwrap_or(false);
    let container_ok = container.parse::<u16>().map(|p| p > 0).unwrap_or(false);
    if !host_ok || !container_ok {
        return Err(invalid());
    }
    Ok(())
}
