//! Deterministic planner: diffs target against current and emits an ordered
//! plan of atomic steps.
//!
//! Phase ordering is load-bearing: images and networks must exist before any
//! container starts, and old containers must be gone before their networks
//! are removed. Within a phase, steps are sorted by `(app_id, service_id)`
//! or `(app_id, network_name)` so identical inputs replay identical plans.

use std::collections::{BTreeMap, BTreeSet};

use iotistic_domain::{
    spec_hash, validate_target, AppId, CurrentState, DomainError, ServiceId, ServiceSpec,
    ServiceStatus, TargetState,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Step {
    DownloadImage {
        app_id: AppId,
        image_ref: String,
    },
    CreateNetwork {
        app_id: AppId,
        network_name: String,
    },
    StopContainer {
        app_id: AppId,
        service_id: ServiceId,
        container_id: String,
    },
    RemoveContainer {
        app_id: AppId,
        service_id: ServiceId,
        container_id: String,
    },
    StartContainer {
        app_id: AppId,
        app_name: String,
        service: ServiceSpec,
    },
    RemoveNetwork {
        app_id: AppId,
        network_name: String,
    },
    NoOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| matches!(s, Step::NoOp))
    }
}

/// Compute the ordered plan transforming `current` into `target`.
///
/// Pure and deterministic: identical inputs yield byte-identical plans.
/// State-model violations reject the whole plan before any step is emitted.
pub fn plan(target: &TargetState, current: &CurrentState) -> Result<Plan, DomainError> {
    validate_target(target)?;

    // (app_id, app_name, service) pairs to start, removals to stop+remove,
    // and network deltas, gathered per app then emitted phase by phase.
    let mut to_start: Vec<(AppId, String, ServiceSpec)> = Vec::new();
    let mut to_remove: Vec<(AppId, ServiceId, Option<String>)> = Vec::new();
    let mut nets_add: Vec<(AppId, String)> = Vec::new();
    let mut nets_remove: Vec<(AppId, String)> = Vec::new();

    let app_ids: BTreeSet<AppId> = target
        .apps
        .keys()
        .chain(current.apps.keys())
        .copied()
        .collect();

    for app_id in app_ids {
        let tgt_app = target.apps.get(&app_id);
        let cur_app = current.apps.get(&app_id);

        let cur_services: BTreeMap<ServiceId, _> = cur_app
            .map(|a| a.services.iter().map(|s| (s.service_id, s)).collect())
            .unwrap_or_default();
        let tgt_services: BTreeMap<ServiceId, &ServiceSpec> = tgt_app
            .map(|a| a.services.iter().map(|s| (s.service_id, s)).collect())
            .unwrap_or_default();

        if let Some(app) = tgt_app {
            for (service_id, spec) in &tgt_services {
                let desired_hash = spec_hash(spec);
                match cur_services.get(service_id) {
                    None => {
                        to_start.push((app_id, app.app_name.clone(), (*spec).clone()));
                    }
                    Some(cs) if cs.spec_hash == desired_hash => {
                        // Error is latched until the target changes; a
                        // matching hash means it has not.
                        if cs.status == ServiceStatus::Error {
                            continue;
                        }
                        let alive = cs.container_id.is_some()
                            && matches!(
                                cs.status,
                                ServiceStatus::Running | ServiceStatus::Restarting
                            );
                        if !alive {
                            // Present but not running (failed start, stopped):
                            // the start step adopts or recreates it.
                            to_start.push((app_id, app.app_name.clone(), (*spec).clone()));
                        }
                    }
                    Some(cs) => {
                        to_remove.push((app_id, *service_id, cs.container_id.clone()));
                        to_start.push((app_id, app.app_name.clone(), (*spec).clone()));
                    }
                }
            }
        }

        // Current services with no target counterpart, including labeled
        // extras swept in from the runtime refresh.
        for (service_id, cs) in &cur_services {
            if !tgt_services.contains_key(service_id) {
                to_remove.push((app_id, *service_id, cs.container_id.clone()));
            }
        }

        // Network deltas from the referenced sets
        let target_nets: BTreeSet<String> = tgt_app
            .map(|a| a.network_names().into_iter().collect())
            .unwrap_or_default();
        let current_nets: BTreeSet<String> = cur_app
            .map(|a| a.networks.iter().cloned().collect())
            .unwrap_or_default();
        for name in target_nets.difference(&current_nets) {
            nets_add.push((app_id, name.clone()));
        }
        for name in current_nets.difference(&target_nets) {
            nets_remove.push((app_id, name.clone()));
        }
    }

    to_start.sort_by(|a, b| (a.0, a.2.service_id).cmp(&(b.0, b.2.service_id)));
    to_remove.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    nets_add.sort();
    nets_remove.sort();

    let mut steps: Vec<Step> = Vec::new();

    // Phase A, prepare: images (deduped by ref), then networks
    let mut seen_images: BTreeSet<&str> = BTreeSet::new();
    for (app_id, _, spec) in &to_start {
        if seen_images.insert(spec.image_ref.as_str()) {
            steps.push(Step::DownloadImage {
                app_id: *app_id,
                image_ref: spec.image_ref.clone(),
            });
        }
    }
    for (app_id, network_name) in &nets_add {
        steps.push(Step::CreateNetwork {
            app_id: *app_id,
            network_name: network_name.clone(),
        });
    }

    // Phase B, containers: stop+remove pairs, then starts
    for (app_id, service_id, container_id) in &to_remove {
        if let Some(container_id) = container_id {
            steps.push(Step::StopContainer {
                app_id: *app_id,
                service_id: *service_id,
                container_id: container_id.clone(),
            });
            steps.push(Step::RemoveContainer {
                app_id: *app_id,
                service_id: *service_id,
                container_id: container_id.clone(),
            });
        }
    }
    for (app_id, app_name, service) in &to_start {
        steps.push(Step::StartContainer {
            app_id: *app_id,
            app_name: app_name.clone(),
            service: service.clone(),
        });
    }

    // Phase C, teardown
    for (app_id, network_name) in &nets_remove {
        steps.push(Step::RemoveNetwork {
            app_id: *app_id,
            network_name: network_name.clone(),
        });
    }

    if steps.is_empty() {
        steps.push(Step::NoOp);
    }

    Ok(Plan { steps })
}
