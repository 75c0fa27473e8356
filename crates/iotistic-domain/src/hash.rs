use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::ServiceSpec;

/// Serialize `value` to canonical JSON (object keys sorted) and return its
/// SHA-256 hex digest.
pub fn canonical_hash<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    let canonical = sort_json_keys(v);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

/// Recursively sort JSON object keys so map field ordering doesn't affect
/// the hash.
fn sort_json_keys(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

/// The subset of a service spec whose change requires container replacement.
/// Display-only fields (service_name, app metadata) are deliberately absent.
#[derive(Serialize)]
struct ReplacementFields<'a> {
    image_ref: &'a str,
    environment: &'a std::collections::BTreeMap<String, String>,
    ports: &'a [String],
    volumes: &'a [String],
    networks: &'a [String],
    restart_policy: &'a crate::types::RestartPolicy,
    labels: &'a std::collections::BTreeMap<String, String>,
    network_mode: &'a Option<String>,
}

/// Deterministic digest over the fields of a service spec that require
/// container replacement when changed.
pub fn spec_hash(spec: &ServiceSpec) -> String {
    canonical_hash(&ReplacementFields {
        image_ref: &spec.image_ref,
        environment: &spec.environment,
        ports: &spec.ports,
        volumes: &spec.volumes,
        networks: &spec.networks,
        restart_policy: &spec.restart_policy,
        labels: &spec.labels,
        network_mode: &spec.network_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RestartPolicy, ServiceId, ServiceSpec};

    fn base_spec() -> ServiceSpec {
        ServiceSpec {
            service_id: ServiceId::new(1),
            service_name: "web".into(),
            image_ref: "nginx:alpine".into(),
            ports: vec!["8080:80".into()],
            environment: Default::default(),
            volumes: vec![],
            networks: vec!["backend".into()],
            restart_policy: RestartPolicy::Always,
            labels: Default::default(),
            network_mode: None,
        }
    }

    #[test]
    fn identical_specs_hash_equal() {
        assert_eq!(spec_hash(&base_spec()), spec_hash(&base_spec()));
    }

    #[test]
    fn image_change_changes_hash() {
        let mut b = base_spec();
        b.image_ref = "nginx:1.27".into();
        assert_ne!(spec_hash(&base_spec()), spec_hash(&b));
    }

    #[test]
    fn env_change_changes_hash() {
        let mut b = base_spec();
        b.environment.insert("FOO".into(), "bar".into());
        assert_ne!(spec_hash(&base_spec()), spec_hash(&b));
    }

    #[test]
    fn display_name_change_keeps_hash() {
        // Metadata-only changes must not trigger container replacement.
        let mut b = base_spec();
        b.service_name = "renamed".into();
        assert_eq!(spec_hash(&base_spec()), spec_hash(&b));
    }

    #[test]
    fn env_insertion_order_is_irrelevant() {
        let mut a = base_spec();
        a.environment.insert("A".into(), "1".into());
        a.environment.insert("B".into(), "2".into());
        let mut b = base_spec();
        b.environment.insert("B".into(), "2".into());
        b.environment.insert("A".into(), "1".into());
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }
}
