#[cfg(test)]
mod tests {
    use crate::types::*;
    use crate::validate::validate_target;
    use std::collections::BTreeMap;

    fn service(id: u32, name: &str) -> ServiceSpec {
        ServiceSpec {
            service_id: ServiceId::new(id),
            service_name: name.to_string(),
            image_ref: "nginx:alpine".into(),
            ports: vec![],
            environment: BTreeMap::new(),
            volumes: vec![],
            networks: vec![],
            restart_policy: RestartPolicy::Always,
            labels: BTreeMap::new(),
            network_mode: None,
        }
    }

    fn app(id: u32, services: Vec<ServiceSpec>) -> AppSpec {
        AppSpec {
            app_id: AppId::new(id),
            app_name: format!("app{}", id),
            app_uuid: format!("uuid-{}", id),
            services,
        }
    }

    fn target_with(apps: Vec<AppSpec>) -> TargetState {
        TargetState {
            apps: apps.into_iter().map(|a| (a.app_id, a)).collect(),
            version: 1,
        }
    }

    #[test]
    fn container_naming_convention() {
        assert_eq!(container_name("monitor", "web", ServiceId::new(3)), "monitor_web_3");
    }

    #[test]
    fn network_naming_is_app_scoped() {
        assert_eq!(scoped_network_name(AppId::new(1), "backend"), "1_backend");
    }

    #[test]
    fn managed_labels_are_complete() {
        let a = app(1, vec![service(2, "web")]);
        let labels = managed_labels(&a, &a.services[0]);
        assert_eq!(labels.get(labels::APP_ID).map(String::as_str), Some("1"));
        assert_eq!(labels.get(labels::SERVICE_ID).map(String::as_str), Some("2"));
        assert_eq!(labels.get(labels::MANAGED).map(String::as_str), Some("true"));
    }

    #[test]
    fn managed_labels_keep_user_labels() {
        let mut s = service(2, "web");
        s.labels.insert("com.example.tier".into(), "edge".into());
        let a = app(1, vec![s]);
        let labels = managed_labels(&a, &a.services[0]);
        assert_eq!(labels.get("com.example.tier").map(String::as_str), Some("edge"));
    }

    #[test]
    fn duplicate_service_id_rejected() {
        let t = target_with(vec![app(1, vec![service(1, "web"), service(1, "api")])]);
        assert!(validate_target(&t).is_err());
    }

    #[test]
    fn duplicate_service_name_rejected() {
        let t = target_with(vec![app(1, vec![service(1, "web"), service(2, "web")])]);
        assert!(validate_target(&t).is_err());
    }

    #[test]
    fn empty_image_rejected() {
        let mut s = service(1, "web");
        s.image_ref = "".into();
        let t = target_with(vec![app(1, vec![s])]);
        assert!(validate_target(&t).is_err());
    }

    #[test]
    fn bad_port_spec_rejected() {
        for bad in ["80", "notaport:80", "8080:0", "8080:80/icmp"] {
            let mut s = service(1, "web");
            s.ports = vec![bad.into()];
            let t = target_with(vec![app(1, vec![s])]);
            assert!(validate_target(&t).is_err(), "should reject {:?}", bad);
        }
    }

    #[test]
    fn good_port_specs_accepted() {
        for good in ["8080:80", "53:53/udp", "443:8443/tcp"] {
            let mut s = service(1, "web");
            s.ports = vec![good.into()];
            let t = target_with(vec![app(1, vec![s])]);
            assert!(validate_target(&t).is_ok(), "should accept {:?}", good);
        }
    }

    #[test]
    fn target_state_round_trips_with_integer_keys() {
        // The cloud wire format keys apps by stringified integer ids.
        let t = target_with(vec![app(7, vec![service(1, "web")])]);
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"7\""));
        let back: TargetState = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn reset_preserves_uuid() {
        let mut id = DeviceIdentity::new("u-1".into(), "dev".into(), "generic".into());
        id.provisioning_state = ProvisioningState::Registered;
        id.api_key_hash = Some("abc".into());
        id.device_id = Some(42);
        id.reset();
        assert_eq!(id.uuid, "u-1");
        assert_eq!(id.provisioning_state, ProvisioningState::Unprovisioned);
        assert!(id.api_key_hash.is_none());
        assert!(id.device_id.is_none());
    }

    #[test]
    fn reconciliation_status_derivation() {
        use crate::hash::spec_hash;

        let spec = service(1, "web");
        let observed = CurrentService {
            service_id: spec.service_id,
            service_name: spec.service_name.clone(),
            image_ref: spec.image_ref.clone(),
            container_id: Some("c1".into()),
            status: ServiceStatus::Running,
            ports: vec![],
            networks: vec![],
            spec_hash: spec_hash(&spec),
            error: None,
        };

        assert_eq!(
            ReconciliationStatus::derive(Some(&spec), Some(&observed)),
            Some(ReconciliationStatus::InSync)
        );
        assert!(matches!(
            ReconciliationStatus::derive(Some(&spec), None),
            Some(ReconciliationStatus::Missing(_))
        ));
        assert!(matches!(
            ReconciliationStatus::derive(None, Some(&observed)),
            Some(ReconciliationStatus::Extra(_))
        ));

        let mut changed = spec.clone();
        changed.image_ref = "nginx:1.27".into();
        assert!(matches!(
            ReconciliationStatus::derive(Some(&changed), Some(&observed)),
            Some(ReconciliationStatus::NeedsUpdate(_))
        ));
        assert_eq!(ReconciliationStatus::derive(None, None), None);
    }

    #[test]
    fn app_network_names_deduped_and_scoped() {
        let mut s1 = service(1, "api");
        s1.networks = vec!["backend".into()];
        let mut s2 = service(2, "web");
        s2.networks = vec!["backend".into(), "frontend".into()];
        let a = app(1, vec![s1, s2]);
        assert_eq!(a.network_names(), vec!["1_backend".to_string(), "1_frontend".to_string()]);
    }
}
