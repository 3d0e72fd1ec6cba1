//! Unit tests for the resource models and the key contract

mod contract_keys {
    use crate::crd::keys::{parse_flag, ContractKey};
    use std::collections::{BTreeMap, HashSet};

    #[test]
    fn every_key_is_unique_and_namespaced() {
        let keys: HashSet<&str> = ContractKey::ALL.iter().map(|k| k.key()).collect();
        assert_eq!(keys.len(), ContractKey::ALL.len());
        for key in keys {
            assert!(key.starts_with("k8s.stevefan1999.tech/"), "{key}");
        }
    }

    #[test]
    fn finalizer_token_is_stable() {
        assert_eq!(
            ContractKey::EgressPolicyFinalizer.key(),
            "k8s.stevefan1999.tech/cilium-egress-gateway-policy-finalizer"
        );
    }

    #[test]
    fn flag_parsing_is_case_insensitive_and_trimmed() {
        assert!(parse_flag(Some("true")));
        assert!(parse_flag(Some("TRUE")));
        assert!(parse_flag(Some("  True\n")));
        assert!(!parse_flag(Some("false")));
        assert!(!parse_flag(Some("yes")));
        assert!(!parse_flag(Some("1")));
        assert!(!parse_flag(Some("")));
        assert!(!parse_flag(None));
    }

    #[test]
    fn lookup_falls_back_to_defaults() {
        let empty = BTreeMap::new();
        assert_eq!(ContractKey::LoadBalancerSharingKey.lookup(Some(&empty)), Some(" "));
        assert_eq!(
            ContractKey::LoadBalancerSharingCrossNamespace.lookup(None),
            Some("*")
        );
        assert_eq!(ContractKey::LoadBalancerIps.lookup(None), None);

        let set = BTreeMap::from([(
            ContractKey::LoadBalancerSharingKey.key().to_string(),
            "shared".to_string(),
        )]);
        assert_eq!(ContractKey::LoadBalancerSharingKey.lookup(Some(&set)), Some("shared"));
    }
}

mod game_server_model {
    use crate::crd::keys::ContractKey;
    use crate::crd::{
        GameServer, GameServerAddress, GameServerPort, GameServerSpec, GameServerStatus,
        PortProtocol,
    };
    use std::collections::{BTreeMap, BTreeSet};

    fn game_server(annotations: &[(ContractKey, &str)]) -> GameServer {
        let mut gs = GameServer::new("arena", GameServerSpec::default());
        gs.metadata.namespace = Some("games".to_string());
        gs.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.key().to_string(), v.to_string()))
                .collect(),
        );
        gs
    }

    #[test]
    fn generated_names_are_deterministic() {
        let gs = game_server(&[]);
        assert_eq!(gs.load_balancer_service_name(), "agones-generated-arena");
        assert_eq!(gs.egress_policy_name(), "agones-generated-games-arena");
    }

    #[test]
    fn flags_default_to_disabled() {
        let gs = game_server(&[]);
        assert!(!gs.load_balancer_enabled());
        assert!(!gs.egress_policy_enabled());
    }

    #[test]
    fn annotation_flags_win_over_labels() {
        let mut gs = game_server(&[(ContractKey::LoadBalancerEnabled, "False")]);
        gs.metadata.labels = Some(BTreeMap::from([(
            ContractKey::LoadBalancerEnabled.key().to_string(),
            "true".to_string(),
        )]));
        assert!(!gs.load_balancer_enabled());

        gs.metadata.annotations = None;
        assert!(gs.load_balancer_enabled());
    }

    #[test]
    fn malformed_flag_reads_as_disabled() {
        let gs = game_server(&[(ContractKey::EgressPolicyEnabled, "enabled")]);
        assert!(!gs.egress_policy_enabled());
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = serde_json::json!({
            "apiVersion": "agones.dev/v1",
            "kind": "GameServer",
            "metadata": {"name": "arena", "namespace": "games"},
            "spec": {
                "container": "game",
                "ports": [{"name": "p", "containerPort": 7654, "portPolicy": "Dynamic"}],
                "template": {"spec": {"containers": []}}
            },
            "status": {"state": "Ready", "nodeName": "worker-1", "addresses": []}
        });
        let gs: GameServer = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(gs.ports()[0].protocol(), Some(PortProtocol::Udp));

        let back = serde_json::to_value(&gs).unwrap();
        assert_eq!(back["spec"]["container"], "game");
        assert_eq!(back["spec"]["template"], raw["spec"]["template"]);
        assert_eq!(back["spec"]["ports"][0]["portPolicy"], "Dynamic");
        assert_eq!(back["status"]["nodeName"], "worker-1");
    }

    #[test]
    fn exposed_port_prefers_host_port() {
        let port = GameServerPort {
            container_port: Some(7654),
            host_port: Some(30001),
            ..Default::default()
        };
        assert_eq!(port.exposed_port(), Some(30001));
        let port = GameServerPort {
            container_port: Some(7654),
            ..Default::default()
        };
        assert_eq!(port.exposed_port(), Some(7654));
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!(PortProtocol::parse(Some("TCP")), Some(PortProtocol::Tcp));
        assert_eq!(PortProtocol::parse(Some("TCPUDP")), Some(PortProtocol::TcpUdp));
        assert_eq!(PortProtocol::parse(None), Some(PortProtocol::Udp));
        assert_eq!(PortProtocol::parse(Some("SCTP")), None);
    }

    #[test]
    fn replacing_load_balancer_addresses_keeps_other_entries() {
        let mut gs = game_server(&[]);
        gs.status = Some(GameServerStatus {
            addresses: Some(vec![
                GameServerAddress::new("InternalIP", "10.0.0.5"),
                GameServerAddress::load_balancer("203.0.113.1"),
                GameServerAddress::new("Hostname", "worker-1"),
            ]),
            ..Default::default()
        });

        let ips = BTreeSet::from(["203.0.113.9".to_string(), "203.0.113.10".to_string()]);
        assert!(gs.replace_load_balancer_addresses(&ips));
        assert_eq!(gs.load_balancer_addresses(), ips);

        let addresses = gs.status.as_ref().unwrap().addresses.as_ref().unwrap();
        assert_eq!(addresses[0], GameServerAddress::new("InternalIP", "10.0.0.5"));
        assert_eq!(addresses[1], GameServerAddress::new("Hostname", "worker-1"));
        assert_eq!(addresses.len(), 4);

        assert!(!gs.replace_load_balancer_addresses(&ips));
    }

    #[test]
    fn replacing_on_empty_status_creates_it() {
        let mut gs = game_server(&[]);
        let ips = BTreeSet::from(["198.51.100.7".to_string()]);
        assert!(gs.replace_load_balancer_addresses(&ips));
        assert_eq!(gs.load_balancer_addresses(), ips);
    }
}

mod egress_policy_model {
    use crate::crd::keys::ContractKey;
    use crate::crd::{BackReference, CiliumEgressGatewayPolicy, CiliumEgressGatewayPolicySpec};
    use std::collections::BTreeMap;

    fn policy(labels: &[(ContractKey, &str)], annotations: &[(ContractKey, &str)]) -> CiliumEgressGatewayPolicy {
        let to_map = |pairs: &[(ContractKey, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.key().to_string(), v.to_string()))
                .collect()
        };
        let mut policy = CiliumEgressGatewayPolicy::new(
            "agones-generated-games-arena",
            CiliumEgressGatewayPolicySpec::default(),
        );
        policy.metadata.labels = Some(to_map(labels));
        policy.metadata.annotations = Some(to_map(annotations));
        policy
    }

    #[test]
    fn managed_reads_label_then_annotation() {
        assert!(policy(&[(ContractKey::IsManaged, "true")], &[]).is_managed());
        assert!(policy(&[], &[(ContractKey::IsManaged, "TRUE")]).is_managed());
        assert!(!policy(
            &[(ContractKey::IsManaged, "false")],
            &[(ContractKey::IsManaged, "true")]
        )
        .is_managed());
        assert!(!policy(&[], &[]).is_managed());
    }

    #[test]
    fn back_references_from_labels() {
        let p = policy(
            &[
                (ContractKey::GameServerRefNamespace, "games"),
                (ContractKey::GameServerRefName, "arena"),
                (ContractKey::ServiceRefNamespace, "games"),
                (ContractKey::ServiceRefName, "agones-generated-arena"),
            ],
            &[],
        );
        assert_eq!(p.game_server_ref(), Ok(BackReference::new("games", "arena")));
        assert_eq!(
            p.service_ref(),
            Ok(BackReference::new("games", "agones-generated-arena"))
        );
    }

    #[test]
    fn back_references_fall_back_to_legacy_annotations() {
        let p = policy(&[], &[(ContractKey::LegacyGameServerRef, "games/arena")]);
        assert_eq!(p.game_server_ref(), Ok(BackReference::new("games", "arena")));
        assert_eq!(p.service_ref(), Err(ContractKey::ServiceRefName));
    }

    #[test]
    fn malformed_legacy_reference_is_rejected() {
        for bad in ["arena", "games/", "/arena", "a/b/c", ""] {
            assert_eq!(BackReference::parse(bad), None, "{bad}");
        }
    }
}
