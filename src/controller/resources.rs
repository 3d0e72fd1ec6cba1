//! Kubernetes resource builders for generated Services and egress gateway policies
//!
//! Pure functions only: the reconcilers decide when to write, these decide what.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use tracing::warn;

use super::selector::EgressCandidate;
use crate::crd::keys::{
    ContractKey, CATCH_ALL_CIDR, GAMESERVER_POD_LABEL, HOSTNAME_LABEL, LBIPAM_IPS,
    LBIPAM_SHARING_CROSS_NAMESPACE, LBIPAM_SHARING_KEY, POD_NAMESPACE_LABEL, TRUE,
};
use crate::crd::{
    CiliumEgressGatewayPolicy, CiliumEgressGatewayPolicySpec, EgressGateway, EgressRule,
    GameServer, GameServerPort, MatchLabels, PortProtocol,
};
use crate::store::LabelSelector;

/// Service type this operator generates and acts on
pub const LOAD_BALANCER: &str = "LoadBalancer";

/// Create an OwnerReference for garbage collection
pub fn owner_reference<K>(owner: &K, controller: bool) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: controller.then_some(true),
        block_owner_deletion: None,
    }
}

/// Name of the GameServer that owns `service`, if any
pub fn owning_game_server(service: &Service) -> Option<String> {
    service
        .owner_references()
        .iter()
        .find(|o| o.kind == GameServer::kind(&()))
        .map(|o| o.name.clone())
}

// ============================================================================
// Service
// ============================================================================

/// Whether the Service carries the generated-by-us label
pub fn is_managed_service(service: &Service) -> bool {
    ContractKey::LoadBalancerManaged.is_set(service.metadata.labels.as_ref())
}

pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == LOAD_BALANCER)
}

/// Allocated ingress IPs of a LoadBalancer Service
pub fn ingress_ips(service: &Service) -> BTreeSet<String> {
    service
        .status
        .iter()
        .filter_map(|s| s.load_balancer.as_ref())
        .flat_map(|lb| lb.ingress.iter().flatten())
        .filter_map(|i| i.ip.clone())
        .filter(|ip| !ip.trim().is_empty())
        .collect()
}

fn service_port(port: &GameServerPort, protocol: &str, name: String) -> Option<ServicePort> {
    Some(ServicePort {
        name: Some(name),
        port: port.exposed_port()?,
        target_port: port.container_port.map(IntOrString::Int),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    })
}

/// Translate GameServer ports to Service ports.
///
/// TCP and UDP map one to one; TCPUDP becomes a `-tcp` and a `-udp` port.
/// Ports with an unknown protocol or without a port number are skipped.
pub fn service_ports(gs: &GameServer) -> Vec<ServicePort> {
    let mut ports = Vec::new();
    for port in gs.ports() {
        match port.protocol() {
            Some(PortProtocol::Tcp) => ports.extend(service_port(port, "TCP", port.name.clone())),
            Some(PortProtocol::Udp) => ports.extend(service_port(port, "UDP", port.name.clone())),
            Some(PortProtocol::TcpUdp) => {
                ports.extend(service_port(port, "TCP", format!("{}-tcp", port.name)));
                ports.extend(service_port(port, "UDP", format!("{}-udp", port.name)));
            }
            None => warn!(
                "Skipping port {} of GameServer {}/{}: unsupported protocol {:?}",
                port.name,
                gs.namespace().unwrap_or_default(),
                gs.name_any(),
                port.protocol
            ),
        }
    }
    ports
}

fn service_labels(gs: &GameServer) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(ContractKey::LoadBalancerManaged.key().to_string(), TRUE.to_string());
    labels.insert(GAMESERVER_POD_LABEL.to_string(), gs.name_any());
    if gs.egress_policy_enabled() {
        labels.insert(ContractKey::EgressPolicyEnabled.key().to_string(), TRUE.to_string());
    }
    labels
}

fn service_annotations(gs: &GameServer) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    let forwarded = [
        (ContractKey::LoadBalancerSharingKey, LBIPAM_SHARING_KEY),
        (ContractKey::LoadBalancerSharingCrossNamespace, LBIPAM_SHARING_CROSS_NAMESPACE),
        (ContractKey::LoadBalancerIps, LBIPAM_IPS),
    ];
    for (key, target) in forwarded {
        if let Some(value) = gs.contract_value(key) {
            annotations.insert(target.to_string(), value.to_string());
        }
    }
    annotations
}

/// Build the LoadBalancer Service for a GameServer. `None` when no port survives translation.
pub fn build_service(gs: &GameServer) -> Option<Service> {
    let ports = service_ports(gs);
    if ports.is_empty() {
        return None;
    }

    Some(Service {
        metadata: ObjectMeta {
            name: Some(gs.load_balancer_service_name()),
            namespace: gs.namespace(),
            labels: Some(service_labels(gs)),
            annotations: Some(service_annotations(gs)),
            owner_references: Some(vec![owner_reference(gs, true)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(LOAD_BALANCER.to_string()),
            selector: Some(BTreeMap::from([(
                GAMESERVER_POD_LABEL.to_string(),
                gs.name_any(),
            )])),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    })
}

// ============================================================================
// CiliumEgressGatewayPolicy
// ============================================================================

fn policy_labels(gs: &GameServer, service: &Service) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ContractKey::IsManaged.key().to_string(), TRUE.to_string()),
        (
            ContractKey::GameServerRefNamespace.key().to_string(),
            gs.namespace().unwrap_or_default(),
        ),
        (ContractKey::GameServerRefName.key().to_string(), gs.name_any()),
        (
            ContractKey::ServiceRefNamespace.key().to_string(),
            service.namespace().unwrap_or_default(),
        ),
        (ContractKey::ServiceRefName.key().to_string(), service.name_any()),
    ])
}

/// Label selector locating the managed policy generated for `gs` and `service`
pub fn policy_back_reference_selector(gs: &GameServer, service: &Service) -> LabelSelector {
    policy_labels(gs, service)
        .iter()
        .fold(LabelSelector::new(), |selector, (k, v)| selector.equals(k, v))
}

/// Build the egress gateway policy pinning the GameServer's pods to `gateway`
pub fn build_egress_policy(
    gs: &GameServer,
    service: &Service,
    gateway: &EgressCandidate,
) -> CiliumEgressGatewayPolicy {
    let pods = MatchLabels::single(GAMESERVER_POD_LABEL, &gs.name_any())
        .with(POD_NAMESPACE_LABEL, &gs.namespace().unwrap_or_default());

    let mut policy = CiliumEgressGatewayPolicy::new(
        &gs.egress_policy_name(),
        CiliumEgressGatewayPolicySpec {
            selectors: vec![EgressRule {
                namespace_selector: None,
                pod_selector: Some(pods),
            }],
            destination_cidrs: vec![CATCH_ALL_CIDR.to_string()],
            excluded_cidrs: Vec::new(),
            egress_gateway: EgressGateway {
                node_selector: MatchLabels::single(HOSTNAME_LABEL, &gateway.hostname),
                egress_ip: Some(gateway.address.clone()),
                interface: None,
            },
        },
    );
    policy.metadata.labels = Some(policy_labels(gs, service));
    policy.metadata.owner_references = Some(vec![
        owner_reference(gs, false),
        owner_reference(service, false),
    ]);
    policy.metadata.finalizers = Some(vec![ContractKey::EgressPolicyFinalizer.key().to_string()]);
    policy
}
