//! Egress gateway node selection
//!
//! Picks the node currently holding one of a Service's ingress IPs, so the
//! game server's outbound traffic leaves with the same address clients
//! connect to.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::crd::address_type;
use crate::crd::keys::NODE_EXTERNAL_IP_ANNOTATION;

/// A node paired with one of its addresses
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EgressCandidate {
    pub node_name: String,
    /// Value of the node's `kubernetes.io/hostname` label, falling back to its name
    pub hostname: String,
    pub address_type: String,
    pub address: String,
}

/// Hostname label value used to pin the gateway
pub fn node_hostname(node: &Node) -> String {
    node.labels()
        .get(crate::crd::keys::HOSTNAME_LABEL)
        .cloned()
        .unwrap_or_else(|| node.name_any())
}

/// Externally advertised IPs from the node annotation, comma separated
fn advertised_ips(node: &Node) -> impl Iterator<Item = &str> {
    node.annotations()
        .get(NODE_EXTERNAL_IP_ANNOTATION)
        .map(String::as_str)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

/// Every (node, address) pair whose address is one of `targets`, in store order:
/// reported status addresses of all nodes first, then annotation addresses as
/// synthetic `ExternalIP` entries.
pub fn egress_candidates(nodes: &[Node], targets: &BTreeSet<String>) -> Vec<EgressCandidate> {
    let reported = nodes.iter().flat_map(|node| {
        node.status
            .iter()
            .flat_map(|s| s.addresses.iter().flatten())
            .filter(move |a| targets.contains(&a.address))
            .map(move |a| EgressCandidate {
                node_name: node.name_any(),
                hostname: node_hostname(node),
                address_type: a.type_.clone(),
                address: a.address.clone(),
            })
    });

    let advertised = nodes.iter().flat_map(|node| {
        advertised_ips(node)
            .filter(move |ip| targets.contains(*ip))
            .map(move |ip| EgressCandidate {
                node_name: node.name_any(),
                hostname: node_hostname(node),
                address_type: address_type::EXTERNAL_IP.to_string(),
                address: ip.to_string(),
            })
    });

    reported.chain(advertised).collect()
}

/// Best gateway for `targets`: the first `ExternalIP` candidate, else the first
/// `InternalIP` candidate, else none.
pub fn select_egress_node(nodes: &[Node], targets: &BTreeSet<String>) -> Option<EgressCandidate> {
    let candidates = egress_candidates(nodes, targets);
    let first_of = |kind: &str| candidates.iter().find(|c| c.address_type == kind).cloned();
    first_of(address_type::EXTERNAL_IP).or_else(|| first_of(address_type::INTERNAL_IP))
}
