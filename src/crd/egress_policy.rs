//! Cilium egress gateway policy (cilium.io/v2, cluster scoped)
//!
//! Only the subset of the schema that generated policies use is modelled.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::keys::ContractKey;
use super::types::MatchLabels;

/// Routes egress traffic of selected pods through a gateway node with a fixed source IP.
///
/// # Example
///
/// ```yaml
/// apiVersion: cilium.io/v2
/// kind: CiliumEgressGatewayPolicy
/// metadata:
///   name: agones-generated-games-arena-7xk2p
/// spec:
///   selectors:
///     - podSelector:
///         matchLabels:
///           agones.dev/gameserver: arena-7xk2p
///           io.kubernetes.pod.namespace: games
///   destinationCIDRs: ["0.0.0.0/0"]
///   egressGateway:
///     nodeSelector:
///       matchLabels:
///         kubernetes.io/hostname: worker-3
///     egressIP: 203.0.113.10
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cilium.io",
    version = "v2",
    kind = "CiliumEgressGatewayPolicy",
    plural = "ciliumegressgatewaypolicies",
    shortname = "cegp"
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumEgressGatewayPolicySpec {
    /// Which endpoints the policy applies to
    #[serde(default)]
    pub selectors: Vec<EgressRule>,

    #[serde(rename = "destinationCIDRs", default)]
    pub destination_cidrs: Vec<String>,

    #[serde(
        rename = "excludedCIDRs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub excluded_cidrs: Vec<String>,

    pub egress_gateway: EgressGateway,
}

/// Endpoint selection, by namespace and/or pod labels
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<MatchLabels>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<MatchLabels>,
}

/// Gateway node and the source IP traffic leaves with
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EgressGateway {
    pub node_selector: MatchLabels,

    #[serde(rename = "egressIP", default, skip_serializing_if = "Option::is_none")]
    pub egress_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// A `namespace/name` pointer from a policy back to one of its owners
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackReference {
    pub namespace: String,
    pub name: String,
}

impl BackReference {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse the legacy `namespace/name` form. Anything else is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Some(Self::new(ns, name))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for BackReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl CiliumEgressGatewayPolicy {
    /// Whether this policy was generated by the operator. Label first, annotation as fallback.
    pub fn is_managed(&self) -> bool {
        let labels = self.metadata.labels.as_ref();
        if labels.is_some_and(|l| l.contains_key(ContractKey::IsManaged.key())) {
            return ContractKey::IsManaged.is_set(labels);
        }
        ContractKey::IsManaged.is_set(self.metadata.annotations.as_ref())
    }

    /// Reference to the owning GameServer
    pub fn game_server_ref(&self) -> Result<BackReference, ContractKey> {
        self.back_reference(
            ContractKey::GameServerRefNamespace,
            ContractKey::GameServerRefName,
            ContractKey::LegacyGameServerRef,
        )
    }

    /// Reference to the Service whose ingress IP the policy uses
    pub fn service_ref(&self) -> Result<BackReference, ContractKey> {
        self.back_reference(
            ContractKey::ServiceRefNamespace,
            ContractKey::ServiceRefName,
            ContractKey::LegacyServiceRef,
        )
    }

    /// Resolve a back reference from the label pair, falling back to the legacy
    /// `namespace/name` annotation. The error names the key that was missing.
    fn back_reference(
        &self,
        namespace_key: ContractKey,
        name_key: ContractKey,
        legacy_key: ContractKey,
    ) -> Result<BackReference, ContractKey> {
        let labels = self.labels();
        match (labels.get(namespace_key.key()), labels.get(name_key.key())) {
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
                return Ok(BackReference::new(ns, name));
            }
            _ => {}
        }
        self.annotations()
            .get(legacy_key.key())
            .and_then(|v| BackReference::parse(v))
            .ok_or(name_key)
    }
}
