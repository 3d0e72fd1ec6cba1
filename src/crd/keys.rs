//! Annotation, label and finalizer keys shared with other controllers
//!
//! These strings are a wire contract: other operators and humans set and
//! read them, so they must stay byte-for-byte stable.

use std::collections::BTreeMap;

/// Keys owned by this operator, all under `k8s.stevefan1999.tech/`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContractKey {
    /// GameServer flag: generate a LoadBalancer Service
    LoadBalancerEnabled,
    /// GameServer flag: generate a CiliumEgressGatewayPolicy; copied onto the Service as a label
    EgressPolicyEnabled,
    /// GameServer value forwarded to `lbipam.cilium.io/sharing-key`
    LoadBalancerSharingKey,
    /// GameServer value forwarded to `lbipam.cilium.io/sharing-cross-namespace`
    LoadBalancerSharingCrossNamespace,
    /// GameServer value forwarded to `lbipam.cilium.io/ips`
    LoadBalancerIps,
    /// Service label marking a Service generated by this operator
    LoadBalancerManaged,
    /// Policy label marking a policy generated by this operator
    IsManaged,
    GameServerRefNamespace,
    GameServerRefName,
    ServiceRefNamespace,
    ServiceRefName,
    /// Older policies carried `namespace/name` in a single annotation
    LegacyGameServerRef,
    LegacyServiceRef,
    /// Finalizer token on both GameServers and policies
    EgressPolicyFinalizer,
}

impl ContractKey {
    pub const ALL: [ContractKey; 14] = [
        ContractKey::LoadBalancerEnabled,
        ContractKey::EgressPolicyEnabled,
        ContractKey::LoadBalancerSharingKey,
        ContractKey::LoadBalancerSharingCrossNamespace,
        ContractKey::LoadBalancerIps,
        ContractKey::LoadBalancerManaged,
        ContractKey::IsManaged,
        ContractKey::GameServerRefNamespace,
        ContractKey::GameServerRefName,
        ContractKey::ServiceRefNamespace,
        ContractKey::ServiceRefName,
        ContractKey::LegacyGameServerRef,
        ContractKey::LegacyServiceRef,
        ContractKey::EgressPolicyFinalizer,
    ];

    /// The full key string
    pub const fn key(self) -> &'static str {
        match self {
            ContractKey::LoadBalancerEnabled => "k8s.stevefan1999.tech/cilium-load-balancer-enabled",
            ContractKey::EgressPolicyEnabled => {
                "k8s.stevefan1999.tech/cilium-egress-gateway-policy-enabled"
            }
            ContractKey::LoadBalancerSharingKey => {
                "k8s.stevefan1999.tech/cilium-load-balancer-sharing-key"
            }
            ContractKey::LoadBalancerSharingCrossNamespace => {
                "k8s.stevefan1999.tech/cilium-load-balancer-sharing-cross-namespace"
            }
            ContractKey::LoadBalancerIps => "k8s.stevefan1999.tech/cilium-load-balancer-ips",
            ContractKey::LoadBalancerManaged => "k8s.stevefan1999.tech/cilium-load-balancer-managed",
            ContractKey::IsManaged => "k8s.stevefan1999.tech/is-managed",
            ContractKey::GameServerRefNamespace => "k8s.stevefan1999.tech/game-server-ref-namespace",
            ContractKey::GameServerRefName => "k8s.stevefan1999.tech/game-server-ref-name",
            ContractKey::ServiceRefNamespace => "k8s.stevefan1999.tech/service-ref-namespace",
            ContractKey::ServiceRefName => "k8s.stevefan1999.tech/service-ref-name",
            ContractKey::LegacyGameServerRef => "k8s.stevefan1999.tech/game-server-ref",
            ContractKey::LegacyServiceRef => "k8s.stevefan1999.tech/service-ref",
            ContractKey::EgressPolicyFinalizer => {
                "k8s.stevefan1999.tech/cilium-egress-gateway-policy-finalizer"
            }
        }
    }

    /// Value assumed when the key is absent
    pub const fn default_value(self) -> Option<&'static str> {
        match self {
            ContractKey::LoadBalancerEnabled
            | ContractKey::EgressPolicyEnabled
            | ContractKey::LoadBalancerManaged
            | ContractKey::IsManaged => Some(FALSE),
            ContractKey::LoadBalancerSharingKey => Some(" "),
            ContractKey::LoadBalancerSharingCrossNamespace => Some("*"),
            _ => None,
        }
    }

    /// Look the key up in a label or annotation map, falling back to the default
    pub fn lookup(self, map: Option<&BTreeMap<String, String>>) -> Option<&str> {
        map.and_then(|m| m.get(self.key()))
            .map(String::as_str)
            .or(self.default_value())
    }

    /// Read the key as a boolean flag. Anything that does not parse is `false`.
    pub fn is_set(self, map: Option<&BTreeMap<String, String>>) -> bool {
        parse_flag(map.and_then(|m| m.get(self.key())).map(String::as_str))
    }

    /// Equality selector term for this key, e.g. `k8s.../is-managed=true`
    pub fn equals(self, value: &str) -> String {
        format!("{}={}", self.key(), value)
    }
}

impl std::fmt::Display for ContractKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// String encoding of `true` on the wire
pub const TRUE: &str = "true";
/// String encoding of `false` on the wire
pub const FALSE: &str = "false";

/// Parse a string-encoded boolean, case-insensitive, surrounding whitespace ignored
pub fn parse_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case(TRUE))
        .unwrap_or(false)
}

// Keys owned by other systems

/// Pod label Agones puts on every GameServer pod
pub const GAMESERVER_POD_LABEL: &str = "agones.dev/gameserver";
/// Namespace label Cilium derives for every endpoint
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
/// Well-known node hostname label
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
/// k0s annotation listing externally advertised node IPs, comma separated
pub const NODE_EXTERNAL_IP_ANNOTATION: &str = "k0sproject.io/node-ip-external";

pub const LBIPAM_SHARING_KEY: &str = "lbipam.cilium.io/sharing-key";
pub const LBIPAM_SHARING_CROSS_NAMESPACE: &str = "lbipam.cilium.io/sharing-cross-namespace";
pub const LBIPAM_IPS: &str = "lbipam.cilium.io/ips";

/// Prefix of every generated resource name
pub const GENERATED_PREFIX: &str = "agones-generated";
/// Egress destination matching all traffic
pub const CATCH_ALL_CIDR: &str = "0.0.0.0/0";
