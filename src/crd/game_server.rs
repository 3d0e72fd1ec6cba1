//! Agones GameServer resource, reduced to the fields this operator reads
//!
//! Everything else Agones stores on the object is carried through untouched
//! in the flattened `extra` maps, so a full replace never drops fields.

use std::collections::{BTreeMap, BTreeSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keys::{ContractKey, GENERATED_PREFIX};
use super::types::{GameServerAddress, PortProtocol};

/// A dedicated game server instance managed by Agones.
///
/// # Example
///
/// ```yaml
/// apiVersion: agones.dev/v1
/// kind: GameServer
/// metadata:
///   name: arena-7xk2p
///   namespace: games
///   annotations:
///     k8s.stevefan1999.tech/cilium-load-balancer-enabled: "true"
///     k8s.stevefan1999.tech/cilium-egress-gateway-policy-enabled: "true"
/// spec:
///   ports:
///     - name: game
///       containerPort: 7654
///       protocol: TCPUDP
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agones.dev",
    version = "v1",
    kind = "GameServer",
    namespaced,
    status = "GameServerStatus",
    shortname = "gs",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Ports the game server listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<GameServerPort>>,

    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: BTreeMap<String, Value>,
}

/// A single GameServer port definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    #[serde(default)]
    pub name: String,

    /// Port inside the game server container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,

    /// Port allocated on the node, when the port policy assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,

    /// `TCP`, `UDP` or `TCPUDP`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: BTreeMap<String, Value>,
}

impl GameServerPort {
    pub fn protocol(&self) -> Option<PortProtocol> {
        PortProtocol::parse(self.protocol.as_deref())
    }

    /// Externally exposed port: the host port when allocated, else the container port
    pub fn exposed_port(&self) -> Option<i32> {
        self.host_port.or(self.container_port)
    }
}

/// Status subresource written by Agones (and by this operator for LoadBalancer addresses)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<GameServerAddress>>,

    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: BTreeMap<String, Value>,
}

impl GameServer {
    /// Whether a LoadBalancer Service should be generated
    pub fn load_balancer_enabled(&self) -> bool {
        self.flag(ContractKey::LoadBalancerEnabled)
    }

    /// Whether an egress gateway policy should be generated
    pub fn egress_policy_enabled(&self) -> bool {
        self.flag(ContractKey::EgressPolicyEnabled)
    }

    /// Annotations take precedence, labels are honoured as a fallback
    fn flag(&self, key: ContractKey) -> bool {
        let annotations = self.metadata.annotations.as_ref();
        if annotations.is_some_and(|a| a.contains_key(key.key())) {
            return key.is_set(annotations);
        }
        key.is_set(self.metadata.labels.as_ref())
    }

    /// Annotation value for a pass-through key, falling back to the key's default
    pub fn contract_value(&self, key: ContractKey) -> Option<&str> {
        key.lookup(self.metadata.annotations.as_ref())
    }

    pub fn ports(&self) -> &[GameServerPort] {
        self.spec.ports.as_deref().unwrap_or_default()
    }

    pub fn has_ports(&self) -> bool {
        !self.ports().is_empty()
    }

    /// Deterministic name of the generated Service
    pub fn load_balancer_service_name(&self) -> String {
        format!("{}-{}", GENERATED_PREFIX, self.name_any())
    }

    /// Deterministic name of the generated egress gateway policy
    pub fn egress_policy_name(&self) -> String {
        format!(
            "{}-{}-{}",
            GENERATED_PREFIX,
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Currently published `LoadBalancer` addresses
    pub fn load_balancer_addresses(&self) -> BTreeSet<String> {
        self.status
            .iter()
            .flat_map(|s| s.addresses.iter().flatten())
            .filter(|a| a.is_load_balancer())
            .map(|a| a.address.clone())
            .collect()
    }

    /// Replace the `LoadBalancer` entries with `ips`, keeping every other address in order.
    ///
    /// Returns `false` without touching the object when the set is already current.
    pub fn replace_load_balancer_addresses(&mut self, ips: &BTreeSet<String>) -> bool {
        if self.load_balancer_addresses() == *ips {
            return false;
        }
        let status = self.status.get_or_insert_with(GameServerStatus::default);
        let mut addresses: Vec<GameServerAddress> = status
            .addresses
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !a.is_load_balancer())
            .collect();
        addresses.extend(ips.iter().map(|ip| GameServerAddress::load_balancer(ip)));
        status.addresses = Some(addresses);
        true
    }
}
