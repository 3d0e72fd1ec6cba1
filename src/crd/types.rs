//! Shared types for the watched resource kinds
//!
//! These types are used across the CRD definitions and controller logic.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Transport protocol of a GameServer port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
    /// Agones shorthand for exposing the same port over both TCP and UDP
    TcpUdp,
}

impl PortProtocol {
    /// Parse the Agones protocol string. Agones defaults an empty protocol to UDP.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            None | Some("") | Some("UDP") => Some(PortProtocol::Udp),
            Some("TCP") => Some(PortProtocol::Tcp),
            Some("TCPUDP") => Some(PortProtocol::TcpUdp),
            Some(_) => None,
        }
    }
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "TCP"),
            PortProtocol::Udp => write!(f, "UDP"),
            PortProtocol::TcpUdp => write!(f, "TCPUDP"),
        }
    }
}

/// Address type strings as used by core/v1 NodeAddress and Agones status addresses
pub mod address_type {
    pub const LOAD_BALANCER: &str = "LoadBalancer";
    pub const EXTERNAL_IP: &str = "ExternalIP";
    pub const INTERNAL_IP: &str = "InternalIP";
}

/// One entry of a GameServer's published address list
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GameServerAddress {
    /// Address kind, e.g. `ExternalIP` or `LoadBalancer`
    #[serde(rename = "type")]
    pub type_: String,

    pub address: String,
}

impl GameServerAddress {
    pub fn new(type_: &str, address: &str) -> Self {
        Self {
            type_: type_.to_string(),
            address: address.to_string(),
        }
    }

    pub fn load_balancer(address: &str) -> Self {
        Self::new(address_type::LOAD_BALANCER, address)
    }

    pub fn is_load_balancer(&self) -> bool {
        self.type_ == address_type::LOAD_BALANCER
    }
}

/// Label selector restricted to `matchLabels`, the only form generated policies use
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MatchLabels {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl MatchLabels {
    pub fn single(key: &str, value: &str) -> Self {
        Self {
            match_labels: BTreeMap::from([(key.to_string(), value.to_string())]),
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.match_labels.insert(key.to_string(), value.to_string());
        self
    }
}
