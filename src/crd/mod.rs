//! Resource kinds the operator watches and writes
//!
//! GameServer and CiliumEgressGatewayPolicy are third-party CRDs; only the
//! fields the operator needs are modelled. Core kinds come from k8s-openapi.

mod egress_policy;
mod game_server;
pub mod keys;
mod types;

#[cfg(test)]
mod tests;

pub use egress_policy::{
    BackReference, CiliumEgressGatewayPolicy, CiliumEgressGatewayPolicySpec, EgressGateway,
    EgressRule,
};
pub use game_server::{GameServer, GameServerPort, GameServerSpec, GameServerStatus};
pub use keys::ContractKey;
pub use types::*;
