//! Egress gateway policy synthesis
//!
//! For an egress enabled GameServer whose Service has an ingress IP, pin the
//! game server pods' outbound traffic to the node holding that IP.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use super::resources::{build_egress_policy, owning_game_server, policy_back_reference_selector};
use super::retry::{read_modify_write, Transaction};
use super::selector::select_egress_node;
use super::Context;
use crate::crd::{CiliumEgressGatewayPolicy, GameServer};
use crate::error::Result;
use crate::store::{LabelSelector, ResourceStore};

/// Result of [`SynthesizePolicy`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyOutcome {
    Created(String),
    AlreadyManaged,
    /// A policy we did not generate holds the name
    UnmanagedCollision,
    /// No node holds any of the ingress IPs
    NoCandidate,
}

/// Create the egress gateway policy for a GameServer and its Service unless one exists
pub struct SynthesizePolicy<'a, S> {
    store: &'a S,
    gs: &'a GameServer,
    service: &'a Service,
    ips: &'a BTreeSet<String>,
}

#[async_trait]
impl<'a, S: ResourceStore> Transaction for SynthesizePolicy<'a, S> {
    type Fetched = CiliumEgressGatewayPolicy;
    type Output = PolicyOutcome;

    fn name(&self) -> &'static str {
        "synthesize-policy"
    }

    fn admit_missing(&self) -> bool {
        true
    }

    /// The policy under the generated name, else any managed policy
    /// back-referencing the same GameServer and Service
    async fn fetch(&self) -> Result<Option<CiliumEgressGatewayPolicy>> {
        if let Some(existing) = self.store.get(None, &self.gs.egress_policy_name()).await? {
            return Ok(Some(existing));
        }
        let selector = policy_back_reference_selector(self.gs, self.service);
        let found = self.store.list(None, &selector).await?;
        Ok(found.into_iter().next())
    }

    async fn transact(&self, fetched: Option<CiliumEgressGatewayPolicy>) -> Result<PolicyOutcome> {
        if let Some(existing) = fetched {
            if existing.is_managed() {
                return Ok(PolicyOutcome::AlreadyManaged);
            }
            warn!(
                "Egress gateway policy {} exists but is not managed by this operator, not touching it",
                existing.name_any()
            );
            return Ok(PolicyOutcome::UnmanagedCollision);
        }

        let nodes: Vec<Node> = self.store.list(None, &LabelSelector::new()).await?;
        let Some(gateway) = select_egress_node(&nodes, self.ips) else {
            error!(
                "No node holds any of {:?} for Service {}/{}, cannot pin egress traffic",
                self.ips,
                self.service.namespace().unwrap_or_default(),
                self.service.name_any()
            );
            return Ok(PolicyOutcome::NoCandidate);
        };
        if self.ips.len() > 1 {
            warn!(
                "Service {} has {} ingress IPs, egress leaves through {} only",
                self.service.name_any(),
                self.ips.len(),
                gateway.address
            );
        }

        let policy = build_egress_policy(self.gs, self.service, &gateway);
        let created = self.store.create(&policy).await?;
        info!(
            "Created egress gateway policy {} via node {} ({} {})",
            created.name_any(),
            gateway.node_name,
            gateway.address_type,
            gateway.address
        );
        Ok(PolicyOutcome::Created(created.name_any()))
    }
}

/// Synthesize the policy for the GameServer owning `service`.
///
/// `None` when the owner is gone or no longer egress enabled, or when the
/// transaction made no progress this cycle.
pub async fn synthesize_policy<S: ResourceStore>(
    ctx: &Context<S>,
    service: &Service,
    ips: &BTreeSet<String>,
) -> Result<Option<PolicyOutcome>> {
    let Some(owner) = owning_game_server(service) else {
        return Ok(None);
    };
    let namespace = service.namespace();
    let Some(gs) = ctx.store.get::<GameServer>(namespace.as_deref(), &owner).await? else {
        debug!("GameServer {} of Service {} is gone", owner, service.name_any());
        return Ok(None);
    };
    if !gs.egress_policy_enabled() {
        debug!("GameServer {} no longer wants an egress gateway policy", owner);
        return Ok(None);
    }

    let tx = SynthesizePolicy {
        store: &ctx.store,
        gs: &gs,
        service,
        ips,
    };
    let outcome = read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel).await?;
    Ok(outcome.output())
}
