//! Egress gateway policy consistency checking
//!
//! A managed policy is only valid while the GameServer and Service it was
//! synthesized from still exist and still agree on the load balancer
//! addresses. Otherwise it deletes itself and the Service reconciler
//! synthesizes a fresh one from current data.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, instrument, warn};

use super::finalizers::{
    bounded, edit_finalizer, finalize_egress_policy, has_finalizer, is_deleting, DeletePolicy,
    FinalizerEdit,
};
use super::resources::ingress_ips;
use super::retry::read_modify_write;
use super::{metrics, Context};
use crate::crd::{BackReference, CiliumEgressGatewayPolicy, GameServer};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

/// Outcome of checking a managed policy against its owners
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Consistent,
    /// The referenced GameServer and/or Service no longer exist
    OwnersMissing { game_server: bool, service: bool },
    /// The GameServer publishes load balancer addresses the Service does not hold
    AddressMismatch {
        published: BTreeSet<String>,
        ingress: BTreeSet<String>,
    },
    /// The GameServer no longer asks for an egress gateway policy
    EgressDisabled,
}

impl Verdict {
    pub fn is_consistent(&self) -> bool {
        matches!(self, Verdict::Consistent)
    }

    /// Metric label for a self-deletion caused by this verdict
    pub fn reason(&self) -> &'static str {
        match self {
            Verdict::Consistent => "consistent",
            Verdict::OwnersMissing { .. } => "owners-missing",
            Verdict::AddressMismatch { .. } => "address-mismatch",
            Verdict::EgressDisabled => "egress-disabled",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Consistent => write!(f, "consistent"),
            Verdict::OwnersMissing {
                game_server,
                service,
            } => {
                let missing: Vec<&str> = [(*game_server, "GameServer"), (*service, "Service")]
                    .into_iter()
                    .filter_map(|(gone, kind)| gone.then_some(kind))
                    .collect();
                write!(f, "owners missing: {}", missing.join(", "))
            }
            Verdict::AddressMismatch { published, ingress } => write!(
                f,
                "GameServer publishes {:?} but Service ingress is {:?}",
                published, ingress
            ),
            Verdict::EgressDisabled => write!(f, "GameServer is no longer egress enabled"),
        }
    }
}

/// Check a managed policy given its resolved owners
pub fn evaluate(game_server: Option<&GameServer>, service: Option<&Service>) -> Verdict {
    let (Some(gs), Some(svc)) = (game_server, service) else {
        return Verdict::OwnersMissing {
            game_server: game_server.is_none(),
            service: service.is_none(),
        };
    };
    if !gs.egress_policy_enabled() {
        return Verdict::EgressDisabled;
    }
    let published = gs.load_balancer_addresses();
    let ingress = ingress_ips(svc);
    if !published.is_subset(&ingress) {
        return Verdict::AddressMismatch { published, ingress };
    }
    Verdict::Consistent
}

/// Resolve both back references. A missing or malformed one is a degraded lookup.
pub fn back_references(policy: &CiliumEgressGatewayPolicy) -> Result<(BackReference, BackReference)> {
    let missing = |key: crate::crd::ContractKey| Error::MissingReference {
        kind: "CiliumEgressGatewayPolicy".to_string(),
        name: policy.name_any(),
        key: key.key().to_string(),
    };
    let game_server = policy.game_server_ref().map_err(missing)?;
    let service = policy.service_ref().map_err(missing)?;
    Ok((game_server, service))
}

/// Fetch the owners and evaluate the policy without acting on the verdict
pub async fn check<S: ResourceStore>(
    store: &S,
    game_server: &BackReference,
    service: &BackReference,
) -> Result<Verdict> {
    let gs: Option<GameServer> = store
        .get(Some(game_server.namespace.as_str()), &game_server.name)
        .await?;
    let svc: Option<Service> = store.get(Some(service.namespace.as_str()), &service.name).await?;
    Ok(evaluate(gs.as_ref(), svc.as_ref()))
}

/// The main reconciliation function for egress gateway policies
#[instrument(skip(policy, ctx), fields(name = %policy.name_any()))]
pub async fn reconcile<S: ResourceStore>(
    policy: Arc<CiliumEgressGatewayPolicy>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    metrics::record_reconcile("CiliumEgressGatewayPolicy");

    if !policy.is_managed() {
        debug!("Ignoring unmanaged egress gateway policy {}", policy.name_any());
        return Ok(Action::await_change());
    }

    if is_deleting(policy.as_ref()) {
        if has_finalizer(policy.as_ref())
            && finalize_egress_policy(&ctx, &policy).await?
            && !edit_finalizer(&ctx, policy.as_ref(), FinalizerEdit::Detach)
                .await?
                .is_committed()
        {
            warn!(
                "Could not remove the finalizer from egress gateway policy {}, retrying",
                policy.name_any()
            );
            return Ok(Action::requeue(ctx.settings.policy_requeue));
        }
        return Ok(Action::await_change());
    }

    let requeue = Action::requeue(ctx.settings.policy_requeue);

    let (gs_ref, svc_ref) = match back_references(&policy) {
        Ok(refs) => refs,
        Err(e) => {
            warn!("Skipping consistency check: {}", e);
            return Ok(requeue);
        }
    };

    let verdict = bounded(
        "check-policy",
        ctx.settings.operation_timeout,
        check(&ctx.store, &gs_ref, &svc_ref),
    )
    .await?;
    if verdict.is_consistent() {
        return Ok(requeue);
    }

    error!(
        "Egress gateway policy {} ({} / {}) is inconsistent, self-destructing: {}",
        policy.name_any(),
        gs_ref,
        svc_ref,
        verdict
    );
    metrics::record_self_deletion(verdict.reason());

    let tx = DeletePolicy {
        store: &ctx.store,
        name: policy.name_any(),
        expected_uid: policy.uid(),
    };
    bounded(
        "delete-policy",
        ctx.settings.operation_timeout,
        read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel),
    )
    .await?;

    Ok(requeue)
}
