//! GameServer reconciliation
//!
//! Ensures the generated LoadBalancer Service exists for load-balancer
//! enabled GameServers and keeps the cleanup finalizer in step with the
//! egress flag. Deletion runs the finalizer cleanup first.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::finalizers::{
    edit_finalizer, finalize_game_server, has_finalizer, is_deleting, FinalizerEdit,
};
use super::resources::{build_service, is_managed_service};
use super::retry::{read_modify_write, Transaction};
use super::tasks::SubTasks;
use super::{metrics, Context};
use crate::crd::keys::{ContractKey, GAMESERVER_POD_LABEL, TRUE};
use crate::crd::GameServer;
use crate::error::Result;
use crate::store::{LabelSelector, ResourceStore};

/// Result of [`EnsureService`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceOutcome {
    Created(String),
    /// The generated Service is already there
    Existing,
    /// A Service we did not generate occupies the name or fronts the GameServer
    Unmanaged(String),
    /// No port could be translated, nothing to expose
    NoPorts,
}

/// Get-or-create the generated Service of a GameServer
pub struct EnsureService<'a, S> {
    store: &'a S,
    gs: &'a GameServer,
}

impl<'a, S: ResourceStore> EnsureService<'a, S> {
    pub fn new(store: &'a S, gs: &'a GameServer) -> Self {
        Self { store, gs }
    }
}

#[async_trait]
impl<'a, S: ResourceStore> Transaction for EnsureService<'a, S> {
    type Fetched = Service;
    type Output = ServiceOutcome;

    fn name(&self) -> &'static str {
        "ensure-service"
    }

    fn admit_missing(&self) -> bool {
        true
    }

    /// The Service under the generated name, else any hand-made Service
    /// fronting the same GameServer
    async fn fetch(&self) -> Result<Option<Service>> {
        let namespace = self.gs.namespace();
        let name = self.gs.load_balancer_service_name();
        if let Some(existing) = self.store.get::<Service>(namespace.as_deref(), &name).await? {
            return Ok(Some(existing));
        }
        let selector = LabelSelector::new()
            .equals(GAMESERVER_POD_LABEL, &self.gs.name_any())
            .not_equals(ContractKey::LoadBalancerManaged.key(), TRUE);
        let found = self.store.list::<Service>(namespace.as_deref(), &selector).await?;
        Ok(found.into_iter().next())
    }

    async fn transact(&self, fetched: Option<Service>) -> Result<ServiceOutcome> {
        if let Some(existing) = fetched {
            if is_managed_service(&existing) {
                return Ok(ServiceOutcome::Existing);
            }
            warn!(
                "Service {}/{} is not managed by this operator, not generating one for GameServer {}",
                existing.namespace().unwrap_or_default(),
                existing.name_any(),
                self.gs.name_any()
            );
            return Ok(ServiceOutcome::Unmanaged(existing.name_any()));
        }

        let Some(service) = build_service(self.gs) else {
            debug!(
                "GameServer {} has no exposable ports, not generating a Service",
                self.gs.name_any()
            );
            return Ok(ServiceOutcome::NoPorts);
        };
        let created = self.store.create(&service).await?;
        info!(
            "Created load balancer Service {}/{} for GameServer {}",
            created.namespace().unwrap_or_default(),
            created.name_any(),
            self.gs.name_any()
        );
        Ok(ServiceOutcome::Created(created.name_any()))
    }
}

/// Ensure the Service through the retry executor
pub async fn ensure_service<S: ResourceStore>(
    ctx: &Context<S>,
    gs: &GameServer,
) -> Result<Option<ServiceOutcome>> {
    let tx = EnsureService::new(&ctx.store, gs);
    let outcome = read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel).await?;
    Ok(outcome.output())
}

/// The main reconciliation function for GameServers
///
/// Called whenever a GameServer or its generated Service changes, and on
/// the re-queue timer.
#[instrument(skip(gs, ctx), fields(name = %gs.name_any(), namespace = gs.namespace()))]
pub async fn reconcile<S: ResourceStore>(gs: Arc<GameServer>, ctx: Arc<Context<S>>) -> Result<Action> {
    metrics::record_reconcile("GameServer");
    let requeue = Action::requeue(ctx.settings.gameserver_requeue);

    if is_deleting(gs.as_ref()) {
        return finalize(&gs, &ctx).await;
    }

    debug!(
        "Reconciling GameServer {}/{}",
        gs.namespace().unwrap_or_default(),
        gs.name_any()
    );

    let mut tasks = SubTasks::new(ctx.settings.operation_timeout);

    if gs.load_balancer_enabled() && gs.has_ports() {
        let (gs, ctx) = (gs.clone(), ctx.clone());
        tasks.spawn("ensure-service", async move {
            ensure_service(&ctx, &gs).await.map(|_| ())
        });
    }

    let wants_finalizer = gs.egress_policy_enabled() && gs.has_ports();
    if wants_finalizer != has_finalizer(gs.as_ref()) {
        let edit = if wants_finalizer {
            FinalizerEdit::Attach
        } else {
            FinalizerEdit::Detach
        };
        let (gs, ctx) = (gs.clone(), ctx.clone());
        tasks.spawn("edit-finalizer", async move {
            edit_finalizer(&ctx, gs.as_ref(), edit).await.map(|_| ())
        });
    }

    tasks.join_bounded().await;
    Ok(requeue)
}

/// Delete-intent path: clean up, then release the finalizer.
/// The finalizer stays until the cleanup has committed.
async fn finalize<S: ResourceStore>(gs: &GameServer, ctx: &Context<S>) -> Result<Action> {
    if !has_finalizer(gs) {
        return Ok(Action::await_change());
    }

    info!(
        "Finalizing GameServer {}/{}",
        gs.namespace().unwrap_or_default(),
        gs.name_any()
    );

    if !finalize_game_server(ctx, gs).await? {
        warn!(
            "Egress gateway policy cleanup for GameServer {} made no progress, keeping finalizer",
            gs.name_any()
        );
        return Ok(Action::requeue(ctx.settings.gameserver_requeue));
    }

    if !edit_finalizer(ctx, gs, FinalizerEdit::Detach).await?.is_committed() {
        warn!("Could not remove the finalizer from GameServer {}, retrying", gs.name_any());
        return Ok(Action::requeue(ctx.settings.gameserver_requeue));
    }
    Ok(Action::await_change())
}
