//! Managed Service reconciliation
//!
//! Publishes the allocated ingress IPs of a generated LoadBalancer Service
//! as `LoadBalancer` addresses on the owning GameServer, and hands Services
//! of egress enabled GameServers to policy synthesis.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::egress::synthesize_policy;
use super::finalizers::bounded;
use super::resources::{ingress_ips, is_load_balancer, is_managed_service, owning_game_server};
use super::retry::{read_modify_write, Transaction};
use super::tasks::SubTasks;
use super::{metrics, Context};
use crate::crd::GameServer;
use crate::error::Result;
use crate::store::ResourceStore;

/// Write the ingress IPs into the owning GameServer's address list
pub struct SyncAddresses<'a, S> {
    store: &'a S,
    namespace: Option<String>,
    game_server: String,
    ips: BTreeSet<String>,
}

impl<'a, S: ResourceStore> SyncAddresses<'a, S> {
    pub fn new(store: &'a S, namespace: Option<String>, game_server: String, ips: BTreeSet<String>) -> Self {
        Self {
            store,
            namespace,
            game_server,
            ips,
        }
    }
}

#[async_trait]
impl<'a, S: ResourceStore> Transaction for SyncAddresses<'a, S> {
    type Fetched = GameServer;
    /// Whether the GameServer was written
    type Output = bool;

    fn name(&self) -> &'static str {
        "sync-addresses"
    }

    async fn fetch(&self) -> Result<Option<GameServer>> {
        self.store
            .get(self.namespace.as_deref(), &self.game_server)
            .await
    }

    async fn transact(&self, fetched: Option<GameServer>) -> Result<bool> {
        let Some(mut gs) = fetched else {
            return Ok(false);
        };
        if !gs.replace_load_balancer_addresses(&self.ips) {
            debug!("GameServer {} already publishes {:?}", self.game_server, self.ips);
            return Ok(false);
        }
        self.store.update(&gs).await?;
        info!(
            "Published load balancer addresses {:?} on GameServer {}/{}",
            self.ips,
            self.namespace.as_deref().unwrap_or_default(),
            self.game_server
        );
        Ok(true)
    }
}

/// The main reconciliation function for managed Services
#[instrument(skip(svc, ctx), fields(name = %svc.name_any(), namespace = svc.namespace()))]
pub async fn reconcile<S: ResourceStore>(svc: Arc<Service>, ctx: Arc<Context<S>>) -> Result<Action> {
    metrics::record_reconcile("Service");
    let requeue = Action::requeue(ctx.settings.service_requeue);

    if !is_managed_service(&svc) || !is_load_balancer(&svc) {
        return Ok(requeue);
    }

    let ips = ingress_ips(&svc);
    if ips.is_empty() {
        debug!("Service {} has no ingress IP allocated yet", svc.name_any());
        return Ok(requeue);
    }

    let Some(owner) = owning_game_server(&svc) else {
        warn!(
            "Managed Service {}/{} has no owning GameServer",
            svc.namespace().unwrap_or_default(),
            svc.name_any()
        );
        return Ok(requeue);
    };

    let namespace = svc.namespace();
    let gs: Option<GameServer> = bounded(
        "get-game-server",
        ctx.settings.operation_timeout,
        ctx.store.get(namespace.as_deref(), &owner),
    )
    .await?;
    let Some(gs) = gs else {
        debug!("GameServer {} of Service {} is gone", owner, svc.name_any());
        return Ok(requeue);
    };

    let mut tasks = SubTasks::new(ctx.settings.operation_timeout);

    {
        let ctx = ctx.clone();
        let ips = ips.clone();
        tasks.spawn("sync-addresses", async move {
            let tx = SyncAddresses::new(&ctx.store, namespace, owner, ips);
            read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel)
                .await
                .map(|_| ())
        });
    }

    if gs.egress_policy_enabled() {
        let (svc, ctx) = (svc.clone(), ctx.clone());
        tasks.spawn("synthesize-policy", async move {
            synthesize_policy(&ctx, &svc, &ips).await.map(|_| ())
        });
    }

    tasks.join_bounded().await;
    Ok(requeue)
}
