//! Controller module for GameServer, Service and egress gateway policy reconciliation
//!
//! Three controllers share one [`Context`]: GameServers get their
//! LoadBalancer Service, managed Services feed their ingress IPs back into
//! GameServer status and synthesize egress gateway policies, and policies
//! delete themselves once they no longer describe the cluster.

mod egress;
pub mod egress_policy;
mod finalizers;
mod game_server;
pub mod metrics;
mod resources;
pub mod retry;
mod selector;
mod service;
mod tasks;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::OperatorConfig;
use crate::crd::keys::{ContractKey, TRUE};
use crate::crd::{CiliumEgressGatewayPolicy, GameServer};
use crate::error::{Error, Result};
use crate::store::KubeStore;

pub use egress_policy::{evaluate, Verdict};
pub use finalizers::EGRESS_POLICY_FINALIZER;
pub use retry::{read_modify_write, RetryPolicy, Transaction, TxOutcome};
pub use selector::{select_egress_node, EgressCandidate};

/// Timing knobs shared by the reconcilers
#[derive(Clone, Debug)]
pub struct Settings {
    /// Budget per sub-operation and for the bounded wait on them
    pub operation_timeout: Duration,
    pub gameserver_requeue: Duration,
    pub service_requeue: Duration,
    pub policy_requeue: Duration,
    pub retry: RetryPolicy,
}

impl Settings {
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout(),
            gameserver_requeue: config.gameserver_requeue(),
            service_requeue: config.service_requeue(),
            policy_requeue: config.policy_requeue(),
            retry: RetryPolicy::from_config(config),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&OperatorConfig::default())
    }
}

/// Shared state for the controllers
pub struct Context<S = KubeStore> {
    pub store: S,
    pub settings: Settings,
    /// Fired on shutdown; in-flight transactions stop retrying
    pub cancel: CancellationToken,
}

impl<S> Context<S> {
    pub fn new(store: S, settings: Settings, cancel: CancellationToken) -> Self {
        Self {
            store,
            settings,
            cancel,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(store: S) -> Self {
        Self::new(
            store,
            Settings {
                operation_timeout: Duration::from_secs(5),
                retry: RetryPolicy::immediate(Some(30)),
                ..Default::default()
            },
            CancellationToken::new(),
        )
    }
}

/// Fail early when a watched CRD is not installed
async fn verify_crd<K>(api: &Api<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + Debug,
{
    let kind = K::kind(&());
    match api.list(&Default::default()).await {
        Ok(_) => {
            info!("{} CRD is available", kind);
            Ok(())
        }
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            Err(Error::ConfigError(format!("{} CRD not installed", kind)))
        }
    }
}

/// Main entry point to start the controllers. Returns once all three have shut down.
pub async fn run_controllers(ctx: Arc<Context>) -> Result<()> {
    let client = ctx.store.client().clone();
    let game_servers: Api<GameServer> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let policies: Api<CiliumEgressGatewayPolicy> = Api::all(client.clone());

    verify_crd(&game_servers).await?;
    verify_crd(&policies).await?;

    info!("Starting GameServer, Service and CiliumEgressGatewayPolicy controllers");

    let managed_services =
        Config::default().labels(&ContractKey::LoadBalancerManaged.equals(TRUE));

    let game_server_controller = Controller::new(game_servers, Config::default())
        .owns::<Service>(services.clone(), managed_services.clone())
        .shutdown_on_signal()
        .run(game_server::reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled GameServer: {:?}", obj),
                Err(e) => error!("GameServer reconcile error: {:?}", e),
            }
        });

    let service_controller = Controller::new(services, managed_services)
        .shutdown_on_signal()
        .run(service::reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled Service: {:?}", obj),
                Err(e) => error!("Service reconcile error: {:?}", e),
            }
        });

    // Unfiltered so policies carrying only the legacy annotations are still seen
    let policy_controller = Controller::new(policies, Config::default())
        .shutdown_on_signal()
        .run(egress_policy::reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled CiliumEgressGatewayPolicy: {:?}", obj),
                Err(e) => error!("CiliumEgressGatewayPolicy reconcile error: {:?}", e),
            }
        });

    tokio::join!(game_server_controller, service_controller, policy_controller);
    ctx.cancel.cancel();
    info!("Controllers stopped");
    Ok(())
}

/// Error policy shared by the three controllers
fn error_policy<K, S>(obj: Arc<K>, error: &Error, _ctx: Arc<Context<S>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    error!(
        "Reconciliation error for {} {}: {:?}",
        K::kind(&()),
        obj.name_any(),
        error
    );

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
