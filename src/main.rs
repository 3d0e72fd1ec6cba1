use std::sync::Arc;

use agones_lb_operator::config::OperatorConfig;
use agones_lb_operator::controller::{run_controllers, Context, Settings};
use agones_lb_operator::store::KubeStore;
use agones_lb_operator::{init_tracing, rest_api};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::load()?;
    init_tracing(&config.log_directive);
    info!(?config, "Starting Agones load balancer operator");

    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context::new(
        KubeStore::new(client),
        Settings::from_config(&config),
        cancel.clone(),
    ));

    let server = tokio::spawn(rest_api::run_server(config.http_port, cancel.clone()));

    let result = run_controllers(ctx).await;
    cancel.cancel();
    match server.await {
        Ok(Err(e)) => error!("REST API server error: {:?}", e),
        Err(e) => error!("REST API server task failed: {:?}", e),
        Ok(Ok(())) => {}
    }
    result?;
    info!("Operator stopped");
    Ok(())
}
