use clap::Parser;
use regis::Result;
use regis_node::{api, cli::Cli, HttpPeerTransport, RegistryNode, Supervisor};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        error!("Registry node failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;

    info!("Regis registry node starting...");
    info!("Node id: {}", config.node_id);
    info!("Bind address: {}", config.bind_addr);
    if config.peers.is_empty() {
        info!("No peers configured, running standalone");
    } else {
        info!("Peers: {}", config.peers.join(", "));
    }

    let transport = Arc::new(HttpPeerTransport::new(config.replication.peer_timeout)?);
    let bind_addr = config.bind_addr;
    let node = RegistryNode::new(config, transport)?;

    let supervisor = Supervisor::new();
    node.start(&supervisor);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Regis listening on {}", bind_addr);
    info!("API endpoints:");
    info!("  PUT    /instances/{{service}}/{{id}}        - register (body) or renew (empty)");
    info!("  DELETE /instances/{{service}}/{{id}}        - cancel");
    info!("  PUT    /instances/{{service}}/{{id}}/status - change status");
    info!("  GET    /registry                        - full registry");
    info!("  GET    /registry/delta?since=<seq>      - incremental delta");
    info!("  GET    /status                          - node status");

    let shutdown = supervisor.token();
    let served = axum::serve(listener, api::router(node))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
                () = shutdown.cancelled() => {}
            }
        })
        .await;

    supervisor.shutdown().await;
    served?;
    info!("Regis stopped");
    Ok(())
}
