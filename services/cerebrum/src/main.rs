//! # Cerebrum — nceph central relay
//!
//! Accepts synapse connections on the configured port, authenticates them,
//! and relays every published event to its subscribers with at-least-once
//! delivery. All protocol behavior lives in `nceph-delivery`; this binary
//! just wires configuration, the connector and the monitor together.

use anyhow::Result;
use clap::Parser;
use nceph_config::NcephConfig;
use nceph_delivery::{
    DeliveryContext, DeliveryDispatcher, InMemoryDocumentStore, Monitor, NodeRole,
};
use nceph_network::{Connector, ConnectorCluster};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cerebrum", about = "nceph central relay node")]
struct Args {
    /// Path to the node's TOML configuration.
    #[arg(short, long, default_value = "cerebrum.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = NcephConfig::load(&args.config)?;

    let cluster = ConnectorCluster::new();
    let ctx = DeliveryContext::new(
        NodeRole::Cerebrum,
        config.clone(),
        cluster.clone(),
        Arc::new(InMemoryDocumentStore::new()),
    );
    let dispatcher = DeliveryDispatcher::new(ctx.clone());

    let connector = Connector::new(config.network.port, config.network.clone(), dispatcher);
    cluster.register(connector.clone());
    for subscription in &config.subscriptions {
        cluster.subscribe(subscription.clone());
    }

    let accept_task = connector.listen().await?;
    let monitor_task = Monitor::new(ctx, connector).spawn();
    info!(
        port = config.network.port,
        subscriptions = config.subscriptions.len(),
        "cerebrum up"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    accept_task.abort();
    monitor_task.abort();
    Ok(())
}
