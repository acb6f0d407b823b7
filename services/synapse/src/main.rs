//! # Synapse — nceph producer/consumer node
//!
//! Connects to the cerebrum, authenticates, and then publishes and/or
//! consumes application events. An embedding application would register its
//! own [`AppReceptor`] implementations; this binary registers a logging
//! receptor per configured subscription so a node is observable end to end,
//! and can emit a one-off event from the command line.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use nceph_codec::EventData;
use nceph_config::NcephConfig;
use nceph_delivery::receptors::{handshake, publish};
use nceph_delivery::{
    AppReceptor, DeliveryContext, DeliveryDispatcher, InMemoryDocumentStore, Monitor, NodeRole,
};
use nceph_network::{Connector, ConnectorCluster, DeliveryLink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "synapse", about = "nceph producer/consumer node")]
struct Args {
    /// Path to the node's TOML configuration.
    #[arg(short, long, default_value = "synapse.toml")]
    config: PathBuf,

    /// Publish one event of this type after the handshake completes.
    #[arg(long)]
    emit_type: Option<u16>,

    /// JSON payload for `--emit-type`.
    #[arg(long, default_value = "{}")]
    emit_payload: String,
}

/// Default consumer-side handler: logs every relayed event it receives.
struct LoggingReceptor;

#[async_trait]
impl AppReceptor for LoggingReceptor {
    fn name(&self) -> &str {
        "event-logger"
    }

    async fn execute(&self, event: &EventData) -> anyhow::Result<()> {
        info!(
            event_type = event.event_type,
            producer_port = event.producer_port,
            payload = %event.payload,
            "event received"
        );
        Ok(())
    }
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
        NodeRole::Synapse,
        config.clone(),
        cluster.clone(),
        Arc::new(InMemoryDocumentStore::new()),
    );
    let dispatcher = DeliveryDispatcher::new(ctx.clone());

    let connector = Connector::new(config.network.port, config.network.clone(), dispatcher);
    cluster.register(connector.clone());
    // Events this node consumes; the handler is a stand-in for application
    // business logic.
    for subscription in &config.subscriptions {
        ctx.app_receptors
            .register(subscription.event_type, Arc::new(LoggingReceptor));
    }

    let connection = connector.open_connection().await?;
    let link: Arc<dyn DeliveryLink> = connection;
    handshake::initiate(&ctx, &link).await?;

    let monitor_task = Monitor::new(ctx.clone(), connector.clone()).spawn();
    info!(
        node = %config.node.name,
        cerebrum = ?config.network.cerebrum_host,
        "synapse up"
    );

    if let Some(event_type) = args.emit_type {
        // Give the handshake a moment; an early emit would just park on the
        // relay queue until the monitor drains it anyway.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let event = EventData {
            event_type,
            producer_port: config.network.port,
            payload: serde_json::from_str(&args.emit_payload)?,
            created_on: Utc::now(),
        };
        let id = publish::emit(&ctx, &connector, event).await?;
        info!(message_id = %id, event_type, "event emitted from command line");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    monitor_task.abort();
    for conn in connector.connections() {
        conn.close().await;
    }
    Ok(())
}
