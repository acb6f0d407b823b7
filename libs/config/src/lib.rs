//! # nceph Node Configuration
//!
//! TOML-backed configuration for synapse (producer/consumer) and cerebrum
//! (relay) nodes. Every tunable the engine consumes lives here: transmission
//! window, connection pool bounds, timeouts, buffer sizes, TLS switches and
//! the static event-type→subscriber map.
//!
//! ## Usage
//! ```toml
//! [node]
//! id = 123
//! name = "pricing-synapse"
//! credentials = "nceph-sentinel"
//!
//! [network]
//! port = 1000
//! write_timeout_ms = 2000
//!
//! [monitor]
//! interval_ms = 10000
//! transmission_window_ms = 30000
//!
//! [[subscriptions]]
//! event_type = 1001
//! node_id = 301
//! host = "127.0.0.1"
//! port = 1301
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Identity of this node on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Wire `source_id` stamped on every message this node originates.
    pub id: u16,
    pub name: String,
    /// Placeholder credential exchanged during the handshake.
    pub credentials: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: "nceph-node".to_string(),
            credentials: "nceph-sentinel".to_string(),
        }
    }
}

/// Connection engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listening port (cerebrum) or local connector port label (synapse).
    pub port: u16,
    /// Remote cerebrum endpoint, synapse side only.
    pub cerebrum_host: Option<String>,
    pub cerebrum_port: Option<u16>,
    /// Socket read buffer size.
    pub buffer_size: usize,
    /// Wall-clock budget for writing one message before the connection is
    /// deprioritized.
    pub write_timeout_ms: u64,
    /// Delay before a write-timed-out connection is re-armed.
    pub rearm_delay_ms: u64,
    /// Connections idle longer than this with zero in-flight work are torn
    /// down by the monitor.
    pub idle_timeout_ms: u64,
    /// Outbound pool bounds (client role).
    pub min_connections: usize,
    pub max_connections: usize,
    /// Relay-queue depth at which this node signals PAUSE to its peers, and
    /// the depth at which it signals RESUME again.
    pub pause_threshold: usize,
    pub resume_threshold: usize,
    pub tls: TlsConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 1000,
            cerebrum_host: None,
            cerebrum_port: None,
            buffer_size: 64 * 1024,
            write_timeout_ms: 2_000,
            rearm_delay_ms: 500,
            idle_timeout_ms: 300_000,
            min_connections: 1,
            max_connections: 8,
            pause_threshold: 10_000,
            resume_threshold: 1_000,
            tls: TlsConfig::default(),
        }
    }
}

/// TLS switches. Cryptographic details live with the transport; this is just
/// the on/off contract and key material locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Trust anchors for the client side; absent means platform roots.
    pub ca_path: Option<String>,
}

/// Monitor sweep tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Period between sweeps.
    pub interval_ms: u64,
    /// Age after which an in-flight delivery record is considered stalled.
    pub transmission_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            transmission_window_ms: 30_000,
        }
    }
}

/// One entry of the static event-type→subscriber map (cerebrum side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub event_type: u16,
    /// Subscribed node.
    pub node_id: u16,
    pub host: String,
    pub port: u16,
}

/// Full node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NcephConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl NcephConfig {
    /// Load a node configuration from a TOML file. Missing sections fall
    /// back to defaults; a missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        info!(
            node_id = config.node.id,
            node = %config.node.name,
            port = config.network.port,
            subscriptions = config.subscriptions.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.network.write_timeout_ms)
    }

    pub fn transmission_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.monitor.transmission_window_ms as i64)
    }
}
