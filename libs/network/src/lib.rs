//! # nceph Connection Engine
//!
//! ## Purpose
//! Socket-facing half of the nceph network: connection lifecycle and I/O
//! loops, TLS wrapping, per-connection outbound queues with write-timeout
//! handling, load-balanced dispatch across the connections of a connector,
//! relay queueing, duplicate-send suppression and backpressure.
//!
//! ## Architecture Role
//! ```text
//! socket ⇄ Connection ⇄ Connector ⇄ ConnectorCluster
//!              │
//!              └─ MessageDispatcher (receptors/affectors, delivery layer)
//! ```
//!
//! Delivery semantics (POA/POD/POR state machines) live above this crate and
//! plug in through the [`dispatch`] traits; nothing here interprets message
//! bodies.

pub mod balancer;
pub mod cluster;
pub mod connection;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod tls;
pub mod transport;

pub use balancer::{Balanced, LoadBalancer, LoadKey};
pub use cluster::ConnectorCluster;
pub use connection::{Connection, ConnectionState};
pub use connector::{Connector, RegisterKey};
pub use dispatch::{DeliveryLink, MessageDispatcher, NullDispatcher, SendContext};
pub use error::{NetworkError, NetworkResult};
pub use transport::BoxedStream;
