//! # Dispatch Seam
//!
//! Traits connecting the socket engine to the delivery layer. The engine
//! hands every fully assembled inbound message to a [`MessageDispatcher`]
//! ("receptor" side) and reports every completed write back to it
//! ("affector" side). Handlers talk back through a [`DeliveryLink`], which
//! abstracts "a live place to send messages" so delivery logic and tests
//! never touch sockets directly.

use crate::connection::ConnectionState;
use crate::error::NetworkResult;
use async_trait::async_trait;
use nceph_codec::{AssembledMessage, Message};
use std::sync::Arc;

/// Why a message is being enqueued. Monitor-originated re-sends bypass
/// duplicate suppression because the monitor has already verified the prior
/// attempt is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendContext {
    Initial,
    Monitor,
}

/// Receptor/affector entry points implemented by the delivery layer.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// A complete inbound message was assembled on `link`.
    async fn message_received(&self, assembled: AssembledMessage, link: Arc<dyn DeliveryLink>);

    /// `message` was fully written to the peer on `link`.
    async fn message_sent(&self, message: Message, link: Arc<dyn DeliveryLink>);
}

/// One live conduit to a peer, implemented by [`crate::connection::Connection`]
/// and by mock links in tests.
#[async_trait]
pub trait DeliveryLink: Send + Sync {
    /// Peer label for logging.
    fn peer(&self) -> String;

    /// Local connector port this link belongs to.
    fn local_port(&self) -> u16;

    fn connection_state(&self) -> ConnectionState;

    fn set_connection_state(&self, state: ConnectionState);

    /// Remote node id, known once the handshake has identified the peer.
    fn node_id(&self) -> Option<u16>;

    /// Record the remote node id and register this link in the connector's
    /// node-wise connection group for backpressure addressing.
    fn set_node_id(&self, node_id: u16);

    /// Queue a message for transmission on this link.
    async fn send(&self, message: Message, ctx: SendContext) -> NetworkResult<()>;

    /// Idempotent teardown: drain queued messages back to the connector and
    /// close the socket.
    async fn teardown(&self);
}

/// Dispatcher that drops everything; used when wiring up connections whose
/// handlers are not yet installed and in engine-level tests.
pub struct NullDispatcher;

#[async_trait]
impl MessageDispatcher for NullDispatcher {
    async fn message_received(&self, _assembled: AssembledMessage, _link: Arc<dyn DeliveryLink>) {}

    async fn message_sent(&self, _message: Message, _link: Arc<dyn DeliveryLink>) {}
}
