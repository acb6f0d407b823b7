//! # Receptors
//!
//! One handler per inbound message type, fired when the assembler completes
//! a frame. Receptors mutate delivery records through the cache's
//! load→mutate→save protocol and reply on the link the frame arrived on;
//! every reply reuses the originating message id so both sides' records stay
//! keyed consistently across the three round trips.

pub mod flow;
pub mod handshake;
pub mod publish;
pub mod relay;

use crate::context::DeliveryContext;
use crate::error::{DeliveryError, DeliveryResult};
use nceph_network::{Connector, DeliveryLink};
use std::sync::Arc;
use tracing::warn;

/// Connector the given link belongs to.
pub(crate) fn connector_for_link(
    ctx: &DeliveryContext,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<Arc<Connector>> {
    ctx.cluster
        .connector(link.local_port())
        .ok_or(DeliveryError::NoConnector {
            port: link.local_port(),
        })
}

/// Connector a subscriber node is attached to; falls back to the connector
/// the triggering frame arrived on, so the message can at least park on its
/// relay queue targeted at the node.
pub(crate) fn connector_for_node(
    ctx: &DeliveryContext,
    node_id: u16,
    fallback_port: u16,
) -> Option<Arc<Connector>> {
    ctx.cluster
        .connectors()
        .into_iter()
        .find(|connector| connector.serves_node(node_id))
        .or_else(|| ctx.cluster.connector(fallback_port))
}

/// Record-not-found policy: log and abandon the step. There is no recovery
/// without the record; synthesizing one could double-deliver past the
/// idempotency guards.
pub(crate) fn missing_record(kind: &'static str, key: &str) -> DeliveryError {
    warn!(kind, key, "record not found, abandoning operation");
    DeliveryError::RecordNotFound {
        kind,
        key: key.to_string(),
    }
}
