//! Flow-control receptors.
//!
//! PAUSE/RESUME frames are addressed node-wise: the overloaded peer asks us
//! to stop dispatching toward it, so every connection in that node's group
//! leaves the balancer until RESUME arrives. In-flight frames are unaffected.

use crate::context::DeliveryContext;
use crate::error::DeliveryResult;
use crate::receptors::connector_for_link;
use nceph_codec::AssembledMessage;
use nceph_network::DeliveryLink;
use std::sync::Arc;
use tracing::warn;

pub async fn pause_transmission(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let Some(node) = link.node_id() else {
        warn!(peer = %link.peer(), message_id = %assembled.message.id(),
              "PAUSE from a link with no node identity, ignoring");
        return Ok(());
    };
    connector_for_link(ctx, link)?.pause_node(node);
    Ok(())
}

pub async fn resume_transmission(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let Some(node) = link.node_id() else {
        warn!(peer = %link.peer(), message_id = %assembled.message.id(),
              "RESUME from a link with no node identity, ignoring");
        return Ok(());
    };
    connector_for_link(ctx, link)?.resume_node(node);
    Ok(())
}
