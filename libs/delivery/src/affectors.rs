//! # Affectors
//!
//! One handler per outbound message type, fired when the writer task has put
//! the full frame on the wire. Receptors react to what the peer said;
//! affectors advance records on what we have provably sent — a DELIVERED
//! state means the frame left this process, not that anyone read it.

use crate::context::DeliveryContext;
use crate::error::DeliveryResult;
use crate::por::ProofOfRelay;
use crate::receptors::{connector_for_link, missing_record, relay::retire_pod};
use crate::state::{DeliveryState, PoaState};
use nceph_codec::{Message, RelayAckData};
use nceph_network::{ConnectionState, DeliveryLink};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cerebrum: AUTHENTICATE challenge is on the wire.
pub async fn authenticate_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    _link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = message.id().to_string();
    ctx.poa_cache
        .update(&key, |poa| {
            poa.advance_state(PoaState::Authenticate);
            poa.authenticate.record_now();
        })
        .ok_or_else(|| missing_record("POA", &key))?;
    Ok(())
}

/// Cerebrum: READY is on the wire; the peer is authenticated, so this
/// connection may now carry event traffic.
pub async fn ready_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = message.id().to_string();
    ctx.poa_cache
        .update(&key, |poa| {
            poa.advance_state(PoaState::Ready);
            poa.ready.record_now();
        })
        .ok_or_else(|| missing_record("POA", &key))?;
    link.set_connection_state(ConnectionState::Ready);
    Ok(())
}

/// Cerebrum: AUTH_ERROR is on the wire; the handshake is over and the
/// connection has no future.
pub async fn auth_error_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = message.id().to_string();
    ctx.poa_cache.update(&key, |poa| {
        poa.advance_state(PoaState::AuthError);
    });
    ctx.poa_cache.remove(&key);
    link.set_connection_state(ConnectionState::AuthFailed);
    link.teardown().await;
    warn!(peer = %link.peer(), message_id = %key, "rejected connection torn down");
    Ok(())
}

/// Producer: PUBLISH_EVENT is on the wire.
pub async fn publish_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    _link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = message.id().to_string();
    ctx.pod_cache
        .update(&key, |pod| {
            pod.advance_state(DeliveryState::Delivered);
            pod.event_write.record_now();
        })
        .ok_or_else(|| missing_record("POD", &key))?;
    Ok(())
}

/// Cerebrum: NCEPH_EVENT_ACK is on the wire.
pub async fn ack_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    _link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = message.id().to_string();
    ctx.pod_cache
        .update(&key, |pod| {
            pod.advance_state(DeliveryState::Delivered);
            pod.ack_write.record_now();
        })
        .ok_or_else(|| missing_record("POD", &key))?;
    Ok(())
}

/// Producer: ACK_RECEIVED (3-way) is on the wire.
pub async fn threeway_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    _link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = message.id().to_string();
    ctx.pod_cache
        .update(&key, |pod| {
            pod.advance_state(DeliveryState::AckReceived);
            pod.threeway_write.record_now();
        })
        .ok_or_else(|| missing_record("POD", &key))?;
    Ok(())
}

/// Cerebrum: DELETE_POD is on the wire; the producer leg is finished. With
/// no subscribers there is no fan-out to wait for, so the record retires
/// immediately.
pub async fn delete_pod_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = message.id().to_string();
    let subscriber_count = ctx
        .pod_cache
        .update(&key, |pod| {
            pod.advance_state(DeliveryState::Finished);
            pod.subscriber_count
        })
        .ok_or_else(|| missing_record("POD", &key))?;
    if subscriber_count == 0 {
        retire_pod(ctx, &key).await?;
        if let Ok(connector) = connector_for_link(ctx, link) {
            connector.clear_registers_for(message.id());
        }
    }
    Ok(())
}

/// Cerebrum: RELAY_EVENT is on the wire toward one subscriber. The frame
/// body has no consumer identity, so the POR is located through the POD's
/// fan-out keys by the link's node.
pub async fn relay_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let id = message.id().to_string();
    let Some(node) = link.node_id() else {
        debug!(message_id = %id, "RELAY_EVENT written on a link with no node identity");
        return Ok(());
    };
    let por_keys = ctx
        .pod_cache
        .update(&id, |pod| pod.por_keys.clone())
        .ok_or_else(|| missing_record("POD", &id))?;
    for key in por_keys {
        ctx.por_cache.update(&key, |por| {
            if por.consumer_node == node {
                por.advance_state(DeliveryState::Delivered);
                por.relay_write.record_now();
            }
        });
    }
    Ok(())
}

/// Consumer: RELAYED_EVENT_ACK is on the wire.
pub async fn relay_ack_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    _link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = ProofOfRelay::cache_key(&message.id().to_string(), ctx.local_port());
    ctx.por_cache
        .update(&key, |por| {
            por.advance_state(DeliveryState::Acknowledged);
            por.ack_write.record_now();
        })
        .ok_or_else(|| missing_record("POR", &key))?;
    Ok(())
}

/// Cerebrum: RELAY_ACK_RECEIVED (3-way) is on the wire toward a subscriber.
pub async fn relay_threeway_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    _link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let data: RelayAckData = message.decode_data("RELAY_ACK_RECEIVED")?;
    let key = ProofOfRelay::cache_key(&message.id().to_string(), data.consumer_port);
    ctx.por_cache
        .update(&key, |por| {
            por.advance_state(DeliveryState::AckReceived);
            por.threeway_write.record_now();
        })
        .ok_or_else(|| missing_record("POR", &key))?;
    Ok(())
}

/// Consumer: POR_DELETED is on the wire; this message id is fully retired
/// here, so its duplicate-suppression marks can be forgotten.
pub async fn por_deleted_sent(
    ctx: &Arc<DeliveryContext>,
    message: &Message,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    if let Ok(connector) = connector_for_link(ctx, link) {
        connector.clear_registers_for(message.id());
    }
    Ok(())
}
