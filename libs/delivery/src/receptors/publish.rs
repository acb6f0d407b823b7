//! # Publish Flow Receptors (Proof of Publish)
//!
//! ```text
//! producer                         cerebrum
//!   | ------ PUBLISH_EVENT ----->  |  create POD, fan out PORs
//!   | <---- NCEPH_EVENT_ACK -----  |
//!   | ------ ACK_RECEIVED ------>  |  (3-way ack)
//!   | <------ DELETE_POD --------  |
//!   delete local POD
//! ```
//!
//! Both sides keep their own POD; every step is idempotent under replay via
//! the monotonic state rule and the idempotent record creation.

use crate::context::DeliveryContext;
use crate::error::DeliveryResult;
use crate::pod::ProofOfPublish;
use crate::por::ProofOfRelay;
use crate::receptors::{connector_for_link, connector_for_node, missing_record};
use crate::state::DeliveryState;
use crate::store::archive_record;
use nceph_codec::{AssembledMessage, EventData, Message, MessageId, MessageType};
use nceph_network::{Connector, DeliveryLink, SendContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Producer entry point: create the local POD and hand the event to the
/// connector. A build/dispatch failure rolls the attempt counter back so the
/// next monitor pass retries.
pub async fn emit(
    ctx: &Arc<DeliveryContext>,
    connector: &Arc<Connector>,
    event: EventData,
) -> DeliveryResult<MessageId> {
    let id = ctx.next_message_id();
    let key = id.to_string();
    ctx.pod_cache.create(key.clone(), || {
        let mut pod = ProofOfPublish::new(key.clone(), event.clone());
        pod.event_attempts.increment();
        pod
    });

    let send = || -> DeliveryResult<()> {
        let message = Message::new(
            MessageType::PublishEvent,
            id,
            serde_json::to_vec(&event)?,
        )?;
        connector.dispatch(message, None, SendContext::Initial)?;
        Ok(())
    };
    if let Err(e) = send() {
        ctx.pod_cache.update(&key, |pod| pod.event_attempts.rollback());
        return Err(e);
    }
    info!(message_id = %id, event_type = event.event_type, "event emitted");
    Ok(id)
}

/// Cerebrum: PUBLISH_EVENT received. Create the relay-side POD, acknowledge,
/// and begin fan-out: one POR and one RELAY_EVENT per subscriber.
pub async fn publish_event(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let event: EventData = message.decode_data("PUBLISH_EVENT")?;
    let key = message.id().to_string();

    let subscriptions = ctx.cluster.subscribers_for(event.event_type);
    let created = ctx.pod_cache.create(key.clone(), || {
        let mut pod = ProofOfPublish::new(key.clone(), event.clone());
        pod.event_read.record(assembled.read_start, assembled.read_end);
        pod.subscriber_count = subscriptions.len() as u32;
        pod
    });
    if created {
        // Acknowledge receipt. State advances in the ack affector.
        ctx.pod_cache.update(&key, |pod| pod.ack_attempts.increment());
        let ack = Message::new(MessageType::NcephEventAck, message.id(), Vec::new())?;
        if let Err(e) = link.send(ack, SendContext::Initial).await {
            ctx.pod_cache.update(&key, |pod| pod.ack_attempts.rollback());
            return Err(e.into());
        }
    } else {
        // The registers would suppress a second ack anyway; counting an
        // attempt that never leaves drifts the counter. The monitor
        // re-drives the ack if the first one was lost.
        debug!(message_id = %key, "duplicate PUBLISH_EVENT, record already exists");
    }

    // Fan out to every subscriber of this event type.
    for subscription in &subscriptions {
        let por_key = ProofOfRelay::cache_key(&key, subscription.port);
        ctx.por_cache.create(por_key.clone(), || {
            let mut por = ProofOfRelay::new(
                key.clone(),
                subscription.port,
                subscription.node_id,
                event.clone(),
            );
            por.relay_attempts.increment();
            por
        });
        ctx.pod_cache.update(&key, |pod| {
            if !pod.por_keys.contains(&por_key) {
                pod.por_keys.push(por_key.clone());
                pod.change_log.mark("por_keys");
            }
        });

        let relay = Message::new(
            MessageType::RelayEvent,
            message.id(),
            serde_json::to_vec(&event)?,
        )?;
        match connector_for_node(ctx, subscription.node_id, link.local_port()) {
            Some(connector) => {
                if let Err(e) =
                    connector.dispatch(relay, Some(subscription.node_id), SendContext::Initial)
                {
                    warn!(message_id = %key, node = subscription.node_id, error = %e,
                          "fan-out dispatch failed, monitor will retry");
                    ctx.por_cache
                        .update(&por_key, |por| por.relay_attempts.rollback());
                }
            }
            None => {
                warn!(message_id = %key, node = subscription.node_id,
                      "no connector serves subscriber, monitor will retry");
                ctx.por_cache
                    .update(&por_key, |por| por.relay_attempts.rollback());
            }
        }
    }
    Ok(())
}

/// Producer: NCEPH_EVENT_ACK received. Record latency, send the 3-way ack.
pub async fn event_ack(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let key = message.id().to_string();

    ctx.pod_cache
        .update(&key, |pod| {
            pod.advance_state(DeliveryState::Acknowledged);
            pod.ack_read.record(assembled.read_start, assembled.read_end);
            pod.network_latency_ms =
                Some((assembled.read_end - pod.event.created_on).num_milliseconds());
            pod.threeway_attempts.increment();
        })
        .ok_or_else(|| missing_record("POD", &key))?;

    let reply = Message::new(MessageType::AckReceived, message.id(), Vec::new())?;
    if let Err(e) = link.send(reply, SendContext::Initial).await {
        ctx.pod_cache.update(&key, |pod| pod.threeway_attempts.rollback());
        return Err(e.into());
    }
    Ok(())
}

/// Cerebrum: ACK_RECEIVED (3-way) received. The producer has seen our ack;
/// tell it to delete its record.
pub async fn ack_received(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let key = message.id().to_string();

    ctx.pod_cache
        .update(&key, |pod| {
            pod.advance_state(DeliveryState::AckReceived);
            pod.threeway_read
                .record(assembled.read_start, assembled.read_end);
        })
        .ok_or_else(|| missing_record("POD", &key))?;

    let reply = Message::new(MessageType::DeletePod, message.id(), Vec::new())?;
    link.send(reply, SendContext::Initial).await?;
    Ok(())
}

/// Producer: DELETE_POD received. The publish leg is fully acknowledged;
/// archive and drop the local record.
pub async fn delete_pod(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let key = message.id().to_string();

    let mut pod = ctx
        .pod_cache
        .update(&key, |pod| {
            pod.advance_state(DeliveryState::Finished);
            pod.clone()
        })
        .ok_or_else(|| missing_record("POD", &key))?;
    pod.archived = true;

    let (partition, sort) = pod.archive_key();
    if let Err(e) = archive_record(ctx.archive.as_ref(), &partition, &sort, &pod).await {
        // Keep the record; the monitor archives terminal PODs on its pass.
        warn!(message_id = %key, error = %e, "archive failed, deferring eviction");
        return Err(e);
    }
    ctx.pod_cache.remove(&key);
    if let Ok(connector) = connector_for_link(ctx, link) {
        connector.clear_registers_for(message.id());
    }
    info!(message_id = %key, "publish delivery finished, local POD deleted");
    Ok(())
}
