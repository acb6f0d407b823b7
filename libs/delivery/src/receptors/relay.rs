//! # Relay Flow Receptors (Proof of Relay)
//!
//! ```text
//! cerebrum                         consumer
//!   | ------- RELAY_EVENT ------>  |  create POR, run app receptor
//!   | <---- RELAYED_EVENT_ACK ---  |  (ack sent whether the handler
//!   | ---- RELAY_ACK_RECEIVED -->  |   succeeded or not)
//!   | <------ POR_DELETED -------  |  archive + delete local POR
//!   POR finished; POD folds toward FULLY_RELAYED
//! ```
//!
//! Relay-leg acks carry [`RelayAckData`] so the cerebrum can address the
//! right per-subscriber record: one message id fans out to many PORs, keyed
//! by consumer port.

use crate::context::DeliveryContext;
use crate::error::{DeliveryError, DeliveryResult};
use crate::por::ProofOfRelay;
use crate::receptors::{connector_for_link, missing_record};
use crate::state::DeliveryState;
use crate::store::archive_record;
use chrono::Utc;
use nceph_codec::{AssembledMessage, EventData, Message, MessageType, RelayAckData};
use nceph_network::{DeliveryLink, SendContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Run the registered application receptor for an event and record the
/// outcome on the POR. The outcome never blocks the protocol: the ack goes
/// out either way and a failure is retried on the next 3-way cycle.
async fn run_app_receptor(ctx: &Arc<DeliveryContext>, key: &str, event: &EventData) {
    let Some(receptor) = ctx.app_receptors.resolve(event.event_type) else {
        warn!(key, event_type = event.event_type, "no application receptor registered");
        ctx.por_cache.update(key, |por| {
            por.record_app_outcome(
                "<unregistered>".to_string(),
                0,
                Some(
                    DeliveryError::NoAppReceptor {
                        event_type: event.event_type,
                    }
                    .to_string(),
                ),
            );
        });
        return;
    };

    let started = Utc::now();
    let outcome = receptor.execute(event).await;
    let duration_ms = (Utc::now() - started).num_milliseconds();
    let error = outcome.err().map(|e| e.to_string());
    if let Some(ref message) = error {
        warn!(key, receptor = receptor.name(), error = %message, "application receptor failed");
    } else {
        debug!(key, receptor = receptor.name(), duration_ms, "application receptor completed");
    }
    ctx.por_cache.update(key, |por| {
        por.record_app_outcome(receptor.name().to_string(), duration_ms, error);
    });
}

/// Consumer: RELAY_EVENT received. Create the local POR, invoke business
/// logic, acknowledge.
pub async fn relay_event(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let event: EventData = message.decode_data("RELAY_EVENT")?;
    let id = message.id().to_string();
    let consumer_port = ctx.local_port();
    let key = ProofOfRelay::cache_key(&id, consumer_port);

    let created = ctx.por_cache.create(key.clone(), || {
        let mut por = ProofOfRelay::new(id.clone(), consumer_port, ctx.node_id(), event.clone());
        por.relay_read.record(assembled.read_start, assembled.read_end);
        por
    });
    if created {
        run_app_receptor(ctx, &key, &event).await;

        // Acknowledge regardless of the handler outcome; a failed handler is
        // retried once the cerebrum's 3-way ack comes back.
        ctx.por_cache.update(&key, |por| por.ack_attempts.increment());
        let ack = Message::new(
            MessageType::RelayedEventAck,
            message.id(),
            serde_json::to_vec(&RelayAckData { consumer_port })?,
        )?;
        if let Err(e) = link.send(ack, SendContext::Initial).await {
            ctx.por_cache.update(&key, |por| por.ack_attempts.rollback());
            return Err(e.into());
        }
    } else {
        // Suppressed by the registers anyway; the monitor re-drives the ack
        // if the first one was lost.
        debug!(key, "duplicate RELAY_EVENT, record already exists");
    }
    Ok(())
}

/// Cerebrum: RELAYED_EVENT_ACK received. Advance the subscriber's POR and
/// send the 3-way ack, echoing the consumer port so both sides stay keyed.
pub async fn relayed_event_ack(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let data: RelayAckData = message.decode_data("RELAYED_EVENT_ACK")?;
    let key = ProofOfRelay::cache_key(&message.id().to_string(), data.consumer_port);

    ctx.por_cache
        .update(&key, |por| {
            por.advance_state(DeliveryState::Acknowledged);
            por.ack_read.record(assembled.read_start, assembled.read_end);
            por.threeway_attempts.increment();
        })
        .ok_or_else(|| missing_record("POR", &key))?;

    let reply = Message::new(
        MessageType::RelayAckReceived,
        message.id(),
        serde_json::to_vec(&data)?,
    )?;
    if let Err(e) = link.send(reply, SendContext::Initial).await {
        ctx.por_cache.update(&key, |por| por.threeway_attempts.rollback());
        return Err(e.into());
    }
    Ok(())
}

/// Consumer: RELAY_ACK_RECEIVED (3-way) received. If the application
/// receptor failed on delivery it gets one retry now; the POR is archived
/// and deleted only once the handler has succeeded.
pub async fn relay_ack_received(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let id = message.id().to_string();
    let key = ProofOfRelay::cache_key(&id, ctx.local_port());

    let (event, failed) = ctx
        .por_cache
        .update(&key, |por| {
            por.advance_state(DeliveryState::AckReceived);
            por.threeway_read
                .record(assembled.read_start, assembled.read_end);
            (por.event.clone(), por.app_receptor.failed)
        })
        .ok_or_else(|| missing_record("POR", &key))?;

    if failed {
        info!(key, "retrying failed application receptor before record deletion");
        run_app_receptor(ctx, &key, &event).await;
        let still_failed = ctx
            .por_cache
            .get(&key)
            .is_some_and(|por| por.app_receptor.failed);
        if still_failed {
            warn!(key, "application receptor still failing, keeping record for next cycle");
            return Ok(());
        }
    }

    let mut por = ctx
        .por_cache
        .update(&key, |por| {
            por.advance_state(DeliveryState::Finished);
            por.clone()
        })
        .ok_or_else(|| missing_record("POR", &key))?;
    por.archived = true;
    let (partition, sort) = por.archive_key();
    if let Err(e) = archive_record(ctx.archive.as_ref(), &partition, &sort, &por).await {
        // Cached record stays unarchived; the monitor retires it later.
        warn!(key, error = %e, "archive failed, deferring eviction");
        return Err(e);
    }
    ctx.por_cache.remove(&key);

    let reply = Message::new(
        MessageType::PorDeleted,
        message.id(),
        serde_json::to_vec(&RelayAckData {
            consumer_port: ctx.local_port(),
        })?,
    )?;
    link.send(reply, SendContext::Initial).await?;
    Ok(())
}

/// Cerebrum: POR_DELETED received. One subscriber finished; fold the result
/// into the POD and retire it once every subscriber has.
pub async fn por_deleted(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let data: RelayAckData = message.decode_data("POR_DELETED")?;
    let id = message.id().to_string();
    let key = ProofOfRelay::cache_key(&id, data.consumer_port);

    let mut por = ctx
        .por_cache
        .update(&key, |por| {
            por.advance_state(DeliveryState::Finished);
            por.clone()
        })
        .ok_or_else(|| missing_record("POR", &key))?;
    por.archived = true;
    let (partition, sort) = por.archive_key();
    if let Err(e) = archive_record(ctx.archive.as_ref(), &partition, &sort, &por).await {
        warn!(key, error = %e, "archive failed, deferring eviction");
        return Err(e);
    }
    ctx.por_cache.remove(&key);
    info!(key, "subscriber relay finished");

    let fully_relayed = ctx
        .pod_cache
        .update(&id, |pod| {
            pod.record_relayed();
            pod.fully_relayed()
        })
        .ok_or_else(|| missing_record("POD", &id))?;
    if fully_relayed {
        retire_pod(ctx, &id).await?;
        if let Ok(connector) = connector_for_link(ctx, link) {
            connector.clear_registers_for(message.id());
        }
    }
    Ok(())
}

/// Terminal POD path at the cerebrum: every subscriber has finished (or
/// there were none). Archive and evict.
pub(crate) async fn retire_pod(ctx: &Arc<DeliveryContext>, id: &str) -> DeliveryResult<()> {
    let mut pod = ctx
        .pod_cache
        .update(id, |pod| {
            pod.advance_state(DeliveryState::FullyRelayed);
            pod.clone()
        })
        .ok_or_else(|| missing_record("POD", id))?;
    pod.archived = true;
    let (partition, sort) = pod.archive_key();
    if let Err(e) = archive_record(ctx.archive.as_ref(), &partition, &sort, &pod).await {
        warn!(message_id = %id, error = %e, "archive failed, deferring eviction");
        return Err(e);
    }
    ctx.pod_cache.remove(id);
    info!(message_id = %id, subscribers = pod.subscriber_count, "event fully relayed");
    Ok(())
}
