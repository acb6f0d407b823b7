//! # Handshake Receptors (Proof of Authentication)
//!
//! ```text
//! synapse                          cerebrum
//!   | -------- STARTUP --------->  |  create POA
//!   | <------ AUTHENTICATE ------  |
//!   | -------- CREDENTIALS ----->  |  validate (sentinel compare)
//!   | <--- READY / AUTH_ERROR ---  |  promote / teardown
//!   | ------ READY_CONFIRMED --->  |  delete POA
//! ```
//!
//! The POA lives only at the cerebrum and only for the handshake window; the
//! synapse drives its connection state directly from the replies.

use crate::context::DeliveryContext;
use crate::error::DeliveryResult;
use crate::poa::ProofOfAuthentication;
use crate::receptors::missing_record;
use crate::state::PoaState;
use nceph_codec::{
    AssembledMessage, CredentialsData, Message, MessageType, StartupData,
};
use nceph_network::{ConnectionState, DeliveryLink, SendContext};
use std::sync::Arc;
use tracing::{info, warn};

/// Synapse side: open the handshake on a freshly connected link.
pub async fn initiate(
    ctx: &Arc<DeliveryContext>,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let startup = StartupData {
        node_id: ctx.node_id(),
        node_name: ctx.config.node.name.clone(),
    };
    let message = Message::new(
        MessageType::Startup,
        ctx.next_message_id(),
        serde_json::to_vec(&startup)?,
    )?;
    info!(peer = %link.peer(), "initiating handshake");
    link.send(message, SendContext::Initial).await?;
    Ok(())
}

/// Cerebrum: STARTUP received. Create the POA and challenge the peer.
pub async fn startup(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let data: StartupData = message.decode_data("STARTUP")?;
    let key = message.id().to_string();

    link.set_node_id(data.node_id);
    ctx.poa_cache.create(key.clone(), || {
        let mut poa = ProofOfAuthentication::new(key.clone(), data.node_id, data.node_name.clone());
        poa.startup.record(assembled.read_start, assembled.read_end);
        poa
    });

    let reply = Message::new(MessageType::Authenticate, message.id(), Vec::new())?;
    link.send(reply, SendContext::Initial).await?;
    Ok(())
}

/// Synapse: AUTHENTICATE received. Present credentials.
pub async fn authenticate(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let credentials = CredentialsData {
        credentials: ctx.config.node.credentials.clone(),
    };
    let reply = Message::new(
        MessageType::Credentials,
        assembled.message.id(),
        serde_json::to_vec(&credentials)?,
    )?;
    link.send(reply, SendContext::Initial).await?;
    Ok(())
}

/// Cerebrum: CREDENTIALS received. Placeholder sentinel compare decides
/// READY versus AUTH_ERROR; connection promotion happens in the READY
/// affector once the reply is actually on the wire.
pub async fn credentials(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let key = message.id().to_string();
    let data: CredentialsData = message.decode_data("CREDENTIALS")?;

    ctx.poa_cache
        .update(&key, |poa| {
            poa.advance_state(PoaState::Credentials);
            poa.credentials.record(assembled.read_start, assembled.read_end);
        })
        .ok_or_else(|| missing_record("POA", &key))?;

    if data.credentials == ctx.config.node.credentials {
        link.set_connection_state(ConnectionState::PreReady);
        let body = serde_json::to_vec(&StartupData {
            node_id: ctx.node_id(),
            node_name: ctx.config.node.name.clone(),
        })?;
        let reply = Message::new(MessageType::Ready, message.id(), body)?;
        link.send(reply, SendContext::Initial).await?;
    } else {
        warn!(peer = %link.peer(), "credential check failed");
        let reply = Message::new(MessageType::AuthError, message.id(), Vec::new())?;
        link.send(reply, SendContext::Initial).await?;
    }
    Ok(())
}

/// Synapse: READY received. Promote the connection, remember the cerebrum's
/// node id for backpressure addressing, confirm.
pub async fn ready(
    _ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let message = &assembled.message;
    let data: StartupData = message.decode_data("READY")?;
    link.set_node_id(data.node_id);
    link.set_connection_state(ConnectionState::Ready);
    info!(peer = %link.peer(), node = data.node_id, "connection ready");

    let reply = Message::new(MessageType::ReadyConfirmed, message.id(), Vec::new())?;
    link.send(reply, SendContext::Initial).await?;
    Ok(())
}

/// Synapse: AUTH_ERROR received. Tear the connection down.
pub async fn auth_error(
    _ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    warn!(peer = %link.peer(), message_id = %assembled.message.id(),
          "authentication rejected by cerebrum");
    link.set_connection_state(ConnectionState::AuthFailed);
    link.teardown().await;
    Ok(())
}

/// Cerebrum: READY_CONFIRMED received. Handshake complete; the POA has
/// served its purpose and is dropped from the cache.
pub async fn ready_confirmed(
    ctx: &Arc<DeliveryContext>,
    assembled: &AssembledMessage,
    link: &Arc<dyn DeliveryLink>,
) -> DeliveryResult<()> {
    let key = assembled.message.id().to_string();
    ctx.poa_cache
        .update(&key, |poa| {
            poa.advance_state(PoaState::ReadyConfirmed);
            poa.ready_confirmed
                .record(assembled.read_start, assembled.read_end);
        })
        .ok_or_else(|| missing_record("POA", &key))?;
    ctx.poa_cache.remove(&key);
    info!(peer = %link.peer(), "handshake complete");
    Ok(())
}
