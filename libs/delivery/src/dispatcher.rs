//! # Delivery Dispatcher
//!
//! The catalog binding wire message types to their receptors and affectors.
//! The socket engine calls in here for every assembled inbound frame and
//! every completed write; errors never propagate back into the I/O tasks —
//! a failed handler is logged and the message's record is left for the
//! monitor to re-drive.

use crate::affectors;
use crate::context::DeliveryContext;
use crate::error::{DeliveryError, DeliveryResult};
use crate::receptors::{flow, handshake, publish, relay};
use async_trait::async_trait;
use nceph_codec::{AssembledMessage, Message, MessageType};
use nceph_network::{DeliveryLink, MessageDispatcher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes inbound and sent messages to the delivery layer.
pub struct DeliveryDispatcher {
    ctx: Arc<DeliveryContext>,
}

impl DeliveryDispatcher {
    pub fn new(ctx: Arc<DeliveryContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    async fn route_received(
        &self,
        assembled: &AssembledMessage,
        link: &Arc<dyn DeliveryLink>,
    ) -> DeliveryResult<()> {
        let ctx = &self.ctx;
        match assembled.message.message_type() {
            MessageType::Startup => handshake::startup(ctx, assembled, link).await,
            MessageType::Authenticate => handshake::authenticate(ctx, assembled, link).await,
            MessageType::Credentials => handshake::credentials(ctx, assembled, link).await,
            MessageType::Ready => handshake::ready(ctx, assembled, link).await,
            MessageType::AuthError => handshake::auth_error(ctx, assembled, link).await,
            MessageType::ReadyConfirmed => handshake::ready_confirmed(ctx, assembled, link).await,

            MessageType::PublishEvent => publish::publish_event(ctx, assembled, link).await,
            MessageType::NcephEventAck => publish::event_ack(ctx, assembled, link).await,
            MessageType::AckReceived => publish::ack_received(ctx, assembled, link).await,
            MessageType::DeletePod => publish::delete_pod(ctx, assembled, link).await,

            MessageType::RelayEvent => relay::relay_event(ctx, assembled, link).await,
            MessageType::RelayedEventAck => relay::relayed_event_ack(ctx, assembled, link).await,
            MessageType::RelayAckReceived => relay::relay_ack_received(ctx, assembled, link).await,
            MessageType::PorDeleted => relay::por_deleted(ctx, assembled, link).await,

            MessageType::PauseTransmission => flow::pause_transmission(ctx, assembled, link).await,
            MessageType::ResumeTransmission => flow::resume_transmission(ctx, assembled, link).await,

            MessageType::Bootstrap | MessageType::Config => {
                debug!(kind = ?assembled.message.message_type(), peer = %link.peer(),
                       "provisioning frame ignored by the delivery layer");
                Ok(())
            }
        }
    }

    async fn route_sent(
        &self,
        message: &Message,
        link: &Arc<dyn DeliveryLink>,
    ) -> DeliveryResult<()> {
        let ctx = &self.ctx;
        match message.message_type() {
            MessageType::Authenticate => affectors::authenticate_sent(ctx, message, link).await,
            MessageType::Ready => affectors::ready_sent(ctx, message, link).await,
            MessageType::AuthError => affectors::auth_error_sent(ctx, message, link).await,

            MessageType::PublishEvent => affectors::publish_sent(ctx, message, link).await,
            MessageType::NcephEventAck => affectors::ack_sent(ctx, message, link).await,
            MessageType::AckReceived => affectors::threeway_sent(ctx, message, link).await,
            MessageType::DeletePod => affectors::delete_pod_sent(ctx, message, link).await,

            MessageType::RelayEvent => affectors::relay_sent(ctx, message, link).await,
            MessageType::RelayedEventAck => affectors::relay_ack_sent(ctx, message, link).await,
            MessageType::RelayAckReceived => {
                affectors::relay_threeway_sent(ctx, message, link).await
            }
            MessageType::PorDeleted => affectors::por_deleted_sent(ctx, message, link).await,

            // Handshake openers and flow control carry no record state on the
            // sending side.
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MessageDispatcher for DeliveryDispatcher {
    async fn message_received(&self, assembled: AssembledMessage, link: Arc<dyn DeliveryLink>) {
        let kind = assembled.message.message_type();
        let id = assembled.message.id();
        if let Err(e) = self.route_received(&assembled, &link).await {
            match e {
                DeliveryError::RecordNotFound { .. } => {
                    debug!(?kind, message_id = %id, error = %e, "receptor abandoned")
                }
                _ => warn!(?kind, message_id = %id, peer = %link.peer(), error = %e,
                           "receptor failed"),
            }
        }
    }

    async fn message_sent(&self, message: Message, link: Arc<dyn DeliveryLink>) {
        let kind = message.message_type();
        let id = message.id();
        if let Err(e) = self.route_sent(&message, &link).await {
            match e {
                DeliveryError::RecordNotFound { .. } => {
                    debug!(?kind, message_id = %id, error = %e, "affector abandoned")
                }
                _ => warn!(?kind, message_id = %id, peer = %link.peer(), error = %e,
                           "affector failed"),
            }
        }
    }
}
