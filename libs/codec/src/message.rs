//! # nceph Message Model
//!
//! ## Purpose
//! Defines the immutable wire unit ([`Message`]), the closed set of message
//! kinds ([`MessageType`]) and the JSON payload bodies carried by handshake
//! and event frames.
//!
//! ## Integration Points
//! - **MessageType**: byte code on the wire, drives receptor/affector dispatch
//! - **MessageId**: `source_id + message_id`, the identity used by every
//!   delivery record (POA/POD/POR) and duplicate-suppression register
//! - **EventData**: application event payload relayed from producer to
//!   subscribers

use crate::constants::{FLAG_TRACE, MAX_DATA_LENGTH, MAX_MESSAGE_ID};
use crate::error::{CodecError, CodecResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of wire message kinds.
///
/// Each kind maps to exactly one receptor and, where a write-complete matters
/// to a delivery record, one affector. Codes are grouped by flow: handshake
/// (0x00-0x05), publish (0x0B-0x0E), relay (0x15-0x18), flow control
/// (0x1F-0x20) and bootstrap/control (0x28-0x29).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Handshake
    Startup = 0x00,
    Authenticate = 0x01,
    Credentials = 0x02,
    Ready = 0x03,
    AuthError = 0x04,
    ReadyConfirmed = 0x05,

    // Publish flow (producer ↔ relay)
    PublishEvent = 0x0B,
    NcephEventAck = 0x0C,
    AckReceived = 0x0D,
    DeletePod = 0x0E,

    // Relay flow (relay ↔ consumer)
    RelayEvent = 0x15,
    RelayedEventAck = 0x16,
    RelayAckReceived = 0x17,
    PorDeleted = 0x18,

    // Flow control
    PauseTransmission = 0x1F,
    ResumeTransmission = 0x20,

    // Bootstrap / control
    Bootstrap = 0x28,
    Config = 0x29,
}

impl MessageType {
    /// Handshake frames are the only traffic allowed before a connection
    /// reaches READY.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageType::Startup
                | MessageType::Authenticate
                | MessageType::Credentials
                | MessageType::Ready
                | MessageType::AuthError
                | MessageType::ReadyConfirmed
        )
    }

    /// Flow-control frames bypass backpressure themselves.
    pub fn is_flow_control(self) -> bool {
        matches!(
            self,
            MessageType::PauseTransmission | MessageType::ResumeTransmission
        )
    }
}

/// Message identity: originating node plus its monotonic per-source id.
///
/// Rendered as `"{source_id}-{message_id}"` for every cross-component
/// comparison, log line and record-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub source_id: u16,
    pub message_id: u64,
}

impl MessageId {
    pub fn new(source_id: u16, message_id: u64) -> Self {
        Self {
            source_id,
            message_id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source_id, self.message_id)
    }
}

impl std::str::FromStr for MessageId {
    type Err = CodecError;

    /// Inverse of `Display`; record-cache keys are rendered ids.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (source, id) = raw
            .split_once('-')
            .ok_or(CodecError::MalformedMessageId { raw: raw.to_string() })?;
        let source_id = source
            .parse()
            .map_err(|_| CodecError::MalformedMessageId { raw: raw.to_string() })?;
        let message_id = id
            .parse()
            .map_err(|_| CodecError::MalformedMessageId { raw: raw.to_string() })?;
        Ok(Self {
            source_id,
            message_id,
        })
    }
}

/// Immutable wire unit.
///
/// Built once by a sender (or reconstructed by the assembler) and never
/// mutated afterwards; the per-connection `counter` is stamped by the writer
/// just before encoding via [`Message::with_counter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    counter: u8,
    flags: u8,
    message_type: MessageType,
    id: MessageId,
    data: Bytes,
}

impl Message {
    /// Build a message, validating the wire-width constraints up front so
    /// encoding is total.
    pub fn new(
        message_type: MessageType,
        id: MessageId,
        data: impl Into<Bytes>,
    ) -> CodecResult<Self> {
        let data = data.into();
        if id.message_id > MAX_MESSAGE_ID {
            return Err(CodecError::MessageIdOutOfRange { id: id.message_id });
        }
        if data.len() > MAX_DATA_LENGTH {
            return Err(CodecError::DataTooLarge {
                length: data.len(),
                max: MAX_DATA_LENGTH,
            });
        }
        Ok(Self {
            counter: 0,
            flags: 0,
            message_type,
            id,
            data,
        })
    }

    /// Used by the assembler once all header fields and the body are known.
    pub(crate) fn from_wire(
        counter: u8,
        flags: u8,
        message_type: MessageType,
        id: MessageId,
        data: Bytes,
    ) -> Self {
        Self {
            counter,
            flags,
            message_type,
            id,
            data,
        }
    }

    /// Stamp the per-connection sequence counter (writer side).
    pub fn with_counter(mut self, counter: u8) -> Self {
        self.counter = counter;
        self
    }

    /// Mark the message for trace logging end to end.
    pub fn with_trace(mut self) -> Self {
        self.flags |= FLAG_TRACE;
        self
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn traced(&self) -> bool {
        self.flags & FLAG_TRACE != 0
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decode the body as the JSON payload type the message kind carries.
    pub fn decode_data<T: serde::de::DeserializeOwned>(
        &self,
        context: &'static str,
    ) -> CodecResult<T> {
        serde_json::from_slice(&self.data)
            .map_err(|source| CodecError::MalformedPayload { context, source })
    }
}

/// STARTUP body: identifies the connecting node to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupData {
    pub node_id: u16,
    pub node_name: String,
}

/// CREDENTIALS body. The credential check is a placeholder string compare,
/// not a security boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsData {
    pub credentials: String,
}

/// Body of the relay-leg acknowledgements (RELAYED_EVENT_ACK,
/// RELAY_ACK_RECEIVED, POR_DELETED): identifies which consumer's POR the
/// frame belongs to, since one message id fans out to many consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelayAckData {
    pub consumer_port: u16,
}

/// Application event payload carried by PUBLISH_EVENT and RELAY_EVENT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Static routing key: subscribers register per event type.
    pub event_type: u16,
    /// Port of the producer connector that first accepted the event.
    pub producer_port: u16,
    /// Opaque application payload.
    pub payload: serde_json::Value,
    /// Producer-side creation stamp.
    pub created_on: DateTime<Utc>,
}

impl EventData {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serialization of a Value-bodied struct cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
