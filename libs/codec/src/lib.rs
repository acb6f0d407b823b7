//! # nceph Wire Protocol Codec
//!
//! ## Purpose
//! Encoding, decoding and incremental assembly rules for the nceph binary
//! message format. Every byte that crosses a synapse↔cerebrum socket is
//! produced and consumed by this crate; nothing here performs I/O.
//!
//! ## Message Format
//! Fixed 16-byte big-endian header followed by an opaque body:
//!
//! ```text
//! [genesis:1][counter:1][flags:1][type:1][source_id:2][message_id:6][data_length:4][data:N]
//! ```
//!
//! - **genesis**: sentinel constant marking the start of a frame
//! - **counter**: per-connection sequence (wraps at 256), anomaly detection only
//! - **flags**: bitset, bit 0 = trace
//! - **type**: message kind byte, see [`MessageType`]
//! - **source_id + message_id**: message identity, rendered `"{source}-{id}"`
//! - **data**: `data_length` bytes, typically UTF-8 JSON
//!
//! ## Architecture Role
//! ```text
//! socket bytes → MessageAssembler → Message → receptor dispatch
//! Message      → encode()         → socket bytes
//! ```
//!
//! The assembler tolerates arbitrary chunking: a frame may arrive one byte at
//! a time or many frames may arrive in a single read, and the decoded message
//! sequence is identical either way.

pub mod assembler;
pub mod constants;
pub mod error;
pub mod message;
pub mod wire;

pub use assembler::{AssembledMessage, MessageAssembler};
pub use constants::*;
pub use error::{CodecError, CodecResult};
pub use message::{
    CredentialsData, EventData, Message, MessageId, MessageType, RelayAckData, StartupData,
};
pub use wire::{decode_header, encode, WireHeader};
