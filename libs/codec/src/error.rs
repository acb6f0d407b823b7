//! Codec-level errors for nceph message processing.
//!
//! Each variant carries the buffer state that produced it so connection logs
//! can distinguish peer corruption from local bugs.

use thiserror::Error;

/// Errors raised while encoding, decoding or assembling nceph frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Header buffer is too small to contain the fixed 16-byte header
    #[error("header too small: need {need} bytes, got {got}")]
    HeaderTooSmall { need: usize, got: usize },

    /// First header byte is not the genesis sentinel
    #[error("invalid genesis byte: expected {expected:#04x}, got {actual:#04x}")]
    InvalidGenesis { expected: u8, actual: u8 },

    /// Message type byte has no registered kind
    #[error("unknown message type {raw:#04x}")]
    UnknownMessageType { raw: u8 },

    /// Message id does not fit the 6-byte wire field
    #[error("message id {id} exceeds the 48-bit wire limit")]
    MessageIdOutOfRange { id: u64 },

    /// Declared body length exceeds the protocol maximum
    #[error("data length {length} exceeds maximum {max}")]
    DataTooLarge { length: usize, max: usize },

    /// A rendered message id does not parse back to `source-id`
    #[error("malformed message id {raw:?}")]
    MalformedMessageId { raw: String },

    /// Body bytes are not the payload the message type requires
    #[error("malformed {context} payload: {source}")]
    MalformedPayload {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
