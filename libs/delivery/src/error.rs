//! Delivery-layer errors.
//!
//! Nothing here is fatal at the process level: every failure either rolls an
//! attempt counter back for the next monitor pass or abandons a single
//! message's current step.

use nceph_codec::CodecError;
use nceph_network::NetworkError;
use thiserror::Error;

/// Errors raised by receptors, affectors, the record store and the monitor.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A receptor fired for a record that no longer exists (prior crash or
    /// cache loss). Logged and abandoned; there is no recovery path without
    /// the record.
    #[error("{kind} record not found for {key}")]
    RecordNotFound { kind: &'static str, key: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Save/update against the working cache or the durable store failed.
    /// Aborts the current step for this message only.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("application receptor {name} failed: {message}")]
    AppReceptor { name: String, message: String },

    #[error("no application receptor registered for event type {event_type}")]
    NoAppReceptor { event_type: u16 },

    #[error("no connector registered for port {port}")]
    NoConnector { port: u16 },
}

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
