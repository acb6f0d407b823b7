//! Network-layer errors for the nceph connection engine.

use nceph_codec::CodecError;
use thiserror::Error;

/// Errors raised by connections, connectors and transports.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Peer accepted no bytes within the write budget. Non-fatal: the
    /// message stays at the head of the queue and the connection is
    /// deprioritized until re-armed.
    #[error("relay timeout writing to {peer} after {elapsed_ms}ms")]
    WriteTimeout { peer: String, elapsed_ms: u64 },

    /// Event traffic was offered to a connection that is not READY.
    #[error("connection {peer} not ready for event traffic (state {state:?})")]
    NotReady {
        peer: String,
        state: crate::connection::ConnectionState,
    },

    #[error("no ready connection on connector {port}")]
    NoReadyConnection { port: u16 },

    #[error("connection {peer} is decommissioned")]
    Decommissioned { peer: String },
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
