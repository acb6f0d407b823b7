//! # Transport
//!
//! Unifies plaintext TCP and TLS-wrapped streams behind one boxed
//! `AsyncRead + AsyncWrite` object so the connection engine has a single
//! read/write path. TLS negotiation happens here, driven by the runtime's
//! poll loop rather than a dedicated executor.

use crate::error::NetworkResult;
use crate::tls::{self, server_name};
use nceph_config::TlsConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Object-safe stream bound used by the engine.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A connected, handshake-complete byte stream.
pub type BoxedStream = Box<dyn RawStream>;

/// Open an outbound stream to `host:port`, wrapping in TLS when configured.
pub async fn connect(host: &str, port: u16, tls_config: &TlsConfig) -> NetworkResult<BoxedStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    match tls::build_connector(tls_config)? {
        Some(connector) => {
            let stream = connector.connect(server_name(host)?, stream).await?;
            debug!(host, port, "outbound TLS stream established");
            Ok(Box::new(stream))
        }
        None => {
            debug!(host, port, "outbound plaintext stream established");
            Ok(Box::new(stream))
        }
    }
}

/// Wrap an accepted socket, completing the server-side TLS handshake when an
/// acceptor is present.
pub async fn accept(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> NetworkResult<BoxedStream> {
    stream.set_nodelay(true)?;
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}
