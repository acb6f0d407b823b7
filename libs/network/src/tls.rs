//! TLS context construction for the transport layer.
//!
//! The engine never sees TLS records: the handshake and wrap/unwrap loop are
//! driven by `tokio-rustls` from the same runtime that polls plaintext
//! sockets. This module only turns [`TlsConfig`] into acceptors/connectors.

use crate::error::{NetworkError, NetworkResult};
use nceph_config::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn load_certs(path: &str) -> NetworkResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(NetworkError::Io)
}

fn load_key(path: &str) -> NetworkResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| NetworkError::TlsConfig(format!("no private key found in {path}")))
}

/// Server-side acceptor, `None` when TLS is disabled.
pub fn build_acceptor(config: &TlsConfig) -> NetworkResult<Option<TlsAcceptor>> {
    if !config.enabled {
        return Ok(None);
    }
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| NetworkError::TlsConfig("tls.cert_path is required".into()))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| NetworkError::TlsConfig("tls.key_path is required".into()))?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert_path)?, load_key(key_path)?)?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// Client-side connector, `None` when TLS is disabled.
pub fn build_connector(config: &TlsConfig) -> NetworkResult<Option<TlsConnector>> {
    if !config.enabled {
        return Ok(None);
    }
    let ca_path = config
        .ca_path
        .as_deref()
        .ok_or_else(|| NetworkError::TlsConfig("tls.ca_path is required on the client side".into()))?;
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| NetworkError::TlsConfig(format!("invalid CA certificate: {e}")))?;
    }
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Some(TlsConnector::from(Arc::new(client_config))))
}

/// Parse a host string into the SNI name rustls requires.
pub fn server_name(host: &str) -> NetworkResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| NetworkError::TlsConfig(format!("invalid TLS server name {host}: {e}")))
}
