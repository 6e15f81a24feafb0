//! TLS dialer for public brokers
//!
//! Verifies the broker certificate against the Mozilla root set bundled by
//! `webpki-roots` and sends the broker host as SNI.

use super::tcp::dial;
use super::{BoxedStream, Connector, TransportError};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;

/// TLS dialer
pub struct TlsConnector {
    connector: tokio_rustls::TlsConnector,
    server_name: ServerName<'static>,
    host: String,
    connect_timeout: Duration,
}

impl TlsConnector {
    /// Create a dialer for the given broker host
    pub fn new(host: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("Invalid server name {:?}: {}", host, e)))?;

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_config()?)),
            server_name,
            host: host.to_string(),
            connect_timeout,
        })
    }

    /// Server name sent in the ClientHello
    pub fn server_name(&self) -> &str {
        &self.host
    }
}

fn client_config() -> Result<rustls::ClientConfig, TransportError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TransportError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(config)
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        let tcp_stream = dial(addr, self.connect_timeout).await?;

        let tls_stream = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(self.server_name.clone(), tcp_stream),
        )
        .await
        .map_err(|_| TransportError::Unreachable(format!("TLS handshake with {} timed out", addr)))?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Box::new(tls_stream))
    }
}
