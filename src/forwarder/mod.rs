//! Local forwarder - replays tunneled requests against the local service
//!
//! The forwarder is stateless: one call, one outbound HTTP request, bounded
//! by a timeout. It never retries; the remote client owns retry semantics.

mod http;

pub use http::HttpForwarder;

use crate::tunnel::Headers;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Forwarding errors
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("Local service refused connection: {0}")]
    ConnectionRefused(String),

    #[error("Local service timed out after {0:?}")]
    Timeout(Duration),

    #[error("Local protocol error: {0}")]
    Protocol(String),
}

impl ForwardError {
    /// Status synthesized for the remote client when forwarding fails
    pub fn gateway_status(&self) -> u16 {
        match self {
            ForwardError::Timeout(_) => 504,
            ForwardError::ConnectionRefused(_) | ForwardError::Protocol(_) => 502,
        }
    }
}

/// A request to replay against the local service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRequest {
    pub method: String,
    /// Origin-form target, e.g. `/health?verbose=1`
    pub path: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// The local service's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// Anything that can answer a tunneled request
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    /// Execute one request
    async fn forward(&self, request: LocalRequest) -> Result<LocalResponse, ForwardError>;
}

/// Request headers never replayed to the local service
pub const DEFAULT_STRIP_HEADERS: &[&str] = &[
    "host",
    "x-tunnel-subdomain",
    "x-tunnel-region",
    "x-real-ip",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Response headers dropped because the body is relayed whole
pub(crate) const RESPONSE_HOP_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Local service address, `host:port` or a full `http://` URL
    pub local_addr: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Request headers to drop (case-insensitive)
    pub strip_headers: Vec<String>,
}

impl ForwarderConfig {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            ..Default::default()
        }
    }

    /// Whether a request header is stripped before forwarding
    pub fn strips(&self, name: &str) -> bool {
        self.strip_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            local_addr: "127.0.0.1:3000".to_string(),
            timeout: Duration::from_secs(30),
            strip_headers: DEFAULT_STRIP_HEADERS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_status() {
        assert_eq!(ForwardError::ConnectionRefused("x".into()).gateway_status(), 502);
        assert_eq!(ForwardError::Protocol("x".into()).gateway_status(), 502);
        assert_eq!(
            ForwardError::Timeout(Duration::from_secs(30)).gateway_status(),
            504
        );
    }

    #[test]
    fn test_strip_is_case_insensitive() {
        let config = ForwarderConfig::default();
        assert!(config.strips("Host"));
        assert!(config.strips("X-Tunnel-Region"));
        assert!(config.strips("X-Forwarded-For"));
        assert!(config.strips("x-real-ip"));
        assert!(config.strips("X-FORWARDED-PROTO"));
        assert!(config.strips("X-Forwarded-Host"));
        assert!(!config.strips("authorization"));
    }
}
