//! Transport layer - the persistent connection to the tunnel broker
//!
//! Provides:
//! - Pluggable dialers (raw TCP, TLS, WebSocket over either)
//! - The `Hello`/`Welcome` handshake binding a connection to a tunnel
//! - A running session with read/write loops, heartbeats and a FIFO send queue

mod connection;
mod session;
mod tcp;
mod ws;

#[cfg(feature = "tls")]
mod tls;

pub use connection::{BrokerConnection, ConnectionState};
pub use session::{send_queue, SessionConfig, SessionEnd, SessionSender, TransportSession};
pub use tcp::TcpConnector;
pub use ws::WsConnector;

#[cfg(feature = "tls")]
pub use tls::TlsConnector;

use crate::tunnel::{RejectCode, TunnelError};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Tunnel rejected by broker ({code:?}): {message}")]
    AuthRejected { code: RejectCode, message: String },

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Broker refused connection: {0}")]
    Rejected(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("No frame from broker for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Too many malformed frames ({0} in a row)")]
    ProtocolViolations(u32),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] TunnelError),

    #[error("Broker is going away: {0}")]
    GoAway(String),

    #[error("Connection closed by broker")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid broker address: {0}")]
    InvalidBroker(String),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Whether reconnecting with the same identity and settings is pointless
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::AuthRejected { .. } | TransportError::InvalidConfig(_)
        )
    }
}

/// Byte stream to the broker
pub trait BrokerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> BrokerStream for T {}

/// Boxed broker stream, whatever the dialer
pub type BoxedStream = Box<dyn BrokerStream>;

/// Trait for dialer implementations
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a byte stream to `host:port`
    async fn connect(&self, addr: &str) -> Result<BoxedStream, TransportError>;
}

/// Broker URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Tcp,
    Tls,
    /// WebSocket over TCP
    Ws,
    /// WebSocket over TLS
    Wss,
}

impl BrokerScheme {
    fn as_str(self) -> &'static str {
        match self {
            BrokerScheme::Tcp => "tcp",
            BrokerScheme::Tls => "tls",
            BrokerScheme::Ws => "ws",
            BrokerScheme::Wss => "wss",
        }
    }

    fn default_port(self) -> Option<u16> {
        match self {
            BrokerScheme::Ws => Some(80),
            BrokerScheme::Wss => Some(443),
            BrokerScheme::Tcp | BrokerScheme::Tls => None,
        }
    }

    fn is_websocket(self) -> bool {
        matches!(self, BrokerScheme::Ws | BrokerScheme::Wss)
    }
}

/// Parsed broker address
///
/// `tcp://host:port` and `tls://host:port` carry frames directly on the
/// stream; `ws://host[:port]/path` and `wss://host[:port]/path` carry them in
/// binary WebSocket messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    /// Request path for WebSocket brokers, empty otherwise
    pub path: String,
}

impl BrokerAddr {
    /// `host:port` for dialing
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Build the dialer matching the scheme
    pub fn connector(&self, connect_timeout: Duration) -> Result<Box<dyn Connector>, TransportError> {
        match self.scheme {
            BrokerScheme::Tcp => Ok(Box::new(TcpConnector::new(connect_timeout))),
            BrokerScheme::Ws => Ok(Box::new(WsConnector::new(
                TcpConnector::new(connect_timeout),
                self.to_string(),
                connect_timeout,
            ))),
            #[cfg(feature = "tls")]
            BrokerScheme::Tls => Ok(Box::new(TlsConnector::new(&self.host, connect_timeout)?)),
            #[cfg(feature = "tls")]
            BrokerScheme::Wss => Ok(Box::new(WsConnector::new(
                TlsConnector::new(&self.host, connect_timeout)?,
                self.to_string(),
                connect_timeout,
            ))),
            #[cfg(not(feature = "tls"))]
            BrokerScheme::Tls | BrokerScheme::Wss => Err(TransportError::InvalidBroker(format!(
                "{}:// requires the `tls` feature",
                self.scheme.as_str()
            ))),
        }
    }
}

impl FromStr for BrokerAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |what: &str| TransportError::InvalidBroker(format!("{} in {:?}", what, s));

        let (scheme, rest) = match s.split_once("://") {
            Some(("tcp", rest)) => (BrokerScheme::Tcp, rest),
            Some(("tls", rest)) => (BrokerScheme::Tls, rest),
            Some(("ws", rest)) => (BrokerScheme::Ws, rest),
            Some(("wss", rest)) => (BrokerScheme::Wss, rest),
            Some((other, _)) => {
                return Err(TransportError::InvalidBroker(format!(
                    "unsupported scheme {:?}",
                    other
                )))
            }
            None => (BrokerScheme::Tcp, s),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        let path = if scheme.is_websocket() {
            if path.is_empty() { "/" } else { path }
        } else if path.trim_matches('/').is_empty() {
            ""
        } else {
            return Err(invalid("unexpected path"));
        };

        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed
                    .split_once(']')
                    .ok_or_else(|| invalid("unterminated IPv6 address"))?;
                (host, after.strip_prefix(':'))
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid("invalid port"))?,
            None => scheme.default_port().ok_or_else(|| invalid("missing port"))?,
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme.as_str(), self.authority(), self.path)
    }
}

/// WebSocket broker URL for a tunnel, derived from the registration API URL
///
/// `https://api.example.com` becomes `wss://api.example.com/ws/tunnel/<id>`.
pub fn broker_url_for(registration_url: &str, tunnel_id: &str) -> Result<String, TransportError> {
    let base = registration_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(TransportError::InvalidBroker(format!(
            "registration URL {:?} is not http(s)",
            registration_url
        )));
    };
    if tunnel_id.is_empty() || tunnel_id.contains(['/', '?', '#']) {
        return Err(TransportError::InvalidBroker(format!(
            "tunnel id {:?} cannot be used in a URL path",
            tunnel_id
        )));
    }
    Ok(format!("{}/ws/tunnel/{}", ws_base, tunnel_id))
}
