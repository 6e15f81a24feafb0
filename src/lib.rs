//! # Tunlify
//!
//! Client side of a reverse HTTP tunnel. A process behind NAT keeps one
//! persistent connection to a public broker; the broker pushes HTTP requests
//! down that connection, the client replays them against a local service and
//! sends the responses back.
//!
//! ## Features
//!
//! - **Stream multiplexing**: many concurrent requests over one connection,
//!   answered in any order
//! - **Self-healing**: heartbeats detect dead brokers, reconnects back off
//!   exponentially with jitter
//! - **Exactly-once outcomes**: every forwarded request ends in one response
//!   or one reported failure, even across reconnects
//! - **Graceful shutdown**: in-flight requests drain before the goodbye
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Session Supervisor                   │
//! │   (generations, reconnect backoff, lifecycle events) │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Session                   │
//! │   (handshake, read/write loops, heartbeat, liveness) │
//! ├─────────────────────────────────────────────────────┤
//! │                  Stream Multiplexer                  │
//! │     (stream table, backpressure, body chunking)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Local Forwarder                    │
//! │            (HTTP/1.1 to the local service)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunlify::forwarder::{ForwarderConfig, HttpForwarder};
//! use tunlify::supervisor::{Supervisor, SupervisorConfig};
//! use tunlify::TunnelSession;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = TunnelSession {
//!     tunnel_id: "b3f1c2".to_string(),
//!     tunnel_url: "https://demo.tunlify.biz.id".to_string(),
//!     local_addr: "127.0.0.1:3000".to_string(),
//!     broker: "wss://api.tunlify.biz.id/ws/tunnel/b3f1c2".to_string(),
//! };
//! let forwarder = HttpForwarder::new(ForwarderConfig::new(&session.local_addr))?;
//!
//! let mut handle = Supervisor::new(session, SupervisorConfig::default(), Arc::new(forwarder)).start();
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod forwarder;
pub mod protocol;
pub mod supervisor;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use protocol::{MAGIC, PROTOCOL_VERSION};
pub use supervisor::{FatalError, Supervisor, TunnelEvent, TunnelHandle};

use serde::{Deserialize, Serialize};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of a registered tunnel
///
/// Produced once by registration and never modified; every reconnect binds
/// the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSession {
    /// Broker-side tunnel identifier
    pub tunnel_id: String,
    /// Public URL the broker serves the tunnel on
    pub tunnel_url: String,
    /// Local service address, e.g. `127.0.0.1:3000`
    pub local_addr: String,
    /// Broker address, e.g. `wss://api.tunlify.biz.id/ws/tunnel/<id>` or
    /// `tcp://host:port`
    pub broker: String,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Forwarding error: {0}")]
    Forward(#[from] forwarder::ForwardError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("Configuration error: {0}")]
    Config(String),
}
