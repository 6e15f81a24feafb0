//! Protocol definitions and constants

use thiserror::Error;

/// Handshake-level protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Broker does not support protocol version {version}: {0}", version = PROTOCOL_VERSION)]
    VersionRejected(String),

    #[error("Invalid message type: {0:#04x}")]
    InvalidMessageType(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes opening every `Hello`
pub const MAGIC: [u8; 4] = *b"TNLF";

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 10;

/// Heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL: u64 = 30;

/// Silent heartbeat intervals before the broker is presumed dead
pub const HEARTBEAT_MISSES: u32 = 2;

/// Consecutive malformed frames tolerated before the session is dropped
pub const MAX_PROTOCOL_ERRORS: u32 = 8;

/// Drain window on graceful shutdown in seconds
pub const DRAIN_TIMEOUT: u64 = 5;
