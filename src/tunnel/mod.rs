//! Tunnel layer - multiplexed HTTP streams
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream lifecycle tracking
//! - Stream multiplexing onto one transport session
//! - Backpressure on concurrent streams

mod frame;
mod multiplexer;
mod stream;

pub use frame::{Frame, FrameType, Headers, RejectCode, LENGTH_PREFIX_SIZE};
pub use multiplexer::{Multiplexer, MultiplexerHandle, MultiplexerLimits};
pub use stream::{StreamOutcome, StreamState, TunnelStream};

use std::time::Duration;
use thiserror::Error;

/// Broker-assigned stream identifier, unique within one transport generation
pub type StreamId = u32;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Invalid stream transition for {0}: {1:?} -> {2:?}")]
    InvalidTransition(StreamId, StreamState, StreamState),

    #[error("Request body for stream {0} exceeds {1} bytes")]
    BodyTooLarge(StreamId, usize),

    #[error("Multiplexer stopped")]
    MultiplexerClosed,
}

impl TunnelError {
    /// Whether the byte stream can continue after this decode error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TunnelError::FrameTooLarge(..))
    }
}

/// Default bound on concurrently open streams
pub const DEFAULT_MAX_STREAMS: usize = 100;

/// Default maximum encoded frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// Default response body chunk size (256 KiB)
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Default maximum request body size (16 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 << 20;

/// Default time a streamed request body may stall before the stream is
/// answered with 408
pub const DEFAULT_BODY_TIMEOUT: Duration = Duration::from_secs(30);
