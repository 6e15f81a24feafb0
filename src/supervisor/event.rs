//! Lifecycle events published by the supervisor

use crate::tunnel::StreamId;
use std::fmt;
use std::time::Duration;

/// Tunnel lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Dialing the broker for a new transport generation
    Connecting { generation: u64 },
    /// Transport authenticated and serving
    Active { generation: u64, tunnel_url: String },
    /// Transport lost; next attempt after `delay`
    Reconnecting {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// An in-flight stream was torn down without a response
    StreamFailed { stream_id: StreamId, reason: String },
    /// The tunnel cannot continue
    Fatal { reason: String },
    /// Shut down on request
    Stopped,
}

impl TunnelEvent {
    /// Whether no further events follow
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelEvent::Fatal { .. } | TunnelEvent::Stopped)
    }
}

impl fmt::Display for TunnelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelEvent::Connecting { generation } => {
                write!(f, "connecting (generation {})", generation)
            }
            TunnelEvent::Active {
                generation,
                tunnel_url,
            } => write!(f, "active at {} (generation {})", tunnel_url, generation),
            TunnelEvent::Reconnecting {
                attempt,
                delay,
                reason,
            } => write!(
                f,
                "reconnecting in {:?} (attempt {}): {}",
                delay, attempt, reason
            ),
            TunnelEvent::StreamFailed { stream_id, reason } => {
                write!(f, "stream {} failed: {}", stream_id, reason)
            }
            TunnelEvent::Fatal { reason } => write!(f, "fatal: {}", reason),
            TunnelEvent::Stopped => write!(f, "stopped"),
        }
    }
}
