//! Broker connection and handshake
//!
//! Dials the broker, binds the connection to a tunnel with `Hello`, and
//! waits for `Welcome` or `Reject`. Once authenticated the connection is
//! split into halves for the session's read and write loops.

use super::{BoxedStream, Connector, SessionConfig, TransportError};
use crate::protocol::ProtocolError;
use crate::tunnel::{Frame, RejectCode, TunnelError};
use crate::TunnelSession;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::{debug, info};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Dialing and handshaking
    Connecting,
    /// Broker accepted the tunnel binding
    Authenticated,
    /// Read and write loops running, frames may be sent
    Active,
}

/// An authenticated connection to the broker
pub struct BrokerConnection {
    stream: BoxedStream,
    read_buffer: BytesMut,
    max_frame_size: usize,
    tunnel_url: String,
}

impl BrokerConnection {
    /// Dial the broker and perform the handshake
    ///
    /// Publishes `Connecting` then `Authenticated` on `state`; on error the
    /// state is left for the caller to reset.
    pub async fn open(
        connector: &dyn Connector,
        addr: &str,
        tunnel: &TunnelSession,
        config: &SessionConfig,
        state: &watch::Sender<ConnectionState>,
    ) -> Result<Self, TransportError> {
        state.send_replace(ConnectionState::Connecting);
        debug!("Dialing broker {}", addr);

        let mut conn = tokio::time::timeout(config.handshake_timeout, async {
            let stream = connector.connect(addr).await?;
            let mut conn = Self {
                stream,
                read_buffer: BytesMut::with_capacity(64 * 1024),
                max_frame_size: config.max_frame_size,
                tunnel_url: String::new(),
            };
            conn.handshake(tunnel).await?;
            Ok::<_, TransportError>(conn)
        })
        .await
        .map_err(|_| {
            TransportError::Unreachable(format!(
                "handshake with {} timed out after {:?}",
                addr, config.handshake_timeout
            ))
        })??;

        if conn.tunnel_url.is_empty() {
            conn.tunnel_url = tunnel.tunnel_url.clone();
        }
        state.send_replace(ConnectionState::Authenticated);
        info!("Tunnel {} bound at {}", tunnel.tunnel_id, conn.tunnel_url);
        Ok(conn)
    }

    async fn handshake(&mut self, tunnel: &TunnelSession) -> Result<(), TransportError> {
        self.write_frame(&Frame::hello(&tunnel.tunnel_id, &tunnel.local_addr))
            .await?;

        let reply = match self.read_frame().await {
            Ok(frame) => frame,
            Err(TransportError::Malformed(e)) => {
                return Err(ProtocolError::from(e).into());
            }
            Err(e) => return Err(e),
        };

        match reply {
            Frame::Welcome { tunnel_url } => {
                self.tunnel_url = tunnel_url;
                Ok(())
            }
            Frame::Reject { code, message } if code.is_auth_failure() => {
                Err(TransportError::AuthRejected { code, message })
            }
            Frame::Reject {
                code: RejectCode::UnsupportedVersion,
                message,
            } => Err(ProtocolError::VersionRejected(message).into()),
            Frame::Reject { code, message } => {
                Err(TransportError::Rejected(format!("{:?}: {}", code, message)))
            }
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "{:?} frame during handshake",
                other.frame_type()
            ))
            .into()),
        }
    }

    /// Public URL the broker announced
    pub fn tunnel_url(&self) -> &str {
        &self.tunnel_url
    }

    /// Write a single frame and flush
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let data = frame.encode()?;
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read a single frame
    pub async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.read_buffer, self.max_frame_size)? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Split into read and write halves, keeping any bytes read past the handshake
    pub fn into_split(self) -> (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>, BytesMut) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (read_half, write_half, self.read_buffer)
    }
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::ProtocolMismatch(e.to_string())
    }
}

impl From<TunnelError> for ProtocolError {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::InvalidFrame(msg) if msg.contains("magic") => ProtocolError::InvalidMagic,
            TunnelError::UnknownFrameType(kind) => ProtocolError::InvalidMessageType(kind),
            TunnelError::FrameTooLarge(size, _) => ProtocolError::MessageTooLarge(size),
            other => ProtocolError::UnexpectedMessage(other.to_string()),
        }
    }
}
