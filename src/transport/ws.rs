//! WebSocket dialer
//!
//! Upgrades a TCP or TLS stream to a WebSocket on the broker's tunnel path
//! and bridges it to a byte stream, so the session keeps its length-prefixed
//! framing. Each outbound frame travels as one binary message; inbound binary
//! messages are concatenated.

use super::{BoxedStream, Connector, TransportError};
use crate::tunnel::{RejectCode, LENGTH_PREFIX_SIZE};
use async_trait::async_trait;
use async_tungstenite::tokio::client_async;
use async_tungstenite::tungstenite::{self, Message};
use async_tungstenite::WebSocketStream;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, warn};

/// Bytes buffered between the session and the WebSocket pump
const PIPE_CAPACITY: usize = 64 * 1024;

/// WebSocket dialer over another dialer
pub struct WsConnector<C> {
    inner: C,
    url: String,
    upgrade_timeout: Duration,
}

impl<C: Connector> WsConnector<C> {
    /// `url` is the full `ws://` or `wss://` URL sent in the upgrade request
    pub fn new(inner: C, url: impl Into<String>, upgrade_timeout: Duration) -> Self {
        Self {
            inner,
            url: url.into(),
            upgrade_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<C: Connector> Connector for WsConnector<C> {
    async fn connect(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        let stream = self.inner.connect(addr).await?;

        let (ws, response) = tokio::time::timeout(
            self.upgrade_timeout,
            client_async(self.url.as_str(), stream),
        )
        .await
        .map_err(|_| TransportError::Unreachable(format!("WebSocket upgrade to {} timed out", self.url)))?
        .map_err(|e| upgrade_error(&self.url, e))?;
        debug!("WebSocket upgrade to {} answered {}", self.url, response.status());

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(pump(ws, remote));
        Ok(Box::new(local))
    }
}

fn upgrade_error(url: &str, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let message = format!("WebSocket upgrade to {} refused with {}", url, status);
            match status {
                401 | 403 => TransportError::AuthRejected {
                    code: RejectCode::Unauthorized,
                    message,
                },
                404 => TransportError::AuthRejected {
                    code: RejectCode::UnknownTunnel,
                    message,
                },
                _ => TransportError::Rejected(message),
            }
        }
        tungstenite::Error::Io(e) => TransportError::Io(e),
        other => TransportError::Unreachable(format!("WebSocket upgrade to {} failed: {}", url, other)),
    }
}

/// Shuttle bytes between the session's pipe and the WebSocket
async fn pump<S>(mut ws: WebSocketStream<S>, mut pipe: DuplexStream)
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; PIPE_CAPACITY];
    let mut pending = BytesMut::new();

    loop {
        tokio::select! {
            read = pipe.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    if let Err(e) = send_frames(&mut ws, &mut pending).await {
                        warn!("WebSocket send failed: {}", e);
                        break;
                    }
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if pipe.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Broker closed the WebSocket: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    let _ = pipe.shutdown().await;
}

/// Send every complete frame buffered in `pending`, one message per frame
async fn send_frames<S>(
    ws: &mut WebSocketStream<S>,
    pending: &mut BytesMut,
) -> Result<(), tungstenite::Error>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send,
{
    while pending.len() >= LENGTH_PREFIX_SIZE {
        let len = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if pending.len() < LENGTH_PREFIX_SIZE + len {
            break;
        }
        let frame = pending.split_to(LENGTH_PREFIX_SIZE + len);
        ws.send(Message::binary(frame.to_vec())).await?;
    }
    Ok(())
}
