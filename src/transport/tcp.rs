//! Raw TCP dialer (local brokers and tests)

use super::{BoxedStream, Connector, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Raw TCP dialer
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// Dial TCP with a timeout and Nagle disabled
pub(crate) async fn dial(addr: &str, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Unreachable(format!("connect to {} timed out", addr)))?
        .map_err(|e| TransportError::Unreachable(format!("{}: {}", addr, e)))?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        let stream = dial(addr, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }
}
