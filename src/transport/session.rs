//! Transport session - one live, authenticated broker connection
//!
//! A session runs four tasks: a reader that decodes frames, a writer that
//! drains the FIFO send queue, a heartbeat timer, and a control loop that
//! routes frames, tracks liveness and reports a single terminal
//! [`SessionEnd`]. Sessions never reconnect; that is the supervisor's job.

use super::{BoxedStream, BrokerConnection, ConnectionState, Connector, TransportError};
use crate::protocol::{
    HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_MISSES, MAX_PROTOCOL_ERRORS,
};
use crate::tunnel::{
    Frame, MultiplexerHandle, TunnelError, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE,
};
use crate::TunnelSession;
use bytes::BytesMut;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between client heartbeats
    pub heartbeat_interval: Duration,
    /// Bound on dial plus `Hello`/`Welcome`
    pub handshake_timeout: Duration,
    /// Largest frame accepted from the broker
    pub max_frame_size: usize,
    /// Consecutive malformed frames tolerated
    pub max_protocol_errors: u32,
}

impl SessionConfig {
    /// Silence after which the broker is presumed dead
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * HEARTBEAT_MISSES
    }

    /// Reject settings the session timers cannot run with
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.heartbeat_interval.is_zero() {
            return Err(TransportError::InvalidConfig(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "handshake timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_frame_size <= LENGTH_PREFIX_SIZE {
            return Err(TransportError::InvalidConfig(format!(
                "max frame size must exceed {} bytes",
                LENGTH_PREFIX_SIZE
            )));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_protocol_errors: MAX_PROTOCOL_ERRORS,
        }
    }
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Closed locally
    Closed,
    /// Transport failure
    Failed(TransportError),
}

/// Handle for enqueuing outbound frames
#[derive(Clone)]
pub struct SessionSender {
    tx: mpsc::UnboundedSender<Frame>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionSender {
    /// Enqueue a frame; fails with `SessionClosed` unless the session is `Active`
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::SessionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::SessionClosed)
    }

    pub fn is_active(&self) -> bool {
        *self.state.borrow() == ConnectionState::Active
    }
}

/// Create a send queue gated on `state`
pub fn send_queue(
    state: watch::Receiver<ConnectionState>,
) -> (SessionSender, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SessionSender { tx, state }, rx)
}

/// Message from the reader task to the control loop
enum ReaderMessage {
    /// Decoded frame
    Frame(Frame),
    /// Frame dropped because it could not be decoded
    Malformed(TunnelError),
    /// Reader encountered an unrecoverable error
    Error(TransportError),
    /// Connection closed
    Closed,
}

/// A running session
pub struct TransportSession {
    generation: u64,
    tunnel_url: String,
    state: watch::Receiver<ConnectionState>,
    sender: SessionSender,
    close_tx: Option<oneshot::Sender<String>>,
    task: JoinHandle<SessionEnd>,
    finished: bool,
    established_at: Instant,
}

impl TransportSession {
    /// Connect, authenticate and start the session
    ///
    /// The multiplexer is attached to the new generation before the first
    /// frame is read.
    pub async fn connect(
        connector: &dyn Connector,
        addr: &str,
        tunnel: &TunnelSession,
        generation: u64,
        config: SessionConfig,
        mux: MultiplexerHandle,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let conn = match BrokerConnection::open(connector, addr, tunnel, &config, &state_tx).await {
            Ok(conn) => conn,
            Err(e) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let tunnel_url = conn.tunnel_url().to_string();
        let (read_half, write_half, leftover) = conn.into_split();

        let (sender, out_rx) = send_queue(state_rx.clone());
        mux.attach(generation, sender.clone())
            .map_err(|_| TransportError::SessionClosed)?;

        let (reader_tx, reader_rx) = mpsc::channel::<ReaderMessage>(256);
        let reader = tokio::spawn(read_loop(read_half, leftover, config.max_frame_size, reader_tx));

        let (stop_tx, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(write_half, out_rx, stop_rx));

        state_tx.send_replace(ConnectionState::Active);
        info!("Transport generation {} active", generation);

        let heartbeat = tokio::spawn(heartbeat_loop(sender.clone(), config.heartbeat_interval));

        let (close_tx, close_rx) = oneshot::channel();
        let control = ControlLoop {
            generation,
            config,
            mux,
            sender: sender.clone(),
            state: state_tx,
            reader_rx,
            reader,
            writer,
            stop_tx: Some(stop_tx),
            heartbeat,
        };
        let task = tokio::spawn(control.run(close_rx));

        Ok(Self {
            generation,
            tunnel_url,
            state: state_rx,
            sender,
            close_tx: Some(close_tx),
            task,
            finished: false,
            established_at: Instant::now(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Public URL announced by the broker
    pub fn tunnel_url(&self) -> &str {
        &self.tunnel_url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Get a sender for the send queue
    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Time since the session became active
    pub fn uptime(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Wait for the session to end
    ///
    /// Cancel-safe; once it has returned, [`TransportSession::close`]
    /// resolves immediately.
    pub async fn wait(&mut self) -> SessionEnd {
        if self.finished {
            return SessionEnd::Closed;
        }
        let end = (&mut self.task).await.unwrap_or_else(|e| {
            SessionEnd::Failed(TransportError::Io(std::io::Error::other(e.to_string())))
        });
        self.finished = true;
        end
    }

    /// Gracefully close: flush queued frames, send `GoAway`, shut down
    pub async fn close(mut self, reason: impl Into<String>) -> SessionEnd {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(reason.into());
        }
        self.wait().await
    }
}

struct ControlLoop {
    generation: u64,
    config: SessionConfig,
    mux: MultiplexerHandle,
    sender: SessionSender,
    state: watch::Sender<ConnectionState>,
    reader_rx: mpsc::Receiver<ReaderMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<(), TransportError>>,
    stop_tx: Option<oneshot::Sender<Frame>>,
    heartbeat: JoinHandle<()>,
}

impl ControlLoop {
    async fn run(mut self, mut close_rx: oneshot::Receiver<String>) -> SessionEnd {
        let liveness = self.config.liveness_timeout();
        let mut deadline = Instant::now() + liveness;
        let mut malformed = 0u32;

        let end = loop {
            tokio::select! {
                msg = self.reader_rx.recv() => match msg {
                    Some(ReaderMessage::Frame(frame)) => {
                        deadline = Instant::now() + liveness;
                        malformed = 0;
                        if let Err(e) = self.handle_frame(frame) {
                            break SessionEnd::Failed(e);
                        }
                    }
                    Some(ReaderMessage::Malformed(e)) => {
                        malformed += 1;
                        warn!("Dropping malformed frame ({} in a row): {}", malformed, e);
                        if malformed > self.config.max_protocol_errors {
                            break SessionEnd::Failed(TransportError::ProtocolViolations(malformed));
                        }
                    }
                    Some(ReaderMessage::Error(e)) => break SessionEnd::Failed(e),
                    Some(ReaderMessage::Closed) | None => {
                        break SessionEnd::Failed(TransportError::Closed);
                    }
                },

                _ = tokio::time::sleep_until(deadline) => {
                    break SessionEnd::Failed(TransportError::HeartbeatTimeout(liveness));
                }

                result = &mut self.writer => {
                    let err = match result {
                        Ok(Ok(())) => TransportError::Closed,
                        Ok(Err(e)) => e,
                        Err(e) => TransportError::Io(std::io::Error::other(e.to_string())),
                    };
                    break SessionEnd::Failed(err);
                }

                reason = &mut close_rx => {
                    let reason = reason.unwrap_or_else(|_| "client shutting down".to_string());
                    self.shutdown(reason).await;
                    break SessionEnd::Closed;
                }
            }
        };

        self.state.send_replace(ConnectionState::Disconnected);
        self.heartbeat.abort();
        self.reader.abort();
        if !self.writer.is_finished() {
            self.writer.abort();
        }

        match &end {
            SessionEnd::Closed => info!("Transport generation {} closed", self.generation),
            SessionEnd::Failed(e) => warn!("Transport generation {} failed: {}", self.generation, e),
        }
        end
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Heartbeat { timestamp } => {
                debug!("Heartbeat from broker ({})", timestamp);
                self.sender.send(Frame::HeartbeatAck { timestamp })?;
            }
            Frame::HeartbeatAck { timestamp } => {
                debug!(
                    "Heartbeat acknowledged after {}ms",
                    unix_millis().saturating_sub(timestamp)
                );
            }
            Frame::GoAway { message } => return Err(TransportError::GoAway(message)),
            Frame::Error {
                stream_id: None,
                message,
            } => warn!("Broker error: {}", message),
            Frame::Hello { .. } | Frame::Welcome { .. } | Frame::Reject { .. } => {
                warn!(
                    "Protocol violation: {:?} frame after handshake",
                    frame.frame_type()
                );
            }
            stream_frame => {
                self.mux
                    .dispatch(self.generation, stream_frame)
                    .map_err(|_| TransportError::SessionClosed)?;
            }
        }
        Ok(())
    }

    /// Stop accepting frames, flush the queue, then say goodbye
    async fn shutdown(&mut self, reason: String) {
        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(Frame::GoAway { message: reason });
        }
        match tokio::time::timeout(self.config.handshake_timeout, &mut self.writer).await {
            Ok(Ok(Err(e))) => debug!("Error while closing transport: {}", e),
            Err(_) => debug!("Timed out flushing transport"),
            _ => {}
        }
    }
}

async fn read_loop(
    mut read_half: ReadHalf<BoxedStream>,
    mut buf: BytesMut,
    max_frame_size: usize,
    reader_tx: mpsc::Sender<ReaderMessage>,
) {
    loop {
        let msg = match Frame::decode(&mut buf, max_frame_size) {
            Ok(Some(frame)) => ReaderMessage::Frame(frame),
            Ok(None) => match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = reader_tx.send(ReaderMessage::Closed).await;
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    let _ = reader_tx.send(ReaderMessage::Error(e.into())).await;
                    break;
                }
            },
            Err(e) if e.is_recoverable() => ReaderMessage::Malformed(e),
            Err(e) => {
                let _ = reader_tx.send(ReaderMessage::Error(e.into())).await;
                break;
            }
        };

        if reader_tx.send(msg).await.is_err() {
            break; // Control loop gone
        }
    }
}

async fn write_loop(
    write_half: WriteHalf<BoxedStream>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    mut stop_rx: oneshot::Receiver<Frame>,
) -> Result<(), TransportError> {
    let mut writer = BufWriter::new(write_half);

    loop {
        tokio::select! {
            biased;

            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    write_frame(&mut writer, &frame).await?;
                    while let Ok(frame) = out_rx.try_recv() {
                        write_frame(&mut writer, &frame).await?;
                    }
                    writer.flush().await?;
                }
                None => {
                    writer.shutdown().await.ok();
                    return Ok(());
                }
            },

            last = &mut stop_rx => {
                while let Ok(frame) = out_rx.try_recv() {
                    write_frame(&mut writer, &frame).await?;
                }
                if let Ok(goaway) = last {
                    write_frame(&mut writer, &goaway).await?;
                }
                writer.flush().await?;
                writer.shutdown().await.ok();
                return Ok(());
            }
        }
    }
}

async fn write_frame(
    writer: &mut BufWriter<WriteHalf<BoxedStream>>,
    frame: &Frame,
) -> Result<(), TransportError> {
    match frame.encode() {
        Ok(data) => writer.write_all(&data).await?,
        Err(e) => warn!("Dropping unencodable {:?} frame: {}", frame.frame_type(), e),
    }
    Ok(())
}

async fn heartbeat_loop(sender: SessionSender, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if sender
            .send(Frame::Heartbeat {
                timestamp: unix_millis(),
            })
            .is_err()
        {
            break;
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
