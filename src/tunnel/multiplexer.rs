//! Stream multiplexer for the tunnel
//!
//! Owns the stream table inside a single dispatcher task. Everything else
//! (the transport session, forwarder tasks, the supervisor) talks to it
//! through messages, so the table is never shared.

use super::{
    Frame, StreamId, StreamState, TunnelError, TunnelStream, DEFAULT_BODY_TIMEOUT,
    DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_STREAMS,
};
use crate::forwarder::{ForwardError, Forwarder, LocalResponse};
use crate::supervisor::TunnelEvent;
use crate::transport::SessionSender;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Multiplexer limits
#[derive(Debug, Clone)]
pub struct MultiplexerLimits {
    /// Concurrent streams before new ones are answered with 503
    pub max_streams: usize,
    /// Largest request body accepted, streamed or not
    pub max_body_size: usize,
    /// Response bodies above this size are split into `StreamData` frames
    pub max_chunk_size: usize,
    /// How long a streamed request body may stall before the stream gets 408
    pub body_timeout: Duration,
}

impl Default for MultiplexerLimits {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            body_timeout: DEFAULT_BODY_TIMEOUT,
        }
    }
}

/// Command sent to the dispatcher task
enum MuxCommand {
    /// A new transport generation is live
    Attach {
        generation: u64,
        sender: SessionSender,
    },
    /// Stream frame read from the transport
    Inbound { generation: u64, frame: Frame },
    /// Transport lost: fail everything in flight
    FailAll {
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    /// Resolve once no stream is in flight
    Drain { reply: oneshot::Sender<()> },
    /// Current stream table
    Snapshot {
        reply: oneshot::Sender<Vec<(StreamId, StreamState)>>,
    },
}

/// Local call finished
struct Completion {
    generation: u64,
    stream_id: StreamId,
    result: Result<LocalResponse, ForwardError>,
}

/// Cloneable handle to the dispatcher task
#[derive(Clone)]
pub struct MultiplexerHandle {
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
}

impl MultiplexerHandle {
    /// Bind the multiplexer to a freshly activated transport
    pub fn attach(&self, generation: u64, sender: SessionSender) -> Result<(), TunnelError> {
        self.send(MuxCommand::Attach { generation, sender })
    }

    /// Hand an inbound stream frame to the dispatcher
    pub fn dispatch(&self, generation: u64, frame: Frame) -> Result<(), TunnelError> {
        self.send(MuxCommand::Inbound { generation, frame })
    }

    /// Fail every tracked stream; returns how many were failed
    pub async fn fail_all_streams(&self, reason: impl Into<String>) -> Result<usize, TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.send(MuxCommand::FailAll {
            reason: reason.into(),
            reply,
        })?;
        rx.await.map_err(|_| TunnelError::MultiplexerClosed)
    }

    /// Stop accepting streams and wait until every in-flight one has
    /// completed or failed
    ///
    /// New streams are refused with 503 from the moment this is called, not
    /// from the first poll of the returned future.
    pub fn drain(&self) -> impl Future<Output = Result<(), TunnelError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.send(MuxCommand::Drain { reply });
        async move {
            sent?;
            rx.await.map_err(|_| TunnelError::MultiplexerClosed)
        }
    }

    /// Ids and states of the streams currently tracked
    pub async fn snapshot(&self) -> Result<Vec<(StreamId, StreamState)>, TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.send(MuxCommand::Snapshot { reply })?;
        rx.await.map_err(|_| TunnelError::MultiplexerClosed)
    }

    fn send(&self, cmd: MuxCommand) -> Result<(), TunnelError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| TunnelError::MultiplexerClosed)
    }
}

/// Stream multiplexer
pub struct Multiplexer {
    forwarder: Arc<dyn Forwarder>,
    limits: MultiplexerLimits,
    /// In-flight streams of the current generation
    streams: HashMap<StreamId, TunnelStream>,
    generation: u64,
    sender: Option<SessionSender>,
    /// Highest stream id seen in this generation
    last_stream_id: Option<StreamId>,
    cmd_rx: mpsc::UnboundedReceiver<MuxCommand>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Sender<TunnelEvent>,
    drain_waiters: Vec<oneshot::Sender<()>>,
    /// Set by `drain`; new streams are refused until the next transport
    draining: bool,
}

impl Multiplexer {
    /// Create a multiplexer and its handle; call [`Multiplexer::run`] to start it
    pub fn new(
        forwarder: Arc<dyn Forwarder>,
        limits: MultiplexerLimits,
        events: broadcast::Sender<TunnelEvent>,
    ) -> (Self, MultiplexerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let mux = Self {
            forwarder,
            limits,
            streams: HashMap::new(),
            generation: 0,
            sender: None,
            last_stream_id: None,
            cmd_rx,
            done_tx,
            done_rx,
            events,
            drain_waiters: Vec::new(),
            draining: false,
        };
        (mux, MultiplexerHandle { cmd_tx })
    }

    /// Create and spawn the dispatcher task
    pub fn spawn(
        forwarder: Arc<dyn Forwarder>,
        limits: MultiplexerLimits,
        events: broadcast::Sender<TunnelEvent>,
    ) -> (MultiplexerHandle, JoinHandle<()>) {
        let (mux, handle) = Self::new(forwarder, limits, events);
        (handle, tokio::spawn(mux.run()))
    }

    /// Dispatcher loop; ends when every handle is dropped
    pub async fn run(mut self) {
        let period = (self.limits.body_timeout / 4).max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(done) = self.done_rx.recv() => self.handle_completion(done),
                _ = sweep.tick() => self.expire_stalled_bodies(),
            }
        }

        self.fail_all("multiplexer stopped");
        debug!("Multiplexer stopped");
    }

    fn handle_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::Attach { generation, sender } => {
                if !self.streams.is_empty() {
                    self.fail_all("superseded by a new transport");
                }
                debug!("Multiplexer attached to transport generation {}", generation);
                self.generation = generation;
                self.sender = Some(sender);
                self.last_stream_id = None;
                self.draining = false;
            }
            MuxCommand::Inbound { generation, frame } => {
                if generation != self.generation || self.sender.is_none() {
                    debug!(
                        "Dropping {:?} frame from stale generation {}",
                        frame.frame_type(),
                        generation
                    );
                    return;
                }
                self.handle_frame(frame);
            }
            MuxCommand::FailAll { reason, reply } => {
                let failed = self.fail_all(&reason);
                self.sender = None;
                let _ = reply.send(failed);
            }
            MuxCommand::Drain { reply } => {
                self.draining = true;
                if self.streams.is_empty() {
                    let _ = reply.send(());
                } else {
                    self.drain_waiters.push(reply);
                }
            }
            MuxCommand::Snapshot { reply } => {
                let mut table: Vec<_> = self
                    .streams
                    .values()
                    .map(|s| (s.id(), s.state()))
                    .collect();
                table.sort_by_key(|(id, _)| *id);
                let _ = reply.send(table);
            }
        }
    }

    /// Handle an incoming stream frame
    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::OpenStream {
                stream_id,
                method,
                path,
                headers,
                body,
                body_follows,
            } => self.handle_open_stream(
                TunnelStream::new(stream_id, self.generation, method, path, headers, body),
                body_follows,
            ),
            Frame::StreamData { stream_id, chunk } => self.handle_stream_data(stream_id, chunk),
            Frame::CloseStream { stream_id, .. } => {
                warn!(
                    "Protocol violation: broker sent CloseStream for stream {}",
                    stream_id
                );
            }
            Frame::Error {
                stream_id: Some(stream_id),
                message,
            } => {
                warn!("Broker reported error on stream {}: {}", stream_id, message);
                if let Some(mut stream) = self.streams.remove(&stream_id) {
                    let reason = format!("broker aborted stream: {}", message);
                    if stream.fail(reason.clone()) {
                        self.report_failed(stream_id, reason);
                    }
                    self.notify_drained();
                }
            }
            Frame::Error {
                stream_id: None,
                message,
            } => warn!("Broker reported error: {}", message),
            other => debug!("Ignoring {:?} frame in multiplexer", other.frame_type()),
        }
    }

    /// Handle an `OpenStream` frame
    fn handle_open_stream(&mut self, mut stream: TunnelStream, body_follows: bool) {
        let stream_id = stream.id();

        if self.streams.contains_key(&stream_id)
            || self.last_stream_id.is_some_and(|last| stream_id <= last)
        {
            warn!(
                "Protocol violation: stream id {} reused or out of order",
                stream_id
            );
            self.emit(Frame::stream_error(stream_id, "duplicate or non-increasing stream id"));
            return;
        }
        self.last_stream_id = Some(stream_id);

        if self.draining {
            debug!("Rejecting stream {}: shutting down", stream_id);
            self.emit(Frame::close_with_status(
                stream_id,
                503,
                "tunnel client is shutting down",
            ));
            return;
        }

        if self.streams.len() >= self.limits.max_streams {
            debug!(
                "Rejecting stream {}: {} streams in flight",
                stream_id,
                self.streams.len()
            );
            self.emit(Frame::close_with_status(
                stream_id,
                503,
                "tunnel client is at capacity",
            ));
            return;
        }

        if stream.body_len() > self.limits.max_body_size {
            self.emit(Frame::close_with_status(stream_id, 413, "request body too large"));
            return;
        }

        debug!("Opened stream {}: {}", stream_id, stream.describe());

        if body_follows {
            self.streams.insert(stream_id, stream);
            return;
        }

        match stream.start_forwarding() {
            Ok(request) => {
                self.spawn_forward(&mut stream, request);
                self.streams.insert(stream_id, stream);
            }
            Err(e) => warn!("Cannot forward stream {}: {}", stream_id, e),
        }
    }

    /// Handle a request body chunk; an empty chunk ends the body
    fn handle_stream_data(&mut self, stream_id: StreamId, chunk: Bytes) {
        let Some(mut stream) = self.streams.remove(&stream_id) else {
            warn!("Dropping data for unknown stream {} ({} bytes)", stream_id, chunk.len());
            return;
        };

        if chunk.is_empty() {
            match stream.start_forwarding() {
                Ok(request) => {
                    self.spawn_forward(&mut stream, request);
                    self.streams.insert(stream_id, stream);
                }
                Err(e) => {
                    warn!("Protocol violation on stream {}: {}", stream_id, e);
                    self.streams.insert(stream_id, stream);
                }
            }
            return;
        }

        match stream.push_body(&chunk, self.limits.max_body_size) {
            Ok(()) => {
                self.streams.insert(stream_id, stream);
            }
            Err(TunnelError::BodyTooLarge(..)) => {
                self.finish(stream, vec![Frame::close_with_status(
                    stream_id,
                    413,
                    "request body too large",
                )]);
            }
            Err(e) => {
                warn!("Protocol violation on stream {}: {}", stream_id, e);
                self.streams.insert(stream_id, stream);
            }
        }
    }

    /// Answer 408 on streams whose request body stopped arriving
    fn expire_stalled_bodies(&mut self) {
        let stalled: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| s.state() == StreamState::Open && s.idle() >= self.limits.body_timeout)
            .map(|s| s.id())
            .collect();

        for stream_id in stalled {
            if let Some(stream) = self.streams.remove(&stream_id) {
                warn!(
                    "Request body for stream {} ({}) stalled for {:?}",
                    stream_id,
                    stream.describe(),
                    stream.idle()
                );
                self.finish(
                    stream,
                    vec![Frame::close_with_status(stream_id, 408, "request body timed out")],
                );
            }
        }
    }

    /// Run the local call on its own task
    fn spawn_forward(&self, stream: &mut TunnelStream, request: crate::forwarder::LocalRequest) {
        let forwarder = Arc::clone(&self.forwarder);
        let done_tx = self.done_tx.clone();
        let generation = self.generation;
        let stream_id = stream.id();

        let task = tokio::spawn(async move {
            let result = forwarder.forward(request).await;
            let _ = done_tx.send(Completion {
                generation,
                stream_id,
                result,
            });
        });
        stream.set_task(task.abort_handle());
    }

    fn handle_completion(&mut self, done: Completion) {
        if done.generation != self.generation {
            debug!(
                "Discarding result for stream {} of generation {}",
                done.stream_id, done.generation
            );
            return;
        }
        let Some(stream) = self.streams.remove(&done.stream_id) else {
            debug!("Discarding result for finished stream {}", done.stream_id);
            return;
        };

        let frames = match done.result {
            Ok(response) => {
                debug!(
                    "Stream {} answered {} ({} bytes) after {:?}",
                    done.stream_id,
                    response.status,
                    response.body.len(),
                    stream.age()
                );
                response_frames(done.stream_id, response, self.limits.max_chunk_size)
            }
            Err(e) => {
                warn!("Forwarding failed for stream {} ({}): {}", done.stream_id, stream.describe(), e);
                vec![Frame::close_with_status(
                    done.stream_id,
                    e.gateway_status(),
                    &e.to_string(),
                )]
            }
        };

        self.finish(stream, frames);
    }

    /// Emit a stream's final frames and retire it
    fn finish(&mut self, mut stream: TunnelStream, frames: Vec<Frame>) {
        let stream_id = stream.id();
        let status = frames.iter().rev().find_map(|f| match f {
            Frame::CloseStream { status, .. } => Some(*status),
            _ => None,
        });

        let sent = frames.into_iter().all(|frame| self.emit(frame));

        match (sent, status) {
            (true, Some(status)) => {
                if let Err(e) = stream.complete(status) {
                    warn!("{}", e);
                }
            }
            _ => {
                let reason = "session closed before response was sent".to_string();
                if stream.fail(reason.clone()) {
                    self.report_failed(stream_id, reason);
                }
            }
        }

        self.notify_drained();
    }

    /// Send a frame on the current transport
    fn emit(&self, frame: Frame) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("Cannot send frame: {}", e);
                false
            }
        }
    }

    fn fail_all(&mut self, reason: &str) -> usize {
        let mut failed = 0;
        let mut streams: Vec<_> = self.streams.drain().map(|(_, s)| s).collect();
        streams.sort_by_key(|s| s.id());

        for mut stream in streams {
            if stream.fail(reason) {
                failed += 1;
                self.report_failed(stream.id(), reason.to_string());
            }
        }

        if failed > 0 {
            info!("Failed {} in-flight streams: {}", failed, reason);
        }
        self.notify_drained();
        failed
    }

    fn report_failed(&self, stream_id: StreamId, reason: String) {
        warn!("Stream {} failed: {}", stream_id, reason);
        let _ = self
            .events
            .send(TunnelEvent::StreamFailed { stream_id, reason });
    }

    fn notify_drained(&mut self) {
        if self.streams.is_empty() {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

/// Split a response into `StreamData` chunks plus a final `CloseStream`
fn response_frames(stream_id: StreamId, response: LocalResponse, max_chunk_size: usize) -> Vec<Frame> {
    let LocalResponse {
        status,
        headers,
        mut body,
    } = response;

    let mut frames = Vec::new();
    while body.len() > max_chunk_size {
        let chunk = body.split_to(max_chunk_size);
        frames.push(Frame::StreamData { stream_id, chunk });
    }
    frames.push(Frame::close_stream(stream_id, status, headers, body));
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::LocalRequest;
    use crate::transport::{send_queue, ConnectionState};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::time::timeout;

    /// Answers by path: `/slow` and `/fast` race, `/down` and `/timeout` fail,
    /// `/hang` never returns
    struct ScriptedForwarder;

    #[async_trait]
    impl Forwarder for ScriptedForwarder {
        async fn forward(&self, request: LocalRequest) -> Result<LocalResponse, ForwardError> {
            let ok = |body: &[u8]| LocalResponse {
                status: 200,
                headers: Vec::new(),
                body: Bytes::copy_from_slice(body),
            };
            match request.path.as_str() {
                "/slow" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(ok(b"slow"))
                }
                "/fast" => Ok(ok(b"fast")),
                "/echo" => Ok(LocalResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: request.body,
                }),
                "/down" => Err(ForwardError::ConnectionRefused("connection refused".into())),
                "/timeout" => Err(ForwardError::Timeout(Duration::from_secs(30))),
                "/hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ok(b"never"))
                }
                _ => Ok(LocalResponse {
                    status: 404,
                    headers: Vec::new(),
                    body: Bytes::new(),
                }),
            }
        }
    }

    struct Harness {
        mux: MultiplexerHandle,
        frames: mpsc::UnboundedReceiver<Frame>,
        events: broadcast::Receiver<TunnelEvent>,
        state: watch::Sender<ConnectionState>,
    }

    fn harness(limits: MultiplexerLimits) -> Harness {
        let (events_tx, events) = broadcast::channel(64);
        let (mux, _task) = Multiplexer::spawn(Arc::new(ScriptedForwarder), limits, events_tx);
        let (state, state_rx) = watch::channel(ConnectionState::Active);
        let (sender, frames) = send_queue(state_rx);
        mux.attach(1, sender).unwrap();
        Harness {
            mux,
            frames,
            events,
            state,
        }
    }

    fn open(id: StreamId, path: &str) -> Frame {
        Frame::open_stream(id, "GET", path, Vec::new(), Bytes::new())
    }

    async fn next_frame(h: &mut Harness) -> Frame {
        timeout(Duration::from_secs(5), h.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("send queue closed")
    }

    fn close_parts(frame: Frame) -> (StreamId, u16, Bytes) {
        match frame {
            Frame::CloseStream {
                stream_id,
                status,
                body,
                ..
            } => (stream_id, status, body),
            other => panic!("expected CloseStream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_stream_yields_close_stream() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(1, "/fast")).unwrap();

        let (id, status, body) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (1, 200));
        assert_eq!(&body[..], b"fast");
        h.mux.drain().await.unwrap();
        assert!(h.mux.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streams_complete_out_of_order() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(1, "/slow")).unwrap();
        h.mux.dispatch(1, open(2, "/fast")).unwrap();

        let first = close_parts(next_frame(&mut h).await);
        let second = close_parts(next_frame(&mut h).await);
        assert_eq!(first.0, 2);
        assert_eq!(second.0, 1);
        assert_eq!(&second.2[..], b"slow");
    }

    #[tokio::test]
    async fn test_forward_error_becomes_bad_gateway() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(2, "/down")).unwrap();

        let (id, status, body) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (2, 502));
        assert!(String::from_utf8_lossy(&body).contains("refused"));
    }

    #[tokio::test]
    async fn test_backpressure_answers_service_unavailable() {
        let mut h = harness(MultiplexerLimits {
            max_streams: 1,
            ..Default::default()
        });
        h.mux.dispatch(1, open(1, "/hang")).unwrap();
        h.mux.dispatch(1, open(2, "/fast")).unwrap();

        let (id, status, _) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (2, 503));
        assert_eq!(
            h.mux.snapshot().await.unwrap(),
            vec![(1, StreamState::Forwarding)]
        );
    }

    #[tokio::test]
    async fn test_fail_all_reports_each_stream_once() {
        let mut h = harness(MultiplexerLimits::default());
        for id in 1..=3 {
            h.mux.dispatch(1, open(id, "/hang")).unwrap();
        }
        assert_eq!(h.mux.snapshot().await.unwrap().len(), 3);

        assert_eq!(h.mux.fail_all_streams("transport lost").await.unwrap(), 3);
        assert_eq!(h.mux.fail_all_streams("transport lost").await.unwrap(), 0);

        let mut failed = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let TunnelEvent::StreamFailed { stream_id, .. } = event {
                failed.push(stream_id);
            }
        }
        assert_eq!(failed, vec![1, 2, 3]);
        assert!(h.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_generation_accepts_reused_ids() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(1, "/hang")).unwrap();
        h.mux.fail_all_streams("transport lost").await.unwrap();

        // Frames from the dead generation are ignored
        h.mux.dispatch(1, open(2, "/fast")).unwrap();

        let (state, state_rx) = watch::channel(ConnectionState::Active);
        let (sender, mut frames) = send_queue(state_rx);
        h.mux.attach(2, sender).unwrap();
        h.mux.dispatch(2, open(1, "/fast")).unwrap();

        let frame = timeout(Duration::from_secs(5), frames.recv()).await.unwrap().unwrap();
        assert_eq!(close_parts(frame).0, 1);
        assert!(h.frames.try_recv().is_err());
        drop(state);
    }

    #[tokio::test]
    async fn test_streamed_request_body() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux
            .dispatch(
                1,
                Frame::OpenStream {
                    stream_id: 5,
                    method: "POST".to_string(),
                    path: "/echo".to_string(),
                    headers: Vec::new(),
                    body: Bytes::from_static(b"hello "),
                    body_follows: true,
                },
            )
            .unwrap();
        for chunk in [&b"tunnel"[..], b" world", b""] {
            h.mux
                .dispatch(
                    1,
                    Frame::StreamData {
                        stream_id: 5,
                        chunk: Bytes::copy_from_slice(chunk),
                    },
                )
                .unwrap();
        }

        let (id, status, body) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (5, 200));
        assert_eq!(&body[..], b"hello tunnel world");
    }

    #[tokio::test]
    async fn test_large_response_is_chunked() {
        let mut h = harness(MultiplexerLimits {
            max_chunk_size: 4,
            ..Default::default()
        });
        h.mux
            .dispatch(
                1,
                Frame::open_stream(1, "POST", "/echo", Vec::new(), Bytes::from_static(b"0123456789")),
            )
            .unwrap();

        let mut data = Vec::new();
        loop {
            match next_frame(&mut h).await {
                Frame::StreamData { stream_id, chunk } => {
                    assert_eq!(stream_id, 1);
                    assert_eq!(chunk.len(), 4);
                    data.extend_from_slice(&chunk);
                }
                frame => {
                    let (_, status, body) = close_parts(frame);
                    assert_eq!(status, 200);
                    data.extend_from_slice(&body);
                    break;
                }
            }
        }
        assert_eq!(&data[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let mut h = harness(MultiplexerLimits {
            max_body_size: 4,
            ..Default::default()
        });
        h.mux
            .dispatch(
                1,
                Frame::open_stream(1, "POST", "/echo", Vec::new(), Bytes::from_static(b"too big")),
            )
            .unwrap();

        let (id, status, _) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (1, 413));
    }

    #[tokio::test]
    async fn test_duplicate_stream_id_is_a_protocol_error() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(4, "/hang")).unwrap();
        h.mux.dispatch(1, open(4, "/fast")).unwrap();

        match next_frame(&mut h).await {
            Frame::Error { stream_id, .. } => assert_eq!(stream_id, Some(4)),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_close_stream_is_ignored() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux
            .dispatch(1, Frame::close_stream(9, 200, Vec::new(), Bytes::new()))
            .unwrap();
        h.mux.dispatch(1, open(1, "/fast")).unwrap();

        let (id, status, _) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (1, 200));
    }

    #[tokio::test]
    async fn test_broker_error_aborts_stream() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(1, "/hang")).unwrap();
        h.mux
            .dispatch(1, Frame::stream_error(1, "client went away"))
            .unwrap();

        timeout(Duration::from_secs(5), h.mux.drain()).await.unwrap().unwrap();
        match h.events.recv().await.unwrap() {
            TunnelEvent::StreamFailed { stream_id, .. } => assert_eq!(stream_id, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_timeout_becomes_gateway_timeout() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(1, "/timeout")).unwrap();

        let (id, status, body) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (1, 504));
        assert!(String::from_utf8_lossy(&body).contains("timed out"));
    }

    #[tokio::test]
    async fn test_streamed_body_over_limit_is_rejected() {
        let mut h = harness(MultiplexerLimits {
            max_body_size: 8,
            ..Default::default()
        });
        h.mux
            .dispatch(
                1,
                Frame::OpenStream {
                    stream_id: 1,
                    method: "POST".to_string(),
                    path: "/echo".to_string(),
                    headers: Vec::new(),
                    body: Bytes::from_static(b"hello"),
                    body_follows: true,
                },
            )
            .unwrap();
        h.mux
            .dispatch(
                1,
                Frame::StreamData {
                    stream_id: 1,
                    chunk: Bytes::from_static(b" world"),
                },
            )
            .unwrap();

        let (id, status, _) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (1, 413));
        assert!(h.mux.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_for_unknown_stream_is_dropped() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux
            .dispatch(
                1,
                Frame::StreamData {
                    stream_id: 42,
                    chunk: Bytes::from_static(b"orphan"),
                },
            )
            .unwrap();
        h.mux.dispatch(1, open(1, "/fast")).unwrap();

        let (id, status, _) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (1, 200));
        assert!(h.mux.snapshot().await.unwrap().is_empty());
        assert!(h.frames.try_recv().is_err());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsendable_response_fails_stream() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(1, "/slow")).unwrap();
        assert_eq!(h.mux.snapshot().await.unwrap().len(), 1);

        // The session stops accepting frames while the local call runs
        h.state.send_replace(ConnectionState::Disconnected);

        let event = timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TunnelEvent::StreamFailed { stream_id, reason } => {
                assert_eq!(stream_id, 1);
                assert!(reason.contains("session closed"), "{}", reason);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(h.mux.snapshot().await.unwrap().is_empty());
        assert!(h.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_refuses_new_streams() {
        let mut h = harness(MultiplexerLimits::default());
        h.mux.dispatch(1, open(1, "/hang")).unwrap();

        let drained = h.mux.drain();
        h.mux.dispatch(1, open(2, "/fast")).unwrap();

        let (id, status, body) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (2, 503));
        assert!(String::from_utf8_lossy(&body).contains("shutting down"));

        h.mux
            .dispatch(1, Frame::stream_error(1, "client went away"))
            .unwrap();
        timeout(Duration::from_secs(5), drained).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_times_out() {
        let mut h = harness(MultiplexerLimits {
            body_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        h.mux
            .dispatch(
                1,
                Frame::OpenStream {
                    stream_id: 7,
                    method: "PUT".to_string(),
                    path: "/echo".to_string(),
                    headers: Vec::new(),
                    body: Bytes::from_static(b"partial"),
                    body_follows: true,
                },
            )
            .unwrap();
        assert_eq!(h.mux.snapshot().await.unwrap(), vec![(7, StreamState::Open)]);

        let (id, status, _) = close_parts(next_frame(&mut h).await);
        assert_eq!((id, status), (7, 408));
        assert!(h.mux.snapshot().await.unwrap().is_empty());
    }

    #[test]
    fn test_response_frames_split() {
        let frames = response_frames(
            3,
            LocalResponse {
                status: 200,
                headers: Vec::new(),
                body: Bytes::from_static(b"abcdefgh"),
            },
            4,
        );
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::StreamData { stream_id: 3, .. }));
        assert!(matches!(frames[1], Frame::CloseStream { stream_id: 3, .. }));
    }
}
