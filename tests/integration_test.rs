//! Integration tests for the Tunlify client
//!
//! Drives a full supervisor against a scripted in-process broker:
//! - Handshake, heartbeats and request forwarding
//! - Reconnects and the fate of in-flight streams
//! - Backpressure and graceful shutdown
//! - The WebSocket broker endpoint

use async_trait::async_trait;
use async_tungstenite::tokio::{accept_async, TokioAdapter};
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tunlify::forwarder::{
    ForwardError, Forwarder, ForwarderConfig, HttpForwarder, LocalRequest, LocalResponse,
};
use tunlify::supervisor::{ReconnectPolicy, SupervisorConfig};
use tunlify::transport::SessionConfig;
use tunlify::tunnel::{Frame, MultiplexerLimits, RejectCode, StreamId};
use tunlify::{Supervisor, TunnelEvent, TunnelHandle, TunnelSession};

const STEP: Duration = Duration::from_secs(5);

/// Scripted broker listening on a real socket
struct Broker {
    listener: TcpListener,
}

impl Broker {
    async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn url(&self) -> String {
        format!("tcp://{}", self.listener.local_addr().unwrap())
    }

    /// Accept the next client and consume its `Hello`
    async fn accept(&self) -> BrokerConn {
        let (socket, _) = timeout(STEP, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        let mut conn = BrokerConn {
            socket,
            buf: BytesMut::new(),
        };
        match conn.recv().await {
            Some(Frame::Hello {
                version,
                tunnel_id,
                local_addr,
            }) => {
                assert_eq!(version, tunlify::PROTOCOL_VERSION);
                assert_eq!(tunnel_id, "tun-test");
                assert!(!local_addr.is_empty());
            }
            other => panic!("expected Hello, got {:?}", other),
        }
        conn
    }

    /// Accept and greet a client
    async fn accept_welcome(&self) -> BrokerConn {
        let mut conn = self.accept().await;
        conn.send(Frame::Welcome {
            tunnel_url: "https://test.tunlify.biz.id".to_string(),
        })
        .await;
        conn
    }
}

/// One accepted client connection, seen from the broker
struct BrokerConn {
    socket: TcpStream,
    buf: BytesMut,
}

impl BrokerConn {
    async fn send(&mut self, frame: Frame) {
        self.socket
            .write_all(&frame.encode().unwrap())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf, 1 << 20).unwrap() {
                return Some(frame);
            }
            match timeout(STEP, self.socket.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for client frame")
            {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Next frame that is not a client heartbeat
    async fn recv_frame(&mut self) -> Frame {
        loop {
            match self.recv().await {
                Some(Frame::Heartbeat { .. }) => continue,
                Some(frame) => return frame,
                None => panic!("client closed the connection"),
            }
        }
    }

    async fn recv_close(&mut self) -> (StreamId, u16, Bytes) {
        match self.recv_frame().await {
            Frame::CloseStream {
                stream_id,
                status,
                body,
                ..
            } => (stream_id, status, body),
            other => panic!("expected CloseStream, got {:?}", other),
        }
    }

    async fn open(&mut self, stream_id: StreamId, path: &str) {
        self.send(Frame::open_stream(
            stream_id,
            "GET",
            path,
            vec![
                ("x-tunnel-region".to_string(), Bytes::from_static(b"sg")),
                ("X-Forwarded-For".to_string(), Bytes::from_static(b"198.51.100.4")),
            ],
            Bytes::new(),
        ))
        .await;
    }
}

/// In-memory local service: `/fast`, `/slow` (300ms), `/hang` (never answers)
struct ScriptedForwarder;

#[async_trait]
impl Forwarder for ScriptedForwarder {
    async fn forward(&self, request: LocalRequest) -> Result<LocalResponse, ForwardError> {
        match request.path.as_str() {
            "/slow" => tokio::time::sleep(Duration::from_millis(300)).await,
            "/hang" => tokio::time::sleep(Duration::from_secs(3600)).await,
            _ => {}
        }
        Ok(LocalResponse {
            status: 200,
            headers: vec![("content-type".to_string(), Bytes::from_static(b"text/plain"))],
            body: Bytes::from(request.path),
        })
    }
}

/// Minimal HTTP/1.1 service on a real socket
async fn local_http_service() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);
                let (status, body) = if request.starts_with("GET /health ") {
                    let lower = request.to_ascii_lowercase();
                    if lower.contains("x-tunnel-region") || lower.contains("x-forwarded-for") {
                        ("400 Bad Request", "leaked broker header")
                    } else {
                        ("200 OK", "{\"status\":\"ok\"}")
                    }
                } else {
                    ("404 Not Found", "not found")
                };
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

fn tunnel(broker: &Broker, local_addr: &str) -> TunnelSession {
    TunnelSession {
        tunnel_id: "tun-test".to_string(),
        tunnel_url: "https://test.tunlify.biz.id".to_string(),
        local_addr: local_addr.to_string(),
        broker: broker.url(),
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            ..Default::default()
        },
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn start(
    session: TunnelSession,
    config: SupervisorConfig,
    forwarder: Arc<dyn Forwarder>,
) -> (TunnelHandle, broadcast::Receiver<TunnelEvent>) {
    let supervisor = Supervisor::new(session, config, forwarder);
    let events = supervisor.subscribe();
    (supervisor.start(), events)
}

async fn next_event(events: &mut broadcast::Receiver<TunnelEvent>) -> TunnelEvent {
    timeout(STEP, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `done`
async fn events_until(
    events: &mut broadcast::Receiver<TunnelEvent>,
    done: impl Fn(&TunnelEvent) -> bool,
) -> Vec<TunnelEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

fn is_active(generation: u64) -> impl Fn(&TunnelEvent) -> bool {
    move |event| matches!(event, TunnelEvent::Active { generation: g, .. } if *g == generation)
}

#[tokio::test]
async fn test_health_request_round_trip() {
    let broker = Broker::bind().await;
    let local = local_http_service().await;
    let forwarder = HttpForwarder::new(ForwarderConfig::new(&local)).unwrap();
    let (mut handle, mut events) = start(tunnel(&broker, &local), fast_config(), Arc::new(forwarder));

    let mut conn = broker.accept_welcome().await;
    let seen = events_until(&mut events, is_active(1)).await;
    assert_eq!(seen[0], TunnelEvent::Connecting { generation: 1 });
    assert_eq!(
        seen[1],
        TunnelEvent::Active {
            generation: 1,
            tunnel_url: "https://test.tunlify.biz.id".to_string(),
        }
    );

    conn.open(1, "/health").await;
    let (id, status, body) = conn.recv_close().await;
    assert_eq!((id, status), (1, 200));
    assert_eq!(&body[..], b"{\"status\":\"ok\"}");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_local_service_down_keeps_transport_active() {
    let broker = Broker::bind().await;
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = closed.local_addr().unwrap().to_string();
    drop(closed);

    let forwarder = HttpForwarder::new(ForwarderConfig::new(&local)).unwrap();
    let (mut handle, mut events) = start(tunnel(&broker, &local), fast_config(), Arc::new(forwarder));

    let mut conn = broker.accept_welcome().await;
    events_until(&mut events, is_active(1)).await;

    conn.open(2, "/").await;
    let (id, status, body) = conn.recv_close().await;
    assert_eq!((id, status), (2, 502));
    assert!(!body.is_empty());

    // Still the same live session
    conn.send(Frame::Heartbeat { timestamp: 7 }).await;
    assert_eq!(conn.recv_frame().await, Frame::HeartbeatAck { timestamp: 7 });
    assert!(events.try_recv().is_err());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_completion() {
    let broker = Broker::bind().await;
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        fast_config(),
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept_welcome().await;
    events_until(&mut events, is_active(1)).await;

    conn.open(1, "/slow").await;
    conn.open(2, "/fast").await;

    let first = conn.recv_close().await;
    let second = conn.recv_close().await;
    assert_eq!((first.0, &first.2[..]), (2, &b"/fast"[..]));
    assert_eq!((second.0, &second.2[..]), (1, &b"/slow"[..]));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_mid_session_drop_fails_stream_before_reconnect() {
    let broker = Broker::bind().await;
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        fast_config(),
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept_welcome().await;
    events_until(&mut events, is_active(1)).await;

    conn.open(3, "/hang").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(conn);

    let mut conn = broker.accept_welcome().await;
    let seen = events_until(&mut events, is_active(2)).await;

    let failed = seen
        .iter()
        .position(|e| matches!(e, TunnelEvent::StreamFailed { stream_id: 3, .. }))
        .expect("stream 3 was not reported failed");
    let reconnecting = seen
        .iter()
        .position(|e| matches!(e, TunnelEvent::Reconnecting { .. }))
        .expect("no reconnect event");
    assert!(failed < reconnecting);
    assert!(seen.contains(&TunnelEvent::Connecting { generation: 2 }));

    // The new generation serves requests, ids start over
    conn.open(1, "/fast").await;
    let (id, status, _) = conn.recv_close().await;
    assert_eq!((id, status), (1, 200));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_streams_fail_exactly_once() {
    let broker = Broker::bind().await;
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        fast_config(),
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept_welcome().await;
    events_until(&mut events, is_active(1)).await;

    for id in 1..=5 {
        conn.open(id, "/hang").await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(conn);

    let _conn = broker.accept_welcome().await;
    let seen = events_until(&mut events, is_active(2)).await;

    let mut failed: Vec<StreamId> = seen
        .iter()
        .filter_map(|e| match e {
            TunnelEvent::StreamFailed { stream_id, .. } => Some(*stream_id),
            _ => None,
        })
        .collect();
    failed.sort_unstable();
    assert_eq!(failed, vec![1, 2, 3, 4, 5]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_drains_then_goaway() {
    let broker = Broker::bind().await;
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        fast_config(),
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept_welcome().await;
    events_until(&mut events, is_active(1)).await;

    conn.open(1, "/slow").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();
    handle.shutdown();

    // Streams opened while draining are turned away
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.open(2, "/fast").await;
    let (id, status, _) = conn.recv_close().await;
    assert_eq!((id, status), (2, 503));

    let (id, status, _) = conn.recv_close().await;
    assert_eq!((id, status), (1, 200));
    assert!(matches!(conn.recv_frame().await, Frame::GoAway { .. }));
    assert!(conn.recv().await.is_none());

    assert_eq!(handle.wait().await, Ok(()));
    assert_eq!(handle.stop().await, Ok(()));
    let seen = events_until(&mut events, |e| e.is_terminal()).await;
    assert_eq!(seen.last(), Some(&TunnelEvent::Stopped));
}

#[tokio::test]
async fn test_auth_rejected_is_fatal() {
    let broker = Broker::bind().await;
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        fast_config(),
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept().await;
    conn.send(Frame::Reject {
        code: RejectCode::Unauthorized,
        message: "invalid connection token".to_string(),
    })
    .await;

    let err = timeout(STEP, handle.wait()).await.unwrap().unwrap_err();
    assert!(err.reason.contains("invalid connection token"));

    let seen = events_until(&mut events, |e| e.is_terminal()).await;
    assert!(matches!(seen.last(), Some(TunnelEvent::Fatal { .. })));
    assert!(!seen.iter().any(|e| matches!(e, TunnelEvent::Reconnecting { .. })));

    // No further attempts
    assert!(timeout(Duration::from_millis(300), broker.listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn test_protocol_mismatch_is_retried() {
    let broker = Broker::bind().await;
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        fast_config(),
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept().await;
    conn.send(Frame::Reject {
        code: RejectCode::UnsupportedVersion,
        message: "upgrade required".to_string(),
    })
    .await;

    let _conn = broker.accept_welcome().await;
    let seen = events_until(&mut events, is_active(2)).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        TunnelEvent::Reconnecting { attempt: 1, reason, .. } if reason.contains("Protocol mismatch")
    )));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_backpressure_rejects_excess_streams() {
    let broker = Broker::bind().await;
    let config = SupervisorConfig {
        limits: MultiplexerLimits {
            max_streams: 2,
            ..Default::default()
        },
        drain_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        config,
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept_welcome().await;
    events_until(&mut events, is_active(1)).await;

    conn.open(1, "/hang").await;
    conn.open(2, "/hang").await;
    conn.open(3, "/fast").await;

    let (id, status, _) = conn.recv_close().await;
    assert_eq!((id, status), (3, 503));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_broker_triggers_reconnect() {
    let broker = Broker::bind().await;
    let config = SupervisorConfig {
        session: SessionConfig {
            heartbeat_interval: Duration::from_millis(100),
            ..Default::default()
        },
        ..fast_config()
    };
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        config,
        Arc::new(ScriptedForwarder),
    );

    // Accept but never speak again
    let _silent = broker.accept_welcome().await;
    let _conn = broker.accept_welcome().await;

    let seen = events_until(&mut events, is_active(2)).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        TunnelEvent::Reconnecting { reason, .. } if reason.contains("No frame from broker")
    )));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_goaway_triggers_reconnect() {
    let broker = Broker::bind().await;
    let (mut handle, mut events) = start(
        tunnel(&broker, "127.0.0.1:3000"),
        fast_config(),
        Arc::new(ScriptedForwarder),
    );

    let mut conn = broker.accept_welcome().await;
    events_until(&mut events, is_active(1)).await;
    conn.send(Frame::GoAway {
        message: "broker restarting".to_string(),
    })
    .await;

    let _conn = broker.accept_welcome().await;
    let seen = events_until(&mut events, is_active(2)).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        TunnelEvent::Reconnecting { reason, .. } if reason.contains("broker restarting")
    )));

    handle.stop().await.unwrap();
}

type WsBroker = WebSocketStream<TokioAdapter<TcpStream>>;

async fn ws_send(ws: &mut WsBroker, frame: Frame) {
    let bytes = frame.encode().unwrap();
    ws.send(Message::binary(bytes.to_vec())).await.unwrap();
}

/// Next frame from the client, one frame per binary message
async fn ws_recv(ws: &mut WsBroker) -> Frame {
    loop {
        let msg = timeout(STEP, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("client closed the WebSocket")
            .unwrap();
        if let Message::Binary(data) = msg {
            let mut buf = BytesMut::from(&data[..]);
            let frame = Frame::decode(&mut buf, 1 << 20).unwrap().unwrap();
            assert!(buf.is_empty(), "more than one frame in a message");
            if !matches!(frame, Frame::Heartbeat { .. }) {
                return frame;
            }
        }
    }
}

#[tokio::test]
async fn test_websocket_broker_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let session = TunnelSession {
        tunnel_id: "tun-ws".to_string(),
        tunnel_url: "https://ws.tunlify.biz.id".to_string(),
        local_addr: "127.0.0.1:3000".to_string(),
        broker: format!("ws://{}/ws/tunnel/tun-ws", addr),
    };
    let (mut handle, mut events) = start(session, fast_config(), Arc::new(ScriptedForwarder));

    let (socket, _) = timeout(STEP, listener.accept()).await.unwrap().unwrap();
    let mut ws = accept_async(socket).await.unwrap();

    match ws_recv(&mut ws).await {
        Frame::Hello { tunnel_id, .. } => assert_eq!(tunnel_id, "tun-ws"),
        other => panic!("expected Hello, got {:?}", other),
    }
    ws_send(
        &mut ws,
        Frame::Welcome {
            tunnel_url: "https://ws.tunlify.biz.id".to_string(),
        },
    )
    .await;
    events_until(&mut events, is_active(1)).await;

    ws_send(&mut ws, Frame::open_stream(1, "GET", "/fast", Vec::new(), Bytes::new())).await;
    match ws_recv(&mut ws).await {
        Frame::CloseStream {
            stream_id,
            status,
            body,
            ..
        } => {
            assert_eq!((stream_id, status), (1, 200));
            assert_eq!(&body[..], b"/fast");
        }
        other => panic!("expected CloseStream, got {:?}", other),
    }

    handle.stop().await.unwrap();
}
