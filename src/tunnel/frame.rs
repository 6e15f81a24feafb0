//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (all integers big endian):
//! ```text
//! +--------+--------+--------+--------+--------+
//! |           Length (4B)             |  Kind  |
//! +--------+--------+--------+--------+--------+
//! |              Body (Length - 1)             |
//! +--------+--------+--------+--------+--------+
//! ```
//!
//! Body field encodings:
//! ```text
//! string  := len:u16 utf8[len]
//! bytes   := len:u32 octet[len]
//! headers := count:u16 (name:string value:bytes)*
//! ```

use super::{StreamId, TunnelError};
use crate::{MAGIC, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Ordered, possibly repeated HTTP header fields with binary-safe values
pub type Headers = Vec<(String, Bytes)>;

/// `OpenStream` flag: the request body continues in `StreamData` frames
const FLAG_BODY_FOLLOWS: u8 = 0x01;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client greeting carrying the tunnel identity
    Hello = 0x01,
    /// Broker accepted the tunnel binding
    Welcome = 0x02,
    /// Broker refused the tunnel binding
    Reject = 0x03,
    /// New forwarded request
    OpenStream = 0x10,
    /// Body chunk for a stream
    StreamData = 0x11,
    /// Response for a stream (terminal)
    CloseStream = 0x12,
    /// Keepalive
    Heartbeat = 0x20,
    /// Keepalive acknowledgement
    HeartbeatAck = 0x21,
    /// Error report, optionally scoped to a stream
    Error = 0x30,
    /// Connection closing
    GoAway = 0x31,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, TunnelError> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::Welcome),
            0x03 => Ok(FrameType::Reject),
            0x10 => Ok(FrameType::OpenStream),
            0x11 => Ok(FrameType::StreamData),
            0x12 => Ok(FrameType::CloseStream),
            0x20 => Ok(FrameType::Heartbeat),
            0x21 => Ok(FrameType::HeartbeatAck),
            0x30 => Ok(FrameType::Error),
            0x31 => Ok(FrameType::GoAway),
            _ => Err(TunnelError::UnknownFrameType(value)),
        }
    }
}

/// Reason codes carried by `Reject`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// The broker does not know this tunnel id
    UnknownTunnel,
    /// The tunnel exists but this client may not bind it
    Unauthorized,
    /// The broker does not speak our protocol version
    UnsupportedVersion,
    /// Temporary refusal, try again later
    Busy,
    /// Code not known to this client
    Other(u8),
}

impl RejectCode {
    /// Whether the tunnel identity itself is invalid
    pub fn is_auth_failure(self) -> bool {
        matches!(self, RejectCode::UnknownTunnel | RejectCode::Unauthorized)
    }
}

impl From<u8> for RejectCode {
    fn from(value: u8) -> Self {
        match value {
            1 => RejectCode::UnknownTunnel,
            2 => RejectCode::Unauthorized,
            3 => RejectCode::UnsupportedVersion,
            4 => RejectCode::Busy,
            other => RejectCode::Other(other),
        }
    }
}

impl From<RejectCode> for u8 {
    fn from(code: RejectCode) -> Self {
        match code {
            RejectCode::UnknownTunnel => 1,
            RejectCode::Unauthorized => 2,
            RejectCode::UnsupportedVersion => 3,
            RejectCode::Busy => 4,
            RejectCode::Other(other) => other,
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello {
        version: u8,
        tunnel_id: String,
        local_addr: String,
    },
    Welcome {
        tunnel_url: String,
    },
    Reject {
        code: RejectCode,
        message: String,
    },
    OpenStream {
        stream_id: StreamId,
        method: String,
        path: String,
        headers: Headers,
        body: Bytes,
        body_follows: bool,
    },
    StreamData {
        stream_id: StreamId,
        chunk: Bytes,
    },
    CloseStream {
        stream_id: StreamId,
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    Error {
        stream_id: Option<StreamId>,
        message: String,
    },
    GoAway {
        message: String,
    },
}

impl Frame {
    /// Create the client greeting for the current protocol version
    pub fn hello(tunnel_id: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Frame::Hello {
            version: PROTOCOL_VERSION,
            tunnel_id: tunnel_id.into(),
            local_addr: local_addr.into(),
        }
    }

    /// Create a complete, non-streamed request frame
    pub fn open_stream(
        stream_id: StreamId,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: Headers,
        body: Bytes,
    ) -> Self {
        Frame::OpenStream {
            stream_id,
            method: method.into(),
            path: path.into(),
            headers,
            body,
            body_follows: false,
        }
    }

    /// Create a response frame
    pub fn close_stream(stream_id: StreamId, status: u16, headers: Headers, body: Bytes) -> Self {
        Frame::CloseStream {
            stream_id,
            status,
            headers,
            body,
        }
    }

    /// Create a synthesized plain-text response
    pub fn close_with_status(stream_id: StreamId, status: u16, message: &str) -> Self {
        Frame::CloseStream {
            stream_id,
            status,
            headers: vec![(
                "content-type".to_string(),
                Bytes::from_static(b"text/plain; charset=utf-8"),
            )],
            body: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    /// Create a stream-scoped error frame
    pub fn stream_error(stream_id: StreamId, message: impl Into<String>) -> Self {
        Frame::Error {
            stream_id: Some(stream_id),
            message: message.into(),
        }
    }

    /// Frame type discriminator
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Welcome { .. } => FrameType::Welcome,
            Frame::Reject { .. } => FrameType::Reject,
            Frame::OpenStream { .. } => FrameType::OpenStream,
            Frame::StreamData { .. } => FrameType::StreamData,
            Frame::CloseStream { .. } => FrameType::CloseStream,
            Frame::Heartbeat { .. } => FrameType::Heartbeat,
            Frame::HeartbeatAck { .. } => FrameType::HeartbeatAck,
            Frame::Error { .. } => FrameType::Error,
            Frame::GoAway { .. } => FrameType::GoAway,
        }
    }

    /// Stream this frame belongs to, if it is stream-scoped
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::OpenStream { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::CloseStream { stream_id, .. } => Some(*stream_id),
            Frame::Error { stream_id, .. } => *stream_id,
            _ => None,
        }
    }

    /// Encode frame to bytes, length prefix included
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0); // patched below
        buf.put_u8(self.frame_type() as u8);

        match self {
            Frame::Hello {
                version,
                tunnel_id,
                local_addr,
            } => {
                buf.extend_from_slice(&MAGIC);
                buf.put_u8(*version);
                put_string(&mut buf, tunnel_id)?;
                put_string(&mut buf, local_addr)?;
            }
            Frame::Welcome { tunnel_url } => put_string(&mut buf, tunnel_url)?,
            Frame::Reject { code, message } => {
                buf.put_u8((*code).into());
                put_string(&mut buf, message)?;
            }
            Frame::OpenStream {
                stream_id,
                method,
                path,
                headers,
                body,
                body_follows,
            } => {
                buf.put_u32(*stream_id);
                buf.put_u8(if *body_follows { FLAG_BODY_FOLLOWS } else { 0 });
                put_string(&mut buf, method)?;
                put_string(&mut buf, path)?;
                put_headers(&mut buf, headers)?;
                put_bytes(&mut buf, body)?;
            }
            Frame::StreamData { stream_id, chunk } => {
                buf.put_u32(*stream_id);
                put_bytes(&mut buf, chunk)?;
            }
            Frame::CloseStream {
                stream_id,
                status,
                headers,
                body,
            } => {
                buf.put_u32(*stream_id);
                buf.put_u16(*status);
                put_headers(&mut buf, headers)?;
                put_bytes(&mut buf, body)?;
            }
            Frame::Heartbeat { timestamp } | Frame::HeartbeatAck { timestamp } => {
                buf.put_u64(*timestamp);
            }
            Frame::Error { stream_id, message } => {
                match stream_id {
                    Some(id) => {
                        buf.put_u8(1);
                        buf.put_u32(*id);
                    }
                    None => buf.put_u8(0),
                }
                put_string(&mut buf, message)?;
            }
            Frame::GoAway { message } => put_string(&mut buf, message)?,
        }

        let len = buf.len() - LENGTH_PREFIX_SIZE;
        let len = u32::try_from(len).map_err(|_| TunnelError::FrameTooLarge(len, u32::MAX as usize))?;
        buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&len.to_be_bytes());
        Ok(buf)
    }

    /// Decode frame from bytes
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. A frame whose body
    /// is malformed is consumed before the error is returned, so the caller
    /// may drop it and keep decoding. `FrameTooLarge` leaves the buffer
    /// untouched and the stream cannot be resynchronised.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Self>, TunnelError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > max_frame_size {
            return Err(TunnelError::FrameTooLarge(len, max_frame_size));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + len {
            buf.reserve(LENGTH_PREFIX_SIZE + len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let mut body = buf.split_to(len).freeze();

        if body.is_empty() {
            return Err(TunnelError::InvalidFrame("empty frame".to_string()));
        }
        let frame_type = FrameType::try_from(body.get_u8())?;
        let frame = Self::decode_body(frame_type, &mut body)?;

        if body.has_remaining() {
            return Err(TunnelError::InvalidFrame(format!(
                "{} trailing bytes in {:?} frame",
                body.remaining(),
                frame_type
            )));
        }

        Ok(Some(frame))
    }

    fn decode_body(frame_type: FrameType, body: &mut Bytes) -> Result<Self, TunnelError> {
        let frame = match frame_type {
            FrameType::Hello => {
                let magic = take_slice(body, MAGIC.len())?;
                if magic[..] != MAGIC {
                    return Err(TunnelError::InvalidFrame("bad magic".to_string()));
                }
                Frame::Hello {
                    version: take_u8(body)?,
                    tunnel_id: take_string(body)?,
                    local_addr: take_string(body)?,
                }
            }
            FrameType::Welcome => Frame::Welcome {
                tunnel_url: take_string(body)?,
            },
            FrameType::Reject => Frame::Reject {
                code: RejectCode::from(take_u8(body)?),
                message: take_string(body)?,
            },
            FrameType::OpenStream => {
                let stream_id = take_u32(body)?;
                let flags = take_u8(body)?;
                Frame::OpenStream {
                    stream_id,
                    method: take_string(body)?,
                    path: take_string(body)?,
                    headers: take_headers(body)?,
                    body: take_bytes(body)?,
                    body_follows: flags & FLAG_BODY_FOLLOWS != 0,
                }
            }
            FrameType::StreamData => Frame::StreamData {
                stream_id: take_u32(body)?,
                chunk: take_bytes(body)?,
            },
            FrameType::CloseStream => Frame::CloseStream {
                stream_id: take_u32(body)?,
                status: take_u16(body)?,
                headers: take_headers(body)?,
                body: take_bytes(body)?,
            },
            FrameType::Heartbeat => Frame::Heartbeat {
                timestamp: take_u64(body)?,
            },
            FrameType::HeartbeatAck => Frame::HeartbeatAck {
                timestamp: take_u64(body)?,
            },
            FrameType::Error => {
                let stream_id = match take_u8(body)? {
                    0 => None,
                    _ => Some(take_u32(body)?),
                };
                Frame::Error {
                    stream_id,
                    message: take_string(body)?,
                }
            }
            FrameType::GoAway => Frame::GoAway {
                message: take_string(body)?,
            },
        };
        Ok(frame)
    }
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), TunnelError> {
    let len = u16::try_from(value.len())
        .map_err(|_| TunnelError::InvalidFrame(format!("string field too long: {}", value.len())))?;
    buf.put_u16(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<(), TunnelError> {
    let len = u32::try_from(value.len())
        .map_err(|_| TunnelError::FrameTooLarge(value.len(), u32::MAX as usize))?;
    buf.put_u32(len);
    buf.extend_from_slice(value);
    Ok(())
}

fn put_headers(buf: &mut BytesMut, headers: &Headers) -> Result<(), TunnelError> {
    let count = u16::try_from(headers.len())
        .map_err(|_| TunnelError::InvalidFrame(format!("too many headers: {}", headers.len())))?;
    buf.put_u16(count);
    for (name, value) in headers {
        put_string(buf, name)?;
        put_bytes(buf, value)?;
    }
    Ok(())
}

fn truncated(what: &str) -> TunnelError {
    TunnelError::InvalidFrame(format!("truncated {}", what))
}

fn take_u8(body: &mut Bytes) -> Result<u8, TunnelError> {
    if body.remaining() < 1 {
        return Err(truncated("u8"));
    }
    Ok(body.get_u8())
}

fn take_u16(body: &mut Bytes) -> Result<u16, TunnelError> {
    if body.remaining() < 2 {
        return Err(truncated("u16"));
    }
    Ok(body.get_u16())
}

fn take_u32(body: &mut Bytes) -> Result<u32, TunnelError> {
    if body.remaining() < 4 {
        return Err(truncated("u32"));
    }
    Ok(body.get_u32())
}

fn take_u64(body: &mut Bytes) -> Result<u64, TunnelError> {
    if body.remaining() < 8 {
        return Err(truncated("u64"));
    }
    Ok(body.get_u64())
}

fn take_slice(body: &mut Bytes, len: usize) -> Result<Bytes, TunnelError> {
    if body.remaining() < len {
        return Err(truncated("field"));
    }
    Ok(body.split_to(len))
}

fn take_string(body: &mut Bytes) -> Result<String, TunnelError> {
    let len = take_u16(body)? as usize;
    let raw = take_slice(body, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| TunnelError::InvalidFrame("string field is not utf-8".to_string()))
}

fn take_bytes(body: &mut Bytes) -> Result<Bytes, TunnelError> {
    let len = take_u32(body)? as usize;
    take_slice(body, len)
}

fn take_headers(body: &mut Bytes) -> Result<Headers, TunnelError> {
    let count = take_u16(body)? as usize;
    // Each header needs at least 6 bytes; don't trust the count for allocation
    let mut headers = Vec::with_capacity(count.min(body.remaining() / 6));
    for _ in 0..count {
        let name = take_string(body)?;
        let value = take_bytes(body)?;
        headers.push((name, value));
    }
    Ok(headers)
}
