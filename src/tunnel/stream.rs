//! Forwarded stream lifecycle

use super::{Headers, StreamId, TunnelError};
use crate::forwarder::LocalRequest;
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio::time::Instant as TokioInstant;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Request received, body may still be arriving
    Open,
    /// Local call in flight
    Forwarding,
    /// Response emitted
    Completed,
    /// Torn down without a response from the local service reaching the broker
    Failed,
}

impl StreamState {
    /// Whether the stream has reached a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Failed)
    }
}

/// Result recorded once a stream ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `CloseStream` sent with this status
    Responded(u16),
    /// Stream failed for this reason
    Failed(String),
}

/// One forwarded request within the tunnel
pub struct TunnelStream {
    id: StreamId,
    generation: u64,
    created_at: Instant,
    /// Last time request body bytes arrived
    touched_at: TokioInstant,
    state: StreamState,
    method: String,
    path: String,
    headers: Headers,
    body: BytesMut,
    outcome: Option<StreamOutcome>,
    task: Option<AbortHandle>,
}

impl TunnelStream {
    /// Create a stream from an `OpenStream` frame
    pub fn new(
        id: StreamId,
        generation: u64,
        method: String,
        path: String,
        headers: Headers,
        body: Bytes,
    ) -> Self {
        Self {
            id,
            generation,
            created_at: Instant::now(),
            touched_at: TokioInstant::now(),
            state: StreamState::Open,
            method,
            path,
            headers,
            body: BytesMut::from(&body[..]),
            outcome: None,
            task: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Transport generation this stream was opened on
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the request body last made progress
    pub fn idle(&self) -> Duration {
        self.touched_at.elapsed()
    }

    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    /// Request line for logging
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Append a request body chunk (only while `Open`)
    pub fn push_body(&mut self, chunk: &[u8], max_body_size: usize) -> Result<(), TunnelError> {
        if self.state != StreamState::Open {
            return Err(TunnelError::InvalidTransition(
                self.id,
                self.state,
                StreamState::Open,
            ));
        }
        if self.body.len() + chunk.len() > max_body_size {
            return Err(TunnelError::BodyTooLarge(self.id, max_body_size));
        }
        self.body.extend_from_slice(chunk);
        self.touched_at = TokioInstant::now();
        Ok(())
    }

    /// Buffered request body size
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Move to `Forwarding`, handing out the assembled request
    pub fn start_forwarding(&mut self) -> Result<LocalRequest, TunnelError> {
        if self.state != StreamState::Open {
            return Err(TunnelError::InvalidTransition(
                self.id,
                self.state,
                StreamState::Forwarding,
            ));
        }
        self.state = StreamState::Forwarding;
        Ok(LocalRequest {
            method: std::mem::take(&mut self.method),
            path: self.path.clone(),
            headers: std::mem::take(&mut self.headers),
            body: self.body.split().freeze(),
        })
    }

    /// Attach the forwarder task so it can be cancelled
    pub fn set_task(&mut self, task: AbortHandle) {
        self.task = Some(task);
    }

    /// Record the emitted response
    pub fn complete(&mut self, status: u16) -> Result<(), TunnelError> {
        if self.state.is_terminal() {
            return Err(TunnelError::InvalidTransition(
                self.id,
                self.state,
                StreamState::Completed,
            ));
        }
        self.state = StreamState::Completed;
        self.outcome = Some(StreamOutcome::Responded(status));
        self.task = None;
        Ok(())
    }

    /// Force the stream to `Failed`, cancelling its forwarder task
    ///
    /// Returns `false` if the stream had already ended.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = StreamState::Failed;
        self.outcome = Some(StreamOutcome::Failed(reason.into()));
        true
    }
}
