//! Session supervisor - keeps the tunnel up
//!
//! Owns the transport generation counter and the reconnect loop:
//!
//! ```text
//! connect ──► run until failure ──► fail_all_streams ──► backoff ──┐
//!    ▲                                                             │
//!    └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop ends only on shutdown or when the broker rejects the tunnel
//! identity.

mod backoff;
mod event;

pub use backoff::{Backoff, ReconnectPolicy};
pub use event::TunnelEvent;

use crate::forwarder::Forwarder;
use crate::protocol::DRAIN_TIMEOUT;
use crate::transport::{BrokerAddr, Connector, SessionConfig, SessionEnd, TransportSession};
use crate::tunnel::{Multiplexer, MultiplexerHandle, MultiplexerLimits};
use crate::TunnelSession;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Event channel capacity; slow subscribers lag rather than block the tunnel
const EVENT_CAPACITY: usize = 256;

/// The tunnel cannot continue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Tunnel stopped: {reason}")]
pub struct FatalError {
    pub reason: String,
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub session: SessionConfig,
    pub limits: MultiplexerLimits,
    pub reconnect: ReconnectPolicy,
    /// How long shutdown waits for in-flight streams
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            limits: MultiplexerLimits::default(),
            reconnect: ReconnectPolicy::default(),
            drain_timeout: Duration::from_secs(DRAIN_TIMEOUT),
        }
    }
}

/// Session supervisor
pub struct Supervisor {
    tunnel: TunnelSession,
    config: SupervisorConfig,
    forwarder: Arc<dyn Forwarder>,
    connector: Option<Arc<dyn Connector>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl Supervisor {
    pub fn new(
        tunnel: TunnelSession,
        config: SupervisorConfig,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tunnel,
            config,
            forwarder,
            connector: None,
            events,
        }
    }

    /// Use a custom dialer instead of the one implied by the broker scheme
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Spawn the supervisor loop
    pub fn start(self) -> TunnelHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        TunnelHandle {
            shutdown_tx,
            task: Some(task),
            result: None,
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), FatalError> {
        let result = match self.resolve_connector() {
            Ok((connector, addr)) => self.supervise(connector, &addr, &mut shutdown_rx).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                info!("Tunnel {} stopped", self.tunnel.tunnel_id);
                self.emit(TunnelEvent::Stopped);
            }
            Err(e) => {
                error!("Tunnel {} stopped: {}", self.tunnel.tunnel_id, e.reason);
                self.emit(TunnelEvent::Fatal {
                    reason: e.reason.clone(),
                });
            }
        }
        result
    }

    fn resolve_connector(&self) -> Result<(Arc<dyn Connector>, String), FatalError> {
        let broker: BrokerAddr = self.tunnel.broker.parse().map_err(|e| FatalError {
            reason: format!("{}", e),
        })?;
        let connector = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::from(
                broker
                    .connector(self.config.session.handshake_timeout)
                    .map_err(|e| FatalError {
                        reason: e.to_string(),
                    })?,
            ),
        };
        Ok((connector, broker.authority()))
    }

    async fn supervise(
        &self,
        connector: Arc<dyn Connector>,
        addr: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), FatalError> {
        let (mux, mux_task) = Multiplexer::spawn(
            Arc::clone(&self.forwarder),
            self.config.limits.clone(),
            self.events.clone(),
        );
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let mut generation = 0u64;

        let result = loop {
            if *shutdown_rx.borrow() {
                break Ok(());
            }

            generation += 1;
            info!("Connecting to broker {} (generation {})", addr, generation);
            self.emit(TunnelEvent::Connecting { generation });

            let connect = TransportSession::connect(
                connector.as_ref(),
                addr,
                &self.tunnel,
                generation,
                self.config.session.clone(),
                mux.clone(),
            );
            let outcome = tokio::select! {
                outcome = connect => outcome,
                _ = shutdown_rx.changed() => break Ok(()),
            };

            let reason = match outcome {
                Ok(mut session) => {
                    info!(
                        "Tunnel active at {} (generation {})",
                        session.tunnel_url(),
                        session.generation()
                    );
                    self.emit(TunnelEvent::Active {
                        generation: session.generation(),
                        tunnel_url: session.tunnel_url().to_string(),
                    });

                    let end = tokio::select! {
                        end = session.wait() => Some(end),
                        _ = shutdown_rx.changed() => None,
                    };

                    match end {
                        None => {
                            self.drain(&mux).await;
                            session.close("client shutting down").await;
                            break Ok(());
                        }
                        Some(end) => {
                            backoff.record_active(session.uptime());
                            match end {
                                SessionEnd::Failed(e) => e.to_string(),
                                SessionEnd::Closed => "session closed".to_string(),
                            }
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    break Err(FatalError {
                        reason: e.to_string(),
                    });
                }
                Err(e) => e.to_string(),
            };

            // Everything from this generation is failed before a new one can accept streams
            match mux.fail_all_streams(reason.as_str()).await {
                Ok(0) => {}
                Ok(failed) => debug!("Failed {} streams of generation {}", failed, generation),
                Err(e) => {
                    break Err(FatalError {
                        reason: e.to_string(),
                    })
                }
            }

            let delay = backoff.next_delay();
            let attempt = backoff.attempt();
            warn!(
                "Transport lost ({}); reconnecting in {:?} (attempt {})",
                reason, delay, attempt
            );
            self.emit(TunnelEvent::Reconnecting {
                attempt,
                delay,
                reason,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break Ok(()),
            }
        };

        let _ = mux.fail_all_streams("tunnel stopped").await;
        drop(mux);
        let _ = mux_task.await;
        result
    }

    /// Give in-flight streams up to `drain_timeout` to finish
    async fn drain(&self, mux: &MultiplexerHandle) {
        info!(
            "Draining in-flight streams (up to {:?})",
            self.config.drain_timeout
        );
        if tokio::time::timeout(self.config.drain_timeout, mux.drain())
            .await
            .is_err()
        {
            warn!("Drain window elapsed with streams still in flight");
        }
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }
}

/// Handle to a running tunnel
pub struct TunnelHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), FatalError>>>,
    result: Option<Result<(), FatalError>>,
}

impl TunnelHandle {
    /// Request a graceful shutdown; calling it again has no effect
    pub fn shutdown(&self) {
        self.shutdown_tx.send_if_modified(|stopping| {
            let changed = !*stopping;
            *stopping = true;
            changed
        });
    }

    /// Whether shutdown was requested
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait for the tunnel to stop
    ///
    /// `Ok` after a shutdown, `Err` if the broker rejected the tunnel.
    pub async fn wait(&mut self) -> Result<(), FatalError> {
        if let Some(result) = &self.result {
            return result.clone();
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await.unwrap_or_else(|e| {
            Err(FatalError {
                reason: format!("supervisor task failed: {}", e),
            })
        });
        self.task = None;
        self.result = Some(result.clone());
        result
    }

    /// Shut down and wait for the tunnel to stop
    pub async fn stop(&mut self) -> Result<(), FatalError> {
        self.shutdown();
        self.wait().await
    }
}
