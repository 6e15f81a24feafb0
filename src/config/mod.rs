//! Configuration management

use crate::forwarder::{ForwarderConfig, DEFAULT_STRIP_HEADERS};
use crate::protocol::{
    DRAIN_TIMEOUT, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, MAX_PROTOCOL_ERRORS,
};
use crate::supervisor::{ReconnectPolicy, SupervisorConfig};
use crate::transport::{broker_url_for, BrokerAddr, SessionConfig};
use crate::tunnel::{
    MultiplexerLimits, DEFAULT_BODY_TIMEOUT, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_CHUNK_SIZE,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_STREAMS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunnel endpoints
    pub tunnel: TunnelConfig,
    /// Local forwarder settings
    pub forwarder: ForwarderSection,
    /// Transport session and stream limits
    pub session: SessionSection,
    /// Reconnect backoff
    pub reconnect: ReconnectSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Broker address for a registered tunnel
    ///
    /// An empty `tunnel.broker` means the broker's WebSocket endpoint on the
    /// registration host.
    pub fn broker_for(&self, tunnel_id: &str) -> Result<String, crate::Error> {
        if !self.tunnel.broker.is_empty() {
            return Ok(self.tunnel.broker.clone());
        }
        broker_url_for(&self.tunnel.registration_url, tunnel_id)
            .map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), crate::Error> {
        let invalid = |msg: &str| Err(crate::Error::Config(msg.to_string()));

        if !self.tunnel.broker.is_empty() {
            self.tunnel
                .broker
                .parse::<BrokerAddr>()
                .map_err(|e| crate::Error::Config(e.to_string()))?;
        }
        if !self.tunnel.registration_url.starts_with("https://")
            && !self.tunnel.registration_url.starts_with("http://")
        {
            return invalid("tunnel.registration_url must be an http:// or https:// URL");
        }
        if self.tunnel.local_addr.is_empty() {
            return invalid("tunnel.local_addr must not be empty");
        }
        if self.forwarder.timeout_secs == 0 {
            return invalid("forwarder.timeout_secs must be greater than 0");
        }

        let s = &self.session;
        if s.heartbeat_interval_secs == 0 {
            return invalid("session.heartbeat_interval_secs must be greater than 0");
        }
        if s.handshake_timeout_secs == 0 {
            return invalid("session.handshake_timeout_secs must be greater than 0");
        }
        if s.max_streams == 0 {
            return invalid("session.max_streams must be greater than 0");
        }
        if s.max_chunk_size == 0 || s.max_chunk_size >= s.max_frame_size {
            return invalid("session.max_chunk_size must be between 1 and max_frame_size");
        }
        if s.body_timeout_secs == 0 {
            return invalid("session.body_timeout_secs must be greater than 0");
        }

        let r = &self.reconnect;
        if r.base_delay_ms == 0 || r.max_delay_ms < r.base_delay_ms {
            return invalid("reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms");
        }
        if r.multiplier < 1.0 {
            return invalid("reconnect.multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return invalid("reconnect.jitter must be between 0.0 and 1.0");
        }
        Ok(())
    }

    /// Runtime forwarder settings
    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            local_addr: self.tunnel.local_addr.clone(),
            timeout: Duration::from_secs(self.forwarder.timeout_secs),
            strip_headers: self.forwarder.strip_headers.clone(),
        }
    }

    /// Runtime supervisor settings
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let s = &self.session;
        let r = &self.reconnect;
        SupervisorConfig {
            session: SessionConfig {
                heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs),
                handshake_timeout: Duration::from_secs(s.handshake_timeout_secs),
                max_frame_size: s.max_frame_size,
                max_protocol_errors: s.max_protocol_errors,
            },
            limits: MultiplexerLimits {
                max_streams: s.max_streams,
                max_body_size: s.max_body_size,
                max_chunk_size: s.max_chunk_size,
                body_timeout: Duration::from_secs(s.body_timeout_secs),
            },
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(r.base_delay_ms),
                max_delay: Duration::from_millis(r.max_delay_ms),
                multiplier: r.multiplier,
                jitter: r.jitter,
                reset_after: Duration::from_secs(r.reset_after_secs),
            },
            drain_timeout: Duration::from_secs(s.drain_timeout_secs),
        }
    }
}

/// Tunnel endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Broker address (`wss://`, `ws://`, `tls://` or `tcp://`); empty to
    /// use `/ws/tunnel/<id>` on the registration host
    pub broker: String,
    /// Local service address
    pub local_addr: String,
    /// Registration API base URL
    pub registration_url: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            local_addr: "127.0.0.1:3000".to_string(),
            registration_url: "https://api.tunlify.biz.id".to_string(),
        }
    }
}

/// Forwarder section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderSection {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Request headers dropped before forwarding
    pub strip_headers: Vec<String>,
}

impl Default for ForwarderSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            strip_headers: DEFAULT_STRIP_HEADERS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

/// Session section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub heartbeat_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_streams: usize,
    pub max_frame_size: usize,
    pub max_chunk_size: usize,
    pub max_body_size: usize,
    pub body_timeout_secs: u64,
    pub max_protocol_errors: u32,
    pub drain_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: HEARTBEAT_INTERVAL,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            body_timeout_secs: DEFAULT_BODY_TIMEOUT.as_secs(),
            max_protocol_errors: MAX_PROTOCOL_ERRORS,
            drain_timeout_secs: DRAIN_TIMEOUT,
        }
    }
}

/// Reconnect section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub reset_after_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            reset_after_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
