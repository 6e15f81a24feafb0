//! Tunlify Client
//!
//! Exposes a local HTTP service through a public Tunlify URL:
//! - Exchanges the dashboard connection token for a tunnel identity
//! - Keeps a multiplexed connection to the broker alive
//! - Replays incoming requests against the local service

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunlify::{
    config::{generate_example_config, Config, LoggingConfig},
    forwarder::HttpForwarder,
    Supervisor, TunnelEvent, TunnelSession,
};

/// Registration request timeout
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup reachability check timeout
const LOCAL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunlify Client - expose a local service through a public URL
#[derive(Parser, Debug)]
#[command(name = "tunlify-client")]
#[command(about = "Tunlify Client - expose a local HTTP service through a public URL")]
#[command(version)]
struct Args {
    /// Connection token from the Tunlify dashboard
    #[arg(short, long, env = "TUNLIFY_TOKEN")]
    token: Option<String>,

    /// Local address to tunnel (overrides config)
    #[arg(short, long)]
    local: Option<String>,

    /// Registration server URL (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Broker address: wss://, ws://, tls:// or tcp:// (default: derived from --server)
    #[arg(short, long)]
    broker: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Write an example configuration file and exit
    #[arg(long)]
    generate_config: bool,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Registration request body
#[derive(Serialize)]
struct AuthRequest<'a> {
    connection_token: &'a str,
}

/// Registration response
#[derive(Debug, Deserialize)]
struct TunnelAuth {
    tunnel_id: String,
    tunnel_url: String,
    #[serde(default)]
    subdomain: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    user: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let path = args.config.as_deref().unwrap_or("tunlify.toml");
        return write_example_config(path);
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(local) = args.local {
        config.tunnel.local_addr = local;
    }
    if let Some(server) = args.server {
        config.tunnel.registration_url = server;
    }
    if let Some(broker) = args.broker {
        config.tunnel.broker = broker;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging)?;

    let token = args
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow!("A connection token is required (--token or TUNLIFY_TOKEN)"))?;

    info!("Tunlify Client v{}", tunlify::VERSION);
    info!("Local service: {}", config.tunnel.local_addr);

    let auth = register(&config.tunnel.registration_url, &token).await?;
    info!("Tunnel authenticated");
    info!("  Tunnel ID: {}", auth.tunnel_id);
    info!("  Public URL: {}", auth.tunnel_url);
    if !auth.subdomain.is_empty() {
        info!("  Subdomain: {}", auth.subdomain);
    }
    if !auth.location.is_empty() {
        info!("  Location: {}", auth.location);
    }
    if !auth.user.is_empty() {
        info!("  User: {}", auth.user);
    }

    let broker = config.broker_for(&auth.tunnel_id)?;
    info!("  Broker: {}", broker);

    let session = TunnelSession {
        tunnel_id: auth.tunnel_id,
        tunnel_url: auth.tunnel_url,
        local_addr: config.tunnel.local_addr.clone(),
        broker,
    };

    let forwarder = Arc::new(HttpForwarder::new(config.forwarder_config())?);
    match forwarder.check_reachable(LOCAL_CHECK_TIMEOUT).await {
        Ok(_) => info!("Local service is reachable at {}", forwarder.base_url()),
        Err(e) => {
            warn!("Cannot reach the local service at {}: {}", forwarder.base_url(), e);
            warn!("Requests will be answered with 502 until it is running");
        }
    }

    let supervisor = Supervisor::new(session, config.supervisor_config(), forwarder);
    let mut events = supervisor.subscribe();
    let mut handle = supervisor.start();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TunnelEvent::Active { tunnel_url, .. }) => {
                    info!("Forwarding {} -> local service", tunnel_url);
                }
                Ok(event) if event.is_terminal() => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} tunnel events", n);
                }
                Err(_) => break,
            }
        }
    });

    let result = tokio::select! {
        result = handle.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.stop().await
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        return Err(e.into());
    }
    info!("Tunnel closed");
    Ok(())
}

/// Exchange the connection token for a tunnel identity
async fn register(server_url: &str, token: &str) -> Result<TunnelAuth> {
    let client = reqwest::Client::builder()
        .timeout(REGISTRATION_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let url = format!("{}/api/tunnels/auth", server_url.trim_end_matches('/'));
    info!("Authenticating with {}", server_url);

    let response = client
        .post(&url)
        .json(&AuthRequest {
            connection_token: token,
        })
        .send()
        .await
        .with_context(|| format!("Failed to connect to {}", server_url))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("Authentication failed (status {}): {}", status.as_u16(), body);
    }

    serde_json::from_str::<TunnelAuth>(&body)
        .with_context(|| format!("Failed to decode registration response: {}", body))
}

/// Install the tracing subscriber for the configured level and format
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        "pretty" => registry.with(tracing_subscriber::fmt::layer()).init(),
        other => bail!("Unknown log format {:?} (expected pretty, compact or json)", other),
    }
    Ok(())
}

fn write_example_config(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        bail!("{} already exists; refusing to overwrite", path);
    }
    generate_example_config()
        .save(path)
        .with_context(|| format!("Failed to write {}", path))?;

    println!("Example configuration written to {}", path);
    println!();
    println!("Run the client with:");
    println!("  tunlify-client --config {} --token YOUR_CONNECTION_TOKEN", path);
    Ok(())
}
