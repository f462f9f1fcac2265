//! amt-tunnel - AMT gateway daemon
//!
//! Tunnels a source-specific multicast stream from an AMT relay to a local
//! UDP port, rebuilding the tunnel when the relay goes quiet.

use amt_client::{
    AmtGateway, GatewayConfig, GatewayHandle, GatewayState, HeartbeatPolicy, RelayIdentity,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{self, OpenOptions};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// amt-tunnel - Receive multicast over an AMT tunnel and forward it locally
#[derive(Parser, Debug)]
#[command(name = "amt-tunnel")]
#[command(version)]
#[command(long_about = r#"
Discover an AMT relay, join a source-specific multicast group through it
and forward the decapsulated UDP payloads to 127.0.0.1:<UDP_PORT>.

EXAMPLES:
  # Join through the default relay pool
  amt-tunnel amt-relay.m2icast.net 198.38.23.145 232.198.38.1 7000 5000

  # Tune timers from a config file
  amt-tunnel --config amt.yaml 162.250.138.201 198.38.23.145 232.198.38.1 7000 5000

ENVIRONMENT VARIABLES:
  AMT_RELAY      Relay address or amt-relay.m2icast.net
  AMT_SOURCE     Multicast source address
  AMT_GROUP      Multicast group address
  AMT_PORT       Local port for the tunnel socket
  AMT_UDP_PORT   Local port receiving the forwarded stream
"#)]
struct Cli {
    /// Relay address, hostname, or amt-relay.m2icast.net for the default pool
    #[arg(env = "AMT_RELAY")]
    relay: Option<String>,

    /// Multicast source address
    #[arg(env = "AMT_SOURCE")]
    source: Option<Ipv4Addr>,

    /// Multicast group address
    #[arg(env = "AMT_GROUP")]
    group: Option<Ipv4Addr>,

    /// Local port for the tunnel socket
    #[arg(env = "AMT_PORT")]
    amt_port: Option<u16>,

    /// Local UDP port the stream is forwarded to
    #[arg(env = "AMT_UDP_PORT")]
    udp_port: Option<u16>,

    /// YAML gateway configuration (timers, thresholds, relay pool)
    #[arg(short, long, env = "AMT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or a filter directive
    #[arg(long, env = "AMT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long, env = "AMT_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Send a heartbeat on every poll while idle instead of once per period
    #[arg(long)]
    heartbeat_every_poll: bool,
}

/// Setup logging to the console and, optionally, a file
fn setup_logging(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(())
}

/// Load a gateway configuration from YAML
fn load_config_file(path: &PathBuf) -> Result<GatewayConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: GatewayConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args over the config file, giving precedence to CLI args
fn build_gateway_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => GatewayConfig::default(),
    };

    if let Some(relay) = &cli.relay {
        config.relay = RelayIdentity::from(relay.clone());
    }
    if let Some(source) = cli.source {
        config.source = source;
    }
    if let Some(group) = cli.group {
        config.group = group;
    }
    if let Some(port) = cli.amt_port {
        config.local_port = port;
    }
    if let Some(port) = cli.udp_port {
        config.output_port = port;
    }
    if cli.heartbeat_every_poll {
        config.heartbeat_policy = HeartbeatPolicy::EveryPoll;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Log gateway state changes until the gateway ends
fn spawn_status_logger(handle: &GatewayHandle) {
    let mut status = handle.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match &current.state {
                GatewayState::Active => info!(
                    relay = ?current.relay,
                    packets = current.packets_forwarded,
                    "Tunnel active"
                ),
                GatewayState::Reconnecting { attempt } => {
                    warn!(attempt, "Tunnel reconnecting")
                }
                GatewayState::Stopped | GatewayState::Failed { .. } => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.log_file.as_ref())?;

    let config = build_gateway_config(&cli)?;

    info!("amt-tunnel starting...");
    info!("Relay: {}", config.relay);
    info!("Subscription: ({}, {})", config.source, config.group);
    info!("Tunnel port: {}", config.local_port);
    info!("Forwarding to: {}:{}", config.output_host, config.output_port);

    let mut handle = AmtGateway::start(config)
        .await
        .context("Failed to establish AMT tunnel")?;
    spawn_status_logger(&handle);

    tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            info!("Shutting down...");
            handle.stop().await.context("Gateway did not stop cleanly")?;
        }
        result = handle.wait() => {
            if let Err(e) = result {
                error!("Gateway terminated: {:#}", e);
                return Err(e).context("AMT tunnel failed");
            }
        }
    }

    info!("amt-tunnel stopped");
    Ok(())
}
