//! # relayd
//!
//! Relay hub binary: loads settings, installs logging and metrics, and serves
//! the hub until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::RelayServer;
use relay_settings::{InboundPolicy, LogLevel, RelaySettings, SenderPolicy};

/// Real-time position relay hub.
#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Real-time position relay hub")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Text frame handling: relay-all, position-broadcast or position-ack.
    #[arg(long)]
    inbound_policy: Option<InboundPolicy>,

    /// Echo relayed messages to their sender: exclude or include.
    #[arg(long)]
    sender_policy: Option<SenderPolicy>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(relay_settings::settings_path)
    }

    /// Command-line flags win over file and environment.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
        if let Some(policy) = self.inbound_policy {
            settings.hub.inbound_policy = policy;
        }
        if let Some(policy) = self.sender_policy {
            settings.hub.sender_policy = policy;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings_path();
    let mut settings = relay_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    relay_core::logging::init_subscriber(settings.logging.level.as_filter_str());

    let metrics = relay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = RelayServer::new(settings).with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("relay listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(None).await;
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
