//! sshwarden daemon binary entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sshwarden_core::config::WardenConfig;
use sshwarden_daemon::Daemon;

/// sshwarden - correlates kernel audit events with sshd logins.
#[derive(Parser, Debug)]
#[command(name = "sshwarden", version, about)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/sshwarden/config.toml")]
    config: PathBuf,

    /// Override the node name reported in events.
    #[arg(long)]
    node_name: Option<String>,

    /// Write events to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_env("SSHWARDEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(config = %args.config.display(), "sshwarden starting");

    let mut config = WardenConfig::load(&args.config).context("loading configuration")?;
    if args.node_name.is_some() {
        config.node_name = args.node_name;
    }
    if args.output.is_some() {
        config.output = args.output;
    }

    let daemon = Daemon::new(config)?;
    daemon.run().await
}
