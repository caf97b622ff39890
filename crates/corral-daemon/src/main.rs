//! corral-daemon - compile/execute broker.
//!
//! Loads the broker configuration, binds the listener, and serves
//! sessions until SIGTERM/SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use corral_core::config::BrokerConfig;
use corral_daemon::server::Broker;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// corral daemon - compile/execute broker
#[derive(Parser, Debug)]
#[command(name = "corral-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the broker configuration file
    #[arg(short, long, default_value = "corral.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(long)]
    listen_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config =
        BrokerConfig::from_file(&args.config).context("failed to load configuration")?;
    if let Some(port) = args.listen_port {
        config.system.listen_port = port;
    }
    info!(
        config = %args.config.display(),
        compilers = config.compilers.len(),
        "configuration loaded"
    );

    let broker = Broker::bind(Arc::new(config)).await?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        result = broker.run() => result,
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            Ok(())
        }
    }
}
