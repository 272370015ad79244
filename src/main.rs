use std::path::PathBuf;

use anyhow::Context;
use battpoll::config::Config;
use battpoll::{BleTransport, DeviceSession, LogSink, PollScheduler};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Poll BLE battery and charge-controller peripherals and log their readings
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(default_value = "config.toml")]
    config: PathBuf,

    /// Read every device once and exit, even if polling is enabled
    #[arg(long)]
    once: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "BATTPOLL_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config)?;
    let mut settings = config.scheduler_settings();
    if args.once {
        settings.enable_polling = false;
    }

    let sessions = config
        .descriptors()
        .into_iter()
        .map(|device| {
            let transport = BleTransport::new(&device, config.discovery_timeout());
            DeviceSession::new(device, transport, config.pacing())
        })
        .collect();
    let sink = LogSink::new(config.data.fields.clone());
    let mut scheduler = PollScheduler::new(sessions, sink, settings);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                signal.cancel();
            }
            Err(err) => warn!("Cannot listen for ctrl-c: {err}"),
        }
    });

    scheduler.run(shutdown).await
}
