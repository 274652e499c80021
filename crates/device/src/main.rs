//! usb-socket device
//!
//! Binds a virtual USB device to a Unix datagram socket and waits for a peer
//! process to attach and answer its transfers.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use device::{ChannelNotifier, DeviceConfig, DeviceNotice, HostAdapter, enumerate};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-socket-device")]
#[command(author, version, about = "Virtual USB device backed by a datagram socket")]
#[command(long_about = "
Binds a virtual USB device to a Unix datagram socket. A peer process attaches
by sending a single 0xFF byte from its own bound socket and then answers the
SETUP/IN/OUT requests the device forwards to it.

EXAMPLES:
    # Run with default config
    usb-socket-device

    # Listen on a specific path without the enumeration probe
    usb-socket-device --socket /tmp/x.sock --no-probe

CONFIGURATION:
    The device looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-socket/device.toml
    3. /etc/usb-socket/device.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Socket path to listen on (overrides config)
    #[arg(short, long, value_name = "PATH")]
    socket: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Do not enumerate the device when a peer attaches
    #[arg(long)]
    no_probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DeviceConfig::default();
        let path = DeviceConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        DeviceConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DeviceConfig::load_or_default()
    };

    if let Some(socket) = args.socket {
        config.device.socket_path = socket;
    }
    if args.no_probe {
        config.enumeration.probe_on_attach = false;
    }
    config.validate().context("Invalid configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.device.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-socket device v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let adapter = HostAdapter::new(config.reply_timeout());
    let socket_path = config.socket_path();
    let (handle, task) = adapter
        .create_device(&socket_path)
        .with_context(|| format!("Failed to create device at {}", socket_path.display()))?;

    let (notice_tx, notice_rx) = async_channel::unbounded();
    let metrics = task.device().metrics().clone();
    let device_task = tokio::spawn(task.run(ChannelNotifier::new(notice_tx)));

    let probe = config.enumeration.probe_on_attach;
    let address = config.enumeration.address;
    let notices = tokio::spawn(async move {
        while let Ok(notice) = notice_rx.recv().await {
            match notice {
                DeviceNotice::Attached(path) => {
                    info!("Peer attached to {}", path.display());
                    if probe {
                        match enumerate(&handle, address).await {
                            Ok(descriptor) => info!("Device descriptor: {:02x?}", descriptor),
                            Err(e) => warn!("Enumeration of {} failed: {}", path.display(), e),
                        }
                    }
                }
                DeviceNotice::Detached(path) => info!("Peer detached from {}", path.display()),
            }
        }
    });

    info!("Waiting for a peer on {} (Ctrl+C to exit)", socket_path.display());
    signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    adapter.shutdown_all();
    if let Err(e) = device_task.await {
        warn!("Device task ended abnormally: {}", e);
    }
    notices.abort();

    metrics.snapshot().log_summary();

    Ok(())
}
