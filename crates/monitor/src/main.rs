//! iso-usb Monitor
//!
//! Watches for a configured USB device, streams its isochronous endpoints
//! through the engine and reports packet statistics until interrupted.

mod config;
mod session;

use anyhow::{Context as _, Result};
use clap::Parser;
use common::{DeviceEvent, EventBridge, EventSender, create_event_bridge, setup_logging};
use config::MonitorConfig;
use engine::{DeviceEnumerator, DeviceSource, LibusbDeviceSource};
use rusb::Context;
use session::Session;
use std::collections::HashMap;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "iso-usb-monitor")]
#[command(
    author,
    version,
    about = "iso-usb Monitor - Stream isochronous USB endpoints"
)]
#[command(long_about = "
Streams the isochronous endpoints of a USB device and reports packet
statistics. The device is opened as soon as it appears and released when it
is unplugged.

EXAMPLES:
    # Run with default config
    iso-usb-monitor

    # Run with custom config
    iso-usb-monitor --config /path/to/monitor.toml

    # List USB devices and exit
    iso-usb-monitor --list-devices

    # Run with debug logging
    iso-usb-monitor --log-level debug

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/iso-usb/monitor.toml
    3. /etc/iso-usb/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = MonitorConfig::default();
        let path = MonitorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        MonitorConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("iso-usb Monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let context = Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context);
    }

    run(config, context).await
}

/// List USB devices and exit
fn list_devices_mode(context: &Context) -> Result<()> {
    let mut source = LibusbDeviceSource::new(context.clone());
    let devices = source.list_devices().context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {:04x}:{:04x}  {}  Speed: {:?}",
                device.vendor_id, device.product_id, device.identifier, device.speed
            );
        }
    }

    Ok(())
}

/// Watch for devices and stream from matching ones until Ctrl+C
async fn run(config: MonitorConfig, context: Context) -> Result<()> {
    let (bridge, sender) = create_event_bridge();
    let mut enumerator = DeviceEnumerator::spawn(
        LibusbDeviceSource::new(context.clone()),
        config.monitor.scan_interval(),
        config.filters()?,
        sender.clone(),
    )
    .context("Failed to start device enumerator")?;

    info!(
        "Waiting for {:04x}:{:04x}, press Ctrl+C to exit",
        config.device.vendor_id, config.device.product_id
    );

    let mut sessions: HashMap<String, Session> = HashMap::new();
    let result = event_loop(&config, &context, &bridge, &sender, &mut sessions).await;

    info!("Shutting down...");
    enumerator.stop();
    for (_, session) in sessions.drain() {
        stop_session(session).await;
    }

    result
}

async fn event_loop(
    config: &MonitorConfig,
    context: &Context,
    bridge: &EventBridge,
    sender: &EventSender,
    sessions: &mut HashMap<String, Session>,
) -> Result<()> {
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            event = bridge.recv_event() => {
                let event = event.context("Event channel closed")?;
                handle_event(event, config, context, sender, sessions).await;
            }
        }
    }
}

async fn handle_event(
    event: DeviceEvent,
    config: &MonitorConfig,
    context: &Context,
    sender: &EventSender,
    sessions: &mut HashMap<String, Session>,
) {
    match event {
        DeviceEvent::Added { device } => {
            if !config.wants(device.vendor_id, device.product_id)
                || sessions.contains_key(&device.identifier)
            {
                return;
            }
            let identifier = device.identifier.clone();
            let (context, config, sender) = (context.clone(), config.clone(), sender.clone());
            let started = tokio::task::spawn_blocking(move || {
                Session::start(&context, &device, &config, sender)
            })
            .await;
            match started {
                Ok(Ok(session)) => {
                    sessions.insert(identifier, session);
                }
                Ok(Err(e)) => error!("Failed to start streaming from {}: {:#}", identifier, e),
                Err(e) => error!("Session start task failed: {}", e),
            }
        }
        DeviceEvent::Removed { identifier } => {
            if let Some(session) = sessions.remove(&identifier) {
                info!("{} unplugged, closing session", identifier);
                stop_session(session).await;
            }
        }
        DeviceEvent::PipeStarted { identifier } => info!("{}: streaming", identifier),
        DeviceEvent::PipeStopped { identifier } => {
            warn!("{}: all transfers drained, waiting for the next poll", identifier)
        }
        DeviceEvent::PipeDied { identifier, reason } => {
            warn!("{}: pipes died ({}), re-plug to restart", identifier, reason);
            if let Some(session) = sessions.remove(&identifier) {
                stop_session(session).await;
            }
        }
    }
}

async fn stop_session(session: Session) {
    let identifier = session.identifier().to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || session.stop()).await {
        error!("Failed to stop session {}: {}", identifier, e);
    }
}
