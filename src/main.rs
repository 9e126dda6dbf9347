use std::path::PathBuf;
use std::sync::Arc;

use backbone_button::config::{AppConfig, LoggingConfig};
use backbone_button::controller::{
    ControllerDriver, DriverContext, DriverEvent, DriverRegistry, CAPABILITY_ANALOG_TRIGGERS,
    CAPABILITY_RUMBLE,
};
use backbone_button::usb::{RusbPort, UsbPort};
use color_eyre::{eyre::eyre, Result};
use rusb::UsbContext;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::subscriber::DefaultGuard;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::{Format, Pretty};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = setup().await?;

    let registry = DriverRegistry::with_defaults();
    let (event_sender, mut event_receiver) = mpsc::unbounded_channel();

    let drivers = attach_drivers(&registry, &config, event_sender)?;
    if drivers.is_empty() {
        warn!("No supported accessory found");
        return Ok(());
    }
    info!("{} driver(s) running, press Ctrl+C to stop", drivers.len());

    let mut active = drivers.len();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C detected, stopping drivers");
                break;
            }
            event = event_receiver.recv() => match event {
                Some(event) => {
                    log_event(&event);
                    if matches!(event, DriverEvent::DeviceRemoved { .. }) {
                        active -= 1;
                        if active == 0 {
                            info!("All devices removed");
                            break;
                        }
                    }
                }
                None => break,
            }
        }
    }

    for driver in &drivers {
        driver.stop();
    }
    Ok(())
}

fn attach_drivers(
    registry: &DriverRegistry,
    config: &AppConfig,
    events: mpsc::UnboundedSender<DriverEvent>,
) -> Result<Vec<Box<dyn ControllerDriver>>> {
    let context = rusb::Context::new().map_err(|e| eyre!("Failed to initialize libusb: {}", e))?;
    let devices = context
        .devices()
        .map_err(|e| eyre!("Failed to list USB devices: {}", e))?;

    let mut drivers = Vec::new();
    let mut next_device_id = 0;

    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(
                    "Skipping Bus {:03} Dev {:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        if registry
            .find(descriptor.vendor_id(), descriptor.product_id())
            .is_none()
        {
            continue;
        }

        let port: Arc<dyn UsbPort> = match RusbPort::open(&device) {
            Ok(port) => Arc::new(port),
            Err(e) => {
                warn!(
                    "Failed to open {:04x}:{:04x}: {}",
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    e
                );
                continue;
            }
        };

        let ctx = DriverContext {
            port,
            device_id: next_device_id,
            events: events.clone(),
            settings: config.driver.clone(),
            runtime: Handle::current(),
        };
        next_device_id += 1;

        let Some(driver) = registry.build(ctx) else {
            continue;
        };
        match driver.start() {
            Ok(()) => drivers.push(driver),
            Err(e) => warn!("Failed to start {}: {}", driver.identify(), e),
        }
    }

    Ok(drivers)
}

fn log_event(event: &DriverEvent) {
    match event {
        DriverEvent::DeviceAdded {
            identity,
            timestamp,
        } => info!(
            "{} added at {} as {:?} controller (analog triggers: {}, rumble: {})",
            identity,
            timestamp.format("%H:%M:%S.%3f"),
            identity.controller_type,
            identity.supports(CAPABILITY_ANALOG_TRIGGERS),
            identity.supports(CAPABILITY_RUMBLE)
        ),
        DriverEvent::InputUpdated {
            device_id,
            state,
            timestamp,
        } => info!(
            "Device #{} guide button {} at {}",
            device_id,
            if state.special_button() { "pressed" } else { "released" },
            timestamp.format("%H:%M:%S.%3f")
        ),
        DriverEvent::DeviceRemoved {
            device_id,
            timestamp,
        } => info!(
            "Device #{} removed at {}",
            device_id,
            timestamp.format("%H:%M:%S.%3f")
        ),
    }
}

async fn setup() -> Result<AppConfig> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    // Until the configured level is known, log at the default one
    let bootstrap = bootstrap_logging();
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&path).await?;
    drop(bootstrap);

    setup_logging_env(config.logging.level()?);
    info!("Using configuration from {}", path.display());
    debug!("Driver settings: {:?}", config.driver);
    Ok(config)
}

fn subscriber(level: Level) -> FmtSubscriber<Pretty, Format<Pretty>> {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .finish()
}

// Scoped to the current thread, which is the one polling main's future
fn bootstrap_logging() -> DefaultGuard {
    let level = LoggingConfig::default().level().unwrap_or(Level::INFO);
    tracing::subscriber::set_default(subscriber(level))
}

fn setup_logging_env(level: Level) {
    subscriber(level).init();
}
