// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! IoTSim - virtual IoT device simulator

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use iotsim::{Bus, Config, Database, DeviceRuntime, LocalBus, MqttBus, ReadingStore, NAME, VERSION};

/// IoTSim - virtual IoT device simulator
#[derive(Parser, Debug)]
#[command(name = "iotsim")]
#[command(version = VERSION)]
#[command(about = "Simulated IoT device publishing synthetic sensor readings")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the sample configuration and exit
    #[arg(long)]
    init: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// MQTT broker address
    #[arg(long)]
    mqtt_broker: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Use the in-process bus even if a broker is configured
    #[arg(long)]
    local_bus: bool,

    /// Database path
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// Run without persistence
    #[arg(long)]
    no_storage: bool,
}

/// Flags win over the configured level
fn log_level(args: &Args, configured: Option<&str>) -> Level {
    if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        configured
            .and_then(|level| level.parse().ok())
            .unwrap_or(Level::INFO)
    }
}

fn level_filter(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging before anything else; the configured level is applied once loaded
    let builder = FmtSubscriber::builder()
        .with_env_filter(level_filter(log_level(&args, None)))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .with_filter_reloading();
    let filter = builder.reload_handle();
    tracing::subscriber::set_global_default(builder.finish())?;

    info!("{} v{}", NAME, VERSION);

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);

    if args.init {
        Config::default().save(&config_path)?;
        println!("Wrote sample configuration to {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::load_or_create(&config_path)?;

    let level = log_level(&args, Some(&config.log_level));
    if let Err(e) = filter.reload(level_filter(level)) {
        warn!("Cannot apply log level {}: {}", level, e);
    }

    // Override with command line args
    if let Some(broker) = args.mqtt_broker {
        config.bus.mqtt_broker = Some(broker);
    }
    if let Some(port) = args.mqtt_port {
        config.bus.mqtt_port = port;
    }
    if args.local_bus {
        config.bus.mqtt_broker = None;
    }
    if let Some(path) = args.storage_path {
        config.storage.path = path;
    }
    if args.no_storage {
        config.storage.enabled = false;
    }

    info!("Configuration loaded from {:?}", config_path);
    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let store: Option<Arc<dyn ReadingStore>> = if config.storage.enabled {
        match Database::open(&config.storage) {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                warn!("Failed to open storage, continuing without persistence: {}", e);
                None
            }
        }
    } else {
        info!("Storage disabled");
        None
    };

    let broker = config
        .bus
        .mqtt_broker
        .as_deref()
        .filter(|b| !b.trim().is_empty());
    let bus: Arc<dyn Bus> = match broker {
        Some(broker) => Arc::new(MqttBus::connect(&config.bus, broker, &config.device_id)),
        None => Arc::new(LocalBus::default()),
    };
    info!("Using {} bus", bus.name());

    for sensor in &config.sensors {
        info!(
            "Sensor {} ({}) every {:?}, range {}..{} {}{}",
            sensor.id,
            sensor.sensor_type,
            sensor.frequency,
            sensor.min,
            sensor.max,
            sensor.unit,
            if sensor.enabled { "" } else { " [disabled]" }
        );
    }

    let device = Arc::new(DeviceRuntime::new(
        &config.device_id,
        config.sensors.clone(),
        bus.clone(),
        store,
        config.bus.readings_topic,
    ));

    let cancel = CancellationToken::new();
    device.start(cancel.clone()).await?;

    info!("Device {} running, press Ctrl+C to shut down", device.id());

    shutdown_signal().await;

    info!("Shutdown signal received, cleaning up...");
    cancel.cancel();
    device.join().await;

    if let Err(e) = bus.close().await {
        warn!("Error closing bus: {}", e);
    }

    info!("{} shutdown complete", NAME);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
                return;
            }
            Err(e) => warn!("Cannot install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
    }
}
