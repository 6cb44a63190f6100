// src/main.rs - ace-host: run the device fleet as a daemon
use ace_fleet::communication::serial::{Serial2Connector, SerialConnector};
use ace_fleet::config::{self, Config, ConfigError, DeviceConfig};
use ace_fleet::fleet::hooks::{LoggingHooks, MemoryStore, StateStore, TomlFileStore};
use ace_fleet::simulator::SimConnector;
use ace_fleet::{Collaborators, FleetManager};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Serial filament unit fleet host
#[derive(Parser, Debug)]
#[command(name = "ace-host", about = "Drives up to four filament units as one 16-slot changer.")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "ace.toml")]
    config: PathBuf,

    /// Use simulated devices instead of serial ports
    #[arg(long)]
    simulate: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run until Ctrl-C (default)
    Run,
    /// Connect, print the fleet status as JSON and exit
    Status,
    /// Select a global slot ("none" unloads) and exit
    Select { slot: String },
    /// List serial ports that could host a device and exit
    Ports,
    /// Start drying on a device and exit
    Dry {
        device: u8,
        temp: u32,
        /// Minutes
        #[arg(default_value_t = 240)]
        duration: u32,
    },
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn load(cli: &Cli) -> Result<Config, ConfigError> {
    let path = cli.config.to_string_lossy();
    tracing::info!("Loading configuration from: {}", path);
    match config::load_config(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::Io(e)) if cli.simulate => {
            tracing::warn!("No config at {} ({}), simulating two devices", path, e);
            Ok(Config {
                devices: vec![
                    DeviceConfig { serial: "sim0".into(), baud: None },
                    DeviceConfig { serial: "sim1".into(), baud: None },
                ],
                ..Config::default()
            })
        }
        Err(e) => Err(e),
    }
}

fn connector(cli: &Cli, config: &Config) -> Arc<dyn SerialConnector> {
    if !cli.simulate {
        return Arc::new(Serial2Connector);
    }
    let sim = SimConnector::new();
    for device in &config.devices {
        sim.add(&device.serial);
    }
    Arc::new(sim)
}

async fn wait_connected(fleet: &FleetManager, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let all = fleet
            .status(None)
            .map(|s| s.devices.iter().all(|d| d.is_connected()))
            .unwrap_or(false);
        if all {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!("Not every device connected within {:?}", timeout);
}

fn parse_slot(slot: &str) -> Result<Option<usize>, BoxError> {
    if slot.eq_ignore_ascii_case("none") || slot == "-1" {
        return Ok(None);
    }
    Ok(Some(slot.parse::<usize>()?))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting ace-host {}", env!("CARGO_PKG_VERSION"));

    let config = load(&cli).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", cli.config.display(), e);
        Box::new(e) as BoxError
    })?;
    config.validate()?;
    for (id, device) in config.devices.iter().enumerate() {
        tracing::info!(
            "Device {}: {} @ {} baud",
            id,
            device.serial,
            device.baud.unwrap_or(config.serial.baud)
        );
    }

    let connector = connector(&cli, &config);
    if let Some(Commands::Ports) = cli.command {
        let ports = connector.available_ports();
        if ports.is_empty() {
            tracing::warn!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    let store: Arc<dyn StateStore> = match &config.fleet.state_file {
        Some(path) => {
            let store = TomlFileStore::new(path);
            tracing::info!("Persisting state to {}", store.path().display());
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::default()),
    };
    let collaborators = Collaborators {
        hooks: Arc::new(LoggingHooks),
        store,
        sensor: None,
    };
    let fleet = FleetManager::from_config(&config, connector, collaborators)?;

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&fleet).await,
        Commands::Status => {
            wait_connected(&fleet, Duration::from_secs(5)).await;
            let status = fleet.status(None)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Select { slot } => {
            wait_connected(&fleet, Duration::from_secs(5)).await;
            let selected = fleet.select(parse_slot(&slot)?).await?;
            tracing::info!("Selected slot: {:?}", selected);
            Ok(())
        }
        Commands::Dry { device, temp, duration } => {
            wait_connected(&fleet, Duration::from_secs(5)).await;
            fleet.start_drying(device, temp, duration).await.map_err(BoxError::from)
        }
        Commands::Ports => Ok(()),
    };

    fleet.shutdown().await;
    result
}

async fn run(fleet: &FleetManager) -> Result<(), BoxError> {
    let mut summary = tokio::time::interval(Duration::from_secs(30));
    summary.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Ctrl-C received, shutting down");
                return Ok(());
            }
            _ = summary.tick() => {
                let status = fleet.status(None)?;
                for device in &status.devices {
                    let slots: Vec<String> = device.slots.iter().map(|s| s.status.to_string()).collect();
                    tracing::info!(
                        "Device {}: {} slots=[{}] assist={:?}",
                        device.id,
                        device.state,
                        slots.join(","),
                        device.feed_assist_slot
                    );
                }
                tracing::info!("Selected slot: {:?}", status.current_slot);
            }
        }
    }
}
