#![deny(unsafe_code)]

//! rigd CLI — command-line control plane.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rigd_config::AppConfig;
use rigd_core::manager::{DaemonManager, DiscoveryProbe};
use rigd_core::{EventBus, WorldState};

mod probe;
mod transport;

use probe::ConfigProbe;
use transport::CharDeviceFactory;

/// rigd — hardware orchestration daemon for a multi-peripheral rig.
#[derive(Parser)]
#[command(name = "rigd", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "rigd.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover configured hardware and run the orchestration engine.
    Start,

    /// Run discovery and print what would be orchestrated, without starting.
    Probe,

    /// Validate and display configuration.
    CheckConfig {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    // -v flags override the configured level.
    let filter = match cli.verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Start => cmd_start(config).await?,
        Commands::Probe => cmd_probe(config).await?,
        Commands::CheckConfig { show } => cmd_check_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_start(config: AppConfig) -> Result<()> {
    info!("Starting rigd orchestration engine");

    let world = Arc::new(WorldState::new(config.bus.capacity));
    let bus = EventBus::new(config.bus.capacity);
    let probe = ConfigProbe::new(config.peripherals.clone());
    let manager = DaemonManager::new(
        config,
        world,
        bus,
        Box::new(probe),
        Box::new(CharDeviceFactory),
    );

    let summary = manager.discover_and_configure().await?;
    if summary.added.is_empty() {
        info!("No peripherals reachable; engine idle");
    } else {
        info!(daemons = ?summary.added, "Discovered peripherals");
    }
    manager.start_all().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.stop_all().await;
    manager.shutdown().await;

    Ok(())
}

async fn cmd_probe(config: AppConfig) -> Result<()> {
    let probe = ConfigProbe::new(config.peripherals);
    let found = probe.probe().await?;

    if found.is_empty() {
        println!("No configured peripherals are reachable.");
        return Ok(());
    }
    for descriptor in &found {
        println!("{}", serde_json::to_string_pretty(descriptor)?);
    }
    Ok(())
}

fn cmd_check_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path).await?)
    } else {
        // Tracing is not initialised yet; a missing file is fine (empty rig).
        eprintln!("Config file {} not found, using defaults", path.display());
        Ok(AppConfig::default())
    }
}
