//! ocppj-sim: OCPP-J simulator
//!
//! Runs either side of an OCPP 1.6 / 2.0.1 link from one binary.
//!
//! ```sh
//! # Central system on the configured port
//! ocppj-sim central-system
//!
//! # Charging station dialing ws://127.0.0.1:8887/ocpp/CS001
//! ocppj-sim charging-station --url ws://127.0.0.1:8887/ocpp --id CS001
//!
//! # Validate config without starting
//! ocppj-sim --config ./ocppj.toml --check
//! ```

mod central_system;
mod charging_station;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};

use ocppj::config::{AppConfig, ConfigSource, LoggingConfig, CONFIG_ENV};
use ocppj::{init_tracing, listen_for_shutdown_signals, ShutdownSignal};

/// OCPP-J simulator for central systems and charging stations.
#[derive(Parser, Debug)]
#[command(
    name = "ocppj-sim",
    version,
    about = "OCPP-J simulator for OCPP 1.6 and 2.0.1",
    long_about = "Runs a central system or a charging station over OCPP-J.\n\n\
                  Default config: ~/.config/ocppj/config.toml"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration file and exit.
    #[arg(long)]
    check: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept charging stations and answer their requests.
    CentralSystem {
        /// Override the listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a central system, boot and send heartbeats.
    ChargingStation {
        /// Override the central system base url.
        #[arg(long)]
        url: Option<String>,
        /// Override the station id.
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // ── Load configuration ─────────────────────────────────────
    let config_path = cli.config.clone().unwrap_or_else(ocppj::default_config_path);

    let mut config = match AppConfig::load(&config_path) {
        Ok((mut cfg, source)) => {
            if let Some(ref level) = cli.log_level {
                cfg.logging.level = level.clone();
            }
            init_tracing(&cfg.logging);
            match source {
                ConfigSource::File => info!("Configuration loaded from {}", config_path.display()),
                ConfigSource::Defaults => {
                    info!("Config file {} not found, using defaults", config_path.display())
                }
            }
            cfg
        }
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            error!("Failed to load config from {}: {}", config_path.display(), e);
            if cli.check {
                return Err(e.into());
            }
            error!("Using default configuration.");
            AppConfig::default()
        }
    };

    // ── Config validation mode ─────────────────────────────────
    if cli.check {
        println!("✅ Configuration is valid");
        println!("   Config file  : {}", config_path.display());
        println!(
            "   Server       : {}{} ({})",
            config.server.address(),
            config.server.listen_path,
            config.server.ocpp_version
        );
        println!(
            "   Client       : {}/{} ({})",
            config.client.url.trim_end_matches('/'),
            config.client.station_id,
            config.client.ocpp_version
        );
        println!("   Log level    : {}", config.logging.level);
        return Ok(());
    }

    // ── Apply CLI overrides ────────────────────────────────────
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = listen_for_shutdown_signals(shutdown).await {
                error!("Failed to install signal handlers: {}", e);
            }
        });
    }

    match command {
        Command::CentralSystem { port } => {
            if let Some(port) = port {
                info!("CLI override: port = {}", port);
                config.server.port = port;
            }
            central_system::run(&config, shutdown).await?;
        }
        Command::ChargingStation { url, id } => {
            if let Some(url) = url {
                info!("CLI override: url = {}", url);
                config.client.url = url;
            }
            if let Some(id) = id {
                info!("CLI override: station_id = {}", id);
                config.client.station_id = id;
            }
            charging_station::run(&config, shutdown).await?;
        }
    }

    Ok(())
}
