mod config;
mod error;
mod logging;
mod services;

use clap::{Parser, Subcommand};

use crate::config::Settings;

/// Command line arguments for the ev-charging network
#[derive(Parser, Debug)]
#[command(name = "ev-charging")]
#[command(about = "EV charging network: registry, coordinator, station engines and monitors")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the station registry HTTP service
    Registry {
        /// Address to serve the registry API on
        #[arg(long, default_value = "0.0.0.0:6000")]
        bind: String,
    },
    /// Run the coordinator with its control port, HTTP API and console
    Central {
        /// Address engines and monitors connect to
        #[arg(long, default_value = "0.0.0.0:7000")]
        control_bind: String,
        /// Address to serve the operator and driver API on
        #[arg(long, default_value = "0.0.0.0:8080")]
        http_bind: String,
        /// Registry base URL; without it every engine is admitted
        #[arg(long)]
        registry_url: Option<String>,
        /// Do not read operator commands from stdin
        #[arg(long)]
        no_console: bool,
    },
    /// Run one station engine
    Engine {
        #[arg(long)]
        station_id: String,
        /// Coordinator control port
        #[arg(long, default_value = "127.0.0.1:7000")]
        central: String,
        /// Address the monitor probes
        #[arg(long, default_value = "0.0.0.0:7100")]
        probe_bind: String,
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Price per kWh
        #[arg(long)]
        price: f64,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Run the liveness monitor paired with one engine
    Monitor {
        #[arg(long)]
        station_id: String,
        /// Engine probe address
        #[arg(long, default_value = "127.0.0.1:7100")]
        engine: String,
        /// Coordinator control port
        #[arg(long, default_value = "127.0.0.1:7000")]
        central: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init()?;
    let settings = Settings::from_env()?;
    tracing::debug!(?settings, "settings loaded");

    match args.command {
        Command::Registry { bind } => services::run_registry(&settings, &bind).await?,
        Command::Central {
            control_bind,
            http_bind,
            registry_url,
            no_console,
        } => {
            services::run_central(
                &settings,
                services::CentralOptions {
                    control_bind,
                    http_bind,
                    registry_url,
                    console: !no_console,
                },
            )
            .await?
        }
        Command::Engine {
            station_id,
            central,
            probe_bind,
            lat,
            lon,
            price,
            username,
            password,
        } => {
            services::run_engine(
                &settings,
                services::EngineOptions {
                    station_id,
                    central,
                    probe_bind,
                    location: evc_core::Location::new(lat, lon),
                    price_per_kwh: price,
                    username,
                    password,
                },
            )
            .await?
        }
        Command::Monitor {
            station_id,
            engine,
            central,
        } => services::run_monitor(&settings, &station_id, &engine, &central).await?,
    }
    Ok(())
}
