//! Process wiring for each subcommand.

use std::sync::Arc;
use std::time::Duration;

use evc_api::{central_app, registry_app};
use evc_central::admin::run_console;
use evc_central::{
    CentralServer, Coordinator, RegistryClient, StationDirectory, TcpControlHub, spawn_registry_poller,
};
use evc_core::Location;
use evc_core::bus::{InProcessBus, Origin, Publisher};
use evc_core::registry::Registry;
use evc_core::store::{JsonlStore, RecordStore};
use evc_engine::monitor::StationMonitor;
use evc_engine::net::{CentralReporter, LinkConfig, StationLink, TcpProber, UplinkBus, serve_probes};
use evc_engine::{EngineHandle, StationEngine, runtime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Settings;
use crate::error::AppError;

async fn bind(addr: &str) -> Result<TcpListener, AppError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| AppError::bind(addr, source))
}

fn open_store(settings: &Settings, name: &str) -> Result<Arc<dyn RecordStore>, AppError> {
    let path = settings.data_dir.join(name);
    let store = JsonlStore::open(&path).map_err(AppError::store)?;
    tracing::info!(path = %path.display(), "record store opened");
    Ok(Arc::new(store))
}

/// Flips the returned watch to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (stop, shutdown) = watch::channel(false);
    let signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = signal.send(true);
        }
    });
    (stop, shutdown)
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub async fn run_registry(settings: &Settings, bind_addr: &str) -> Result<(), AppError> {
    let registry = Arc::new(Registry::new(open_store(settings, "registry.jsonl")?));
    let listener = bind(bind_addr).await?;
    tracing::info!(addr = bind_addr, "registry service listening");

    let (_stop, shutdown) = shutdown_on_ctrl_c();
    axum::serve(listener, registry_app(registry))
        .with_graceful_shutdown(wait_for(shutdown))
        .await?;
    Ok(())
}

pub struct CentralOptions {
    pub control_bind: String,
    pub http_bind: String,
    pub registry_url: Option<String>,
    pub console: bool,
}

pub async fn run_central(settings: &Settings, options: CentralOptions) -> Result<(), AppError> {
    let bus = Arc::new(InProcessBus::default());
    let hub = Arc::new(TcpControlHub::new());
    let coordinator = Arc::new(Coordinator::new(
        open_store(settings, "central.jsonl")?,
        bus.clone(),
        hub.clone(),
        settings.retry_policy(),
    ));
    let restored = coordinator.restore().await.map_err(AppError::store)?;
    tracing::info!(stations = restored, "coordinator state restored");
    let consumer = coordinator.spawn_event_consumer(bus.as_ref());

    let (stop, shutdown) = shutdown_on_ctrl_c();

    let directory: Option<Arc<dyn StationDirectory>> = match &options.registry_url {
        Some(url) => {
            let client = RegistryClient::new(url.clone(), settings.command_timeout).map_err(AppError::config)?;
            let directory: Arc<dyn StationDirectory> = Arc::new(client);
            spawn_registry_poller(
                coordinator.clone(),
                directory.clone(),
                settings.registry_poll,
                shutdown.clone(),
            );
            Some(directory)
        }
        None => {
            tracing::warn!("no registry configured, engines are admitted without authentication");
            None
        }
    };

    let server = Arc::new(CentralServer::new(coordinator.clone(), hub, bus.clone(), directory));
    let control = bind(&options.control_bind).await?;
    let control_task = tokio::spawn(server.serve(control, shutdown.clone()));

    let http = bind(&options.http_bind).await?;
    tracing::info!(addr = %options.http_bind, "central API listening");
    let http_shutdown = shutdown.clone();
    let http_coordinator = coordinator.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(http, central_app(http_coordinator))
            .with_graceful_shutdown(wait_for(http_shutdown))
            .await
    });

    if options.console {
        let console_coordinator = coordinator.clone();
        let console_stop = stop.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(error) = run_console(&console_coordinator, stdin, tokio::io::stdout()).await {
                tracing::warn!(error = %error, "console stopped");
            }
            // `quit` shuts the coordinator down, end of input does not
            if !console_coordinator.is_accepting() {
                let _ = console_stop.send(true);
            }
        });
    }

    wait_for(shutdown).await;
    coordinator.shutdown().await;

    if let Ok(Err(error)) = control_task.await {
        tracing::warn!(error = %error, "control port failed");
    }
    if let Ok(Err(error)) = http_task.await {
        tracing::warn!(error = %error, "central API failed");
    }
    consumer.abort();
    tracing::info!("coordinator stopped");
    Ok(())
}

pub struct EngineOptions {
    pub station_id: String,
    pub central: String,
    pub probe_bind: String,
    pub location: Location,
    pub price_per_kwh: f64,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub async fn run_engine(settings: &Settings, options: EngineOptions) -> Result<(), AppError> {
    evc_core::validate_station(&options.station_id, &options.location, options.price_per_kwh)
        .map_err(AppError::config)?;

    let (stop, shutdown) = shutdown_on_ctrl_c();
    let (uplink, outbox) = UplinkBus::new();
    let publisher = Arc::new(Publisher::new(Arc::new(uplink), Origin::Engine));
    let engine_config = settings.engine_config();
    let (engine, engine_task) = runtime::spawn(
        StationEngine::new(options.station_id.as_str(), engine_config.kwh_per_tick),
        engine_config,
        publisher,
        shutdown.clone(),
    );

    let probes = bind(&options.probe_bind).await?;
    tracing::info!(station_id = %options.station_id, addr = %options.probe_bind, "probe endpoint listening");
    tokio::spawn(serve_probes(probes, engine.clone(), shutdown.clone()));

    let link = StationLink::new(
        LinkConfig {
            station_id: options.station_id.clone(),
            central_addr: options.central,
            location: options.location,
            price_per_kwh: options.price_per_kwh,
            username: options.username,
            password: options.password,
            heartbeat_interval: settings.heartbeat_interval,
            reconnect_delay: Duration::from_secs(1),
        },
        engine.clone(),
        outbox,
    );
    let link_stop = stop.clone();
    let link_shutdown = stop.subscribe();
    let link_task = tokio::spawn(async move {
        let result = link.run(link_shutdown).await;
        if let Err(error) = &result {
            tracing::error!(error = %error, "station link ended");
            let _ = link_stop.send(true);
        }
        result
    });

    let console_stop = stop.clone();
    tokio::spawn(async move {
        if engine_console(engine).await {
            let _ = console_stop.send(true);
        }
    });

    wait_for(shutdown).await;
    let _ = link_task.await;
    let _ = engine_task.await;
    tracing::info!(station_id = %options.station_id, "engine stopped");
    Ok(())
}

/// Local operator input for the simulated charging point. Returns `true`
/// when the operator asked to quit.
async fn engine_console(engine: EngineHandle) -> bool {
    println!("commands: status | fault <reason> | outage on|off | unplug | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        let result = match words.next() {
            None => continue,
            Some("status") => match engine.snapshot().await {
                Ok(snapshot) => {
                    println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
                    Ok(())
                }
                Err(error) => Err(error),
            },
            Some("fault") => {
                let reason = words.collect::<Vec<_>>().join(" ");
                let reason = if reason.is_empty() { "manual fault".to_string() } else { reason };
                engine.fault(reason).await
            }
            Some("outage") => match words.next() {
                Some("on") => engine.set_outage(true).await,
                Some("off") => engine.set_outage(false).await,
                _ => {
                    println!("usage: outage on|off");
                    Ok(())
                }
            },
            Some("unplug") => match engine.snapshot().await {
                Ok(snapshot) => match snapshot.charge {
                    Some(charge) => engine.finish(charge.session_id).await,
                    None => {
                        println!("nothing is charging");
                        Ok(())
                    }
                },
                Err(error) => Err(error),
            },
            Some("quit") => return true,
            Some(other) => {
                println!("unknown command '{other}'");
                Ok(())
            }
        };
        if let Err(error) = result {
            println!("refused: {error}");
        }
    }
    false
}

pub async fn run_monitor(
    settings: &Settings,
    station_id: &str,
    engine_addr: &str,
    central_addr: &str,
) -> Result<(), AppError> {
    let (_stop, shutdown) = shutdown_on_ctrl_c();
    let monitor = StationMonitor::new(
        station_id,
        settings.monitor_config(),
        Arc::new(TcpProber::new(station_id, engine_addr)),
        Arc::new(CentralReporter::new(central_addr)),
    );
    tracing::info!(station_id, engine = engine_addr, central = central_addr, "monitor starting");
    monitor.run(shutdown).await;
    Ok(())
}
