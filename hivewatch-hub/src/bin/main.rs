use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hivewatch_core::duration::HumanDuration;
use hivewatch_hub::{
    aggregator::TierAggregator,
    api::{ApiState, api_router},
    cache::LastValueCache,
    cleanup::{HiveCleanup, NoAttachments},
    client::Client,
    config::{Config, StorageConfig},
    ingest::IngestWriter,
    locks::{SensorLocks, TierLocks},
    maintenance::Maintenance,
    pruner::RetentionPruner,
    query::QueryService,
    registry::{SensorRegistry, memory::InMemorySensorRegistry},
    retention::{RetentionHandle, RetentionReloader, initial_tiers},
    store::{TimeSeriesStore, memory::MemoryStore, sqlite::SqliteStore},
};
use hivewatch_rpc::Server;
use jiff::Timestamp;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use ulid::Ulid;

#[derive(Parser)]
#[command(name = "hivewatch-hub")]
#[command(about = "Hive sensor ingest, rollup and retention")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "hivewatch-hub.toml")]
        config: PathBuf,
    },
    /// Query readings of a sensor
    Query {
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
        sensor: Ulid,
        #[arg(long)]
        start: Timestamp,
        #[arg(long)]
        end: Timestamp,
        /// Bucket width such as `1h` or `20min`
        #[arg(long)]
        interval: Option<HumanDuration>,
    },
    /// Show the latest value of a sensor
    Latest {
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
        sensor: Ulid,
    },
    /// Show or reload the retention table
    Retention {
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
        /// Re-read the tiers from the hub's config file first
        #[arg(long)]
        reload: bool,
    },
    /// Delete a hive and everything attached to it
    DeleteHive {
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
        hive: Ulid,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Query {
            url,
            sensor,
            start,
            end,
            interval,
        } => {
            let response = Client::new(url)
                .readings(sensor, start, end, interval.map(|i| i.get()))
                .await?;
            print_json(&response)
        }
        Command::Latest { url, sensor } => print_json(&Client::new(url).latest(sensor).await?),
        Command::Retention { url, reload } => {
            let client = Client::new(url);
            let response = if reload {
                client.reload_retention().await?
            } else {
                client.retention().await?
            };
            print_json(&response)
        }
        Command::DeleteHive { url, hive } => print_json(&Client::new(url).delete_hive(hive).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(path: PathBuf) -> color_eyre::Result<()> {
    let (config, config_path) = if path.exists() {
        info!(path = ?path, "Loading configuration");
        (Config::load(&path)?, Some(path))
    } else {
        info!("No configuration file found, using defaults");
        (Config::default(), None)
    };

    let store: Arc<dyn TimeSeriesStore> = match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory time-series store");
            Arc::new(MemoryStore::new())
        }
        StorageConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite time-series store");
            Arc::new(SqliteStore::new(path).await?)
        }
    };

    let registry: Arc<dyn SensorRegistry> =
        Arc::new(InMemorySensorRegistry::with_fleet(config.hives(), config.sensors()).await?);
    info!(
        hives = config.hives.len(),
        sensors = config.sensors.len(),
        "Sensor registry loaded"
    );

    let tiers = initial_tiers(config.retention.tiers.clone(), store.as_ref()).await?;
    info!(
        tiers = ?tiers.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        "Retention table loaded"
    );
    let retention = Arc::new(RetentionHandle::new(tiers)?);
    let cache = Arc::new(LastValueCache::new(config.ingest.last_value_staleness.get()));
    let sensor_locks = SensorLocks::new();
    let tier_locks = TierLocks::new();

    let writer = IngestWriter::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&retention),
        Arc::clone(&cache),
        sensor_locks.clone(),
        config.ingest.to_config(),
    );

    let aggregator = Arc::new(TierAggregator::new(
        Arc::clone(&store),
        Arc::clone(&retention),
        tier_locks.clone(),
        sensor_locks.clone(),
        config.maintenance.settle_delay.get(),
    ));
    let pruner = Arc::new(RetentionPruner::new(
        Arc::clone(&store),
        Arc::clone(&retention),
        tier_locks,
        sensor_locks.clone(),
    ));
    let maintenance = Maintenance::new(
        aggregator,
        pruner,
        Arc::clone(&retention),
        config.maintenance.to_config(),
    );

    let reloader = Arc::new(RetentionReloader::new(
        config_path,
        Arc::clone(&retention),
        Arc::clone(&store),
    ));
    let state = ApiState {
        query: Arc::new(QueryService::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&retention),
        )),
        store: Arc::clone(&store),
        cache: Arc::clone(&cache),
        reloader: Arc::clone(&reloader),
        cleanup: Arc::new(HiveCleanup::new(
            registry,
            Arc::clone(&store),
            Arc::new(NoAttachments),
            cache,
            sensor_locks,
        )),
    };

    let cancel = CancellationToken::new();

    #[cfg(unix)]
    reload_on_hangup(Arc::clone(&reloader), cancel.clone())?;

    let maintenance_cancel = CancellationToken::new();
    let maintenance_task = tokio::spawn(maintenance.run(maintenance_cancel.clone()));

    let rpc_addr = config.server.rpc_addr;
    let rpc_listener = TcpListener::bind(rpc_addr).await?;
    info!(%rpc_addr, "RPC server listening");
    let rpc_server = Server::new(rpc_listener, writer);

    let http_addr = config.server.http_addr;
    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_clone = cancel.clone();
    tokio::select! {
        _ = rpc_server.serve(cancel.clone()) => {
            info!("RPC server shut down");
        }
        result = axum::serve(axum_listener, api_router(state)).with_graceful_shutdown(async move {
            cancel_clone.cancelled().await;
        }) => {
            if let Err(e) = result {
                tracing::error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    cancel.cancel();

    maintenance_cancel.cancel();
    maintenance_task.await?;

    info!("Hub stopped");
    Ok(())
}

/// Reloads the retention table whenever the process receives SIGHUP.
#[cfg(unix)]
fn reload_on_hangup(
    reloader: Arc<RetentionReloader>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading retention table");
                    reloader.reload_logged().await;
                }
            }
        }
    });
    Ok(())
}
