use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hivewatch_core::DeviceId;
use hivewatch_edge::{
    buffer::LocalBuffer,
    collector::Collector,
    config::Config,
    forwarder::SyncForwarder,
    reader::{retry::RetryingReader, simulated::SimulatedReader},
    scheduler::CollectionScheduler,
    transport::RpcUplink,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "hivewatch-edge")]
#[command(about = "Hive sensor collection and forwarding")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "hivewatch-edge.toml")]
    config: PathBuf,

    /// Percentage of simulated hardware reads that fail
    #[arg(long, default_value_t = 2)]
    simulated_failure_percent: u32,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    info!(path = ?cli.config, "Loading configuration");
    let config = Config::load(&cli.config)?;
    let device_id = DeviceId(config.device_id);

    info!(
        %device_id,
        hub_addr = %config.hub_addr,
        network = %config.network.describe(),
        hives = config.hives.len(),
        sensors = config.sensors.len(),
        "Starting edge device"
    );

    let buffer = Arc::new(LocalBuffer::new(config.buffer.to_config()));
    let reader = RetryingReader::new(
        SimulatedReader::new(cli.simulated_failure_percent),
        config.reader.retry_policy(),
        config.reader.breaker(),
    );
    let scheduler = CollectionScheduler::new(config.schedule(), &config.hives(), &config.sensors())?;
    let (collector, _handle) = Collector::new(
        reader,
        Arc::clone(&buffer),
        config.adaptive.detector(),
        scheduler,
        config.sensors(),
        config.schedule.tick.to_std(),
    );

    let forwarder_config = config.forwarder.to_config();
    let uplink = RpcUplink::new(config.hub_addr.clone(), forwarder_config.send_timeout);
    let forwarder = SyncForwarder::new(device_id, uplink, Arc::clone(&buffer), forwarder_config);

    let collector_cancel = CancellationToken::new();
    let forwarder_cancel = CancellationToken::new();
    let collector_task = tokio::spawn(collector.run(collector_cancel.clone()));
    let forwarder_task = tokio::spawn(forwarder.run(forwarder_cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    // in-flight reads land in the buffer before the forwarder's final flush
    collector_cancel.cancel();
    collector_task.await?;
    forwarder_cancel.cancel();
    forwarder_task.await?;

    info!(dropped = buffer.dropped(), "Edge device stopped");
    Ok(())
}
