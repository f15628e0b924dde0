use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use yadt_receiver::bus::{BusAdapter, ChannelBus};
use yadt_receiver::cli::ReceiverCli;
use yadt_receiver::clock::SystemClock;
use yadt_receiver::config::Configuration;
use yadt_receiver::connection::ConnectionManager;
use yadt_receiver::dispatcher::Dispatcher;
use yadt_receiver::logging;
use yadt_receiver::messages::DispatcherMsg;
use yadt_receiver::metrics::{self, Counters};

/// `spec.md §6`: a missing configuration file, and any other uncaught
/// error, exits 1 — which is exactly what returning `Err` from `main` does
/// under `#[tokio::main]` (it prints the error chain to stderr and exits
/// with code 1). Graceful shutdown falls through to `Ok(())`, exit 0.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ReceiverCli::parse();

    let configuration = Configuration::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;

    let log_writer = logging::RotatingFileWriter::new(&configuration.log_filename)
        .with_context(|| format!("failed to open log file {:?}", configuration.log_filename))?;
    logging::init(log_writer).context("failed to initialize logging")?;

    tracing::info!(hostname = %configuration.hostname, "yadt-receiver starting");

    let counters = Arc::new(Counters::new());
    let metrics_directory = configuration.metrics_directory.clone();
    let (bus, mut outbound) = ChannelBus::new();
    let bus: Arc<dyn BusAdapter> = Arc::new(bus);
    // The outbound channel exists so tests and the in-memory loopback can
    // capture what would have gone out over the wire; a production
    // deployment's own BusAdapter has no equivalent of this drain task.
    tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    let clock = Arc::new(SystemClock);

    let dispatcher = Dispatcher::new(configuration, Arc::clone(&bus), Arc::clone(&clock), Arc::clone(&counters));
    let dispatcher_handle = dispatcher.handle();
    dispatcher.start();
    let dispatcher_task = tokio::spawn(dispatcher.run());

    let connection_manager = ConnectionManager::new(Arc::clone(&bus), Arc::clone(&clock), dispatcher_handle.clone());
    let (watchdog_task, refresh_task) = connection_manager.start();

    if let Some(metrics_directory) = metrics_directory {
        let counters = Arc::clone(&counters);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(err) = metrics::write_to_file(&counters, &metrics_directory, "yadt-receiver") {
                    tracing::warn!(%err, "failed to write metrics snapshot");
                }
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    let _ = dispatcher_handle.send(DispatcherMsg::Stop);
    watchdog_task.abort();
    refresh_task.abort();
    let _ = dispatcher_task.await;

    Ok(())
}
