use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dispatchd::bootstrap::Component;
use dispatchd::config::Config;
use dispatchd::feedback::LoggingReporter;
use dispatchd::forwarder::{MessageDispatcher, MockConnector};
use dispatchd::store::create_storage;
use dispatchd::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(author, version, about = "Durable multi-tier message dispatch pipeline")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&config.telemetry.tracing_config())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting dispatchd"
    );

    info!(
        instant_queue = %config.instant_queue.name,
        delayed_queues = config.delayed_queues.len(),
        backend = ?config.store.backend,
        "configuration loaded"
    );

    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let storage = create_storage(&config.store)?;
    let dispatcher = MessageDispatcher::build(
        &config,
        storage.clone(),
        Arc::new(MockConnector::new(&config.connector)),
        Arc::new(LoggingReporter),
    )
    .context("failed to build dispatcher")?;

    let faulted = CancellationToken::new();
    let on_fault = faulted.clone();
    dispatcher.subscribe_faults(move |e| {
        error!(error = %e, "pipeline faulted");
        on_fault.cancel();
    });

    dispatcher
        .open(&CancellationToken::new())
        .await
        .context("failed to open dispatcher")?;
    info!("dispatcher running, press Ctrl-C to stop");

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received");
        }
        _ = faulted.cancelled() => {
            warn!("stopping after fault");
        }
    }

    let deadline = CancellationToken::new();
    let timer = deadline.clone();
    let close_timeout = config.processor.close_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(close_timeout).await;
        timer.cancel();
    });

    if let Err(e) = dispatcher.close(&deadline).await {
        warn!(error = %e, "dispatcher did not close cleanly");
    }
    storage.flush().context("failed to flush storage")?;

    info!(stats = ?dispatcher.stats(), "dispatchd stopped");
    Ok(())
}
