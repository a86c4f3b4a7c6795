//! cadence controller
//!
//! Converges `CronSchedule` objects: launches one `WorkItem` per due fire
//! time, enforces the concurrency policy, prunes finished history and keeps
//! each schedule's status current.
//!
//! ## Architecture
//!
//! - **Store**: in-memory object store, optionally seeded from manifests
//! - **Cache**: list/watch mirror of the store feeding the work queue
//! - **Controller**: worker pool running the cron schedule reconciler
//! - **Executor**: simulated backend moving work items through their phases

use std::sync::Arc;

use anyhow::Result;
use cadence_api::Scheme;
use cadence_controller::{
    cache::Cache,
    config::{self, LogFormat},
    controller::Controller,
    executor::Executor,
    manifests,
    reconciler::CronScheduleReconciler,
    recorder::TracingRecorder,
    store::{MemoryStore, Store},
};
use cadence_reconcile::{Clock, SystemClock};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CADENCE_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
    }

    info!("Starting cadence controller");
    info!(
        workers = config.workers,
        resync_secs = config.resync_interval.map(|d| d.as_secs()),
        missed_run_cap = config.missed_run_cap,
        "Configuration loaded"
    );

    let scheme = Scheme::with_defaults();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(Arc::clone(&clock)));

    if let Some(dir) = &config.manifest_dir {
        let objects = match manifests::load_dir(dir, &scheme) {
            Ok(objects) => objects,
            Err(e) => {
                error!(error = %e, dir = %dir.display(), "Failed to load manifests");
                return Err(e);
            }
        };
        manifests::seed(store.as_ref(), objects).await?;
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cache = Arc::new(Cache::new(Arc::clone(&store), config.resync_interval));
    let reconciler = Arc::new(CronScheduleReconciler::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&clock),
        Arc::new(TracingRecorder),
        config.schedule_config(),
    ));
    let controller = Controller::new(
        "cron-schedule",
        cache,
        reconciler,
        config.controller_config(),
    );

    // Start the simulated executor
    let executor = Executor::new(Arc::clone(&store), Arc::clone(&clock), config.simulated_runtime);
    let executor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            executor.run(shutdown_rx).await;
        }
    });

    // Start the controller
    let mut controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(shutdown_rx).await }
    });

    // Wait for shutdown signal (Ctrl+C)
    let mut controller_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            controller_done = true;
            match result {
                Ok(Ok(())) => info!("Controller exited normally"),
                Ok(Err(e)) => error!(error = %e, "Controller error"),
                Err(e) => error!(error = %e, "Controller task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if !controller_done {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, controller_handle).await {
            warn!(error = %e, "Controller did not shut down in time");
        }
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, executor_handle).await {
        warn!(error = %e, "Executor did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
