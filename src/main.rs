//! moliord entry point.
//!
//! Initializes logging, connects storage, runs the Startup Reconciler, then
//! drives the Worker loop until a shutdown signal arrives.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use molior_core::apt::{AptQueue, LoggingAptQueue};
use molior_core::backend::{BuildBackend, StaticBackend};
use molior_core::build::BuildStore;
use molior_core::chroot::ChrootGovernor;
use molior_core::clock::{Clock, SystemClock};
use molior_core::config::Config;
use molior_core::context::Context;
use molior_core::git::{GitClient, ProcessGit};
use molior_core::metrics;
use molior_core::notifier::{BuildLog, LoggingNotifier, Notifier, TracingBuildLog};
use molior_core::reconciler::Reconciler;
use molior_core::repository::RepositoryStore;
use molior_core::storage::Database;
use molior_core::task;
use molior_core::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info".
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    metrics::init_metrics().ok();

    let db = Arc::new(Database::connect(&config.database_url).await?);
    db.run_migrations().await?;

    let build_store: Arc<dyn BuildStore> = db.clone();
    let repo_store: Arc<dyn RepositoryStore> = db.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);
    let log: Arc<dyn BuildLog> = Arc::new(TracingBuildLog);
    let git: Arc<dyn GitClient> = Arc::new(ProcessGit);
    let backend: Arc<dyn BuildBackend> = Arc::new(StaticBackend::default());
    let apt_queue: Arc<dyn AptQueue> = Arc::new(LoggingAptQueue);

    let chroot_governor = Arc::new(
        ChrootGovernor::new(config.max_parallel_chroots).with_on_change(metrics::chroot_gauge_callback()),
    );

    let (queue, receiver) = task::channel();

    tracing::info!(
        max_parallel_chroots = config.max_parallel_chroots,
        repositories_root = %config.repositories_root.display(),
        "starting moliord"
    );

    {
        let reconciler = Reconciler::new(&*build_store, &*repo_store, &*clock, &*notifier, &*log);
        let reconciled = reconciler.run().await?;
        if reconciled > 0 {
            tracing::info!(reconciled, "startup reconciler repaired abandoned builds");
        }
    }

    let ctx = Arc::new(Context::new(
        queue.clone(),
        build_store,
        repo_store,
        clock,
        notifier,
        log,
        git,
        backend,
        apt_queue,
        chroot_governor,
        config.repositories_root.clone(),
        config.buildout_root.clone(),
    ));

    let shutdown_queue = queue.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_queue.shutdown();
        }
    });

    let mut worker = Worker::new(receiver, ctx);
    worker.run().await;

    Ok(())
}
