//! Entrypoint: parses CLI/env configuration, initializes tracing, and runs
//! the supervisor against a single replication slot until a shutdown
//! signal arrives.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use wal2xpipe::config::{load_config_from_args, Args};
use wal2xpipe::connection::CatalogPool;
use wal2xpipe::handler::StaticHandler;
use wal2xpipe::notify::PipelineNotifier;
use wal2xpipe::session::Session;
use wal2xpipe::status::StatusRegistry;
use wal2xpipe::store::{InMemoryEventStore, Persistor};
use wal2xpipe::supervisor::{self, ShutdownHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();
    let config = load_config_from_args(args)?;
    info!(slot_id = %config.id, slot_name = %config.slot_name, "starting replication session");

    // The real EventStore and MessageHandler live outside this crate;
    // the in-memory store/static handler here is the dev-mode stand-in.
    let handler = Arc::new(StaticHandler::new(config.id.clone(), Vec::new(), Vec::new()));
    let status = Arc::new(StatusRegistry::new());
    let notifier = PipelineNotifier::new();
    let persistor = Arc::new(Persistor::with_notifications(
        InMemoryEventStore::new(),
        status.clone(),
        notifier,
    ));
    let catalog_pool = Arc::new(CatalogPool::new());

    let slot_id = config.id.clone();
    let session = Arc::new(Session::new(config, handler, persistor, status, catalog_pool));

    let shutdown = ShutdownHandle::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            shutdown_for_signal.stop();
        }
    });

    if let Err(e) = supervisor::run(session, &slot_id, shutdown).await {
        error!(error = %e, "supervisor exited with error");
        return Err(e.into());
    }

    Ok(())
}
