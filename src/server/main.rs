//! Keyseat server binary.
//!
//! Loads configuration, opens the record store, starts the background jobs and
//! serves the session API until Ctrl-C. All open sessions are closed on the
//! way out.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use keyseat::authority::{AuthoritySettings, LicenseAuthority};
use keyseat::config::{get_config, KeyseatConfig};
use keyseat::errors::{LicenseError, LicenseResult};
use keyseat::jobs::{JobConfig, JobScheduler};
use keyseat::server::{build_router, init_tracing, AppState, Database};
use keyseat::store::{LicenseStore, MemoryStore};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Keyseat server stopped with an error: {e}");
        eprintln!("keyseat_server: {e}");
        std::process::exit(1);
    }
}

async fn run() -> LicenseResult<()> {
    let config = get_config()?;
    init_tracing(&config.logging.level);

    let store = open_store(config).await?;
    info!(backend = store.backend_name(), "Record store ready");

    let authority = Arc::new(LicenseAuthority::new(
        store,
        AuthoritySettings::from(&config.session),
    ));

    let mut scheduler = JobScheduler::new(Arc::clone(&authority), JobConfig::from(&config.session))
        .await
        .map_err(|e| LicenseError::ServerError(e.to_string()))?;
    scheduler
        .start()
        .await
        .map_err(|e| LicenseError::ServerError(e.to_string()))?;

    let app = build_router(AppState::new(Arc::clone(&authority)));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| LicenseError::ConfigError(format!("invalid listen address: {e}")))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| LicenseError::ServerError(format!("failed to bind {addr}: {e}")))?;

    info!("Keyseat server listening on http://{}", addr);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_ctrl_c(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| LicenseError::ServerError(e.to_string()))?;

    if let Err(e) = scheduler.shutdown().await {
        error!("Failed to stop job scheduler: {e}");
    }
    authority.shutdown();

    info!("Keyseat server stopped");
    Ok(())
}

async fn open_store(config: &KeyseatConfig) -> LicenseResult<Arc<dyn LicenseStore>> {
    if config.database.db_type == "memory" {
        info!("Using in-memory record store; records are lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let db = Database::connect(&config.database).await?;
    db.migrate().await?;
    Ok(db)
}

async fn watch_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }
    shutdown.cancel();
}
