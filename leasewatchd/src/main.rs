mod activity;
mod api;
mod config;
mod coordinator;
mod error;
mod ipfilter;
mod normalize;
mod presence;
mod source;
mod store;
mod store_manager;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::source::TechnitiumClient;
use crate::store::db::StoreDb;
use crate::store::hash::compute_hash;
use crate::store_manager::StoreHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("leasewatchd=info")),
        )
        .init();

    tracing::info!("Starting leasewatchd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/leasewatch/leasewatchd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open the device presence database
    let db = StoreDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    // Seed the change hash and the device-set snapshot from persisted state
    // so a restart neither re-announces known devices nor resets consumers.
    let initial_records = db.get_all()?;
    let initial_hash = compute_hash(&initial_records);
    let prior: HashSet<String> = db.present_macs()?.into_iter().collect();
    tracing::info!(
        known = initial_records.len(),
        present = prior.len(),
        "Restored device state"
    );

    // Create hash watch channel and start the store thread
    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let store = StoreHandle::spawn(db, hash_tx);

    // DNS server client
    let client = Arc::new(TechnitiumClient::new(
        &config.server.base_url,
        &config.server.token,
    ));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn the reconciliation coordinator
    let coordinator = Coordinator::new(client, store.clone(), config.tracking.clone(), prior);
    let poll_cancel = cancel.clone();
    let poll_handle = tokio::spawn(async move {
        coordinator.run(poll_cancel).await;
    });

    // Build API router
    let app_state = api::routes::AppState {
        store: store.clone(),
        hash_rx,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(poll_handle, server_handle);

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
