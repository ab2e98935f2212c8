//! Inkcast Session Server
//!
//! Configuration comes from `INKCAST_*` environment variables, logging
//! from `RUST_LOG`.

use inkcast_core::{FileStorage, Storage};
use inkcast_server::{ServerConfig, ServerError, SessionStore, app, persist};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkcast_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let files = match &config.data_dir {
        Some(dir) => FileStorage::new(dir.clone())?,
        None => FileStorage::default_location()?,
    };
    info!("Session records in {}", files.base_path().display());
    let storage: Arc<dyn Storage> = Arc::new(files);

    let store = Arc::new(SessionStore::new(storage, config.clone()));
    let autosave = persist::spawn_autosave(store.clone(), config.persist_interval);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.addr,
            source,
        })?;
    info!("Inkcast server listening on {}", config.addr);
    info!("WebSocket endpoint: ws://{}/ws", config.addr);

    axum::serve(listener, app(store.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    autosave.abort();
    let flushed = store.persist_all().await;
    info!("Flushed {} sessions, shutting down", flushed);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
