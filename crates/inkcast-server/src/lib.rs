//! Inkcast Session Server
//!
//! Holds the authoritative state of every open whiteboard session, orders
//! and fans out stroke operations, and persists sessions through a
//! [`Storage`](inkcast_core::Storage) backend.
//!
//! ## Routes
//!
//! - `GET /` banner
//! - `GET /health` liveness and open session count
//! - `GET /ws` WebSocket endpoint (see [`inkcast_core::sync`] for the protocol)
//! - `DELETE /sessions/{id}` permanently delete a session

pub mod broadcast;
pub mod config;
pub mod error;
pub mod persist;
pub mod presence;
pub mod store;
pub mod ws;

pub use config::ServerConfig;
pub use error::{ServerError, StoreError, StoreResult};
pub use store::SessionStore;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

/// Build the HTTP router.
pub fn app(store: Arc<SessionStore>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .route("/sessions/{id}", delete(delete_session))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Index page
async fn index() -> &'static str {
    "Inkcast Session Server - Connect via WebSocket at /ws"
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    sessions: usize,
}

/// Health check
async fn health(State(store): State<Arc<SessionStore>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        sessions: store.session_count(),
    })
}

/// Permanently delete a session
async fn delete_session(State(store): State<Arc<SessionStore>>, Path(id): Path<String>) -> StatusCode {
    match store.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            error!("Failed to delete session {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
