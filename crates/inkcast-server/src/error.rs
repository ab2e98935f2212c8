//! Server error types.

use inkcast_core::{StorageError, SurfaceError, ValidationError};
use std::net::SocketAddr;
use thiserror::Error;

/// Session store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Operation from epoch {op_epoch} is stale, session is at {current}")]
    StaleEpoch { op_epoch: u64, current: u64 },
    #[error("Invalid operation: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for session store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
