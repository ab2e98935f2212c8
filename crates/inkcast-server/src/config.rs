//! Server configuration.

use crate::error::ServerError;
use inkcast_core::storage::DEFAULT_AUTOSAVE_INTERVAL_SECS;
use inkcast_render::{DEFAULT_CANVAS_HEIGHT, DEFAULT_CANVAS_WIDTH};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:3030";
/// Default per-session broadcast buffer.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub addr: SocketAddr,
    /// Directory for session records (None = platform data directory)
    pub data_dir: Option<PathBuf>,
    /// How often dirty sessions are flushed to storage
    pub persist_interval: Duration,
    /// Canvas size in pixels
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Messages buffered per subscriber before it lags
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            data_dir: None,
            persist_interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            canvas_width: DEFAULT_CANVAS_WIDTH,
            canvas_height: DEFAULT_CANVAS_HEIGHT,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Read `INKCAST_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("INKCAST_ADDR") {
            config.addr = parse("INKCAST_ADDR", &addr)?;
        }
        if let Some(dir) = lookup("INKCAST_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = lookup("INKCAST_PERSIST_INTERVAL_SECS") {
            config.persist_interval = Duration::from_secs(parse("INKCAST_PERSIST_INTERVAL_SECS", &secs)?);
        }
        if let Some(width) = lookup("INKCAST_CANVAS_WIDTH") {
            config.canvas_width = parse("INKCAST_CANVAS_WIDTH", &width)?;
        }
        if let Some(height) = lookup("INKCAST_CANVAS_HEIGHT") {
            config.canvas_height = parse("INKCAST_CANVAS_HEIGHT", &height)?;
        }
        if let Some(capacity) = lookup("INKCAST_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse("INKCAST_BROADCAST_CAPACITY", &capacity)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ServerError> {
        if self.canvas_width == 0 || self.canvas_height == 0 {
            return Err(ServerError::Config("canvas size must be non-zero".to_string()));
        }
        if self.broadcast_capacity == 0 {
            return Err(ServerError::Config("broadcast capacity must be non-zero".to_string()));
        }
        if self.persist_interval.is_zero() {
            return Err(ServerError::Config("persist interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ServerError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ServerError::Config(format!("{}={:?}: {}", key, value, e)))
}
