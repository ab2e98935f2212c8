//! Canvas surface abstraction and snapshot blobs.
//!
//! The session logic never looks inside a snapshot. A surface knows how to
//! materialize operations and how to turn itself into an opaque blob and back,
//! so a raster implementation can later be swapped for op-log replay without
//! touching the protocol.

use crate::stroke::StrokeOp;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Surface errors.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Snapshot encoding failed: {0}")]
    Encode(String),
    #[error("Snapshot decoding failed: {0}")]
    Decode(String),
}

/// Opaque snapshot payload. Empty means a blank canvas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotData(Vec<u8>);

impl SnapshotData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The blank canvas.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Serialize for SnapshotData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SnapshotData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(SnapshotData)
            .map_err(serde::de::Error::custom)
    }
}

/// Something operations can be drawn onto.
///
/// Applying the same free-hand segment twice must leave the surface as if it
/// had been applied once.
pub trait Surface: Clone {
    /// Draw an operation.
    fn apply(&mut self, op: &StrokeOp);

    /// Reset to a blank canvas.
    fn clear(&mut self);

    /// Encode the current canvas.
    fn snapshot(&self) -> Result<SnapshotData, SurfaceError>;

    /// Replace the canvas with a decoded snapshot.
    fn restore(&mut self, data: &SnapshotData) -> Result<(), SurfaceError>;
}
