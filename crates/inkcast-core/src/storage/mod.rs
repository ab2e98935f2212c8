//! Storage abstraction for session persistence.

mod autosave;
mod file;
mod memory;

pub use autosave::{AutoSave, DEFAULT_AUTOSAVE_INTERVAL_SECS};
pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::canvas::SnapshotData;
use crate::stroke::StrokeOp;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future for async storage operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable form of one session's whiteboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub clear_epoch: u64,
    /// Sequence number the next accepted operation will get.
    pub next_sequence: u64,
    /// Accepted operations of the current epoch, in order.
    pub log: Vec<StrokeOp>,
    pub snapshot: SnapshotData,
    /// Last operation contained in `snapshot`.
    pub snapshot_sequence: Option<u64>,
}

impl SessionRecord {
    /// A blank whiteboard.
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            clear_epoch: 0,
            next_sequence: 0,
            log: Vec::new(),
            snapshot: SnapshotData::empty(),
            snapshot_sequence: None,
        }
    }

    /// Logged operations not already baked into the snapshot.
    pub fn ops_after_snapshot(&self) -> impl Iterator<Item = &StrokeOp> {
        let cursor = self.snapshot_sequence;
        self.log.iter().filter(move |op| match (op.sequence_number(), cursor) {
            (Some(seq), Some(cursor)) => seq > cursor,
            (Some(_), None) => true,
            (None, _) => false,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Trait for session storage backends.
///
/// Implementations can store records in memory, on the filesystem, or in
/// any document store.
pub trait Storage: Send + Sync {
    /// Save a session record.
    fn save<'a>(&'a self, id: &str, record: &SessionRecord) -> BoxFuture<'a, StorageResult<()>>;

    /// Load a session record.
    fn load<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<SessionRecord>>;

    /// Delete a session record.
    fn delete<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<()>>;

    /// List all stored session IDs.
    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>>;

    /// Check if a session record exists.
    fn exists<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<bool>>;
}

#[cfg(test)]
pub(crate) fn block_on<F: std::future::Future>(f: F) -> F::Output {
    // Simple blocking executor for tests
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn dummy_raw_waker() -> RawWaker {
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            dummy_raw_waker()
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }

    let waker = unsafe { Waker::from_raw(dummy_raw_waker()) };
    let mut cx = Context::from_waker(&waker);
    let mut f = std::pin::pin!(f);

    loop {
        match f.as_mut().poll(&mut cx) {
            Poll::Ready(result) => return result,
            Poll::Pending => {}
        }
    }
}
