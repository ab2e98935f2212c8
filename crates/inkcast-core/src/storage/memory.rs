//! In-memory storage implementation.

use super::{BoxFuture, SessionRecord, Storage, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory storage for testing and ephemeral use.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryStorage {
    /// Create a new empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("Lock error: {}", e))
}

impl Storage for MemoryStorage {
    fn save<'a>(&'a self, id: &str, record: &SessionRecord) -> BoxFuture<'a, StorageResult<()>> {
        let id = id.to_string();
        let record = record.clone();
        Box::pin(async move {
            let mut records = self.records.write().map_err(lock_error)?;
            records.insert(id, record);
            Ok(())
        })
    }

    fn load<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        let id = id.to_string();
        Box::pin(async move {
            let records = self.records.read().map_err(lock_error)?;
            records.get(&id).cloned().ok_or(StorageError::NotFound(id))
        })
    }

    fn delete<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut records = self.records.write().map_err(lock_error)?;
            records.remove(&id);
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let records = self.records.read().map_err(lock_error)?;
            Ok(records.keys().cloned().collect())
        })
    }

    fn exists<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let records = self.records.read().map_err(lock_error)?;
            Ok(records.contains_key(&id))
        })
    }
}
