//! File-based storage implementation.

use super::{BoxFuture, SessionRecord, Storage, StorageError, StorageResult};
use std::fs;
use std::path::{Path, PathBuf};

/// File-based storage.
///
/// Stores each session as a JSON file in a specified directory. Writes go to
/// a temporary file first and are renamed into place.
pub struct FileStorage {
    /// Base directory for session storage.
    base_path: PathBuf,
}

impl FileStorage {
    /// Create a new file storage with the given base directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self { base_path })
    }

    /// Create file storage in the default location.
    ///
    /// On Unix: `~/.local/share/inkcast/sessions/`
    /// On Windows: `%LOCALAPPDATA%\inkcast\sessions\`
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;

        Self::new(base.join("inkcast").join("sessions"))
    }

    /// Get the file path for a session ID.
    fn record_path(&self, id: &str) -> PathBuf {
        // Sanitize ID to be safe for filenames
        let safe_id: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", safe_id))
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl Storage for FileStorage {
    fn save<'a>(&'a self, id: &str, record: &SessionRecord) -> BoxFuture<'a, StorageResult<()>> {
        let path = self.record_path(id);
        let json = match record.to_json() {
            Ok(j) => j,
            Err(e) => return Box::pin(async move { Err(StorageError::Serialization(e.to_string())) }),
        };

        Box::pin(async move {
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", tmp.display(), e))
            })?;
            fs::rename(&tmp, &path).map_err(|e| {
                StorageError::Io(format!("Failed to move {} into place: {}", path.display(), e))
            })
        })
    }

    fn load<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        let path = self.record_path(id);
        let id_owned = id.to_string();

        Box::pin(async move {
            if !path.exists() {
                return Err(StorageError::NotFound(id_owned));
            }

            let json = fs::read_to_string(&path).map_err(|e| {
                StorageError::Io(format!("Failed to read {}: {}", path.display(), e))
            })?;

            SessionRecord::from_json(&json).map_err(|e| {
                StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })
        })
    }

    fn delete<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<()>> {
        let path = self.record_path(id);

        Box::pin(async move {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
                })?;
            }
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let base = self.base_path.clone();

        Box::pin(async move {
            if !base.exists() {
                return Ok(vec![]);
            }

            let entries = fs::read_dir(&base)
                .map_err(|e| StorageError::Io(format!("Failed to read directory: {}", e)))?;

            let mut ids = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Some(name) = path.file_stem().and_then(|n| n.to_str()) {
                        ids.push(name.to_string());
                    }
                }
            }
            Ok(ids)
        })
    }

    fn exists<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<bool>> {
        let path = self.record_path(id);
        Box::pin(async move { Ok(path.exists()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block_on;
    use tempfile::tempdir;

    #[test]
    fn test_file_storage_save_load() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let mut record = SessionRecord::empty("room-1");
        record.clear_epoch = 3;

        block_on(storage.save("room-1", &record)).unwrap();
        let loaded = block_on(storage.load("room-1")).unwrap();

        assert_eq!(loaded, record);
    }

    #[test]
    fn test_file_storage_overwrite() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let mut record = SessionRecord::empty("s");
        block_on(storage.save("s", &record)).unwrap();
        record.next_sequence = 9;
        block_on(storage.save("s", &record)).unwrap();

        assert_eq!(block_on(storage.load("s")).unwrap().next_sequence, 9);
        assert_eq!(block_on(storage.list()).unwrap(), vec!["s".to_string()]);
    }

    #[test]
    fn test_file_storage_not_found() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let result = block_on(storage.load("nonexistent"));
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_file_storage_list_and_delete() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        block_on(storage.save("s1", &SessionRecord::empty("s1"))).unwrap();
        block_on(storage.save("s2", &SessionRecord::empty("s2"))).unwrap();

        let list = block_on(storage.list()).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&"s1".to_string()));

        block_on(storage.delete("s1")).unwrap();
        assert!(!block_on(storage.exists("s1")).unwrap());
        assert!(block_on(storage.exists("s2")).unwrap());
    }

    #[test]
    fn test_file_storage_sanitizes_id() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let record = SessionRecord::empty("study/room:42");
        block_on(storage.save("study/room:42", &record)).unwrap();

        let loaded = block_on(storage.load("study/room:42")).unwrap();
        assert_eq!(loaded.session_id, "study/room:42");
    }

    #[test]
    fn test_file_storage_corrupt_record() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();

        let result = block_on(storage.load("bad"));
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
