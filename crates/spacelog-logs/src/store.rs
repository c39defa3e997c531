//! Durable per-stream state
//!
//! Snapshots are keyed by stream so each one can be read and written on its
//! own. The file store keeps one JSON document per stream under a directory.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use spacelog_types::{StreamKind, StreamSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} is not valid: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value persistence for stream snapshots
pub trait StateStore: Send + Sync {
    fn load(&self, stream: StreamKind) -> Result<Option<StreamSnapshot>, StoreError>;

    fn save(&self, stream: StreamKind, snapshot: &StreamSnapshot) -> Result<(), StoreError>;
}

/// Stores snapshots as `<dir>/<stream>.json`
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the platform data directory, if one exists
    pub fn in_data_dir() -> Option<Self> {
        dirs::data_dir().map(|dir| Self::new(dir.join("spacelog")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, stream: StreamKind) -> PathBuf {
        self.dir.join(format!("{}.json", stream.storage_key()))
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, stream: StreamKind) -> Result<Option<StreamSnapshot>, StoreError> {
        let path = self.path(stream);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Serialize { path, source })
    }

    fn save(&self, stream: StreamKind, snapshot: &StreamSnapshot) -> Result<(), StoreError> {
        let path = self.path(stream);
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let content = serde_json::to_string_pretty(snapshot).map_err(|source| {
            StoreError::Serialize {
                path: path.clone(),
                source,
            }
        })?;

        // Write then rename so a crash never leaves half a snapshot behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }
}

/// In-process store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<StreamKind, StreamSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, stream: StreamKind) -> Result<Option<StreamSnapshot>, StoreError> {
        Ok(self.snapshots.lock().get(&stream).cloned())
    }

    fn save(&self, stream: StreamKind, snapshot: &StreamSnapshot) -> Result<(), StoreError> {
        self.snapshots.lock().insert(stream, snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snapshot() -> StreamSnapshot {
        let now = Utc.with_ymd_and_hms(2025, 6, 21, 18, 0, 0).unwrap();
        StreamSnapshot {
            buffer: "[2025-06-21 18:00:00] hello\n".to_string(),
            cached_buffer: "[2025-06-21 18:00:00] hello\n".to_string(),
            cursor: Some(now),
            fresh_start: true,
            fresh_start_epoch: Some(now - chrono::Duration::seconds(5)),
        }
    }

    #[test]
    fn test_file_store_streams_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));

        assert_eq!(store.load(StreamKind::ModuleLog).unwrap(), None);

        store.save(StreamKind::DatabaseLog, &snapshot()).unwrap();
        assert_eq!(store.load(StreamKind::ModuleLog).unwrap(), None);
        assert_eq!(
            store.load(StreamKind::DatabaseLog).unwrap(),
            Some(snapshot())
        );
        assert!(dir.path().join("state/database_log.json").is_file());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        fs::write(dir.path().join("module_log.json"), "not json").unwrap();
        assert!(matches!(
            store.load(StreamKind::ModuleLog),
            Err(StoreError::Serialize { .. })
        ));
    }

    #[test]
    fn test_snapshot_missing_optional_fields() {
        let parsed: StreamSnapshot =
            serde_json::from_str(r#"{"buffer":"x","cursor":null,"fresh_start_epoch":null}"#)
                .unwrap();
        assert_eq!(parsed.buffer, "x");
        assert!(parsed.cached_buffer.is_empty());
        assert!(!parsed.fresh_start);
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.save(StreamKind::ModuleLog, &snapshot()).unwrap();
        assert_eq!(store.load(StreamKind::ModuleLog).unwrap(), Some(snapshot()));
        assert_eq!(store.load(StreamKind::DatabaseLog).unwrap(), None);
    }
}
