//! File-backed store for the registry snapshot.
//!
//! The snapshot is a single JSON document at `<cache_dir>/servers.json`. Saves
//! write a temp file next to it, fsync it and rename it over the target, so an
//! interrupted save leaves either the old or the new document, never half of
//! one. Saves are serialized by an internal lock. Loads fail soft: a missing,
//! unreadable or invalid document yields `None` and a log line, never an error.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use tdx_common::Result;

use crate::model::snapshot::PersistedSnapshot;

/// File name of the snapshot inside the cache directory.
pub const SNAPSHOT_FILE: &str = "servers.json";

/// Owner of the snapshot file. Nothing else writes it.
pub struct SnapshotStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Opens the store, creating `cache_dir` if it is missing.
    pub fn open(cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir)?;
        Ok(Self {
            path: cache_dir.join(SNAPSHOT_FILE),
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the snapshot on disk.
    pub fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock()?;

        let data = serde_json::to_vec_pretty(snapshot)?;
        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        info!(
            "Saved {} server(s) to {}",
            snapshot.servers.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Reads the last saved snapshot, or `None` if there is no usable one.
    pub fn load(&self) -> Option<PersistedSnapshot> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No saved snapshot at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Cannot read {}: {}", self.path.display(), e);
                return None;
            }
        };

        let snapshot: PersistedSnapshot = match serde_json::from_slice(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring corrupt snapshot {}: {}", self.path.display(), e);
                return None;
            }
        };

        if let Err(e) = snapshot.validate() {
            warn!("Ignoring invalid snapshot {}: {}", self.path.display(), e);
            return None;
        }
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tdx_common::ServerDescriptor;
    use tempfile::TempDir;

    fn snapshot() -> PersistedSnapshot {
        PersistedSnapshot {
            servers: vec![
                ServerDescriptor::new("10.0.0.1", 7709, Some("main")).unwrap(),
                ServerDescriptor::new("10.0.0.2", 7711, None).unwrap(),
            ],
            current_index: Some(1),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn open_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let cache_dir = temp_dir.path().join("nested").join("cache");
        let store = SnapshotStore::open(&cache_dir).unwrap();
        assert!(cache_dir.is_dir());
        assert_eq!(store.path(), cache_dir.join(SNAPSHOT_FILE));
    }

    #[test]
    fn missing_file_loads_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).unwrap();
        let saved = snapshot();
        store.save(&saved).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.servers[0].label.as_deref(), Some("main"));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn later_save_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).unwrap();
        store.save(&snapshot()).unwrap();

        let mut second = snapshot();
        second.servers.truncate(1);
        second.current_index = Some(0);
        store.save(&second).unwrap();
        assert_eq!(store.load().unwrap(), second);
    }

    #[test]
    fn corrupt_documents_load_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).unwrap();

        for content in [
            "{\"servers\": [{\"ip\": \"10.0.0.1\", \"po",
            "not json at all",
            "{\"servers\": [], \"current_index\": 3, \"saved_at\": \"2026-01-01T00:00:00Z\"}",
            "{\"servers\": [{\"ip\": \"\", \"port\": 7709}], \"current_index\": 0, \"saved_at\": \"2026-01-01T00:00:00Z\"}",
        ] {
            fs::write(store.path(), content).unwrap();
            assert!(store.load().is_none(), "accepted {:?}", content);
        }
    }

    #[test]
    fn save_to_unwritable_target_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).unwrap();
        // A directory squatting on the target path makes the rename fail.
        fs::create_dir(store.path()).unwrap();
        let err = store.save(&snapshot()).unwrap_err();
        assert!(matches!(err, tdx_common::TdxError::Io(_)));
        assert!(!store.path().with_extension("json.tmp").exists());
    }
}
