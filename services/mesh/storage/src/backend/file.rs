//! File-based settings backend: a JSON snapshot rewritten on every change

use crate::{IvRecord, RplEntry, Settings, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Snapshot file content
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct Snapshot {
    seq: Option<u32>,
    iv: Option<IvRecord>,
    rpl: BTreeMap<u16, RplEntry>,
}

/// JSON file settings store
pub struct FileSettings {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl FileSettings {
    /// Open the settings file, loading its content if it exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
                StorageError::Corruption(format!("Invalid settings file {}: {}", path.display(), e))
            })?;
            info!(
                "Loaded settings from {}: seq={:?} iv={:?} rpl_entries={}",
                path.display(),
                snapshot.seq,
                snapshot.iv,
                snapshot.rpl.len()
            );
            snapshot
        } else {
            Snapshot::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut state = self.state.lock();
        f(&mut state);

        let content = serde_json::to_string_pretty(&*state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("settings saved to {}", self.path.display());
        Ok(())
    }
}

impl Settings for FileSettings {
    fn store_seq(&self, seq: u32) -> Result<(), StorageError> {
        self.update(|s| s.seq = Some(seq))
    }

    fn load_seq(&self) -> Result<Option<u32>, StorageError> {
        Ok(self.state.lock().seq)
    }

    fn store_iv(&self, iv: IvRecord) -> Result<(), StorageError> {
        self.update(|s| s.iv = Some(iv))
    }

    fn load_iv(&self) -> Result<Option<IvRecord>, StorageError> {
        Ok(self.state.lock().iv)
    }

    fn store_rpl(&self, entry: RplEntry) -> Result<(), StorageError> {
        self.update(|s| {
            s.rpl.insert(entry.src, entry);
        })
    }

    fn remove_rpl(&self, src: u16) -> Result<(), StorageError> {
        self.update(|s| {
            s.rpl.remove(&src);
        })
    }

    fn clear_rpl(&self) -> Result<(), StorageError> {
        self.update(|s| s.rpl.clear())
    }

    fn load_rpl(&self) -> Result<Vec<RplEntry>, StorageError> {
        Ok(self.state.lock().rpl.values().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node").join("settings.json");

        {
            let settings = FileSettings::open(&path).unwrap();
            settings.store_seq(1234).unwrap();
            settings
                .store_iv(IvRecord {
                    iv_index: 7,
                    in_progress: true,
                    duration_hours: 48,
                })
                .unwrap();
            settings
                .store_rpl(RplEntry {
                    src: 0x0005,
                    seq: 99,
                    old_iv: false,
                })
                .unwrap();
        }

        let settings = FileSettings::open(&path).unwrap();
        assert_eq!(settings.load_seq().unwrap(), Some(1234));
        let iv = settings.load_iv().unwrap().unwrap();
        assert_eq!(iv.iv_index, 7);
        assert!(iv.in_progress);
        assert_eq!(iv.duration_hours, 48);
        assert_eq!(settings.load_rpl().unwrap()[0].seq, 99);
    }

    #[test]
    fn test_corrupted_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            FileSettings::open(&path),
            Err(StorageError::Corruption(_))
        ));
    }
}
