//! In-memory settings backend for development and testing

use crate::{IvRecord, RplEntry, Settings, StorageError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// In-memory settings store
pub struct MemorySettings {
    /// Stored sequence number; `u32::MAX` means unset
    seq: AtomicU32,
    /// Stored IV state
    iv: RwLock<Option<IvRecord>>,
    /// Replay entries keyed by source
    rpl: Arc<DashMap<u16, RplEntry>>,
}

impl MemorySettings {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(u32::MAX),
            iv: RwLock::new(None),
            rpl: Arc::new(DashMap::new()),
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings for MemorySettings {
    fn store_seq(&self, seq: u32) -> Result<(), StorageError> {
        self.seq.store(seq, Ordering::Relaxed);
        Ok(())
    }

    fn load_seq(&self) -> Result<Option<u32>, StorageError> {
        match self.seq.load(Ordering::Relaxed) {
            u32::MAX => Ok(None),
            seq => Ok(Some(seq)),
        }
    }

    fn store_iv(&self, iv: IvRecord) -> Result<(), StorageError> {
        debug!(
            "settings store_iv iv_index={} ivu={} duration={}",
            iv.iv_index, iv.in_progress, iv.duration_hours
        );
        *self.iv.write() = Some(iv);
        Ok(())
    }

    fn load_iv(&self) -> Result<Option<IvRecord>, StorageError> {
        Ok(*self.iv.read())
    }

    fn store_rpl(&self, entry: RplEntry) -> Result<(), StorageError> {
        self.rpl.insert(entry.src, entry);
        Ok(())
    }

    fn remove_rpl(&self, src: u16) -> Result<(), StorageError> {
        self.rpl.remove(&src);
        Ok(())
    }

    fn clear_rpl(&self) -> Result<(), StorageError> {
        debug!("settings clear_rpl entries={}", self.rpl.len());
        self.rpl.clear();
        Ok(())
    }

    fn load_rpl(&self) -> Result<Vec<RplEntry>, StorageError> {
        let mut entries: Vec<RplEntry> = self.rpl.iter().map(|e| *e.value()).collect();
        entries.sort_by_key(|e| e.src);
        Ok(entries)
    }
}
