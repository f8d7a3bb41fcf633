//! Replay protection, message caches and persisted node settings for mesh.
//!
//! This crate provides the receive-side guards of the network layer: the
//! replay protection list, which rejects old messages per source, and the
//! message and duplicate caches, which drop repeated copies of the same
//! advertised PDU. It also defines the settings store that keeps the
//! sequence number, IV index state and replay list across restarts, with
//! pluggable backends (in-memory, JSON file).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cache;
pub mod rpl;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Entry not found
    #[error("Entry not found")]
    NotFound,
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted IV index state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvRecord {
    /// Current IV index
    pub iv_index: u32,
    /// IV update procedure in progress
    pub in_progress: bool,
    /// Hours spent in the current IV update state
    pub duration_hours: u32,
}

/// Persisted replay protection entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RplEntry {
    /// Source address; zero marks an empty slot
    pub src: u16,
    /// Highest sequence number accepted from the source
    pub seq: u32,
    /// Entry was recorded under the previous IV index
    pub old_iv: bool,
}

/// Node settings persisted across restarts
pub trait Settings: Send + Sync {
    /// Store the next sequence number
    fn store_seq(&self, seq: u32) -> Result<(), StorageError>;

    /// Load the stored sequence number
    fn load_seq(&self) -> Result<Option<u32>, StorageError>;

    /// Store the IV index state
    fn store_iv(&self, iv: IvRecord) -> Result<(), StorageError>;

    /// Load the stored IV index state
    fn load_iv(&self) -> Result<Option<IvRecord>, StorageError>;

    /// Store or replace the replay entry for `entry.src`
    fn store_rpl(&self, entry: RplEntry) -> Result<(), StorageError>;

    /// Remove the replay entry for a source
    fn remove_rpl(&self, src: u16) -> Result<(), StorageError>;

    /// Drop every replay entry
    fn clear_rpl(&self) -> Result<(), StorageError>;

    /// Load every replay entry
    fn load_rpl(&self) -> Result<Vec<RplEntry>, StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// JSON snapshot file
    File {
        /// Path of the settings file
        path: PathBuf,
    },
}

// Re-export main types
pub use backend::file::FileSettings;
pub use backend::mem::MemorySettings;
pub use cache::{DupCache, MsgCache};
pub use rpl::{ReplayList, RplCheck, RplQuery, RplSlot};

/// Open the settings store described by `mode`
pub fn open(mode: &StorageMode) -> Result<Arc<dyn Settings>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemorySettings::new())),
        StorageMode::File { path } => Ok(Arc::new(FileSettings::open(path)?)),
    }
}
