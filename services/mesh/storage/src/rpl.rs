//! Replay protection list.
//!
//! One entry per source holds the highest accepted sequence number and
//! whether it was recorded under the previous IV index. A message from a
//! source is accepted when it was sent under a newer IV index than the
//! stored one, or under the same IV index with a strictly higher sequence
//! number.
//!
//! Segmented messages check in reserve mode: the slot is located and the
//! message judged, but nothing is recorded until the segment has been
//! validated and [`ReplayList::commit`] is called.

use crate::{RplEntry, Settings};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Replay-relevant fields of a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RplQuery {
    /// Source address
    pub src: u16,
    /// Sequence number
    pub seq: u32,
    /// Received under the previous IV index
    pub old_iv: bool,
}

/// Handle of a reserved replay slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RplSlot(usize);

/// Result of a replay check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RplCheck {
    /// Accepted and recorded
    Accepted,
    /// Accepted, recording deferred to [`ReplayList::commit`]
    Reserved(RplSlot),
    /// Replayed or no room to track the source
    Rejected,
}

impl RplCheck {
    /// Whether the message must be dropped
    pub fn is_rejected(&self) -> bool {
        matches!(self, RplCheck::Rejected)
    }
}

/// Fixed-capacity replay protection list
pub struct ReplayList {
    entries: Mutex<Vec<RplEntry>>,
    store: Option<Arc<dyn Settings>>,
}

impl ReplayList {
    /// Create an empty list with `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(vec![RplEntry::default(); capacity]),
            store: None,
        }
    }

    /// Create a list backed by a settings store, loading persisted entries
    pub fn with_store(capacity: usize, store: Arc<dyn Settings>) -> Self {
        let mut entries = vec![RplEntry::default(); capacity];
        match store.load_rpl() {
            Ok(stored) => {
                for (slot, entry) in entries.iter_mut().zip(stored) {
                    *slot = entry;
                }
            }
            Err(e) => warn!("Failed to load replay list: {}", e),
        }

        Self {
            entries: Mutex::new(entries),
            store: Some(store),
        }
    }

    /// Check a message against the list.
    ///
    /// With `reserve` set an accepted message is not recorded yet.
    pub fn check(&self, rx: &RplQuery, reserve: bool) -> RplCheck {
        let mut entries = self.entries.lock();

        for (idx, entry) in entries.iter_mut().enumerate() {
            if entry.src == 0 {
                return self.accept(idx, entry, rx, reserve);
            }

            if entry.src != rx.src {
                continue;
            }

            if rx.old_iv && !entry.old_iv {
                debug!(
                    "Replay: src 0x{:04x} seq 0x{:06x} from old IV index",
                    rx.src, rx.seq
                );
                return RplCheck::Rejected;
            }

            if (!rx.old_iv && entry.old_iv) || entry.seq < rx.seq {
                return self.accept(idx, entry, rx, reserve);
            }

            debug!(
                "Replay: src 0x{:04x} seq 0x{:06x} stored seq 0x{:06x}",
                rx.src, rx.seq, entry.seq
            );
            return RplCheck::Rejected;
        }

        warn!("Replay list full, dropping src 0x{:04x}", rx.src);
        RplCheck::Rejected
    }

    fn accept(&self, idx: usize, entry: &mut RplEntry, rx: &RplQuery, reserve: bool) -> RplCheck {
        if reserve {
            return RplCheck::Reserved(RplSlot(idx));
        }
        self.record(entry, rx);
        RplCheck::Accepted
    }

    /// Record a message in a previously reserved slot
    pub fn commit(&self, slot: RplSlot, rx: &RplQuery) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(slot.0) {
            // The slot may have been taken by another source since
            if entry.src != 0 && entry.src != rx.src {
                warn!(
                    "Replay slot {} reused by 0x{:04x}, not recording 0x{:04x}",
                    slot.0, entry.src, rx.src
                );
                return;
            }
            self.record(entry, rx);
        }
    }

    fn record(&self, entry: &mut RplEntry, rx: &RplQuery) {
        entry.src = rx.src;
        entry.seq = rx.seq;
        entry.old_iv = rx.old_iv;

        if let Some(store) = &self.store {
            if let Err(e) = store.store_rpl(*entry) {
                warn!("Failed to store replay entry 0x{:04x}: {}", entry.src, e);
            }
        }
    }

    /// Age the list when the IV index advances.
    ///
    /// Entries already from the old IV index are dropped; the rest become old.
    pub fn update_on_iv_update(&self) {
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();

        for entry in entries.iter_mut().filter(|e| e.src != 0) {
            if entry.old_iv {
                removed.push(entry.src);
                *entry = RplEntry::default();
            } else {
                entry.old_iv = true;
                if let Some(store) = &self.store {
                    if let Err(e) = store.store_rpl(*entry) {
                        warn!("Failed to store replay entry 0x{:04x}: {}", entry.src, e);
                    }
                }
            }
        }

        // Keep occupied entries at the front so the empty-slot scan stays valid
        entries.sort_by_key(|e| e.src == 0);

        if let Some(store) = &self.store {
            for src in removed {
                if let Err(e) = store.remove_rpl(src) {
                    warn!("Failed to remove replay entry 0x{:04x}: {}", src, e);
                }
            }
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            *entry = RplEntry::default();
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.clear_rpl() {
                warn!("Failed to clear stored replay list: {}", e);
            }
        }
    }

    /// Stored entry for a source
    pub fn get(&self, src: u16) -> Option<RplEntry> {
        self.entries.lock().iter().find(|e| e.src == src && src != 0).copied()
    }

    /// Number of occupied entries
    pub fn len(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.src != 0).count()
    }

    /// Whether the list holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
