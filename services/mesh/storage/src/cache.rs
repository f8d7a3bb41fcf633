//! Receive caches for advertised network PDUs.
//!
//! The duplicate cache looks at the raw, still obfuscated PDU and catches the
//! same advertisement heard twice before any crypto is spent on it. The
//! message cache remembers (source, sequence) pairs of PDUs that decrypted
//! successfully so relayed copies of the same message are dropped.

/// Default message cache size
pub const DEFAULT_MSG_CACHE_SIZE: usize = 10;

/// Duplicate cache size
pub const DUP_CACHE_SIZE: usize = 4;

const MSG_CACHE_SEQ_MASK: u32 = 0x1ffff;

/// Ring buffer of recently decoded (source, sequence) pairs
#[derive(Debug, Clone)]
pub struct MsgCache {
    entries: Vec<(u16, u32)>,
    next: usize,
}

impl MsgCache {
    /// Create a cache with `size` entries
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![(0, 0); size.max(1)],
            next: 0,
        }
    }

    /// Whether the pair was seen recently
    pub fn contains(&self, src: u16, seq: u32) -> bool {
        let seq = seq & MSG_CACHE_SEQ_MASK;
        self.entries.iter().any(|&(s, q)| s == src && q == seq)
    }

    /// Remember a pair, returning its index for [`MsgCache::rollback`]
    pub fn add(&mut self, src: u16, seq: u32) -> usize {
        let idx = self.next;
        self.entries[idx] = (src, seq & MSG_CACHE_SEQ_MASK);
        self.next = (idx + 1) % self.entries.len();
        idx
    }

    /// Forget the entry added at `idx` so the message can be received again
    pub fn rollback(&mut self, idx: usize) {
        if let Some(entry) = self.entries.get_mut(idx) {
            entry.0 = 0;
            self.next = idx;
        }
    }

    /// Forget every entry whose source is in `[addr, addr + count)`
    pub fn clear_range(&mut self, addr: u16, count: u16) {
        let end = addr as u32 + count as u32;
        for entry in self.entries.iter_mut() {
            if entry.0 >= addr && (entry.0 as u32) < end {
                *entry = (0, 0);
            }
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = (0, 0));
        self.next = 0;
    }
}

impl Default for MsgCache {
    fn default() -> Self {
        Self::new(DEFAULT_MSG_CACHE_SIZE)
    }
}

/// Ring buffer of checksums over the tail of raw advertised PDUs
#[derive(Debug, Clone, Default)]
pub struct DupCache {
    entries: [u32; DUP_CACHE_SIZE],
    next: usize,
}

impl DupCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a raw PDU and remember it.
    ///
    /// Returns `true` when the PDU was seen before. PDUs shorter than 8
    /// bytes are never considered duplicates.
    pub fn check(&mut self, pdu: &[u8]) -> bool {
        let len = pdu.len();
        if len < 8 {
            return false;
        }

        let tail = |at: usize| u32::from_be_bytes([pdu[at], pdu[at + 1], pdu[at + 2], pdu[at + 3]]);
        let val = tail(len - 4) ^ tail(len - 8);

        if self.entries.contains(&val) {
            return true;
        }

        self.entries[self.next] = val;
        self.next = (self.next + 1) % DUP_CACHE_SIZE;
        false
    }

    /// Forget everything
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_cache_match_uses_17_bits() {
        let mut cache = MsgCache::new(4);
        cache.add(0x0001, 0x02_0005);
        assert!(cache.contains(0x0001, 0x00_0005));
        assert!(cache.contains(0x0001, 0x02_0005));
        assert!(!cache.contains(0x0002, 0x02_0005));
        assert!(!cache.contains(0x0001, 0x01_0005));
    }

    #[test]
    fn test_msg_cache_wraps() {
        let mut cache = MsgCache::new(2);
        assert_eq!(cache.add(1, 1), 0);
        assert_eq!(cache.add(1, 2), 1);
        assert_eq!(cache.add(1, 3), 0);
        assert!(!cache.contains(1, 1));
        assert!(cache.contains(1, 2));
    }

    #[test]
    fn test_msg_cache_rollback() {
        let mut cache = MsgCache::new(4);
        cache.add(1, 1);
        let idx = cache.add(2, 7);
        cache.rollback(idx);
        assert!(!cache.contains(2, 7));
        // The freed slot is handed out again next
        assert_eq!(cache.add(3, 3), idx);
        assert!(cache.contains(1, 1));
    }

    #[test]
    fn test_msg_cache_clear_range() {
        let mut cache = MsgCache::new(4);
        cache.add(0x0010, 1);
        cache.add(0x0011, 1);
        cache.add(0x0012, 1);
        cache.clear_range(0x0010, 2);
        assert!(!cache.contains(0x0010, 1));
        assert!(!cache.contains(0x0011, 1));
        assert!(cache.contains(0x0012, 1));
    }

    #[test]
    fn test_dup_cache() {
        let mut cache = DupCache::new();
        let a = [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        let b = [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 12];

        assert!(!cache.check(&a));
        assert!(cache.check(&a));
        assert!(!cache.check(&b));
        assert!(!cache.check(&[1, 2, 3]));

        // Four more distinct PDUs push `a` out of the ring
        for i in 0..4u8 {
            assert!(!cache.check(&[i, i, i, i, 0, 0, 0, 0xff]));
        }
        assert!(!cache.check(&a));
    }
}
