use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Presence filter over the state-trie nodes written so far, letting the
/// trie scheduler skip disk probes for nodes that were certainly never
/// stored. Node hashes are uniformly distributed, so the probe indices are
/// folded straight out of the hash bytes.
pub struct SyncBloom {
    bits: Vec<AtomicU64>,
    closed: AtomicBool,
}

impl SyncBloom {
    /// `size_bytes` is rounded down to whole 64-bit words; at least one
    /// word is always allocated.
    pub fn new(size_bytes: usize) -> Self {
        let words = (size_bytes / 8).max(1);
        let mut bits = Vec::with_capacity(words);
        bits.resize_with(words, || AtomicU64::new(0));
        Self {
            bits,
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, hash: &[u8; 32], probe: usize) -> (usize, u64) {
        let offset = probe * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&hash[offset..offset + 8]);
        let index = u64::from_le_bytes(raw) as usize;
        let bit = index % (self.bits.len() * 64);
        (bit / 64, 1u64 << (bit % 64))
    }

    pub fn add(&self, hash: &[u8; 32]) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        for probe in 0..2 {
            let (word, mask) = self.slot(hash, probe);
            self.bits[word].fetch_or(mask, Ordering::Relaxed);
        }
    }

    /// May return false positives, never false negatives. A closed bloom
    /// reports everything as present so callers fall back to the store.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return true;
        }
        (0..2).all(|probe| {
            let (word, mask) = self.slot(hash, probe);
            self.bits[word].load(Ordering::Relaxed) & mask != 0
        })
    }

    /// Once the pivot state is committed the filter is no longer
    /// maintained and must stop filtering.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_hashes_are_reported() {
        let bloom = SyncBloom::new(1024);
        let mut hash = [0u8; 32];
        for i in 0..64u8 {
            hash[0] = i;
            hash[9] = i.wrapping_mul(7);
            bloom.add(&hash);
            assert!(bloom.contains(&hash));
        }
    }

    #[test]
    fn closed_bloom_stops_filtering() {
        let bloom = SyncBloom::new(64);
        let hash = [0xabu8; 32];
        assert!(!bloom.contains(&hash));
        bloom.close();
        assert!(bloom.contains(&hash));
        assert!(bloom.is_closed());
    }
}
