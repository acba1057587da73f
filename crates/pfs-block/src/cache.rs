//! Bounded block cache with backward-scan eviction.
//!
//! One slot per package block, at most `capacity` of them occupied. The
//! workload is dominantly sequential, so when the cache is full we walk
//! backward in block-index space from just behind the inserting block
//! (wrapping) and evict the first occupied slot — the block least likely to
//! be revisited soon. Deliberately weaker than true LRU: no access
//! timestamps, no bookkeeping on the read path.

use pfs_types::BlockIndex;
use tracing::trace;

pub struct BlockCache {
    slots: Vec<Option<Box<[u8]>>>,
    occupied: usize,
    capacity: usize,
}

impl BlockCache {
    /// Cache over `file_blocks` slots, at most `capacity` occupied.
    #[must_use]
    pub fn new(file_blocks: u64, capacity: usize) -> Self {
        Self {
            slots: vec![None; file_blocks as usize],
            occupied: 0,
            capacity,
        }
    }

    #[must_use]
    pub fn get(&self, block: BlockIndex) -> Option<&[u8]> {
        self.slots
            .get(block.0 as usize)
            .and_then(|slot| slot.as_deref())
    }

    #[must_use]
    pub fn contains(&self, block: BlockIndex) -> bool {
        self.get(block).is_some()
    }

    #[must_use]
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a copy of `data` for `block`, evicting a sequential
    /// predecessor if the cache is full.
    pub fn insert(&mut self, block: BlockIndex, data: &[u8]) {
        let idx = block.0 as usize;
        if self.slots[idx].is_some() {
            // Already cached; verified data for a block never changes, so
            // there is nothing to refresh.
            return;
        }
        if self.occupied == self.capacity {
            self.evict_behind(block.0);
        }
        self.slots[idx] = Some(data.to_vec().into_boxed_slice());
        self.occupied += 1;
        trace!(
            target: "pfs::block::cache",
            block = block.0,
            occupied = self.occupied,
            "block cached"
        );
    }

    /// Walk backward from `cursor - 1`, wrapping, and free the first
    /// occupied slot.
    fn evict_behind(&mut self, cursor: u64) {
        let blocks = self.slots.len() as u64;
        let mut n = if cursor == 0 { blocks - 1 } else { cursor - 1 };
        while n != cursor {
            if self.slots[n as usize].take().is_some() {
                self.occupied -= 1;
                trace!(target: "pfs::block::cache", block = n, "block evicted");
                return;
            }
            n = if n == 0 { blocks - 1 } else { n - 1 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut cache = BlockCache::new(8, 4);
        cache.insert(BlockIndex(3), b"abc");
        assert_eq!(cache.get(BlockIndex(3)), Some(b"abc".as_slice()));
        assert_eq!(cache.get(BlockIndex(4)), None);
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut cache = BlockCache::new(4, 2);
        cache.insert(BlockIndex(0), b"first");
        cache.insert(BlockIndex(0), b"second");
        assert_eq!(cache.get(BlockIndex(0)), Some(b"first".as_slice()));
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn evicts_block_just_behind_cursor() {
        let mut cache = BlockCache::new(8, 2);
        cache.insert(BlockIndex(0), b"b0");
        cache.insert(BlockIndex(1), b"b1");

        // Full; inserting block 2 scans backward from 1 and evicts it.
        cache.insert(BlockIndex(2), b"b2");
        assert!(cache.contains(BlockIndex(0)));
        assert!(!cache.contains(BlockIndex(1)));
        assert!(cache.contains(BlockIndex(2)));
        assert_eq!(cache.occupied(), 2);

        // Sequential continuation keeps evicting the immediate predecessor.
        cache.insert(BlockIndex(3), b"b3");
        assert!(cache.contains(BlockIndex(0)));
        assert!(!cache.contains(BlockIndex(2)));
        assert!(cache.contains(BlockIndex(3)));
    }

    #[test]
    fn eviction_wraps_below_zero() {
        let mut cache = BlockCache::new(4, 2);
        cache.insert(BlockIndex(2), b"b2");
        cache.insert(BlockIndex(3), b"b3");

        // Inserting block 0 scans 3, 2, 1 (wrapping) and evicts 3.
        cache.insert(BlockIndex(0), b"b0");
        assert!(!cache.contains(BlockIndex(3)));
        assert!(cache.contains(BlockIndex(2)));
        assert!(cache.contains(BlockIndex(0)));
    }
}
