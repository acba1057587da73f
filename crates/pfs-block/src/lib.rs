#![forbid(unsafe_code)]
//! Block store and fetch+verify engine.
//!
//! Owns the buffers every read is served from: `current` (the most recently
//! fetched block), `extra` (spill-over for reads that straddle a block
//! boundary), the per-block fingerprint table, and the optional block cache.
//!
//! The producer is untrusted. Every block fetched from it is digested over
//! the full padded buffer and checked against the fingerprint recorded on
//! first observation, so a given position can never be seen with two
//! different values — a hostile producer cannot show one package to the
//! signature verifier and another to the installer.

mod cache;
mod meminfo;

pub use cache::BlockCache;
pub use meminfo::{free_memory, parse_meminfo, plan_cache_slots, INSTALL_RESERVED_BYTES};

use pfs_error::{PfsError, Result};
use pfs_provider::DataProvider;
use pfs_types::{BlockIndex, Fingerprint, Geometry};
use tracing::{debug, trace, warn};

/// Digest a block's canonical contents (always the full padded buffer, so
/// the tail block digests deterministically).
#[must_use]
pub fn digest_block(data: &[u8]) -> Fingerprint {
    Fingerprint(*blake3::hash(data).as_bytes())
}

pub struct BlockStore {
    geometry: Geometry,
    current: Vec<u8>,
    curr_block: Option<u64>,
    extra: Vec<u8>,
    fingerprints: Vec<Fingerprint>,
    cache: Option<BlockCache>,
}

impl BlockStore {
    /// Allocate the session's buffers and fingerprint table. `cache_slots`
    /// comes from [`plan_cache_slots`]; `None` disables the cache (re-reads
    /// refetch from the producer, still fingerprint-checked).
    #[must_use]
    pub fn new(geometry: Geometry, cache_slots: Option<usize>) -> Self {
        let block_size = geometry.block_size() as usize;
        let file_blocks = geometry.file_blocks();
        let cache = cache_slots.map(|slots| BlockCache::new(file_blocks, slots));
        match &cache {
            Some(cache) => debug!(
                slots = cache.capacity(),
                file_blocks, "block cache enabled"
            ),
            None => debug!(file_blocks, "block cache disabled"),
        }
        Self {
            geometry,
            current: vec![0; block_size],
            curr_block: None,
            extra: vec![0; block_size],
            fingerprints: vec![Fingerprint::UNSET; file_blocks as usize],
            cache,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Contents of the most recently fetched block.
    #[must_use]
    pub fn current(&self) -> &[u8] {
        &self.current
    }

    /// Spill-over buffer; valid after [`Self::spill`].
    #[must_use]
    pub fn extra(&self) -> &[u8] {
        &self.extra
    }

    /// Fingerprint recorded for `block`, if it has been observed.
    #[must_use]
    pub fn fingerprint(&self, block: BlockIndex) -> Option<Fingerprint> {
        self.fingerprints
            .get(block.0 as usize)
            .copied()
            .filter(Fingerprint::is_set)
    }

    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    #[must_use]
    pub fn cache_occupancy(&self) -> usize {
        self.cache.as_ref().map_or(0, BlockCache::occupied)
    }

    #[must_use]
    pub fn cache_contains(&self, block: BlockIndex) -> bool {
        self.cache
            .as_ref()
            .map_or(false, |cache| cache.contains(block))
    }

    /// Copy the tail of `current` starting at `from` into `extra`, for a
    /// read that continues into the next block. Returns the spilled length.
    pub fn spill(&mut self, from: usize) -> usize {
        let len = self.current.len() - from;
        self.extra[..len].copy_from_slice(&self.current[from..]);
        len
    }

    /// Make `current` hold the canonical contents of `block`.
    ///
    /// Blocks past the end of the file are all zeros and never contact the
    /// producer. Everything fetched from the producer is digested and held
    /// to the fingerprint recorded on first observation; a mismatch fails
    /// with the cursor invalidated so no stale bytes can be served.
    pub fn fetch(&mut self, provider: &mut dyn DataProvider, block: BlockIndex) -> Result<()> {
        if self.curr_block == Some(block.0) {
            return Ok(());
        }

        if !self.geometry.contains_block(block) {
            self.current.fill(0);
            self.curr_block = Some(block.0);
            return Ok(());
        }

        // Cached data was verified at admission and is immutable; no
        // re-check needed.
        let mut cache_hit = false;
        if let Some(cache) = &self.cache {
            if let Some(data) = cache.get(block) {
                self.current.copy_from_slice(data);
                cache_hit = true;
            }
        }
        if cache_hit {
            trace!(target: "pfs::block", block = block.0, "cache hit");
            self.curr_block = Some(block.0);
            return Ok(());
        }

        // The producer writes into `current` from here on; clear the cursor
        // first so a failed or partial read cannot leave it naming
        // clobbered bytes.
        self.curr_block = None;

        let fetch_len = self.geometry.fetch_len(block);
        self.current[fetch_len..].fill(0);
        if let Err(err) = provider.read_block(block, &mut self.current[..fetch_len]) {
            warn!(block = block.0, error = %err, "producer read failed");
            return Err(PfsError::ProviderRead { block: block.0 });
        }

        let digest = digest_block(&self.current);
        let stored = self.fingerprints[block.0 as usize];
        if stored.is_set() {
            if digest != stored {
                warn!(block = block.0, "block contents changed between reads");
                return Err(PfsError::UnstableBlock { block: block.0 });
            }
        } else {
            self.fingerprints[block.0 as usize] = digest;
            trace!(target: "pfs::block", block = block.0, "fingerprint recorded");
        }

        // Verified — first observation or a matching refetch — so it may
        // enter the cache.
        if let Some(cache) = &mut self.cache {
            cache.insert(block, &self.current);
        }

        self.curr_block = Some(block.0);
        Ok(())
    }
}
