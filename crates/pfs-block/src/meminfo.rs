//! Cache sizing from free system memory.
//!
//! The cache exists to let a verify-then-install double read of the package
//! avoid refetching from the producer, but it must never starve the install
//! step itself. Free memory is estimated from `/proc/meminfo`, a fixed
//! install reservation and the per-block index overhead are subtracted, and
//! whatever remains becomes cache slots — provided the result is big enough
//! to be worth having.

use pfs_types::Geometry;
use std::mem::size_of;
use tracing::warn;

/// Memory held back for the package install step.
pub const INSTALL_RESERVED_BYTES: u64 = 500 * 1024 * 1024;

/// Estimate reclaimable memory as `MemFree + Buffers + Cached`.
///
/// Returns 0 when `/proc/meminfo` is unreadable, which simply disables the
/// cache.
#[must_use]
pub fn free_memory() -> u64 {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(text) => parse_meminfo(&text),
        Err(err) => {
            warn!(error = %err, "cannot read /proc/meminfo, disabling block cache");
            0
        }
    }
}

/// Sum the `MemFree`, `Buffers` and `Cached` lines of a meminfo listing
/// (values are in KiB).
#[must_use]
pub fn parse_meminfo(text: &str) -> u64 {
    let mut total = 0u64;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        if matches!(key, "MemFree" | "Buffers" | "Cached") {
            let kib = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            total += kib * 1024;
        }
    }
    total
}

/// Decide the cache slot count for `geometry` given `free_bytes` of
/// reclaimable memory.
///
/// `None` disables the cache: either memory is too tight after the install
/// reservation and the `file_blocks × pointer` index overhead, or the slots
/// that fit fall under the floor of max(2, file_blocks / 100) — a cache
/// smaller than 1% of the package would thrash without helping re-reads.
#[must_use]
pub fn plan_cache_slots(geometry: &Geometry, free_bytes: u64) -> Option<usize> {
    let file_blocks = geometry.file_blocks();
    let index_overhead = file_blocks * size_of::<usize>() as u64;
    let avail = free_bytes.checked_sub(INSTALL_RESERVED_BYTES + index_overhead)?;

    let slots = (avail / u64::from(geometry.block_size())).min(file_blocks);
    let floor = (file_blocks / 100).max(2);
    if slots >= floor {
        Some(slots as usize)
    } else {
        None
    }
}
