#![forbid(unsafe_code)]
//! Shared types for ParcelFS.
//!
//! Defines the package geometry (file size, fetch block size, block count),
//! the per-block fingerprint type, and the newtypes used across the
//! workspace to keep byte offsets and block indices from mixing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest fetch block size the kernel will honor.
///
/// fs/fuse/inode.c clamps `max_read` to at least 4096, so a smaller block
/// size would silently desynchronize the read handler from the kernel.
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Largest supported fetch block size (4 MiB).
pub const MAX_BLOCK_SIZE: u32 = 1 << 22;

/// Upper bound on the number of blocks in a package.
///
/// Guards the fingerprint table and cache index allocations against
/// pathological geometries.
pub const MAX_FILE_BLOCKS: u64 = 1 << 18;

/// Number of bytes in a block fingerprint.
pub const FINGERPRINT_LEN: usize = 32;

/// Index of a fetch block within the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

impl BlockIndex {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated fetch block size (bytes in [4096, 2^22]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is within the supported range.
    pub fn new(value: u32) -> Result<Self, GeometryError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(GeometryError::BlockSizeOutOfRange { value });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Package geometry: a fixed file size carved into fixed-size fetch blocks,
/// the last of which may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    file_size: u64,
    block_size: BlockSize,
}

impl Geometry {
    /// Validate and build a geometry.
    ///
    /// Rejects block sizes outside [4096, 2^22] and packages with more than
    /// 2^18 blocks.
    pub fn new(file_size: u64, block_size: u32) -> Result<Self, GeometryError> {
        let block_size = BlockSize::new(block_size)?;
        let geometry = Self {
            file_size,
            block_size,
        };
        let blocks = geometry.file_blocks();
        if blocks > MAX_FILE_BLOCKS {
            return Err(GeometryError::TooManyBlocks { blocks });
        }
        Ok(geometry)
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    /// Number of blocks covering the file (0 for an empty file).
    #[must_use]
    pub fn file_blocks(&self) -> u64 {
        if self.file_size == 0 {
            0
        } else {
            (self.file_size - 1) / self.block_size.as_u64() + 1
        }
    }

    /// Block containing the given byte offset.
    #[must_use]
    pub fn block_of(&self, offset: u64) -> BlockIndex {
        BlockIndex(offset / self.block_size.as_u64())
    }

    /// Offset of the given byte within its block.
    #[must_use]
    pub fn offset_in_block(&self, offset: u64) -> usize {
        (offset % self.block_size.as_u64()) as usize
    }

    /// Whether `block` maps to any bytes of the file.
    #[must_use]
    pub fn contains_block(&self, block: BlockIndex) -> bool {
        block.0 < self.file_blocks()
    }

    /// Number of real bytes in `block`: the full block size everywhere but
    /// the tail, where it is the short remainder.
    ///
    /// Caller must ensure `block` is within the file.
    #[must_use]
    pub fn fetch_len(&self, block: BlockIndex) -> usize {
        debug_assert!(self.contains_block(block));
        let start = block.0 * self.block_size.as_u64();
        let remaining = self.file_size - start;
        if remaining >= self.block_size.as_u64() {
            self.block_size.as_usize()
        } else {
            remaining as usize
        }
    }
}

/// 32-byte digest of a block's canonical (padded) contents.
///
/// All zeros means "never observed"; once set, the value is immutable for
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub const UNSET: Self = Self([0; FINGERPRINT_LEN]);

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("block size {value} out of range [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]")]
    BlockSizeOutOfRange { value: u32 },
    #[error("package has too many blocks ({blocks}, limit {MAX_FILE_BLOCKS})")]
    TooManyBlocks { blocks: u64 },
}
