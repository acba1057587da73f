#![forbid(unsafe_code)]
//! Producer-facing data contract.
//!
//! The session fetches package bytes one block at a time through
//! [`DataProvider`]. The provider may be local (a file on disk) or remote
//! (the host end of a streaming bridge); it is treated as untrusted either
//! way — the block layer fingerprints everything it returns.

use pfs_error::{PfsError, Result};
use pfs_types::BlockIndex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// Source of package bytes, read in block-aligned chunks.
///
/// `read_block` fills `buf` with the bytes of `block`; `buf.len()` equals
/// the block size for every block but the tail, where it is the short
/// remainder. Implementations may return different bytes on a refetch (a
/// hostile producer); read-stability is enforced above this trait, not here.
pub trait DataProvider {
    /// Total package size in bytes; stable for the session.
    fn file_size(&self) -> u64;

    /// Fetch block size in bytes; must lie in [4096, 2^22].
    fn block_size(&self) -> u32;

    /// Fill `buf` with the contents of `block`.
    fn read_block(&mut self, block: BlockIndex, buf: &mut [u8]) -> Result<()>;

    /// Release producer resources; called exactly once at teardown.
    fn close(&mut self);
}

/// Provider backed by a local file, using positioned reads.
///
/// Useful for serving an already-downloaded package and for exercising the
/// full stack without a remote producer.
#[derive(Debug)]
pub struct FileDataProvider {
    file: File,
    len: u64,
    block_size: u32,
}

impl FileDataProvider {
    /// Open `path` read-only and serve it in `block_size` chunks.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        debug!(
            path = %path.as_ref().display(),
            len,
            block_size,
            "opened package file"
        );
        Ok(Self {
            file,
            len,
            block_size,
        })
    }
}

impl DataProvider for FileDataProvider {
    fn file_size(&self) -> u64 {
        self.len
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&mut self, block: BlockIndex, buf: &mut [u8]) -> Result<()> {
        let offset = block.0 * u64::from(self.block_size);
        let past_end = offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.len);
        if past_end {
            return Err(PfsError::InvalidRequest(format!(
                "block {block} read past end of file (offset {offset}, len {})",
                buf.len()
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn close(&mut self) {
        // The descriptor closes on drop; nothing else is held.
        debug!("package file provider closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_package(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&bytes).expect("write package");
        file
    }

    #[test]
    fn reports_geometry_inputs() {
        let pkg = temp_package(10_000);
        let provider = FileDataProvider::open(pkg.path(), 4096).unwrap();
        assert_eq!(provider.file_size(), 10_000);
        assert_eq!(provider.block_size(), 4096);
    }

    #[test]
    fn reads_full_and_tail_blocks() {
        let pkg = temp_package(4096 + 100);
        let mut provider = FileDataProvider::open(pkg.path(), 4096).unwrap();

        let mut buf = vec![0u8; 4096];
        provider.read_block(BlockIndex(0), &mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(buf[250], 250);
        assert_eq!(buf[251], 0);

        let mut tail = vec![0u8; 100];
        provider.read_block(BlockIndex(1), &mut tail).unwrap();
        assert_eq!(tail[0], (4096 % 251) as u8);
    }

    #[test]
    fn rejects_out_of_range_reads() {
        let pkg = temp_package(4096);
        let mut provider = FileDataProvider::open(pkg.path(), 4096).unwrap();
        let mut buf = vec![0u8; 4096];
        assert!(provider.read_block(BlockIndex(1), &mut buf).is_err());
    }
}
