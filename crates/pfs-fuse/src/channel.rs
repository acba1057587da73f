//! Kernel request channel.
//!
//! [`KernelChannel`] is the seam between the dispatcher and the kernel: one
//! `receive` yields exactly one request frame, one `send` delivers one
//! complete reply as an atomic vectored write. The production implementation
//! is `/dev/fuse`; tests script the channel with queued frames.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use tracing::warn;

/// Request buffer size: one header plus generous room for the largest
/// payload the kernel sends for our opcode set (lookup names).
pub const REQUEST_BUF_LEN: usize = pfs_wire::IN_HEADER_LEN + 8 * libc::PATH_MAX as usize;

/// One-request-at-a-time kernel transport.
pub trait KernelChannel {
    /// Block until the next request frame; returns its length.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one reply as a single vectored write.
    fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()>;
}

/// The real kernel channel: an open `/dev/fuse` descriptor.
#[derive(Debug)]
pub struct FuseDevice {
    file: File,
}

impl FuseDevice {
    /// Open `/dev/fuse` read-write. The returned descriptor is handed to
    /// `mount(2)` via the `fd=` option.
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/fuse")?;
        Ok(Self { file })
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl KernelChannel for FuseDevice {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // One read(2) returns one whole request on this device.
        loop {
            match self.file.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()> {
        let expected: usize = segments.iter().map(|s| s.len()).sum();
        loop {
            match self.file.write_vectored(segments) {
                Ok(written) => {
                    if written != expected {
                        // The device accepts replies whole; a short count
                        // means the kernel rejected the frame.
                        warn!(written, expected, "short reply write");
                    }
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
