//! FUSE daemon for ParcelFS.
//!
//! Speaks the kernel FUSE wire protocol directly over `/dev/fuse`: a
//! single-threaded dispatch loop serving a fixed three-inode namespace (an
//! unlistable root, the package file, and the exit flag) with reads
//! satisfied by the fingerprint-checked block store.
//!
//! The syscall shims in `mount` are the only unsafe code in the workspace;
//! everything above the channel reads and writes plain byte frames.

mod attr;
mod channel;
mod mount;
mod session;

pub use attr::{Node, ATTR_VALIDITY_SECS, EXIT_FLAG_ID, PACKAGE_FILE_ID};
pub use channel::{FuseDevice, KernelChannel, REQUEST_BUF_LEN};
pub use session::{run, Session, SessionConfig};
