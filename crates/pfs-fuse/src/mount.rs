//! Mount and unmount syscall shims.
//!
//! The only unsafe code in the workspace lives here: thin wrappers over
//! `mount(2)`, `umount2(2)` and the uid/gid getters.

use pfs_error::{PfsError, Result};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, warn};

/// Capture the daemon's uid/gid once; attribute ownership and the mount
/// options both use these.
pub fn process_ids() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

fn path_cstr(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| PfsError::InvalidRequest("mount point contains a NUL byte".to_owned()))
}

/// Force-unmount the mount point, ignoring failure. Recovers the mount
/// point from a previous abnormal exit.
pub fn force_unmount(path: &Path) {
    let Ok(target) = path_cstr(path) else {
        return;
    };
    unsafe {
        libc::umount2(target.as_ptr(), libc::MNT_FORCE);
    }
}

/// Lazily detach the mount at teardown; best effort.
pub fn detach(path: &Path) {
    let Ok(target) = path_cstr(path) else {
        return;
    };
    let rc = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
    if rc == -1 {
        warn!(
            path = %path.display(),
            error = %std::io::Error::last_os_error(),
            "unmount failed"
        );
    }
}

/// Mount the FUSE filesystem over `path`, served by the already-open
/// `/dev/fuse` descriptor `fd`.
pub fn mount_fuse(path: &Path, fd: RawFd, uid: u32, gid: u32, max_read: u32) -> Result<()> {
    let target = path_cstr(path)?;
    let options = format!(
        "fd={fd},user_id={uid},group_id={gid},max_read={max_read},allow_other,rootmode=040000"
    );
    let data = CString::new(options.clone())
        .map_err(|_| PfsError::InvalidRequest("mount options contain a NUL byte".to_owned()))?;

    let flags = libc::MS_NOSUID | libc::MS_NODEV | libc::MS_RDONLY | libc::MS_NOEXEC;
    let rc = unsafe {
        libc::mount(
            c"/dev/fuse".as_ptr(),
            target.as_ptr(),
            c"fuse".as_ptr(),
            flags,
            data.as_ptr().cast(),
        )
    };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        warn!(path = %path.display(), options = %options, error = %err, "mount failed");
        return Err(err.into());
    }
    debug!(path = %path.display(), max_read, "filesystem mounted");
    Ok(())
}
