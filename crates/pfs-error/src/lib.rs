#![forbid(unsafe_code)]
//! Error types for ParcelFS.
//!
//! Defines `PfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for FUSE error replies and the fatal/continue
//! split the dispatcher relies on.

use pfs_types::GeometryError;
use thiserror::Error;

/// Unified error type for all ParcelFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid package geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error("producer failed to deliver block {block}")]
    ProviderRead { block: u64 },

    #[error("block {block} changed between reads")]
    UnstableBlock { block: u64 },

    #[error("no such entry")]
    NotFound,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("unsupported fuse opcode {opcode}")]
    Unsupported { opcode: u32 },

    #[error("kernel speaks fuse {major}.{minor}, need 7.6 or newer")]
    VersionMismatch { major: u32, minor: u32 },

    #[error("kernel channel lost (filesystem was unmounted)")]
    ChannelLost,

    #[error("malformed request: {0}")]
    InvalidRequest(String),
}

impl PfsError {
    /// Convert this error into a POSIX errno suitable for FUSE error replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ProviderRead { .. } | Self::UnstableBlock { .. } => libc::EIO,
            Self::Geometry(_) | Self::InvalidRequest(_) => libc::EINVAL,
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EPERM,
            Self::Unsupported { .. } => libc::ENOSYS,
            Self::VersionMismatch { .. } => libc::EPROTO,
            Self::ChannelLost => libc::ENODEV,
        }
    }

    /// Whether the dispatcher must exit its loop after replying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. } | Self::ChannelLost)
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(PfsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(PfsError::PermissionDenied.to_errno(), libc::EPERM);
        assert_eq!(PfsError::Unsupported { opcode: 99 }.to_errno(), libc::ENOSYS);
        assert_eq!(PfsError::ProviderRead { block: 3 }.to_errno(), libc::EIO);
        assert_eq!(PfsError::UnstableBlock { block: 3 }.to_errno(), libc::EIO);
        assert_eq!(
            PfsError::VersionMismatch { major: 7, minor: 5 }.to_errno(),
            libc::EPROTO
        );
        assert_eq!(PfsError::ChannelLost.to_errno(), libc::ENODEV);
    }

    #[test]
    fn fatal_split() {
        assert!(PfsError::VersionMismatch { major: 8, minor: 0 }.is_fatal());
        assert!(PfsError::ChannelLost.is_fatal());
        assert!(!PfsError::NotFound.is_fatal());
        assert!(!PfsError::UnstableBlock { block: 0 }.is_fatal());
    }

    #[test]
    fn io_errno_passthrough() {
        let err = PfsError::Io(std::io::Error::from_raw_os_error(libc::ENODEV));
        assert_eq!(err.to_errno(), libc::ENODEV);
    }
}
