//! The fixed three-inode namespace and its attribute shaping.

use pfs_wire::{Attr, FUSE_ROOT_ID};

/// Node id of the package file.
pub const PACKAGE_FILE_ID: u64 = FUSE_ROOT_ID + 1;
/// Node id of the exit flag; observing its attributes shuts the session down.
pub const EXIT_FLAG_ID: u64 = FUSE_ROOT_ID + 2;

/// Entry/attribute validity handed to the kernel, to amortize re-queries.
pub const ATTR_VALIDITY_SECS: u64 = 10;

/// The one file handle we ever issue. Arbitrary; the session supports a
/// single logical open.
pub const PACKAGE_FILE_HANDLE: u64 = 10;

/// Stat block size reported in attributes (not the fetch block size).
const STAT_BLKSIZE: u32 = 4096;

/// The three inodes that exist for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Root,
    Package,
    Exit,
}

impl Node {
    #[must_use]
    pub fn from_id(nodeid: u64) -> Option<Self> {
        match nodeid {
            FUSE_ROOT_ID => Some(Self::Root),
            PACKAGE_FILE_ID => Some(Self::Package),
            EXIT_FLAG_ID => Some(Self::Exit),
            _ => None,
        }
    }

    #[must_use]
    pub fn id(self) -> u64 {
        match self {
            Self::Root => FUSE_ROOT_ID,
            Self::Package => PACKAGE_FILE_ID,
            Self::Exit => EXIT_FLAG_ID,
        }
    }
}

/// Build the wire attributes for `node`.
///
/// Ownership is the session's uid/gid; the root directory reports a nominal
/// 4096-byte size; the exit flag is an empty, unreadable regular file.
#[must_use]
pub fn shape_attr(node: Node, file_size: u64, uid: u32, gid: u32) -> Attr {
    let (size, mode) = match node {
        Node::Root => (4096, libc::S_IFDIR | 0o555),
        Node::Package => (file_size, libc::S_IFREG | 0o444),
        Node::Exit => (0, libc::S_IFREG),
    };
    Attr {
        ino: node.id(),
        size,
        blocks: if size == 0 {
            0
        } else {
            (size - 1) / u64::from(STAT_BLKSIZE) + 1
        },
        mode,
        nlink: 1,
        uid,
        gid,
        blksize: STAT_BLKSIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_round_trip() {
        for node in [Node::Root, Node::Package, Node::Exit] {
            assert_eq!(Node::from_id(node.id()), Some(node));
        }
        assert_eq!(Node::from_id(0), None);
        assert_eq!(Node::from_id(4), None);
    }

    #[test]
    fn root_attr() {
        let attr = shape_attr(Node::Root, 999, 1000, 1000);
        assert_eq!(attr.ino, 1);
        assert_eq!(attr.mode, libc::S_IFDIR | 0o555);
        assert_eq!(attr.size, 4096);
        assert_eq!(attr.blocks, 1);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn package_attr_reflects_file_size() {
        let attr = shape_attr(Node::Package, 10_000_000, 0, 0);
        assert_eq!(attr.ino, PACKAGE_FILE_ID);
        assert_eq!(attr.mode, libc::S_IFREG | 0o444);
        assert_eq!(attr.size, 10_000_000);
        // ceil(10_000_000 / 4096)
        assert_eq!(attr.blocks, 2442);
        assert_eq!(attr.blksize, 4096);
    }

    #[test]
    fn exit_attr_is_empty_and_unreadable() {
        let attr = shape_attr(Node::Exit, 10_000_000, 42, 42);
        assert_eq!(attr.ino, EXIT_FLAG_ID);
        assert_eq!(attr.mode, libc::S_IFREG);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.blocks, 0);
        assert_eq!(attr.uid, 42);
        assert_eq!(attr.gid, 42);
    }
}
