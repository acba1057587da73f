#![forbid(unsafe_code)]
//! Kernel FUSE wire protocol codec.
//!
//! Pure encode/decode crate — no I/O, no side effects. Parses request
//! headers and opcode payloads out of the byte frames read from the kernel
//! channel, and builds reply frames (header plus payload) as owned byte
//! vectors. Read replies are the exception: only the 16-byte header is built
//! here, and the caller appends the data segments via a vectored write so
//! block bytes are never copied into an intermediate frame.
//!
//! All fields are little-endian, decoded with explicit `from_le_bytes`
//! slices; no `#[repr(C)]` mirroring of the kernel structs.

use thiserror::Error;

/// Compiled-against FUSE protocol major version.
pub const FUSE_KERNEL_VERSION: u32 = 7;
/// Compiled-against FUSE protocol minor version.
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 31;
/// Oldest kernel minor version this codec can talk to.
///
/// `fuse_init_out` first stabilized in 7.6; older kernels cannot parse our
/// INIT reply at all.
pub const FUSE_OLDEST_SUPPORTED_MINOR: u32 = 6;

/// Root directory node id, fixed by the protocol.
pub const FUSE_ROOT_ID: u64 = 1;

/// Size of the fixed request header.
pub const IN_HEADER_LEN: usize = 40;
/// Size of the fixed reply header.
pub const OUT_HEADER_LEN: usize = 16;
/// Full `fuse_init_out` size (7.23 and newer).
pub const INIT_OUT_LEN: usize = 64;
/// Truncated `fuse_init_out` size understood by kernels at minor <= 22.
pub const COMPAT_22_INIT_OUT_LEN: usize = 24;

/// INIT reply tuning: queued background requests.
pub const MAX_BACKGROUND: u16 = 32;
/// INIT reply tuning: congestion threshold.
pub const CONGESTION_THRESHOLD: u16 = 32;
/// INIT reply tuning: largest write we accept (the filesystem is read-only,
/// so this only bounds kernel bookkeeping).
pub const MAX_WRITE: u32 = 4096;

/// Request opcodes handled by the dispatcher (from `<linux/fuse.h>`).
pub mod opcode {
    pub const LOOKUP: u32 = 1;
    pub const GETATTR: u32 = 3;
    pub const OPEN: u32 = 14;
    pub const READ: u32 = 15;
    pub const RELEASE: u32 = 18;
    pub const FLUSH: u32 = 25;
    pub const INIT: u32 = 26;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("lookup name is not NUL-terminated")]
    UnterminatedName,
    #[error("kernel speaks fuse {major}.{minor}, need {FUSE_KERNEL_VERSION}.{FUSE_OLDEST_SUPPORTED_MINOR} or newer")]
    VersionMismatch { major: u32, minor: u32 },
}

// ── Field decoding ──────────────────────────────────────────────────────────

fn read_u32(buf: &[u8], at: usize) -> Result<u32, WireError> {
    let end = at + 4;
    let bytes = buf.get(at..end).ok_or(WireError::Truncated {
        needed: end,
        actual: buf.len(),
    })?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64, WireError> {
    let end = at + 8;
    let bytes = buf.get(at..end).ok_or(WireError::Truncated {
        needed: end,
        actual: buf.len(),
    })?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
}

// ── Requests ────────────────────────────────────────────────────────────────

/// Fixed header preceding every kernel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl InHeader {
    /// Split a request frame into its header and opcode payload.
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if frame.len() < IN_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: IN_HEADER_LEN,
                actual: frame.len(),
            });
        }
        let hdr = Self {
            len: read_u32(frame, 0)?,
            opcode: read_u32(frame, 4)?,
            unique: read_u64(frame, 8)?,
            nodeid: read_u64(frame, 16)?,
            uid: read_u32(frame, 24)?,
            gid: read_u32(frame, 28)?,
            pid: read_u32(frame, 32)?,
        };
        Ok((hdr, &frame[IN_HEADER_LEN..]))
    }
}

/// INIT request payload (leading fields; later minors append more, which we
/// ignore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

impl InitIn {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            major: read_u32(payload, 0)?,
            minor: read_u32(payload, 4)?,
            max_readahead: read_u32(payload, 8)?,
            flags: read_u32(payload, 12)?,
        })
    }
}

/// READ request payload (leading fields; 7.9 appended lock/flags fields we
/// have no use for).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
}

impl ReadIn {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            fh: read_u64(payload, 0)?,
            offset: read_u64(payload, 8)?,
            size: read_u32(payload, 16)?,
        })
    }
}

/// Extract the NUL-terminated name from a LOOKUP payload.
///
/// Returned without the terminator; names are raw bytes, not UTF-8.
pub fn lookup_name(payload: &[u8]) -> Result<&[u8], WireError> {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::UnterminatedName)?;
    Ok(&payload[..nul])
}

// ── Replies ─────────────────────────────────────────────────────────────────

/// Inode attributes as the kernel expects them on the wire.
///
/// Timestamps and `rdev` are always zero for this filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

impl Attr {
    /// Encoded `fuse_attr` size.
    pub const WIRE_LEN: usize = 88;

    fn encode_into(&self, out: &mut ReplyBuf) {
        out.put_u64(self.ino);
        out.put_u64(self.size);
        out.put_u64(self.blocks);
        out.put_u64(0); // atime
        out.put_u64(0); // mtime
        out.put_u64(0); // ctime
        out.put_u32(0); // atimensec
        out.put_u32(0); // mtimensec
        out.put_u32(0); // ctimensec
        out.put_u32(self.mode);
        out.put_u32(self.nlink);
        out.put_u32(self.uid);
        out.put_u32(self.gid);
        out.put_u32(0); // rdev
        out.put_u32(self.blksize);
        out.put_u32(0); // flags
    }
}

/// Reply frame builder: out-header with a length patched in at the end.
struct ReplyBuf {
    bytes: Vec<u8>,
}

impl ReplyBuf {
    fn new(unique: u64) -> Self {
        let mut buf = Self {
            bytes: Vec::with_capacity(OUT_HEADER_LEN + Attr::WIRE_LEN + 40),
        };
        buf.put_u32(0); // len, patched by finish()
        buf.put_i32(0); // error
        buf.put_u64(unique);
        buf
    }

    fn put_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_zeros(&mut self, n: usize) {
        self.bytes.resize(self.bytes.len() + n, 0);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = u32::try_from(self.bytes.len()).expect("reply fits in u32");
        self.bytes[0..4].copy_from_slice(&len.to_le_bytes());
        self.bytes
    }
}

/// Bare reply header carrying only a status: 0 for success, a negative errno
/// for failure.
#[must_use]
pub fn status_reply(unique: u64, status: i32) -> [u8; OUT_HEADER_LEN] {
    let mut frame = [0u8; OUT_HEADER_LEN];
    frame[0..4].copy_from_slice(&(OUT_HEADER_LEN as u32).to_le_bytes());
    frame[4..8].copy_from_slice(&status.to_le_bytes());
    frame[8..16].copy_from_slice(&unique.to_le_bytes());
    frame
}

/// Reply header for a read: declares `payload_len` data bytes that the
/// caller sends as separate vectored segments.
#[must_use]
pub fn data_reply_header(unique: u64, payload_len: u32) -> [u8; OUT_HEADER_LEN] {
    let mut frame = [0u8; OUT_HEADER_LEN];
    let total = OUT_HEADER_LEN as u32 + payload_len;
    frame[0..4].copy_from_slice(&total.to_le_bytes());
    frame[8..16].copy_from_slice(&unique.to_le_bytes());
    frame
}

/// Negotiate and build the INIT reply.
///
/// The major version must match ours exactly and the minor must be at least
/// 6. The reply is truncated to the 7.22 layout when the kernel would not
/// know the larger structure.
pub fn init_reply(unique: u64, req: &InitIn) -> Result<Vec<u8>, WireError> {
    if req.major != FUSE_KERNEL_VERSION || req.minor < FUSE_OLDEST_SUPPORTED_MINOR {
        return Err(WireError::VersionMismatch {
            major: req.major,
            minor: req.minor,
        });
    }

    let body_len = if req.minor <= 22 {
        COMPAT_22_INIT_OUT_LEN
    } else {
        INIT_OUT_LEN
    };

    let mut out = ReplyBuf::new(unique);
    out.put_u32(FUSE_KERNEL_VERSION);
    out.put_u32(req.minor.min(FUSE_KERNEL_MINOR_VERSION));
    out.put_u32(req.max_readahead);
    out.put_u32(0); // flags: no optional features
    out.put_u16(MAX_BACKGROUND);
    out.put_u16(CONGESTION_THRESHOLD);
    out.put_u32(MAX_WRITE);
    // time_gran, max_pages, map_alignment, flags2 and the reserved words are
    // all zero; they only exist in the 7.23+ layout.
    out.put_zeros(body_len - COMPAT_22_INIT_OUT_LEN);
    Ok(out.finish())
}

/// Build a LOOKUP entry reply (`fuse_entry_out`).
#[must_use]
pub fn entry_reply(
    unique: u64,
    nodeid: u64,
    generation: u64,
    validity_secs: u64,
    attr: &Attr,
) -> Vec<u8> {
    let mut out = ReplyBuf::new(unique);
    out.put_u64(nodeid);
    out.put_u64(generation);
    out.put_u64(validity_secs); // entry_valid
    out.put_u64(validity_secs); // attr_valid
    out.put_u32(0); // entry_valid_nsec
    out.put_u32(0); // attr_valid_nsec
    attr.encode_into(&mut out);
    out.finish()
}

/// Build a GETATTR reply (`fuse_attr_out`).
#[must_use]
pub fn attr_reply(unique: u64, validity_secs: u64, attr: &Attr) -> Vec<u8> {
    let mut out = ReplyBuf::new(unique);
    out.put_u64(validity_secs); // attr_valid
    out.put_u32(0); // attr_valid_nsec
    out.put_u32(0); // dummy
    attr.encode_into(&mut out);
    out.finish()
}

/// Build an OPEN reply (`fuse_open_out`).
#[must_use]
pub fn open_reply(unique: u64, fh: u64) -> Vec<u8> {
    let mut out = ReplyBuf::new(unique);
    out.put_u64(fh);
    out.put_u32(0); // open_flags
    out.put_u32(0); // padding
    out.finish()
}
