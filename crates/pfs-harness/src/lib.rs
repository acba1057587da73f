#![forbid(unsafe_code)]
//! End-to-end test infrastructure for ParcelFS.
//!
//! Provides the two fakes the session needs to run entirely in-process — a
//! scriptable producer and a scriptable kernel channel — plus request-frame
//! builders and reply parsers, so integration tests can drive the full
//! dispatcher loop and inspect every byte it emits.

use pfs_block::BlockStore;
use pfs_error::Result;
use pfs_fuse::{KernelChannel, Session, SessionConfig, PACKAGE_FILE_ID};
use pfs_provider::DataProvider;
use pfs_types::{BlockIndex, Geometry};
use pfs_wire::{opcode, FUSE_ROOT_ID, IN_HEADER_LEN, OUT_HEADER_LEN};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::IoSlice;

// ── Content generation ──────────────────────────────────────────────────────

/// Deterministic pseudo-random package content (xorshift stream).
#[must_use]
pub fn patterned_content(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let bytes = state.to_le_bytes();
        let take = bytes.len().min(len - out.len());
        out.extend_from_slice(&bytes[..take]);
    }
    out
}

// ── Scripted producer ───────────────────────────────────────────────────────

/// One recorded producer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRead {
    pub block: u64,
    pub len: usize,
}

/// Producer fake with canonical content, per-block adversarial overrides,
/// failure injection, and a full call log.
pub struct ScriptedProvider {
    pub content: Vec<u8>,
    pub block_size: u32,
    /// Content served for a block from its second fetch onward — the
    /// "different bytes for the installer" attack.
    pub swap_after_first: HashMap<u64, Vec<u8>>,
    /// Blocks whose reads fail outright.
    pub fail_blocks: HashSet<u64>,
    pub reads: Vec<BlockRead>,
    pub close_calls: u32,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new(content: Vec<u8>, block_size: u32) -> Self {
        Self {
            content,
            block_size,
            swap_after_first: HashMap::new(),
            fail_blocks: HashSet::new(),
            reads: Vec::new(),
            close_calls: 0,
        }
    }

    /// Number of producer reads issued for `block`.
    #[must_use]
    pub fn reads_of(&self, block: u64) -> usize {
        self.reads.iter().filter(|r| r.block == block).count()
    }
}

impl DataProvider for ScriptedProvider {
    fn file_size(&self) -> u64 {
        self.content.len() as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&mut self, block: BlockIndex, buf: &mut [u8]) -> Result<()> {
        let seen_before = self.reads.iter().any(|r| r.block == block.0);
        self.reads.push(BlockRead {
            block: block.0,
            len: buf.len(),
        });

        if self.fail_blocks.contains(&block.0) {
            return Err(pfs_error::PfsError::ProviderRead { block: block.0 });
        }
        if seen_before {
            if let Some(swapped) = self.swap_after_first.get(&block.0) {
                buf.copy_from_slice(&swapped[..buf.len()]);
                return Ok(());
            }
        }
        let start = (block.0 * u64::from(self.block_size)) as usize;
        buf.copy_from_slice(&self.content[start..start + buf.len()]);
        Ok(())
    }

    fn close(&mut self) {
        self.close_calls += 1;
    }
}

// ── Scripted kernel channel ─────────────────────────────────────────────────

/// Kernel channel fake: requests are dequeued from a script, replies are
/// captured whole. When the script runs dry it reports `ENODEV`, exactly
/// what a forced unmount looks like to the dispatcher.
pub struct ScriptChannel {
    requests: VecDeque<Vec<u8>>,
    pub replies: Vec<Vec<u8>>,
}

impl ScriptChannel {
    #[must_use]
    pub fn new(requests: Vec<Vec<u8>>) -> Self {
        Self {
            requests: requests.into(),
            replies: Vec::new(),
        }
    }
}

impl KernelChannel for ScriptChannel {
    fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.requests.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            None => Err(std::io::Error::from_raw_os_error(libc::ENODEV)),
        }
    }

    fn send(&mut self, segments: &[IoSlice<'_>]) -> std::io::Result<()> {
        let mut frame = Vec::new();
        for segment in segments {
            frame.extend_from_slice(segment);
        }
        self.replies.push(frame);
        Ok(())
    }
}

// ── Request frame builders ──────────────────────────────────────────────────

/// Build a raw request frame: header plus payload.
#[must_use]
pub fn raw_request(opcode_: u32, unique: u64, nodeid: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(IN_HEADER_LEN + payload.len());
    frame.extend_from_slice(&((IN_HEADER_LEN + payload.len()) as u32).to_le_bytes());
    frame.extend_from_slice(&opcode_.to_le_bytes());
    frame.extend_from_slice(&unique.to_le_bytes());
    frame.extend_from_slice(&nodeid.to_le_bytes());
    frame.extend_from_slice(&1000u32.to_le_bytes()); // uid
    frame.extend_from_slice(&1000u32.to_le_bytes()); // gid
    frame.extend_from_slice(&1u32.to_le_bytes()); // pid
    frame.extend_from_slice(&0u32.to_le_bytes()); // padding
    frame.extend_from_slice(payload);
    frame
}

#[must_use]
pub fn init_request(unique: u64, major: u32, minor: u32, max_readahead: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&major.to_le_bytes());
    payload.extend_from_slice(&minor.to_le_bytes());
    payload.extend_from_slice(&max_readahead.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes()); // flags
    raw_request(opcode::INIT, unique, FUSE_ROOT_ID, &payload)
}

#[must_use]
pub fn lookup_request(unique: u64, name: &str) -> Vec<u8> {
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    raw_request(opcode::LOOKUP, unique, FUSE_ROOT_ID, &payload)
}

#[must_use]
pub fn getattr_request(unique: u64, nodeid: u64) -> Vec<u8> {
    raw_request(opcode::GETATTR, unique, nodeid, &[])
}

#[must_use]
pub fn open_request(unique: u64, nodeid: u64) -> Vec<u8> {
    // fuse_open_in: flags + unused.
    let payload = [0u8; 8];
    raw_request(opcode::OPEN, unique, nodeid, &payload)
}

#[must_use]
pub fn read_request(unique: u64, offset: u64, size: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&10u64.to_le_bytes()); // fh
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(&size.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes()); // read_flags
    raw_request(opcode::READ, unique, PACKAGE_FILE_ID, &payload)
}

#[must_use]
pub fn flush_request(unique: u64) -> Vec<u8> {
    raw_request(opcode::FLUSH, unique, PACKAGE_FILE_ID, &[0u8; 24])
}

#[must_use]
pub fn release_request(unique: u64) -> Vec<u8> {
    raw_request(opcode::RELEASE, unique, PACKAGE_FILE_ID, &[0u8; 24])
}

// ── Reply parsing ───────────────────────────────────────────────────────────

/// A parsed reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
    pub payload: Vec<u8>,
}

/// Split a captured reply frame into header fields and payload.
#[must_use]
pub fn parse_reply(frame: &[u8]) -> Reply {
    assert!(frame.len() >= OUT_HEADER_LEN, "reply shorter than a header");
    Reply {
        len: u32::from_le_bytes(frame[0..4].try_into().unwrap()),
        error: i32::from_le_bytes(frame[4..8].try_into().unwrap()),
        unique: u64::from_le_bytes(frame[8..16].try_into().unwrap()),
        payload: frame[OUT_HEADER_LEN..].to_vec(),
    }
}

// ── Session runner ──────────────────────────────────────────────────────────

/// Result of driving a scripted session to completion.
pub struct SessionRun {
    pub outcome: Result<()>,
    pub replies: Vec<Reply>,
    pub provider: ScriptedProvider,
}

impl SessionRun {
    /// Reply for the request with the given `unique`.
    #[must_use]
    pub fn reply(&self, unique: u64) -> &Reply {
        self.replies
            .iter()
            .find(|r| r.unique == unique)
            .expect("no reply for unique")
    }
}

/// Drive a full dispatcher loop over scripted requests.
///
/// `cache_slots` bypasses the meminfo sizing so tests choose the cache
/// shape deliberately.
#[must_use]
pub fn run_session(
    mut provider: ScriptedProvider,
    cache_slots: Option<usize>,
    requests: Vec<Vec<u8>>,
) -> SessionRun {
    let geometry =
        Geometry::new(provider.file_size(), provider.block_size()).expect("test geometry");
    let store = BlockStore::new(geometry, cache_slots);
    let mut channel = ScriptChannel::new(requests);
    let outcome = {
        let mut session = Session::new(
            &mut provider,
            store,
            SessionConfig::new("/parcel-test"),
            1000,
            1000,
        );
        session.serve(&mut channel)
    };
    SessionRun {
        outcome,
        replies: channel.replies.iter().map(|f| parse_reply(f)).collect(),
        provider,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterned_content_is_deterministic() {
        assert_eq!(patterned_content(1000), patterned_content(1000));
        assert_eq!(patterned_content(0).len(), 0);
        assert_eq!(patterned_content(7).len(), 7);
        // Not all one value.
        let content = patterned_content(64);
        assert!(content.iter().any(|&b| b != content[0]));
    }

    #[test]
    fn scripted_provider_records_and_swaps() {
        let mut provider = ScriptedProvider::new(patterned_content(8192), 4096);
        provider.swap_after_first.insert(0, vec![0xEE; 4096]);

        let mut buf = vec![0u8; 4096];
        provider.read_block(BlockIndex(0), &mut buf).unwrap();
        assert_eq!(buf, provider.content[..4096]);

        provider.read_block(BlockIndex(0), &mut buf).unwrap();
        assert_eq!(buf, vec![0xEE; 4096]);
        assert_eq!(provider.reads_of(0), 2);
    }

    #[test]
    fn script_channel_reports_enodev_when_dry() {
        let mut channel = ScriptChannel::new(vec![]);
        let mut buf = [0u8; 64];
        let err = channel.receive(&mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }

    #[test]
    fn reply_parse_roundtrip() {
        let frame = pfs_wire::status_reply(42, -libc::ENOENT);
        let reply = parse_reply(&frame);
        assert_eq!(reply.unique, 42);
        assert_eq!(reply.error, -libc::ENOENT);
        assert!(reply.payload.is_empty());
    }
}
