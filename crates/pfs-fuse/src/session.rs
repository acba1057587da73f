//! Session lifecycle and the request dispatch loop.
//!
//! One session spans mount to unmount: a single-threaded loop reading one
//! kernel request at a time, routing by opcode, and writing the reply
//! before touching the next request. Shutdown is triggered by any
//! observation of the exit flag (the reply is sent first), or by losing the
//! kernel channel to a forced unmount.

use crate::attr::{self, Node, ATTR_VALIDITY_SECS, PACKAGE_FILE_HANDLE, PACKAGE_FILE_ID};
use crate::channel::{FuseDevice, KernelChannel, REQUEST_BUF_LEN};
use crate::mount;
use pfs_block::{free_memory, plan_cache_slots, BlockStore};
use pfs_error::{PfsError, Result};
use pfs_provider::DataProvider;
use pfs_types::Geometry;
use pfs_wire::{self as wire, opcode, InHeader, InitIn, ReadIn, WireError};
use std::io::IoSlice;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Session parameters: where to mount and what the two files are called.
///
/// The filenames are protocol surface — the host tool looks the package up
/// by name and touches the exit flag to stop the daemon — so they default
/// to the conventional values.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mount_point: PathBuf,
    pub package_name: String,
    pub exit_name: String,
}

impl SessionConfig {
    #[must_use]
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            package_name: "package.zip".to_owned(),
            exit_name: "exit".to_owned(),
        }
    }
}

/// What a handler did with the request.
enum Dispatch {
    /// Reply already written to the channel.
    Replied,
    /// Frame a bare success reply.
    Empty,
    /// Reply written; exit the loop with success.
    Shutdown,
}

/// One mounted session: the dispatcher and everything it serves from.
pub struct Session<'p> {
    provider: &'p mut dyn DataProvider,
    store: BlockStore,
    config: SessionConfig,
    uid: u32,
    gid: u32,
}

impl<'p> Session<'p> {
    #[must_use]
    pub fn new(
        provider: &'p mut dyn DataProvider,
        store: BlockStore,
        config: SessionConfig,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            provider,
            store,
            config,
            uid,
            gid,
        }
    }

    #[must_use]
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Serve kernel requests until the exit flag is observed (Ok) or the
    /// channel is lost or a protocol error proves fatal (Err).
    pub fn serve(&mut self, channel: &mut dyn KernelChannel) -> Result<()> {
        let mut frame = vec![0u8; REQUEST_BUF_LEN];
        loop {
            let len = match channel.receive(&mut frame) {
                Ok(len) => len,
                Err(err) if err.raw_os_error() == Some(libc::ENODEV) => {
                    info!("kernel channel gone: filesystem was forcibly unmounted");
                    return Err(PfsError::ChannelLost);
                }
                Err(err) => {
                    warn!(error = %err, "kernel request read failed, retrying");
                    continue;
                }
            };

            let (hdr, payload) = match InHeader::parse(&frame[..len]) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(len, error = %err, "dropping truncated request");
                    continue;
                }
            };

            match self.dispatch(channel, &hdr, payload) {
                Ok(Dispatch::Replied) => {}
                Ok(Dispatch::Empty) => {
                    send_frame(channel, &wire::status_reply(hdr.unique, 0));
                }
                Ok(Dispatch::Shutdown) => {
                    info!("exit flag observed, shutting down");
                    return Ok(());
                }
                Err(err) => {
                    let errno = err.to_errno();
                    debug!(opcode = hdr.opcode, errno, error = %err, "request failed");
                    send_frame(channel, &wire::status_reply(hdr.unique, -errno));
                    if err.is_fatal() {
                        error!(error = %err, "fatal protocol error");
                        return Err(err);
                    }
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        channel: &mut dyn KernelChannel,
        hdr: &InHeader,
        payload: &[u8],
    ) -> Result<Dispatch> {
        match hdr.opcode {
            opcode::INIT => self.handle_init(channel, hdr, payload),
            opcode::LOOKUP => self.handle_lookup(channel, hdr, payload),
            opcode::GETATTR => self.handle_getattr(channel, hdr),
            opcode::OPEN => self.handle_open(channel, hdr),
            opcode::READ => self.handle_read(channel, hdr, payload),
            // Nothing to flush and no handle state to release.
            opcode::FLUSH | opcode::RELEASE => Ok(Dispatch::Empty),
            other => Err(PfsError::Unsupported { opcode: other }),
        }
    }

    fn handle_init(
        &mut self,
        channel: &mut dyn KernelChannel,
        hdr: &InHeader,
        payload: &[u8],
    ) -> Result<Dispatch> {
        let req = InitIn::parse(payload).map_err(reject)?;
        let reply = wire::init_reply(hdr.unique, &req).map_err(|err| match err {
            WireError::VersionMismatch { major, minor } => {
                PfsError::VersionMismatch { major, minor }
            }
            other => reject(other),
        })?;
        info!(
            major = req.major,
            minor = req.minor,
            max_readahead = req.max_readahead,
            "fuse protocol negotiated"
        );
        send_frame(channel, &reply);
        Ok(Dispatch::Replied)
    }

    fn handle_lookup(
        &mut self,
        channel: &mut dyn KernelChannel,
        hdr: &InHeader,
        payload: &[u8],
    ) -> Result<Dispatch> {
        let name = wire::lookup_name(payload).map_err(|_| PfsError::NotFound)?;
        let node = if name == self.config.package_name.as_bytes() {
            Node::Package
        } else if name == self.config.exit_name.as_bytes() {
            Node::Exit
        } else {
            return Err(PfsError::NotFound);
        };

        let attr = self.shape(node);
        // Generation mirrors the node id; ids are never reused.
        let reply = wire::entry_reply(hdr.unique, node.id(), node.id(), ATTR_VALIDITY_SECS, &attr);
        send_frame(channel, &reply);
        Ok(match node {
            Node::Exit => Dispatch::Shutdown,
            _ => Dispatch::Replied,
        })
    }

    fn handle_getattr(&mut self, channel: &mut dyn KernelChannel, hdr: &InHeader) -> Result<Dispatch> {
        let node = Node::from_id(hdr.nodeid).ok_or(PfsError::NotFound)?;
        let attr = self.shape(node);
        send_frame(channel, &wire::attr_reply(hdr.unique, ATTR_VALIDITY_SECS, &attr));
        Ok(match node {
            Node::Exit => Dispatch::Shutdown,
            _ => Dispatch::Replied,
        })
    }

    fn handle_open(&mut self, channel: &mut dyn KernelChannel, hdr: &InHeader) -> Result<Dispatch> {
        match Node::from_id(hdr.nodeid) {
            Some(Node::Package) => {
                send_frame(channel, &wire::open_reply(hdr.unique, PACKAGE_FILE_HANDLE));
                Ok(Dispatch::Replied)
            }
            Some(Node::Exit) => Err(PfsError::PermissionDenied),
            _ => Err(PfsError::NotFound),
        }
    }

    fn handle_read(
        &mut self,
        channel: &mut dyn KernelChannel,
        hdr: &InHeader,
        payload: &[u8],
    ) -> Result<Dispatch> {
        if hdr.nodeid != PACKAGE_FILE_ID {
            return Err(PfsError::NotFound);
        }
        let req = ReadIn::parse(payload).map_err(reject)?;

        let geometry = *self.store.geometry();
        let block_size = geometry.block_size() as usize;
        let size = req.size as usize;
        if size > block_size {
            // We mount with max_read = block_size, so the kernel never sends
            // these; a larger read cannot be served from two buffers.
            return Err(PfsError::InvalidRequest(format!(
                "read of {size} bytes exceeds max_read {block_size}"
            )));
        }

        let first = geometry.block_of(req.offset);
        let in_block = geometry.offset_in_block(req.offset);

        self.store.fetch(&mut *self.provider, first)?;

        // The reply always declares exactly `size` bytes: ranges past the
        // end of the file come back zero-filled rather than short, because
        // memory-mapping clients fault on short reads.
        let header = wire::data_reply_header(hdr.unique, req.size);

        if in_block + size <= block_size {
            let data = &self.store.current()[in_block..in_block + size];
            send_vectored(channel, &[IoSlice::new(&header), IoSlice::new(data)]);
        } else {
            // The read spills into the next block: park the tail of this
            // block in `extra`, fetch the successor, reply in two segments.
            let spilled = self.store.spill(in_block);
            self.store.fetch(&mut *self.provider, first.next())?;
            let head = &self.store.extra()[..spilled];
            let rest = &self.store.current()[..size - spilled];
            send_vectored(
                channel,
                &[IoSlice::new(&header), IoSlice::new(head), IoSlice::new(rest)],
            );
        }
        Ok(Dispatch::Replied)
    }

    fn shape(&self, node: Node) -> wire::Attr {
        attr::shape_attr(node, self.store.geometry().file_size(), self.uid, self.gid)
    }
}

fn reject(err: WireError) -> PfsError {
    PfsError::InvalidRequest(err.to_string())
}

fn send_frame(channel: &mut dyn KernelChannel, frame: &[u8]) {
    send_vectored(channel, &[IoSlice::new(frame)]);
}

fn send_vectored(channel: &mut dyn KernelChannel, segments: &[IoSlice<'_>]) {
    if let Err(err) = channel.send(segments) {
        warn!(error = %err, "reply write failed");
    }
}

/// Run a complete session: mount, serve until shutdown, tear down.
///
/// Returns Ok on a clean exit-flag shutdown. Teardown order is fixed: the
/// producer is closed first, the mount detached second, buffers freed with
/// the session, and the kernel channel descriptor released last.
pub fn run(mut provider: Box<dyn DataProvider>, config: &SessionConfig) -> Result<()> {
    info!(
        mount_point = %config.mount_point.display(),
        package = %config.package_name,
        "starting parcel filesystem"
    );

    // Recover the mount point from a previous abnormal exit.
    mount::force_unmount(&config.mount_point);

    let mut device = None;
    let outcome = serve_mounted(provider.as_mut(), config, &mut device);

    provider.close();
    if device.is_some() {
        mount::detach(&config.mount_point);
    }
    drop(device);

    match &outcome {
        Ok(()) => info!("session ended cleanly"),
        Err(err) => error!(error = %err, "session failed"),
    }
    outcome
}

fn serve_mounted(
    provider: &mut dyn DataProvider,
    config: &SessionConfig,
    device_slot: &mut Option<FuseDevice>,
) -> Result<()> {
    let geometry = Geometry::new(provider.file_size(), provider.block_size())?;
    info!(
        file_size = geometry.file_size(),
        block_size = geometry.block_size(),
        file_blocks = geometry.file_blocks(),
        "package geometry"
    );

    let slots = plan_cache_slots(&geometry, free_memory());
    let store = BlockStore::new(geometry, slots);

    let (uid, gid) = mount::process_ids();
    let device = device_slot.insert(FuseDevice::open()?);
    mount::mount_fuse(
        &config.mount_point,
        device.raw_fd(),
        uid,
        gid,
        geometry.block_size(),
    )?;

    let mut session = Session::new(provider, store, config.clone(), uid, gid);
    session.serve(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::EXIT_FLAG_ID;
    use pfs_types::BlockIndex;
    use std::collections::VecDeque;

    struct StaticProvider {
        content: Vec<u8>,
        block_size: u32,
    }

    impl DataProvider for StaticProvider {
        fn file_size(&self) -> u64 {
            self.content.len() as u64
        }

        fn block_size(&self) -> u32 {
            self.block_size
        }

        fn read_block(&mut self, block: BlockIndex, buf: &mut [u8]) -> Result<()> {
            let start = (block.0 * u64::from(self.block_size)) as usize;
            buf.copy_from_slice(&self.content[start..start + buf.len()]);
            Ok(())
        }

        fn close(&mut self) {}
    }

    /// Channel scripted with queued request frames; replies are captured.
    struct VecChannel {
        requests: VecDeque<Vec<u8>>,
        replies: Vec<Vec<u8>>,
    }

    impl VecChannel {
        fn new(requests: Vec<Vec<u8>>) -> Self {
            Self {
                requests: requests.into(),
                replies: Vec::new(),
            }
        }
    }

    impl KernelChannel for VecChannel {
        fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.requests.pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
                // Script exhausted: behave like a forced unmount.
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

    fn request(opcode_: u32, unique: u64, nodeid: u64, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((wire::IN_HEADER_LEN + payload.len()) as u32).to_le_bytes());
        frame.extend_from_slice(&opcode_.to_le_bytes());
        frame.extend_from_slice(&unique.to_le_bytes());
        frame.extend_from_slice(&nodeid.to_le_bytes());
        frame.extend_from_slice(&[0u8; 16]); // uid, gid, pid, padding
        frame.extend_from_slice(payload);
        frame
    }

    fn reply_error(frame: &[u8]) -> i32 {
        i32::from_le_bytes(frame[4..8].try_into().unwrap())
    }

    fn session_over(
        provider: &mut StaticProvider,
        requests: Vec<Vec<u8>>,
    ) -> (Result<()>, Vec<Vec<u8>>) {
        let geometry = Geometry::new(provider.file_size(), provider.block_size()).unwrap();
        let store = BlockStore::new(geometry, None);
        let mut session = Session::new(provider, store, SessionConfig::new("/unused"), 0, 0);
        let mut channel = VecChannel::new(requests);
        let outcome = session.serve(&mut channel);
        (outcome, channel.replies)
    }

    #[test]
    fn unknown_opcode_yields_enosys_and_continues() {
        let mut provider = StaticProvider {
            content: vec![7; 4096],
            block_size: 4096,
        };
        let (outcome, replies) = session_over(
            &mut provider,
            vec![
                request(28, 1, 1, &[]), // READDIR, unsupported
                request(opcode::FLUSH, 2, PACKAGE_FILE_ID, &[]),
            ],
        );
        // Loop ran past the bad opcode, then lost the scripted channel.
        assert!(matches!(outcome, Err(PfsError::ChannelLost)));
        assert_eq!(replies.len(), 2);
        assert_eq!(reply_error(&replies[0]), -libc::ENOSYS);
        assert_eq!(reply_error(&replies[1]), 0);
    }

    #[test]
    fn open_is_package_only() {
        let mut provider = StaticProvider {
            content: vec![7; 4096],
            block_size: 4096,
        };
        let (_, replies) = session_over(
            &mut provider,
            vec![
                request(opcode::OPEN, 1, EXIT_FLAG_ID, &[]),
                request(opcode::OPEN, 2, 9, &[]),
                request(opcode::OPEN, 3, PACKAGE_FILE_ID, &[]),
            ],
        );
        assert_eq!(reply_error(&replies[0]), -libc::EPERM);
        assert_eq!(reply_error(&replies[1]), -libc::ENOENT);
        assert_eq!(reply_error(&replies[2]), 0);
        // fuse_open_out carries our fixed handle.
        assert_eq!(
            u64::from_le_bytes(replies[2][16..24].try_into().unwrap()),
            PACKAGE_FILE_HANDLE
        );
    }

    #[test]
    fn getattr_of_exit_flag_shuts_down_after_reply() {
        let mut provider = StaticProvider {
            content: vec![7; 4096],
            block_size: 4096,
        };
        let (outcome, replies) = session_over(
            &mut provider,
            vec![
                request(opcode::GETATTR, 1, EXIT_FLAG_ID, &[]),
                // Never reached.
                request(opcode::GETATTR, 2, 1, &[]),
            ],
        );
        assert!(outcome.is_ok());
        assert_eq!(replies.len(), 1);
        assert_eq!(reply_error(&replies[0]), 0);
    }

    #[test]
    fn oversized_read_is_rejected() {
        let mut provider = StaticProvider {
            content: vec![7; 8192],
            block_size: 4096,
        };
        let mut payload = Vec::new();
        payload.extend_from_slice(&10u64.to_le_bytes());
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(&8192u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        let (_, replies) = session_over(
            &mut provider,
            vec![request(opcode::READ, 1, PACKAGE_FILE_ID, &payload)],
        );
        assert_eq!(reply_error(&replies[0]), -libc::EINVAL);
    }
}
