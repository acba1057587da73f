#![forbid(unsafe_code)]
//! The local-file provider driven through the real dispatcher.

use pfs_block::BlockStore;
use pfs_error::PfsError;
use pfs_fuse::{Session, SessionConfig};
use pfs_harness::{init_request, parse_reply, patterned_content, read_request, ScriptChannel};
use pfs_provider::{DataProvider, FileDataProvider};
use pfs_types::Geometry;
use std::io::Write;

#[test]
fn serves_a_package_file_from_disk() {
    let content = patterned_content(200_000);
    let mut package = tempfile::NamedTempFile::new().expect("temp package");
    package.write_all(&content).expect("write package");

    let mut provider = FileDataProvider::open(package.path(), 4096).expect("open provider");
    let geometry = Geometry::new(provider.file_size(), provider.block_size()).expect("geometry");
    assert_eq!(geometry.file_blocks(), 49);

    let mut requests = vec![init_request(1, 7, 31, 4096)];
    let mut unique = 2u64;
    let mut offset = 0u64;
    while offset < geometry.file_size() {
        requests.push(read_request(unique, offset, 4096));
        unique += 1;
        offset += 4096;
    }

    let store = BlockStore::new(geometry, Some(8));
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
    assert!(matches!(outcome, Err(PfsError::ChannelLost)));

    let mut scanned = Vec::new();
    for frame in &channel.replies[1..] {
        let reply = parse_reply(frame);
        assert_eq!(reply.error, 0);
        scanned.extend_from_slice(&reply.payload);
    }
    assert_eq!(&scanned[..content.len()], &content[..]);
    assert!(scanned[content.len()..].iter().all(|&b| b == 0));
}
