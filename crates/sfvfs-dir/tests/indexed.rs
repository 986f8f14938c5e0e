#![forbid(unsafe_code)]
//! Large indexed-directory scenario: ten thousand numeric names.

use sfvfs_block::BlockStore;
use sfvfs_dir::{Directory, DirectoryEntryFlags};
use sfvfs_types::{AccessMode, LogicalAddress, StoreConfig};
use tempfile::NamedTempFile;

#[test]
fn ten_thousand_entries_round_trip() {
    let file = NamedTempFile::new().unwrap();
    let config = StoreConfig {
        block_size: 1024,
        max_blocks: 10 * 1024,
        free_groups_cache_size: 2,
        free_address_cache_size: 100,
        mode: AccessMode::ReadWrite,
    };
    let store = BlockStore::open(file.path(), config).unwrap();

    let block = store.allocate().unwrap();
    let dir = Directory::new(&store, block.address(), 30, 10).unwrap();
    dir.create().unwrap();

    for j in 1u32..10_000 {
        dir.add(&j.to_string(), LogicalAddress(j), DirectoryEntryFlags::new())
            .unwrap();
    }
    assert_eq!(dir.size().unwrap(), 9999);

    for j in 1u32..10_000 {
        let entry = dir
            .find(&j.to_string())
            .unwrap()
            .unwrap_or_else(|| panic!("{j} not found"));
        assert_eq!(entry.address, LogicalAddress(j));
    }

    for j in 1u32..10_000 {
        dir.remove(&j.to_string()).unwrap();
    }
    assert_eq!(dir.size().unwrap(), 0);

    for j in 1u32..10_000 {
        assert!(dir.find(&j.to_string()).unwrap().is_none(), "{j} lingers");
    }
}
