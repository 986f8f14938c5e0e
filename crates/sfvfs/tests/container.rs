#![forbid(unsafe_code)]
//! End-to-end container scenarios across the block, inode, and directory
//! layers.

use sfvfs::{
    AccessMode, BlockStore, Directory, DirectoryEntryFlags, Inode, StoreConfig,
    ROOT_DIRECTORY_ADDRESS,
};
use tempfile::NamedTempFile;

fn config() -> StoreConfig {
    StoreConfig {
        block_size: 1024,
        max_blocks: 64 * 1024,
        free_groups_cache_size: 4,
        free_address_cache_size: 1000,
        mode: AccessMode::ReadWrite,
    }
}

#[test]
fn first_allocation_is_the_root_directory() {
    let file = NamedTempFile::new().unwrap();
    let store = BlockStore::open(file.path(), config()).unwrap();

    // A fresh container hands out logical address 1 first, which is
    // where every consumer expects the root directory.
    let root = store.allocate().unwrap();
    assert_eq!(root.address(), ROOT_DIRECTORY_ADDRESS);
}

#[test]
fn files_survive_compaction_and_reopen() {
    let file = NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

    {
        let store = BlockStore::open(file.path(), config()).unwrap();

        let root_block = store.allocate().unwrap();
        let root = Directory::new(&store, root_block.address(), 255, 40).unwrap();
        root.create().unwrap();

        // A file, reachable from the root directory.
        let file_block = store.allocate().unwrap();
        file_block.clear().unwrap();
        let inode = Inode::new(&store, file_block.address()).unwrap();
        let mut stream = inode.append_stream().unwrap();
        stream.write_all(&payload).unwrap();
        stream.close().unwrap();
        root.add("data.bin", inode.address(), DirectoryEntryFlags::new())
            .unwrap();

        // A subdirectory entry next to it.
        let sub_block = store.allocate().unwrap();
        let sub = Directory::new(&store, sub_block.address(), 255, 40).unwrap();
        sub.create().unwrap();
        let mut flags = DirectoryEntryFlags::new();
        flags.set_directory(true);
        root.add("sub", sub.root_address(), flags).unwrap();

        // Churn to give compaction something to do.
        let mut scratch = Vec::new();
        for _ in 0..2000 {
            scratch.push(store.allocate().unwrap().address());
        }
        for address in scratch {
            store.deallocate(address).unwrap();
        }
        store.compact().unwrap();
        store.close().unwrap();
    }

    let store = BlockStore::open(file.path(), config()).unwrap();
    let root = Directory::new(&store, ROOT_DIRECTORY_ADDRESS, 255, 40).unwrap();

    let entry = root.find("data.bin").unwrap().expect("file entry");
    assert!(!entry.is_directory());
    let inode = Inode::new(&store, entry.address).unwrap();
    assert_eq!(inode.size().unwrap() as usize, payload.len());

    let mut reader = inode.read_stream().unwrap();
    assert_eq!(reader.read_to_end().unwrap(), payload);
    reader.close().unwrap();

    let sub = root.find("sub").unwrap().expect("subdirectory entry");
    assert!(sub.is_directory());
    let sub_dir = Directory::new(&store, sub.address, 255, 40).unwrap();
    assert_eq!(sub_dir.size().unwrap(), 0);
}

#[test]
fn removing_a_file_frees_its_blocks() {
    let file = NamedTempFile::new().unwrap();
    let store = BlockStore::open(file.path(), config()).unwrap();

    let root_block = store.allocate().unwrap();
    let root = Directory::new(&store, root_block.address(), 255, 40).unwrap();
    root.create().unwrap();
    let baseline = store.total_blocks().unwrap() - store.free_blocks().unwrap();

    let file_block = store.allocate().unwrap();
    file_block.clear().unwrap();
    let inode = Inode::new(&store, file_block.address()).unwrap();
    let mut stream = inode.append_stream().unwrap();
    stream.write_all(&vec![0x5A; 10_000]).unwrap();
    stream.close().unwrap();
    root.add("victim", inode.address(), DirectoryEntryFlags::new())
        .unwrap();

    root.remove("victim").unwrap();
    inode.delete().unwrap();

    let taken = store.total_blocks().unwrap() - store.free_blocks().unwrap();
    assert_eq!(taken, baseline);
}
