#![forbid(unsafe_code)]
//! SFVFS public API facade.
//!
//! Re-exports the single-file virtual filesystem engine through one
//! crate: the block store with stable logical addresses and online
//! compaction, chained-block inodes with streaming append/read, and
//! adaptive plain/indexed directories. This is the crate an embedding
//! program depends on.

pub use sfvfs_block::{Block, BlockStore};
pub use sfvfs_dir::{
    DirEntry, Directory, DirectoryEntryFlags, DirectoryIter, DEFAULT_INDEX_THRESHOLD,
    DEFAULT_MAX_NAME_LEN,
};
pub use sfvfs_error::{Result, SfvfsError};
pub use sfvfs_inode::{Inode, InodeAppender, InodeReader};
pub use sfvfs_types::{
    AccessMode, BlockSize, GroupId, LogicalAddress, PhysicalAddress, StoreConfig,
    MAX_BLOCKS_LIMIT, ROOT_DIRECTORY_ADDRESS,
};
