#![forbid(unsafe_code)]
//! Error types for SFVFS.
//!
//! Defines `SfvfsError` and a `Result<T>` alias used throughout the
//! workspace. The engine surfaces every error to the caller; nothing is
//! retried internally.

use thiserror::Error;

/// Unified error type for all SFVFS operations.
#[derive(Debug, Error)]
pub enum SfvfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller-supplied value is outside its contract: a null or
    /// out-of-range address, a bad position, a malformed name, or an
    /// invalid configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The container or an object in it is not in a state that permits
    /// the operation: double free, locked inode, non-empty directory,
    /// duplicate entry, corrupt on-disk structure.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A block handle outlived a compaction.
    #[error("stale block handle: created at mapping version {seen}, store is at {current}")]
    StaleHandle { seen: u64, current: u64 },

    /// The container is owned by the thread that opened it.
    #[error("container is owned by a different thread")]
    WrongOwner,

    /// Every logical address (or every group slot the address space
    /// permits) is in use.
    #[error("out of space: all {max_blocks} block addresses are in use")]
    OutOfSpace { max_blocks: u32 },
}

impl SfvfsError {
    #[must_use]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Result alias using `SfvfsError`.
pub type Result<T> = std::result::Result<T, SfvfsError>;
