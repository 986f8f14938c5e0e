#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of every on-disk pointer and counter, in bytes.
pub const PTR_LEN: usize = 4;

/// Hard upper bound on the logical address space of one container.
pub const MAX_BLOCKS_LIMIT: u32 = 4 * 1024 * 1024;

/// Logical address of the root directory block in every container.
pub const ROOT_DIRECTORY_ADDRESS: LogicalAddress = LogicalAddress(1);

/// Stable block identifier exposed to callers, unaffected by compaction.
///
/// Zero is the null pointer and never refers to a block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogicalAddress(pub u32);

impl LogicalAddress {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Position of a block within the data region.
///
/// The block's bytes live at `header_len + physical · block_size`. Zero is
/// the meta block of group 0 and is never handed out, so zero doubles as
/// the "unmapped" marker in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalAddress(pub u32);

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Index of a block group within the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Validated block size: a power of two in `32..=65536`.
///
/// A group holds `block_size` blocks, so a group spans `block_size²` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        if !value.is_power_of_two() || !(32..=65536).contains(&value) {
            return Err(ConfigError::Invalid {
                field: "block_size",
                reason: "must be a power of two in 32..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Blocks per group, including the group-meta block.
    #[must_use]
    pub fn blocks_in_group(self) -> u32 {
        self.0
    }

    /// Bytes spanned by one group.
    #[must_use]
    pub fn group_bytes(self) -> u64 {
        u64::from(self.0) * u64::from(self.0)
    }

    /// 4-byte slots per block.
    #[must_use]
    pub fn slots(self) -> usize {
        self.0 as usize / PTR_LEN
    }
}

/// How the container file is opened.
///
/// `ReadWriteData` mirrors `"rwd"`: every write to the container is
/// followed by a data sync. `ReadWrite` leaves durability to the OS
/// pagecache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadWriteData,
}

impl FromStr for AccessMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rw" => Ok(Self::ReadWrite),
            "rwd" => Ok(Self::ReadWriteData),
            _ => Err(ConfigError::Invalid {
                field: "mode",
                reason: "must be \"rw\" or \"rwd\"",
            }),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadWrite => "rw",
            Self::ReadWriteData => "rwd",
        })
    }
}

/// Block store tuning, passed through by whatever embeds the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub block_size: u32,
    pub max_blocks: u32,
    pub free_groups_cache_size: usize,
    pub free_address_cache_size: usize,
    pub mode: AccessMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            max_blocks: 1024 * 1024,
            free_groups_cache_size: 4,
            free_address_cache_size: 1000,
            mode: AccessMode::ReadWrite,
        }
    }
}

impl StoreConfig {
    /// Validate the configuration and return the checked block size.
    pub fn validate(&self) -> Result<BlockSize, ConfigError> {
        let block_size = BlockSize::new(self.block_size)?;
        if self.max_blocks == 0 || self.max_blocks > MAX_BLOCKS_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_blocks",
                reason: "must be in 1..=4194304",
            });
        }
        if self.max_blocks % self.block_size != 0 {
            return Err(ConfigError::Invalid {
                field: "max_blocks",
                reason: "must be a multiple of block_size",
            });
        }
        if self.free_groups_cache_size == 0 {
            return Err(ConfigError::Invalid {
                field: "free_groups_cache_size",
                reason: "must be at least 1",
            });
        }
        if self.free_address_cache_size == 0 {
            return Err(ConfigError::Invalid {
                field: "free_address_cache_size",
                reason: "must be at least 1",
            });
        }
        Ok(block_size)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

// ── On-disk integers ────────────────────────────────────────────────────────
//
// Every pointer and counter is a 32-bit two's-complement big-endian
// integer. Legal values are non-negative, so they are handled as `u32`
// with range checks at the call sites that read foreign bytes.

/// Read a big-endian u32 at `offset`.
///
/// # Panics
/// Panics if `offset + 4` exceeds `buf.len()`; callers index into
/// fixed-size block buffers with validated slot offsets.
#[inline]
#[must_use]
pub fn read_be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Write a big-endian u32 at `offset`.
///
/// # Panics
/// Panics if `offset + 4` exceeds `buf.len()`.
#[inline]
pub fn write_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Read a big-endian i32 at `offset`.
///
/// # Panics
/// Panics if `offset + 4` exceeds `buf.len()`.
#[inline]
#[must_use]
pub fn read_be_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Write a big-endian i32 at `offset`.
///
/// # Panics
/// Panics if `offset + 4` exceeds `buf.len()`.
#[inline]
pub fn write_be_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
