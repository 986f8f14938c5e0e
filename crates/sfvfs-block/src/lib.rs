#![forbid(unsafe_code)]
//! Fixed-size block store over a single container file.
//!
//! The file starts with a header region mapping logical block addresses to
//! physical positions, followed by block groups of `block_size` blocks
//! whose first block holds per-slot allocation flags. Logical addresses
//! stay stable across [`BlockStore::compact`], which packs live blocks
//! toward the head of the file and truncates empty tail groups.

use sfvfs_error::{Result, SfvfsError};
use sfvfs_types::{
    read_be_i32, write_be_u32, GroupId, LogicalAddress, PhysicalAddress, StoreConfig, PTR_LEN,
};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};
use tracing::{debug, info, trace};

/// Low bit of a group-meta byte: the slot holds live data.
/// The remaining bits are reserved and written as zero.
const FLAG_TAKEN: u8 = 0x1;

// ── Block groups ────────────────────────────────────────────────────────────

/// In-memory copy of one group's meta block plus derived counters.
///
/// The meta bytes on disk are updated in the same call that mutates the
/// copy, so a cached group never diverges from the file.
#[derive(Debug)]
struct BlockGroup {
    id: u32,
    meta: Vec<u8>,
    free_blocks: u32,
    /// Next slot to consider when scanning for a free slot; wraps over
    /// `1..blocks_in_group`, slot 0 being the meta block itself.
    slot_cursor: u32,
}

impl BlockGroup {
    fn is_taken(&self, slot: u32) -> bool {
        self.meta[slot as usize] & FLAG_TAKEN != 0
    }

    fn slot_span(&self) -> u32 {
        #[expect(clippy::cast_possible_truncation)]
        let blocks = self.meta.len() as u32;
        blocks - 1
    }

    /// Claim the first free slot starting from the cursor, wrapping.
    fn take_slot(&mut self) -> Option<u32> {
        if self.free_blocks == 0 {
            return None;
        }
        let span = self.slot_span();
        let start = self.slot_cursor.clamp(1, span);
        for step in 0..span {
            let slot = 1 + (start - 1 + step) % span;
            if !self.is_taken(slot) {
                self.meta[slot as usize] |= FLAG_TAKEN;
                self.free_blocks -= 1;
                self.slot_cursor = 1 + slot % span;
                return Some(slot);
            }
        }
        None
    }

    fn release_slot(&mut self, slot: u32) {
        self.meta[slot as usize] &= !FLAG_TAKEN;
        self.free_blocks += 1;
    }
}

// ── Store state ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StoreState {
    allocated_groups: u32,
    /// Mirror of the header region: logical address -> physical, 0 unmapped.
    logical_map: Vec<u32>,
    /// Groups known to have free slots, bounded by `free_groups_cache_size`.
    /// BTreeMap order makes "first group the cache yields" the lowest id.
    free_groups: BTreeMap<u32, BlockGroup>,
    /// Logical addresses known to be unmapped, bounded by
    /// `free_address_cache_size`.
    free_addresses: VecDeque<u32>,
    /// Where the last group refill scan stopped.
    group_cursor: u32,
    /// Where the last address refill scan stopped; in `1..max_blocks`.
    address_cursor: u32,
}

/// Block store over one container file.
///
/// Owned by the thread that opened it; every operation from another
/// thread fails with [`SfvfsError::WrongOwner`].
pub struct BlockStore {
    file: File,
    path: PathBuf,
    config: StoreConfig,
    block_size: usize,
    blocks_in_group: u32,
    group_bytes: u64,
    header_len: u64,
    max_blocks: u32,
    durable: bool,
    owner: ThreadId,
    state: RefCell<StoreState>,
    mapping_version: Cell<u64>,
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("BlockStore")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("max_blocks", &self.max_blocks)
            .field("allocated_groups", &state.allocated_groups)
            .field("mapping_version", &self.mapping_version.get())
            .finish_non_exhaustive()
    }
}

impl BlockStore {
    /// Open or create a container at `path`.
    ///
    /// A fresh file gets a zeroed header region; an existing file must at
    /// least cover its header, and its group count is recovered from the
    /// file length.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let block_size_checked = config
            .validate()
            .map_err(|e| SfvfsError::invalid_argument(e.to_string()))?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let block_size = block_size_checked.get() as usize;
        let blocks_in_group = block_size_checked.blocks_in_group();
        let group_bytes = block_size_checked.group_bytes();
        let max_blocks = config.max_blocks;
        // Header region, padded up to a whole number of blocks.
        let raw_header = u64::from(max_blocks) * PTR_LEN as u64;
        let header_len = raw_header.div_ceil(block_size as u64) * block_size as u64;

        let len = file.metadata()?.len();
        let allocated_groups = if len == 0 {
            file.set_len(header_len)?;
            0
        } else if len < header_len {
            return Err(SfvfsError::invalid_state(format!(
                "container {} is smaller than its {header_len}-byte header region",
                path.display()
            )));
        } else {
            #[expect(clippy::cast_possible_truncation)]
            let groups = ((len - header_len) / group_bytes) as u32;
            groups
        };

        let mut header = vec![0u8; max_blocks as usize * PTR_LEN];
        file.read_exact_at(&mut header, 0)?;
        let total_physical = allocated_groups * blocks_in_group;
        let mut logical_map = vec![0u32; max_blocks as usize];
        for logical in 1..max_blocks as usize {
            let value = read_be_i32(&header, logical * PTR_LEN);
            if value == 0 {
                continue;
            }
            if value < 0 {
                return Err(SfvfsError::invalid_state(format!(
                    "header slot L{logical} holds negative physical address {value}"
                )));
            }
            #[expect(clippy::cast_sign_loss)]
            let physical = value as u32;
            if physical >= total_physical || physical % blocks_in_group == 0 {
                return Err(SfvfsError::invalid_state(format!(
                    "header slot L{logical} references P{physical} outside the data region"
                )));
            }
            logical_map[logical] = physical;
        }

        info!(
            target: "sfvfs::block",
            event = "open",
            path = %path.display(),
            block_size,
            max_blocks,
            allocated_groups,
            mode = %config.mode
        );

        let durable = config.mode == sfvfs_types::AccessMode::ReadWriteData;
        Ok(Self {
            file,
            path,
            config,
            block_size,
            blocks_in_group,
            group_bytes,
            header_len,
            max_blocks,
            durable,
            owner: thread::current().id(),
            state: RefCell::new(StoreState {
                allocated_groups,
                logical_map,
                free_groups: BTreeMap::new(),
                free_addresses: VecDeque::new(),
                group_cursor: 0,
                address_cursor: 1,
            }),
            mapping_version: Cell::new(0),
        })
    }

    /// Block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Upper bound on logical addresses.
    #[must_use]
    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    /// Monotonic counter bumped by each completed compaction.
    #[must_use]
    pub fn mapping_version(&self) -> u64 {
        self.mapping_version.get()
    }

    /// Total blocks in the container, group-meta blocks included.
    pub fn total_blocks(&self) -> Result<u32> {
        self.check_owner()?;
        Ok(self.state.borrow().allocated_groups * self.blocks_in_group)
    }

    /// Free (allocatable) blocks across all groups.
    pub fn free_blocks(&self) -> Result<u32> {
        self.check_owner()?;
        let state = self.state.borrow();
        let mut free = 0;
        for id in 0..state.allocated_groups {
            free += match state.free_groups.get(&id) {
                Some(group) => group.free_blocks,
                None => self.load_group(id)?.free_blocks,
            };
        }
        Ok(free)
    }

    /// Container capacity in bytes: `total_blocks · block_size`.
    pub fn total_space_bytes(&self) -> Result<u64> {
        Ok(u64::from(self.total_blocks()?) * self.block_size as u64)
    }

    /// Free capacity in bytes: `free_blocks · block_size`.
    pub fn free_space_bytes(&self) -> Result<u64> {
        Ok(u64::from(self.free_blocks()?) * self.block_size as u64)
    }

    /// Per-group free-slot counts, head to tail.
    pub fn block_usage(&self) -> Result<Vec<(GroupId, u32)>> {
        self.check_owner()?;
        let state = self.state.borrow();
        let mut usage = Vec::with_capacity(state.allocated_groups as usize);
        for id in 0..state.allocated_groups {
            let free = match state.free_groups.get(&id) {
                Some(group) => group.free_blocks,
                None => self.load_group(id)?.free_blocks,
            };
            usage.push((GroupId(id), free));
        }
        Ok(usage)
    }

    /// Allocate one block and return its handle.
    ///
    /// Fails with [`SfvfsError::OutOfSpace`] once every logical address is
    /// mapped or the group space has reached `max_blocks` blocks.
    pub fn allocate(&self) -> Result<Block<'_>> {
        self.check_owner()?;
        let mut state = self.state.borrow_mut();

        if state.free_groups.is_empty() {
            self.refill_free_groups(&mut state)?;
            if state.free_groups.is_empty() {
                self.append_group(&mut state)?;
            }
        }
        let Some(&gid) = state.free_groups.keys().next() else {
            return Err(SfvfsError::OutOfSpace {
                max_blocks: self.max_blocks,
            });
        };

        let logical = self.next_free_address(&mut state)?;

        let physical = {
            let group = state.free_groups.get_mut(&gid).ok_or_else(|| {
                SfvfsError::invalid_state(format!("group {gid} dropped from the free cache"))
            })?;
            let slot = group.take_slot().ok_or_else(|| {
                SfvfsError::invalid_state(format!("group {gid} cached as free but has no free slot"))
            })?;
            self.write_meta_byte(group, slot)?;
            gid * self.blocks_in_group + slot
        };
        let now_full = state
            .free_groups
            .get(&gid)
            .is_some_and(|group| group.free_blocks == 0);
        if now_full {
            state.free_groups.remove(&gid);
        }

        state.logical_map[logical as usize] = physical;
        self.write_header_slot(logical, physical)?;

        trace!(
            target: "sfvfs::block",
            event = "allocate",
            logical,
            physical,
            group = gid
        );
        Ok(Block {
            store: self,
            logical: LogicalAddress(logical),
            physical: PhysicalAddress(physical),
            version: self.mapping_version.get(),
        })
    }

    /// Release a block.
    ///
    /// Freeing the null address, an out-of-range address, or an address
    /// that is not currently mapped is a caller bug and fails.
    pub fn deallocate(&self, address: LogicalAddress) -> Result<()> {
        self.check_owner()?;
        let addr = self.checked_address(address)?;
        let mut state = self.state.borrow_mut();

        let physical = state.logical_map[addr as usize];
        if physical == 0 {
            return Err(SfvfsError::invalid_state(format!(
                "double free or free of unmapped address {address}"
            )));
        }
        let gid = physical / self.blocks_in_group;
        let slot = physical % self.blocks_in_group;

        let mut group = match state.free_groups.remove(&gid) {
            Some(group) => group,
            None => self.load_group(gid)?,
        };
        if !group.is_taken(slot) {
            return Err(SfvfsError::invalid_state(format!(
                "group {gid} slot {slot} is free but mapped from {address}"
            )));
        }
        group.release_slot(slot);
        self.write_meta_byte(&group, slot)?;
        if state.free_groups.len() < self.config.free_groups_cache_size {
            state.free_groups.insert(gid, group);
        }

        state.logical_map[addr as usize] = 0;
        self.write_header_slot(addr, 0)?;
        if state.free_addresses.len() < self.config.free_address_cache_size {
            state.free_addresses.push_back(addr);
        }

        trace!(
            target: "sfvfs::block",
            event = "deallocate",
            logical = addr,
            physical,
            group = gid
        );
        Ok(())
    }

    /// Resolve a logical address to a block handle.
    pub fn get(&self, address: LogicalAddress) -> Result<Block<'_>> {
        self.check_owner()?;
        let addr = self.checked_address(address)?;
        let physical = self.state.borrow().logical_map[addr as usize];
        if physical == 0 {
            return Err(SfvfsError::invalid_argument(format!(
                "address {address} is not mapped"
            )));
        }
        Ok(Block {
            store: self,
            logical: address,
            physical: PhysicalAddress(physical),
            version: self.mapping_version.get(),
        })
    }

    /// Pack live blocks toward the head of the file and truncate empty
    /// tail groups.
    ///
    /// Logical addresses survive unchanged; block handles taken before the
    /// call fail with [`SfvfsError::StaleHandle`] afterwards.
    pub fn compact(&self) -> Result<()> {
        self.check_owner()?;
        let mut state = self.state.borrow_mut();
        let groups_before = state.allocated_groups;

        // Snapshot the reverse map physical -> logical.
        let total_physical = (state.allocated_groups * self.blocks_in_group) as usize;
        let mut reverse = vec![0u32; total_physical];
        for (logical, &physical) in state.logical_map.iter().enumerate() {
            if physical != 0 {
                #[expect(clippy::cast_possible_truncation)]
                let logical = logical as u32;
                reverse[physical as usize] = logical;
            }
        }

        let mut moved = 0usize;
        let mut start_group: u32 = 0;

        'compact: while state.allocated_groups > 0 {
            // Target: first group from the head with at least one free slot.
            let mut target = None;
            while start_group < state.allocated_groups {
                let group = self.load_group(start_group)?;
                if group.free_blocks > 0 {
                    target = Some(group);
                    break;
                }
                start_group += 1;
            }

            // Source: last group holding live data; wholly empty tail
            // groups shrink the file on the way down.
            let mut source = None;
            while state.allocated_groups > 0 {
                let end_group = state.allocated_groups - 1;
                let group = self.load_group(end_group)?;
                if group.free_blocks == self.blocks_in_group - 1 {
                    self.truncate_to_groups(end_group)?;
                    state.allocated_groups = end_group;
                } else {
                    source = Some(group);
                    break;
                }
            }

            let (Some(mut target), Some(mut source)) = (target, source) else {
                break;
            };
            if target.id >= source.id {
                break;
            }

            for slot in 1..self.blocks_in_group {
                if !source.is_taken(slot) {
                    continue;
                }
                let Some(tslot) = target.take_slot() else {
                    // Target exhausted mid-group; seek the next target.
                    start_group = target.id + 1;
                    continue 'compact;
                };
                let src_physical = source.id * self.blocks_in_group + slot;
                let dst_physical = target.id * self.blocks_in_group + tslot;

                let mut data = vec![0u8; self.block_size];
                self.read_at(self.block_offset(PhysicalAddress(src_physical)), &mut data)?;
                self.write_at(self.block_offset(PhysicalAddress(dst_physical)), &data)?;
                self.write_meta_byte(&target, tslot)?;

                let logical = reverse[src_physical as usize];
                if logical == 0 {
                    return Err(SfvfsError::invalid_state(format!(
                        "taken block P{src_physical} has no header mapping"
                    )));
                }
                self.write_header_slot(logical, dst_physical)?;
                state.logical_map[logical as usize] = dst_physical;
                reverse[dst_physical as usize] = logical;
                reverse[src_physical as usize] = 0;

                source.release_slot(slot);
                self.write_meta_byte(&source, slot)?;

                trace!(
                    target: "sfvfs::block::compact",
                    event = "move_block",
                    logical,
                    from = src_physical,
                    to = dst_physical
                );
                moved += 1;
            }
            // Source drained; the next tail scan truncates it.
        }

        // Cached groups and addresses describe the pre-compaction layout.
        state.free_groups.clear();
        state.free_addresses.clear();
        state.group_cursor = 0;
        state.address_cursor = 1;
        self.mapping_version.set(self.mapping_version.get() + 1);

        info!(
            target: "sfvfs::block::compact",
            event = "compact",
            groups_before,
            groups_after = state.allocated_groups,
            moved_blocks = moved,
            mapping_version = self.mapping_version.get()
        );
        Ok(())
    }

    /// Close the container. Pending writes reach the disk when the OS
    /// flushes its pagecache; the engine never syncs between operations.
    pub fn close(self) -> Result<()> {
        self.check_owner()?;
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────────

    fn check_owner(&self) -> Result<()> {
        if thread::current().id() != self.owner {
            return Err(SfvfsError::WrongOwner);
        }
        Ok(())
    }

    fn checked_address(&self, address: LogicalAddress) -> Result<u32> {
        if address.is_null() || address.0 >= self.max_blocks {
            return Err(SfvfsError::invalid_argument(format!(
                "address {address} is outside 1..{}",
                self.max_blocks
            )));
        }
        Ok(address.0)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        if self.durable {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn group_offset(&self, id: u32) -> u64 {
        self.header_len + u64::from(id) * self.group_bytes
    }

    fn block_offset(&self, physical: PhysicalAddress) -> u64 {
        self.header_len + u64::from(physical.0) * self.block_size as u64
    }

    fn write_header_slot(&self, logical: u32, physical: u32) -> Result<()> {
        let mut buf = [0u8; PTR_LEN];
        write_be_u32(&mut buf, 0, physical);
        self.write_at(u64::from(logical) * PTR_LEN as u64, &buf)
    }

    fn write_meta_byte(&self, group: &BlockGroup, slot: u32) -> Result<()> {
        self.write_at(
            self.group_offset(group.id) + u64::from(slot),
            &[group.meta[slot as usize]],
        )
    }

    fn load_group(&self, id: u32) -> Result<BlockGroup> {
        let mut meta = vec![0u8; self.block_size];
        self.read_at(self.group_offset(id), &mut meta)?;
        let mut free_blocks = 0;
        for &byte in &meta[1..] {
            if byte & FLAG_TAKEN == 0 {
                free_blocks += 1;
            }
        }
        Ok(BlockGroup {
            id,
            meta,
            free_blocks,
            slot_cursor: 1,
        })
    }

    /// Append one zero-initialised group at the tail and cache it.
    fn append_group(&self, state: &mut StoreState) -> Result<()> {
        if state.allocated_groups * self.blocks_in_group >= self.max_blocks {
            return Err(SfvfsError::OutOfSpace {
                max_blocks: self.max_blocks,
            });
        }
        let id = state.allocated_groups;
        let zero = vec![0u8; self.block_size];
        for block in 0..self.blocks_in_group {
            self.write_at(
                self.group_offset(id) + u64::from(block) * self.block_size as u64,
                &zero,
            )?;
        }
        let mut group = BlockGroup {
            id,
            meta: zero,
            free_blocks: self.blocks_in_group - 1,
            slot_cursor: 1,
        };
        group.meta[0] = FLAG_TAKEN;
        self.write_meta_byte(&group, 0)?;

        state.allocated_groups += 1;
        state.free_groups.insert(id, group);
        debug!(
            target: "sfvfs::block",
            event = "group_append",
            group = id,
            total_blocks = state.allocated_groups * self.blocks_in_group
        );
        Ok(())
    }

    /// Refill the free-group cache by a wrapping scan from the group
    /// cursor, stopping at the cache limit or after one full circle.
    fn refill_free_groups(&self, state: &mut StoreState) -> Result<()> {
        let total = state.allocated_groups;
        if total == 0 {
            return Ok(());
        }
        let start = state.group_cursor % total;
        for step in 0..total {
            if state.free_groups.len() >= self.config.free_groups_cache_size {
                break;
            }
            let id = (start + step) % total;
            state.group_cursor = (id + 1) % total;
            if state.free_groups.contains_key(&id) {
                continue;
            }
            let group = self.load_group(id)?;
            if group.free_blocks > 0 {
                state.free_groups.insert(id, group);
            }
        }
        Ok(())
    }

    /// Pop a free logical address, refilling the queue by a wrapping scan
    /// from the address cursor when it runs dry.
    fn next_free_address(&self, state: &mut StoreState) -> Result<u32> {
        if state.free_addresses.is_empty() {
            let span = self.max_blocks - 1;
            let start = state.address_cursor.clamp(1, span);
            for step in 0..span {
                if state.free_addresses.len() >= self.config.free_address_cache_size {
                    break;
                }
                let addr = 1 + (start - 1 + step) % span;
                state.address_cursor = 1 + addr % span;
                if state.logical_map[addr as usize] == 0 {
                    state.free_addresses.push_back(addr);
                }
            }
        }
        state.free_addresses.pop_front().ok_or(SfvfsError::OutOfSpace {
            max_blocks: self.max_blocks,
        })
    }

    fn truncate_to_groups(&self, groups: u32) -> Result<()> {
        self.file
            .set_len(self.header_len + u64::from(groups) * self.group_bytes)?;
        debug!(
            target: "sfvfs::block::compact",
            event = "truncate",
            groups
        );
        Ok(())
    }
}

// ── Block handles ───────────────────────────────────────────────────────────

/// Handle to one allocated block.
///
/// Captures the mapping version at construction; any access after a
/// compaction fails with [`SfvfsError::StaleHandle`] instead of touching
/// a relocated block.
#[derive(Debug, Clone, Copy)]
pub struct Block<'s> {
    store: &'s BlockStore,
    logical: LogicalAddress,
    physical: PhysicalAddress,
    version: u64,
}

impl<'s> Block<'s> {
    /// Stable logical address of this block.
    #[must_use]
    pub fn address(&self) -> LogicalAddress {
        self.logical
    }

    /// Block size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.store.block_size
    }

    fn ensure_current(&self) -> Result<()> {
        self.store.check_owner()?;
        let current = self.store.mapping_version.get();
        if current != self.version {
            return Err(SfvfsError::StaleHandle {
                seen: self.version,
                current,
            });
        }
        Ok(())
    }

    /// Read the whole block.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.ensure_current()?;
        let mut buf = vec![0u8; self.store.block_size];
        self.store
            .read_at(self.store.block_offset(self.physical), &mut buf)?;
        Ok(buf)
    }

    /// Write `bytes` at the start of the block, verbatim.
    ///
    /// Shorter slices leave the tail of the block untouched; there is no
    /// zero-extension.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_current()?;
        if bytes.len() > self.store.block_size {
            return Err(SfvfsError::invalid_argument(format!(
                "write of {} bytes exceeds block size {}",
                bytes.len(),
                self.store.block_size
            )));
        }
        self.store
            .write_at(self.store.block_offset(self.physical), bytes)
    }

    /// Read the big-endian i32 at byte `pos`.
    pub fn read_i32(&self, pos: usize) -> Result<i32> {
        self.ensure_current()?;
        self.check_pos(pos)?;
        let mut buf = [0u8; PTR_LEN];
        self.store
            .read_at(self.store.block_offset(self.physical) + pos as u64, &mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Write a big-endian i32 at byte `pos`.
    pub fn write_i32(&self, pos: usize, value: i32) -> Result<()> {
        self.ensure_current()?;
        self.check_pos(pos)?;
        self.store.write_at(
            self.store.block_offset(self.physical) + pos as u64,
            &value.to_be_bytes(),
        )
    }

    /// Zero the whole block.
    pub fn clear(&self) -> Result<()> {
        self.ensure_current()?;
        let zero = vec![0u8; self.store.block_size];
        self.store
            .write_at(self.store.block_offset(self.physical), &zero)
    }

    fn check_pos(&self, pos: usize) -> Result<()> {
        if pos + PTR_LEN > self.store.block_size {
            return Err(SfvfsError::invalid_argument(format!(
                "position {pos} does not leave room for an integer in a {}-byte block",
                self.store.block_size
            )));
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_config() -> StoreConfig {
        StoreConfig {
            block_size: 64,
            max_blocks: 10 * 1024,
            free_groups_cache_size: 1,
            free_address_cache_size: 100,
            mode: sfvfs_types::AccessMode::ReadWrite,
        }
    }

    fn open_store(file: &NamedTempFile) -> BlockStore {
        BlockStore::open(file.path(), test_config()).expect("open store")
    }

    #[test]
    fn simple_allocate_and_deallocate() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let block = store.allocate().unwrap();
        assert_eq!(store.total_blocks().unwrap(), 64);
        assert_eq!(store.free_blocks().unwrap(), 62);

        store.deallocate(block.address()).unwrap();
        assert_eq!(store.free_blocks().unwrap(), 63);
    }

    #[test]
    fn allocate_and_deallocate_multiple() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let mut addresses = Vec::new();
        for _ in 0..100 {
            addresses.push(store.allocate().unwrap().address());
        }
        assert_eq!(store.total_blocks().unwrap(), 128);
        assert_eq!(store.free_blocks().unwrap(), 26);

        for address in &addresses {
            store.deallocate(*address).unwrap();
        }
        assert_eq!(store.total_blocks().unwrap(), 128);
        assert_eq!(store.free_blocks().unwrap(), 126);

        for _ in 0..128 {
            addresses.push(store.allocate().unwrap().address());
        }
        assert_eq!(store.total_blocks().unwrap(), 192);
        assert_eq!(store.free_blocks().unwrap(), 61);
    }

    #[test]
    fn accounting_law_under_churn() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let mut rng = 0xD1CE_u64;
        let mut next = move || {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            rng >> 33
        };

        let mut live = Vec::new();
        let mut allocated = 0u32;
        let mut freed = 0u32;
        for _ in 0..500 {
            if next() % 3 != 0 || live.is_empty() {
                live.push(store.allocate().unwrap().address());
                allocated += 1;
            } else {
                let idx = (next() as usize) % live.len();
                store.deallocate(live.swap_remove(idx)).unwrap();
                freed += 1;
            }
            let groups = store.total_blocks().unwrap() / 64;
            assert_eq!(
                store.free_blocks().unwrap() + (allocated - freed) + groups,
                store.total_blocks().unwrap()
            );
        }
    }

    #[test]
    fn reopen_preserves_accounting() {
        let file = NamedTempFile::new().unwrap();
        {
            let store = open_store(&file);
            for _ in 0..100 {
                store.allocate().unwrap();
            }
            assert_eq!(store.total_blocks().unwrap(), 128);
            assert_eq!(store.free_blocks().unwrap(), 26);
        }

        let store = open_store(&file);
        assert_eq!(store.total_blocks().unwrap(), 128);
        assert_eq!(store.free_blocks().unwrap(), 26);
    }

    #[test]
    fn write_and_read_data() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let block = store.allocate().unwrap();
        block.write(&[1, 2, 3, 4]).unwrap();

        let again = store.get(block.address()).unwrap();
        let read = again.read().unwrap();
        assert_eq!(read.len(), 64);
        assert_eq!(&read[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn short_write_leaves_tail_untouched() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let block = store.allocate().unwrap();
        block.write(&[0xAA; 64]).unwrap();
        block.write(&[1, 2, 3, 4]).unwrap();

        let read = block.read().unwrap();
        assert_eq!(&read[..4], &[1, 2, 3, 4]);
        assert!(read[4..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn int_round_trip_and_bounds() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let block = store.allocate().unwrap();
        block.write_i32(0, -77).unwrap();
        block.write_i32(60, i32::MAX).unwrap();
        assert_eq!(block.read_i32(0).unwrap(), -77);
        assert_eq!(block.read_i32(60).unwrap(), i32::MAX);

        assert!(matches!(
            block.write_i32(61, 1),
            Err(SfvfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            block.read_i32(64),
            Err(SfvfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn oversized_write_rejected() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let block = store.allocate().unwrap();
        assert!(matches!(
            block.write(&[0u8; 65]),
            Err(SfvfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn invalid_addresses_rejected() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        assert!(matches!(
            store.get(LogicalAddress::NULL),
            Err(SfvfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.get(LogicalAddress(5)),
            Err(SfvfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.get(LogicalAddress(20 * 1024)),
            Err(SfvfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn double_free_rejected() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let block = store.allocate().unwrap();
        let address = block.address();
        store.deallocate(address).unwrap();
        assert!(matches!(
            store.deallocate(address),
            Err(SfvfsError::InvalidState(_))
        ));
    }

    #[test]
    fn stale_handle_after_compact() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        let keep = store.allocate().unwrap();
        let drop_me = store.allocate().unwrap().address();
        store.deallocate(drop_me).unwrap();

        store.compact().unwrap();
        assert!(matches!(
            keep.read(),
            Err(SfvfsError::StaleHandle { seen: 0, current: 1 })
        ));
        assert!(matches!(
            keep.write(&[1]),
            Err(SfvfsError::StaleHandle { .. })
        ));
        assert!(matches!(keep.clear(), Err(SfvfsError::StaleHandle { .. })));

        // A fresh handle for the same logical address works.
        let fresh = store.get(keep.address()).unwrap();
        fresh.read().unwrap();
    }

    #[test]
    fn wrong_owner_rejected() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);
        let block = store.allocate().unwrap();

        thread::scope(|scope| {
            scope
                .spawn(|| {
                    assert!(matches!(store.allocate(), Err(SfvfsError::WrongOwner)));
                    assert!(matches!(
                        store.total_blocks(),
                        Err(SfvfsError::WrongOwner)
                    ));
                    assert!(matches!(block.read(), Err(SfvfsError::WrongOwner)));
                })
                .join()
                .unwrap();
        });

        // Still usable from the owning thread.
        block.read().unwrap();
    }

    #[test]
    fn out_of_space_at_max_blocks() {
        let file = NamedTempFile::new().unwrap();
        let config = StoreConfig {
            block_size: 64,
            max_blocks: 128,
            free_groups_cache_size: 1,
            free_address_cache_size: 16,
            mode: sfvfs_types::AccessMode::ReadWrite,
        };
        let store = BlockStore::open(file.path(), config).unwrap();

        for _ in 0..126 {
            store.allocate().unwrap();
        }
        assert!(matches!(
            store.allocate(),
            Err(SfvfsError::OutOfSpace { max_blocks: 128 })
        ));
    }

    #[test]
    fn durable_mode_smoke() {
        let file = NamedTempFile::new().unwrap();
        let config = StoreConfig {
            mode: sfvfs_types::AccessMode::ReadWriteData,
            ..test_config()
        };
        let store = BlockStore::open(file.path(), config).unwrap();
        let block = store.allocate().unwrap();
        block.write(&[9, 8, 7]).unwrap();
        assert_eq!(&block.read().unwrap()[..3], &[9, 8, 7]);
    }

    #[test]
    fn space_bytes_use_total_blocks() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);
        store.allocate().unwrap();

        // Capacity is total blocks times block size, independent of how
        // many happen to be free.
        assert_eq!(store.total_space_bytes().unwrap(), 64 * 64);
        assert_eq!(store.free_space_bytes().unwrap(), 62 * 64);
    }

    #[test]
    fn block_usage_reports_per_group_free_counts() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file);

        for _ in 0..70 {
            store.allocate().unwrap();
        }
        let usage = store.block_usage().unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0], (GroupId(0), 0));
        assert_eq!(usage[1], (GroupId(1), 56));
        assert_eq!(
            usage.iter().map(|(_, free)| free).sum::<u32>(),
            store.free_blocks().unwrap()
        );
    }

    #[test]
    fn config_rejected_up_front() {
        let file = NamedTempFile::new().unwrap();
        let config = StoreConfig {
            block_size: 48,
            ..test_config()
        };
        assert!(matches!(
            BlockStore::open(file.path(), config),
            Err(SfvfsError::InvalidArgument(_))
        ));
    }
}
