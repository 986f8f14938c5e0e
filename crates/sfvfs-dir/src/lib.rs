#![forbid(unsafe_code)]
//! Adaptive plain/indexed directories.
//!
//! A directory root block holds a flags word and head pointers into
//! entity lists: chains of blocks packing `(target, flags, name)` entries.
//! Small directories keep every entry on one chain ("plain"); past a
//! configured size the directory re-routes entries into hash buckets
//! ("indexed"), one chain per bucket. The bucket for a name is derived
//! from the first four bytes of its SHA-256 digest, big-endian, modulo
//! the bucket count; this mapping is part of the container format.

use sfvfs_block::BlockStore;
use sfvfs_error::{Result, SfvfsError};
use sfvfs_types::{read_be_i32, write_be_u32, LogicalAddress, PTR_LEN};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Default ceiling on entry-name length, in bytes.
pub const DEFAULT_MAX_NAME_LEN: usize = 255;

/// Default directory size at which a plain directory becomes indexed.
pub const DEFAULT_INDEX_THRESHOLD: u32 = 40;

// Root block slots.
const FLAGS_IDX: usize = 0;
const FIRST_LIST_IDX: usize = 1;

// Entity-list block slots.
const SIZE_IDX: usize = 0;
const NEXT_IDX: usize = 1;
const FIRST_ENTRY_OFFSET: usize = 2 * PTR_LEN;

/// Fixed bytes per entry before the name: target address, flags byte,
/// name-length byte.
const ENTRY_OVERHEAD: usize = PTR_LEN + 2;

/// Root flags bit 0: entries are distributed over hash buckets.
const FLAG_INDEXED: u32 = 0x1;

// ── Entry flags ─────────────────────────────────────────────────────────────

/// Per-entry flags byte. Bit 0: the entry names a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryEntryFlags(u8);

impl DirectoryEntryFlags {
    const DIRECTORY: u8 = 0x1;

    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_directory(self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }

    pub fn set_directory(&mut self, directory: bool) {
        if directory {
            self.0 |= Self::DIRECTORY;
        } else {
            self.0 &= !Self::DIRECTORY;
        }
    }
}

/// One listed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub address: LogicalAddress,
    pub flags: DirectoryEntryFlags,
    /// Root block address of the directory this entry was read from; a
    /// plain back-reference, not an ownership edge.
    pub parent_address: LogicalAddress,
}

impl DirEntry {
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.flags.is_directory()
    }
}

// ── Raw entry codec ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RawEntry {
    address: u32,
    flags: u8,
    name: Vec<u8>,
}

impl RawEntry {
    /// Entry bytes on disk, separator excluded.
    fn len(&self) -> usize {
        ENTRY_OVERHEAD + self.name.len()
    }
}

/// Parse the entry at `offset`; `Ok(None)` at the zero terminator or when
/// no entry header fits before the block end.
fn read_entry_at(buf: &[u8], offset: usize) -> Result<Option<RawEntry>> {
    if buf.len().saturating_sub(offset) < PTR_LEN {
        return Ok(None);
    }
    let address = read_be_i32(buf, offset);
    if address == 0 {
        return Ok(None);
    }
    if address < 0 {
        return Err(SfvfsError::invalid_state(format!(
            "directory entry holds negative target address {address}"
        )));
    }
    if buf.len() - offset < ENTRY_OVERHEAD {
        return Err(SfvfsError::invalid_state(
            "directory entry header truncated by block end",
        ));
    }
    let flags = buf[offset + PTR_LEN];
    let name_len = buf[offset + PTR_LEN + 1] as usize;
    let name_start = offset + ENTRY_OVERHEAD;
    if name_start + name_len > buf.len() {
        return Err(SfvfsError::invalid_state(
            "directory entry name truncated by block end",
        ));
    }
    #[expect(clippy::cast_sign_loss)]
    let address = address as u32;
    Ok(Some(RawEntry {
        address,
        flags,
        name: buf[name_start..name_start + name_len].to_vec(),
    }))
}

fn write_entry_at(buf: &mut [u8], offset: usize, entry: &RawEntry) {
    write_be_u32(buf, offset, entry.address);
    buf[offset + PTR_LEN] = entry.flags;
    #[expect(clippy::cast_possible_truncation)]
    let name_len = entry.name.len() as u8;
    buf[offset + PTR_LEN + 1] = name_len;
    buf[offset + ENTRY_OVERHEAD..offset + ENTRY_OVERHEAD + entry.name.len()]
        .copy_from_slice(&entry.name);
}

fn valid_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'$' | b'{' | b'}' | b'-' | b'_' | b'.')
}

// Addresses are bounded by max_blocks and never wrap.
#[expect(clippy::cast_possible_wrap)]
fn addr_to_i32(address: LogicalAddress) -> i32 {
    address.0 as i32
}

/// Read a pointer slot, rejecting negative on-disk values.
fn ptr_at(buf: &[u8], slot: usize) -> Result<u32> {
    let value = read_be_i32(buf, slot * PTR_LEN);
    if value < 0 {
        return Err(SfvfsError::invalid_state(format!(
            "directory slot {slot} holds negative pointer {value}"
        )));
    }
    #[expect(clippy::cast_sign_loss)]
    let value = value as u32;
    Ok(value)
}

// ── Directory ───────────────────────────────────────────────────────────────

/// On-disk layout of a directory, decoded from the root flags word.
/// Promotion from `Plain` to `Indexed` is one-shot; there is no way back.
#[derive(Debug, Clone, Copy)]
enum Layout {
    /// Every entry lives on the single chain at the root's first slot.
    Plain { head: LogicalAddress },
    /// One optional chain per hash bucket.
    Indexed,
}

/// Directory over a root block in a [`BlockStore`].
///
/// Holds the root's logical address rather than a block handle, so a
/// directory stays usable across a compaction.
#[derive(Debug, Clone)]
pub struct Directory<'s> {
    store: &'s BlockStore,
    address: LogicalAddress,
    max_name_len: usize,
    index_threshold: u32,
    last_list_idx: usize,
}

impl<'s> Directory<'s> {
    pub fn new(
        store: &'s BlockStore,
        address: LogicalAddress,
        max_name_len: usize,
        index_threshold: u32,
    ) -> Result<Self> {
        if max_name_len == 0 || max_name_len > 255 {
            return Err(SfvfsError::invalid_argument(format!(
                "max name length {max_name_len} is outside 1..=255"
            )));
        }
        if index_threshold == 0 {
            return Err(SfvfsError::invalid_argument(
                "index threshold must be at least 1",
            ));
        }
        let block_size = store.block_size();
        if block_size < 2 * max_name_len {
            return Err(SfvfsError::invalid_argument(format!(
                "block size {block_size} must be at least twice the max name length {max_name_len}"
            )));
        }
        // Resolving validates that the address is non-null and mapped.
        store.get(address)?;
        Ok(Self {
            store,
            address,
            max_name_len,
            index_threshold,
            last_list_idx: block_size / PTR_LEN - 1,
        })
    }

    /// Logical address of the root block.
    #[must_use]
    pub fn root_address(&self) -> LogicalAddress {
        self.address
    }

    /// Initialise an empty plain directory in the root block.
    pub fn create(&self) -> Result<()> {
        let root = self.store.get(self.address)?;
        root.clear()?;

        let head = self.store.allocate()?;
        head.clear()?;
        root.write_i32(FIRST_LIST_IDX * PTR_LEN, addr_to_i32(head.address()))?;

        debug!(
            target: "sfvfs::dir",
            event = "create",
            directory = self.address.0,
            head = head.address().0
        );
        Ok(())
    }

    /// Number of entries.
    pub fn size(&self) -> Result<u32> {
        let mut total = 0;
        for head in self.list_heads()? {
            total += EntityList { dir: self, head }.size()?;
        }
        Ok(total)
    }

    /// Look a name up; `Ok(None)` when absent.
    pub fn find(&self, name: &str) -> Result<Option<DirEntry>> {
        let Some(list) = self.lookup_list(name.as_bytes())? else {
            return Ok(None);
        };
        let mut entries = RawEntries::new(self.store, list.head)?;
        while let Some(raw) = entries.next_entry()? {
            if raw.name == name.as_bytes() {
                return Ok(Some(self.to_dir_entry(raw)?));
            }
        }
        Ok(None)
    }

    /// Add an entry. The name must be non-empty, at most the configured
    /// length, match `[A-Za-z0-9${}\-_.]+`, and not already be present.
    pub fn add(
        &self,
        name: &str,
        address: LogicalAddress,
        flags: DirectoryEntryFlags,
    ) -> Result<()> {
        self.check_name(name)?;
        if address.is_null() {
            return Err(SfvfsError::invalid_argument(
                "entry target address must not be null",
            ));
        }
        if self.find(name)?.is_some() {
            return Err(SfvfsError::invalid_state(format!(
                "entry \"{name}\" already exists in directory {}",
                self.address
            )));
        }

        let list = self.ensure_list(name.as_bytes())?;
        list.add(&RawEntry {
            address: address.0,
            flags: flags.bits(),
            name: name.as_bytes().to_vec(),
        })?;

        self.try_promote()
    }

    /// Remove an entry; removing an absent name is a no-op.
    pub fn remove(&self, name: &str) -> Result<()> {
        let Some(list) = self.lookup_list(name.as_bytes())? else {
            return Ok(());
        };
        if !list.remove(name.as_bytes())? {
            return Ok(());
        }

        if self.is_indexed()? && list.size()? == 0 {
            let slot = self.bucket_slot(name.as_bytes());
            list.delete()?;
            self.store
                .get(self.address)?
                .write_i32(slot * PTR_LEN, 0)?;
            debug!(
                target: "sfvfs::dir",
                event = "bucket_drop",
                directory = self.address.0,
                bucket = slot,
                head = list.head.0
            );
        }
        Ok(())
    }

    /// Lazy iterator over every entry, bucket by bucket. Each step loads
    /// at most one more block.
    pub fn list(&self) -> Result<DirectoryIter<'s>> {
        Ok(DirectoryIter {
            store: self.store,
            parent: self.address,
            heads: self.list_heads()?.into_iter(),
            current: None,
        })
    }

    /// Delete the directory. It must be empty.
    pub fn delete(self) -> Result<()> {
        let size = self.size()?;
        if size != 0 {
            return Err(SfvfsError::invalid_state(format!(
                "directory {} is not empty: {size} entries",
                self.address
            )));
        }
        for head in self.list_heads()? {
            EntityList { dir: &self, head }.delete()?;
        }
        self.store.deallocate(self.address)?;
        debug!(target: "sfvfs::dir", event = "delete", directory = self.address.0);
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────────

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(SfvfsError::invalid_argument("name must not be empty"));
        }
        if name.len() > self.max_name_len {
            return Err(SfvfsError::invalid_argument(format!(
                "name \"{name}\" is longer than {} bytes",
                self.max_name_len
            )));
        }
        if !name.bytes().all(valid_name_byte) {
            return Err(SfvfsError::invalid_argument(format!(
                "name \"{name}\" contains characters outside [A-Za-z0-9${{}}-_.]"
            )));
        }
        Ok(())
    }

    /// Decode the root block's layout tag.
    fn layout(&self) -> Result<Layout> {
        let buf = self.store.get(self.address)?.read()?;
        let bits = read_be_i32(&buf, FLAGS_IDX * PTR_LEN);
        if bits < 0 {
            return Err(SfvfsError::invalid_state(format!(
                "directory {} holds negative flags {bits}",
                self.address
            )));
        }
        #[expect(clippy::cast_sign_loss)]
        let flags = bits as u32;
        if flags & FLAG_INDEXED != 0 {
            return Ok(Layout::Indexed);
        }
        let head = ptr_at(&buf, FIRST_LIST_IDX)?;
        if head == 0 {
            return Err(SfvfsError::invalid_state(format!(
                "directory {} has no entity list; was it created?",
                self.address
            )));
        }
        Ok(Layout::Plain {
            head: LogicalAddress(head),
        })
    }

    fn is_indexed(&self) -> Result<bool> {
        Ok(matches!(self.layout()?, Layout::Indexed))
    }

    /// Bucket slot for a name: first four SHA-256 digest bytes, big-endian,
    /// modulo the bucket count, shifted past the flags slot.
    fn bucket_slot(&self, name: &[u8]) -> usize {
        let digest = Sha256::digest(name);
        let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        #[expect(clippy::cast_possible_truncation)]
        let buckets = self.last_list_idx as u32;
        (hash % buckets) as usize + FIRST_LIST_IDX
    }

    fn list_heads(&self) -> Result<Vec<LogicalAddress>> {
        let buf = self.store.get(self.address)?.read()?;
        let mut heads = Vec::new();
        for slot in FIRST_LIST_IDX..=self.last_list_idx {
            let ptr = ptr_at(&buf, slot)?;
            if ptr != 0 {
                heads.push(LogicalAddress(ptr));
            }
        }
        Ok(heads)
    }

    /// The list a name belongs to, if it exists.
    fn lookup_list(&self, name: &[u8]) -> Result<Option<EntityList<'_, 's>>> {
        match self.layout()? {
            Layout::Plain { head } => Ok(Some(EntityList { dir: self, head })),
            Layout::Indexed => {
                let slot = self.bucket_slot(name);
                let ptr = ptr_at(&self.store.get(self.address)?.read()?, slot)?;
                if ptr == 0 {
                    return Ok(None);
                }
                Ok(Some(EntityList {
                    dir: self,
                    head: LogicalAddress(ptr),
                }))
            }
        }
    }

    /// The list a name belongs to, creating its bucket lazily.
    fn ensure_list(&self, name: &[u8]) -> Result<EntityList<'_, 's>> {
        if let Some(list) = self.lookup_list(name)? {
            return Ok(list);
        }
        // Only an indexed directory can lack the bucket.
        let slot = self.bucket_slot(name);
        let head = self.store.allocate()?;
        head.clear()?;
        self.store
            .get(self.address)?
            .write_i32(slot * PTR_LEN, addr_to_i32(head.address()))?;
        debug!(
            target: "sfvfs::dir",
            event = "bucket_create",
            directory = self.address.0,
            bucket = slot,
            head = head.address().0
        );
        Ok(EntityList {
            dir: self,
            head: head.address(),
        })
    }

    /// Promote a plain directory to indexed once it reaches the
    /// configured threshold. One-shot; there is no way back.
    fn try_promote(&self) -> Result<()> {
        let Layout::Plain { head } = self.layout()? else {
            return Ok(());
        };
        let plain = EntityList { dir: self, head };
        let size = plain.size()?;
        if size < self.index_threshold {
            return Ok(());
        }

        // Re-route every entry through the bucket hash into fresh lists.
        let mut buckets: BTreeMap<usize, EntityList<'_, 's>> = BTreeMap::new();
        let mut entries = RawEntries::new(self.store, plain.head)?;
        while let Some(entry) = entries.next_entry()? {
            let slot = self.bucket_slot(&entry.name);
            let list = if let Some(list) = buckets.get(&slot) {
                *list
            } else {
                let fresh = self.store.allocate()?;
                fresh.clear()?;
                let list = EntityList {
                    dir: self,
                    head: fresh.address(),
                };
                buckets.insert(slot, list);
                list
            };
            list.add(&entry)?;
        }

        plain.delete()?;

        // Rewrite the root in one shot: indexed flag plus bucket heads.
        let mut rebuilt = vec![0u8; self.store.block_size()];
        write_be_u32(&mut rebuilt, FLAGS_IDX * PTR_LEN, FLAG_INDEXED);
        for (slot, list) in &buckets {
            write_be_u32(&mut rebuilt, slot * PTR_LEN, list.head.0);
        }
        self.store.get(self.address)?.write(&rebuilt)?;

        debug!(
            target: "sfvfs::dir",
            event = "promote",
            directory = self.address.0,
            entries = size,
            buckets = buckets.len()
        );
        Ok(())
    }

    fn to_dir_entry(&self, raw: RawEntry) -> Result<DirEntry> {
        let name = String::from_utf8(raw.name).map_err(|_| {
            SfvfsError::invalid_state(format!(
                "directory {} holds a non-UTF-8 entry name",
                self.address
            ))
        })?;
        Ok(DirEntry {
            name,
            address: LogicalAddress(raw.address),
            flags: DirectoryEntryFlags::from_bits(raw.flags),
            parent_address: self.address,
        })
    }
}

// ── Entity lists ────────────────────────────────────────────────────────────

/// One chain of entry blocks. The head block's size slot counts entries
/// across the whole chain.
#[derive(Debug, Clone, Copy)]
struct EntityList<'d, 's> {
    dir: &'d Directory<'s>,
    head: LogicalAddress,
}

impl EntityList<'_, '_> {
    fn size(&self) -> Result<u32> {
        let size = self
            .dir
            .store
            .get(self.head)?
            .read_i32(SIZE_IDX * PTR_LEN)?;
        if size < 0 {
            return Err(SfvfsError::invalid_state(format!(
                "entity list {} holds negative size {size}",
                self.head
            )));
        }
        #[expect(clippy::cast_sign_loss)]
        let size = size as u32;
        Ok(size)
    }

    fn set_size(&self, size: u32) -> Result<()> {
        #[expect(clippy::cast_possible_wrap)]
        let size = size as i32;
        self.dir
            .store
            .get(self.head)?
            .write_i32(SIZE_IDX * PTR_LEN, size)
    }

    /// Append an entry to the first block with room, linking a fresh
    /// block onto the chain when none has.
    fn add(&self, entry: &RawEntry) -> Result<()> {
        let store = self.dir.store;
        let block_size = store.block_size();
        let entry_len = entry.len();

        let mut current = self.head;
        let mut buf = store.get(current)?.read()?;
        let mut offset = FIRST_ENTRY_OFFSET;
        loop {
            // The strict bound reserves the separator byte after the entry.
            while offset + entry_len < block_size {
                match read_entry_at(&buf, offset)? {
                    Some(existing) => offset += existing.len() + 1,
                    None => break,
                }
            }
            if offset + entry_len < block_size {
                break;
            }

            let next = ptr_at(&buf, NEXT_IDX)?;
            if next != 0 {
                current = LogicalAddress(next);
            } else {
                let fresh = store.allocate()?;
                fresh.clear()?;
                store
                    .get(current)?
                    .write_i32(NEXT_IDX * PTR_LEN, addr_to_i32(fresh.address()))?;
                trace!(
                    target: "sfvfs::dir",
                    event = "list_grow",
                    list = self.head.0,
                    block = fresh.address().0
                );
                current = fresh.address();
            }
            buf = store.get(current)?.read()?;
            offset = FIRST_ENTRY_OFFSET;
        }

        write_entry_at(&mut buf, offset, entry);
        store.get(current)?.write(&buf)?;
        self.set_size(self.size()? + 1)?;
        trace!(
            target: "sfvfs::dir",
            event = "entry_add",
            list = self.head.0,
            block = current.0,
            offset,
            address = entry.address
        );
        Ok(())
    }

    /// Remove the entry with `name`; returns whether it was found. The
    /// containing block is rewritten without it, and an emptied non-head
    /// block is unlinked and freed.
    fn remove(&self, name: &[u8]) -> Result<bool> {
        let store = self.dir.store;

        let mut prev: Option<LogicalAddress> = None;
        let mut current = self.head;
        let mut buf = store.get(current)?.read()?;
        let mut offset = FIRST_ENTRY_OFFSET;
        let target_offset = loop {
            match read_entry_at(&buf, offset)? {
                Some(entry) => {
                    if entry.name == name {
                        break offset;
                    }
                    offset += entry.len() + 1;
                }
                None => {
                    let next = ptr_at(&buf, NEXT_IDX)?;
                    if next == 0 {
                        trace!(
                            target: "sfvfs::dir",
                            event = "entry_remove_missing",
                            list = self.head.0
                        );
                        return Ok(false);
                    }
                    prev = Some(current);
                    current = LogicalAddress(next);
                    buf = store.get(current)?.read()?;
                    offset = FIRST_ENTRY_OFFSET;
                }
            }
        };

        // Rebuild the block without the entry, keeping size and next.
        let mut rebuilt = vec![0u8; buf.len()];
        rebuilt[..FIRST_ENTRY_OFFSET].copy_from_slice(&buf[..FIRST_ENTRY_OFFSET]);
        let mut src = FIRST_ENTRY_OFFSET;
        let mut dst = FIRST_ENTRY_OFFSET;
        while let Some(entry) = read_entry_at(&buf, src)? {
            if src != target_offset {
                write_entry_at(&mut rebuilt, dst, &entry);
                dst += entry.len() + 1;
            }
            src += entry.len() + 1;
        }

        match prev {
            Some(prev_addr) if dst == FIRST_ENTRY_OFFSET => {
                // Block emptied and not the chain head: unlink it.
                let next = ptr_at(&buf, NEXT_IDX)?;
                #[expect(clippy::cast_possible_wrap)]
                let next_i32 = next as i32;
                store
                    .get(prev_addr)?
                    .write_i32(NEXT_IDX * PTR_LEN, next_i32)?;
                store.deallocate(current)?;
                trace!(
                    target: "sfvfs::dir",
                    event = "list_shrink",
                    list = self.head.0,
                    gone = current.0,
                    next
                );
            }
            _ => {
                store.get(current)?.write(&rebuilt)?;
                trace!(
                    target: "sfvfs::dir",
                    event = "entry_remove",
                    list = self.head.0,
                    block = current.0
                );
            }
        }

        self.set_size(self.size()? - 1)?;
        Ok(true)
    }

    /// Free the whole chain.
    fn delete(&self) -> Result<()> {
        let store = self.dir.store;
        let mut current = self.head;
        loop {
            let next = ptr_at(&store.get(current)?.read()?, NEXT_IDX)?;
            store.deallocate(current)?;
            if next == 0 {
                return Ok(());
            }
            current = LogicalAddress(next);
        }
    }
}

// ── Iteration ───────────────────────────────────────────────────────────────

/// Lazy raw-entry producer over one entity-list chain.
#[derive(Debug)]
struct RawEntries<'s> {
    store: &'s BlockStore,
    buf: Option<Vec<u8>>,
    offset: usize,
}

impl<'s> RawEntries<'s> {
    fn new(store: &'s BlockStore, head: LogicalAddress) -> Result<Self> {
        Ok(Self {
            store,
            buf: Some(store.get(head)?.read()?),
            offset: FIRST_ENTRY_OFFSET,
        })
    }

    fn next_entry(&mut self) -> Result<Option<RawEntry>> {
        loop {
            let Some(buf) = &self.buf else {
                return Ok(None);
            };
            if let Some(entry) = read_entry_at(buf, self.offset)? {
                self.offset += entry.len() + 1;
                return Ok(Some(entry));
            }
            let next = ptr_at(buf, NEXT_IDX)?;
            if next == 0 {
                self.buf = None;
                return Ok(None);
            }
            self.buf = Some(self.store.get(LogicalAddress(next))?.read()?);
            self.offset = FIRST_ENTRY_OFFSET;
        }
    }
}

/// Iterator over every entry of a directory, one bucket chain at a time.
///
/// Finite and not restartable; loads at most one block per step.
#[derive(Debug)]
pub struct DirectoryIter<'s> {
    store: &'s BlockStore,
    parent: LogicalAddress,
    heads: std::vec::IntoIter<LogicalAddress>,
    current: Option<RawEntries<'s>>,
}

impl Iterator for DirectoryIter<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entries) = &mut self.current {
                match entries.next_entry() {
                    Ok(Some(raw)) => {
                        let converted = String::from_utf8(raw.name)
                            .map(|name| DirEntry {
                                name,
                                address: LogicalAddress(raw.address),
                                flags: DirectoryEntryFlags::from_bits(raw.flags),
                                parent_address: self.parent,
                            })
                            .map_err(|_| {
                                SfvfsError::invalid_state("non-UTF-8 entry name in directory")
                            });
                        return Some(converted);
                    }
                    Ok(None) => self.current = None,
                    Err(e) => {
                        self.current = None;
                        return Some(Err(e));
                    }
                }
            }
            match self.heads.next() {
                Some(head) => match RawEntries::new(self.store, head) {
                    Ok(entries) => self.current = Some(entries),
                    Err(e) => return Some(Err(e)),
                },
                None => return None,
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
