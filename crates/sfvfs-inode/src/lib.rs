#![forbid(unsafe_code)]
//! Regular files as chained sequences of blocks.
//!
//! An inode block is an array of 4-byte slots: flags, total size, a
//! shortcut to the last inode block in the chain (the latter two
//! meaningful only in the root), a dense prefix of data-block pointers,
//! and a trailing pointer to the next inode block. Appending and reading
//! go through streams; at most one stream may be open per inode, enforced
//! by a lock bit in the flags word.

use sfvfs_block::BlockStore;
use sfvfs_error::{Result, SfvfsError};
use sfvfs_types::{read_be_i32, write_be_u32, LogicalAddress, PTR_LEN};
use tracing::trace;

const FLAGS_IDX: usize = 0;
const SIZE_IDX: usize = 1;
const LAST_INODE_IDX: usize = 2;
const FIRST_DATA_IDX: usize = 3;

// ── Flags ───────────────────────────────────────────────────────────────────

/// Bit 0: the trailing data block is full, the next append must start a
/// fresh one. Bit 1: a stream is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct InodeFlags(u32);

impl InodeFlags {
    const TRAILING_FULL: u32 = 0x1;
    const LOCKED: u32 = 0x2;

    fn is_trailing_full(self) -> bool {
        self.0 & Self::TRAILING_FULL != 0
    }

    fn set_trailing_full(&mut self, full: bool) {
        if full {
            self.0 |= Self::TRAILING_FULL;
        } else {
            self.0 &= !Self::TRAILING_FULL;
        }
    }

    fn is_locked(self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    fn set_locked(&mut self, locked: bool) {
        if locked {
            self.0 |= Self::LOCKED;
        } else {
            self.0 &= !Self::LOCKED;
        }
    }

    fn bits(self) -> i32 {
        #[expect(clippy::cast_possible_wrap)]
        let bits = self.0 as i32;
        bits
    }
}

/// Read a pointer slot, rejecting negative on-disk values.
fn ptr_at(buf: &[u8], slot: usize) -> Result<u32> {
    let value = read_be_i32(buf, slot * PTR_LEN);
    if value < 0 {
        return Err(SfvfsError::invalid_state(format!(
            "inode slot {slot} holds negative pointer {value}"
        )));
    }
    #[expect(clippy::cast_sign_loss)]
    let value = value as u32;
    Ok(value)
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// One regular file: a root block plus a chain of overflow inode blocks.
///
/// Holds the root's logical address rather than a block handle, so an
/// inode stays usable across a compaction; each operation resolves a
/// fresh handle.
#[derive(Debug, Clone)]
pub struct Inode<'s> {
    store: &'s BlockStore,
    address: LogicalAddress,
    slots: usize,
}

impl<'s> Inode<'s> {
    pub fn new(store: &'s BlockStore, address: LogicalAddress) -> Result<Self> {
        // Resolving validates that the address is non-null and mapped.
        store.get(address)?;
        Ok(Self {
            store,
            address,
            slots: store.block_size() / PTR_LEN,
        })
    }

    /// Logical address of the root block.
    #[must_use]
    pub fn address(&self) -> LogicalAddress {
        self.address
    }

    /// Total file size in bytes.
    pub fn size(&self) -> Result<u64> {
        let size = self.store.get(self.address)?.read_i32(SIZE_IDX * PTR_LEN)?;
        if size < 0 {
            return Err(SfvfsError::invalid_state(format!(
                "inode {} holds negative size {size}",
                self.address
            )));
        }
        #[expect(clippy::cast_sign_loss)]
        let size = size as u32;
        Ok(u64::from(size))
    }

    /// Address of the next inode block in the chain, or null. Diagnostic
    /// accessor for chain-walking tests.
    pub fn next_inode_address(&self) -> Result<LogicalAddress> {
        let buf = self.store.get(self.address)?.read()?;
        Ok(LogicalAddress(ptr_at(&buf, self.next_idx())?))
    }

    /// Open a sequential reader over the file contents.
    pub fn read_stream(&self) -> Result<InodeReader<'_, 's>> {
        self.lock()?;
        let buf = self.store.get(self.address)?.read()?;
        let remaining = self.size()?;
        Ok(InodeReader {
            inode: self,
            inode_buf: buf,
            slot: FIRST_DATA_IDX - 1,
            data_buf: None,
            data_pos: 0,
            remaining,
            closed: false,
        })
    }

    /// Open an append-only writer positioned at the end of the file.
    pub fn append_stream(&self) -> Result<InodeAppender<'_, 's>> {
        self.lock()?;

        // Last inode block: take the root's shortcut, then follow next
        // pointers in case it lags behind.
        let root_buf = self.store.get(self.address)?.read()?;
        let shortcut = ptr_at(&root_buf, LAST_INODE_IDX)?;
        let (mut inode_addr, mut inode_buf) = if shortcut == 0 {
            (self.address, root_buf)
        } else {
            let addr = LogicalAddress(shortcut);
            (addr, self.store.get(addr)?.read()?)
        };
        loop {
            let next = ptr_at(&inode_buf, self.next_idx())?;
            if next == 0 {
                break;
            }
            inode_addr = LogicalAddress(next);
            inode_buf = self.store.get(inode_addr)?.read()?;
        }

        // Highest occupied data slot; pointers form a dense prefix.
        let mut data_slot = FIRST_DATA_IDX;
        let mut data_addr = 0u32;
        for slot in FIRST_DATA_IDX..self.next_idx() {
            let ptr = ptr_at(&inode_buf, slot)?;
            if ptr == 0 {
                break;
            }
            data_addr = ptr;
            data_slot = slot;
        }

        let size = self.size()?;
        let flags = self.flags()?;
        let block_size = self.store.block_size();

        if data_addr == 0 {
            data_slot = FIRST_DATA_IDX;
            data_addr = self.store.allocate()?.address().0;
        }
        #[expect(clippy::cast_possible_truncation)]
        let mut data_pos = (size % block_size as u64) as usize;
        if flags.is_trailing_full() {
            data_slot += 1;
            data_addr = self.store.allocate()?.address().0;
            data_pos = 0;
        }

        let data_addr = LogicalAddress(data_addr);
        let data_buf = self.store.get(data_addr)?.read()?;
        Ok(InodeAppender {
            inode: self,
            inode_addr,
            inode_buf,
            data_slot,
            data_addr,
            data_buf,
            data_pos,
            data_saved: data_pos,
            size,
            closed: false,
        })
    }

    /// Free every data and overflow block, zero the root, and reset the
    /// size to 0.
    pub fn clear(&self) -> Result<()> {
        self.release_blocks(false)
    }

    /// Free the whole chain, root block included.
    pub fn delete(self) -> Result<()> {
        self.release_blocks(true)
    }

    fn release_blocks(&self, remove_root: bool) -> Result<()> {
        let mut current = self.address;
        loop {
            let buf = self.store.get(current)?.read()?;
            for slot in FIRST_DATA_IDX..self.next_idx() {
                let ptr = ptr_at(&buf, slot)?;
                if ptr == 0 {
                    break;
                }
                self.store.deallocate(LogicalAddress(ptr))?;
            }
            let next = ptr_at(&buf, self.next_idx())?;
            if current != self.address {
                self.store.deallocate(current)?;
            }
            if next == 0 {
                break;
            }
            current = LogicalAddress(next);
        }

        if remove_root {
            self.store.deallocate(self.address)?;
        } else {
            self.store.get(self.address)?.clear()?;
        }
        trace!(
            target: "sfvfs::inode",
            event = if remove_root { "delete" } else { "clear" },
            inode = self.address.0
        );
        Ok(())
    }

    fn next_idx(&self) -> usize {
        self.slots - 1
    }

    fn flags(&self) -> Result<InodeFlags> {
        let bits = self.store.get(self.address)?.read_i32(FLAGS_IDX * PTR_LEN)?;
        if bits < 0 {
            return Err(SfvfsError::invalid_state(format!(
                "inode {} holds negative flags {bits}",
                self.address
            )));
        }
        #[expect(clippy::cast_sign_loss)]
        let bits = bits as u32;
        Ok(InodeFlags(bits))
    }

    /// Claim the single-stream lock.
    fn lock(&self) -> Result<()> {
        let root = self.store.get(self.address)?;
        let mut flags = self.flags()?;
        if flags.is_locked() {
            return Err(SfvfsError::invalid_state(format!(
                "a stream is already open on inode {}",
                self.address
            )));
        }
        flags.set_locked(true);
        root.write_i32(FLAGS_IDX * PTR_LEN, flags.bits())
    }
}

// ── Read stream ─────────────────────────────────────────────────────────────

/// Sequential reader; yields exactly `size` bytes in chain order.
///
/// Dropping without [`InodeReader::close`] releases the inode lock on a
/// best-effort basis; `close` surfaces the error instead.
#[derive(Debug)]
pub struct InodeReader<'i, 's> {
    inode: &'i Inode<'s>,
    inode_buf: Vec<u8>,
    slot: usize,
    data_buf: Option<Vec<u8>>,
    data_pos: usize,
    remaining: u64,
    closed: bool,
}

impl InodeReader<'_, '_> {
    /// Next byte, or `None` at end of file.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.closed {
            return Err(SfvfsError::invalid_state("read on closed stream"));
        }
        if self.remaining == 0 {
            return Ok(None);
        }

        if self.data_buf.is_none() {
            self.slot += 1;
            let next_idx = self.inode.next_idx();
            let mut addr = ptr_at(&self.inode_buf, self.slot)?;
            if self.slot == next_idx {
                if addr == 0 {
                    return Err(SfvfsError::invalid_state(format!(
                        "inode {} chain ends {} bytes early",
                        self.inode.address, self.remaining
                    )));
                }
                self.inode_buf = self.inode.store.get(LogicalAddress(addr))?.read()?;
                self.slot = FIRST_DATA_IDX;
                addr = ptr_at(&self.inode_buf, self.slot)?;
            }
            if addr == 0 {
                return Err(SfvfsError::invalid_state(format!(
                    "inode {} chain ends {} bytes early",
                    self.inode.address, self.remaining
                )));
            }
            self.data_buf = Some(self.inode.store.get(LogicalAddress(addr))?.read()?);
            self.data_pos = 0;
        }

        let (byte, exhausted) = if let Some(data) = self.data_buf.as_ref() {
            let byte = data[self.data_pos];
            self.data_pos += 1;
            (byte, self.data_pos == data.len())
        } else {
            return Err(SfvfsError::invalid_state("no data block loaded"));
        };
        self.remaining -= 1;
        if exhausted {
            self.data_buf = None;
        }
        Ok(Some(byte))
    }

    /// Fill `buf` as far as the file allows; returns the bytes read,
    /// 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_byte()? {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                None => break,
            }
        }
        Ok(filled)
    }

    /// Read everything left in the stream.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.remaining).unwrap_or(0));
        while let Some(byte) = self.read_byte()? {
            out.push(byte);
        }
        Ok(out)
    }

    /// Release the inode lock.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let root = self.inode.store.get(self.inode.address)?;
        let mut flags = self.inode.flags()?;
        flags.set_locked(false);
        root.write_i32(FLAGS_IDX * PTR_LEN, flags.bits())?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for InodeReader<'_, '_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.release();
        }
    }
}

// ── Append stream ───────────────────────────────────────────────────────────

/// Append-only writer positioned at the end of the file.
///
/// Bytes accumulate in an in-memory copy of the trailing data block;
/// [`InodeAppender::flush`] persists the block and the size counter.
/// Dropping without [`InodeAppender::close`] discards unflushed bytes and
/// releases the lock on a best-effort basis.
#[derive(Debug)]
pub struct InodeAppender<'i, 's> {
    inode: &'i Inode<'s>,
    inode_addr: LogicalAddress,
    inode_buf: Vec<u8>,
    data_slot: usize,
    data_addr: LogicalAddress,
    data_buf: Vec<u8>,
    data_pos: usize,
    data_saved: usize,
    size: u64,
    closed: bool,
}

impl InodeAppender<'_, '_> {
    /// Append one byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        if self.closed {
            return Err(SfvfsError::invalid_state("write on closed stream"));
        }

        if self.data_pos == self.data_buf.len() {
            self.ensure_inode_capacity()?;

            // The trailing block is full: persist it, record its pointer,
            // and start a fresh one.
            self.inode.store.get(self.data_addr)?.write(&self.data_buf)?;
            self.size += (self.data_pos - self.data_saved) as u64;
            write_be_u32(&mut self.inode_buf, self.data_slot * PTR_LEN, self.data_addr.0);
            self.data_slot += 1;

            self.data_addr = self.inode.store.allocate()?.address();
            self.data_buf = vec![0u8; self.inode.store.block_size()];
            self.data_pos = 0;
            self.data_saved = 0;
        }

        self.data_buf[self.data_pos] = byte;
        self.data_pos += 1;
        Ok(())
    }

    /// Append a whole slice.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            self.write_byte(byte)?;
        }
        Ok(())
    }

    /// Persist the trailing data block, the current inode block, and the
    /// size counter.
    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(SfvfsError::invalid_state("flush on closed stream"));
        }
        self.ensure_inode_capacity()?;

        write_be_u32(&mut self.inode_buf, self.data_slot * PTR_LEN, self.data_addr.0);
        self.inode.store.get(self.inode_addr)?.write(&self.inode_buf)?;
        self.inode.store.get(self.data_addr)?.write(&self.data_buf)?;

        self.size += (self.data_pos - self.data_saved) as u64;
        self.data_saved = self.data_pos;

        let size = i32::try_from(self.size).map_err(|_| {
            SfvfsError::invalid_state(format!(
                "inode {} exceeds the 2^31-1 byte size limit",
                self.inode.address
            ))
        })?;
        let root = self.inode.store.get(self.inode.address)?;
        root.write_i32(SIZE_IDX * PTR_LEN, size)?;
        if self.inode_addr == self.inode.address {
            #[expect(clippy::cast_sign_loss)]
            let size = size as u32;
            write_be_u32(&mut self.inode_buf, SIZE_IDX * PTR_LEN, size);
        }
        Ok(())
    }

    /// Flush, recompute the trailing-block-full flag, and release the
    /// inode lock.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.release()
    }

    /// When the current inode block has no data slot left, chain a fresh
    /// one and point the root's last-inode shortcut at it.
    fn ensure_inode_capacity(&mut self) -> Result<()> {
        if self.data_slot != self.inode.next_idx() {
            return Ok(());
        }
        let block = self.inode.store.allocate()?;
        block.clear()?;
        let new_addr = block.address();

        write_be_u32(&mut self.inode_buf, self.inode.next_idx() * PTR_LEN, new_addr.0);
        self.inode.store.get(self.inode_addr)?.write(&self.inode_buf)?;

        // Addresses are bounded by max_blocks and never wrap.
        #[expect(clippy::cast_possible_wrap)]
        let shortcut = new_addr.0 as i32;
        let root = self.inode.store.get(self.inode.address)?;
        root.write_i32(LAST_INODE_IDX * PTR_LEN, shortcut)?;

        trace!(
            target: "sfvfs::inode",
            event = "chain_grow",
            inode = self.inode.address.0,
            block = new_addr.0
        );

        self.inode_addr = new_addr;
        self.inode_buf = vec![0u8; self.inode.store.block_size()];
        self.data_slot = FIRST_DATA_IDX;
        Ok(())
    }

    /// Recompute the trailing-block-full flag from the persisted size and
    /// drop the lock.
    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let size = self.inode.size()?;
        let block_size = self.inode.store.block_size() as u64;
        let root = self.inode.store.get(self.inode.address)?;
        let mut flags = self.inode.flags()?;
        flags.set_trailing_full(size > 0 && size % block_size == 0);
        flags.set_locked(false);
        root.write_i32(FLAGS_IDX * PTR_LEN, flags.bits())?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for InodeAppender<'_, '_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.release();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
