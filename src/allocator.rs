//! Variable-size block allocation inside one file.
//!
//! The file starts with a 24-byte header (`magic`, `block_size`,
//! `free_head`, `root_block`) followed by a contiguous sequence of blocks,
//! each `[u32 stored_size][payload]`. A [`Ptr`] addresses the payload; the
//! size prefix sits four bytes below it. Freed blocks link into a chain
//! anchored at `free_head`, kept sorted by offset and mirrored in memory so
//! that freeing at the end of the file can truncate a whole run of
//! adjacent free blocks without revisiting any of them.
//!
//! The magic doubles as the endianness marker: a reader that sees it
//! byte-swapped treats the file as foreign-endian and swaps every
//! primitive from then on.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::buffered_file::BufferedFile;
use crate::error::{Error, Result};
use crate::wire::Endian;

/// Absolute byte offset into the store file. 0 is null.
pub type Ptr = u64;

pub(crate) const MAGIC: u32 = 0xC0FF_E4DB;

/// magic + block_size + free_head + root_block.
const HEADER_SIZE: u64 = 4 + 4 + 8 + 8;

/// Every block's payload is preceded by its stored size.
const SIZE_PREFIX: u64 = 4;

/// A free block's payload starts with the next free `Ptr`, so payloads can
/// never be smaller than one.
const MIN_PAYLOAD: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Header {
    block_size: u32,
    free_head: Ptr,
    root_block: Ptr,
}

struct Inner {
    file: BufferedFile,
    header: Header,
    /// Mirror of the on-disk free chain: payload ptr -> stored size.
    free: BTreeMap<Ptr, u32>,
}

/// Block allocator over a [`BufferedFile`]. Shared by every B-tree and the
/// named registry of one store; all mutations must run inside a
/// [`Transaction`].
pub struct FileAllocator {
    inner: Mutex<Inner>,
    secure: bool,
}

impl FileAllocator {
    /// Construct over an open file. An empty file gets a fresh header
    /// (committed immediately); otherwise the header is read, the byte
    /// order detected from the magic, and the free chain walked and
    /// validated.
    ///
    /// `block_size` only matters for a fresh file; an existing store keeps
    /// the size it was created with.
    pub fn open(mut file: BufferedFile, block_size: u32, secure: bool) -> Result<FileAllocator> {
        if block_size < MIN_PAYLOAD as u32 {
            return Err(Error::InvalidState("block size must be at least 8 bytes"));
        }
        let (header, free) = if file.size() == 0 {
            let header = Header {
                block_size,
                free_head: 0,
                root_block: 0,
            };
            file.begin()?;
            file.set_size(HEADER_SIZE)?;
            save_header(&mut file, &header)?;
            file.commit()?;
            debug!(block_size, "created store header");
            (header, BTreeMap::new())
        } else {
            let mut raw = [0u8; 4];
            file.read(0, &mut raw)?;
            if Endian::Little.read_u32(&raw) == MAGIC {
                file.set_endian(Endian::Little);
            } else if Endian::Big.read_u32(&raw) == MAGIC {
                file.set_endian(Endian::Big);
            } else {
                return Err(Error::Corrupt("bad store magic"));
            }
            let header = Header {
                block_size: file.read_u32(4)?,
                free_head: file.read_u64(8)?,
                root_block: file.read_u64(16)?,
            };
            if header.block_size < MIN_PAYLOAD as u32 {
                return Err(Error::Corrupt("bad block size in header"));
            }
            if header.block_size != block_size {
                debug!(
                    stored = header.block_size,
                    requested = block_size,
                    "using block size the store was created with"
                );
            }
            let free = walk_free_chain(&mut file, &header)?;
            debug!(
                endian = ?file.endian(),
                block_size = header.block_size,
                free_blocks = free.len(),
                "opened store"
            );
            (header, free)
        };
        Ok(FileAllocator {
            inner: Mutex::new(Inner { file, header, free }),
            secure,
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn block_size(&self) -> u32 {
        self.inner().header.block_size
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn endian(&self) -> Endian {
        self.inner().file.endian()
    }

    pub fn file_size(&self) -> u64 {
        self.inner().file.size()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner().file.in_transaction()
    }

    pub fn root_block(&self) -> Ptr {
        self.inner().header.root_block
    }

    /// Point the user-visible root at another block. Transactional.
    pub fn set_root_block(&self, root_block: Ptr) -> Result<()> {
        let mut inner = self.inner();
        inner.require_transaction()?;
        inner.header.root_block = root_block;
        inner.save()
    }

    /// Round `size` up to whole blocks and hand out a payload pointer,
    /// reusing the first free block that fits before growing the file.
    pub fn alloc(&self, size: usize) -> Result<Ptr> {
        let mut inner = self.inner();
        inner.require_transaction()?;
        let padded = inner.padded(size)?;

        let fit = inner
            .free
            .iter()
            .find(|(_, &stored)| stored as u64 >= padded)
            .map(|(&ptr, &stored)| (ptr, stored));
        if let Some((ptr, stored)) = fit {
            inner.unlink(ptr)?;
            trace!(ptr, stored, requested = padded, "reused free block");
            return Ok(ptr);
        }

        let ptr = inner.file.size() + SIZE_PREFIX;
        inner.file.set_size(ptr + padded)?;
        inner.file.write_u32(ptr - SIZE_PREFIX, padded as u32)?;
        trace!(ptr, size = padded, "appended block");
        Ok(ptr)
    }

    /// Return a block to the store. A block ending at the end of the file
    /// is truncated away, together with any run of free blocks abutting it
    /// from below; anything else links into the free chain. In secure mode
    /// the payload is zeroed before it is relinked.
    pub fn free(&self, ptr: Ptr, size: usize) -> Result<()> {
        let mut inner = self.inner();
        inner.require_transaction()?;
        let padded = inner.padded(size)?;

        if ptr < HEADER_SIZE + SIZE_PREFIX || ptr + padded > inner.file.size() {
            return Err(Error::Corrupt("freed pointer out of range"));
        }
        let stored = inner.file.read_u32(ptr - SIZE_PREFIX)? as u64;
        if stored < padded
            || stored % inner.header.block_size as u64 != 0
            || ptr + stored > inner.file.size()
        {
            return Err(Error::Corrupt("freed block has a bad size prefix"));
        }
        if inner.free.contains_key(&ptr) {
            return Err(Error::Corrupt("block freed twice"));
        }

        // The original clears the user root when its block goes away.
        if inner.header.root_block == ptr {
            inner.header.root_block = 0;
        }

        if ptr + stored == inner.file.size() {
            // Truncate this block and every free block touching it from
            // below.
            let mut cut = ptr - SIZE_PREFIX;
            loop {
                let tail = inner
                    .free
                    .iter()
                    .next_back()
                    .map(|(&tail, &stored)| (tail, stored));
                match tail {
                    Some((tail, stored)) if tail + stored as u64 == cut => {
                        inner.free.remove(&tail);
                        cut = tail - SIZE_PREFIX;
                    }
                    _ => break,
                }
            }
            // The surviving chain lost its suffix.
            match inner.free.iter().next_back().map(|(&p, _)| p) {
                Some(last) => inner.file.write_u64(last, 0)?,
                None => inner.header.free_head = 0,
            }
            inner.file.set_size(cut)?;
            trace!(ptr, cut, "truncated free tail");
        } else {
            if self.secure {
                inner.zero_payload(ptr, stored)?;
            }
            let next = inner
                .free
                .range((Bound::Excluded(ptr), Bound::Unbounded))
                .next()
                .map_or(0, |(&p, _)| p);
            let prev = inner.free.range(..ptr).next_back().map(|(&p, _)| p);
            inner.file.write_u64(ptr, next)?;
            match prev {
                Some(prev) => inner.file.write_u64(prev, ptr)?,
                None => inner.header.free_head = ptr,
            }
            inner.free.insert(ptr, stored as u32);
            trace!(ptr, stored, "linked block into free chain");
        }
        inner.save()
    }

    /// Stored (padded) payload size of an allocated block.
    pub fn stored_size(&self, ptr: Ptr) -> Result<u32> {
        let mut inner = self.inner();
        if ptr < HEADER_SIZE + SIZE_PREFIX {
            return Err(Error::Corrupt("block pointer out of range"));
        }
        let stored = inner.file.read_u32(ptr - SIZE_PREFIX)?;
        if stored as u64 % inner.header.block_size as u64 != 0
            || ptr + stored as u64 > inner.file.size()
        {
            return Err(Error::Corrupt("block has a bad size prefix"));
        }
        Ok(stored)
    }

    pub fn read(&self, ptr: Ptr, buf: &mut [u8]) -> Result<()> {
        self.inner().file.read(ptr, buf)
    }

    pub fn write(&self, ptr: Ptr, buf: &[u8]) -> Result<()> {
        self.inner().file.write(ptr, buf)
    }

    /// Begin a transaction and hand back its guard.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.inner().file.begin()?;
        Ok(Transaction {
            alloc: self,
            done: false,
        })
    }
}

impl Inner {
    fn require_transaction(&self) -> Result<()> {
        if !self.file.in_transaction() {
            return Err(Error::InvalidState("mutation outside a transaction"));
        }
        Ok(())
    }

    fn padded(&self, size: usize) -> Result<u64> {
        let block_size = self.header.block_size as u64;
        let wanted = (size as u64).max(MIN_PAYLOAD);
        let padded = wanted.div_ceil(block_size) * block_size;
        if padded > u32::MAX as u64 {
            return Err(Error::InvalidState("allocation too large for a block"));
        }
        Ok(padded)
    }

    /// Remove one block from the free map and chain.
    fn unlink(&mut self, ptr: Ptr) -> Result<()> {
        self.free.remove(&ptr);
        let next = self
            .free
            .range((Bound::Excluded(ptr), Bound::Unbounded))
            .next()
            .map_or(0, |(&p, _)| p);
        let prev = self.free.range(..ptr).next_back().map(|(&p, _)| p);
        match prev {
            Some(prev) => self.file.write_u64(prev, next)?,
            None => self.header.free_head = next,
        }
        self.save()
    }

    fn zero_payload(&mut self, ptr: Ptr, stored: u64) -> Result<()> {
        let zeros = vec![0u8; (stored as usize).min(4096)];
        let mut off = ptr;
        let end = ptr + stored;
        while off < end {
            let chunk = ((end - off) as usize).min(zeros.len());
            self.file.write(off, &zeros[..chunk])?;
            off += chunk as u64;
        }
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        save_header(&mut self.file, &self.header)
    }
}

fn save_header(file: &mut BufferedFile, header: &Header) -> Result<()> {
    file.write_u32(0, MAGIC)?;
    file.write_u32(4, header.block_size)?;
    file.write_u64(8, header.free_head)?;
    file.write_u64(16, header.root_block)
}

/// Rebuild the in-memory free map from the on-disk chain, validating as it
/// goes. The chain is kept sorted by offset, which makes any cycle or
/// backward link show up as an ordering violation.
fn walk_free_chain(file: &mut BufferedFile, header: &Header) -> Result<BTreeMap<Ptr, u32>> {
    let mut free = BTreeMap::new();
    let mut ptr = header.free_head;
    let mut prev = 0;
    while ptr != 0 {
        if ptr <= prev {
            return Err(Error::Corrupt("free chain out of order or cyclic"));
        }
        if ptr < HEADER_SIZE + SIZE_PREFIX || ptr + MIN_PAYLOAD > file.size() {
            return Err(Error::Corrupt("free chain pointer out of range"));
        }
        let stored = file.read_u32(ptr - SIZE_PREFIX)? as u64;
        if stored < MIN_PAYLOAD
            || stored % header.block_size as u64 != 0
            || ptr + stored > file.size()
        {
            return Err(Error::Corrupt("free block has a bad size prefix"));
        }
        free.insert(ptr, stored as u32);
        prev = ptr;
        ptr = file.read_u64(ptr)?;
    }
    Ok(free)
}

/// Scoped transaction on a store: begins at construction, rolls the
/// outermost transaction back on drop unless [`commit`](Transaction::commit)
/// was called.
pub struct Transaction<'a> {
    alloc: &'a FileAllocator,
    done: bool,
}

impl Transaction<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.alloc.inner().file.commit()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.alloc.inner().file.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            // A nested guard may already have aborted the whole stack.
            let _ = self.alloc.inner().file.rollback();
        }
    }
}
