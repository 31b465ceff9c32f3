//! Page-cached, endian-aware I/O over a host file with a single-writer
//! transactional undo log.
//!
//! Reads and writes go through a fixed-count cache of `page_size` pages.
//! A write first records the touched page's pre-image in the transaction's
//! undo map; the outermost commit flushes every dirty page, applies the
//! logical size with one `set_len` and syncs. Rollback restores the
//! pre-images into the cache and reverts the logical size — physical
//! growth and truncation are deferred to commit, so rollback never has to
//! rewrite the disk.
//!
//! This is a single-process store: the backing file is locked exclusively
//! for the lifetime of the handle. If a commit fails after it has started
//! flushing, the handle is poisoned and every further transaction is
//! refused; the next open performs no recovery.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs4::fs_std::FileExt;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::wire::Endian;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default cache capacity in pages.
pub const DEFAULT_CACHE_PAGES: usize = 256;

struct CachedPage {
    data: Box<[u8]>,
    dirty: bool,
    stamp: u64,
}

pub struct BufferedFile {
    file: File,
    endian: Endian,
    page_size: usize,
    cache_pages: usize,
    pages: HashMap<u64, CachedPage>,
    clock: u64,
    /// Logical size; tracks `set_size` immediately, the disk only at commit.
    size: u64,
    /// Physical size as of the last commit.
    disk_size: u64,
    depth: usize,
    undo: HashMap<u64, Box<[u8]>>,
    undo_size: u64,
    poisoned: bool,
}

impl BufferedFile {
    /// Open or create `path` read/write and take an exclusive lock on it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<BufferedFile> {
        BufferedFile::with_cache(path, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_PAGES)
    }

    /// Open with an explicit page geometry. `page_size` must be a power of
    /// two; `cache_pages` must be nonzero.
    pub fn with_cache<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        cache_pages: usize,
    ) -> Result<BufferedFile> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::InvalidState("page size must be a power of two"));
        }
        if cache_pages == 0 {
            return Err(Error::InvalidState("page cache must hold at least one page"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;
        file.try_lock_exclusive().map_err(Error::Lock)?;
        let size = file.metadata().map_err(Error::Open)?.len();
        debug!(size, page_size, "opened backing file");
        Ok(BufferedFile {
            file,
            endian: Endian::NATIVE,
            page_size,
            cache_pages,
            pages: HashMap::new(),
            clock: 0,
            size,
            disk_size: size,
            depth: 0,
            undo: HashMap::new(),
            undo_size: size,
            poisoned: false,
        })
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Switch the byte order applied to primitive reads and writes. Set
    /// once right after open, when the header magic has been inspected.
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn page_of(&self, offset: u64) -> u64 {
        offset / self.page_size as u64
    }

    /// Drop least-recently-used clean pages until the cache has room.
    /// Dirty pages pin; the cache is allowed to exceed its budget when
    /// nothing else is evictable.
    fn evict(&mut self) {
        while self.pages.len() >= self.cache_pages {
            let victim = self
                .pages
                .iter()
                .filter(|(_, page)| !page.dirty)
                .min_by_key(|(_, page)| page.stamp)
                .map(|(&index, _)| index);
            match victim {
                Some(index) => {
                    self.pages.remove(&index);
                }
                None => break,
            }
        }
    }

    /// Bring a page into the cache. Bytes beyond the physical end of file
    /// read as zeros.
    fn load_page(&mut self, index: u64) -> Result<()> {
        if let Some(page) = self.pages.get_mut(&index) {
            self.clock += 1;
            page.stamp = self.clock;
            return Ok(());
        }
        self.evict();
        let offset = index * self.page_size as u64;
        let mut data = vec![0u8; self.page_size].into_boxed_slice();
        if offset < self.disk_size {
            let avail = ((self.disk_size - offset) as usize).min(self.page_size);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut data[..avail])?;
        }
        self.clock += 1;
        self.pages.insert(
            index,
            CachedPage {
                data,
                dirty: false,
                stamp: self.clock,
            },
        );
        Ok(())
    }

    /// Record the page's pre-image in the undo map, once per transaction.
    fn log_page(&mut self, index: u64) -> Result<()> {
        if self.undo.contains_key(&index) {
            return Ok(());
        }
        self.load_page(index)?;
        let image = self.pages[&index].data.clone();
        self.undo.insert(index, image);
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `offset`.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::Corrupt("read offset overflow"))?;
        if end > self.size {
            return Err(Error::Corrupt("read beyond end of file"));
        }
        let page_size = self.page_size as u64;
        let mut pos = offset;
        let mut filled = 0usize;
        while filled < buf.len() {
            let index = self.page_of(pos);
            let in_page = (pos % page_size) as usize;
            let chunk = (self.page_size - in_page).min(buf.len() - filled);
            self.load_page(index)?;
            let page = &self.pages[&index];
            buf[filled..filled + chunk].copy_from_slice(&page.data[in_page..in_page + chunk]);
            pos += chunk as u64;
            filled += chunk;
        }
        Ok(())
    }

    /// Write `buf` at `offset`. Only legal inside a transaction, and only
    /// within the current logical size — the file grows via [`set_size`].
    ///
    /// [`set_size`]: BufferedFile::set_size
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::InvalidState("write outside a transaction"));
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::Corrupt("write offset overflow"))?;
        if end > self.size {
            return Err(Error::Corrupt("write beyond end of file"));
        }
        let page_size = self.page_size as u64;
        let mut pos = offset;
        let mut taken = 0usize;
        while taken < buf.len() {
            let index = self.page_of(pos);
            let in_page = (pos % page_size) as usize;
            let chunk = (self.page_size - in_page).min(buf.len() - taken);
            self.log_page(index)?;
            let page = self.pages.get_mut(&index).unwrap();
            page.data[in_page..in_page + chunk].copy_from_slice(&buf[taken..taken + chunk]);
            page.dirty = true;
            pos += chunk as u64;
            taken += chunk;
        }
        Ok(())
    }

    pub fn read_u8(&mut self, offset: u64) -> Result<u8> {
        let mut tmp = [0u8; 1];
        self.read(offset, &mut tmp)?;
        Ok(tmp[0])
    }

    pub fn read_u16(&mut self, offset: u64) -> Result<u16> {
        let mut tmp = [0u8; 2];
        self.read(offset, &mut tmp)?;
        Ok(self.endian.read_u16(&tmp))
    }

    pub fn read_u32(&mut self, offset: u64) -> Result<u32> {
        let mut tmp = [0u8; 4];
        self.read(offset, &mut tmp)?;
        Ok(self.endian.read_u32(&tmp))
    }

    pub fn read_u64(&mut self, offset: u64) -> Result<u64> {
        let mut tmp = [0u8; 8];
        self.read(offset, &mut tmp)?;
        Ok(self.endian.read_u64(&tmp))
    }

    pub fn write_u8(&mut self, offset: u64, v: u8) -> Result<()> {
        self.write(offset, &[v])
    }

    pub fn write_u16(&mut self, offset: u64, v: u16) -> Result<()> {
        let mut tmp = [0u8; 2];
        self.endian.write_u16(&mut tmp, v);
        self.write(offset, &tmp)
    }

    pub fn write_u32(&mut self, offset: u64, v: u32) -> Result<()> {
        let mut tmp = [0u8; 4];
        self.endian.write_u32(&mut tmp, v);
        self.write(offset, &tmp)
    }

    pub fn write_u64(&mut self, offset: u64, v: u64) -> Result<()> {
        let mut tmp = [0u8; 8];
        self.endian.write_u64(&mut tmp, v);
        self.write(offset, &tmp)
    }

    /// Zero `[start, end)` as seen through the cache, logging pre-images.
    /// Pages wholly beyond the physical end that aren't cached already read
    /// as zeros and are skipped.
    fn zero_range(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        let page_size = self.page_size as u64;
        let mut index = start / page_size;
        let last = (end - 1) / page_size;
        while index <= last {
            let offset = index * page_size;
            let from = start.max(offset) - offset;
            let to = end.min(offset + page_size) - offset;
            let whole = from == 0 && to == page_size;
            let beyond_disk = offset >= self.disk_size;
            if beyond_disk && !self.pages.contains_key(&index) {
                index += 1;
                continue;
            }
            if beyond_disk && whole {
                // Reloads as zeros; the pre-image (if any) is zeros too.
                self.pages.remove(&index);
                index += 1;
                continue;
            }
            self.log_page(index)?;
            let page = self.pages.get_mut(&index).unwrap();
            page.data[from as usize..to as usize].fill(0);
            page.dirty = true;
            index += 1;
        }
        Ok(())
    }

    /// Grow (zero-filling) or shrink the file. Transactional; the physical
    /// length changes at commit.
    pub fn set_size(&mut self, size: u64) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::InvalidState("resize outside a transaction"));
        }
        if size == self.size {
            return Ok(());
        }
        if size < self.size {
            // Discarded bytes must read as zeros if the region is later
            // regrown, and must not leak back from the disk image.
            self.zero_range(size, self.size)?;
        } else {
            // A previous shrink may have left stale disk content between
            // the logical and physical sizes.
            self.zero_range(self.size, size.min(self.disk_size))?;
        }
        self.size = size;
        Ok(())
    }

    /// Enter a transaction; nested calls just deepen it.
    pub fn begin(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(Error::InvalidState("store poisoned by a failed commit"));
        }
        self.depth += 1;
        if self.depth == 1 {
            self.undo.clear();
            self.undo_size = self.size;
            trace!(size = self.size, "transaction begin");
        }
        Ok(())
    }

    /// Leave one transaction level. The outermost commit flushes dirty
    /// pages, applies the logical size and syncs.
    pub fn commit(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::InvalidState("commit without a matching begin"));
        }
        if self.depth > 1 {
            self.depth -= 1;
            return Ok(());
        }
        if let Err(err) = self.flush() {
            self.poisoned = true;
            warn!("commit failed, store poisoned");
            return Err(err);
        }
        for page in self.pages.values_mut() {
            page.dirty = false;
        }
        self.disk_size = self.size;
        self.undo.clear();
        self.depth = 0;
        trace!(size = self.size, "transaction committed");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let page_size = self.page_size as u64;
        let mut dirty: Vec<u64> = self
            .pages
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(&index, _)| index)
            .collect();
        dirty.sort_unstable();
        for index in dirty {
            let offset = index * page_size;
            if offset >= self.size {
                continue;
            }
            let len = ((self.size - offset) as usize).min(self.page_size);
            let page = &self.pages[&index];
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&page.data[..len])?;
        }
        if self.size != self.disk_size {
            self.file.set_len(self.size).map_err(|source| {
                if self.size > self.disk_size {
                    Error::OutOfSpace {
                        requested: self.size,
                        source,
                    }
                } else {
                    Error::Io(source)
                }
            })?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Abort the outermost transaction, whatever the current depth:
    /// pre-images go back into the cache and the logical size reverts.
    pub fn rollback(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::InvalidState("rollback without a matching begin"));
        }
        for (index, image) in std::mem::take(&mut self.undo) {
            self.clock += 1;
            self.pages.insert(
                index,
                CachedPage {
                    data: image,
                    dirty: false,
                    stamp: self.clock,
                },
            );
        }
        // Anything left dirty was created inside the transaction.
        self.pages.retain(|_, page| !page.dirty);
        self.size = self.undo_size;
        self.depth = 0;
        trace!(size = self.size, "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn write_requires_transaction() {
        let (_dir, path) = scratch("txn.db");
        let mut file = BufferedFile::open(&path).unwrap();
        file.begin().unwrap();
        file.set_size(16).unwrap();
        file.commit().unwrap();
        let err = file.write(0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn committed_writes_survive_reopen() {
        let (_dir, path) = scratch("persist.db");
        {
            let mut file = BufferedFile::open(&path).unwrap();
            file.begin().unwrap();
            file.set_size(8192).unwrap();
            file.write(4090, b"straddles a page boundary").unwrap();
            file.commit().unwrap();
        }
        let mut file = BufferedFile::open(&path).unwrap();
        assert_eq!(file.size(), 8192);
        let mut buf = [0u8; 25];
        file.read(4090, &mut buf).unwrap();
        assert_eq!(&buf, b"straddles a page boundary");
    }

    #[test]
    fn rollback_is_identity() {
        let (_dir, path) = scratch("rollback.db");
        let mut file = BufferedFile::open(&path).unwrap();
        file.begin().unwrap();
        file.set_size(4096).unwrap();
        file.write(100, b"baseline").unwrap();
        file.commit().unwrap();

        file.begin().unwrap();
        file.write(100, b"clobber!").unwrap();
        file.set_size(65536).unwrap();
        file.write(60000, b"tail").unwrap();
        file.rollback().unwrap();

        assert_eq!(file.size(), 4096);
        let mut buf = [0u8; 8];
        file.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"baseline");
        assert!(file.read(60000, &mut buf).is_err());
    }

    #[test]
    fn nested_transactions_commit_only_at_depth_zero() {
        let (_dir, path) = scratch("nested.db");
        let mut file = BufferedFile::open(&path).unwrap();
        file.begin().unwrap();
        file.set_size(512).unwrap();
        file.begin().unwrap();
        file.write(0, b"inner").unwrap();
        file.commit().unwrap();
        assert!(file.in_transaction());
        file.commit().unwrap();
        assert!(!file.in_transaction());

        let mut buf = [0u8; 5];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"inner");
    }

    #[test]
    fn inner_rollback_aborts_the_outermost() {
        let (_dir, path) = scratch("abort.db");
        let mut file = BufferedFile::open(&path).unwrap();
        file.begin().unwrap();
        file.set_size(512).unwrap();
        file.begin().unwrap();
        file.rollback().unwrap();
        assert!(!file.in_transaction());
        assert_eq!(file.size(), 0);
        assert!(matches!(file.commit(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn primitive_io_swaps_for_foreign_endian() {
        let (_dir, path) = scratch("endian.db");
        let foreign = match Endian::NATIVE {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        };
        {
            let mut file = BufferedFile::open(&path).unwrap();
            file.set_endian(foreign);
            file.begin().unwrap();
            file.set_size(64).unwrap();
            file.write_u32(0, 0x0102_0304).unwrap();
            file.write_u64(8, 0x1122_3344_5566_7788).unwrap();
            file.commit().unwrap();
        }
        let mut file = BufferedFile::open(&path).unwrap();
        // Raw bytes are in foreign order.
        let mut raw = [0u8; 4];
        file.read(0, &mut raw).unwrap();
        assert_ne!(Endian::NATIVE.read_u32(&raw), 0x0102_0304);
        file.set_endian(foreign);
        assert_eq!(file.read_u32(0).unwrap(), 0x0102_0304);
        assert_eq!(file.read_u64(8).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn eviction_keeps_data_intact() {
        let (_dir, path) = scratch("evict.db");
        let mut file = BufferedFile::with_cache(&path, 512, 4).unwrap();
        let pages = 64u64;
        file.begin().unwrap();
        file.set_size(pages * 512).unwrap();
        for i in 0..pages {
            file.write_u64(i * 512, i ^ 0xA5A5).unwrap();
        }
        file.commit().unwrap();
        for i in 0..pages {
            assert_eq!(file.read_u64(i * 512).unwrap(), i ^ 0xA5A5);
        }
    }

    #[test]
    fn shrink_then_regrow_reads_zeros() {
        let (_dir, path) = scratch("shrink.db");
        let mut file = BufferedFile::open(&path).unwrap();
        file.begin().unwrap();
        file.set_size(1024).unwrap();
        file.write(512, &[0xFFu8; 512]).unwrap();
        file.commit().unwrap();

        file.begin().unwrap();
        file.set_size(512).unwrap();
        file.set_size(1024).unwrap();
        let mut buf = [0u8; 512];
        file.read(512, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 512]);
        file.commit().unwrap();

        // And the zeros persisted.
        file.read(512, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 512]);
    }
}
