//! Data-file mapping and page I/O
//!
//! The data file is mapped once, for the full geometry upper bound, so
//! the base address stays stable for the whole environment lifetime and
//! live page references never move. Only the first `now` bytes are
//! backed by file data; growth extends the file under the existing
//! mapping, never the mapping itself.
//!
//! In the default mode dirty pages are written through the file
//! descriptor and the kernel keeps the shared mapping coherent. In
//! writemap mode commit copies pages straight into the mapping and
//! flushes ranges instead.

use memmap2::{MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, PageId, Result};

/// Mapped data file.
pub struct PageIo {
    file: File,
    map: MmapRaw,
    page_size: usize,
    /// Bytes currently backed by file data.
    now_bytes: AtomicU64,
}

impl PageIo {
    /// Open or create the data file and map `upper_bytes` of address
    /// space over it. The file is extended to `now_bytes` up front.
    pub fn open(path: &Path, page_size: usize, now_bytes: u64, upper_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Io(e.to_string()))?;

        let file_len = file.metadata().map_err(|e| Error::Io(e.to_string()))?.len();
        let backed = file_len.max(now_bytes);
        if backed > upper_bytes {
            // Every span handed out is bounded by the mapping; a file
            // larger than the reserved range cannot be served safely.
            return Err(Error::corrupt(PageId(0), "data file exceeds the mapped upper bound"));
        }
        if file_len < backed {
            file.set_len(backed).map_err(|e| Error::Io(e.to_string()))?;
        }

        let map = MmapOptions::new()
            .len(upper_bytes as usize)
            .map_raw(&file)
            .map_err(|e| Error::Io(e.to_string()))?;

        Ok(Self { file, map, page_size, now_bytes: AtomicU64::new(backed) })
    }

    /// Configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Currently backed size in bytes.
    pub fn now_bytes(&self) -> u64 {
        self.now_bytes.load(Ordering::Acquire)
    }

    /// Currently backed size in pages.
    pub fn size_in_pages(&self) -> u64 {
        self.now_bytes() / self.page_size as u64
    }

    /// Mapped (reserved) size in bytes.
    pub fn upper_bytes(&self) -> u64 {
        self.map.len() as u64
    }

    fn check_range(&self, pgno: PageId, npages: usize) -> Result<usize> {
        let offset = pgno
            .0
            .checked_mul(self.page_size as u64)
            .ok_or(Error::corrupt(pgno, "page offset overflow"))?;
        let len = (npages * self.page_size) as u64;
        if !pgno.is_valid() || offset + len > self.now_bytes() {
            return Err(Error::corrupt(pgno, "page beyond backed file size"));
        }
        Ok(offset as usize)
    }

    /// Zero-copy span of `npages` pages starting at `pgno`.
    ///
    /// The returned slice borrows the mapping, which lives as long as
    /// the environment; pages referenced by a snapshot are immutable
    /// under the MVCC rules, so the view stays consistent for the
    /// transaction that requested it.
    pub fn page_span(&self, pgno: PageId, npages: usize) -> Result<&[u8]> {
        let offset = self.check_range(pgno, npages)?;
        // Safety: range checked against the backed length above; the
        // mapping outlives `self` borrows by construction.
        Ok(unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(offset), npages * self.page_size)
        })
    }

    /// One page.
    pub fn page(&self, pgno: PageId) -> Result<&[u8]> {
        self.page_span(pgno, 1)
    }

    /// Write page images through the file descriptor.
    pub fn write_pages(&self, pgno: PageId, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len() % self.page_size, 0);
        let offset = self.check_range(pgno, bytes.len() / self.page_size)?;
        self.file
            .write_all_at(bytes, offset as u64)
            .map_err(|e| Error::Io(e.to_string()))
    }

    /// Write raw bytes at an absolute file offset (meta rotation uses
    /// this for the trailing txnid field).
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.write_all_at(bytes, offset).map_err(|e| Error::Io(e.to_string()))
    }

    /// Copy page images straight into the mapping (writemap mode) and
    /// schedule a range flush.
    pub fn copy_into_map(&self, pgno: PageId, bytes: &[u8]) -> Result<()> {
        let offset = self.check_range(pgno, bytes.len() / self.page_size)?;
        // Safety: the writer is exclusive and no reader may hold a
        // snapshot view of pages the writer allocated or touched.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Flush a mapped range to disk (writemap commits).
    pub fn msync(&self, pgno: PageId, npages: usize) -> Result<()> {
        let offset = self.check_range(pgno, npages)?;
        self.map
            .flush_range(offset, npages * self.page_size)
            .map_err(|e| Error::Io(e.to_string()))
    }

    /// fsync file data.
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| Error::Io(e.to_string()))
    }

    /// Extend the backed region. The mapping itself never moves.
    pub fn grow(&self, new_now_bytes: u64) -> Result<()> {
        if new_now_bytes > self.upper_bytes() {
            return Err(Error::MapFull {
                upper_pages: self.upper_bytes() / self.page_size as u64,
            });
        }
        if new_now_bytes <= self.now_bytes() {
            return Ok(());
        }
        self.file.set_len(new_now_bytes).map_err(|e| Error::Io(e.to_string()))?;
        self.now_bytes.store(new_now_bytes, Ordering::Release);
        tracing::trace!(bytes = new_now_bytes, "grew data file");
        Ok(())
    }

    /// Shrink the backed region to release tail pages back to the
    /// filesystem.
    pub fn shrink(&self, new_now_bytes: u64) -> Result<()> {
        if new_now_bytes >= self.now_bytes() {
            return Ok(());
        }
        self.file.set_len(new_now_bytes).map_err(|e| Error::Io(e.to_string()))?;
        self.now_bytes.store(new_now_bytes, Ordering::Release);
        tracing::trace!(bytes = new_now_bytes, "shrank data file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_io(dir: &TempDir) -> PageIo {
        PageIo::open(&dir.path().join("data.cdb"), 4096, 4096 * 8, 4096 * 64).unwrap()
    }

    #[test]
    fn write_then_map_read() {
        let dir = TempDir::new().unwrap();
        let io = open_io(&dir);

        let mut page = vec![0u8; 4096];
        page[..4].copy_from_slice(b"ping");
        io.write_pages(PageId(3), &page).unwrap();

        let back = io.page(PageId(3)).unwrap();
        assert_eq!(&back[..4], b"ping");
    }

    #[test]
    fn bounds_are_enforced() {
        let dir = TempDir::new().unwrap();
        let io = open_io(&dir);
        assert!(io.page(PageId(8)).is_err());
        assert!(io.page(PageId::INVALID).is_err());
        assert!(io.page_span(PageId(6), 3).is_err());
        assert!(io.page_span(PageId(6), 2).is_ok());
    }

    #[test]
    fn grow_within_upper() {
        let dir = TempDir::new().unwrap();
        let io = open_io(&dir);
        assert_eq!(io.size_in_pages(), 8);

        io.grow(4096 * 16).unwrap();
        assert_eq!(io.size_in_pages(), 16);
        assert!(io.page(PageId(15)).is_ok());

        // Past the reserved mapping: map full.
        let err = io.grow(4096 * 65).unwrap_err();
        assert!(matches!(err, Error::MapFull { upper_pages: 64 }));
    }

    #[test]
    fn writemap_copy_is_visible() {
        let dir = TempDir::new().unwrap();
        let io = open_io(&dir);
        let mut page = vec![0u8; 4096];
        page[10] = 0xAB;
        io.copy_into_map(PageId(5), &page).unwrap();
        assert_eq!(io.page(PageId(5)).unwrap()[10], 0xAB);
    }
}
