//! Reader slots and the shared lock file
//!
//! The lock file holds a `LockInfo` header followed by an array of
//! 64-byte reader slots shared by every process attached to the
//! environment. A slot publishes the snapshot txnid a reader pins;
//! the minimum over live slots bounds which retired pages the
//! allocator may recycle.

use fs2::FileExt as _;
use memmap2::{MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result, TxnId};

/// Maximum reader slots in the lock file.
pub const READERS_LIMIT: usize = 126;

/// Lock-file magic, version in the low byte.
const LCK_MAGIC: u64 = 0xC0_99_1C_4C_4F_43_4B_01;

/// Bytes per slot; one cache line.
const SLOT_SIZE: usize = 64;

/// Header size; slots start on the next cache line.
const HDR_SIZE: usize = 64;

// Header field offsets.
const H_MAGIC: usize = 0;
const H_ENV_FLAGS: usize = 8;
const H_REFRESH: usize = 12;
const H_OLDEST: usize = 16;
const H_OLDEST_SEEN: usize = 24;
const H_AUTOSYNC_THRESHOLD: usize = 32;
const H_AUTOSYNC_PERIOD: usize = 40;
const H_UNSYNCED_PAGES: usize = 48;
const H_TABLE_LOCK: usize = 56;

// Slot field offsets.
const S_PID: usize = 0;
const S_TID: usize = 8;
const S_TXNID: usize = 16;
const S_PAGES_USED: usize = 24;
const S_PAGES_RETIRED: usize = 32;

/// A live reader as reported by [`LockFile::reader_list`].
#[derive(Debug, Clone, Copy)]
pub struct ReaderInfo {
    /// Slot index
    pub slot: usize,
    /// Owning process
    pub pid: u32,
    /// Owning thread
    pub tid: u64,
    /// Pinned snapshot
    pub txnid: TxnId,
    /// `geometry.next` at the pinned snapshot
    pub pages_used: u64,
    /// Cumulative retired pages at the pinned snapshot
    pub pages_retired: u64,
}

/// The mapped lock file.
pub struct LockFile {
    /// Keeps the shared advisory lock for the environment lifetime.
    _file: File,
    map: MmapRaw,
    nslots: usize,
}

impl LockFile {
    /// Open or create the lock file. The first opener (holding the
    /// exclusive advisory lock) truncates and initializes it; later
    /// openers validate the header and the authoritative mode flags.
    pub fn open(path: &Path, env_flags: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Io(e.to_string()))?;

        let size = HDR_SIZE + READERS_LIMIT * SLOT_SIZE;
        let first = file.try_lock_exclusive().is_ok();
        if first {
            file.set_len(0).map_err(|e| Error::Io(e.to_string()))?;
            file.set_len(size as u64).map_err(|e| Error::Io(e.to_string()))?;
        } else {
            file.lock_shared().map_err(|_| Error::Busy)?;
        }

        let map =
            MmapOptions::new().len(size).map_raw(&file).map_err(|e| Error::Io(e.to_string()))?;
        let lck = Self { _file: file, map, nslots: READERS_LIMIT };

        if first {
            lck.u64_at(H_MAGIC).store(LCK_MAGIC, Ordering::Release);
            lck.u32_at(H_ENV_FLAGS).store(env_flags, Ordering::Release);
            lck._file.unlock().map_err(|e| Error::Io(e.to_string()))?;
            lck._file.lock_shared().map_err(|_| Error::Busy)?;
        } else {
            if lck.u64_at(H_MAGIC).load(Ordering::Acquire) != LCK_MAGIC {
                return Err(Error::corrupt(crate::error::PageId::INVALID, "bad lock-file magic"));
            }
            if lck.u32_at(H_ENV_FLAGS).load(Ordering::Acquire) != env_flags {
                return Err(Error::Incompatible);
            }
        }
        Ok(lck)
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.map.len());
        // Safety: the mapping is page-aligned, the offset is 8-aligned
        // and in bounds, and all cross-process access to these words is
        // atomic.
        unsafe { &*(self.map.as_mut_ptr().add(off) as *const AtomicU64) }
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.map.len());
        // Safety: as above.
        unsafe { &*(self.map.as_mut_ptr().add(off) as *const AtomicU32) }
    }

    fn slot_off(&self, i: usize) -> usize {
        HDR_SIZE + i * SLOT_SIZE
    }

    /// Spin on the table lock word; claims are short and rare.
    fn table_lock(&self) -> TableGuard<'_> {
        let word = self.u64_at(H_TABLE_LOCK);
        let me = std::process::id() as u64;
        loop {
            if word.compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return TableGuard { word };
            }
            std::hint::spin_loop();
        }
    }

    /// Claim a slot and publish the pinned snapshot.
    pub fn acquire(&self, txnid: TxnId, pages_used: u64, pages_retired: u64) -> Result<usize> {
        let pid = std::process::id();
        let tid = thread_id();
        let _guard = self.table_lock();
        for i in 0..self.nslots {
            let off = self.slot_off(i);
            if self.u64_at(off + S_PID).load(Ordering::Acquire) != 0 {
                continue;
            }
            // Field order matters: a writer scanning without the table
            // lock must see either pid == 0 or a complete snapshot.
            self.u64_at(off + S_TXNID).store(0, Ordering::Relaxed);
            self.u64_at(off + S_TID).store(tid, Ordering::Relaxed);
            self.u64_at(off + S_PAGES_USED).store(pages_used, Ordering::Relaxed);
            self.u64_at(off + S_PAGES_RETIRED).store(pages_retired, Ordering::Relaxed);
            self.u64_at(off + S_TXNID).store(txnid.0, Ordering::Release);
            self.u64_at(off + S_PID).store(pid as u64, Ordering::Release);
            self.bump_refresh();
            return Ok(i);
        }
        Err(Error::ReadersFull)
    }

    /// Release a slot.
    pub fn release(&self, slot: usize) {
        let off = self.slot_off(slot);
        self.u64_at(off + S_TXNID).store(0, Ordering::Release);
        self.u64_at(off + S_PID).store(0, Ordering::Release);
        self.bump_refresh();
    }

    /// Snapshot txnid currently published in a slot; 0 after eviction.
    pub fn slot_txnid(&self, slot: usize) -> u64 {
        self.u64_at(self.slot_off(slot) + S_TXNID).load(Ordering::Acquire)
    }

    /// Asynchronously invalidate a lagging reader (handle-slow-readers).
    /// The reader discovers the eviction at its next page access.
    pub fn evict(&self, slot: usize) {
        let off = self.slot_off(slot);
        self.u64_at(off + S_TXNID).store(0, Ordering::Release);
        self.bump_refresh();
        tracing::warn!(slot, "evicted lagging reader");
    }

    fn bump_refresh(&self) {
        self.u32_at(H_REFRESH).fetch_add(1, Ordering::AcqRel);
    }

    /// Oldest pinned txnid, `head` when no reader is live. Cached in the
    /// header; readers bump the refresh counter when they publish or
    /// release a slot, which invalidates the cache.
    pub fn oldest(&self, head: TxnId) -> TxnId {
        let refresh = self.u32_at(H_REFRESH).load(Ordering::Acquire);
        if refresh == self.u32_at(H_OLDEST_SEEN).load(Ordering::Acquire) {
            let cached = self.u64_at(H_OLDEST).load(Ordering::Acquire);
            if cached != 0 {
                return TxnId(cached.min(head.0));
            }
        }
        let mut oldest = head;
        for i in 0..self.nslots {
            let off = self.slot_off(i);
            if self.u64_at(off + S_PID).load(Ordering::Acquire) == 0 {
                continue;
            }
            let t = self.u64_at(off + S_TXNID).load(Ordering::Acquire);
            if t != 0 && t < oldest.0 {
                oldest = TxnId(t);
            }
        }
        self.u64_at(H_OLDEST).store(oldest.0, Ordering::Release);
        self.u32_at(H_OLDEST_SEEN).store(refresh, Ordering::Release);
        oldest
    }

    /// Live readers, for introspection.
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        let mut out = Vec::new();
        for i in 0..self.nslots {
            let off = self.slot_off(i);
            let pid = self.u64_at(off + S_PID).load(Ordering::Acquire);
            if pid == 0 {
                continue;
            }
            out.push(ReaderInfo {
                slot: i,
                pid: pid as u32,
                tid: self.u64_at(off + S_TID).load(Ordering::Acquire),
                txnid: TxnId(self.u64_at(off + S_TXNID).load(Ordering::Acquire)),
                pages_used: self.u64_at(off + S_PAGES_USED).load(Ordering::Acquire),
                pages_retired: self.u64_at(off + S_PAGES_RETIRED).load(Ordering::Acquire),
            });
        }
        out
    }

    /// Clear slots owned by dead processes. Runs under the table lock so
    /// a concurrent claim cannot race a slot being wiped.
    pub fn reader_check(&self) -> usize {
        let _guard = self.table_lock();
        let mut cleared = 0;
        for i in 0..self.nslots {
            let off = self.slot_off(i);
            let pid = self.u64_at(off + S_PID).load(Ordering::Acquire) as u32;
            if pid != 0 && !process_alive(pid) {
                self.u64_at(off + S_TXNID).store(0, Ordering::Release);
                self.u64_at(off + S_PID).store(0, Ordering::Release);
                cleared += 1;
                tracing::warn!(pid, slot = i, "cleared slot of dead reader");
            }
        }
        if cleared > 0 {
            self.bump_refresh();
        }
        cleared
    }

    /// Number of live readers.
    pub fn reader_count(&self) -> usize {
        (0..self.nslots)
            .filter(|&i| self.u64_at(self.slot_off(i) + S_PID).load(Ordering::Acquire) != 0)
            .count()
    }

    /// Autosync threshold in pages; 0 disables it.
    pub fn autosync_threshold(&self) -> u64 {
        self.u64_at(H_AUTOSYNC_THRESHOLD).load(Ordering::Acquire)
    }

    /// Set the autosync threshold.
    pub fn set_autosync_threshold(&self, pages: u64) {
        self.u64_at(H_AUTOSYNC_THRESHOLD).store(pages, Ordering::Release);
    }

    /// Autosync period ticks, stored for the outer layers.
    pub fn autosync_period(&self) -> u64 {
        self.u64_at(H_AUTOSYNC_PERIOD).load(Ordering::Acquire)
    }

    /// Set the autosync period.
    pub fn set_autosync_period(&self, ticks: u64) {
        self.u64_at(H_AUTOSYNC_PERIOD).store(ticks, Ordering::Release);
    }

    /// Pages written by weak commits since the last durable sync.
    pub fn unsynced_pages(&self) -> u64 {
        self.u64_at(H_UNSYNCED_PAGES).load(Ordering::Acquire)
    }

    /// Add to the unsynced-page counter, returning the new total.
    pub fn add_unsynced_pages(&self, pages: u64) -> u64 {
        self.u64_at(H_UNSYNCED_PAGES).fetch_add(pages, Ordering::AcqRel) + pages
    }

    /// Reset the unsynced-page counter after a durable sync.
    pub fn reset_unsynced_pages(&self) {
        self.u64_at(H_UNSYNCED_PAGES).store(0, Ordering::Release);
    }
}

struct TableGuard<'a> {
    word: &'a AtomicU64,
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

fn thread_id() -> u64 {
    #[cfg(unix)]
    {
        unsafe { libc::pthread_self() as u64 }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as i32, 0) } == 0 {
            return true;
        }
        // EPERM still proves the process exists.
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        true
    }
}
