//! Dirty-page list
//!
//! Maps page numbers to the owned page buffers a write transaction has
//! modified. Entries append in arrival order; a sorted prefix is
//! reconciled on demand and lookups scan the short unsorted tail
//! linearly. Each entry carries an LRU tick used by the spill policy.

use crate::error::PageId;
use crate::page::PageBuf;
use crate::pnl::Pnl;

/// Tail entries tolerated before a lookup forces reconciliation.
const UNSORTED_TAIL_MAX: usize = 16;

/// One dirty page (or large-page run).
pub struct DirtyEntry {
    /// First page number of the run
    pub pgno: u64,
    /// Run length in pages
    pub npages: u32,
    /// LRU tick from the owning transaction
    pub lru: u32,
    /// The owned page image
    pub page: PageBuf,
}

/// The per-transaction dirty-page list.
#[derive(Default)]
pub struct DirtyList {
    entries: Vec<DirtyEntry>,
    /// Entries `[0, sorted)` are ordered by pgno.
    sorted: usize,
    lru_tick: u32,
}

impl DirtyList {
    /// Empty list.
    pub fn new() -> Self {
        Self { entries: Vec::new(), sorted: 0, lru_tick: 0 }
    }

    /// Number of dirty runs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no page is dirty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total dirty pages, run lengths included.
    pub fn total_pages(&self) -> usize {
        self.entries.iter().map(|e| e.npages as usize).sum()
    }

    /// Next LRU tick.
    fn tick(&mut self) -> u32 {
        self.lru_tick += 1;
        self.lru_tick
    }

    /// Append a dirty run. Appending a page number twice is engine
    /// corruption, not a recoverable state.
    pub fn push(&mut self, pgno: PageId, npages: usize, page: PageBuf) {
        assert!(
            self.position(pgno.0).is_none(),
            "page {pgno} already dirty: duplicate copy within one transaction"
        );
        let lru = self.tick();
        if self.sorted == self.entries.len()
            && self.entries.last().map_or(true, |e| e.pgno < pgno.0)
        {
            self.sorted += 1;
        }
        self.entries.push(DirtyEntry { pgno: pgno.0, npages: npages as u32, lru, page });
        if self.entries.len() - self.sorted > UNSORTED_TAIL_MAX {
            self.reconcile();
        }
    }

    fn reconcile(&mut self) {
        if self.sorted == self.entries.len() {
            return;
        }
        self.entries.sort_by_key(|e| e.pgno);
        self.sorted = self.entries.len();
    }

    fn position(&self, pgno: u64) -> Option<usize> {
        // Tail first: recent pages are the hottest.
        for (i, e) in self.entries[self.sorted..].iter().enumerate() {
            if e.pgno == pgno {
                return Some(self.sorted + i);
            }
        }
        self.entries[..self.sorted]
            .binary_search_by_key(&pgno, |e| e.pgno)
            .ok()
    }

    /// Look up a dirty page image.
    pub fn get(&self, pgno: PageId) -> Option<&PageBuf> {
        self.position(pgno.0).map(|i| &self.entries[i].page)
    }

    /// Look up and bump the page to the newest LRU tick.
    pub fn get_mut(&mut self, pgno: PageId) -> Option<&mut PageBuf> {
        let i = self.position(pgno.0)?;
        let t = self.tick();
        self.entries[i].lru = t;
        Some(&mut self.entries[i].page)
    }

    /// Whether a page is dirty in this list.
    pub fn contains(&self, pgno: PageId) -> bool {
        self.position(pgno.0).is_some()
    }

    /// Remove one entry.
    pub fn remove(&mut self, pgno: PageId) -> Option<DirtyEntry> {
        let i = self.position(pgno.0)?;
        if i < self.sorted {
            self.sorted -= 1;
        }
        Some(self.entries.remove(i))
    }

    /// Give maximum LRU priority to the listed pages (cursor-keep).
    pub fn keep(&mut self, pgnos: &[u64]) {
        let t = self.tick();
        for e in self.entries.iter_mut() {
            if pgnos.contains(&e.pgno) {
                e.lru = t;
            }
        }
    }

    /// Sweep the list against a sorted removal set, dropping matches.
    /// Returns the removed entries; the freed dirty budget is the sum of
    /// their run lengths.
    pub fn sift(&mut self, victims: &mut Pnl) -> Vec<DirtyEntry> {
        self.reconcile();
        victims.sort();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            if victims.search(PageId(e.pgno)).is_ok() {
                removed.push(e);
            } else {
                kept.push(e);
            }
        }
        self.entries = kept;
        self.sorted = self.entries.len();
        removed
    }

    /// Iterate entries in page-number order.
    pub fn iter_sorted(&mut self) -> std::slice::Iter<'_, DirtyEntry> {
        self.reconcile();
        self.entries.iter()
    }

    /// Drain all entries in page-number order (commit write-out).
    pub fn take_sorted(&mut self) -> Vec<DirtyEntry> {
        self.reconcile();
        self.sorted = 0;
        std::mem::take(&mut self.entries)
    }

    /// Read-only snapshot of `(pgno, npages, lru)` for the spill policy.
    pub fn victims(&self) -> Vec<(u64, u32, u32)> {
        self.entries.iter().map(|e| (e.pgno, e.npages, e.lru)).collect()
    }

    /// Current LRU tick, for quantising spill priorities.
    pub fn lru_now(&self) -> u32 {
        self.lru_tick
    }
}
