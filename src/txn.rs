//! Transaction lifecycle
//!
//! Read transactions pin a snapshot through a reader slot and never
//! block the writer. The single write transaction owns the dirty-page
//! list, the reclaim and retired lists and the spill list, mutates
//! pages copy-on-write and installs a new meta head at commit. Nested
//! transactions stack shadow frames over their parent and merge or
//! discard as one unit.

use std::collections::{HashMap, HashSet};

use crate::db::TreeHandle;
use crate::dirty::DirtyList;
use crate::env::{EnvInner, Environment, HsrDecision};
use crate::error::{Error, PageId, Result, TxnId};
use crate::meta::{Canary, GC_DBI, MAIN_DBI, Meta, NUM_METAS};
use crate::page::{PageBuf, PageFlags, PageRef};
use crate::pnl::Pnl;
use crate::tree;

/// Database slot index. 0 is the GC tree, 1 is MAIN, named databases
/// follow.
pub type Dbi = u32;

/// Dbi of the GC tree.
pub const FREE_DBI: Dbi = GC_DBI as Dbi;

/// Dbi of the MAIN tree.
pub const MAIN_DBI_SLOT: Dbi = MAIN_DBI as Dbi;

/// Iteration bound for the GC update loop; exceeding it means the
/// retired list never stabilized.
const GC_UPDATE_CAP: usize = 12;

/// Pages the GC update reserves up front so its own tree work can
/// allocate without consuming GC entries mid-update.
const GC_RESERVE_SLACK: usize = 16;

/// Newest dirty pages never considered by the spill policy; the active
/// root-to-leaf path lives here.
const SPILL_KEEP_NEWEST: usize = 16;

/// Reclaim-list augment bound, entries.
const RECLAIM_LIMIT: usize = 0x20000;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::ReadTxn<'_> {}
    impl Sealed for super::WriteTxn<'_> {}
}

/// Read access shared by read-only and write transactions.
pub trait TxnRead: sealed::Sealed {
    /// Snapshot id this transaction observes.
    fn id(&self) -> TxnId;

    #[doc(hidden)]
    fn env_inner(&self) -> &EnvInner;

    #[doc(hidden)]
    fn page(&self, pgno: PageId) -> Result<PageRef<'_>>;

    #[doc(hidden)]
    fn page_run(&self, pgno: PageId, npages: usize) -> Result<PageRef<'_>>;

    #[doc(hidden)]
    fn tree_handle(&self, dbi: Dbi) -> Result<TreeHandle>;

    #[doc(hidden)]
    fn assert_live(&self) -> Result<()>;
}

/// A read-only snapshot transaction.
pub struct ReadTxn<'env> {
    env: &'env Environment,
    meta: Meta,
    slot: Option<usize>,
    named: std::cell::RefCell<HashMap<Dbi, TreeHandle>>,
}

impl<'env> ReadTxn<'env> {
    pub(crate) fn begin(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();
        // Claim a slot, then re-check the head: a commit racing the
        // claim may have rotated the meta between snapshot and publish.
        let mut meta = inner.read_head()?;
        let mut slot = inner.lck.acquire(meta.txnid, meta.geo.next, meta.pages_retired)?;
        for _ in 0..3 {
            let head = match inner.read_head() {
                Ok(m) => m,
                Err(e) => {
                    inner.lck.release(slot);
                    return Err(e);
                }
            };
            if head.txnid == meta.txnid {
                break;
            }
            inner.lck.release(slot);
            meta = head;
            slot = inner.lck.acquire(meta.txnid, meta.geo.next, meta.pages_retired)?;
        }
        Ok(Self {
            env,
            meta,
            slot: Some(slot),
            named: std::cell::RefCell::new(HashMap::new()),
        })
    }

    /// Release the snapshot early; equivalent to dropping.
    pub fn abort(self) {}

    pub(crate) fn cache_named(&self, dbi: Dbi, handle: TreeHandle) {
        self.named.borrow_mut().insert(dbi, handle);
    }
}

impl TxnRead for ReadTxn<'_> {
    fn id(&self) -> TxnId {
        self.meta.txnid
    }

    fn env_inner(&self) -> &EnvInner {
        self.env.inner()
    }

    fn page(&self, pgno: PageId) -> Result<PageRef<'_>> {
        PageRef::new(self.env.inner().io.page(pgno)?)
    }

    fn page_run(&self, pgno: PageId, npages: usize) -> Result<PageRef<'_>> {
        PageRef::new(self.env.inner().io.page_span(pgno, npages)?)
    }

    fn tree_handle(&self, dbi: Dbi) -> Result<TreeHandle> {
        match dbi as usize {
            GC_DBI | MAIN_DBI => Ok(TreeHandle::new(dbi, self.meta.trees[dbi as usize])),
            _ => {
                if let Some(h) = self.named.borrow().get(&dbi) {
                    return Ok(*h);
                }
                let h = self.env.inner().load_named_handle(self, dbi)?;
                self.cache_named(dbi, h);
                Ok(h)
            }
        }
    }

    fn assert_live(&self) -> Result<()> {
        if let Some(slot) = self.slot {
            // An evicted reader no longer pins its snapshot and must not
            // trust further reads from it.
            if self.env.inner().lck.slot_txnid(slot) != self.meta.txnid.0 {
                return Err(Error::BadTransaction);
            }
        }
        Ok(())
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.env.inner().lck.release(slot);
        }
    }
}

/// Ownership class of a page with respect to the current write frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Mutable copy owned by the current frame
    Dirty,
    /// Dirty in an enclosing frame; the child must clone before writing
    Shadowed,
    /// Written ahead of commit to free dirty budget
    Spilled,
    /// Retired by this transaction and queued for immediate reuse
    Loose,
    /// Belongs to a committed snapshot; copy-on-write applies
    Frozen,
}

bitflags::bitflags! {
    /// Allocator search policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocMode: u32 {
        /// May read reclaimable entries out of the GC tree
        const CONSUME_GC = 0x1;
        /// May extend the file tail
        const GROW = 0x2;
        /// Only prime the reclaim list; no page is returned
        const RESERVE_ONLY = 0x4;
    }
}

impl AllocMode {
    /// Default policy for tree allocations.
    pub fn default_policy() -> Self {
        AllocMode::CONSUME_GC | AllocMode::GROW
    }
}

/// One level of write state; nested transactions push frames.
struct WriteFrame {
    dirty: DirtyList,
    retired: Pnl,
    reclaim: Pnl,
    loose: Vec<u64>,
    spilled: Pnl,
    gc_consumed: Vec<u64>,
    dirtyroom: usize,
    next_pgno: u64,
    geo_now: u64,
    trees: HashMap<Dbi, TreeHandle>,
    tree_dirty: HashSet<Dbi>,
    canary: Canary,
}

/// The write transaction. At most one exists per environment across
/// all processes.
pub struct WriteTxn<'env> {
    env: &'env Environment,
    txnid: TxnId,
    head: Meta,
    frames: Vec<WriteFrame>,
    in_gc: bool,
    coalesce: bool,
    poisoned: bool,
    committed: bool,
    _gate: parking_lot::MutexGuard<'env, ()>,
    _wlock: crate::env::WriterLock<'env>,
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn begin(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();
        let gate = inner.write_gate.lock();
        let wlock = inner.lock_writer()?;
        inner.check_fatal()?;

        let head = inner.read_head()?;
        let txnid = TxnId(head.txnid.0 + 1);
        let mut trees = HashMap::new();
        trees.insert(FREE_DBI, TreeHandle::new(FREE_DBI, head.trees[GC_DBI]));
        trees.insert(MAIN_DBI_SLOT, TreeHandle::new(MAIN_DBI_SLOT, head.trees[MAIN_DBI]));

        let frame = WriteFrame {
            dirty: DirtyList::new(),
            retired: Pnl::new(),
            reclaim: Pnl::new(),
            loose: Vec::new(),
            spilled: Pnl::new(),
            gc_consumed: Vec::new(),
            dirtyroom: inner.dp_limit,
            next_pgno: head.geo.next,
            // Clamped to the backed size; a rollback recovery can leave
            // the meta's `now` ahead of the file.
            geo_now: head.geo.now.min(inner.io.size_in_pages()),
            trees,
            tree_dirty: HashSet::new(),
            canary: head.canary,
        };
        tracing::debug!(txnid = txnid.0, "write transaction begins");
        Ok(Self {
            env,
            txnid,
            head,
            frames: vec![frame],
            in_gc: false,
            coalesce: true,
            poisoned: false,
            committed: false,
            _gate: gate,
            _wlock: wlock,
        })
    }

    fn top(&self) -> &WriteFrame {
        self.frames.last().expect("write txn always has a frame")
    }

    fn top_mut(&mut self) -> &mut WriteFrame {
        self.frames.last_mut().expect("write txn always has a frame")
    }

    /// Whether this transaction currently runs a nested child frame.
    pub fn is_nested(&self) -> bool {
        self.frames.len() > 1
    }

    /// Pages of dirty budget still available.
    pub fn dirtyroom(&self) -> usize {
        self.top().dirtyroom
    }

    /// Mark the transaction unusable after an internal error.
    pub(crate) fn note_error(&mut self, err: &Error) {
        if matches!(err, Error::Corruption { .. } | Error::Fatal(_)) {
            self.poisoned = true;
        }
    }

    /// Classify a page against this transaction (the ownership
    /// tracker).
    pub(crate) fn page_state(&self, pgno: PageId) -> PageState {
        let top = self.top();
        if top.loose.contains(&pgno.0) {
            return PageState::Loose;
        }
        if top.dirty.contains(pgno) {
            return PageState::Dirty;
        }
        for frame in self.frames[..self.frames.len() - 1].iter().rev() {
            if frame.dirty.contains(pgno) {
                return PageState::Shadowed;
            }
        }
        for frame in self.frames.iter().rev() {
            if frame.spilled.as_slice().contains(&pgno.0) {
                return PageState::Spilled;
            }
        }
        PageState::Frozen
    }

    /// Mutable image of a page already dirty in the current frame.
    pub(crate) fn dirty_page_mut(&mut self, pgno: PageId) -> Result<&mut PageBuf> {
        self.top_mut()
            .dirty
            .get_mut(pgno)
            .ok_or(Error::corrupt(pgno, "mutation of a page that was never touched"))
    }

    fn ensure_dirtyroom(&mut self, need: usize) -> Result<()> {
        if self.top().dirtyroom >= need {
            return Ok(());
        }
        self.spill(need)
    }

    /// Write low-priority dirty pages out ahead of commit until `need`
    /// pages of budget are free.
    fn spill(&mut self, need: usize) -> Result<()> {
        let now = self.top().dirty.lru_now();
        let mut scored: Vec<(u32, u64, u32)> = Vec::new();
        for (pgno, npages, lru) in self.top().dirty.victims() {
            if now - lru < SPILL_KEEP_NEWEST as u32 {
                continue;
            }
            let age = now - lru;
            let mut prio = (age.min(1020) / 4).min(255);
            if npages > 1 {
                prio += 64;
            }
            scored.push((prio, pgno, npages));
        }
        // Adjacency bonus: spilling neighbors of chosen victims turns
        // single-page writes into runs.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let chosen: Vec<u64> = scored.iter().map(|v| v.1).collect();
        for v in scored.iter_mut() {
            if chosen.contains(&(v.1 + 1)) || (v.1 > 0 && chosen.contains(&(v.1 - 1))) {
                v.0 = v.0.saturating_add(16);
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let writemap = self.env.inner().writemap();
        let mut freed = 0usize;
        for (_prio, pgno, npages) in scored {
            if freed >= need {
                break;
            }
            let entry = match self.top_mut().dirty.remove(PageId(pgno)) {
                Some(e) => e,
                None => continue,
            };
            let inner = self.env.inner();
            if writemap {
                inner.io.copy_into_map(PageId(pgno), entry.page.as_bytes())?;
            } else {
                inner.io.write_pages(PageId(pgno), entry.page.as_bytes())?;
            }
            let frame = self.top_mut();
            frame.spilled.push(PageId(pgno));
            frame.dirtyroom += npages as usize;
            freed += npages as usize;
            tracing::trace!(pgno, npages, "spilled dirty page");
        }
        if freed < need {
            return Err(Error::TxnFull { dirty: self.top().dirty.total_pages() });
        }
        Ok(())
    }

    /// Pull a spilled page back into the dirty set.
    fn unspill(&mut self, pgno: PageId) -> Result<()> {
        let npages = {
            let view = PageRef::new(self.env.inner().io.page(pgno)?)?;
            if view.flags().contains(PageFlags::LARGE) {
                view.large_pages().max(1)
            } else {
                1
            }
        };
        self.ensure_dirtyroom(npages)?;
        let bytes = self.env.inner().io.page_span(pgno, npages)?.to_vec();
        let buf = PageBuf::from_bytes(&bytes);
        for f in self.frames.iter_mut() {
            f.spilled.remove(pgno);
        }
        let frame = self.top_mut();
        frame.dirty.push(pgno, npages, buf);
        frame.dirtyroom -= npages;
        Ok(())
    }

    /// Make a page writable, returning its (possibly new) page number.
    /// The caller updates the parent link when the number changes.
    pub(crate) fn touch_page(&mut self, pgno: PageId) -> Result<PageId> {
        match self.page_state(pgno) {
            PageState::Dirty => {
                let _ = self.top_mut().dirty.get_mut(pgno);
                Ok(pgno)
            }
            PageState::Loose => Err(Error::corrupt(pgno, "touch of a loose page")),
            PageState::Spilled => {
                self.unspill(pgno)?;
                Ok(pgno)
            }
            PageState::Shadowed => {
                // Clone the parent's copy under the same number; the
                // parent keeps its image for abort.
                let bytes = {
                    let src = self.page(pgno)?;
                    src.as_bytes().to_vec()
                };
                self.ensure_dirtyroom(1)?;
                let frame = self.top_mut();
                frame.dirty.push(pgno, 1, PageBuf::from_bytes(&bytes));
                frame.dirtyroom -= 1;
                Ok(pgno)
            }
            PageState::Frozen => {
                let new_pgno = self.alloc_pages(1, AllocMode::default_policy())?;
                let bytes = self.env.inner().io.page(pgno)?.to_vec();
                let mut buf = PageBuf::from_bytes(&bytes);
                {
                    let mut page = buf.as_mut();
                    page.set_pgno(new_pgno);
                    page.set_txnid(self.txnid);
                }
                self.ensure_dirtyroom(1)?;
                let txnid = self.txnid;
                let frame = self.top_mut();
                frame.dirty.push(new_pgno, 1, buf);
                frame.dirtyroom -= 1;
                self.retire_pages(pgno, 1);
                tracing::trace!(old = pgno.0, new = new_pgno.0, txnid = txnid.0, "page touched");
                Ok(new_pgno)
            }
        }
    }

    /// Record that the prior contents of `[pgno, pgno+n)` are no longer
    /// referenced from the new root.
    pub(crate) fn retire_pages(&mut self, pgno: PageId, n: usize) {
        match self.page_state(pgno) {
            PageState::Dirty => {
                // Born and killed in this frame: reuse without GC.
                let frame = self.top_mut();
                if let Some(e) = frame.dirty.remove(pgno) {
                    frame.dirtyroom += e.npages as usize;
                }
                let frame = self.top_mut();
                if n == 1 {
                    frame.loose.push(pgno.0);
                } else {
                    frame.reclaim.insert_range(pgno, n);
                }
            }
            PageState::Spilled => {
                for f in self.frames.iter_mut() {
                    f.spilled.remove(pgno);
                }
                self.top_mut().retired.append_range(pgno, n);
            }
            _ => {
                self.top_mut().retired.append_range(pgno, n);
            }
        }
    }

    /// Allocate `n` contiguous pages.
    pub(crate) fn alloc_pages(&mut self, n: usize, mode: AllocMode) -> Result<PageId> {
        debug_assert!(n > 0);
        let reserve = mode.contains(AllocMode::RESERVE_ONLY);

        // Loose pages first: retired-and-dirty singles cost nothing.
        if !reserve && n == 1 {
            if let Some(pgno) = self.top_mut().loose.pop() {
                return Ok(PageId(pgno));
            }
        }

        loop {
            if !reserve {
                if let Some(i) = self.top_mut().reclaim.find_run(n) {
                    let base = self.top_mut().reclaim.take_run(i, n);
                    return Ok(base);
                }
            } else if self.top_mut().reclaim.len() >= n {
                return Ok(PageId::INVALID);
            }

            // Refill from the GC tree, bounded by the oldest reader.
            if mode.contains(AllocMode::CONSUME_GC)
                && !self.in_gc
                && self.top().reclaim.len() < RECLAIM_LIMIT
            {
                if self.consume_gc()? {
                    if self.coalesce {
                        let psize = self.env.inner().io.page_size();
                        let cap = crate::page::page_room(psize) / 8;
                        if self.top().reclaim.len() > cap * 3 / 4 {
                            self.coalesce = false;
                        }
                        continue;
                    }
                    continue;
                }
            }

            break;
        }

        if reserve {
            return Ok(PageId::INVALID);
        }

        if mode.contains(AllocMode::GROW) {
            match self.grow_tail(n) {
                Ok(base) => return Ok(base),
                Err(Error::MapFull { upper_pages }) => {
                    if self.kick_laggard()? {
                        if let Some(i) = self.top_mut().reclaim.find_run(n) {
                            let base = self.top_mut().reclaim.take_run(i, n);
                            return Ok(base);
                        }
                        if self.consume_gc()? {
                            if let Some(i) = self.top_mut().reclaim.find_run(n) {
                                let base = self.top_mut().reclaim.take_run(i, n);
                                return Ok(base);
                            }
                        }
                    }
                    return Err(Error::MapFull { upper_pages });
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TxnFull { dirty: self.top().dirty.total_pages() })
    }

    /// Append one reclaimable GC entry to the reclaim list. Returns
    /// whether an entry was consumed.
    fn consume_gc(&mut self) -> Result<bool> {
        let oldest = self.oldest_reader();
        let after = self.top().gc_consumed.iter().copied().max().unwrap_or(0);
        let gc = self.tree_handle(FREE_DBI)?;
        let next = tree::gc_first(self, &gc, after)?;
        let (key, pages) = match next {
            Some(kv) => kv,
            None => return Ok(false),
        };
        if key >= oldest.0 {
            // Everything left is pinned by a reader.
            return Ok(false);
        }
        let frame = self.top_mut();
        frame.gc_consumed.push(key);
        frame.reclaim.merge(&pages);
        tracing::debug!(key, pages = pages.len(), "consumed GC entry");
        Ok(true)
    }

    fn grow_tail(&mut self, n: usize) -> Result<PageId> {
        let inner = self.env.inner();
        let psize = inner.io.page_size() as u64;
        // The live mapping is the authoritative upper bound; it covers
        // at least the stored geometry and any enlargement this opener
        // requested.
        let upper_pages = inner.io.upper_bytes() / psize;
        let base = self.top().next_pgno;
        if base + n as u64 > upper_pages {
            return Err(Error::MapFull { upper_pages });
        }
        // Grow against the actually backed file size: after a rollback
        // recovery the meta's `now` can overstate what is on disk.
        let needed = (base + n as u64) * psize;
        if needed > inner.io.now_bytes() {
            let step = self.head.geo.grow_step().max(1);
            let new_now_pages = ((base + n as u64).div_ceil(step) * step).min(upper_pages);
            inner.io.grow(new_now_pages * psize)?;
        }
        let backed_pages = inner.io.now_bytes() / psize;
        let frame = self.top_mut();
        frame.geo_now = backed_pages;
        frame.next_pgno = base + n as u64;
        Ok(PageId(base))
    }

    /// Handle-slow-readers: give the application a chance to evict the
    /// laggard blocking reclamation. Returns whether to retry.
    fn kick_laggard(&mut self) -> Result<bool> {
        let inner = self.env.inner();
        let hsr = match inner.hsr.as_ref() {
            Some(h) => h,
            None => return Ok(false),
        };
        let laggard = inner
            .lck
            .reader_list()
            .into_iter()
            .filter(|r| r.txnid.0 != 0)
            .min_by_key(|r| r.txnid);
        let laggard = match laggard {
            Some(l) => l,
            None => return Ok(false),
        };
        match hsr(&laggard) {
            HsrDecision::Retry => Ok(true),
            HsrDecision::Evict => {
                inner.lck.evict(laggard.slot);
                Ok(true)
            }
            HsrDecision::Fail => Ok(false),
        }
    }

    /// Allocate a fresh dirty page of the given kind.
    pub(crate) fn new_page(&mut self, flags: PageFlags) -> Result<PageId> {
        let pgno = self.alloc_pages(1, AllocMode::default_policy())?;
        self.ensure_dirtyroom(1)?;
        let psize = self.env.inner().io.page_size();
        let buf = PageBuf::new_page(psize, pgno, flags, self.txnid);
        let frame = self.top_mut();
        frame.dirty.push(pgno, 1, buf);
        frame.dirtyroom -= 1;
        Ok(pgno)
    }

    /// Allocate a dirty large-value run.
    pub(crate) fn new_large_run(&mut self, value_len: usize) -> Result<(PageId, usize)> {
        let psize = self.env.inner().io.page_size();
        let npages = crate::page::large_run_pages(psize, value_len);
        let pgno = self.alloc_pages(npages, AllocMode::default_policy())?;
        self.ensure_dirtyroom(npages)?;
        let mut buf = PageBuf::alloc(psize, npages);
        {
            let mut page = buf.as_mut();
            page.init(pgno, PageFlags::LARGE, self.txnid);
            page.set_large_pages(npages);
        }
        let frame = self.top_mut();
        frame.dirty.push(pgno, npages, buf);
        frame.dirtyroom -= npages;
        Ok((pgno, npages))
    }

    /// Oldest snapshot any reader still pins; our own id when none.
    pub(crate) fn oldest_reader(&self) -> TxnId {
        self.env.inner().lck.oldest(self.txnid)
    }

    /// Cursor-keep: pin the listed pages at maximum LRU priority.
    pub(crate) fn keep_pages(&mut self, pgnos: &[u64]) {
        self.top_mut().dirty.keep(pgnos);
    }

    /// Store an updated tree handle back into the transaction.
    pub(crate) fn store_tree(&mut self, dbi: Dbi, handle: &TreeHandle) {
        let frame = self.top_mut();
        frame.trees.insert(dbi, *handle);
        frame.tree_dirty.insert(dbi);
    }

    /// Drop a dbi from this transaction (after `drop_db`), so commit
    /// does not resurrect its MAIN record.
    pub(crate) fn forget_tree(&mut self, dbi: Dbi) {
        let frame = self.top_mut();
        frame.trees.remove(&dbi);
        frame.tree_dirty.remove(&dbi);
    }

    /// The application canary, updated at commit.
    pub fn canary(&self) -> Canary {
        self.top().canary
    }

    /// Replace the canary payload; `v` is stamped by the engine.
    pub fn set_canary(&mut self, x: u32, y: u32, z: u32) {
        let frame = self.top_mut();
        frame.canary = Canary { x, y, z, v: frame.canary.v + 1 };
    }

    /// Begin a nested child transaction. The parent is untouchable
    /// until the child commits or aborts.
    pub fn begin_nested(&mut self) -> Result<NestedTxn<'_, 'env>> {
        self.assert_live()?;
        let cur = self.top();
        let frame = WriteFrame {
            dirty: DirtyList::new(),
            retired: Pnl::new(),
            reclaim: cur.reclaim.clone(),
            loose: Vec::new(),
            spilled: Pnl::new(),
            gc_consumed: cur.gc_consumed.clone(),
            dirtyroom: cur.dirtyroom,
            next_pgno: cur.next_pgno,
            geo_now: cur.geo_now,
            trees: cur.trees.clone(),
            tree_dirty: HashSet::new(),
            canary: cur.canary,
        };
        self.frames.push(frame);
        Ok(NestedTxn { txn: self, done: false })
    }

    fn merge_nested(&mut self) {
        debug_assert!(self.frames.len() > 1);
        let dp_limit = self.env.inner().dp_limit;
        let child = self.frames.pop().expect("nested frame present");
        let parent = self.frames.last_mut().expect("parent frame present");

        // Child retires of parent-dirty pages: drop the parent copy and
        // reuse the number instead of feeding the GC.
        let mut retired = child.retired;
        let mut really_retired = Pnl::new();
        for pgno in retired.iter_sorted() {
            if parent.dirty.contains(pgno) {
                parent.dirty.remove(pgno);
                parent.loose.push(pgno.0);
            } else {
                really_retired.push(pgno);
            }
        }
        parent.retired.merge(&really_retired);

        // Shadow copies replace the parent originals wholesale.
        let mut child_dirty = child.dirty;
        for e in child_dirty.take_sorted() {
            parent.dirty.remove(PageId(e.pgno));
            parent.dirty.push(PageId(e.pgno), e.npages as usize, e.page);
        }

        parent.reclaim = child.reclaim;
        parent.loose.extend(child.loose);
        parent.spilled.merge(&child.spilled);
        parent.gc_consumed = child.gc_consumed;
        parent.next_pgno = child.next_pgno;
        parent.geo_now = child.geo_now;
        parent.trees = child.trees;
        parent.tree_dirty.extend(child.tree_dirty);
        parent.canary = child.canary;
        parent.dirtyroom = dp_limit.saturating_sub(parent.dirty.total_pages());
    }

    fn discard_nested(&mut self) {
        debug_assert!(self.frames.len() > 1);
        self.frames.pop();
    }

    /// Commit this transaction, installing a new head meta.
    pub fn commit(mut self) -> Result<()> {
        if self.is_nested() {
            return Err(Error::InvalidParameter("commit the nested handle instead"));
        }
        self.assert_live()?;

        // Pure commit: nothing changed, no meta rotation needed.
        {
            let f = self.top();
            if f.dirty.is_empty()
                && f.retired.is_empty()
                && f.loose.is_empty()
                && f.gc_consumed.is_empty()
                && f.tree_dirty.is_empty()
                && f.spilled.is_empty()
            {
                tracing::debug!(txnid = self.txnid.0, "pure commit");
                self.committed = true;
                return Ok(());
            }
        }

        match self.commit_inner() {
            Ok(()) => {
                self.committed = true;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, txnid = self.txnid.0, "commit failed");
                self.env.inner().set_fatal();
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.flush_named_trees()?;
        self.gc_update()?;

        // Write dirty pages as contiguous runs.
        let inner = self.env.inner();
        let writemap = inner.writemap();
        let entries = self.top_mut().dirty.take_sorted();
        let psize = inner.io.page_size();
        let mut written_pages = 0u64;
        let mut i = 0;
        while i < entries.len() {
            let start = i;
            let base = entries[i].pgno;
            let mut next = base + entries[i].npages as u64;
            let mut bytes = entries[i].page.as_bytes().to_vec();
            i += 1;
            while i < entries.len() && entries[i].pgno == next {
                bytes.extend_from_slice(entries[i].page.as_bytes());
                next += entries[i].npages as u64;
                i += 1;
            }
            debug_assert_eq!(bytes.len() % psize, 0);
            if writemap {
                inner.io.copy_into_map(PageId(base), &bytes)?;
            } else {
                inner.io.write_pages(PageId(base), &bytes)?;
            }
            written_pages += (next - base) as u64;
            tracing::trace!(base, pages = next - base, run = i - start, "wrote dirty run");
        }

        // Durability: sync data before the meta references it. In
        // writemap mode the dirty pages live in the mapping, so an
        // msync over the used range replaces the file fsync; spilled
        // pages sit inside that range as well.
        let frame_next = self.top().next_pgno;
        let safe_nosync = inner.safe_nosync();
        let threshold = inner.lck.autosync_threshold();
        let mut steady = !safe_nosync;
        if safe_nosync && threshold > 0 {
            let unsynced = inner.lck.add_unsynced_pages(written_pages);
            if unsynced >= threshold {
                steady = true;
            }
        }
        if steady {
            if writemap {
                inner.io.msync(PageId(0), frame_next as usize)?;
            } else {
                inner.io.sync_data()?;
            }
            inner.lck.reset_unsynced_pages();
        } else {
            inner.lck.add_unsynced_pages(0);
        }

        // Geometry: tail shrink when enough pages sit past next_pgno.
        let mut geo_now = self.top().geo_now;
        let shrink = self.head.geo.shrink_step();
        if shrink > 0 && geo_now > frame_next + shrink {
            let step = self.head.geo.grow_step().max(1);
            let new_now = frame_next
                .div_ceil(step)
                .saturating_mul(step)
                .max(self.head.geo.lower)
                .max(NUM_METAS as u64);
            if new_now < geo_now {
                inner.io.shrink(new_now * psize as u64)?;
                geo_now = new_now;
            }
        }

        // Build and rotate the meta.
        let mut meta = self.head;
        meta.txnid = self.txnid;
        meta.geo.next = frame_next;
        meta.geo.now = geo_now;
        meta.geo.upper = inner.io.upper_bytes() / psize as u64;
        meta.trees = [
            self.top().trees[&FREE_DBI].desc,
            self.top().trees[&MAIN_DBI_SLOT].desc,
        ];
        meta.pages_retired = self.head.pages_retired + self.top().retired.len() as u64;
        meta.canary = self.top().canary;
        meta.bootid = inner.bootid;
        let triad = inner.read_triad()?;
        let slot = triad.target();
        inner.write_meta(&meta, slot, steady)?;
        tracing::debug!(
            txnid = self.txnid.0,
            slot,
            steady,
            pages = written_pages,
            "commit installed new head"
        );
        Ok(())
    }

    /// Persist the descriptors of modified named databases into MAIN.
    fn flush_named_trees(&mut self) -> Result<()> {
        let dirty_named: Vec<Dbi> = self
            .top()
            .tree_dirty
            .iter()
            .copied()
            .filter(|&dbi| dbi > MAIN_DBI_SLOT)
            .collect();
        if dirty_named.is_empty() {
            return Ok(());
        }
        let mut main = self.tree_handle(MAIN_DBI_SLOT)?;
        for dbi in dirty_named {
            let name = self.env.inner().dbi_name(dbi)?;
            let mut desc = self.top().trees[&dbi].desc;
            desc.mod_txnid = self.txnid;
            tree::put_subdb_record(self, &mut main, name.as_bytes(), &desc)?;
        }
        self.store_tree(MAIN_DBI_SLOT, &main);
        Ok(())
    }

    /// The GC update loop: converts the retired list into GC records
    /// while its own tree work draws from the same pool, iterating
    /// until the lists stabilize.
    fn gc_update(&mut self) -> Result<()> {
        // Prime the reclaim list so GC tree edits do not recurse into
        // GC consumption mid-update.
        let _ = self.alloc_pages(GC_RESERVE_SLACK, AllocMode::CONSUME_GC | AllocMode::RESERVE_ONLY);
        self.in_gc = true;
        let result = self.gc_update_inner();
        self.in_gc = false;
        result
    }

    fn gc_update_inner(&mut self) -> Result<()> {
        let key = self.txnid.0;
        let mut cleaned: HashSet<u64> = HashSet::new();
        let mut stored: Option<Vec<u64>> = None;

        for _iter in 0..GC_UPDATE_CAP {
            // Remove the GC entries this transaction consumed.
            let pending: Vec<u64> = self
                .top()
                .gc_consumed
                .iter()
                .copied()
                .filter(|k| !cleaned.contains(k))
                .collect();
            let mut gc = self.tree_handle(FREE_DBI)?;
            for k in pending {
                match tree::del(self, &mut gc, &k.to_le_bytes(), None) {
                    Ok(()) | Err(Error::KeyNotFound) => {}
                    Err(e) => return Err(e),
                }
                cleaned.insert(k);
            }
            self.store_tree(FREE_DBI, &gc);

            // Loose pages become ordinary retires at commit time.
            let loose: Vec<u64> = std::mem::take(&mut self.top_mut().loose);
            for pgno in loose {
                self.top_mut().retired.push(PageId(pgno));
            }

            // Everything reclaimable that outlived its use goes back
            // under this transaction's key: the retired pages plus the
            // unused remainder of the reclaim list.
            let mut payload = self.top().retired.clone();
            payload.merge(&self.top().reclaim.clone());
            payload.sort();

            if payload.is_empty() && cleaned.is_empty() {
                return Ok(());
            }

            let settled = stored.as_deref() == Some(payload.as_slice())
                && self.top().loose.is_empty()
                && self.top().gc_consumed.iter().all(|k| cleaned.contains(k));
            if settled {
                tracing::debug!(pages = payload.len(), "GC update stable");
                return Ok(());
            }

            let mut gc = self.tree_handle(FREE_DBI)?;
            if !payload.is_empty() {
                let bytes = payload.to_bytes();
                tree::put(self, &mut gc, &key.to_le_bytes(), &bytes, crate::db::PutFlags::empty())?;
            } else {
                match tree::del(self, &mut gc, &key.to_le_bytes(), None) {
                    Ok(()) | Err(Error::KeyNotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            self.store_tree(FREE_DBI, &gc);
            stored = Some(payload.as_slice().to_vec());
        }
        Err(Error::corrupt(PageId::INVALID, "GC update loop diverged"))
    }

    /// Abort: discard every dirty page and release the writer mutex.
    pub fn abort(self) {}
}

impl TxnRead for WriteTxn<'_> {
    fn id(&self) -> TxnId {
        self.txnid
    }

    fn env_inner(&self) -> &EnvInner {
        self.env.inner()
    }

    fn page(&self, pgno: PageId) -> Result<PageRef<'_>> {
        for frame in self.frames.iter().rev() {
            if let Some(buf) = frame.dirty.get(pgno) {
                return Ok(buf.as_page());
            }
        }
        // Spilled pages were written through the file and the shared
        // mapping stays coherent, so the map view is current.
        PageRef::new(self.env.inner().io.page(pgno)?)
    }

    fn page_run(&self, pgno: PageId, npages: usize) -> Result<PageRef<'_>> {
        for frame in self.frames.iter().rev() {
            if let Some(buf) = frame.dirty.get(pgno) {
                return PageRef::new(buf.as_bytes());
            }
        }
        PageRef::new(self.env.inner().io.page_span(pgno, npages)?)
    }

    fn tree_handle(&self, dbi: Dbi) -> Result<TreeHandle> {
        if let Some(h) = self.top().trees.get(&dbi) {
            return Ok(*h);
        }
        let h = self.env.inner().load_named_handle(self, dbi)?;
        Ok(h)
    }

    fn assert_live(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::BadTransaction);
        }
        self.env.inner().check_fatal()
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(txnid = self.txnid.0, "write transaction aborted");
        }
    }
}

/// A nested child transaction; commits into the parent, aborts alone.
pub struct NestedTxn<'p, 'env> {
    txn: &'p mut WriteTxn<'env>,
    done: bool,
}

impl<'p, 'env> NestedTxn<'p, 'env> {
    /// Merge this child's changes into the parent.
    pub fn commit(mut self) -> Result<()> {
        self.txn.assert_live()?;
        self.txn.merge_nested();
        self.done = true;
        Ok(())
    }

    /// Discard this child's changes only.
    pub fn abort(mut self) {
        self.txn.discard_nested();
        self.done = true;
    }
}

impl<'env> std::ops::Deref for NestedTxn<'_, 'env> {
    type Target = WriteTxn<'env>;

    fn deref(&self) -> &Self::Target {
        self.txn
    }
}

impl std::ops::DerefMut for NestedTxn<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn
    }
}

impl Drop for NestedTxn<'_, '_> {
    fn drop(&mut self) {
        if !self.done {
            self.txn.discard_nested();
        }
    }
}
