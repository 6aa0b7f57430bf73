//! B+tree page operations
//!
//! Descent produces a root-to-leaf path of `(pgno, index)` frames; all
//! structural mutation (insert, split, delete, merge, rebalance) works
//! bottom-up along that path. Write descents touch every page on the
//! way down, so by the time a leaf changes the whole path is dirty and
//! parent links can be patched in place.

use crate::db::{PutFlags, TreeHandle};
use crate::dupsort;
use crate::error::{Error, PageId, Result};
use crate::meta::{TREE_DESC_SIZE, TreeDesc};
use crate::page::{
    NodeFlags, NodePayload, NodeRef, PAGE_HDR, PageFlags, PageRef, large_run_pages,
    max_inline_value, max_key_size, page_room,
};
use crate::pnl::Pnl;
use crate::txn::{TxnRead, WriteTxn};

/// Pages fuller than this fraction of the payload area are never
/// rebalanced (the merge threshold, in quarters).
const MERGE_THRESHOLD_QUARTERS: usize = 1;

/// Hard bound on tree height, a corruption guard.
const MAX_DEPTH: usize = 32;

/// A root-to-leaf descent: `(pgno, index)` per level.
#[derive(Debug, Clone, Default)]
pub(crate) struct Path {
    pub stack: Vec<(PageId, usize)>,
}

impl Path {
    /// The leaf frame.
    pub fn leaf(&self) -> (PageId, usize) {
        *self.stack.last().expect("path has a leaf frame")
    }

    pub fn leaf_mut(&mut self) -> &mut (PageId, usize) {
        self.stack.last_mut().expect("path has a leaf frame")
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// Owned copy of one node, used to rebuild pages across splits and
/// merges.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub key: Vec<u8>,
    pub payload: Payload,
    pub flags: NodeFlags,
}

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Inline(Vec<u8>),
    Large(PageId, u32),
    Child(PageId),
}

impl Entry {
    fn as_node_payload(&self) -> NodePayload<'_> {
        match &self.payload {
            Payload::Inline(v) => NodePayload::Inline(v),
            Payload::Large(p, l) => NodePayload::Large(*p, *l),
            Payload::Child(c) => NodePayload::Child(*c),
        }
    }

    /// Bytes this entry needs on a page, slot included.
    fn need(&self, fixed: usize) -> usize {
        if fixed != 0 {
            return fixed;
        }
        let stored = match &self.payload {
            Payload::Inline(v) => v.len(),
            Payload::Large(..) => 8,
            Payload::Child(_) => 0,
        };
        let raw = crate::page::NODE_HDR + self.key.len() + stored;
        raw + (raw & 1) + 2
    }
}

fn leaf_flags(h: &TreeHandle) -> PageFlags {
    if h.fixed != 0 {
        PageFlags::LEAF | PageFlags::LEAF_FIXED
    } else {
        PageFlags::LEAF
    }
}

/// Collect owned entries of a slot-directory or dupfix page.
pub(crate) fn page_entries(page: PageRef<'_>) -> Result<Vec<Entry>> {
    let mut out = Vec::with_capacity(page.nkeys());
    if page.is_dupfix() {
        for i in 0..page.nkeys() {
            out.push(Entry {
                key: page.dupfix_key(i)?.to_vec(),
                payload: Payload::Inline(Vec::new()),
                flags: NodeFlags::empty(),
            });
        }
        return Ok(out);
    }
    for i in 0..page.nkeys() {
        let node = page.node(i)?;
        let payload = if page.is_branch() {
            Payload::Child(node.child()?)
        } else if node.flags().contains(NodeFlags::BIGDATA) {
            Payload::Large(node.large_pgno()?, node.value_len() as u32)
        } else {
            Payload::Inline(node.value()?.to_vec())
        };
        out.push(Entry { key: node.key()?.to_vec(), payload, flags: node.flags() });
    }
    Ok(out)
}

/// Rebuild a dirty page from owned entries.
fn rebuild_page(
    txn: &mut WriteTxn<'_>,
    h: &TreeHandle,
    pgno: PageId,
    flags: PageFlags,
    entries: &[Entry],
) -> Result<()> {
    let txnid = txn.id();
    let buf = txn.dirty_page_mut(pgno)?;
    let mut page = buf.as_mut();
    page.init(pgno, flags, txnid);
    if flags.contains(PageFlags::LEAF_FIXED) {
        page.set_ksize(h.fixed as usize);
        for (i, e) in entries.iter().enumerate() {
            page.insert_dupfix(i, &e.key)?;
        }
    } else {
        for (i, e) in entries.iter().enumerate() {
            page.insert_node(i, &e.key, e.as_node_payload(), e.flags)?;
        }
    }
    Ok(())
}

fn page_capacity(txn: &impl TxnRead) -> usize {
    page_room(txn.env_inner().io.page_size())
}

fn entries_fit(entries: &[Entry], fixed: usize, capacity: usize) -> bool {
    entries.iter().map(|e| e.need(fixed)).sum::<usize>() <= capacity
}

/// Whether a page is below the merge threshold or its structural
/// minimum.
fn underfull(page: PageRef<'_>, is_root: bool) -> bool {
    if is_root {
        return false;
    }
    let cap = page.as_bytes().len() - PAGE_HDR;
    let used = page.used_space() - PAGE_HDR;
    if page.is_branch() && page.nkeys() < 2 {
        return true;
    }
    if page.is_leaf() && page.nkeys() < 1 {
        return true;
    }
    used < cap * MERGE_THRESHOLD_QUARTERS / 4
}

// ---------------------------------------------------------------------------
// Read-side descent

/// Descend to the leaf that should hold `key`. `None` on an empty tree;
/// the bool reports an exact match.
pub(crate) fn seek<T: TxnRead>(txn: &T, h: &TreeHandle, key: &[u8]) -> Result<Option<(Path, bool)>> {
    if !h.desc.root.is_valid() {
        return Ok(None);
    }
    let mut path = Path::default();
    let mut pgno = h.desc.root;
    for _ in 0..MAX_DEPTH {
        let page = txn.page(pgno)?;
        page.validate(PageFlags::BRANCH | PageFlags::LEAF)?;
        if page.is_branch() {
            let i = page.branch_descend(key, h.cmp)?;
            path.stack.push((pgno, i));
            pgno = page.child(i)?;
            continue;
        }
        let res = page.search(key, h.cmp)?;
        path.stack.push((pgno, res.index()));
        return Ok(Some((path, res.is_found())));
    }
    Err(Error::corrupt(pgno, "descent exceeded the depth bound"))
}

/// Descend to the first or last entry. `None` on an empty tree.
pub(crate) fn seek_edge<T: TxnRead>(txn: &T, h: &TreeHandle, last: bool) -> Result<Option<Path>> {
    if !h.desc.root.is_valid() {
        return Ok(None);
    }
    let mut path = Path::default();
    let mut pgno = h.desc.root;
    for _ in 0..MAX_DEPTH {
        let page = txn.page(pgno)?;
        page.validate(PageFlags::BRANCH | PageFlags::LEAF)?;
        let i = if last { page.nkeys().saturating_sub(1) } else { 0 };
        path.stack.push((pgno, i));
        if page.is_leaf() {
            if page.nkeys() == 0 {
                return Ok(None);
            }
            return Ok(Some(path));
        }
        pgno = page.child(i)?;
    }
    Err(Error::corrupt(pgno, "descent exceeded the depth bound"))
}

/// Position on the first entry with key >= `key`. `None` when no such
/// entry exists.
pub(crate) fn seek_range<T: TxnRead>(txn: &T, h: &TreeHandle, key: &[u8]) -> Result<Option<Path>> {
    let Some((mut path, _exact)) = seek(txn, h, key)? else {
        return Ok(None);
    };
    let (pgno, idx) = path.leaf();
    let page = txn.page(pgno)?;
    if idx >= page.nkeys() {
        if !path_next(txn, h, &mut path)? {
            return Ok(None);
        }
    }
    Ok(Some(path))
}

/// Advance a path to the next entry. Returns false at the end.
pub(crate) fn path_next<T: TxnRead>(txn: &T, _h: &TreeHandle, path: &mut Path) -> Result<bool> {
    let (pgno, idx) = path.leaf();
    let page = txn.page(pgno)?;
    if idx + 1 < page.nkeys() {
        path.leaf_mut().1 = idx + 1;
        return Ok(true);
    }
    // Walk up to the first ancestor with a right sibling, then down its
    // leftmost spine.
    let mut level = path.depth().wrapping_sub(1);
    loop {
        if level == 0 {
            return Ok(false);
        }
        level -= 1;
        let (ppgno, pidx) = path.stack[level];
        let parent = txn.page(ppgno)?;
        if pidx + 1 < parent.nkeys() {
            path.stack.truncate(level + 1);
            path.stack[level].1 = pidx + 1;
            let mut pgno = parent.child(pidx + 1)?;
            loop {
                let page = txn.page(pgno)?;
                path.stack.push((pgno, 0));
                if page.is_leaf() {
                    if page.nkeys() == 0 {
                        return Err(Error::corrupt(pgno, "empty leaf below a branch"));
                    }
                    return Ok(true);
                }
                pgno = page.child(0)?;
            }
        }
    }
}

/// Step a path back to the previous entry. Returns false at the start.
pub(crate) fn path_prev<T: TxnRead>(txn: &T, _h: &TreeHandle, path: &mut Path) -> Result<bool> {
    let (_pgno, idx) = path.leaf();
    if idx > 0 {
        path.leaf_mut().1 = idx - 1;
        return Ok(true);
    }
    let mut level = path.depth().wrapping_sub(1);
    loop {
        if level == 0 {
            return Ok(false);
        }
        level -= 1;
        let (ppgno, pidx) = path.stack[level];
        let parent = txn.page(ppgno)?;
        if pidx > 0 {
            path.stack.truncate(level + 1);
            path.stack[level].1 = pidx - 1;
            let mut pgno = parent.child(pidx - 1)?;
            loop {
                let page = txn.page(pgno)?;
                let i = page.nkeys().saturating_sub(1);
                path.stack.push((pgno, i));
                if page.is_leaf() {
                    if page.nkeys() == 0 {
                        return Err(Error::corrupt(pgno, "empty leaf below a branch"));
                    }
                    return Ok(true);
                }
                pgno = page.child(i)?;
            }
        }
    }
}

/// The node a path points at.
pub(crate) fn node_at<'t, T: TxnRead>(txn: &'t T, path: &Path) -> Result<NodeRef<'t>> {
    let (pgno, idx) = path.leaf();
    let page = txn.page(pgno)?;
    page.node(idx)
}

/// Key and resolved value at a path position. Duplicate sets resolve to
/// their first value.
pub(crate) fn entry_at<'t, T: TxnRead>(
    txn: &'t T,
    h: &TreeHandle,
    path: &Path,
) -> Result<(&'t [u8], &'t [u8])> {
    let (pgno, idx) = path.leaf();
    let page = txn.page(pgno)?;
    if page.is_dupfix() {
        return Ok((page.dupfix_key(idx)?, &[]));
    }
    let node = page.node(idx)?;
    let key = node.key()?;
    let value = resolve_value(txn, h, node)?;
    Ok((key, value))
}

/// Resolve a leaf node's value: inline bytes, a large run, or the first
/// duplicate.
pub(crate) fn resolve_value<'t, T: TxnRead>(
    txn: &'t T,
    h: &TreeHandle,
    node: NodeRef<'t>,
) -> Result<&'t [u8]> {
    let flags = node.flags();
    if flags.contains(NodeFlags::DUPDATA) {
        return dupsort::first_dup(txn, h, node);
    }
    if flags.contains(NodeFlags::BIGDATA) {
        return large_value(txn, node);
    }
    node.value()
}

/// Value bytes of a `BIGDATA` node.
pub(crate) fn large_value<'t, T: TxnRead>(txn: &'t T, node: NodeRef<'t>) -> Result<&'t [u8]> {
    let len = node.value_len();
    let base = node.large_pgno()?;
    let psize = txn.env_inner().io.page_size();
    let npages = large_run_pages(psize, len);
    let run = txn.page_run(base, npages)?;
    run.validate(PageFlags::LARGE)?;
    run.large_value(len)
}

/// Point lookup.
pub fn get<'t, T: TxnRead>(txn: &'t T, h: &TreeHandle, key: &[u8]) -> Result<Option<&'t [u8]>> {
    let Some((path, exact)) = seek(txn, h, key)? else {
        return Ok(None);
    };
    if !exact {
        return Ok(None);
    }
    let node = node_at(txn, &path)?;
    Ok(Some(resolve_value(txn, h, node)?))
}

// ---------------------------------------------------------------------------
// Write-side descent

/// Descend to the leaf for `key`, touching every page on the way so the
/// whole path is dirty. Parent child links follow page renames.
pub(crate) fn seek_touch(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    key: &[u8],
) -> Result<(Path, bool)> {
    let root = txn.touch_page(h.desc.root)?;
    h.desc.root = root;
    let mut path = Path::default();
    let mut pgno = root;
    for _ in 0..MAX_DEPTH {
        let (is_branch, i, child, found) = {
            let page = txn.page(pgno)?;
            page.validate(PageFlags::BRANCH | PageFlags::LEAF)?;
            if page.is_branch() {
                let i = page.branch_descend(key, h.cmp)?;
                (true, i, page.child(i)?, false)
            } else {
                let res = page.search(key, h.cmp)?;
                (false, res.index(), PageId::INVALID, res.is_found())
            }
        };
        path.stack.push((pgno, i));
        if !is_branch {
            // Cursor-keep: the active path gets maximum LRU priority so
            // the spill policy never writes it out from under us.
            let pgnos: Vec<u64> = path.stack.iter().map(|(p, _)| p.0).collect();
            txn.keep_pages(&pgnos);
            return Ok((path, found));
        }
        let touched = txn.touch_page(child)?;
        if touched != child {
            set_child(txn, pgno, i, touched)?;
        }
        pgno = touched;
    }
    Err(Error::corrupt(pgno, "descent exceeded the depth bound"))
}

/// Patch the child pointer of a dirty branch page.
pub(crate) fn set_child(
    txn: &mut WriteTxn<'_>,
    branch_pgno: PageId,
    idx: usize,
    child: PageId,
) -> Result<()> {
    txn.dirty_page_mut(branch_pgno)?.as_mut().set_node_child(idx, child)
}

// ---------------------------------------------------------------------------
// Insert

/// Insert or replace a key/value pair.
pub fn put(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    key: &[u8],
    value: &[u8],
    flags: PutFlags,
) -> Result<()> {
    let psize = txn.env_inner().io.page_size();
    check_key(h, key, psize)?;
    if h.is_dupsort() && value.len() > max_key_size(psize) {
        return Err(Error::KeyTooLong { len: value.len(), max: max_key_size(psize) });
    }
    h.desc.mod_txnid = txn.id();

    // Empty tree: plant the root leaf.
    if !h.desc.root.is_valid() {
        let root = txn.new_page(leaf_flags(h))?;
        if h.fixed != 0 {
            let fixed = h.fixed as usize;
            txn.dirty_page_mut(root)?.as_mut().set_ksize(fixed);
        }
        h.desc.root = root;
        h.desc.depth = 1;
        h.desc.leaf_pages = 1;
        let entry = make_leaf_entry(txn, h, key, value, psize)?;
        let path = Path { stack: vec![(root, 0)] };
        insert_entry(txn, h, &path, path.depth() - 1, 0, entry)?;
        h.desc.entries += 1;
        return Ok(());
    }

    if flags.contains(PutFlags::APPEND) {
        let last = seek_edge(txn, h, true)?;
        if let Some(p) = last {
            let (lk, _) = entry_at(txn, h, &p)?;
            if h.cmp.cmp(key, lk) != std::cmp::Ordering::Greater {
                return Err(Error::InvalidParameter("append key not past the last key"));
            }
        }
    }

    let (path, exact) = seek_touch(txn, h, key)?;

    if exact {
        if h.fixed != 0 {
            // Dupfix entry: the value is the key; an exact hit is the
            // duplicate already being present.
            if flags.contains(PutFlags::NO_OVERWRITE) {
                return Err(Error::KeyExist);
            }
            return Ok(());
        }
        if h.is_dupsort() {
            // NO_OVERWRITE is a key-level refusal; NO_DUP_DATA is the
            // pair-level one and is handled inside the duplicate set.
            if flags.contains(PutFlags::NO_OVERWRITE) {
                return Err(Error::KeyExist);
            }
            let added = dupsort::dup_put(txn, h, &path, value, flags)?;
            if added {
                h.desc.entries += 1;
            }
            return Ok(());
        }
        if node_at(txn, &path)?.flags().contains(NodeFlags::SUBDATA) {
            return Err(Error::Incompatible);
        }
        if flags.contains(PutFlags::NO_OVERWRITE) {
            return Err(Error::KeyExist);
        }
        // Retire the old out-of-line value before the node goes away.
        let old_large = {
            let node = node_at(txn, &path)?;
            if node.flags().contains(NodeFlags::BIGDATA) {
                Some((node.large_pgno()?, large_run_pages(psize, node.value_len())))
            } else {
                None
            }
        };
        if let Some((base, n)) = old_large {
            txn.retire_pages(base, n);
            h.desc.large_pages = h.desc.large_pages.saturating_sub(n as u64);
        }
        let (pgno, idx) = path.leaf();
        // In-place overwrite when the size matches; otherwise replace.
        if old_large.is_none() {
            let same_len = node_at(txn, &path)?.value_len() == value.len();
            if same_len {
                txn.dirty_page_mut(pgno)?.as_mut().replace_value(idx, value)?;
                return Ok(());
            }
        }
        txn.dirty_page_mut(pgno)?.as_mut().del_node(idx)?;
        let entry = make_leaf_entry(txn, h, key, value, psize)?;
        insert_entry(txn, h, &path, path.depth() - 1, idx, entry)?;
        return Ok(());
    }

    let (_, idx) = path.leaf();
    let entry = make_leaf_entry(txn, h, key, value, psize)?;
    insert_entry(txn, h, &path, path.depth() - 1, idx, entry)?;
    h.desc.entries += 1;
    Ok(())
}

fn check_key(h: &TreeHandle, key: &[u8], psize: usize) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidParameter("empty key"));
    }
    let max = max_key_size(psize);
    if key.len() > max {
        return Err(Error::KeyTooLong { len: key.len(), max });
    }
    h.cmp.check_key(key)
}

/// Build the leaf entry for a value, moving it out of line when it
/// exceeds the inline bound.
fn make_leaf_entry(
    txn: &mut WriteTxn<'_>,
    h: &TreeHandle,
    key: &[u8],
    value: &[u8],
    psize: usize,
) -> Result<Entry> {
    if h.fixed != 0 {
        return Ok(Entry {
            key: key.to_vec(),
            payload: Payload::Inline(Vec::new()),
            flags: NodeFlags::empty(),
        });
    }
    if !h.is_dupsort() && value.len() > max_inline_value(psize, key.len()) {
        let (base, npages) = txn.new_large_run(value.len())?;
        txn.dirty_page_mut(base)?.as_mut().write_large_value(value)?;
        return Ok(Entry {
            key: key.to_vec(),
            payload: Payload::Large(base, value.len() as u32),
            flags: NodeFlags::BIGDATA,
        });
    }
    Ok(Entry {
        key: key.to_vec(),
        payload: Payload::Inline(value.to_vec()),
        flags: NodeFlags::empty(),
    })
}

/// Insert an owned entry at `(level, idx)`, splitting as needed.
pub(crate) fn insert_entry(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: &Path,
    level: usize,
    idx: usize,
    entry: Entry,
) -> Result<()> {
    let (pgno, _) = path.stack[level];
    let fixed = page_fixed(txn, pgno)?;
    let fits = {
        let page = txn.page(pgno)?;
        entry.need(fixed) <= page.room()
    };
    if fits {
        let buf = txn.dirty_page_mut(pgno)?;
        let mut page = buf.as_mut();
        if fixed != 0 {
            page.insert_dupfix(idx, &entry.key)?;
        } else {
            page.insert_node(idx, &entry.key, entry.as_node_payload(), entry.flags)?;
        }
        return Ok(());
    }
    split(txn, h, path, level, idx, entry)
}

fn page_fixed(txn: &impl TxnRead, pgno: PageId) -> Result<usize> {
    let page = txn.page(pgno)?;
    Ok(if page.is_dupfix() { page.ksize() } else { 0 })
}

/// Split the page at `level`, inserting `entry` at `idx` in the
/// combined order, and push the separator into the parent.
fn split(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: &Path,
    level: usize,
    idx: usize,
    entry: Entry,
) -> Result<()> {
    let (pgno, _) = path.stack[level];
    let capacity = page_capacity(txn);
    let (flags, fixed, mut entries) = {
        let page = txn.page(pgno)?;
        let fixed = if page.is_dupfix() { page.ksize() } else { 0 };
        (page.flags(), fixed, page_entries(page)?)
    };
    let is_branch = flags.contains(PageFlags::BRANCH);
    entries.insert(idx, entry);
    let total = entries.len();

    // Split point: center by default, edge-biased for append patterns.
    let mut split_at = if idx + 1 == total {
        total - 1
    } else if idx == 0 {
        1
    } else {
        total / 2
    };
    split_at = split_at.clamp(1, total - 1);
    if is_branch && total >= 4 {
        split_at = split_at.clamp(2, total - 2);
    }
    while !entries_fit(&entries[..split_at], fixed, capacity) {
        split_at -= 1;
        if split_at == 0 {
            return Err(Error::corrupt(pgno, "unsplittable page"));
        }
    }
    while !entries_fit(&entries[split_at..], fixed, capacity) {
        split_at += 1;
        if split_at >= total {
            return Err(Error::corrupt(pgno, "unsplittable page"));
        }
    }

    let right_pgno = txn.new_page(flags)?;
    if fixed != 0 {
        txn.dirty_page_mut(right_pgno)?.as_mut().set_ksize(fixed);
    }
    let separator = entries[split_at].key.clone();
    let right_entries = entries.split_off(split_at);
    rebuild_page(txn, h, pgno, flags, &entries)?;
    rebuild_page(txn, h, right_pgno, flags, &right_entries)?;
    if is_branch {
        h.desc.branch_pages += 1;
    } else {
        h.desc.leaf_pages += 1;
    }
    tracing::trace!(
        left = pgno.0,
        right = right_pgno.0,
        at = split_at,
        total,
        "page split"
    );

    let sep_entry = Entry {
        key: separator,
        payload: Payload::Child(right_pgno),
        flags: NodeFlags::empty(),
    };

    if level == 0 {
        // Root split: grow a fresh root above.
        let new_root = txn.new_page(PageFlags::BRANCH)?;
        {
            let txnid = txn.id();
            let buf = txn.dirty_page_mut(new_root)?;
            let mut page = buf.as_mut();
            page.init(new_root, PageFlags::BRANCH, txnid);
            page.insert_node(0, &[], NodePayload::Child(pgno), NodeFlags::empty())?;
            page.insert_node(1, &sep_entry.key, NodePayload::Child(right_pgno), NodeFlags::empty())?;
        }
        h.desc.root = new_root;
        h.desc.depth += 1;
        h.desc.branch_pages += 1;
        return Ok(());
    }

    let (_, parent_idx) = path.stack[level - 1];
    insert_entry(txn, h, path, level - 1, parent_idx + 1, sep_entry)
}

/// Insert or refresh a named-database record in MAIN.
pub(crate) fn put_subdb_record(
    txn: &mut WriteTxn<'_>,
    main: &mut TreeHandle,
    name: &[u8],
    desc: &TreeDesc,
) -> Result<()> {
    let mut bytes = vec![0u8; TREE_DESC_SIZE];
    desc.encode(&mut bytes);
    main.desc.mod_txnid = txn.id();

    if !main.desc.root.is_valid() {
        let root = txn.new_page(PageFlags::LEAF)?;
        main.desc.root = root;
        main.desc.depth = 1;
        main.desc.leaf_pages = 1;
    }
    let (path, exact) = seek_touch(txn, main, name)?;
    let (pgno, idx) = path.leaf();
    if exact {
        // Descriptors never change size; refresh in place.
        txn.dirty_page_mut(pgno)?.as_mut().replace_value(idx, &bytes)?;
        return Ok(());
    }
    let entry = Entry {
        key: name.to_vec(),
        payload: Payload::Inline(bytes),
        flags: NodeFlags::SUBDATA,
    };
    insert_entry(txn, main, &path, path.depth() - 1, idx, entry)?;
    main.desc.entries += 1;
    Ok(())
}

// ---------------------------------------------------------------------------
// Delete

/// Delete a key, or one duplicate of it.
pub fn del(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<()> {
    let psize = txn.env_inner().io.page_size();
    check_key(h, key, psize)?;
    if !h.desc.root.is_valid() {
        return Err(Error::KeyNotFound);
    }
    let (path, exact) = seek_touch(txn, h, key)?;
    if !exact {
        return Err(Error::KeyNotFound);
    }
    h.desc.mod_txnid = txn.id();

    let node_flags = if h.fixed != 0 { NodeFlags::empty() } else { node_at(txn, &path)?.flags() };
    if node_flags.contains(NodeFlags::DUPDATA) {
        let removed = dupsort::dup_del(txn, h, &path, value)?;
        h.desc.entries = h.desc.entries.saturating_sub(removed);
        return Ok(());
    }
    if h.is_dupsort() && value.is_some() {
        // Single-value node: the duplicate must match it exactly.
        let (_, v) = entry_at(txn, h, &path)?;
        if let Some(want) = value {
            if h.dcmp.cmp(v, want) != std::cmp::Ordering::Equal {
                return Err(Error::NotFound);
            }
        }
    }

    remove_leaf_entry(txn, h, path)?;
    h.desc.entries = h.desc.entries.saturating_sub(1);
    Ok(())
}

/// Remove the node a path points at and rebalance the tree.
pub(crate) fn remove_leaf_entry(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: Path,
) -> Result<()> {
    let psize = txn.env_inner().io.page_size();
    let (pgno, idx) = path.leaf();
    let fixed = page_fixed(txn, pgno)?;
    if fixed != 0 {
        txn.dirty_page_mut(pgno)?.as_mut().del_dupfix(idx)?;
    } else {
        let node = node_at(txn, &path)?;
        if node.flags().contains(NodeFlags::BIGDATA) {
            let base = node.large_pgno()?;
            let n = large_run_pages(psize, node.value_len());
            txn.retire_pages(base, n);
            h.desc.large_pages = h.desc.large_pages.saturating_sub(n as u64);
        }
        txn.dirty_page_mut(pgno)?.as_mut().del_node(idx)?;
    }
    rebalance(txn, h, &path, path.depth() - 1)
}

/// Restore fill invariants from `level` upward.
fn rebalance(txn: &mut WriteTxn<'_>, h: &mut TreeHandle, path: &Path, level: usize) -> Result<()> {
    let (pgno, _) = path.stack[level];
    let (is_branch, nkeys, under) = {
        let page = txn.page(pgno)?;
        (page.is_branch(), page.nkeys(), underfull(page, level == 0))
    };

    if level == 0 {
        // Root shrink transitions.
        if is_branch && nkeys == 1 {
            let child = {
                let page = txn.page(pgno)?;
                page.child(0)?
            };
            txn.retire_pages(pgno, 1);
            h.desc.branch_pages = h.desc.branch_pages.saturating_sub(1);
            h.desc.root = child;
            h.desc.depth = h.desc.depth.saturating_sub(1);
            tracing::trace!(old_root = pgno.0, new_root = child.0, "root collapsed");
            let sub_path = Path { stack: vec![(child, 0)] };
            return rebalance(txn, h, &sub_path, 0);
        }
        if !is_branch && nkeys == 0 {
            txn.retire_pages(pgno, 1);
            h.desc.leaf_pages = h.desc.leaf_pages.saturating_sub(1);
            h.desc.root = PageId::INVALID;
            h.desc.depth = 0;
        }
        return Ok(());
    }

    if !under {
        return Ok(());
    }

    let capacity = page_capacity(txn);
    let (parent_pgno, pidx) = path.stack[level - 1];
    let parent_nkeys = {
        let parent = txn.page(parent_pgno)?;
        parent.nkeys()
    };

    // Prefer the sibling that lets us merge outright.
    let left_idx = pidx.checked_sub(1);
    let right_idx = if pidx + 1 < parent_nkeys { Some(pidx + 1) } else { None };

    let fixed = page_fixed(txn, pgno)?;
    let my_entries = {
        let page = txn.page(pgno)?;
        page_entries(page)?
    };

    let pick = |txn: &mut WriteTxn<'_>, sib_idx: usize| -> Result<(PageId, Vec<Entry>)> {
        let sib_pgno = {
            let parent = txn.page(parent_pgno)?;
            parent.child(sib_idx)?
        };
        let touched = txn.touch_page(sib_pgno)?;
        if touched != sib_pgno {
            set_child(txn, parent_pgno, sib_idx, touched)?;
        }
        let entries = {
            let page = txn.page(touched)?;
            page_entries(page)?
        };
        Ok((touched, entries))
    };

    // Branch first keys are logical minus-infinity; reconstruct them
    // from the parent separators before gluing pages together.
    let parent_key = |txn: &WriteTxn<'_>, i: usize| -> Result<Vec<u8>> {
        if i == 0 {
            return Ok(Vec::new());
        }
        let parent = txn.page(parent_pgno)?;
        Ok(parent.node(i)?.key()?.to_vec())
    };

    for &(sib_idx, sib_is_left) in [
        left_idx.map(|i| (i, true)),
        right_idx.map(|i| (i, false)),
    ]
    .iter()
    .flatten()
    {
        let (sib_pgno, mut sib_entries) = pick(txn, sib_idx)?;
        let mut mine = my_entries.clone();
        if is_branch {
            mine[0].key = parent_key(txn, pidx)?;
            sib_entries[0].key = parent_key(txn, sib_idx)?;
        }

        let (left_pgno, right_pgno, mut combined, right_parent_idx) = if sib_is_left {
            let mut all = sib_entries;
            all.extend(mine);
            (sib_pgno, pgno, all, pidx)
        } else {
            let mut all = mine;
            all.extend(sib_entries);
            (pgno, sib_pgno, all, sib_idx)
        };

        if entries_fit(&combined, fixed, capacity) {
            if is_branch {
                // The surviving page's own first key reverts to ignored.
                combined[0].key = Vec::new();
            }
            let flags = {
                let page = txn.page(left_pgno)?;
                page.flags()
            };
            rebuild_page(txn, h, left_pgno, flags, &combined)?;
            txn.retire_pages(right_pgno, 1);
            if is_branch {
                h.desc.branch_pages = h.desc.branch_pages.saturating_sub(1);
            } else {
                h.desc.leaf_pages = h.desc.leaf_pages.saturating_sub(1);
            }
            txn.dirty_page_mut(parent_pgno)?.as_mut().del_node(right_parent_idx)?;
            tracing::trace!(left = left_pgno.0, right = right_pgno.0, "pages merged");
            return rebalance(txn, h, path, level - 1);
        }
    }

    // No merge possible: borrow one entry from the fuller sibling.
    let donor_idx = match (left_idx, right_idx) {
        (Some(l), Some(r)) => {
            let lu = {
                let parent = txn.page(parent_pgno)?;
                let lp = parent.child(l)?;
                txn.page(lp)?.used_space()
            };
            let ru = {
                let parent = txn.page(parent_pgno)?;
                let rp = parent.child(r)?;
                txn.page(rp)?.used_space()
            };
            if lu >= ru { l } else { r }
        }
        (Some(l), None) => l,
        (None, Some(r)) => r,
        (None, None) => return Ok(()),
    };
    let donor_is_left = donor_idx < pidx;
    let (donor_pgno, mut donor_entries) = pick(txn, donor_idx)?;
    let mut mine = my_entries;
    if is_branch {
        mine[0].key = parent_key(txn, pidx)?;
        donor_entries[0].key = parent_key(txn, donor_idx)?;
    }
    if donor_entries.len() < 2 {
        return Ok(());
    }

    let (sep_target_idx, new_sep) = if donor_is_left {
        let moved = donor_entries.pop().expect("donor has entries");
        mine.insert(0, moved);
        (pidx, mine[0].key.clone())
    } else {
        let moved = donor_entries.remove(0);
        mine.push(moved);
        (donor_idx, donor_entries[0].key.clone())
    };

    let flags = {
        let page = txn.page(pgno)?;
        page.flags()
    };
    let mut mine_store = mine;
    let mut donor_store = donor_entries;
    if is_branch {
        mine_store[0].key = Vec::new();
        donor_store[0].key = Vec::new();
    }
    rebuild_page(txn, h, pgno, flags, &mine_store)?;
    rebuild_page(txn, h, donor_pgno, flags, &donor_store)?;
    update_parent_key(txn, h, path, level - 1, sep_target_idx, &new_sep)
}

/// Replace a branch separator key; the size change can split the
/// parent.
fn update_parent_key(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: &Path,
    level: usize,
    idx: usize,
    new_key: &[u8],
) -> Result<()> {
    let (pgno, _) = path.stack[level];
    let child = {
        let page = txn.page(pgno)?;
        page.child(idx)?
    };
    txn.dirty_page_mut(pgno)?.as_mut().del_node(idx)?;
    let entry = Entry {
        key: new_key.to_vec(),
        payload: Payload::Child(child),
        flags: NodeFlags::empty(),
    };
    insert_entry(txn, h, path, level, idx, entry)
}

// ---------------------------------------------------------------------------
// Whole-tree operations

/// Retire every page of a tree described by `desc`.
pub(crate) fn free_tree(txn: &mut WriteTxn<'_>, desc: &TreeDesc) -> Result<()> {
    if !desc.root.is_valid() {
        return Ok(());
    }
    let psize = txn.env_inner().io.page_size();
    let mut stack = vec![desc.root];
    while let Some(pgno) = stack.pop() {
        let (children, larges, nested) = {
            let page = txn.page(pgno)?;
            let mut children = Vec::new();
            let mut larges = Vec::new();
            let mut nested = Vec::new();
            if page.is_branch() {
                for i in 0..page.nkeys() {
                    children.push(page.child(i)?);
                }
            } else if !page.is_dupfix() {
                for i in 0..page.nkeys() {
                    let node = page.node(i)?;
                    let f = node.flags();
                    if f.contains(NodeFlags::BIGDATA) {
                        larges.push((node.large_pgno()?, large_run_pages(psize, node.value_len())));
                    } else if f.contains(NodeFlags::DUPDATA) && f.contains(NodeFlags::SUBDATA) {
                        nested.push(TreeDesc::decode(node.value()?)?);
                    }
                }
            }
            (children, larges, nested)
        };
        stack.extend(children);
        for (base, n) in larges {
            txn.retire_pages(base, n);
        }
        for sub in nested {
            free_tree(txn, &sub)?;
        }
        txn.retire_pages(pgno, 1);
    }
    Ok(())
}

/// Remove every entry, leaving an empty tree.
pub fn clear(txn: &mut WriteTxn<'_>, h: &mut TreeHandle) -> Result<()> {
    let desc = h.desc;
    free_tree(txn, &desc)?;
    let (flags, sequence) = (h.desc.flags, h.desc.sequence);
    h.desc = TreeDesc::empty(flags);
    h.desc.sequence = sequence;
    h.desc.mod_txnid = txn.id();
    Ok(())
}

/// First GC entry with key strictly greater than `after`, decoded.
/// Used by the allocator to refill the reclaim list.
pub(crate) fn gc_first(
    txn: &WriteTxn<'_>,
    gc: &TreeHandle,
    after: u64,
) -> Result<Option<(u64, Pnl)>> {
    let probe = (after + 1).to_le_bytes();
    let Some(path) = seek_range(txn, gc, &probe)? else {
        return Ok(None);
    };
    let node = node_at(txn, &path)?;
    let key_bytes = node.key()?;
    if key_bytes.len() != 8 {
        return Err(Error::corrupt(path.leaf().0, "GC key is not a txnid"));
    }
    let key = u64::from_le_bytes(key_bytes.try_into().expect("8-byte key"));
    let value = if node.flags().contains(NodeFlags::BIGDATA) {
        large_value(txn, node)?
    } else {
        node.value()?
    };
    Ok(Some((key, Pnl::from_bytes(value))))
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::SearchResult;

    #[test]
    fn entry_need_rounds_even() {
        let e = Entry {
            key: b"abc".to_vec(),
            payload: Payload::Inline(b"xy".to_vec()),
            flags: NodeFlags::empty(),
        };
        // 8 hdr + 3 key + 2 value = 13, rounded to 14, plus the slot.
        assert_eq!(e.need(0), 16);

        let c = Entry {
            key: b"abcd".to_vec(),
            payload: Payload::Child(PageId(9)),
            flags: NodeFlags::empty(),
        };
        assert_eq!(c.need(0), 14);

        let f = Entry {
            key: b"1234".to_vec(),
            payload: Payload::Inline(Vec::new()),
            flags: NodeFlags::empty(),
        };
        assert_eq!(f.need(4), 4);
    }

    #[test]
    fn search_result_accessors() {
        assert!(SearchResult::Found(3).is_found());
        assert_eq!(SearchResult::Found(3).index(), 3);
        assert!(!SearchResult::NotFound(0).is_found());
    }
}
