//! Cursors
//!
//! A cursor is a stack-of-pages iterator over one database, with an
//! inner position when the current key holds a duplicate set. Read
//! cursors borrow their transaction shared; the write cursor borrows
//! it exclusively and re-anchors itself by key after each structural
//! mutation, so it stays valid across splits and merges.

use crate::db::{Database, PutFlags, TreeHandle};
use crate::dupsort::{self, DupView};
use crate::error::{Error, Result};
use crate::page::{NodeFlags, SearchResult};
use crate::tree::{self, Path};
use crate::txn::{Dbi, TxnRead, WriteTxn};

/// Position inside the duplicate set of the current key.
enum DupPos {
    /// Index into the sub-page
    Sub(usize),
    /// Path into the nested subtree, with its handle
    Tree(TreeHandle, Path),
}

/// A read-only cursor over one database.
pub struct Cursor<'t, T: TxnRead> {
    txn: &'t T,
    h: TreeHandle,
    path: Option<Path>,
    dup: Option<DupPos>,
}

impl<'t, T: TxnRead> Cursor<'t, T> {
    pub(crate) fn new(txn: &'t T, dbi: Dbi) -> Result<Self> {
        let h = txn.tree_handle(dbi)?;
        Ok(Self { txn, h, path: None, dup: None })
    }

    /// The key/value pair at the current position.
    pub fn current(&self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let (key, value) = tree::entry_at(self.txn, &self.h, path)?;
        match &self.dup {
            None => Ok(Some((key, value))),
            Some(pos) => Ok(Some((key, self.dup_value(path, pos)?))),
        }
    }

    fn dup_value(&self, path: &Path, pos: &DupPos) -> Result<&'t [u8]> {
        match pos {
            DupPos::Sub(i) => {
                let node = tree::node_at(self.txn, path)?;
                match dupsort::dup_view(&self.h, node)? {
                    Some(DupView::Sub(sub)) => sub.key(*i),
                    _ => Err(Error::corrupt(path.leaf().0, "dup position lost its sub-page")),
                }
            }
            DupPos::Tree(nested, dp) => {
                let (v, _) = tree::entry_at(self.txn, nested, dp)?;
                Ok(v)
            }
        }
    }

    /// Initialize the duplicate position for the current node.
    fn enter_dups(&mut self, last: bool) -> Result<()> {
        self.dup = None;
        let Some(path) = &self.path else {
            return Ok(());
        };
        let page = { self.txn.page(path.leaf().0)? };
        if page.is_dupfix() {
            return Ok(());
        }
        let node = tree::node_at(self.txn, path)?;
        if !node.flags().contains(NodeFlags::DUPDATA) {
            return Ok(());
        }
        match dupsort::dup_view(&self.h, node)? {
            Some(DupView::Sub(sub)) => {
                let i = if last { sub.nkeys().saturating_sub(1) } else { 0 };
                self.dup = Some(DupPos::Sub(i));
            }
            Some(DupView::Tree(nested)) => {
                let dp = tree::seek_edge(self.txn, &nested, last)?
                    .ok_or(Error::corrupt(path.leaf().0, "empty duplicate subtree"))?;
                self.dup = Some(DupPos::Tree(nested, dp));
            }
            None => {}
        }
        Ok(())
    }

    /// Move to the first entry.
    pub fn first(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        self.path = tree::seek_edge(self.txn, &self.h, false)?;
        self.enter_dups(false)?;
        self.current()
    }

    /// Move to the last entry.
    pub fn last(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        self.path = tree::seek_edge(self.txn, &self.h, true)?;
        self.enter_dups(true)?;
        self.current()
    }

    /// Advance to the next entry (next duplicate first).
    pub fn next(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        if self.path.is_none() {
            return self.first();
        }
        if self.next_dup_step()? {
            return self.current();
        }
        self.next_nodup()
    }

    /// Step back to the previous entry (previous duplicate first).
    pub fn prev(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        if self.path.is_none() {
            return self.last();
        }
        if self.prev_dup_step()? {
            return self.current();
        }
        let path = self.path.as_mut().expect("positioned");
        if tree::path_prev(self.txn, &self.h, path)? {
            self.enter_dups(true)?;
            self.current()
        } else {
            self.path = None;
            self.dup = None;
            Ok(None)
        }
    }

    fn next_dup_step(&mut self) -> Result<bool> {
        match &mut self.dup {
            None => Ok(false),
            Some(DupPos::Sub(i)) => {
                let path = self.path.as_ref().expect("positioned");
                let node = tree::node_at(self.txn, path)?;
                let n = match dupsort::dup_view(&self.h, node)? {
                    Some(DupView::Sub(sub)) => sub.nkeys(),
                    _ => 0,
                };
                if *i + 1 < n {
                    *i += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(DupPos::Tree(nested, dp)) => {
                let nested = *nested;
                tree::path_next(self.txn, &nested, dp)
            }
        }
    }

    fn prev_dup_step(&mut self) -> Result<bool> {
        match &mut self.dup {
            None => Ok(false),
            Some(DupPos::Sub(i)) => {
                if *i > 0 {
                    *i -= 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(DupPos::Tree(nested, dp)) => {
                let nested = *nested;
                tree::path_prev(self.txn, &nested, dp)
            }
        }
    }

    /// Next duplicate of the current key only.
    pub fn next_dup(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        if self.path.is_none() {
            return Ok(None);
        }
        if self.next_dup_step()? {
            self.current()
        } else {
            Ok(None)
        }
    }

    /// Previous duplicate of the current key only.
    pub fn prev_dup(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        if self.path.is_none() {
            return Ok(None);
        }
        if self.prev_dup_step()? {
            self.current()
        } else {
            Ok(None)
        }
    }

    /// Skip the rest of the current duplicate set.
    pub fn next_nodup(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        let Some(path) = self.path.as_mut() else {
            return self.first();
        };
        if tree::path_next(self.txn, &self.h, path)? {
            self.enter_dups(false)?;
            self.current()
        } else {
            self.path = None;
            self.dup = None;
            Ok(None)
        }
    }

    /// Position at `key` exactly.
    pub fn set_key(&mut self, key: &[u8]) -> Result<Option<(&'t [u8], &'t [u8])>> {
        match tree::seek(self.txn, &self.h, key)? {
            Some((path, true)) => {
                self.path = Some(path);
                self.enter_dups(false)?;
                self.current()
            }
            _ => {
                self.path = None;
                self.dup = None;
                Ok(None)
            }
        }
    }

    /// Position at the first key >= `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(&'t [u8], &'t [u8])>> {
        self.path = tree::seek_range(self.txn, &self.h, key)?;
        self.enter_dups(false)?;
        self.current()
    }

    /// Position at the exact `(key, value)` pair of a dupsort tree.
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<(&'t [u8], &'t [u8])>> {
        self.seek_both(key, value, true)
    }

    /// Position at `key` and the first duplicate >= `value`.
    pub fn get_both_range(
        &mut self,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(&'t [u8], &'t [u8])>> {
        self.seek_both(key, value, false)
    }

    fn seek_both(
        &mut self,
        key: &[u8],
        value: &[u8],
        exact: bool,
    ) -> Result<Option<(&'t [u8], &'t [u8])>> {
        if !self.h.is_dupsort() {
            return Err(Error::Incompatible);
        }
        let Some((path, found)) = tree::seek(self.txn, &self.h, key)? else {
            return Ok(None);
        };
        if !found {
            self.path = None;
            return Ok(None);
        }
        let node = tree::node_at(self.txn, &path)?;
        match dupsort::dup_view(&self.h, node)? {
            None => {
                let v = node.value()?;
                let ord = self.h.dcmp.cmp(v, value);
                let hit = if exact {
                    ord == std::cmp::Ordering::Equal
                } else {
                    ord != std::cmp::Ordering::Less
                };
                self.path = if hit { Some(path) } else { None };
                self.dup = None;
            }
            Some(DupView::Sub(sub)) => {
                let res = sub.search(value, self.h.dcmp)?;
                let i = match (res, exact) {
                    (SearchResult::Found(i), _) => Some(i),
                    (SearchResult::NotFound(i), false) if i < sub.nkeys() => Some(i),
                    _ => None,
                };
                match i {
                    Some(i) => {
                        self.path = Some(path);
                        self.dup = Some(DupPos::Sub(i));
                    }
                    None => self.path = None,
                }
            }
            Some(DupView::Tree(nested)) => {
                let dp = if exact {
                    match tree::seek(self.txn, &nested, value)? {
                        Some((dp, true)) => Some(dp),
                        _ => None,
                    }
                } else {
                    tree::seek_range(self.txn, &nested, value)?
                };
                match dp {
                    Some(dp) => {
                        self.path = Some(path);
                        self.dup = Some(DupPos::Tree(nested, dp));
                    }
                    None => self.path = None,
                }
            }
        }
        self.current()
    }

    /// Number of duplicates at the current position.
    pub fn count(&self) -> Result<u64> {
        let Some(path) = &self.path else {
            return Err(Error::NotFound);
        };
        let page = self.txn.page(path.leaf().0)?;
        if page.is_dupfix() {
            return Ok(1);
        }
        let node = tree::node_at(self.txn, path)?;
        dupsort::dup_count(&self.h, node)
    }

    /// Read up to `n` consecutive pairs, advancing the cursor.
    pub fn get_batch(&mut self, n: usize) -> Result<Vec<(&'t [u8], &'t [u8])>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next()? {
                Some(pair) => out.push(pair),
                None => break,
            }
        }
        Ok(out)
    }
}

/// The write cursor. It owns the transaction borrow and re-anchors by
/// key after every mutation, so structural changes cannot dangle it.
pub struct CursorMut<'t, 'env> {
    txn: &'t mut WriteTxn<'env>,
    dbi: Dbi,
    /// Current anchor: key, plus the duplicate value when inside a set.
    pos: Option<(Vec<u8>, Option<Vec<u8>>)>,
}

/// Owned pair returned by write-cursor operations.
pub type OwnedPair = (Vec<u8>, Vec<u8>);

type Anchor = Option<(Vec<u8>, Option<Vec<u8>>)>;

impl<'t, 'env> CursorMut<'t, 'env> {
    pub(crate) fn new(txn: &'t mut WriteTxn<'env>, dbi: Dbi) -> Result<Self> {
        txn.tree_handle(dbi)?;
        Ok(Self { txn, dbi, pos: None })
    }

    fn is_dupsort(&self) -> Result<bool> {
        Ok(self.txn.tree_handle(self.dbi)?.is_dupsort())
    }

    fn store(&mut self, pair: &Option<OwnedPair>, dupsort: bool) {
        self.pos = pair.as_ref().map(|(k, v)| (k.clone(), dupsort.then(|| v.clone())));
    }

    /// Re-establish a read cursor at (or after) the stored anchor.
    /// The bool reports whether the cursor landed on a pair at all.
    fn reseek<'c>(
        txn: &'c WriteTxn<'env>,
        dbi: Dbi,
        pos: &Anchor,
    ) -> Result<(Cursor<'c, WriteTxn<'env>>, bool)> {
        let mut c = Cursor::new(txn, dbi)?;
        let hit = match pos {
            None => false,
            Some((key, Some(dv))) => {
                c.get_both(key, dv)?.is_some()
                    || c.get_both_range(key, dv)?.is_some()
                    || c.set_range(key)?.is_some()
            }
            Some((key, None)) => c.set_range(key)?.is_some(),
        };
        Ok((c, hit))
    }

    /// Whether the reseeked cursor still sits on the anchored pair.
    fn on_anchor(cur: Option<(&[u8], &[u8])>, pos: &Anchor) -> bool {
        match (cur, pos) {
            (Some((k, _)), Some((pk, None))) => k == pk.as_slice(),
            (Some((k, v)), Some((pk, Some(pv)))) => k == pk.as_slice() && v == pv.as_slice(),
            _ => false,
        }
    }

    /// Move to the first entry.
    pub fn first(&mut self) -> Result<Option<OwnedPair>> {
        let out = {
            let mut c = Cursor::new(&*self.txn, self.dbi)?;
            c.first()?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// Move to the last entry.
    pub fn last(&mut self) -> Result<Option<OwnedPair>> {
        let out = {
            let mut c = Cursor::new(&*self.txn, self.dbi)?;
            c.last()?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// Advance past the anchored position.
    pub fn next(&mut self) -> Result<Option<OwnedPair>> {
        let pos = self.pos.clone();
        let out = {
            let (mut c, hit) = Self::reseek(&*self.txn, self.dbi, &pos)?;
            let stepped = if pos.is_none() {
                c.first()?
            } else if hit && Self::on_anchor(c.current()?, &pos) {
                c.next()?
            } else if hit {
                // The anchored pair is gone; the reseek already moved
                // one position forward.
                c.current()?
            } else {
                None
            };
            stepped.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// Step back before the anchored position.
    pub fn prev(&mut self) -> Result<Option<OwnedPair>> {
        let pos = self.pos.clone();
        let out = {
            let (mut c, _hit) = Self::reseek(&*self.txn, self.dbi, &pos)?;
            let stepped = if pos.is_none() { c.last()? } else { c.prev()? };
            stepped.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// Position at `key` exactly.
    pub fn set_key(&mut self, key: &[u8]) -> Result<Option<OwnedPair>> {
        let out = {
            let mut c = Cursor::new(&*self.txn, self.dbi)?;
            c.set_key(key)?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// Position at the first key >= `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<OwnedPair>> {
        let out = {
            let mut c = Cursor::new(&*self.txn, self.dbi)?;
            c.set_range(key)?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// Position at an exact duplicate pair.
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<OwnedPair>> {
        let out = {
            let mut c = Cursor::new(&*self.txn, self.dbi)?;
            c.get_both(key, value)?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// Position at `key` and the first duplicate >= `value`.
    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<OwnedPair>> {
        let out = {
            let mut c = Cursor::new(&*self.txn, self.dbi)?;
            c.get_both_range(key, value)?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let d = self.is_dupsort()?;
        self.store(&out, d);
        Ok(out)
    }

    /// The pair at the anchor, if it still exists.
    pub fn current(&mut self) -> Result<Option<OwnedPair>> {
        let pos = self.pos.clone();
        let (c, hit) = Self::reseek(&*self.txn, self.dbi, &pos)?;
        if !hit || !Self::on_anchor(c.current()?, &pos) {
            return Ok(None);
        }
        Ok(c.current()?.map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    /// Duplicate count at the anchor.
    pub fn count(&mut self) -> Result<u64> {
        let pos = self.pos.clone();
        let (c, hit) = Self::reseek(&*self.txn, self.dbi, &pos)?;
        if !hit {
            return Err(Error::NotFound);
        }
        c.count()
    }

    /// Insert through the cursor; the cursor anchors on the new pair.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        let db = Database::new(self.dbi);
        db.put(self.txn, key, value, flags)?;
        let d = self.is_dupsort()?;
        self.pos = Some((key.to_vec(), d.then(|| value.to_vec())));
        Ok(())
    }

    /// Delete the pair at the anchor. The cursor moves to the next
    /// entry, mirroring delete-then-advance iteration.
    pub fn del(&mut self) -> Result<()> {
        let Some((key, dup)) = self.pos.clone() else {
            return Err(Error::NotFound);
        };
        // Note the following pair before the structure changes.
        let next = {
            let (mut c, hit) = Self::reseek(&*self.txn, self.dbi, &self.pos)?;
            if !hit || !Self::on_anchor(c.current()?, &self.pos) {
                return Err(Error::NotFound);
            }
            c.next()?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let db = Database::new(self.dbi);
        db.del(self.txn, &key, dup.as_deref())?;
        let d = self.is_dupsort()?;
        self.pos = next.map(|(k, v)| (k, d.then(|| v)));
        Ok(())
    }
}
