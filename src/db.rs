//! Database handles
//!
//! A database is one named subtree of the MAIN tree (or MAIN itself).
//! Handles are cheap copies of a dbi index; per-transaction tree state
//! lives in the transaction and is looked up through the handle.

use bitflags::bitflags;

use crate::comparator::KeyCmp;
use crate::cursor::{Cursor, CursorMut};
use crate::error::{Error, Result};
use crate::meta::TreeDesc;
use crate::tree;
use crate::txn::{Dbi, TxnRead, WriteTxn};

bitflags! {
    /// Persistent database flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u16 {
        /// Use reverse string comparison for keys
        const REVERSE_KEY = 0x02;
        /// Allow sorted duplicate values per key
        const DUP_SORT = 0x04;
        /// Numeric keys in native byte order (2, 4 or 8 bytes)
        const INTEGER_KEY = 0x08;
        /// With `DUP_SORT`, duplicate values have one fixed size
        const DUP_FIXED = 0x10;
        /// With `DUP_SORT`, duplicates are native-order integers
        const INTEGER_DUP = 0x20;
        /// With `DUP_SORT`, duplicates compare reversed
        const REVERSE_DUP = 0x40;
    }
}

bitflags! {
    /// Flags for put operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PutFlags: u32 {
        /// Fail with `KeyExist` when the key is already present
        const NO_OVERWRITE = 0x10;
        /// For dupsort trees, fail when the exact pair is present
        const NO_DUP_DATA = 0x20;
        /// Keys are appended in order; error if not past the last key
        const APPEND = 0x2_0000;
        /// Duplicates are appended in order
        const APPEND_DUP = 0x4_0000;
    }
}

impl DbFlags {
    /// Key comparator selected by these flags.
    pub fn key_cmp(self) -> KeyCmp {
        if self.contains(DbFlags::INTEGER_KEY) {
            KeyCmp::Integer
        } else if self.contains(DbFlags::REVERSE_KEY) {
            KeyCmp::Reverse
        } else {
            KeyCmp::Lexical
        }
    }

    /// Duplicate-value comparator selected by these flags.
    pub fn dup_cmp(self) -> KeyCmp {
        if self.contains(DbFlags::INTEGER_DUP) {
            KeyCmp::Integer
        } else if self.contains(DbFlags::REVERSE_DUP) {
            KeyCmp::Reverse
        } else {
            KeyCmp::Lexical
        }
    }
}

/// Statistics of one database.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStat {
    /// Tree height; 0 when empty
    pub depth: u32,
    /// Branch page count
    pub branch_pages: u64,
    /// Leaf page count
    pub leaf_pages: u64,
    /// Large (overflow) page count
    pub large_pages: u64,
    /// Number of entries, duplicates included
    pub entries: u64,
}

impl DbStat {
    pub(crate) fn from_desc(desc: &TreeDesc) -> Self {
        Self {
            depth: desc.depth as u32,
            branch_pages: desc.branch_pages,
            leaf_pages: desc.leaf_pages,
            large_pages: desc.large_pages,
            entries: desc.entries,
        }
    }
}

/// Handle to one database within an environment.
#[derive(Debug, Clone, Copy)]
pub struct Database {
    pub(crate) dbi: Dbi,
}

impl Database {
    pub(crate) fn new(dbi: Dbi) -> Self {
        Self { dbi }
    }

    /// The dbi slot of this handle.
    pub fn dbi(&self) -> Dbi {
        self.dbi
    }

    /// Look up `key`; for dupsort trees this returns the first
    /// duplicate in comparator order.
    pub fn get<'t, T: TxnRead>(&self, txn: &'t T, key: &[u8]) -> Result<Option<&'t [u8]>> {
        txn.assert_live()?;
        let handle = txn.tree_handle(self.dbi)?;
        tree::get(txn, &handle, key)
    }

    /// Insert or update a key/value pair.
    pub fn put(
        &self,
        txn: &mut WriteTxn<'_>,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
    ) -> Result<()> {
        txn.assert_live()?;
        let mut handle = txn.tree_handle(self.dbi)?;
        let r = tree::put(txn, &mut handle, key, value, flags);
        if let Err(e) = &r {
            txn.note_error(e);
        }
        txn.store_tree(self.dbi, &handle);
        r
    }

    /// Delete a key, or one duplicate when `value` is given. Returns
    /// whether anything was removed.
    pub fn del(&self, txn: &mut WriteTxn<'_>, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        txn.assert_live()?;
        let mut handle = txn.tree_handle(self.dbi)?;
        let r = match tree::del(txn, &mut handle, key, value) {
            Ok(()) => Ok(true),
            Err(Error::KeyNotFound) | Err(Error::NotFound) => Ok(false),
            Err(e) => {
                txn.note_error(&e);
                Err(e)
            }
        };
        txn.store_tree(self.dbi, &handle);
        r
    }

    /// Remove every entry, keeping the database itself.
    pub fn clear(&self, txn: &mut WriteTxn<'_>) -> Result<()> {
        txn.assert_live()?;
        let mut handle = txn.tree_handle(self.dbi)?;
        tree::clear(txn, &mut handle)?;
        txn.store_tree(self.dbi, &handle);
        Ok(())
    }

    /// Statistics at this transaction's snapshot.
    pub fn stat<T: TxnRead>(&self, txn: &T) -> Result<DbStat> {
        let handle = txn.tree_handle(self.dbi)?;
        Ok(DbStat::from_desc(&handle.desc))
    }

    /// Number of entries.
    pub fn len<T: TxnRead>(&self, txn: &T) -> Result<u64> {
        Ok(self.stat(txn)?.entries)
    }

    /// Whether the database holds no entries.
    pub fn is_empty<T: TxnRead>(&self, txn: &T) -> Result<bool> {
        Ok(self.len(txn)? == 0)
    }

    /// Advance the per-database sequence by `step`, returning the
    /// previous value. `step == 0` just reads it.
    pub fn sequence(&self, txn: &mut WriteTxn<'_>, step: u64) -> Result<u64> {
        txn.assert_live()?;
        let mut handle = txn.tree_handle(self.dbi)?;
        let prev = handle.desc.sequence;
        if step > 0 {
            handle.desc.sequence = prev
                .checked_add(step)
                .ok_or(Error::InvalidParameter("sequence overflow"))?;
            txn.store_tree(self.dbi, &handle);
        }
        Ok(prev)
    }

    /// Open a read cursor.
    pub fn cursor<'t, T: TxnRead>(&self, txn: &'t T) -> Result<Cursor<'t, T>> {
        txn.assert_live()?;
        Cursor::new(txn, self.dbi)
    }

    /// Open a write cursor; it borrows the transaction exclusively.
    pub fn cursor_mut<'t, 'env>(
        &self,
        txn: &'t mut WriteTxn<'env>,
    ) -> Result<CursorMut<'t, 'env>> {
        txn.assert_live()?;
        CursorMut::new(txn, self.dbi)
    }
}

/// Tree state a transaction caches per dbi: the descriptor plus the
/// comparators resolved from its flags when the handle was bound.
#[derive(Debug, Clone, Copy)]
pub struct TreeHandle {
    /// Owning dbi slot
    pub dbi: Dbi,
    /// Tree descriptor at this snapshot
    pub desc: TreeDesc,
    /// Database flags
    pub flags: DbFlags,
    /// Key comparator
    pub cmp: KeyCmp,
    /// Duplicate comparator
    pub dcmp: KeyCmp,
    /// Fixed key size for nested dupfix trees; 0 means variable
    pub(crate) fixed: u32,
}

impl TreeHandle {
    pub(crate) fn new(dbi: Dbi, desc: TreeDesc) -> Self {
        let flags = DbFlags::from_bits_truncate(desc.flags);
        Self { dbi, desc, flags, cmp: flags.key_cmp(), dcmp: flags.dup_cmp(), fixed: 0 }
    }

    /// Whether duplicates are permitted.
    pub fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUP_SORT)
    }

    /// Whether duplicates have a fixed size.
    pub fn is_dupfixed(&self) -> bool {
        self.flags.contains(DbFlags::DUP_FIXED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparators_resolve_from_flags() {
        assert_eq!(DbFlags::empty().key_cmp(), KeyCmp::Lexical);
        assert_eq!(DbFlags::REVERSE_KEY.key_cmp(), KeyCmp::Reverse);
        assert_eq!(DbFlags::INTEGER_KEY.key_cmp(), KeyCmp::Integer);
        let f = DbFlags::DUP_SORT | DbFlags::INTEGER_DUP;
        assert_eq!(f.key_cmp(), KeyCmp::Lexical);
        assert_eq!(f.dup_cmp(), KeyCmp::Integer);
    }

    #[test]
    fn handle_binds_flags_once() {
        let desc = TreeDesc::empty((DbFlags::DUP_SORT | DbFlags::DUP_FIXED).bits());
        let h = TreeHandle::new(5, desc);
        assert!(h.is_dupsort());
        assert!(h.is_dupfixed());
        assert_eq!(h.cmp, KeyCmp::Lexical);
    }
}
