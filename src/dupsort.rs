//! Sorted duplicate sets
//!
//! A dupsort key stores its values in one of three shapes: a plain
//! node while there is a single value, a sub-page (a miniature leaf
//! serialized into the node value) for small sets, and a nested
//! subtree once the sub-page outgrows its half-page budget. Promotion
//! is one-way; a nested subtree never demotes back to a sub-page.

use crate::db::{DbFlags, PutFlags, TreeHandle};
use crate::error::{Error, PageId, Result};
use crate::meta::{TREE_DESC_SIZE, TreeDesc};
use crate::page::{
    NodeFlags, NodePayload, NodeRef, PAGE_HDR, PageFlags, PageMut, PageRef, max_inline_value,
};
use crate::tree::{self, Entry, Path, Payload};
use crate::txn::{TxnRead, WriteTxn};

/// Handle for the nested duplicate subtree behind a `SUBDATA` node.
/// Duplicate values are its keys, ordered by the outer tree's
/// duplicate comparator.
pub(crate) fn nested_handle(h: &TreeHandle, desc: TreeDesc) -> TreeHandle {
    TreeHandle {
        dbi: h.dbi,
        desc,
        flags: DbFlags::empty(),
        cmp: h.dcmp,
        dcmp: h.dcmp,
        fixed: if h.is_dupfixed() { desc.xsize } else { 0 },
    }
}

/// Either shape of an existing duplicate set.
pub(crate) enum DupView<'t> {
    /// Sub-page embedded in the leaf node value
    Sub(PageRef<'t>),
    /// Nested subtree
    Tree(TreeHandle),
}

/// Open the duplicate set of a leaf node, if it has one.
pub(crate) fn dup_view<'t>(h: &TreeHandle, node: NodeRef<'t>) -> Result<Option<DupView<'t>>> {
    let flags = node.flags();
    if !flags.contains(NodeFlags::DUPDATA) {
        return Ok(None);
    }
    if flags.contains(NodeFlags::SUBDATA) {
        let desc = TreeDesc::decode(node.value()?)?;
        Ok(Some(DupView::Tree(nested_handle(h, desc))))
    } else {
        Ok(Some(DupView::Sub(PageRef::new(node.value()?)?)))
    }
}

/// First duplicate value of a `DUPDATA` node, in comparator order.
pub(crate) fn first_dup<'t, T: TxnRead>(
    txn: &'t T,
    h: &TreeHandle,
    node: NodeRef<'t>,
) -> Result<&'t [u8]> {
    match dup_view(h, node)? {
        None => node.value(),
        Some(DupView::Sub(sub)) => sub.key(0),
        Some(DupView::Tree(nested)) => {
            let path = tree::seek_edge(txn, &nested, false)?
                .ok_or(Error::corrupt(PageId::INVALID, "empty duplicate subtree"))?;
            let (v, _) = tree::entry_at(txn, &nested, &path)?;
            Ok(v)
        }
    }
}

/// Number of duplicates under a leaf node.
pub(crate) fn dup_count(h: &TreeHandle, node: NodeRef<'_>) -> Result<u64> {
    let flags = node.flags();
    if !flags.contains(NodeFlags::DUPDATA) {
        return Ok(1);
    }
    if flags.contains(NodeFlags::SUBDATA) {
        Ok(TreeDesc::decode(node.value()?)?.entries)
    } else {
        Ok(PageRef::new(node.value()?)?.nkeys() as u64)
    }
}

/// Serialize sorted duplicate values into sub-page bytes.
fn build_subpage(h: &TreeHandle, values: &[Vec<u8>]) -> Result<Vec<u8>> {
    let fixed = h.is_dupfixed();
    let payload = if fixed {
        let k = values.first().map_or(0, |v| v.len());
        (values.len() * k + 1) & !1
    } else {
        values
            .iter()
            .map(|v| {
                let raw = crate::page::NODE_HDR + v.len();
                raw + (raw & 1) + 2
            })
            .sum::<usize>()
    };
    let mut bytes = vec![0u8; PAGE_HDR + payload.max(2)];
    let mut page = PageMut::new(&mut bytes)?;
    let flags = if fixed {
        PageFlags::LEAF | PageFlags::LEAF_FIXED | PageFlags::SUB
    } else {
        PageFlags::LEAF | PageFlags::SUB
    };
    page.init(PageId(0), flags, crate::error::TxnId(0));
    if fixed {
        let k = values.first().map_or(0, |v| v.len());
        page.set_ksize(k);
        for (i, v) in values.iter().enumerate() {
            page.insert_dupfix(i, v)?;
        }
    } else {
        for (i, v) in values.iter().enumerate() {
            page.insert_node(i, v, NodePayload::Inline(&[]), NodeFlags::empty())?;
        }
    }
    Ok(bytes)
}

/// Owned duplicate values of a sub-page, in order.
fn subpage_values(sub: PageRef<'_>) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(sub.nkeys());
    for i in 0..sub.nkeys() {
        out.push(sub.key(i)?.to_vec());
    }
    Ok(out)
}

/// Replace the leaf node a path points at with a new duplicate shape.
fn replace_dup_node(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: &Path,
    key: Vec<u8>,
    value: Vec<u8>,
    node_flags: NodeFlags,
) -> Result<()> {
    let (pgno, idx) = path.leaf();
    txn.dirty_page_mut(pgno)?.as_mut().del_node(idx)?;
    let entry = Entry { key, payload: Payload::Inline(value), flags: node_flags };
    tree::insert_entry(txn, h, path, path.depth() - 1, idx, entry)
}

/// Promote duplicate values into a nested subtree and rewrite the node
/// as a `SUBDATA` descriptor.
fn promote(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: &Path,
    key: Vec<u8>,
    values: &[Vec<u8>],
) -> Result<()> {
    let fixed = h.is_dupfixed();
    let ksize = values.first().map_or(0, |v| v.len());
    let flags = if fixed {
        PageFlags::LEAF | PageFlags::LEAF_FIXED
    } else {
        PageFlags::LEAF
    };
    let root = txn.new_page(flags)?;
    {
        let buf = txn.dirty_page_mut(root)?;
        let mut page = buf.as_mut();
        if fixed {
            page.set_ksize(ksize);
            for (i, v) in values.iter().enumerate() {
                page.insert_dupfix(i, v)?;
            }
        } else {
            for (i, v) in values.iter().enumerate() {
                page.insert_node(i, v, NodePayload::Inline(&[]), NodeFlags::empty())?;
            }
        }
    }
    let mut desc = TreeDesc::empty(0);
    desc.root = root;
    desc.depth = 1;
    desc.leaf_pages = 1;
    desc.entries = values.len() as u64;
    desc.xsize = if fixed { ksize as u32 } else { 0 };
    desc.mod_txnid = txn.id();

    let mut bytes = vec![0u8; TREE_DESC_SIZE];
    desc.encode(&mut bytes);
    tracing::trace!(root = root.0, dups = values.len(), "sub-page promoted to subtree");
    replace_dup_node(txn, h, path, key, bytes, NodeFlags::DUPDATA | NodeFlags::SUBDATA)
}

/// Insert one duplicate under the key the path points at. Returns
/// whether a new duplicate was added.
pub(crate) fn dup_put(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: &Path,
    value: &[u8],
    flags: PutFlags,
) -> Result<bool> {
    let psize = txn.env_inner().io.page_size();
    let (key, node_flags, old_inline) = {
        let node = tree::node_at(txn, path)?;
        (node.key()?.to_vec(), node.flags(), node.value()?.to_vec())
    };
    let budget = max_inline_value(psize, key.len());
    let no_dup = flags.contains(PutFlags::NO_DUP_DATA);

    if !node_flags.contains(NodeFlags::DUPDATA) {
        // Single value so far.
        match h.dcmp.cmp(&old_inline, value) {
            std::cmp::Ordering::Equal => {
                if no_dup {
                    return Err(Error::KeyExist);
                }
                return Ok(false);
            }
            _ => {}
        }
        if h.is_dupfixed() && old_inline.len() != value.len() {
            return Err(Error::InvalidParameter("dupfixed values must share one size"));
        }
        let mut values = vec![old_inline, value.to_vec()];
        values.sort_by(|a, b| h.dcmp.cmp(a, b));
        let sub = build_subpage(h, &values)?;
        if sub.len() <= budget {
            replace_dup_node(txn, h, path, key, sub, NodeFlags::DUPDATA)?;
        } else {
            promote(txn, h, path, key, &values)?;
        }
        return Ok(true);
    }

    if !node_flags.contains(NodeFlags::SUBDATA) {
        // Sub-page shape.
        let mut values = {
            let node = tree::node_at(txn, path)?;
            subpage_values(PageRef::new(node.value()?)?)?
        };
        let pos = values.binary_search_by(|v| h.dcmp.cmp(v, value));
        match pos {
            Ok(_) => {
                if no_dup {
                    return Err(Error::KeyExist);
                }
                return Ok(false);
            }
            Err(at) => {
                if flags.contains(PutFlags::APPEND_DUP) && at != values.len() {
                    return Err(Error::InvalidParameter("append-dup value not past the last"));
                }
                if h.is_dupfixed()
                    && values.first().is_some_and(|v| v.len() != value.len())
                {
                    return Err(Error::InvalidParameter("dupfixed values must share one size"));
                }
                values.insert(at, value.to_vec());
            }
        }
        let sub = build_subpage(h, &values)?;
        if sub.len() <= budget {
            replace_dup_node(txn, h, path, key, sub, NodeFlags::DUPDATA)?;
        } else {
            promote(txn, h, path, key, &values)?;
        }
        return Ok(true);
    }

    // Nested subtree shape.
    let desc = {
        let node = tree::node_at(txn, path)?;
        TreeDesc::decode(node.value()?)?
    };
    let mut nested = nested_handle(h, desc);
    if tree::get(txn, &nested, value)?.is_some() {
        if no_dup {
            return Err(Error::KeyExist);
        }
        return Ok(false);
    }
    let nested_flags = if flags.contains(PutFlags::APPEND_DUP) {
        PutFlags::APPEND
    } else {
        PutFlags::empty()
    };
    tree::put(txn, &mut nested, value, &[], nested_flags)?;

    let mut bytes = vec![0u8; TREE_DESC_SIZE];
    nested.desc.encode(&mut bytes);
    let (pgno, idx) = path.leaf();
    txn.dirty_page_mut(pgno)?.as_mut().replace_value(idx, &bytes)?;
    Ok(true)
}

/// Delete one duplicate (`value` given) or the whole set. Returns how
/// many entries disappeared.
pub(crate) fn dup_del(
    txn: &mut WriteTxn<'_>,
    h: &mut TreeHandle,
    path: &Path,
    value: Option<&[u8]>,
) -> Result<u64> {
    let (key, node_flags) = {
        let node = tree::node_at(txn, path)?;
        (node.key()?.to_vec(), node.flags())
    };

    let Some(value) = value else {
        let count = {
            let node = tree::node_at(txn, path)?;
            dup_count(h, node)?
        };
        if node_flags.contains(NodeFlags::SUBDATA) {
            let desc = {
                let node = tree::node_at(txn, path)?;
                TreeDesc::decode(node.value()?)?
            };
            tree::free_tree(txn, &desc)?;
        }
        tree::remove_leaf_entry(txn, h, path.clone())?;
        return Ok(count);
    };

    if !node_flags.contains(NodeFlags::SUBDATA) {
        let mut values = {
            let node = tree::node_at(txn, path)?;
            subpage_values(PageRef::new(node.value()?)?)?
        };
        let at = values
            .binary_search_by(|v| h.dcmp.cmp(v, value))
            .map_err(|_| Error::NotFound)?;
        values.remove(at);
        if values.is_empty() {
            tree::remove_leaf_entry(txn, h, path.clone())?;
            return Ok(1);
        }
        let sub = build_subpage(h, &values)?;
        replace_dup_node(txn, h, path, key, sub, NodeFlags::DUPDATA)?;
        return Ok(1);
    }

    let desc = {
        let node = tree::node_at(txn, path)?;
        TreeDesc::decode(node.value()?)?
    };
    let mut nested = nested_handle(h, desc);
    match tree::del(txn, &mut nested, value, None) {
        Ok(()) => {}
        Err(Error::KeyNotFound) => return Err(Error::NotFound),
        Err(e) => return Err(e),
    }
    if nested.desc.entries == 0 {
        // The last duplicate is gone; the whole key goes with it.
        tree::free_tree(txn, &nested.desc)?;
        tree::remove_leaf_entry(txn, h, path.clone())?;
        return Ok(1);
    }
    let mut bytes = vec![0u8; TREE_DESC_SIZE];
    nested.desc.encode(&mut bytes);
    let (pgno, idx) = path.leaf();
    txn.dirty_page_mut(pgno)?.as_mut().replace_value(idx, &bytes)?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::KeyCmp;

    fn handle(flags: DbFlags) -> TreeHandle {
        TreeHandle::new(7, TreeDesc::empty(flags.bits()))
    }

    #[test]
    fn subpage_round_trip() {
        let h = handle(DbFlags::DUP_SORT);
        let values = vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()];
        let bytes = build_subpage(&h, &values).unwrap();
        let sub = PageRef::new(&bytes).unwrap();
        assert!(sub.flags().contains(PageFlags::SUB));
        assert_eq!(sub.nkeys(), 3);
        assert_eq!(subpage_values(sub).unwrap(), values);
    }

    #[test]
    fn subpage_dupfixed_packs() {
        let h = handle(DbFlags::DUP_SORT | DbFlags::DUP_FIXED);
        let values = vec![b"aaaa".to_vec(), b"bbbb".to_vec()];
        let bytes = build_subpage(&h, &values).unwrap();
        let sub = PageRef::new(&bytes).unwrap();
        assert!(sub.is_dupfix());
        assert_eq!(sub.ksize(), 4);
        assert_eq!(sub.nkeys(), 2);
        assert_eq!(sub.dupfix_key(1).unwrap(), b"bbbb");
        // Fixed layout: no per-node headers at all.
        assert_eq!(bytes.len(), PAGE_HDR + 8);
    }

    #[test]
    fn nested_handle_uses_dup_comparator() {
        let h = TreeHandle {
            dcmp: KeyCmp::Integer,
            ..handle(DbFlags::DUP_SORT | DbFlags::INTEGER_DUP)
        };
        let n = nested_handle(&h, TreeDesc::empty(0));
        assert_eq!(n.cmp, KeyCmp::Integer);
        assert_eq!(n.fixed, 0);
    }
}
