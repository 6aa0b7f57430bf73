//! Page and node formats
//!
//! Pages are fixed-size blocks addressed by page number. Branch and leaf
//! pages carry a slot directory of 2-byte offsets growing up from the
//! header and node records packed down from the page end. Every access
//! into a page goes through a bounds-checked span with explicit
//! little-endian reads, so no struct layout ever leaks onto disk.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

use crate::comparator::KeyCmp;
use crate::error::{Error, PageId, Result, TxnId};

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Size of the fixed page header.
pub const PAGE_HDR: usize = 32;

/// Size of a branch or leaf node header.
pub const NODE_HDR: usize = 8;

const OFF_PGNO: usize = 0;
const OFF_TXNID: usize = 8;
const OFF_FLAGS: usize = 16;
const OFF_LOWER: usize = 18;
const OFF_UPPER: usize = 20;
const OFF_KSIZE: usize = 22;
const OFF_PAGES: usize = 24;

const_assert!(PAGE_HDR % 2 == 0);
const_assert!(NODE_HDR % 2 == 0);

bitflags! {
    /// Flags in the page header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch page (internal B+tree node)
        const BRANCH = 0x01;
        /// Leaf page
        const LEAF = 0x02;
        /// Multi-page run holding one large value
        const LARGE = 0x04;
        /// Meta page
        const META = 0x08;
        /// All values same size, no node directory
        const LEAF_FIXED = 0x10;
        /// Miniature leaf embedded in a parent leaf value
        const SUB = 0x20;
        /// Single-page freelist entry inside a write transaction
        const LOOSE = 0x40;
    }
}

bitflags! {
    /// Flags in a leaf node header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Value lives on a large-page run; node stores the base pgno
        const BIGDATA = 0x01;
        /// Value is a subtree descriptor
        const SUBDATA = 0x02;
        /// Value is a sorted duplicate set (sub-page or nested subtree)
        const DUPDATA = 0x04;
    }
}

/// What an insert stores in a leaf or branch node.
pub enum NodePayload<'a> {
    /// Inline value bytes
    Inline(&'a [u8]),
    /// Out-of-line value: base page of the large run plus real length
    Large(PageId, u32),
    /// Branch child pointer
    Child(PageId),
}

/// Outcome of a key search within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key present at index
    Found(usize),
    /// Key absent; it would sort at this index
    NotFound(usize),
}

impl SearchResult {
    /// Whether the key was present.
    pub fn is_found(self) -> bool {
        matches!(self, SearchResult::Found(_))
    }

    /// Index of the match or insertion point.
    pub fn index(self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => i,
        }
    }
}

/// Immutable view of a page.
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    bytes: &'a [u8],
}

impl<'a> PageRef<'a> {
    /// Wrap raw page bytes. Length must cover the header and be even.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < PAGE_HDR + 2 || bytes.len() % 2 != 0 {
            return Err(Error::corrupt(PageId::INVALID, "short page span"));
        }
        Ok(Self { bytes })
    }

    /// Raw bytes including the header.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn payload(&self) -> &'a [u8] {
        &self.bytes[PAGE_HDR..]
    }

    /// Page number from the header.
    pub fn pgno(&self) -> PageId {
        PageId(LittleEndian::read_u64(&self.bytes[OFF_PGNO..]))
    }

    /// Id of the transaction that last wrote this page.
    pub fn txnid(&self) -> TxnId {
        TxnId(LittleEndian::read_u64(&self.bytes[OFF_TXNID..]))
    }

    /// Header flags.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(LittleEndian::read_u16(&self.bytes[OFF_FLAGS..]))
    }

    /// End of the slot directory, relative to the payload start.
    pub fn lower(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_LOWER..]) as usize
    }

    /// Start of the node area, relative to the payload start.
    pub fn upper(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_UPPER..]) as usize
    }

    /// Fixed key size on `LEAF_FIXED` pages.
    pub fn ksize(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_KSIZE..]) as usize
    }

    /// Run length of a `LARGE` page.
    pub fn large_pages(&self) -> usize {
        LittleEndian::read_u32(&self.bytes[OFF_PAGES..]) as usize
    }

    /// Whether this is a branch page.
    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    /// Whether this is a leaf page (fixed or not).
    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    /// Whether keys are packed without a node directory.
    pub fn is_dupfix(&self) -> bool {
        self.flags().contains(PageFlags::LEAF_FIXED)
    }

    /// Number of nodes (or packed keys) on the page.
    pub fn nkeys(&self) -> usize {
        if self.is_dupfix() {
            let k = self.ksize();
            if k == 0 {
                0
            } else {
                self.lower() / k
            }
        } else {
            self.lower() / 2
        }
    }

    /// Free bytes between the slot directory and the node area.
    pub fn room(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Bytes in use, header included.
    pub fn used_space(&self) -> usize {
        PAGE_HDR + self.lower() + (self.payload().len() - self.upper())
    }

    /// Check structural sanity of the header against an expected kind.
    pub fn validate(&self, want: PageFlags) -> Result<()> {
        let flags = self.flags();
        if !flags.intersects(want) {
            return Err(Error::corrupt(self.pgno(), "unexpected page kind"));
        }
        if !flags.contains(PageFlags::LARGE)
            && (self.lower() > self.upper() || self.upper() > self.payload().len())
        {
            return Err(Error::corrupt(self.pgno(), "lower/upper out of bounds"));
        }
        Ok(())
    }

    fn slot(&self, i: usize) -> Result<usize> {
        let off = i * 2;
        if off + 2 > self.lower() {
            return Err(Error::corrupt(self.pgno(), "slot index past directory"));
        }
        Ok(LittleEndian::read_u16(&self.payload()[off..]) as usize)
    }

    /// Node view at index `i`.
    pub fn node(&self, i: usize) -> Result<NodeRef<'a>> {
        debug_assert!(!self.is_dupfix());
        let off = self.slot(i)?;
        if off < self.upper() || off + NODE_HDR > self.payload().len() {
            return Err(Error::corrupt(self.pgno(), "node offset out of bounds"));
        }
        NodeRef::new(self.payload(), off, self.is_branch(), self.pgno())
    }

    /// Key at index `i`, for any leaf or branch layout.
    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        if self.is_dupfix() {
            self.dupfix_key(i)
        } else {
            self.node(i)?.key()
        }
    }

    /// Packed key on a `LEAF_FIXED` page.
    pub fn dupfix_key(&self, i: usize) -> Result<&'a [u8]> {
        let k = self.ksize();
        let start = i * k;
        if k == 0 || start + k > self.lower() {
            return Err(Error::corrupt(self.pgno(), "dupfix index out of bounds"));
        }
        Ok(&self.payload()[start..start + k])
    }

    /// Value bytes of a `LARGE` page run (run spans must be fed whole).
    pub fn large_value(&self, len: usize) -> Result<&'a [u8]> {
        if !self.flags().contains(PageFlags::LARGE) || len > self.payload().len() {
            return Err(Error::corrupt(self.pgno(), "bad large-page run"));
        }
        Ok(&self.payload()[..len])
    }

    /// Binary search `key` among nodes `[from, nkeys)`.
    pub fn search_from(&self, from: usize, key: &[u8], cmp: KeyCmp) -> Result<SearchResult> {
        let mut lo = from;
        let mut hi = self.nkeys();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp.cmp(key, self.key(mid)?) {
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }
        Ok(SearchResult::NotFound(lo))
    }

    /// Binary search over the whole page.
    pub fn search(&self, key: &[u8], cmp: KeyCmp) -> Result<SearchResult> {
        self.search_from(0, key, cmp)
    }

    /// Child index a descent should follow for `key`. The first branch key
    /// is a logical minus-infinity and never compared.
    pub fn branch_descend(&self, key: &[u8], cmp: KeyCmp) -> Result<usize> {
        debug_assert!(self.is_branch());
        match self.search_from(1, key, cmp)? {
            SearchResult::Found(i) => Ok(i),
            SearchResult::NotFound(i) => Ok(i - 1),
        }
    }

    /// Child page of a branch node.
    pub fn child(&self, i: usize) -> Result<PageId> {
        self.node(i)?.child()
    }

    /// Byte size of the node record at `i`, slot excluded.
    pub fn node_size(&self, i: usize) -> Result<usize> {
        let node = self.node(i)?;
        Ok(node.record_size())
    }
}

/// View of one node inside a page payload.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    payload: &'a [u8],
    off: usize,
    branch: bool,
    pgno: PageId,
}

impl<'a> NodeRef<'a> {
    fn new(payload: &'a [u8], off: usize, branch: bool, pgno: PageId) -> Result<Self> {
        let node = Self { payload, off, branch, pgno };
        let end = off + node.record_size();
        if end > payload.len() || node.record_size() < NODE_HDR {
            return Err(Error::corrupt(pgno, "node extends past page"));
        }
        Ok(node)
    }

    fn key_len(&self) -> usize {
        LittleEndian::read_u16(&self.payload[self.off + 4..]) as usize
    }

    /// Stored value length. For `BIGDATA` this is the logical length of
    /// the out-of-line value, not the 8 bytes held inline.
    pub fn value_len(&self) -> usize {
        debug_assert!(!self.branch);
        LittleEndian::read_u32(&self.payload[self.off..]) as usize
    }

    /// Leaf node flags.
    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.payload[self.off + 6])
    }

    fn stored_payload(&self) -> usize {
        if self.branch {
            0
        } else if self.flags().contains(NodeFlags::BIGDATA) {
            8
        } else {
            self.value_len()
        }
    }

    /// Total record size, rounded to the 2-byte node alignment.
    pub fn record_size(&self) -> usize {
        let raw = NODE_HDR + self.key_len() + self.stored_payload();
        raw + (raw & 1)
    }

    /// Key bytes.
    pub fn key(&self) -> Result<&'a [u8]> {
        let start = self.off + NODE_HDR;
        let end = start + self.key_len();
        if end > self.payload.len() {
            return Err(Error::corrupt(self.pgno, "node key out of bounds"));
        }
        Ok(&self.payload[start..end])
    }

    /// Inline value bytes. Errors on `BIGDATA`; the caller resolves the
    /// large run through the transaction instead.
    pub fn value(&self) -> Result<&'a [u8]> {
        debug_assert!(!self.branch);
        if self.flags().contains(NodeFlags::BIGDATA) {
            return Err(Error::corrupt(self.pgno, "inline read of out-of-line value"));
        }
        let start = self.off + NODE_HDR + self.key_len();
        let end = start + self.value_len();
        if end > self.payload.len() {
            return Err(Error::corrupt(self.pgno, "node value out of bounds"));
        }
        Ok(&self.payload[start..end])
    }

    /// Base page of the large run for a `BIGDATA` node.
    pub fn large_pgno(&self) -> Result<PageId> {
        if !self.flags().contains(NodeFlags::BIGDATA) {
            return Err(Error::corrupt(self.pgno, "not an out-of-line value"));
        }
        let start = self.off + NODE_HDR + self.key_len();
        Ok(PageId(LittleEndian::read_u64(&self.payload[start..])))
    }

    /// Child page of a branch node; high bits live in the eighth
    /// header byte.
    pub fn child(&self) -> Result<PageId> {
        if !self.branch {
            return Err(Error::corrupt(self.pgno, "child read on leaf node"));
        }
        let lo = LittleEndian::read_u32(&self.payload[self.off..]) as u64;
        let hi = self.payload[self.off + 7] as u64;
        Ok(PageId(lo | (hi << 32)))
    }
}

/// Mutable view of a page.
pub struct PageMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Wrap raw mutable page bytes.
    pub fn new(bytes: &'a mut [u8]) -> Result<Self> {
        PageRef::new(bytes)?;
        Ok(Self { bytes })
    }

    /// Reborrow as an immutable view.
    pub fn as_ref(&self) -> PageRef<'_> {
        PageRef { bytes: self.bytes }
    }

    fn payload_len(&self) -> usize {
        self.bytes.len() - PAGE_HDR
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[PAGE_HDR..]
    }

    /// Reset the header for a fresh page of the given kind.
    pub fn init(&mut self, pgno: PageId, flags: PageFlags, txnid: TxnId) {
        let upper = self.payload_len() as u16;
        LittleEndian::write_u64(&mut self.bytes[OFF_PGNO..], pgno.0);
        LittleEndian::write_u64(&mut self.bytes[OFF_TXNID..], txnid.0);
        LittleEndian::write_u16(&mut self.bytes[OFF_FLAGS..], flags.bits());
        LittleEndian::write_u16(&mut self.bytes[OFF_LOWER..], 0);
        LittleEndian::write_u16(&mut self.bytes[OFF_UPPER..], upper);
        LittleEndian::write_u16(&mut self.bytes[OFF_KSIZE..], 0);
        LittleEndian::write_u32(&mut self.bytes[OFF_PAGES..], 0);
        LittleEndian::write_u32(&mut self.bytes[OFF_PAGES + 4..], 0);
    }

    /// Stamp the page number.
    pub fn set_pgno(&mut self, pgno: PageId) {
        LittleEndian::write_u64(&mut self.bytes[OFF_PGNO..], pgno.0);
    }

    /// Stamp the writing transaction id.
    pub fn set_txnid(&mut self, txnid: TxnId) {
        LittleEndian::write_u64(&mut self.bytes[OFF_TXNID..], txnid.0);
    }

    /// Replace the flag word.
    pub fn set_flags(&mut self, flags: PageFlags) {
        LittleEndian::write_u16(&mut self.bytes[OFF_FLAGS..], flags.bits());
    }

    /// Set the fixed key size for a `LEAF_FIXED` page.
    pub fn set_ksize(&mut self, ksize: usize) {
        LittleEndian::write_u16(&mut self.bytes[OFF_KSIZE..], ksize as u16);
    }

    /// Set the run length of a `LARGE` page.
    pub fn set_large_pages(&mut self, n: usize) {
        LittleEndian::write_u32(&mut self.bytes[OFF_PAGES..], n as u32);
    }

    fn set_lower(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.bytes[OFF_LOWER..], v as u16);
    }

    fn set_upper(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.bytes[OFF_UPPER..], v as u16);
    }

    /// Bytes a leaf insert of `klen`/`payload` will consume, slot
    /// included.
    pub fn leaf_need(klen: usize, payload: usize) -> usize {
        let raw = NODE_HDR + klen + payload;
        raw + (raw & 1) + 2
    }

    /// Bytes a branch insert of `klen` will consume, slot included.
    pub fn branch_need(klen: usize) -> usize {
        let raw = NODE_HDR + klen;
        raw + (raw & 1) + 2
    }

    /// Insert a node at index `i`, shifting later slots up.
    pub fn insert_node(
        &mut self,
        i: usize,
        key: &[u8],
        payload: NodePayload<'_>,
        node_flags: NodeFlags,
    ) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(!view.is_dupfix());
        let nkeys = view.nkeys();
        if i > nkeys {
            return Err(Error::InvalidParameter("node insert index out of bounds"));
        }
        let stored: usize = match payload {
            NodePayload::Inline(v) => v.len(),
            NodePayload::Large(..) => 8,
            NodePayload::Child(_) => 0,
        };
        let raw = NODE_HDR + key.len() + stored;
        let size = raw + (raw & 1);
        let lower = view.lower();
        let upper = view.upper();
        if size + 2 > upper - lower {
            return Err(Error::PageFull);
        }

        let off = upper - size;
        let pgno = view.pgno();
        let branch = view.is_branch();
        let payload_buf = self.payload_mut();

        // Slot directory: open a gap at i.
        payload_buf.copy_within(i * 2..lower, i * 2 + 2);
        LittleEndian::write_u16(&mut payload_buf[i * 2..], off as u16);

        // Node record.
        match payload {
            NodePayload::Inline(v) => {
                LittleEndian::write_u32(&mut payload_buf[off..], v.len() as u32);
                LittleEndian::write_u16(&mut payload_buf[off + 4..], key.len() as u16);
                payload_buf[off + 6] = node_flags.bits();
                payload_buf[off + 7] = 0;
                payload_buf[off + NODE_HDR..off + NODE_HDR + key.len()].copy_from_slice(key);
                let vs = off + NODE_HDR + key.len();
                payload_buf[vs..vs + v.len()].copy_from_slice(v);
            }
            NodePayload::Large(lp, len) => {
                LittleEndian::write_u32(&mut payload_buf[off..], len);
                LittleEndian::write_u16(&mut payload_buf[off + 4..], key.len() as u16);
                payload_buf[off + 6] = (node_flags | NodeFlags::BIGDATA).bits();
                payload_buf[off + 7] = 0;
                payload_buf[off + NODE_HDR..off + NODE_HDR + key.len()].copy_from_slice(key);
                let vs = off + NODE_HDR + key.len();
                LittleEndian::write_u64(&mut payload_buf[vs..], lp.0);
            }
            NodePayload::Child(child) => {
                debug_assert!(branch, "child payload on page {pgno}");
                LittleEndian::write_u32(&mut payload_buf[off..], (child.0 & 0xffff_ffff) as u32);
                LittleEndian::write_u16(&mut payload_buf[off + 4..], key.len() as u16);
                payload_buf[off + 6] = 0;
                payload_buf[off + 7] = (child.0 >> 32) as u8;
                payload_buf[off + NODE_HDR..off + NODE_HDR + key.len()].copy_from_slice(key);
            }
        }

        self.set_lower(lower + 2);
        self.set_upper(off);
        Ok(())
    }

    /// Delete the node at index `i`, compacting the node area.
    pub fn del_node(&mut self, i: usize) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(!view.is_dupfix());
        let nkeys = view.nkeys();
        if i >= nkeys {
            return Err(Error::InvalidParameter("node delete index out of bounds"));
        }
        let node = view.node(i)?;
        let off = view.slot(i)?;
        let size = node.record_size();
        let lower = view.lower();
        let upper = view.upper();

        let payload_buf = self.payload_mut();
        // Close the slot gap.
        payload_buf.copy_within(i * 2 + 2..lower, i * 2);
        // Slide nodes below the hole up by its size, fixing their slots.
        payload_buf.copy_within(upper..off, upper + size);
        let new_lower = lower - 2;
        for j in 0..new_lower / 2 {
            let s = LittleEndian::read_u16(&payload_buf[j * 2..]) as usize;
            if s < off {
                LittleEndian::write_u16(&mut payload_buf[j * 2..], (s + size) as u16);
            }
        }
        self.set_lower(new_lower);
        self.set_upper(upper + size);
        Ok(())
    }

    /// Overwrite the inline value of node `i` with same-length bytes.
    pub fn replace_value(&mut self, i: usize, value: &[u8]) -> Result<()> {
        let view = self.as_ref();
        let node = view.node(i)?;
        if node.flags().contains(NodeFlags::BIGDATA) || node.value_len() != value.len() {
            return Err(Error::InvalidParameter("in-place value must keep its size"));
        }
        let off = view.slot(i)?;
        let klen = node.key_len();
        let payload_buf = self.payload_mut();
        let vs = off + NODE_HDR + klen;
        payload_buf[vs..vs + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Patch the child pointer of a branch node in place.
    pub fn set_node_child(&mut self, i: usize, child: PageId) -> Result<()> {
        debug_assert!(self.as_ref().is_branch());
        let off = self.as_ref().slot(i)?;
        let payload_buf = self.payload_mut();
        LittleEndian::write_u32(&mut payload_buf[off..], (child.0 & 0xffff_ffff) as u32);
        payload_buf[off + 7] = (child.0 >> 32) as u8;
        Ok(())
    }

    /// Or extra flags into the node at `i`.
    pub fn set_node_flags(&mut self, i: usize, flags: NodeFlags) -> Result<()> {
        let view = self.as_ref();
        let off = view.slot(i)?;
        let payload_buf = self.payload_mut();
        payload_buf[off + 6] = flags.bits();
        Ok(())
    }

    /// Insert a packed key on a `LEAF_FIXED` page.
    pub fn insert_dupfix(&mut self, i: usize, key: &[u8]) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(view.is_dupfix());
        let k = view.ksize();
        if key.len() != k {
            return Err(Error::InvalidParameter("dupfix key size mismatch"));
        }
        let lower = view.lower();
        if lower + k > view.upper() || i * k > lower {
            return Err(Error::PageFull);
        }
        let payload_buf = self.payload_mut();
        payload_buf.copy_within(i * k..lower, i * k + k);
        payload_buf[i * k..i * k + k].copy_from_slice(key);
        self.set_lower(lower + k);
        Ok(())
    }

    /// Remove a packed key from a `LEAF_FIXED` page.
    pub fn del_dupfix(&mut self, i: usize) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(view.is_dupfix());
        let k = view.ksize();
        let lower = view.lower();
        if k == 0 || (i + 1) * k > lower {
            return Err(Error::InvalidParameter("dupfix delete index out of bounds"));
        }
        let payload_buf = self.payload_mut();
        payload_buf.copy_within((i + 1) * k..lower, i * k);
        self.set_lower(lower - k);
        Ok(())
    }

    /// Write large-run value bytes right after the header.
    pub fn write_large_value(&mut self, value: &[u8]) -> Result<()> {
        if value.len() > self.payload_len() {
            return Err(Error::InvalidParameter("large value exceeds its run"));
        }
        let payload_buf = self.payload_mut();
        payload_buf[..value.len()].copy_from_slice(value);
        Ok(())
    }
}

/// Heap-allocated page owned by a write transaction.
pub struct PageBuf {
    bytes: Box<[u8]>,
}

impl PageBuf {
    /// Allocate a zeroed buffer of `npages` contiguous pages.
    pub fn alloc(page_size: usize, npages: usize) -> Self {
        Self { bytes: vec![0u8; page_size * npages].into_boxed_slice() }
    }

    /// Allocate and initialize a fresh single page.
    pub fn new_page(page_size: usize, pgno: PageId, flags: PageFlags, txnid: TxnId) -> Self {
        let mut buf = Self::alloc(page_size, 1);
        let mut page = buf.as_mut();
        page.init(pgno, flags, txnid);
        buf
    }

    /// Copy an existing page image (COW source).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec().into_boxed_slice() }
    }

    /// Immutable view.
    pub fn as_page(&self) -> PageRef<'_> {
        PageRef { bytes: &self.bytes }
    }

    /// Mutable view.
    pub fn as_mut(&mut self) -> PageMut<'_> {
        PageMut { bytes: &mut self.bytes }
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes (pages × page size).
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Usable payload bytes per page.
pub fn page_room(page_size: usize) -> usize {
    page_size - PAGE_HDR
}

/// Largest key a branch page can carry and still hold the minimum of
/// two splittable entries.
pub fn max_key_size(page_size: usize) -> usize {
    (page_room(page_size) - 2 * NODE_HDR) / 3
}

/// Largest leaf payload stored inline; one byte more goes to a large
/// run. Half the page keeps every page splittable in a single pass.
pub fn max_inline_value(page_size: usize, key_len: usize) -> usize {
    let cap = page_room(page_size) / 2 - NODE_HDR - 2;
    cap.saturating_sub(key_len)
}

/// Pages needed for a large-value run.
pub fn large_run_pages(page_size: usize, value_len: usize) -> usize {
    (PAGE_HDR + value_len).div_ceil(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(page_size: usize) -> PageBuf {
        PageBuf::new_page(page_size, PageId(9), PageFlags::LEAF, TxnId(4))
    }

    #[test]
    fn header_round_trip() {
        let buf = leaf(4096);
        let page = buf.as_page();
        assert_eq!(page.pgno(), PageId(9));
        assert_eq!(page.txnid(), TxnId(4));
        assert!(page.is_leaf());
        assert_eq!(page.nkeys(), 0);
        assert_eq!(page.room(), 4096 - PAGE_HDR);
    }

    #[test]
    fn insert_and_search() {
        let mut buf = leaf(4096);
        let mut page = buf.as_mut();
        page.insert_node(0, b"bravo", NodePayload::Inline(b"2"), NodeFlags::empty()).unwrap();
        page.insert_node(0, b"alpha", NodePayload::Inline(b"1"), NodeFlags::empty()).unwrap();
        page.insert_node(2, b"delta", NodePayload::Inline(b"4"), NodeFlags::empty()).unwrap();

        let view = buf.as_page();
        assert_eq!(view.nkeys(), 3);
        assert_eq!(view.node(0).unwrap().key().unwrap(), b"alpha");
        assert_eq!(view.node(1).unwrap().value().unwrap(), b"2");
        assert_eq!(view.search(b"delta", KeyCmp::Lexical).unwrap(), SearchResult::Found(2));
        assert_eq!(view.search(b"charlie", KeyCmp::Lexical).unwrap(), SearchResult::NotFound(2));
    }

    #[test]
    fn delete_compacts_and_keeps_order() {
        let mut buf = leaf(4096);
        {
            let mut page = buf.as_mut();
            for (i, k) in [b"aa", b"bb", b"cc", b"dd"].iter().enumerate() {
                page.insert_node(i, *k, NodePayload::Inline(b"vvvv"), NodeFlags::empty()).unwrap();
            }
        }
        let before = buf.as_page().room();
        buf.as_mut().del_node(1).unwrap();
        let view = buf.as_page();
        assert_eq!(view.nkeys(), 3);
        assert_eq!(view.node(0).unwrap().key().unwrap(), b"aa");
        assert_eq!(view.node(1).unwrap().key().unwrap(), b"cc");
        assert_eq!(view.node(2).unwrap().value().unwrap(), b"vvvv");
        assert!(view.room() > before);
    }

    #[test]
    fn branch_child_forty_bits() {
        let mut buf = PageBuf::new_page(4096, PageId(3), PageFlags::BRANCH, TxnId(1));
        let big = PageId((7u64 << 32) | 0x0102_0304);
        buf.as_mut().insert_node(0, b"", NodePayload::Child(big), NodeFlags::empty()).unwrap();
        assert_eq!(buf.as_page().child(0).unwrap(), big);
    }

    #[test]
    fn branch_descend_ignores_first_key() {
        let mut buf = PageBuf::new_page(4096, PageId(3), PageFlags::BRANCH, TxnId(1));
        {
            let mut page = buf.as_mut();
            page.insert_node(0, b"", NodePayload::Child(PageId(10)), NodeFlags::empty()).unwrap();
            page.insert_node(1, b"m", NodePayload::Child(PageId(11)), NodeFlags::empty()).unwrap();
            page.insert_node(2, b"t", NodePayload::Child(PageId(12)), NodeFlags::empty()).unwrap();
        }
        let view = buf.as_page();
        assert_eq!(view.branch_descend(b"a", KeyCmp::Lexical).unwrap(), 0);
        assert_eq!(view.branch_descend(b"m", KeyCmp::Lexical).unwrap(), 1);
        assert_eq!(view.branch_descend(b"p", KeyCmp::Lexical).unwrap(), 1);
        assert_eq!(view.branch_descend(b"z", KeyCmp::Lexical).unwrap(), 2);
    }

    #[test]
    fn dupfix_pack_and_remove() {
        let mut buf = PageBuf::new_page(
            512,
            PageId(5),
            PageFlags::LEAF | PageFlags::LEAF_FIXED,
            TxnId(2),
        );
        buf.as_mut().set_ksize(4);
        {
            let mut page = buf.as_mut();
            page.insert_dupfix(0, b"bbbb").unwrap();
            page.insert_dupfix(0, b"aaaa").unwrap();
            page.insert_dupfix(2, b"cccc").unwrap();
        }
        let view = buf.as_page();
        assert_eq!(view.nkeys(), 3);
        assert_eq!(view.dupfix_key(1).unwrap(), b"bbbb");
        buf.as_mut().del_dupfix(0).unwrap();
        let view = buf.as_page();
        assert_eq!(view.nkeys(), 2);
        assert_eq!(view.dupfix_key(0).unwrap(), b"bbbb");
    }

    #[test]
    fn full_page_rejects_insert() {
        let mut buf = leaf(MIN_PAGE_SIZE);
        let mut page = buf.as_mut();
        let mut i = 0;
        loop {
            let key = [b'k', i as u8];
            match page.insert_node(i, &key, NodePayload::Inline(&[0u8; 16]), NodeFlags::empty()) {
                Ok(()) => i += 1,
                Err(Error::PageFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(i >= 2);
        assert_eq!(page.as_ref().nkeys(), i);
    }

    #[test]
    fn size_bounds_scale_with_page() {
        assert!(max_key_size(4096) >= 1024);
        assert!(max_key_size(256) >= 64);
        assert!(max_inline_value(4096, 16) < page_room(4096) / 2);
        assert_eq!(large_run_pages(4096, 4096), 2);
        assert_eq!(large_run_pages(4096, 4000), 1);
    }
}
