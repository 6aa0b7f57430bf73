//! Meta pages and database geometry
//!
//! Three meta pages live at page numbers 0..3 and rotate on every commit.
//! Each records a consistent snapshot: tree roots, geometry and txnid. A
//! meta is valid when both txnid fields agree; it is steady when its
//! datasync signature matches its contents, meaning the data pages it
//! references were fsynced before the meta was written.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, PageId, Result, TxnId};
use crate::page::{PAGE_HDR, PageFlags};

/// Number of meta pages at the front of the file.
pub const NUM_METAS: usize = 3;

/// Magic stamped into the meta header, version in the low byte.
pub const MAGIC: u32 = 0xC0_99_1C_00;

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Signature of a weak (not fsynced) meta.
pub const DATASIGN_WEAK: u64 = 0;

/// Serialized size of the meta payload.
pub const META_SIZE: usize = 216;

/// Serialized size of a tree descriptor.
pub const TREE_DESC_SIZE: usize = 64;

// Payload-relative field offsets; the 32-byte page header precedes them.
const OFF_MAGIC: usize = 0;
const OFF_GROW_PV: usize = 4;
const OFF_SHRINK_PV: usize = 6;
const OFF_GEO_LOWER: usize = 8;
const OFF_GEO_UPPER: usize = 12;
const OFF_GEO_NOW: usize = 16;
const OFF_GEO_NEXT: usize = 20;
const OFF_CANARY: usize = 24;
const OFF_TXNID_A: usize = 40;
const OFF_TREES: usize = 48;
const OFF_PAGES_RETIRED: usize = 176;
const OFF_BOOTID: usize = 184;
const OFF_DATASYNC_SIGN: usize = 200;
const OFF_TXNID_B: usize = 208;

/// File offset of the trailing txnid field of meta slot `slot`,
/// used by the two-phase meta write.
pub fn txnid_b_file_offset(slot: usize, page_size: usize) -> u64 {
    (slot * page_size + PAGE_HDR + OFF_TXNID_B) as u64
}

/// Database geometry, in pages. `grow_pv`/`shrink_pv` are the packed
/// exponential-quantised growth and shrink steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Minimum file size
    pub lower: u64,
    /// Maximum file size
    pub upper: u64,
    /// Currently backed file size
    pub now: u64,
    /// First unallocated page number
    pub next: u64,
    /// Packed growth step
    pub grow_pv: u16,
    /// Packed shrink threshold
    pub shrink_pv: u16,
}

impl Geometry {
    /// Growth step in pages.
    pub fn grow_step(&self) -> u64 {
        pv_to_pages(self.grow_pv).max(1)
    }

    /// Shrink threshold in pages.
    pub fn shrink_step(&self) -> u64 {
        pv_to_pages(self.shrink_pv)
    }

    fn check(&self) -> Result<()> {
        if self.lower > self.upper
            || self.now < self.lower
            || self.now > self.upper
            || self.next > self.now
            || self.next < NUM_METAS as u64
        {
            return Err(Error::corrupt(PageId::INVALID, "meta geometry out of order"));
        }
        Ok(())
    }
}

/// Pack a page count into the 16-bit quantised form: a 4-bit shift and a
/// 12-bit mantissa, rounded up so the unpacked value never shrinks.
pub fn pages_to_pv(pages: u64) -> u16 {
    if pages == 0 {
        return 0;
    }
    let mut e = 0u32;
    while (pages + (1 << e) - 1) >> e > 0xfff {
        e += 1;
    }
    debug_assert!(e <= 0xf);
    let m = pages.div_ceil(1 << e);
    ((e as u16) << 12) | m as u16
}

/// Unpack the quantised page count.
pub fn pv_to_pages(pv: u16) -> u64 {
    let e = (pv >> 12) as u64;
    let m = (pv & 0xfff) as u64;
    m << e
}

/// Guard values stamped by the application, carried through commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Canary {
    /// Application payload
    pub x: u32,
    /// Application payload
    pub y: u32,
    /// Application payload
    pub z: u32,
    /// Incremented by the engine on every canary update
    pub v: u32,
}

/// Persistent state of one subtree, stored in the meta page for the two
/// implicit trees and inside MAIN records for named ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeDesc {
    /// Database flags (`DbFlags` bits)
    pub flags: u16,
    /// Tree height; 0 when empty
    pub depth: u16,
    /// Fixed value size for `DUPFIXED` trees
    pub xsize: u32,
    /// Root page, `PageId::INVALID` when empty
    pub root: PageId,
    /// Branch page count
    pub branch_pages: u64,
    /// Leaf page count
    pub leaf_pages: u64,
    /// Large page count
    pub large_pages: u64,
    /// Monotonic per-database sequence
    pub sequence: u64,
    /// Number of key/value entries
    pub entries: u64,
    /// Txnid of the last structural modification
    pub mod_txnid: TxnId,
}

impl TreeDesc {
    /// Descriptor of an empty tree with the given flags.
    pub fn empty(flags: u16) -> Self {
        Self {
            flags,
            depth: 0,
            xsize: 0,
            root: PageId::INVALID,
            branch_pages: 0,
            leaf_pages: 0,
            large_pages: 0,
            sequence: 0,
            entries: 0,
            mod_txnid: TxnId(0),
        }
    }

    /// Serialize into a 64-byte span.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= TREE_DESC_SIZE);
        LittleEndian::write_u16(&mut out[0..], self.flags);
        LittleEndian::write_u16(&mut out[2..], self.depth);
        LittleEndian::write_u32(&mut out[4..], self.xsize);
        LittleEndian::write_u64(&mut out[8..], self.root.0);
        LittleEndian::write_u64(&mut out[16..], self.branch_pages);
        LittleEndian::write_u64(&mut out[24..], self.leaf_pages);
        LittleEndian::write_u64(&mut out[32..], self.large_pages);
        LittleEndian::write_u64(&mut out[40..], self.sequence);
        LittleEndian::write_u64(&mut out[48..], self.entries);
        LittleEndian::write_u64(&mut out[56..], self.mod_txnid.0);
    }

    /// Deserialize from a 64-byte span.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TREE_DESC_SIZE {
            return Err(Error::corrupt(PageId::INVALID, "short tree descriptor"));
        }
        Ok(Self {
            flags: LittleEndian::read_u16(&src[0..]),
            depth: LittleEndian::read_u16(&src[2..]),
            xsize: LittleEndian::read_u32(&src[4..]),
            root: PageId(LittleEndian::read_u64(&src[8..])),
            branch_pages: LittleEndian::read_u64(&src[16..]),
            leaf_pages: LittleEndian::read_u64(&src[24..]),
            large_pages: LittleEndian::read_u64(&src[32..]),
            sequence: LittleEndian::read_u64(&src[40..]),
            entries: LittleEndian::read_u64(&src[48..]),
            mod_txnid: TxnId(LittleEndian::read_u64(&src[56..])),
        })
    }

    /// Total pages owned by the tree.
    pub fn total_pages(&self) -> u64 {
        self.branch_pages + self.leaf_pages + self.large_pages
    }
}

/// Index of the GC tree in the meta descriptor pair.
pub const GC_DBI: usize = 0;

/// Index of the MAIN tree in the meta descriptor pair.
pub const MAIN_DBI: usize = 1;

/// One decoded meta page.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    /// Geometry at this snapshot
    pub geo: Geometry,
    /// Application canary
    pub canary: Canary,
    /// Snapshot txnid
    pub txnid: TxnId,
    /// GC and MAIN tree descriptors
    pub trees: [TreeDesc; 2],
    /// Cumulative count of retired pages
    pub pages_retired: u64,
    /// Boot id of the machine that wrote this meta
    pub bootid: (u64, u64),
    /// Datasync signature; `DATASIGN_WEAK` when not synced
    pub datasync_sign: u64,
}

impl Meta {
    /// Build the meta for a freshly created database.
    pub fn new_born(geo: Geometry, txnid: TxnId, bootid: (u64, u64)) -> Self {
        Self {
            geo,
            canary: Canary::default(),
            txnid,
            trees: [
                TreeDesc::empty(crate::db::DbFlags::INTEGER_KEY.bits()),
                TreeDesc::empty(0),
            ],
            pages_retired: 0,
            bootid,
            datasync_sign: DATASIGN_WEAK,
        }
    }

    /// Whether the datasync signature marks this meta steady.
    pub fn is_steady(&self) -> bool {
        self.datasync_sign != DATASIGN_WEAK
    }

    /// Compute the steady signature over the encoded payload.
    fn sign(payload: &[u8]) -> u64 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload[..OFF_DATASYNC_SIGN]);
        // High bit keeps a zero crc distinct from DATASIGN_WEAK.
        u64::from(hasher.finalize()) | (1 << 32)
    }

    /// Serialize into a page buffer; `steady` decides the signature.
    pub fn encode(&self, page: &mut [u8], slot: usize, steady: bool) {
        debug_assert!(page.len() >= PAGE_HDR + META_SIZE);
        // Page header for the meta slot. The ksize field carries the
        // page-size shift so reopen can discover the page size before
        // any geometry is decoded.
        LittleEndian::write_u64(&mut page[0..], slot as u64);
        LittleEndian::write_u64(&mut page[8..], self.txnid.0);
        LittleEndian::write_u16(&mut page[16..], PageFlags::META.bits());
        let page_len = page.len();
        LittleEndian::write_u16(&mut page[22..], page_len.trailing_zeros() as u16);

        let p = &mut page[PAGE_HDR..];
        LittleEndian::write_u32(&mut p[OFF_MAGIC..], MAGIC | FORMAT_VERSION);
        LittleEndian::write_u16(&mut p[OFF_GROW_PV..], self.geo.grow_pv);
        LittleEndian::write_u16(&mut p[OFF_SHRINK_PV..], self.geo.shrink_pv);
        LittleEndian::write_u32(&mut p[OFF_GEO_LOWER..], self.geo.lower as u32);
        LittleEndian::write_u32(&mut p[OFF_GEO_UPPER..], self.geo.upper as u32);
        LittleEndian::write_u32(&mut p[OFF_GEO_NOW..], self.geo.now as u32);
        LittleEndian::write_u32(&mut p[OFF_GEO_NEXT..], self.geo.next as u32);
        LittleEndian::write_u32(&mut p[OFF_CANARY..], self.canary.x);
        LittleEndian::write_u32(&mut p[OFF_CANARY + 4..], self.canary.y);
        LittleEndian::write_u32(&mut p[OFF_CANARY + 8..], self.canary.z);
        LittleEndian::write_u32(&mut p[OFF_CANARY + 12..], self.canary.v);
        LittleEndian::write_u64(&mut p[OFF_TXNID_A..], self.txnid.0);
        self.trees[GC_DBI].encode(&mut p[OFF_TREES..]);
        self.trees[MAIN_DBI].encode(&mut p[OFF_TREES + TREE_DESC_SIZE..]);
        LittleEndian::write_u64(&mut p[OFF_PAGES_RETIRED..], self.pages_retired);
        LittleEndian::write_u64(&mut p[OFF_BOOTID..], self.bootid.0);
        LittleEndian::write_u64(&mut p[OFF_BOOTID + 8..], self.bootid.1);
        let sign = if steady { Self::sign(p) } else { DATASIGN_WEAK };
        LittleEndian::write_u64(&mut p[OFF_DATASYNC_SIGN..], sign);
        LittleEndian::write_u64(&mut p[OFF_TXNID_B..], self.txnid.0);
    }

    /// Deserialize and validate one meta page. `Ok(None)` means the slot
    /// is torn or mid-update and should be skipped, not treated as
    /// corruption of the whole triad.
    pub fn decode(page: &[u8]) -> Result<Option<Meta>> {
        if page.len() < PAGE_HDR + META_SIZE {
            return Err(Error::corrupt(PageId::INVALID, "short meta page"));
        }
        let p = &page[PAGE_HDR..];
        let magic = LittleEndian::read_u32(&p[OFF_MAGIC..]);
        if magic & !0xff != MAGIC {
            return Err(Error::corrupt(PageId::INVALID, "bad meta magic"));
        }
        if magic & 0xff != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                expected: FORMAT_VERSION,
                found: magic & 0xff,
            });
        }
        let txnid_a = LittleEndian::read_u64(&p[OFF_TXNID_A..]);
        let txnid_b = LittleEndian::read_u64(&p[OFF_TXNID_B..]);
        if txnid_a != txnid_b || txnid_a == 0 {
            return Ok(None);
        }
        let geo = Geometry {
            lower: LittleEndian::read_u32(&p[OFF_GEO_LOWER..]) as u64,
            upper: LittleEndian::read_u32(&p[OFF_GEO_UPPER..]) as u64,
            now: LittleEndian::read_u32(&p[OFF_GEO_NOW..]) as u64,
            next: LittleEndian::read_u32(&p[OFF_GEO_NEXT..]) as u64,
            grow_pv: LittleEndian::read_u16(&p[OFF_GROW_PV..]),
            shrink_pv: LittleEndian::read_u16(&p[OFF_SHRINK_PV..]),
        };
        geo.check()?;
        let stored_sign = LittleEndian::read_u64(&p[OFF_DATASYNC_SIGN..]);
        let sign = if stored_sign != DATASIGN_WEAK && stored_sign == Self::sign(p) {
            stored_sign
        } else {
            // A claimed-steady meta with a wrong signature degrades to weak.
            DATASIGN_WEAK
        };
        Ok(Some(Meta {
            geo,
            canary: Canary {
                x: LittleEndian::read_u32(&p[OFF_CANARY..]),
                y: LittleEndian::read_u32(&p[OFF_CANARY + 4..]),
                z: LittleEndian::read_u32(&p[OFF_CANARY + 8..]),
                v: LittleEndian::read_u32(&p[OFF_CANARY + 12..]),
            },
            txnid: TxnId(txnid_a),
            trees: [
                TreeDesc::decode(&p[OFF_TREES..])?,
                TreeDesc::decode(&p[OFF_TREES + TREE_DESC_SIZE..])?,
            ],
            pages_retired: LittleEndian::read_u64(&p[OFF_PAGES_RETIRED..]),
            bootid: (
                LittleEndian::read_u64(&p[OFF_BOOTID..]),
                LittleEndian::read_u64(&p[OFF_BOOTID + 8..]),
            ),
            datasync_sign: sign,
        }))
    }
}

/// The decoded triad with head and steady picks.
#[derive(Debug, Clone, Copy)]
pub struct Triad {
    /// Valid metas by slot
    pub metas: [Option<Meta>; NUM_METAS],
    /// Slot with the highest valid txnid
    pub head: usize,
    /// Slot with the highest steady txnid, if any meta is steady
    pub steady: Option<usize>,
}

impl Triad {
    /// Pick head and steady among decoded slots.
    pub fn pick(metas: [Option<Meta>; NUM_METAS]) -> Result<Self> {
        let head = metas
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.map(|m| (i, m.txnid)))
            .max_by_key(|&(_, t)| t)
            .map(|(i, _)| i)
            .ok_or(Error::corrupt(PageId(0), "no valid meta page"))?;
        let steady = metas
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.filter(|m| m.is_steady()).map(|m| (i, m.txnid)))
            .max_by_key(|&(_, t)| t)
            .map(|(i, _)| i);
        Ok(Self { metas, head, steady })
    }

    /// The head meta.
    pub fn head_meta(&self) -> &Meta {
        self.metas[self.head].as_ref().expect("head slot is valid by construction")
    }

    /// Commit target: the slot that is neither head nor steady,
    /// preferring the most ancient candidate.
    pub fn target(&self) -> usize {
        (0..NUM_METAS)
            .filter(|&i| i != self.head && Some(i) != self.steady)
            .min_by_key(|&i| self.metas[i].map_or(TxnId(0), |m| m.txnid))
            .expect("triad always leaves a rotation target")
    }

    /// Whether a reopened database must fall back to the steady meta:
    /// the head is weak and was written during a different OS boot.
    pub fn needs_rollback(&self, bootid: (u64, u64)) -> bool {
        let head = self.head_meta();
        !head.is_steady()
            && self.steady.is_some()
            && head.bootid != bootid
    }
}
