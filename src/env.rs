//! Environment management
//!
//! Opening an environment validates or creates the meta triad,
//! reconciles boot-id mismatches by rolling weak heads back to the
//! steady meta, maps the data file once for the full geometry upper
//! bound, and attaches the shared lock file. All process-scoped state
//! lives here; the only cross-process state is in the two files.

use fs2::FileExt as _;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::db::{Database, DbFlags, DbStat, TreeHandle};
use crate::error::{Error, PageId, Result, TxnId};
use crate::io::PageIo;
use crate::meta::{self, Geometry, Meta, NUM_METAS, Triad, pages_to_pv};
use crate::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, NodeFlags, PAGE_HDR};
use crate::reader::{LockFile, ReaderInfo};
use crate::tree;
use crate::txn::{Dbi, MAIN_DBI_SLOT, ReadTxn, TxnRead, WriteTxn};

/// Data file name inside the environment directory.
const DATA_NAME: &str = "data.cdb";

/// Lock file name inside the environment directory.
const LOCK_NAME: &str = "lock.cdb";

/// Writer mutex file name inside the environment directory.
const WRITER_NAME: &str = "writer.lck";

/// Default geometry upper bound: 1 GiB.
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;

/// Default dirty-page budget per write transaction.
pub const DEFAULT_DP_LIMIT: usize = 1 << 16;

bitflags::bitflags! {
    /// Environment mode flags. Persisted in the lock file; every
    /// process attached to one environment must agree on them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Mutate pages directly in the mapping and msync at commit
        const WRITEMAP = 0x1;
        /// Skip the commit fsync; the meta stays weak until a durable
        /// commit or an explicit sync promotes it
        const SAFE_NOSYNC = 0x2;
    }
}

/// What a handle-slow-readers callback tells the allocator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsrDecision {
    /// The application dealt with the laggard; retry the allocation
    Retry,
    /// Evict the laggard's slot, then retry
    Evict,
    /// Give up and surface `MapFull`
    Fail,
}

/// Handle-slow-readers callback.
pub type HsrCallback = Box<dyn Fn(&ReaderInfo) -> HsrDecision + Send + Sync>;

/// One registered named database.
struct DbiSlot {
    name: String,
    flags: DbFlags,
}

/// Process-wide set of open environment directories; a second open of
/// the same path in one process is refused.
static OPEN_ENVS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn open_registry() -> &'static Mutex<HashSet<PathBuf>> {
    OPEN_ENVS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Shared environment state.
pub struct EnvInner {
    path: PathBuf,
    flags: EnvFlags,
    pub(crate) io: PageIo,
    pub(crate) lck: LockFile,
    writer_file: File,
    pub(crate) write_gate: Mutex<()>,
    fatal: AtomicBool,
    pub(crate) bootid: (u64, u64),
    pub(crate) dp_limit: usize,
    pub(crate) hsr: Option<HsrCallback>,
    dbis: RwLock<Vec<DbiSlot>>,
}

/// RAII guard for the cross-process writer mutex.
pub struct WriterLock<'env> {
    file: &'env File,
}

impl Drop for WriterLock<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(self.file);
    }
}

impl EnvInner {
    /// Whether commits mutate the mapping directly.
    pub(crate) fn writemap(&self) -> bool {
        self.flags.contains(EnvFlags::WRITEMAP)
    }

    /// Whether commits skip the durability fsync.
    pub(crate) fn safe_nosync(&self) -> bool {
        self.flags.contains(EnvFlags::SAFE_NOSYNC)
    }

    /// Set the sticky fatal bit; all further mutation is refused.
    pub(crate) fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
        tracing::error!("environment entered fatal state");
    }

    /// Error out when the fatal bit is set.
    pub(crate) fn check_fatal(&self) -> Result<()> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(Error::Fatal("environment is in fatal state".into()));
        }
        Ok(())
    }

    /// Acquire the cross-process writer mutex.
    pub(crate) fn lock_writer(&self) -> Result<WriterLock<'_>> {
        self.writer_file.lock_exclusive().map_err(|e| Error::Io(e.to_string()))?;
        Ok(WriterLock { file: &self.writer_file })
    }

    /// Read and validate the meta triad, twice, so a rotation racing
    /// the read is caught rather than decoded torn.
    pub(crate) fn read_triad(&self) -> Result<Triad> {
        for _ in 0..5 {
            let first = self.decode_metas()?;
            let second = self.decode_metas()?;
            let stable = first
                .iter()
                .zip(second.iter())
                .all(|(a, b)| a.map(|m| m.txnid) == b.map(|m| m.txnid));
            if stable {
                return Triad::pick(second);
            }
        }
        Err(Error::Busy)
    }

    fn decode_metas(&self) -> Result<[Option<Meta>; NUM_METAS]> {
        let mut metas = [None; NUM_METAS];
        for (slot, out) in metas.iter_mut().enumerate() {
            let page = self.io.page(PageId(slot as u64))?;
            *out = Meta::decode(page)?;
        }
        Ok(metas)
    }

    /// The current head meta.
    pub(crate) fn read_head(&self) -> Result<Meta> {
        Ok(*self.read_triad()?.head_meta())
    }

    /// Install a meta into `slot` with the torn-write-proof ordering:
    /// invalidate the trailing txnid, write the body, then write the
    /// trailing txnid last.
    pub(crate) fn write_meta(&self, m: &Meta, slot: usize, steady: bool) -> Result<()> {
        let psize = self.io.page_size();
        let mut page = vec![0u8; psize];
        m.encode(&mut page, slot, steady);

        let b_off = meta::txnid_b_file_offset(slot, psize);
        self.io.write_at(b_off, &[0u8; 8])?;
        let tail = page[PAGE_HDR + 208..PAGE_HDR + 216].to_vec();
        page[PAGE_HDR + 208..PAGE_HDR + 216].fill(0);
        self.io.write_pages(PageId(slot as u64), &page)?;
        self.io.write_at(b_off, &tail)?;
        if steady {
            self.io.sync_data()?;
        }
        Ok(())
    }

    /// Name of a registered named database.
    pub(crate) fn dbi_name(&self, dbi: Dbi) -> Result<String> {
        let dbis = self.dbis.read().map_err(|_| Error::Busy)?;
        dbis.get(dbi as usize - 2)
            .map(|s| s.name.clone())
            .ok_or(Error::BadDbi)
    }

    fn registered(&self, name: &str) -> Option<(Dbi, DbFlags)> {
        let dbis = self.dbis.read().ok()?;
        dbis.iter()
            .position(|s| s.name == name)
            .map(|i| ((i + 2) as Dbi, dbis[i].flags))
    }

    fn register(&self, name: &str, flags: DbFlags) -> Result<Dbi> {
        let mut dbis = self.dbis.write().map_err(|_| Error::Busy)?;
        if let Some(i) = dbis.iter().position(|s| s.name == name) {
            return Ok((i + 2) as Dbi);
        }
        dbis.push(DbiSlot { name: name.to_string(), flags });
        Ok((dbis.len() + 1) as Dbi)
    }

    /// Load the tree descriptor of a named database out of MAIN at the
    /// transaction's snapshot.
    pub(crate) fn load_named_handle<T: TxnRead>(&self, txn: &T, dbi: Dbi) -> Result<TreeHandle> {
        let name = self.dbi_name(dbi)?;
        let main = txn.tree_handle(MAIN_DBI_SLOT)?;
        let Some((path, exact)) = tree::seek(txn, &main, name.as_bytes())? else {
            return Err(Error::BadDbi);
        };
        if !exact {
            return Err(Error::BadDbi);
        }
        let node = tree::node_at(txn, &path)?;
        if !node.flags().contains(NodeFlags::SUBDATA) || node.flags().contains(NodeFlags::DUPDATA)
        {
            return Err(Error::Incompatible);
        }
        let desc = crate::meta::TreeDesc::decode(node.value()?)?;
        Ok(TreeHandle::new(dbi, desc))
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        open_registry().lock().remove(&self.path);
    }
}

/// A coppice environment: one data file, one lock file, one mapping.
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish()
    }
}

impl Environment {
    pub(crate) fn inner(&self) -> &EnvInner {
        &self.inner
    }

    /// Begin a read-only snapshot transaction.
    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        ReadTxn::begin(self)
    }

    /// Begin the write transaction; blocks on the writer mutex.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        WriteTxn::begin(self)
    }

    /// Open the MAIN database.
    pub fn main_db(&self) -> Database {
        Database::new(MAIN_DBI_SLOT)
    }

    /// Open an existing named database at the transaction's snapshot.
    pub fn open_db<T: TxnRead>(&self, txn: &T, name: Option<&str>) -> Result<Database> {
        let Some(name) = name else {
            return Ok(self.main_db());
        };
        if let Some((dbi, _)) = self.inner.registered(name) {
            // Confirm it exists at this snapshot.
            txn.tree_handle(dbi)?;
            return Ok(Database::new(dbi));
        }
        // Probe MAIN before registering a slot.
        let probe = self.inner.register(name, DbFlags::empty())?;
        let handle = self.inner.load_named_handle(txn, probe)?;
        let mut dbis = self.inner.dbis.write().map_err(|_| Error::Busy)?;
        dbis[probe as usize - 2].flags = handle.flags;
        Ok(Database::new(probe))
    }

    /// Open or create a named database.
    pub fn create_db(
        &self,
        txn: &mut WriteTxn<'_>,
        name: Option<&str>,
        flags: DbFlags,
    ) -> Result<Database> {
        let Some(name) = name else {
            return Ok(self.main_db());
        };
        let dbi = self.inner.register(name, flags)?;
        match txn.tree_handle(dbi) {
            Ok(existing) => {
                if existing.flags != flags {
                    return Err(Error::Incompatible);
                }
                Ok(Database::new(dbi))
            }
            Err(Error::BadDbi) => {
                let desc = crate::meta::TreeDesc::empty(flags.bits());
                let handle = TreeHandle::new(dbi, desc);
                txn.store_tree(dbi, &handle);
                tracing::debug!(name, "created named database");
                Ok(Database::new(dbi))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a named database: its pages and its MAIN record.
    pub fn drop_db(&self, txn: &mut WriteTxn<'_>, db: Database) -> Result<()> {
        if db.dbi <= MAIN_DBI_SLOT {
            return Err(Error::InvalidParameter("cannot drop an implicit database"));
        }
        let mut h = txn.tree_handle(db.dbi)?;
        tree::clear(txn, &mut h)?;
        let name = self.inner.dbi_name(db.dbi)?;
        let mut main = txn.tree_handle(MAIN_DBI_SLOT)?;
        tree::del(txn, &mut main, name.as_bytes(), None)?;
        txn.store_tree(MAIN_DBI_SLOT, &main);
        txn.forget_tree(db.dbi);
        Ok(())
    }

    /// Flush unsynced data and promote a weak head to steady. With
    /// `force`, fsync even when the head is already steady.
    pub fn sync(&self, force: bool) -> Result<()> {
        let inner = self.inner();
        inner.check_fatal()?;
        let _gate = inner.write_gate.lock();
        let _wl = inner.lock_writer()?;
        let triad = inner.read_triad()?;
        let head = *triad.head_meta();
        if head.is_steady() && !force {
            return Ok(());
        }
        inner.io.sync_data()?;
        if !head.is_steady() {
            let slot = triad.target();
            inner.write_meta(&head, slot, true)?;
        }
        inner.lck.reset_unsynced_pages();
        tracing::debug!(txnid = head.txnid.0, "sync promoted head to steady");
        Ok(())
    }

    /// Statistics of the MAIN database at the current head.
    pub fn stat(&self) -> Result<DbStat> {
        let head = self.inner.read_head()?;
        Ok(DbStat::from_desc(&head.trees[meta::MAIN_DBI]))
    }

    /// Environment-wide information at the current head.
    pub fn info(&self) -> Result<EnvInfo> {
        let head = self.inner.read_head()?;
        Ok(EnvInfo {
            page_size: self.inner.io.page_size(),
            last_txnid: head.txnid,
            geo_lower: head.geo.lower,
            geo_upper: head.geo.upper,
            geo_now: head.geo.now,
            next_pgno: head.geo.next,
            pages_retired: head.pages_retired,
            readers: self.inner.lck.reader_count(),
        })
    }

    /// Live readers, for diagnostics.
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.inner.lck.reader_list()
    }

    /// Clear slots of dead reader processes. Returns how many.
    pub fn reader_check(&self) -> usize {
        self.inner.lck.reader_check()
    }
}

/// A snapshot of environment geometry and usage.
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    /// Page size in bytes
    pub page_size: usize,
    /// Txnid of the head meta
    pub last_txnid: TxnId,
    /// Geometry lower bound, pages
    pub geo_lower: u64,
    /// Geometry upper bound, pages
    pub geo_upper: u64,
    /// Currently backed size, pages
    pub geo_now: u64,
    /// First unallocated page
    pub next_pgno: u64,
    /// Cumulative retired pages
    pub pages_retired: u64,
    /// Live reader count
    pub readers: usize,
}

/// Builder for opening environments.
pub struct EnvBuilder {
    page_size: usize,
    map_size: usize,
    growth_step: usize,
    shrink_threshold: usize,
    dp_limit: usize,
    flags: EnvFlags,
    autosync_threshold: u64,
    hsr: Option<HsrCallback>,
}

impl EnvBuilder {
    /// Start from the defaults: 4 KiB pages, 1 GiB map, durable
    /// commits.
    pub fn new() -> Self {
        Self {
            page_size: 4096,
            map_size: DEFAULT_MAP_SIZE,
            growth_step: 1 << 20,
            shrink_threshold: 16 << 20,
            dp_limit: DEFAULT_DP_LIMIT,
            flags: EnvFlags::empty(),
            autosync_threshold: 0,
            hsr: None,
        }
    }

    /// Page size for a newly created database (ignored on reopen).
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Geometry upper bound in bytes.
    pub fn map_size(mut self, bytes: usize) -> Self {
        self.map_size = bytes;
        self
    }

    /// File growth step in bytes.
    pub fn growth_step(mut self, bytes: usize) -> Self {
        self.growth_step = bytes;
        self
    }

    /// Tail slack tolerated before commit shrinks the file, bytes.
    pub fn shrink_threshold(mut self, bytes: usize) -> Self {
        self.shrink_threshold = bytes;
        self
    }

    /// Dirty-page budget per write transaction, in pages.
    pub fn dirty_limit(mut self, pages: usize) -> Self {
        self.dp_limit = pages;
        self
    }

    /// Set mode flags.
    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Force a durable commit after this many weakly committed pages.
    pub fn autosync_threshold(mut self, pages: u64) -> Self {
        self.autosync_threshold = pages;
        self
    }

    /// Install the handle-slow-readers callback.
    pub fn handle_slow_readers(mut self, cb: HsrCallback) -> Self {
        self.hsr = Some(cb);
        self
    }

    /// Open or create the environment under `path` (a directory).
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment> {
        let dir = path.as_ref();
        std::fs::create_dir_all(dir)?;
        let canonical = dir.canonicalize()?;
        {
            let mut reg = open_registry().lock();
            if !reg.insert(canonical.clone()) {
                return Err(Error::EnvAlreadyOpen);
            }
        }
        match self.open_inner(dir, &canonical) {
            Ok(env) => Ok(env),
            Err(e) => {
                open_registry().lock().remove(&canonical);
                Err(e)
            }
        }
    }

    fn open_inner(self, dir: &Path, canonical: &Path) -> Result<Environment> {
        let data_path = dir.join(DATA_NAME);
        let existing = probe_meta_header(&data_path)?;
        let is_new = existing.is_none();
        let page_size = existing.map_or(self.page_size, |(ps, _)| ps);
        if !page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
        {
            return Err(Error::InvalidParameter("page size out of range"));
        }

        // The mapping must cover the stored geometry even when this
        // opener asked for a smaller map.
        let stored_upper = existing.map_or(0, |(_, upper)| upper);
        let upper_pages = ((self.map_size / page_size).max(NUM_METAS) as u64).max(stored_upper);
        let lower_pages = NUM_METAS as u64;
        let now_pages = if is_new {
            lower_pages
        } else {
            (std::fs::metadata(&data_path)?.len() / page_size as u64).max(lower_pages)
        };

        let io = PageIo::open(
            &data_path,
            page_size,
            now_pages * page_size as u64,
            upper_pages * page_size as u64,
        )?;
        let bootid = read_bootid();

        if is_new {
            let geo = Geometry {
                lower: lower_pages,
                upper: upper_pages,
                now: lower_pages,
                next: NUM_METAS as u64,
                grow_pv: pages_to_pv((self.growth_step / page_size).max(1) as u64),
                shrink_pv: pages_to_pv((self.shrink_threshold / page_size) as u64),
            };
            for slot in 0..NUM_METAS {
                let m = Meta::new_born(geo, TxnId(slot as u64 + 1), bootid);
                let mut page = vec![0u8; page_size];
                m.encode(&mut page, slot, true);
                io.write_pages(PageId(slot as u64), &page)?;
            }
            io.sync_data()?;
            tracing::debug!(path = %dir.display(), page_size, "created environment");
        }

        let writer_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(WRITER_NAME))
            .map_err(|e| Error::Io(e.to_string()))?;
        let lck = LockFile::open(&dir.join(LOCK_NAME), self.flags.bits())?;
        if self.autosync_threshold > 0 {
            lck.set_autosync_threshold(self.autosync_threshold);
        }

        let inner = Arc::new(EnvInner {
            path: canonical.to_path_buf(),
            flags: self.flags,
            io,
            lck,
            writer_file,
            write_gate: Mutex::new(()),
            fatal: AtomicBool::new(false),
            bootid,
            dp_limit: self.dp_limit,
            hsr: self.hsr,
            dbis: RwLock::new(Vec::new()),
        });

        // Crash recovery: a weak head cannot be trusted when it was
        // written during a different OS boot, or when it references
        // pages past the end of the (possibly truncated) file. Roll
        // every weak slot back to the steady meta.
        let triad = inner.read_triad()?;
        let head = triad.head_meta();
        let truncated = head.geo.next > inner.io.size_in_pages();
        let rollback =
            triad.needs_rollback(bootid) || (!head.is_steady() && truncated && triad.steady.is_some());
        if rollback {
            let steady_slot = triad.steady.expect("rollback implies a steady meta");
            let steady = triad.metas[steady_slot].expect("steady slot is valid");
            tracing::warn!(
                head = triad.head_meta().txnid.0,
                steady = steady.txnid.0,
                "boot id changed; rolling weak metas back to steady"
            );
            for slot in 0..NUM_METAS {
                if slot != steady_slot {
                    inner.write_meta(&steady, slot, true)?;
                }
            }
            inner.io.sync_data()?;
        }

        Ok(Environment { inner })
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the page size and geometry upper bound of an existing database
/// out of the first meta page, before anything is mapped. The page-size
/// shift is stamped in the meta page header. `None` when the file does
/// not exist or is empty.
fn probe_meta_header(path: &Path) -> Result<Option<(usize, u64)>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e.to_string())),
    };
    if file.metadata().map_err(|e| Error::Io(e.to_string()))?.len() < (PAGE_HDR + 24) as u64 {
        return Ok(None);
    }
    let mut hdr = [0u8; PAGE_HDR + 24];
    file.read_exact(&mut hdr).map_err(|e| Error::Io(e.to_string()))?;
    let shift = u16::from_le_bytes([hdr[22], hdr[23]]) as u32;
    if !(8..=16).contains(&shift) {
        return Err(Error::corrupt(PageId(0), "implausible page-size shift in meta header"));
    }
    // geo.upper sits at payload offset 12.
    let upper =
        u32::from_le_bytes([hdr[PAGE_HDR + 12], hdr[PAGE_HDR + 13], hdr[PAGE_HDR + 14], hdr[PAGE_HDR + 15]]);
    Ok(Some((1usize << shift, upper as u64)))
}

/// Identify the current OS boot so recovery can tell whether a weak
/// meta predates a reboot.
fn read_bootid() -> (u64, u64) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(s) = std::fs::read_to_string("/proc/sys/kernel/random/boot_id") {
            let bytes = s.trim().as_bytes();
            let mut fwd = crc32fast::Hasher::new();
            fwd.update(bytes);
            let mut rev = crc32fast::Hasher::new_with_initial(0xFFFF_FFFF);
            rev.update(bytes);
            let a = u64::from(fwd.finalize()) | (u64::from(rev.finalize()) << 32);
            return (a, bytes.len() as u64 ^ a.rotate_left(17));
        }
    }
    // Without a stable boot id, a random one makes recovery
    // conservative: every reopen distrusts weak metas.
    (rand::random(), rand::random())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let env = EnvBuilder::new()
                .map_size(1 << 20)
                .open(dir.path())
                .unwrap();
            let info = env.info().unwrap();
            assert_eq!(info.page_size, 4096);
            assert_eq!(info.last_txnid, TxnId(3));
            assert_eq!(info.next_pgno, NUM_METAS as u64);
        }
        // Second open rediscovers the page size from the file.
        let env = EnvBuilder::new()
            .page_size(8192)
            .map_size(1 << 20)
            .open(dir.path())
            .unwrap();
        assert_eq!(env.info().unwrap().page_size, 4096);
    }

    #[test]
    fn double_open_is_refused() {
        let dir = TempDir::new().unwrap();
        let _env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
        let err = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::EnvAlreadyOpen));
    }

    #[test]
    fn fresh_file_is_three_meta_pages() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
        drop(env);
        let len = std::fs::metadata(dir.path().join(DATA_NAME)).unwrap().len();
        assert_eq!(len, 3 * 4096);
    }

    #[test]
    fn probe_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DATA_NAME);
        std::fs::write(&path, vec![0xA5u8; 64]).unwrap();
        assert!(probe_meta_header(&path).is_err());
    }
}
