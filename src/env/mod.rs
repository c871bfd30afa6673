//! Environment lifecycle: files, mappings, locks and handle registry.

mod lockfile;
mod map;

pub use lockfile::{LockFile, ReaderInfo, LOCK_HEADER_SIZE, READER_SLOT_SIZE};
pub use map::MapManager;

use crate::error::{Result, StoreError};
use crate::meta::{self, Geometry, GeometrySettings, Meta};
use crate::tree::TreeDesc;
use crate::txn::Txn;
use crate::types::{
    DbFlags, EnvFlags, Limits, Pgno, TxnId, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, FIRST_USER_DBI,
    FREE_DBI, MAIN_DBI, NUM_METAS,
};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Data file name inside an environment directory
pub const DATA_NAME: &str = "data.db";

/// Lock file name inside an environment directory
pub const LOCK_NAME: &str = "lock.db";

/// Suffix appended to the data path in `NO_SUBDIR` mode
pub const LOCK_SUFFIX: &str = "-lock";

/// Decides whether a reader that blocks page reclamation gets evicted.
/// Receives the offending slot and the txnid gap it causes; returning
/// `true` ousts the slot.
pub type SlowReaderCallback = Box<dyn Fn(&ReaderInfo, u64) -> bool + Send + Sync>;

/// Builder for environment handles (create with [`Env::options`])
pub struct EnvOptions {
    max_dbs: usize,
    max_readers: usize,
    page_size: usize,
    geometry: Option<GeometrySettings>,
    dirty_limit: usize,
    slow_reader: Option<SlowReaderCallback>,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            page_size: 4096,
            geometry: None,
            dirty_limit: 1 << 16,
            slow_reader: None,
        }
    }
}

impl EnvOptions {
    /// Named trees the environment may have open at once
    pub fn max_dbs(mut self, n: usize) -> Self {
        self.max_dbs = n;
        self
    }

    /// Reader-slot table capacity (fixed at lock-file creation)
    pub fn max_readers(mut self, n: usize) -> Self {
        self.max_readers = n.max(1);
        self
    }

    /// Page size for a newly created database
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// File-size policy
    pub fn geometry(mut self, geometry: GeometrySettings) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Dirty pages a single write transaction may accumulate
    pub fn dirty_limit(mut self, pages: usize) -> Self {
        self.dirty_limit = pages.max(16);
        self
    }

    /// Install the slow-reader policy callback
    pub fn on_slow_reader(
        mut self,
        cb: impl Fn(&ReaderInfo, u64) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.slow_reader = Some(Box::new(cb));
        self
    }

    /// Open or create the environment at `path`
    pub fn open(self, path: impl AsRef<Path>, flags: EnvFlags) -> Result<Env> {
        Env::open_with(self, path.as_ref(), flags)
    }
}

/// In-process writer exclusion: one write transaction at a time.
pub(crate) struct WriterGate {
    busy: Mutex<bool>,
    cv: Condvar,
}

impl WriterGate {
    fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self, try_only: bool) -> Result<()> {
        let mut busy = self.busy.lock();
        while *busy {
            if try_only {
                return Err(StoreError::Busy);
            }
            self.cv.wait(&mut busy);
        }
        *busy = true;
        Ok(())
    }

    pub(crate) fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.cv.notify_one();
    }
}

/// Registry entry for an open tree handle
#[derive(Debug, Clone)]
pub(crate) struct DbiSlot {
    pub name: Option<String>,
    pub flags: DbFlags,
}

/// Tree statistics, as reported by `Txn::stat`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Stat {
    pub page_size: usize,
    pub depth: usize,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub large_pages: u64,
    pub entries: u64,
}

impl Stat {
    pub(crate) fn from_tree(desc: &TreeDesc, page_size: usize) -> Self {
        Self {
            page_size,
            depth: desc.height as usize,
            branch_pages: desc.branch_pages as u64,
            leaf_pages: desc.leaf_pages as u64,
            large_pages: desc.large_pages as u64,
            entries: desc.items,
        }
    }
}

/// Environment facts, as reported by `Env::info`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnvInfo {
    pub page_size: usize,
    pub map_size: usize,
    pub map_version: u32,
    pub recent_txnid: TxnId,
    pub oldest_reader_txnid: TxnId,
    pub last_pgno: u32,
    pub max_readers: usize,
    pub num_readers: usize,
}

/// An open database environment.
///
/// Transactions borrow the environment, so it cannot be dropped while any
/// transaction is live.
pub struct Env {
    pub(crate) flags: EnvFlags,
    pub(crate) limits: Limits,
    pub(crate) file: File,
    pub(crate) map: MapManager,
    pub(crate) lock: LockFile,
    pub(crate) writer: WriterGate,
    pub(crate) dbis: RwLock<Vec<Option<DbiSlot>>>,
    pub(crate) geo: Mutex<Geometry>,
    pub(crate) dirty_limit: usize,
    pub(crate) slow_reader: Option<SlowReaderCallback>,
    pub(crate) txn_refs: AtomicUsize,
    pub(crate) dxb_id: [u8; 16],
    pub(crate) pool: crate::txn::PagePool,
    max_dbs: usize,
    data_path: PathBuf,
}

impl Env {
    /// Start configuring an environment
    pub fn options() -> EnvOptions {
        EnvOptions::default()
    }

    /// Open with default options
    pub fn open(path: impl AsRef<Path>, flags: EnvFlags) -> Result<Env> {
        Env::options().open(path, flags)
    }

    fn open_with(options: EnvOptions, path: &Path, flags: EnvFlags) -> Result<Env> {
        let read_only = flags.contains(EnvFlags::READ_ONLY);
        let (data_path, lock_path) = if flags.contains(EnvFlags::NO_SUBDIR) {
            let mut lock = path.as_os_str().to_owned();
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            if !read_only {
                std::fs::create_dir_all(path)?;
            }
            (path.join(DATA_NAME), path.join(LOCK_NAME))
        };

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&data_path)?;
        let file_len = file.metadata()?.len() as usize;

        let (limits, geometry, recent, dxb_id) = if file_len == 0 {
            if read_only {
                return Err(StoreError::Invalid("no database at this path"));
            }
            let limits = Limits::new(options.page_size);
            let geometry = options
                .geometry
                .unwrap_or_default()
                .resolve(options.page_size)?;
            let meta = Meta::bootstrap(geometry, options.page_size);
            for slot in 0..NUM_METAS {
                let image = meta.encode(Pgno(slot as u32), options.page_size, false);
                file.write_at(image.as_bytes(), (slot * options.page_size) as u64)?;
            }
            file.set_len(geometry.now as u64 * options.page_size as u64)?;
            file.sync_all()?;
            debug!(path = %data_path.display(), page_size = options.page_size, "created database");
            (limits, geometry, meta, meta.dxb_id)
        } else {
            let mut probe = vec![0u8; crate::types::MIN_PAGE_SIZE];
            file.read_exact_at(&mut probe, 0)?;
            let page_size = Meta::probe_page_size(&probe)?;
            let limits = Limits::new(page_size);

            let metas = Self::read_meta_triple(&file, page_size)?;
            let Some((_, recent)) = meta::pick_recent(&metas) else {
                return Err(StoreError::corrupted("no consistent meta page"));
            };
            if read_only {
                // an interrupted rotation needs a writer to clean up
                for slot in 0..NUM_METAS {
                    let mut page = vec![0u8; page_size];
                    file.read_exact_at(&mut page, (slot * page_size) as u64)?;
                    if metas[slot].is_none() && Meta::raw_txnid_a(&page) > recent.txnid {
                        return Err(StoreError::WannaRecovery);
                    }
                }
            }
            let mut geometry = recent.geometry;
            if let Some(requested) = &options.geometry {
                if !read_only {
                    let wanted = requested.resolve(page_size)?;
                    geometry.lower = wanted.lower;
                    geometry.upper = wanted.upper.max(geometry.now);
                    geometry.grow = wanted.grow;
                    geometry.shrink = wanted.shrink;
                }
            }
            if page_size < page_size::get() && file_len % page_size::get() != 0 {
                warn!("data file is not aligned to the host memory page");
            }
            (limits, geometry, recent, recent.dxb_id)
        };

        let map_len = geometry.now as usize * limits.page_size;
        if file.metadata()?.len() < map_len as u64 {
            if read_only {
                return Err(StoreError::corrupted("data file shorter than its geometry"));
            }
            file.set_len(map_len as u64)?;
        }
        let map = MapManager::new(&file, map_len, !read_only)?;

        let env_mode = (flags
            & (EnvFlags::SAFE_NO_SYNC | EnvFlags::NO_META_SYNC | EnvFlags::WRITE_MAP))
            .bits();
        let lock = LockFile::open(&lock_path, options.max_readers, read_only, env_mode)?;
        if flags.contains(EnvFlags::EXCLUSIVE) && !read_only {
            lock.writer_lock(true)?;
        }

        let mut dbis: Vec<Option<DbiSlot>> = vec![None; FIRST_USER_DBI + options.max_dbs];
        dbis[FREE_DBI] = Some(DbiSlot {
            name: None,
            flags: recent.gc.db_flags(),
        });
        dbis[MAIN_DBI] = Some(DbiSlot {
            name: None,
            flags: recent.main.db_flags(),
        });

        Ok(Env {
            flags,
            limits,
            file,
            map,
            lock,
            writer: WriterGate::new(),
            dbis: RwLock::new(dbis),
            geo: Mutex::new(geometry),
            dirty_limit: options.dirty_limit,
            slow_reader: options.slow_reader,
            txn_refs: AtomicUsize::new(0),
            dxb_id,
            pool: crate::txn::PagePool::new(limits.page_size, 256),
            max_dbs: options.max_dbs,
            data_path,
        })
    }

    fn read_meta_triple(file: &File, page_size: usize) -> Result<[Option<Meta>; NUM_METAS]> {
        let mut metas = [None; NUM_METAS];
        for (slot, out) in metas.iter_mut().enumerate() {
            let mut page = vec![0u8; page_size];
            file.read_exact_at(&mut page, (slot * page_size) as u64)?;
            *out = Meta::decode(&page)?;
        }
        Ok(metas)
    }

    /// Decode the current meta triple
    pub(crate) fn metas(&self) -> Result<[Option<Meta>; NUM_METAS]> {
        Self::read_meta_triple(&self.file, self.limits.page_size)
    }

    /// The recent meta: the newest consistent one
    pub(crate) fn recent_meta(&self) -> Result<Meta> {
        meta::pick_recent(&self.metas()?)
            .map(|(_, m)| m)
            .ok_or_else(|| StoreError::corrupted("no consistent meta page"))
    }

    /// Write a freshly committed meta into `slot` with the two-phase
    /// protocol: the body goes out with `txnid_b` zeroed, then the final
    /// write restores it.
    pub(crate) fn write_meta_slot(&self, slot: usize, meta: &Meta, sync_meta: bool) -> Result<()> {
        let ps = self.limits.page_size;
        let off = (slot * ps) as u64;
        let image = meta.encode(Pgno(slot as u32), ps, true);
        self.file.write_at(image.as_bytes(), off)?;
        self.file.write_at(
            &meta.txnid.to_le_bytes(),
            off + crate::meta::META_TXNID_B_OFFSET as u64,
        )?;
        if sync_meta {
            self.file.sync_data()?;
        }
        debug!(slot, txnid = meta.txnid, steady = meta.is_steady(), "meta published");
        Ok(())
    }

    /// Grow the file and remap so that `needed` pages are addressable
    pub(crate) fn grow_for(&self, needed: u32) -> Result<()> {
        let mut geo = self.geo.lock();
        if (needed as usize) * self.limits.page_size <= self.map.len() {
            return Ok(());
        }
        let grown = meta::grown_size(&geo, needed)?;
        let new_len = grown as usize * self.limits.page_size;
        self.file.set_len(new_len as u64).map_err(|err| {
            warn!(?err, "file growth refused by the host");
            StoreError::UnableExtendMapsize
        })?;
        self.map.remap(&self.file, new_len)?;
        geo.now = grown;
        Ok(())
    }

    /// Shrink the file when the committed watermark leaves enough slack
    pub(crate) fn maybe_shrink(&self, next: u32) -> Result<()> {
        let mut geo = self.geo.lock();
        geo.next = next;
        let Some(target) = meta::shrunk_size(&geo) else {
            return Ok(());
        };
        if target >= geo.now {
            return Ok(());
        }
        let new_len = target as usize * self.limits.page_size;
        self.file.set_len(new_len as u64)?;
        self.map.remap(&self.file, new_len)?;
        debug!(from = geo.now, to = target, "shrank data file");
        geo.now = target;
        Ok(())
    }

    /// Force a weak meta to steady with an explicit fsync.
    ///
    /// With `force`, syncs even when the recent meta is already steady.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.flags.contains(EnvFlags::READ_ONLY) {
            return Err(StoreError::Invalid("environment is read-only"));
        }
        self.writer.acquire(false)?;
        let result = (|| {
            let metas = self.metas()?;
            let Some((slot, m)) = meta::pick_recent(&metas) else {
                return Err(StoreError::corrupted("no consistent meta page"));
            };
            if m.is_steady() && !force {
                return Ok(());
            }
            if self.flags.contains(EnvFlags::WRITE_MAP) {
                self.map.flush()?;
            }
            self.file.sync_data()?;
            // the signature flips alone; consistency never wavers
            let off = (slot * self.limits.page_size + crate::meta::META_SIGN_OFFSET) as u64;
            self.file
                .write_at(&crate::types::SIGN_STEADY.to_le_bytes(), off)?;
            self.file.sync_data()?;
            Ok(())
        })();
        self.writer.release();
        result
    }

    /// Write a point-in-time snapshot of the database to a new file.
    ///
    /// All three metas of the copy publish the snapshot txnid.
    pub fn copy(&self, path: impl AsRef<Path>) -> Result<()> {
        let txn = self.begin_read()?;
        let snapshot = txn.snapshot_meta();
        let ps = self.limits.page_size;

        let out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        for slot in 0..NUM_METAS as u32 {
            let image = snapshot.encode(Pgno(slot), ps, false);
            out.write_at(image.as_bytes(), (slot as usize * ps) as u64)?;
        }
        for pgno in NUM_METAS as u32..snapshot.geometry.next {
            let bytes = self.map.page(Pgno(pgno), ps, 1)?;
            out.write_at(bytes, pgno as u64 * ps as u64)?;
        }
        out.set_len(snapshot.geometry.now as u64 * ps as u64)?;
        out.sync_all()?;
        Ok(())
    }

    /// Begin a read transaction pinned to the current recent meta
    pub fn begin_read(&self) -> Result<Txn<'_>> {
        Txn::begin_read(self)
    }

    /// Begin the write transaction, waiting for any current writer
    pub fn begin_write(&self) -> Result<Txn<'_>> {
        Txn::begin_write(self, false)
    }

    /// Begin the write transaction or fail with `Busy`
    pub fn try_begin_write(&self) -> Result<Txn<'_>> {
        Txn::begin_write(self, true)
    }

    /// Rows describing every active reader slot
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.lock.reader_list()
    }

    /// Clear reader slots of dead processes; returns how many were cleared
    pub fn reader_check(&self) -> usize {
        self.lock.reader_check()
    }

    /// Forget a named tree handle
    pub fn close_dbi(&self, dbi: usize) {
        if dbi >= FIRST_USER_DBI {
            self.dbis.write()[dbi] = None;
        }
    }

    pub(crate) fn dbi_slot(&self, dbi: usize) -> Result<DbiSlot> {
        self.dbis
            .read()
            .get(dbi)
            .and_then(|s| s.clone())
            .ok_or(StoreError::BadDbi)
    }

    pub(crate) fn register_dbi(&self, name: &str, flags: DbFlags) -> Result<usize> {
        let mut dbis = self.dbis.write();
        if let Some(existing) = dbis.iter().position(|s| {
            s.as_ref().is_some_and(|s| s.name.as_deref() == Some(name))
        }) {
            return Ok(existing);
        }
        let free = dbis[FIRST_USER_DBI..]
            .iter()
            .position(|s| s.is_none())
            .ok_or(StoreError::BadDbi)?;
        let dbi = FIRST_USER_DBI + free;
        dbis[dbi] = Some(DbiSlot {
            name: Some(name.to_string()),
            flags,
        });
        Ok(dbi)
    }

    /// Environment facts
    pub fn info(&self) -> Result<EnvInfo> {
        let recent = self.recent_meta()?;
        let readers = self.lock.reader_list();
        Ok(EnvInfo {
            page_size: self.limits.page_size,
            map_size: self.map.len(),
            map_version: self.map.version(),
            recent_txnid: recent.txnid,
            oldest_reader_txnid: self.lock.oldest(recent.txnid),
            last_pgno: recent.geometry.next,
            max_readers: self.lock.max_readers(),
            num_readers: readers.len(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.limits.page_size
    }

    pub fn env_flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn max_dbs(&self) -> usize {
        self.max_dbs
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        debug_assert_eq!(self.txn_refs.load(Ordering::Acquire), 0);
        if self.flags.contains(EnvFlags::EXCLUSIVE) && !self.flags.contains(EnvFlags::READ_ONLY) {
            self.lock.writer_unlock();
        }
    }
}
