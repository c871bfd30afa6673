//! Transactions.
//!
//! Reads snapshot the recent meta and publish their txnid in a reader
//! slot; nothing committed later is visible to them. The single write
//! transaction owns a dirty-page map, a bump allocator fed by the GC
//! tree, and the retired-page ledger that becomes the next GC entry at
//! commit.

mod dirty;
pub(crate) mod gc;

pub use dirty::{DirtyPage, DirtyTracker, PagePool};

use crate::cursor::Cursor;
use crate::env::{Env, Stat};
use crate::error::{Result, StoreError};
use crate::meta::Meta;
use crate::page::{PageBuf, PageMut, PAGE_HEADER_SIZE};
use crate::tree::TreeDesc;
use crate::types::{
    Canary, DbFlags, EnvFlags, Pgno, PutFlags, TxnId, FIRST_USER_DBI, FREE_DBI, MAIN_DBI,
    TXNID_RESERVED,
};
use std::cell::{Ref, RefCell, RefMut};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Per-transaction view of one tree
#[derive(Debug, Clone)]
pub(crate) struct TreeState {
    pub desc: TreeDesc,
    pub dirty: bool,
}

/// Saved state for one nested-transaction level
struct NestedFrame {
    trees: Vec<Option<TreeState>>,
    next_pgno: u32,
    free_len: usize,
    retired_len: usize,
    reclaimed: Vec<Pgno>,
    canary: Canary,
    canary_dirty: bool,
    /// Pre-child images of pages the child re-touched, with their prior level
    undo: Vec<(Pgno, PageBuf, u32)>,
}

pub(crate) struct TxnInner {
    txnid: TxnId,
    meta: Meta,
    trees: Vec<Option<TreeState>>,
    slot: Option<usize>,
    reset: bool,
    finished: bool,
    // write-transaction state
    dirty: DirtyTracker,
    free_pages: Vec<Pgno>,
    retired: Vec<Pgno>,
    reclaimed: Vec<Pgno>,
    next_pgno: u32,
    in_gc: bool,
    canary: Canary,
    canary_dirty: bool,
    frames: Vec<NestedFrame>,
}

/// Where a resolved page lives
pub(crate) enum PageData<'a> {
    Map(&'a [u8]),
    Dirty(Ref<'a, [u8]>),
}

impl std::ops::Deref for PageData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageData::Map(bytes) => bytes,
            PageData::Dirty(bytes) => bytes,
        }
    }
}

/// A transaction. Obtained from [`Env::begin_read`] / [`Env::begin_write`].
///
/// Dropping an unfinished transaction aborts it.
pub struct Txn<'env> {
    env: &'env Env,
    write: bool,
    inner: RefCell<TxnInner>,
}

impl<'env> Txn<'env> {
    // --- lifecycle ---------------------------------------------------------

    pub(crate) fn begin_read(env: &'env Env) -> Result<Txn<'env>> {
        let slot = env.lock.claim_slot()?;
        let meta = loop {
            let meta = match env.recent_meta() {
                Ok(m) => m,
                Err(err) => {
                    env.lock.release_slot(slot);
                    return Err(err);
                }
            };
            env.lock
                .bind_slot(slot, meta.txnid, meta.geometry.next, meta.pages_retired);
            // the writer may have rotated between the read and the bind
            match env.recent_meta() {
                Ok(check) if check.txnid == meta.txnid => break meta,
                Ok(_) => continue,
                Err(err) => {
                    env.lock.release_slot(slot);
                    return Err(err);
                }
            }
        };
        // another process may have grown the file past our mapping
        let needed = meta.geometry.now as usize * env.limits.page_size;
        if needed > env.map.len() {
            if let Err(err) = env.map.remap(&env.file, needed) {
                env.lock.release_slot(slot);
                return Err(err);
            }
        }
        env.txn_refs.fetch_add(1, Ordering::AcqRel);
        trace!(txnid = meta.txnid, slot, "read txn began");
        Ok(Txn {
            env,
            write: false,
            inner: RefCell::new(TxnInner::from_meta(meta, env, Some(slot))),
        })
    }

    pub(crate) fn begin_write(env: &'env Env, try_only: bool) -> Result<Txn<'env>> {
        if env.flags.contains(EnvFlags::READ_ONLY) {
            return Err(StoreError::Invalid("environment is read-only"));
        }
        env.writer.acquire(try_only)?;
        if !env.flags.contains(EnvFlags::EXCLUSIVE) {
            if let Err(err) = env.lock.writer_lock(try_only) {
                env.writer.release();
                return Err(err);
            }
        }
        let meta = match env.recent_meta() {
            Ok(m) => m,
            Err(err) => {
                Self::release_write_locks(env);
                return Err(err);
            }
        };
        let txnid = meta.txnid + 1;
        if txnid == TXNID_RESERVED {
            Self::release_write_locks(env);
            return Err(StoreError::corrupted("transaction id space exhausted"));
        }
        env.txn_refs.fetch_add(1, Ordering::AcqRel);
        debug!(txnid, "write txn began");
        let mut inner = TxnInner::from_meta(meta, env, None);
        inner.txnid = txnid;
        let txn = Txn {
            env,
            write: true,
            inner: RefCell::new(inner),
        };
        // pull one reclaimable GC entry up front while no operation is open
        gc::refill(&txn)?;
        Ok(txn)
    }

    fn release_write_locks(env: &Env) {
        if !env.flags.contains(EnvFlags::EXCLUSIVE) {
            env.lock.writer_unlock();
        }
        env.writer.release();
    }

    /// The transaction's id: the pinned snapshot for reads, the id being
    /// produced for writes
    pub fn id(&self) -> TxnId {
        self.inner.borrow().txnid
    }

    pub fn is_read_only(&self) -> bool {
        !self.write
    }

    pub(crate) fn env(&self) -> &'env Env {
        self.env
    }

    pub(crate) fn snapshot_meta(&self) -> Meta {
        self.inner.borrow().meta
    }

    /// Commit. For a read transaction this just releases the snapshot.
    pub fn commit(mut self) -> Result<()> {
        if !self.write {
            self.finish();
            return Ok(());
        }
        let result = self.commit_write();
        self.finish();
        result
    }

    /// Abort, discarding all changes
    pub fn abort(mut self) {
        self.finish();
    }

    /// Release the read snapshot but keep the reader slot for `renew`
    pub fn reset(&mut self) -> Result<()> {
        if self.write {
            return Err(StoreError::BadTxn);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.reset || inner.finished {
            return Err(StoreError::BadTxn);
        }
        if let Some(slot) = inner.slot {
            self.env.lock.park_slot(slot);
        }
        inner.reset = true;
        Ok(())
    }

    /// Re-pin a reset read transaction to the current recent meta
    pub fn renew(&mut self) -> Result<()> {
        if self.write {
            return Err(StoreError::BadTxn);
        }
        let mut inner = self.inner.borrow_mut();
        if !inner.reset || inner.finished {
            return Err(StoreError::BadTxn);
        }
        let slot = inner.slot.ok_or(StoreError::BadReaderSlot)?;
        if self.env.lock.slot_txnid(slot) != TXNID_RESERVED {
            return Err(StoreError::Ousted);
        }
        let meta = loop {
            let meta = self.env.recent_meta()?;
            self.env
                .lock
                .bind_slot(slot, meta.txnid, meta.geometry.next, meta.pages_retired);
            match self.env.recent_meta() {
                Ok(check) if check.txnid == meta.txnid => break meta,
                Ok(_) => continue,
                Err(err) => return Err(err),
            }
        };
        *inner = TxnInner::from_meta(meta, self.env, Some(slot));
        Ok(())
    }

    fn finish(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if inner.finished {
            return;
        }
        inner.finished = true;
        inner.dirty.drain_into(&self.env.pool);
        if let Some(slot) = inner.slot.take() {
            self.env.lock.release_slot(slot);
        }
        if self.write {
            Self::release_write_locks(self.env);
        }
        self.env.txn_refs.fetch_sub(1, Ordering::AcqRel);
    }

    // --- validation --------------------------------------------------------

    pub(crate) fn require_write(&self) -> Result<()> {
        if !self.write {
            return Err(StoreError::BadTxn);
        }
        let inner = self.inner.borrow();
        if inner.finished {
            return Err(StoreError::BadTxn);
        }
        Ok(())
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        let inner = self.inner.borrow();
        if inner.finished || inner.reset {
            return Err(StoreError::BadTxn);
        }
        if let (false, Some(slot)) = (self.write, inner.slot) {
            self.env.lock.validate_slot(slot, inner.txnid)?;
        }
        Ok(())
    }

    // --- tree registry -----------------------------------------------------

    pub(crate) fn tree(&self, dbi: usize) -> Result<TreeDesc> {
        let inner = self.inner.borrow();
        inner
            .trees
            .get(dbi)
            .and_then(|t| t.as_ref())
            .map(|t| t.desc)
            .ok_or(StoreError::BadDbi)
    }

    pub(crate) fn set_tree(&self, dbi: usize, desc: TreeDesc) {
        let mut inner = self.inner.borrow_mut();
        let txnid = inner.txnid;
        if let Some(Some(state)) = inner.trees.get_mut(dbi) {
            state.desc = desc;
            state.desc.mod_txnid = txnid;
            state.dirty = true;
        }
    }

    /// Open a tree handle. `None` names the main tree; named trees are
    /// looked up in the main tree's directory and created on demand for a
    /// write transaction asked to `CREATE`.
    pub fn open_dbi(&self, name: Option<&str>, flags: DbFlags) -> Result<usize> {
        self.check_active()?;
        let Some(name) = name else {
            let main = self.tree(MAIN_DBI)?;
            check_flags_compatible(flags, main.db_flags())?;
            return Ok(MAIN_DBI);
        };

        // a handle someone already opened?
        {
            let dbis = self.env.dbis.read();
            if let Some(dbi) = dbis.iter().position(|s| {
                s.as_ref().is_some_and(|s| s.name.as_deref() == Some(name))
            }) {
                let slot_flags = dbis[dbi].as_ref().unwrap().flags;
                check_flags_compatible(flags, slot_flags)?;
                drop(dbis);
                self.load_tree_state(dbi, name, slot_flags)?;
                return Ok(dbi);
            }
        }

        // the on-disk directory
        let record = {
            let mut cursor = Cursor::new(self, MAIN_DBI)?;
            cursor.tree_record(name.as_bytes())?
        };
        match record {
            Some(desc) => {
                check_flags_compatible(flags, desc.db_flags())?;
                let dbi = self.env.register_dbi(name, desc.db_flags())?;
                self.install_tree_state(dbi, desc);
                Ok(dbi)
            }
            None if flags.contains(DbFlags::CREATE) => {
                self.require_write()?;
                let desc = TreeDesc::empty(flags);
                let dbi = self.env.register_dbi(name, flags & !DbFlags::CREATE)?;
                self.install_tree_state(dbi, desc);
                self.set_tree(dbi, desc);
                debug!(name, dbi, "created named tree");
                Ok(dbi)
            }
            None => Err(StoreError::KeyNotFound),
        }
    }

    fn load_tree_state(&self, dbi: usize, name: &str, flags: DbFlags) -> Result<()> {
        if self.inner.borrow().trees.get(dbi).is_some_and(|t| t.is_some()) {
            return Ok(());
        }
        let record = {
            let mut cursor = Cursor::new(self, MAIN_DBI)?;
            cursor.tree_record(name.as_bytes())?
        };
        let desc = match record {
            Some(desc) => desc,
            // registered by a writer whose record this snapshot predates
            None => TreeDesc::empty(flags),
        };
        self.install_tree_state(dbi, desc);
        Ok(())
    }

    /// Make sure this transaction carries a view of `dbi`, loading its
    /// record when the handle was opened by an earlier transaction
    pub(crate) fn materialize_tree(&self, dbi: usize) -> Result<()> {
        if dbi == FREE_DBI || dbi == MAIN_DBI {
            return Ok(());
        }
        if self.inner.borrow().trees.get(dbi).is_some_and(|t| t.is_some()) {
            return Ok(());
        }
        let slot = self.env.dbi_slot(dbi)?;
        let name = slot.name.ok_or(StoreError::BadDbi)?;
        self.load_tree_state(dbi, &name, slot.flags)
    }

    fn install_tree_state(&self, dbi: usize, desc: TreeDesc) {
        let mut inner = self.inner.borrow_mut();
        if inner.trees.len() <= dbi {
            inner.trees.resize_with(dbi + 1, || None);
        }
        if inner.trees[dbi].is_none() {
            inner.trees[dbi] = Some(TreeState { desc, dirty: false });
        }
    }

    /// Empty a tree, or with `delete` remove it from the directory and
    /// close its handle
    pub fn drop_dbi(&self, dbi: usize, delete: bool) -> Result<()> {
        self.require_write()?;
        if dbi == FREE_DBI || (dbi == MAIN_DBI && delete) {
            return Err(StoreError::Incompatible("cannot drop this tree"));
        }
        let desc = self.tree(dbi)?;
        if !desc.is_empty() {
            let mut cursor = Cursor::new(self, dbi)?;
            cursor.free_whole_tree()?;
        }
        let cleared = TreeDesc::empty(desc.db_flags());
        self.set_tree(dbi, cleared);
        if delete {
            let name = self
                .env
                .dbi_slot(dbi)?
                .name
                .ok_or(StoreError::BadDbi)?;
            let mut cursor = Cursor::new(self, MAIN_DBI)?;
            cursor.del_tree_record(name.as_bytes())?;
            let mut inner = self.inner.borrow_mut();
            inner.trees[dbi] = None;
            drop(inner);
            self.env.close_dbi(dbi);
        }
        Ok(())
    }

    // --- data plane --------------------------------------------------------

    /// Look up a key
    pub fn get(&self, dbi: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;
        let mut cursor = Cursor::new(self, dbi)?;
        cursor.set_key(key)
    }

    /// Store a key/value pair
    pub fn put(&self, dbi: usize, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        self.require_write()?;
        let mut cursor = Cursor::new(self, dbi)?;
        cursor.put(key, value, flags)
    }

    /// Store a key with a zeroed value of `len` bytes and hand the value
    /// bytes back for the caller to fill before the next operation
    pub fn put_reserve(
        &self,
        dbi: usize,
        key: &[u8],
        len: usize,
        flags: PutFlags,
    ) -> Result<ReservedValue<'_>> {
        self.require_write()?;
        let mut cursor = Cursor::new(self, dbi)?;
        let location = cursor
            .put_located(key, &vec![0u8; len], flags | PutFlags::RESERVE)?
            .ok_or(StoreError::Invalid("reserve without a location"))?;
        let slice = RefMut::map(self.inner.borrow_mut(), |inner| {
            let buf = inner
                .dirty
                .get_mut(location.pgno)
                .expect("reserved page is dirty");
            &mut buf.buf.as_bytes_mut()[location.offset..location.offset + len]
        });
        Ok(ReservedValue { slice })
    }

    /// Store several contiguous fixed-size duplicate values in one call;
    /// returns how many were stored
    pub fn put_multiple(
        &self,
        dbi: usize,
        key: &[u8],
        stride: usize,
        data: &[u8],
        flags: PutFlags,
    ) -> Result<usize> {
        self.require_write()?;
        self.materialize_tree(dbi)?;
        let desc = self.tree(dbi)?;
        if !desc.db_flags().contains(DbFlags::DUP_FIXED) || stride == 0 {
            return Err(StoreError::Incompatible("multiple-put needs a dupfixed tree"));
        }
        if data.len() % stride != 0 {
            return Err(StoreError::bad_val_size(data.len(), stride));
        }
        let mut cursor = Cursor::new(self, dbi)?;
        let mut stored = 0;
        for chunk in data.chunks_exact(stride) {
            match cursor.put(key, chunk, flags & !PutFlags::MULTIPLE) {
                Ok(()) => stored += 1,
                Err(StoreError::KeyExists) if !flags.contains(PutFlags::NO_DUP_DATA) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(stored)
    }

    /// Delete a key, or with `value` one specific duplicate.
    /// Returns whether anything was removed.
    pub fn del(&self, dbi: usize, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.require_write()?;
        self.materialize_tree(dbi)?;
        let dupsort = self.tree(dbi)?.db_flags().contains(DbFlags::DUP_SORT);
        let mut cursor = Cursor::new(self, dbi)?;
        match value.filter(|_| dupsort) {
            Some(value) => {
                if cursor.get_both(key, value)?.is_none() {
                    return Ok(false);
                }
                cursor.del_current(false)?;
            }
            None => {
                if cursor.set_key(key)?.is_none() {
                    return Ok(false);
                }
                cursor.del_current(true)?;
            }
        }
        Ok(true)
    }

    /// Open a cursor over a tree
    pub fn cursor(&self, dbi: usize) -> Result<Cursor<'_, 'env>> {
        self.check_active()?;
        Cursor::new(self, dbi)
    }

    /// Tree statistics
    pub fn stat(&self, dbi: usize) -> Result<Stat> {
        self.check_active()?;
        self.materialize_tree(dbi)?;
        Ok(Stat::from_tree(&self.tree(dbi)?, self.env.limits.page_size))
    }

    /// Read the tree's persistent sequence, advancing it by `increment`
    pub fn sequence(&self, dbi: usize, increment: u64) -> Result<u64> {
        self.materialize_tree(dbi)?;
        let mut desc = self.tree(dbi)?;
        let current = desc.sequence;
        if increment > 0 {
            self.require_write()?;
            desc.sequence = current
                .checked_add(increment)
                .ok_or(StoreError::Invalid("sequence overflow"))?;
            self.set_tree(dbi, desc);
        }
        Ok(current)
    }

    /// The canary quad of this snapshot
    pub fn canary(&self) -> Canary {
        self.inner.borrow().canary
    }

    /// Update the canary; `v` is stamped with the committing txnid
    pub fn put_canary(&self, canary: &Canary) -> Result<()> {
        self.require_write()?;
        let mut inner = self.inner.borrow_mut();
        inner.canary.x = canary.x;
        inner.canary.y = canary.y;
        inner.canary.z = canary.z;
        inner.canary_dirty = true;
        Ok(())
    }

    // --- nested transactions -----------------------------------------------

    /// Begin a nested transaction. Its changes become part of this
    /// transaction on `commit` and vanish on `abort`/drop; either way the
    /// parent continues.
    pub fn nested(&self) -> Result<NestedTxn<'_, 'env>> {
        self.require_write()?;
        let mut inner = self.inner.borrow_mut();
        let frame = NestedFrame {
            trees: inner.trees.clone(),
            next_pgno: inner.next_pgno,
            free_len: inner.free_pages.len(),
            retired_len: inner.retired.len(),
            reclaimed: inner.reclaimed.clone(),
            canary: inner.canary,
            canary_dirty: inner.canary_dirty,
            undo: Vec::new(),
        };
        inner.frames.push(frame);
        let depth = inner.frames.len() as u32;
        trace!(depth, "nested txn began");
        Ok(NestedTxn {
            txn: self,
            depth,
            done: false,
        })
    }

    fn commit_nested_frame(&self, depth: u32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.frames.len() as u32 != depth {
            return Err(StoreError::BadTxn);
        }
        inner.frames.pop();
        let parent_level = depth - 1;
        for pgno in inner.dirty.sorted_pgnos() {
            if let Some(page) = inner.dirty.get_mut(pgno) {
                if page.level >= depth {
                    page.level = parent_level;
                }
            }
        }
        Ok(())
    }

    fn abort_nested_frame(&self, depth: u32) {
        let mut inner = self.inner.borrow_mut();
        if inner.frames.len() as u32 != depth {
            return;
        }
        let frame = inner.frames.pop().unwrap();
        // drop pages first dirtied inside the child
        for pgno in inner.dirty.sorted_pgnos() {
            if inner.dirty.get(pgno).is_some_and(|p| p.level >= depth) {
                if let Some(page) = inner.dirty.remove(pgno) {
                    self.env.pool.put(page.buf);
                }
            }
        }
        // restore images the child overwrote
        for (pgno, buf, level) in frame.undo {
            inner.dirty.insert(pgno, buf, level);
        }
        inner.trees = frame.trees;
        inner.next_pgno = frame.next_pgno;
        inner.free_pages.truncate(frame.free_len);
        inner.retired.truncate(frame.retired_len);
        inner.reclaimed = frame.reclaimed;
        inner.canary = frame.canary;
        inner.canary_dirty = frame.canary_dirty;
    }

    // --- page access (crate-internal) --------------------------------------

    /// Resolve one page, preferring this transaction's dirty copy
    pub(crate) fn page(&self, pgno: Pgno) -> Result<PageData<'_>> {
        if self.write && self.inner.borrow().dirty.contains(pgno) {
            let bytes = Ref::map(self.inner.borrow(), |inner| {
                inner.dirty.get(pgno).unwrap().buf.as_bytes()
            });
            return Ok(PageData::Dirty(bytes));
        }
        let ps = self.env.limits.page_size;
        Ok(PageData::Map(self.env.map.page(pgno, ps, 1)?))
    }

    /// Resolve an overflow chain of `npages`
    pub(crate) fn page_multi(&self, pgno: Pgno, npages: usize) -> Result<PageData<'_>> {
        if self.write && self.inner.borrow().dirty.contains(pgno) {
            let bytes = Ref::map(self.inner.borrow(), |inner| {
                inner.dirty.get(pgno).unwrap().buf.as_bytes()
            });
            return Ok(PageData::Dirty(bytes));
        }
        let ps = self.env.limits.page_size;
        Ok(PageData::Map(self.env.map.page(pgno, ps, npages)?))
    }

    pub(crate) fn is_dirty(&self, pgno: Pgno) -> bool {
        self.write && self.inner.borrow().dirty.contains(pgno)
    }

    /// Mutate a dirty page in place
    pub(crate) fn with_dirty<R>(
        &self,
        pgno: Pgno,
        f: impl FnOnce(&mut PageMut<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.borrow_mut();
        let depth = inner.frames.len() as u32;
        let undo = {
            let page = inner
                .dirty
                .get_mut(pgno)
                .ok_or_else(|| StoreError::corrupted("page is not owned by this txn"))?;
            if page.level < depth {
                let prior = (pgno, page.buf.clone(), page.level);
                page.level = depth;
                Some(prior)
            } else {
                None
            }
        };
        if let Some(prior) = undo {
            inner.frames.last_mut().unwrap().undo.push(prior);
        }
        let page = inner.dirty.get_mut(pgno).unwrap();
        let mut page = PageMut::new(page.buf.as_bytes_mut())?;
        f(&mut page)
    }

    /// Allocate `npages` zeroed pages; the result is dirty and owned by
    /// this transaction
    pub(crate) fn alloc_page(&self, npages: usize) -> Result<Pgno> {
        debug_assert!(self.write);
        // top up from the GC tree outside of any open page operation
        if npages == 1 && !self.in_gc() {
            let need_refill = {
                let inner = self.inner.borrow();
                inner.free_pages.is_empty() && inner.reclaimed.is_empty()
            };
            if need_refill {
                gc::refill(self)?;
            }
        }

        let mut inner = self.inner.borrow_mut();
        if inner.dirty.len() >= self.env.dirty_limit {
            return Err(StoreError::TxnFull);
        }
        let ps = self.env.limits.page_size;
        let depth = inner.frames.len() as u32;

        if npages == 1 && !inner.in_gc {
            let reused = inner.free_pages.pop().or_else(|| inner.reclaimed.pop());
            if let Some(pgno) = reused {
                let buf = self.env.pool.get(ps);
                inner.dirty.insert(pgno, buf, depth);
                return Ok(pgno);
            }
        }

        let pgno = Pgno(inner.next_pgno);
        let end = inner.next_pgno as u64 + npages as u64;
        if end > u32::MAX as u64 - 1 {
            return Err(StoreError::MapFull);
        }
        if end as usize * ps > self.env.map.len() {
            drop(inner);
            self.env.grow_for(end as u32)?;
            inner = self.inner.borrow_mut();
        }
        inner.next_pgno += npages as u32;
        let buf = self.env.pool.get(npages * ps);
        inner.dirty.insert(pgno, buf, depth);
        Ok(pgno)
    }

    /// Take ownership of a snapshot page at its existing page number,
    /// without retiring it. Only the same-length overflow-chain rewrite
    /// uses this; the old bytes are overwritten in place at commit.
    pub(crate) fn adopt_page_in_place(&self, pgno: Pgno, npages: usize) -> Result<()> {
        if self.is_dirty(pgno) {
            return Ok(());
        }
        let ps = self.env.limits.page_size;
        let src = self.env.map.page(pgno, ps, npages)?;
        let mut inner = self.inner.borrow_mut();
        if inner.dirty.len() >= self.env.dirty_limit {
            return Err(StoreError::TxnFull);
        }
        let depth = inner.frames.len() as u32;
        let mut buf = self.env.pool.get(npages * ps);
        buf.as_bytes_mut().copy_from_slice(src);
        buf.as_bytes_mut()[0..8].copy_from_slice(&inner.txnid.to_le_bytes());
        inner.dirty.insert(pgno, buf, depth);
        inner.dirty.get_mut(pgno).unwrap().adopted = true;
        Ok(())
    }

    /// Copy-on-write: make `pgno` privately owned, returning the page
    /// number of the writable copy (unchanged when already owned)
    pub(crate) fn cow_page(&self, pgno: Pgno) -> Result<Pgno> {
        debug_assert!(self.write);
        if self.is_dirty(pgno) {
            return Ok(pgno);
        }
        let ps = self.env.limits.page_size;
        let src = self.env.map.page(pgno, ps, 1)?;
        let new_pgno = self.alloc_page(1)?;
        {
            let mut inner = self.inner.borrow_mut();
            let txnid = inner.txnid;
            let page = inner.dirty.get_mut(new_pgno).unwrap();
            page.buf.as_bytes_mut().copy_from_slice(src);
            let mut pm = PageMut::new(page.buf.as_bytes_mut())?;
            pm.set_pgno(new_pgno);
            pm.set_txnid(txnid);
            inner.retired.push(pgno);
        }
        trace!(old = %pgno, new = %new_pgno, "page copied on write");
        Ok(new_pgno)
    }

    /// Release pages. Pages this transaction allocated go straight back
    /// to its free list; snapshot pages join the retired ledger.
    pub(crate) fn free_page(&self, pgno: Pgno, npages: usize) {
        debug_assert!(self.write);
        let mut inner = self.inner.borrow_mut();
        if let Some(page) = inner.dirty.remove(pgno) {
            let loose = !page.adopted;
            self.env.pool.put(page.buf);
            for i in 0..npages as u32 {
                if loose {
                    inner.free_pages.push(Pgno(pgno.value() + i));
                } else {
                    inner.retired.push(Pgno(pgno.value() + i));
                }
            }
        } else {
            for i in 0..npages as u32 {
                inner.retired.push(Pgno(pgno.value() + i));
            }
        }
    }

    // --- gc plumbing -------------------------------------------------------

    pub(crate) fn in_gc(&self) -> bool {
        self.inner.borrow().in_gc
    }

    pub(crate) fn set_in_gc(&self, value: bool) {
        self.inner.borrow_mut().in_gc = value;
    }

    pub(crate) fn stash_reclaimed(&self, pages: Vec<Pgno>) {
        self.inner.borrow_mut().reclaimed.extend(pages);
    }

    /// Everything that must be recorded in the GC tree at commit
    pub(crate) fn pending_garbage(&self) -> Vec<Pgno> {
        let inner = self.inner.borrow();
        let mut pending =
            Vec::with_capacity(inner.retired.len() + inner.free_pages.len() + inner.reclaimed.len());
        pending.extend_from_slice(&inner.retired);
        pending.extend_from_slice(&inner.free_pages);
        pending.extend_from_slice(&inner.reclaimed);
        pending
    }

    // --- commit ------------------------------------------------------------

    fn commit_write(&mut self) -> Result<()> {
        self.require_write()?;
        {
            let inner = self.inner.borrow();
            if !inner.frames.is_empty() {
                return Err(StoreError::BadTxn);
            }
            let clean = inner.dirty.is_empty()
                && !inner.canary_dirty
                && inner.trees.iter().flatten().all(|t| !t.dirty);
            if clean {
                return Ok(());
            }
        }

        // write back the descriptors of dirty named trees
        self.flush_tree_records()?;

        // record this transaction's garbage
        gc::update(self)?;

        let inner = self.inner.borrow();
        let txnid = inner.txnid;
        let ps = self.env.limits.page_size;

        // flush dirty pages in page order
        let write_map = self.env.flags.contains(EnvFlags::WRITE_MAP);
        for pgno in inner.dirty.sorted_pgnos() {
            let page = inner.dirty.get(pgno).unwrap();
            let offset = pgno.file_offset(ps);
            if write_map {
                self.env.map.write_into(offset as usize, page.buf.as_bytes())?;
            } else {
                use std::os::unix::fs::FileExt;
                self.env.file.write_at(page.buf.as_bytes(), offset)?;
            }
        }

        let sync_data = !self.env.flags.contains(EnvFlags::SAFE_NO_SYNC);
        let sync_meta = sync_data && !self.env.flags.contains(EnvFlags::NO_META_SYNC);
        if sync_data {
            if write_map {
                self.env.map.flush()?;
            } else {
                self.env.file.sync_data()?;
            }
        }

        // shrink before composing the meta so the published geometry
        // matches the file
        let next = inner.next_pgno;
        drop(inner);
        self.env.maybe_shrink(next)?;
        let inner = self.inner.borrow();

        // compose and publish the new meta
        let mut meta = inner.meta;
        meta.txnid = txnid;
        meta.sign = Meta::sign_for(sync_data && sync_meta);
        {
            let geo = self.env.geo.lock();
            meta.geometry = *geo;
        }
        meta.geometry.next = inner.next_pgno;
        meta.gc = inner.trees[FREE_DBI].as_ref().unwrap().desc;
        meta.gc.dupfix_size = ps as u32;
        meta.main = inner.trees[MAIN_DBI].as_ref().unwrap().desc;
        meta.canary = inner.canary;
        if inner.canary_dirty {
            meta.canary.v = txnid;
        }
        meta.pages_retired = inner.meta.pages_retired + inner.retired.len() as u64;
        meta.boot_id = crate::meta::process_boot_id();
        meta.dxb_id = self.env.dxb_id;

        let target = crate::meta::pick_target(&self.env.metas()?);
        self.env.write_meta_slot(target, &meta, sync_meta)?;
        debug!(txnid, "write txn committed");
        Ok(())
    }

    fn flush_tree_records(&self) -> Result<()> {
        let dirty_named: Vec<(usize, TreeDesc)> = {
            let inner = self.inner.borrow();
            inner
                .trees
                .iter()
                .enumerate()
                .skip(FIRST_USER_DBI)
                .filter_map(|(dbi, t)| t.as_ref().filter(|t| t.dirty).map(|t| (dbi, t.desc)))
                .collect()
        };
        for (dbi, mut desc) in dirty_named {
            let name = self
                .env
                .dbi_slot(dbi)?
                .name
                .ok_or(StoreError::BadDbi)?;
            desc.mod_txnid = self.inner.borrow().txnid;
            let mut cursor = Cursor::new(self, MAIN_DBI)?;
            cursor.put_tree_record(name.as_bytes(), &desc)?;
        }
        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl TxnInner {
    fn from_meta(meta: Meta, env: &Env, slot: Option<usize>) -> Self {
        let mut trees: Vec<Option<TreeState>> = vec![None; env.dbis.read().len()];
        trees[FREE_DBI] = Some(TreeState {
            desc: meta.gc,
            dirty: false,
        });
        trees[MAIN_DBI] = Some(TreeState {
            desc: meta.main,
            dirty: false,
        });
        Self {
            txnid: meta.txnid,
            meta,
            trees,
            slot,
            reset: false,
            finished: false,
            dirty: DirtyTracker::new(),
            free_pages: Vec::new(),
            retired: Vec::new(),
            reclaimed: Vec::new(),
            next_pgno: meta.geometry.next,
            in_gc: false,
            canary: meta.canary,
            canary_dirty: false,
            frames: Vec::new(),
        }
    }
}

fn check_flags_compatible(requested: DbFlags, stored: DbFlags) -> Result<()> {
    let mask = DbFlags::from_bits_truncate(0xFFFF);
    let requested = requested & mask;
    if !requested.is_empty() && requested != (stored & mask) {
        return Err(StoreError::Incompatible("tree flags differ from on-disk"));
    }
    Ok(())
}

/// A nested transaction; dereferences to the parent so all data-plane
/// calls work unchanged. Dropping without `commit` aborts it.
pub struct NestedTxn<'p, 'env> {
    txn: &'p Txn<'env>,
    depth: u32,
    done: bool,
}

impl<'env> std::ops::Deref for NestedTxn<'_, 'env> {
    type Target = Txn<'env>;

    fn deref(&self) -> &Txn<'env> {
        self.txn
    }
}

impl NestedTxn<'_, '_> {
    /// Fold this level's changes into the parent
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.txn.commit_nested_frame(self.depth)
    }

    /// Discard this level's changes
    pub fn abort(mut self) {
        self.done = true;
        self.txn.abort_nested_frame(self.depth);
    }
}

impl Drop for NestedTxn<'_, '_> {
    fn drop(&mut self) {
        if !self.done {
            self.txn.abort_nested_frame(self.depth);
        }
    }
}

/// Writable view of a value reserved by [`Txn::put_reserve`]; fill it
/// before the next store operation
pub struct ReservedValue<'a> {
    slice: RefMut<'a, [u8]>,
}

impl std::ops::Deref for ReservedValue<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.slice
    }
}

impl std::ops::DerefMut for ReservedValue<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.slice
    }
}

/// Where a just-written value landed inside the dirty set
pub(crate) struct ValueLocation {
    pub pgno: Pgno,
    /// Byte offset of the value inside the page (or chain) buffer
    pub offset: usize,
}

/// Offset of the payload inside an overflow chain buffer
pub(crate) const LARGE_PAYLOAD_OFFSET: usize = PAGE_HEADER_SIZE;
