//! The lock file: cross-process writer lock and reader-slot table.
//!
//! A 256-byte header is followed by an array of 32-byte reader slots.
//! Slots are claimed lock-free: a reader CASes `txnid` from 0 to the
//! reservation sentinel, fills in its identity, then stores its snapshot
//! txnid. The writer scans the table to learn the oldest snapshot still
//! in use. All shared fields are touched only through atomics.
//!
//! A read-only environment that finds no usable lock file falls back to a
//! process-private table: no cross-process visibility, but reads work.

use crate::error::{Result, StoreError};
use crate::types::{TxnId, LOCK_MAGIC, MAGIC, TXNID_RESERVED};
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Size of the lock-file header
pub const LOCK_HEADER_SIZE: usize = 256;

/// Size of one reader slot
pub const READER_SLOT_SIZE: usize = 32;

// header offsets
const OFF_MAGIC: usize = 0;
const OFF_OS_FORMAT: usize = 8;
const OFF_ENV_MODE: usize = 12;
const OFF_AUTOSYNC_THRESHOLD: usize = 16;
const OFF_AUTOSYNC_PERIOD: usize = 24;
const OFF_MLOCK: usize = 32; // two u32 counters
const OFF_CACHED_OLDEST: usize = 64;
const OFF_UNSYNCED_VOLUME: usize = 72;
const OFF_NUM_READERS: usize = 128;
const OFF_REFRESH_FLAG: usize = 132;

// slot-relative offsets
const SLOT_TXNID: usize = 0;
const SLOT_TID: usize = 8;
const SLOT_PID: usize = 16;
const SLOT_PAGES_USED: usize = 20;
const SLOT_PAGES_RETIRED: usize = 24;

/// Lock-layout revision for this OS family
const OS_FORMAT: u32 = 1;

/// One row of [`LockFile::reader_list`]
#[derive(Debug, Clone, Copy)]
pub struct ReaderInfo {
    pub slot: usize,
    pub pid: u32,
    pub tid: u64,
    pub txnid: TxnId,
    pub pages_used: u32,
    pub pages_retired: u64,
}

enum Backing {
    /// Shared mapping over the lock file
    Shared { map: MmapRaw, file: File },
    /// Process-private fallback for read-only environments
    Private { mem: Box<[u64]> },
}

/// The reader table and writer lock.
pub struct LockFile {
    backing: Backing,
    max_readers: usize,
    /// Slot indices this process released, reused LIFO
    free_slots: Mutex<Vec<usize>>,
}

impl LockFile {
    /// Open or create the lock file.
    ///
    /// `env_mode` records the durability-relevant open flags so other
    /// processes can detect a mode clash.
    pub fn open(path: &Path, max_readers: usize, read_only: bool, env_mode: u32) -> Result<Self> {
        let opened = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path);

        let file = match opened {
            Ok(f) => f,
            Err(err) if read_only => {
                warn!(?err, "lock file unusable, reads fall back to a private reader table");
                return Ok(Self::private(max_readers));
            }
            Err(err) => return Err(err.into()),
        };

        let wanted = LOCK_HEADER_SIZE + max_readers * READER_SLOT_SIZE;
        let len = file.metadata()?.len() as usize;

        if len == 0 {
            if read_only {
                return Ok(Self::private(max_readers));
            }
            file.set_len(wanted as u64)?;
            let map = MmapOptions::new().len(wanted).map_raw(&file)?;
            let lock = Self {
                backing: Backing::Shared { map, file },
                max_readers,
                free_slots: Mutex::new(Vec::new()),
            };
            lock.init_header(env_mode);
            debug!(max_readers, "created lock file");
            return Ok(lock);
        }

        if len < LOCK_HEADER_SIZE + READER_SLOT_SIZE {
            if read_only {
                return Ok(Self::private(max_readers));
            }
            return Err(StoreError::Invalid("lock file too small"));
        }

        let slots = (len - LOCK_HEADER_SIZE) / READER_SLOT_SIZE;
        let map_len = LOCK_HEADER_SIZE + slots * READER_SLOT_SIZE;
        let map = if read_only {
            // slots must stay writable even for read-only environments
            match MmapOptions::new().len(map_len).map_raw(&file) {
                Ok(m) => m,
                Err(_) => return Ok(Self::private(max_readers)),
            }
        } else {
            MmapOptions::new().len(map_len).map_raw(&file)?
        };

        let lock = Self {
            backing: Backing::Shared { map, file },
            max_readers: slots,
            free_slots: Mutex::new(Vec::new()),
        };
        lock.validate_header()?;
        Ok(lock)
    }

    fn private(max_readers: usize) -> Self {
        let words = (LOCK_HEADER_SIZE + max_readers * READER_SLOT_SIZE) / 8;
        let lock = Self {
            backing: Backing::Private {
                mem: vec![0u64; words].into_boxed_slice(),
            },
            max_readers,
            free_slots: Mutex::new(Vec::new()),
        };
        lock.init_header(0);
        lock
    }

    pub fn is_private(&self) -> bool {
        matches!(self.backing, Backing::Private { .. })
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    fn base(&self) -> *mut u8 {
        match &self.backing {
            Backing::Shared { map, .. } => map.as_mut_ptr(),
            Backing::Private { mem } => mem.as_ptr() as *mut u8,
        }
    }

    // SAFETY of the accessors below: every offset used is 8- (or 4-)
    // aligned within a mapping that outlives self, and all concurrent
    // access goes through these atomics.
    fn atom_u64(&self, off: usize) -> &AtomicU64 {
        debug_assert_eq!(off % 8, 0);
        unsafe { &*(self.base().add(off) as *const AtomicU64) }
    }

    fn atom_u32(&self, off: usize) -> &AtomicU32 {
        debug_assert_eq!(off % 4, 0);
        unsafe { &*(self.base().add(off) as *const AtomicU32) }
    }

    fn slot_off(&self, slot: usize) -> usize {
        LOCK_HEADER_SIZE + slot * READER_SLOT_SIZE
    }

    fn init_header(&self, env_mode: u32) {
        self.atom_u64(OFF_MAGIC).store(LOCK_MAGIC, Ordering::Relaxed);
        self.atom_u32(OFF_OS_FORMAT).store(OS_FORMAT, Ordering::Relaxed);
        self.atom_u32(OFF_ENV_MODE).store(env_mode, Ordering::Relaxed);
        self.atom_u64(OFF_AUTOSYNC_THRESHOLD).store(0, Ordering::Relaxed);
        self.atom_u64(OFF_AUTOSYNC_PERIOD).store(0, Ordering::Relaxed);
        self.atom_u32(OFF_MLOCK).store(0, Ordering::Relaxed);
        self.atom_u32(OFF_MLOCK + 4).store(0, Ordering::Relaxed);
        self.atom_u64(OFF_CACHED_OLDEST).store(0, Ordering::Relaxed);
        self.atom_u64(OFF_UNSYNCED_VOLUME).store(0, Ordering::Relaxed);
        self.atom_u32(OFF_NUM_READERS).store(0, Ordering::Relaxed);
        self.atom_u32(OFF_REFRESH_FLAG).store(0, Ordering::Release);
    }

    fn validate_header(&self) -> Result<()> {
        let magic = self.atom_u64(OFF_MAGIC).load(Ordering::Acquire);
        if magic >> 8 != MAGIC {
            return Err(StoreError::Invalid("not a lock file"));
        }
        if magic != LOCK_MAGIC {
            return Err(StoreError::VersionMismatch);
        }
        if self.atom_u32(OFF_OS_FORMAT).load(Ordering::Relaxed) != OS_FORMAT {
            return Err(StoreError::Incompatible("lock file from another OS format"));
        }
        Ok(())
    }

    // --- writer lock -------------------------------------------------------

    /// Take the cross-process writer lock. With `try_only`, a held lock
    /// surfaces as `Busy` instead of blocking.
    pub fn writer_lock(&self, try_only: bool) -> Result<()> {
        let Backing::Shared { file, .. } = &self.backing else {
            return Err(StoreError::Invalid("no writer lock without a lock file"));
        };
        let op = libc::LOCK_EX | if try_only { libc::LOCK_NB } else { 0 };
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if try_only && err.kind() == std::io::ErrorKind::WouldBlock {
            return Err(StoreError::Busy);
        }
        Err(err.into())
    }

    pub fn writer_unlock(&self) {
        if let Backing::Shared { file, .. } = &self.backing {
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        }
    }

    // --- reader slots ------------------------------------------------------

    /// Claim a free slot: CAS `txnid` 0 → reserved, then publish identity.
    pub fn claim_slot(&self) -> Result<usize> {
        let pid = std::process::id();
        let tid = thread_id();

        if let Some(slot) = self.free_slots.lock().pop() {
            let off = self.slot_off(slot);
            if self
                .atom_u64(off + SLOT_TXNID)
                .compare_exchange(0, TXNID_RESERVED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.publish_identity(slot, pid, tid);
                return Ok(slot);
            }
        }

        for slot in 0..self.max_readers {
            let off = self.slot_off(slot);
            if self.atom_u64(off + SLOT_TXNID).load(Ordering::Acquire) != 0 {
                continue;
            }
            if self
                .atom_u64(off + SLOT_TXNID)
                .compare_exchange(0, TXNID_RESERVED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.publish_identity(slot, pid, tid);
                let watermark = self.atom_u32(OFF_NUM_READERS);
                watermark.fetch_max(slot as u32 + 1, Ordering::AcqRel);
                return Ok(slot);
            }
        }
        Err(StoreError::ReadersFull)
    }

    fn publish_identity(&self, slot: usize, pid: u32, tid: u64) {
        let off = self.slot_off(slot);
        self.atom_u64(off + SLOT_TID).store(tid, Ordering::Relaxed);
        self.atom_u32(off + SLOT_PID).store(pid, Ordering::Relaxed);
        self.atom_u32(off + SLOT_PAGES_USED).store(0, Ordering::Relaxed);
        self.atom_u64(off + SLOT_PAGES_RETIRED).store(0, Ordering::Release);
    }

    /// Publish the snapshot this slot pins
    pub fn bind_slot(&self, slot: usize, txnid: TxnId, pages_used: u32, pages_retired: u64) {
        let off = self.slot_off(slot);
        self.atom_u32(off + SLOT_PAGES_USED).store(pages_used, Ordering::Relaxed);
        self.atom_u64(off + SLOT_PAGES_RETIRED).store(pages_retired, Ordering::Relaxed);
        self.atom_u64(off + SLOT_TXNID).store(txnid, Ordering::Release);
    }

    /// Drop the snapshot pin but keep the slot (reset half of reset/renew)
    pub fn park_slot(&self, slot: usize) {
        let off = self.slot_off(slot);
        self.atom_u64(off + SLOT_TXNID).store(TXNID_RESERVED, Ordering::Release);
    }

    pub fn release_slot(&self, slot: usize) {
        let off = self.slot_off(slot);
        self.atom_u64(off + SLOT_TXNID).store(0, Ordering::Release);
        self.free_slots.lock().push(slot);
    }

    pub fn slot_txnid(&self, slot: usize) -> TxnId {
        self.atom_u64(self.slot_off(slot) + SLOT_TXNID).load(Ordering::Acquire)
    }

    /// Check the slot still carries this reader's snapshot; an evicted or
    /// recycled slot surfaces as `Ousted`.
    pub fn validate_slot(&self, slot: usize, txnid: TxnId) -> Result<()> {
        let off = self.slot_off(slot);
        let cur = self.atom_u64(off + SLOT_TXNID).load(Ordering::Acquire);
        let pid = self.atom_u32(off + SLOT_PID).load(Ordering::Relaxed);
        if cur != txnid || pid != std::process::id() {
            return Err(StoreError::Ousted);
        }
        Ok(())
    }

    /// Evict a slot (slow-reader policy); its reader fails on next use
    pub fn oust_slot(&self, slot: usize) {
        let off = self.slot_off(slot);
        warn!(slot, "ousting slow reader slot");
        self.atom_u64(off + SLOT_TXNID).store(0, Ordering::Release);
    }

    /// Oldest snapshot any active reader still pins, or `fallback` when
    /// the table is empty
    pub fn oldest(&self, fallback: TxnId) -> TxnId {
        let used = self.atom_u32(OFF_NUM_READERS).load(Ordering::Acquire) as usize;
        let mut oldest = fallback;
        for slot in 0..used.min(self.max_readers) {
            let txnid = self.slot_txnid(slot);
            if txnid != 0 && txnid != TXNID_RESERVED {
                oldest = oldest.min(txnid);
            }
        }
        self.atom_u64(OFF_CACHED_OLDEST).store(oldest, Ordering::Release);
        oldest
    }

    /// Last `oldest` the writer computed, as a cheap hint
    pub fn cached_oldest(&self) -> TxnId {
        self.atom_u64(OFF_CACHED_OLDEST).load(Ordering::Acquire)
    }

    /// Snapshot of all active reader slots
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        let used = self.atom_u32(OFF_NUM_READERS).load(Ordering::Acquire) as usize;
        let mut rows = Vec::new();
        for slot in 0..used.min(self.max_readers) {
            let off = self.slot_off(slot);
            let txnid = self.atom_u64(off + SLOT_TXNID).load(Ordering::Acquire);
            if txnid == 0 {
                continue;
            }
            rows.push(ReaderInfo {
                slot,
                pid: self.atom_u32(off + SLOT_PID).load(Ordering::Relaxed),
                tid: self.atom_u64(off + SLOT_TID).load(Ordering::Relaxed),
                txnid,
                pages_used: self.atom_u32(off + SLOT_PAGES_USED).load(Ordering::Relaxed),
                pages_retired: self.atom_u64(off + SLOT_PAGES_RETIRED).load(Ordering::Relaxed),
            });
        }
        rows
    }

    /// Clear slots whose owning process is gone; returns how many.
    pub fn reader_check(&self) -> usize {
        if self.is_private() {
            return 0;
        }
        let used = self.atom_u32(OFF_NUM_READERS).load(Ordering::Acquire) as usize;
        let mut cleared = 0;
        for slot in 0..used.min(self.max_readers) {
            let off = self.slot_off(slot);
            let txnid = self.atom_u64(off + SLOT_TXNID).load(Ordering::Acquire);
            if txnid == 0 {
                continue;
            }
            let pid = self.atom_u32(off + SLOT_PID).load(Ordering::Relaxed);
            if pid != 0 && !process_alive(pid) {
                warn!(slot, pid, "clearing reader slot of dead process");
                self.atom_u64(off + SLOT_TXNID).store(0, Ordering::Release);
                cleared += 1;
            }
        }
        cleared
    }
}

/// Liveness probe: signal 0 reports deliverability without delivering
fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but is not ours
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Process-unique id of the calling thread
pub fn thread_id() -> u64 {
    use std::sync::atomic::AtomicU64 as Counter;
    static NEXT: Counter = Counter::new(1);
    thread_local! {
        static TID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_lock(max: usize) -> (LockFile, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::open(&dir.path().join("lock.db"), max, false, 0).unwrap();
        (lock, dir)
    }

    #[test]
    fn test_claim_bind_release_cycle() {
        let (lock, _dir) = shared_lock(4);
        let a = lock.claim_slot().unwrap();
        let b = lock.claim_slot().unwrap();
        assert_ne!(a, b);

        lock.bind_slot(a, 10, 0, 0);
        lock.bind_slot(b, 12, 0, 0);
        assert_eq!(lock.oldest(100), 10);
        assert!(lock.validate_slot(a, 10).is_ok());
        assert!(matches!(lock.validate_slot(a, 11), Err(StoreError::Ousted)));

        lock.release_slot(a);
        assert_eq!(lock.oldest(100), 12);
        // LIFO reuse of the released slot
        assert_eq!(lock.claim_slot().unwrap(), a);
    }

    #[test]
    fn test_table_exhaustion() {
        let (lock, _dir) = shared_lock(2);
        lock.claim_slot().unwrap();
        lock.claim_slot().unwrap();
        assert!(matches!(lock.claim_slot(), Err(StoreError::ReadersFull)));
    }

    #[test]
    fn test_oust_detected_by_validate() {
        let (lock, _dir) = shared_lock(2);
        let slot = lock.claim_slot().unwrap();
        lock.bind_slot(slot, 33, 0, 0);
        lock.oust_slot(slot);
        assert!(matches!(lock.validate_slot(slot, 33), Err(StoreError::Ousted)));
    }

    #[test]
    fn test_reader_list_and_liveness() {
        let (lock, _dir) = shared_lock(4);
        let slot = lock.claim_slot().unwrap();
        lock.bind_slot(slot, 5, 2, 1);
        let rows = lock.reader_list();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].txnid, 5);
        assert_eq!(rows[0].pid, std::process::id());
        // our own process is alive, so nothing gets cleared
        assert_eq!(lock.reader_check(), 0);
    }

    #[test]
    fn test_reopen_validates_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        {
            LockFile::open(&path, 4, false, 0).unwrap();
        }
        let lock = LockFile::open(&path, 8, false, 0).unwrap();
        // capacity comes from the existing file, not the request
        assert_eq!(lock.max_readers(), 4);
        assert!(!lock.is_private());
    }

    #[test]
    fn test_private_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").join("lock.db");
        let lock = LockFile::open(&missing, 4, true, 0).unwrap();
        assert!(lock.is_private());
        let slot = lock.claim_slot().unwrap();
        lock.bind_slot(slot, 3, 0, 0);
        assert_eq!(lock.oldest(9), 3);
    }
}
