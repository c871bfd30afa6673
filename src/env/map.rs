//! The data-file mapping.
//!
//! The environment owns the mmap as an arena; everything else resolves
//! pages by number through [`MapManager::page`]. Growth replaces the
//! mapping and bumps a version counter; superseded mappings are retired
//! and kept alive until the environment closes, so a slice handed to a
//! read snapshot never dangles.

use crate::error::{Result, StoreError};
use crate::types::Pgno;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::RwLock;
use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

struct MapState {
    current: MmapRaw,
    len: usize,
    retired: Vec<MmapRaw>,
}

/// Owns the current data mapping and every superseded one.
pub struct MapManager {
    state: RwLock<MapState>,
    version: AtomicU32,
    writable: bool,
}

impl MapManager {
    pub fn new(file: &File, len: usize, writable: bool) -> Result<Self> {
        let current = Self::map(file, len, writable)?;
        Ok(Self {
            state: RwLock::new(MapState {
                current,
                len,
                retired: Vec::new(),
            }),
            version: AtomicU32::new(1),
            writable,
        })
    }

    fn map(file: &File, len: usize, writable: bool) -> Result<MmapRaw> {
        let mut opts = MmapOptions::new();
        opts.len(len);
        let raw = if writable {
            opts.map_raw(file)?
        } else {
            opts.map_raw_read_only(file)?
        };
        Ok(raw)
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.state.read().len
    }

    /// Current mapping generation; bumped on every remap
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Resolve `npages` starting at `pgno` against the current mapping.
    ///
    /// The returned slice lives as long as the manager: superseded
    /// mappings are never unmapped before drop, and the copy-on-write
    /// discipline keeps pages reachable from any published root immutable,
    /// so the bytes behind the slice cannot change while a snapshot can
    /// still reach them.
    pub fn page(&self, pgno: Pgno, page_size: usize, npages: usize) -> Result<&[u8]> {
        let state = self.state.read();
        let start = pgno.file_offset(page_size) as usize;
        let byte_len = npages * page_size;
        if !pgno.is_present() || start + byte_len > state.len {
            return Err(StoreError::PageNotFound(pgno));
        }
        // SAFETY: bounds checked above; the mapping (current or, after a
        // remap, retired) stays alive until self drops.
        Ok(unsafe { std::slice::from_raw_parts(state.current.as_ptr().add(start), byte_len) })
    }

    /// Copy a flushed page image into the mapping (write-map commits)
    pub fn write_into(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.writable);
        let state = self.state.read();
        if offset + bytes.len() > state.len {
            return Err(StoreError::UnableExtendMapsize);
        }
        // SAFETY: bounds checked; only the single writer reaches here, and
        // the target pages are unreachable from every published root.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                state.current.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Flush mapped bytes to the file (msync)
    pub fn flush(&self) -> Result<()> {
        let state = self.state.read();
        state.current.flush()?;
        Ok(())
    }

    /// Replace the mapping after the file was resized.
    ///
    /// The old mapping moves to the retired list; snapshots that resolved
    /// pages through it stay valid.
    pub fn remap(&self, file: &File, new_len: usize) -> Result<()> {
        let fresh = Self::map(file, new_len, self.writable)?;
        let mut state = self.state.write();
        let old = std::mem::replace(&mut state.current, fresh);
        state.retired.push(old);
        let old_len = state.len;
        state.len = new_len;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(old_len, new_len, version, "remapped data file");
        Ok(())
    }

    /// Number of retired mappings held for still-live snapshots
    pub fn retired_count(&self) -> usize {
        self.state.read().retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_page_resolution_and_remap() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.db");
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(8192)?;
        file.write_all(&[7u8; 4096])?;
        file.sync_all()?;

        let map = MapManager::new(&file, 8192, false)?;
        assert_eq!(map.version(), 1);
        let page = map.page(Pgno(0), 4096, 1)?;
        assert_eq!(page[100], 7);
        assert!(map.page(Pgno(2), 4096, 1).is_err());
        assert!(map.page(Pgno::ABSENT, 4096, 1).is_err());

        let held = map.page(Pgno(1), 4096, 1)?;
        file.set_len(16384)?;
        map.remap(&file, 16384)?;
        assert_eq!(map.version(), 2);
        assert_eq!(map.retired_count(), 1);
        // the pre-remap slice still reads
        assert_eq!(held.len(), 4096);
        assert!(map.page(Pgno(3), 4096, 1).is_ok());
        Ok(())
    }
}
