//! Dirty-page tracking and page-buffer pooling.
//!
//! A write transaction keeps every page it has CoWed or freshly allocated
//! in a `pgno → buffer` map; reads inside the transaction resolve against
//! it before falling back to the mapping. Buffers come from a shared LIFO
//! pool so repeated transactions do not churn the heap.

use crate::page::PageBuf;
use crate::types::Pgno;
use parking_lot::Mutex;
use std::collections::HashMap;

/// One tracked page (or overflow chain) of a write transaction
pub struct DirtyPage {
    pub buf: PageBuf,
    /// Nested-transaction depth that last touched this page
    pub level: u32,
    /// Adopted at its published page number (in-place overflow rewrite);
    /// freeing it must retire, never recycle
    pub adopted: bool,
}

/// The `pgno → buffer` map of a write transaction
#[derive(Default)]
pub struct DirtyTracker {
    pages: HashMap<u32, DirtyPage>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, pgno: Pgno) -> bool {
        self.pages.contains_key(&pgno.value())
    }

    pub fn insert(&mut self, pgno: Pgno, buf: PageBuf, level: u32) {
        self.pages.insert(
            pgno.value(),
            DirtyPage {
                buf,
                level,
                adopted: false,
            },
        );
    }

    pub fn get(&self, pgno: Pgno) -> Option<&DirtyPage> {
        self.pages.get(&pgno.value())
    }

    pub fn get_mut(&mut self, pgno: Pgno) -> Option<&mut DirtyPage> {
        self.pages.get_mut(&pgno.value())
    }

    pub fn remove(&mut self, pgno: Pgno) -> Option<DirtyPage> {
        self.pages.remove(&pgno.value())
    }

    /// Page numbers in ascending order, for sequential flushing
    pub fn sorted_pgnos(&self) -> Vec<Pgno> {
        let mut pgnos: Vec<Pgno> = self.pages.keys().copied().map(Pgno).collect();
        pgnos.sort_unstable();
        pgnos
    }

    /// Drop every entry, handing single-page buffers back to the pool
    pub fn drain_into(&mut self, pool: &PagePool) {
        for (_, page) in self.pages.drain() {
            pool.put(page.buf);
        }
    }
}

/// Process-shared LIFO pool of page buffers.
///
/// Bounded; overflow simply returns buffers to the allocator. One pool
/// per environment is sufficient, there is no cross-environment sharing.
pub struct PagePool {
    stack: Mutex<Vec<PageBuf>>,
    capacity: usize,
    page_size: usize,
}

impl PagePool {
    pub fn new(page_size: usize, capacity: usize) -> Self {
        Self {
            stack: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
            page_size,
        }
    }

    /// A zeroed buffer of `len` bytes; single pages come from the pool
    pub fn get(&self, len: usize) -> PageBuf {
        if len == self.page_size {
            if let Some(mut buf) = self.stack.lock().pop() {
                buf.as_bytes_mut().fill(0);
                return buf;
            }
        }
        PageBuf::zeroed(len)
    }

    /// Return a buffer; oversized or overflowing buffers are dropped
    pub fn put(&self, buf: PageBuf) {
        if buf.len() != self.page_size {
            return;
        }
        let mut stack = self.stack.lock();
        if stack.len() < self.capacity {
            stack.push(buf);
        }
    }

    #[cfg(test)]
    pub fn pooled(&self) -> usize {
        self.stack.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_basics() {
        let mut tracker = DirtyTracker::new();
        tracker.insert(Pgno(9), PageBuf::zeroed(256), 0);
        tracker.insert(Pgno(3), PageBuf::zeroed(256), 0);
        assert!(tracker.contains(Pgno(9)));
        assert!(!tracker.contains(Pgno(4)));
        assert_eq!(tracker.sorted_pgnos(), vec![Pgno(3), Pgno(9)]);

        tracker.get_mut(Pgno(3)).unwrap().buf.as_bytes_mut()[0] = 7;
        assert_eq!(tracker.get(Pgno(3)).unwrap().buf.as_bytes()[0], 7);

        assert!(tracker.remove(Pgno(9)).is_some());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_pool_reuse_and_bounds() {
        let pool = PagePool::new(256, 2);
        let a = pool.get(256);
        pool.put(a);
        assert_eq!(pool.pooled(), 1);

        // reused buffers come back zeroed
        let mut b = pool.get(256);
        assert!(b.as_bytes().iter().all(|&x| x == 0));
        b.as_bytes_mut()[0] = 1;
        pool.put(b);
        assert!(pool.get(256).as_bytes().iter().all(|&x| x == 0));

        // capacity bound and size filter
        pool.put(PageBuf::zeroed(256));
        pool.put(PageBuf::zeroed(256));
        pool.put(PageBuf::zeroed(256));
        assert_eq!(pool.pooled(), 2);
        pool.put(PageBuf::zeroed(512));
        assert_eq!(pool.pooled(), 2);
    }
}
