//! Data-page views and mutation.
//!
//! `PageView` reads a page image; `PageMut` edits one. Both operate on a
//! byte slice whose length is the page extent, so the same code serves
//! full pages and the inline sub-pages embedded in DUPSORT leaf nodes.
//!
//! Node placement is kept 2-byte aligned so entry offsets stay even.

use crate::error::{Result, StoreError};
use crate::page::{NodeRef, PageHeader, NODE_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::types::{PageFlags, Pgno, TxnId};
use std::cmp::Ordering;

/// Round a node size up to the placement granularity
pub fn align2(len: usize) -> usize {
    (len + 1) & !1
}

/// Outcome of a key search within one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key found at this entry index
    Found(usize),
    /// Key absent; it would be inserted at this index
    NotFound(usize),
}

impl SearchResult {
    pub fn index(self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => i,
        }
    }

    pub fn is_found(self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

/// Read-only view of a data page
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    bytes: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(StoreError::corrupted("page image truncated"));
        }
        Ok(Self { bytes })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::read(self.bytes).ok_or_else(|| StoreError::corrupted("bad page header"))
    }

    /// Extent of the node/index area
    pub fn payload_len(&self) -> usize {
        self.bytes.len() - PAGE_HEADER_SIZE
    }

    pub fn entries(&self) -> usize {
        u16::from_le_bytes(self.bytes[12..14].try_into().unwrap()) as usize / 2
    }

    fn upper(&self) -> usize {
        u16::from_le_bytes(self.bytes[14..16].try_into().unwrap()) as usize
    }

    fn lower(&self) -> usize {
        u16::from_le_bytes(self.bytes[12..14].try_into().unwrap()) as usize
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(u16::from_le_bytes(self.bytes[10..12].try_into().unwrap()))
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    pub fn is_dupfix(&self) -> bool {
        self.flags().contains(PageFlags::DUPFIX)
    }

    pub fn pgno(&self) -> Pgno {
        Pgno(u32::from_le_bytes(self.bytes[16..20].try_into().unwrap()))
    }

    pub fn txnid(&self) -> TxnId {
        u64::from_le_bytes(self.bytes[0..8].try_into().unwrap())
    }

    /// Stored offset of entry `i`, relative to the end of the header
    pub fn entry_offset(&self, i: usize) -> usize {
        let at = PAGE_HEADER_SIZE + 2 * i;
        u16::from_le_bytes(self.bytes[at..at + 2].try_into().unwrap()) as usize
    }

    /// Decode the node of entry `i`
    pub fn node(&self, i: usize) -> Result<NodeRef<'a>> {
        if i >= self.entries() {
            return Err(StoreError::corrupted("entry index out of bounds"));
        }
        let off = self.entry_offset(i);
        if off < self.upper() || off + NODE_HEADER_SIZE > self.payload_len() {
            return Err(StoreError::corrupted("entry offset out of bounds"));
        }
        NodeRef::parse(&self.bytes[PAGE_HEADER_SIZE + off..])
    }

    /// Key of entry `i` on a DUPFIX page (fixed stride, no node headers)
    pub fn dupfix_key(&self, i: usize) -> Result<&'a [u8]> {
        let ksize = u16::from_le_bytes(self.bytes[8..10].try_into().unwrap()) as usize;
        if ksize == 0 || i >= self.entries() {
            return Err(StoreError::corrupted("dupfix entry out of bounds"));
        }
        let start = PAGE_HEADER_SIZE + i * ksize;
        if start + ksize > self.bytes.len() {
            return Err(StoreError::corrupted("dupfix key past page end"));
        }
        Ok(&self.bytes[start..start + ksize])
    }

    /// Key of entry `i`, honoring the page layout
    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        if self.is_dupfix() {
            self.dupfix_key(i)
        } else {
            Ok(self.node(i)?.key())
        }
    }

    /// Contiguous free gap between the entry index and the topmost node
    pub fn free_space(&self) -> usize {
        if self.is_dupfix() {
            let ksize = u16::from_le_bytes(self.bytes[8..10].try_into().unwrap()) as usize;
            return self.payload_len() - self.entries() * ksize;
        }
        self.upper() - self.lower()
    }

    /// Free gap plus the holes left by removed or shrunk nodes
    pub fn total_free(&self) -> Result<usize> {
        if self.is_dupfix() {
            return Ok(self.free_space());
        }
        let mut live = 0usize;
        for i in 0..self.entries() {
            live += align2(self.node(i)?.stored_size());
        }
        Ok(self.payload_len() - self.lower() - live)
    }

    /// Binary search all entries of this page with `cmp`
    pub fn search(
        &self,
        key: &[u8],
        cmp: impl Fn(&[u8], &[u8]) -> Ordering,
    ) -> Result<SearchResult> {
        let n = self.entries();
        let mut low = 0usize;
        let mut high = n;
        // fast path for append-heavy workloads: compare the last entry first
        if n > 0 {
            match cmp(key, self.key(n - 1)?) {
                Ordering::Greater => return Ok(SearchResult::NotFound(n)),
                Ordering::Equal => return Ok(SearchResult::Found(n - 1)),
                Ordering::Less => high = n - 1,
            }
        }
        while low < high {
            let mid = low + (high - low) / 2;
            match cmp(key, self.key(mid)?) {
                Ordering::Less => high = mid,
                Ordering::Greater => low = mid + 1,
                Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }
        Ok(SearchResult::NotFound(low))
    }

    /// Index of the child a branch page routes `key` to.
    ///
    /// Entry 0 carries no key and covers everything below the first
    /// separator, so the search range is `[1, n)` and the answer is the
    /// last separator that is not greater than the key.
    pub fn branch_child_index(
        &self,
        key: &[u8],
        cmp: impl Fn(&[u8], &[u8]) -> Ordering,
    ) -> Result<usize> {
        let n = self.entries();
        debug_assert!(n >= 1);
        let mut low = 1usize;
        let mut high = n;
        while low < high {
            let mid = low + (high - low) / 2;
            match cmp(key, self.node(mid)?.key()) {
                Ordering::Less => high = mid,
                _ => low = mid + 1,
            }
        }
        Ok(low - 1)
    }

    /// Pick the split index for an overflowing page.
    ///
    /// `new_size` is the unaligned size of the incoming node and
    /// `insert_idx` its would-be entry index. Positions are in the virtual
    /// post-insert sequence of `n + 1` entries; entries `[0, s)` stay on
    /// the left page and `[s, n+1)` move right. The search starts at the
    /// midpoint and expands outward, trying the insertion side first, so
    /// append and prepend workloads split at the very edge.
    pub fn split_point(&self, new_size: usize, insert_idx: usize) -> Result<usize> {
        let n = self.entries();
        let mut costs = Vec::with_capacity(n + 1);
        for i in 0..n {
            let sz = if self.is_dupfix() {
                u16::from_le_bytes(self.bytes[8..10].try_into().unwrap()) as usize
            } else {
                2 + align2(self.node(i)?.stored_size())
            };
            costs.push(sz);
        }
        let new_cost = if self.is_dupfix() {
            u16::from_le_bytes(self.bytes[8..10].try_into().unwrap()) as usize
        } else {
            2 + align2(new_size)
        };
        costs.insert(insert_idx, new_cost);

        let total = n + 1;
        let page_space = self.payload_len();
        let fits = |s: usize| -> bool {
            let left: usize = costs[..s].iter().sum();
            let right: usize = costs[s..].iter().sum();
            left <= page_space && right <= page_space
        };

        let mid = total / 2;
        let toward_insert = insert_idx >= mid;
        for d in 0..=total {
            for dir in [toward_insert, !toward_insert] {
                let s = if dir { mid.checked_add(d) } else { mid.checked_sub(d) };
                let Some(s) = s else { continue };
                if s > total {
                    continue;
                }
                if fits(s) {
                    return Ok(s);
                }
            }
        }
        Err(StoreError::corrupted("no valid split point"))
    }
}

/// Mutable access to a data page
pub struct PageMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(StoreError::corrupted("page image truncated"));
        }
        Ok(Self { bytes })
    }

    /// Stamp a fresh data-page header. `upper` starts at the payload end.
    pub fn init(bytes: &'a mut [u8], pgno: Pgno, flags: PageFlags, txnid: TxnId) -> Result<Self> {
        let mut page = Self::new(bytes)?;
        let payload = page.view().payload_len();
        PageHeader {
            txnid,
            dupfix_ksize: 0,
            flags,
            lower: 0,
            upper: payload as u16,
            pgno,
        }
        .write(page.bytes);
        Ok(page)
    }

    pub fn view(&self) -> PageView<'_> {
        PageView { bytes: self.bytes }
    }

    /// Reset this image to an empty data page, keeping its extent
    pub fn reinit(&mut self, pgno: Pgno, flags: PageFlags, txnid: TxnId) {
        let payload = self.bytes.len() - PAGE_HEADER_SIZE;
        PageHeader {
            txnid,
            dupfix_ksize: 0,
            flags,
            lower: 0,
            upper: payload as u16,
            pgno,
        }
        .write(self.bytes);
    }

    /// The raw page image (overflow chains write their payload directly)
    pub fn raw_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    fn lower(&self) -> usize {
        u16::from_le_bytes(self.bytes[12..14].try_into().unwrap()) as usize
    }

    fn upper(&self) -> usize {
        u16::from_le_bytes(self.bytes[14..16].try_into().unwrap()) as usize
    }

    fn set_lower(&mut self, v: usize) {
        self.bytes[12..14].copy_from_slice(&(v as u16).to_le_bytes());
    }

    fn set_upper(&mut self, v: usize) {
        self.bytes[14..16].copy_from_slice(&(v as u16).to_le_bytes());
    }

    pub fn set_txnid(&mut self, txnid: TxnId) {
        self.bytes[0..8].copy_from_slice(&txnid.to_le_bytes());
    }

    pub fn set_pgno(&mut self, pgno: Pgno) {
        self.bytes[16..20].copy_from_slice(&pgno.value().to_le_bytes());
    }

    pub fn set_dupfix_ksize(&mut self, ksize: u16) {
        self.bytes[8..10].copy_from_slice(&ksize.to_le_bytes());
    }

    fn set_entry_offset(&mut self, i: usize, off: usize) {
        let at = PAGE_HEADER_SIZE + 2 * i;
        self.bytes[at..at + 2].copy_from_slice(&(off as u16).to_le_bytes());
    }

    /// Insert a node image as entry `idx`, shifting the index right.
    ///
    /// The caller must have established enough contiguous free space,
    /// compacting if needed; an undersized gap is a `PageFull`.
    pub fn insert_entry(&mut self, idx: usize, node: &[u8]) -> Result<()> {
        let n = self.view().entries();
        debug_assert!(idx <= n);
        let need = 2 + align2(node.len());
        let gap = self.upper() - self.lower();
        if gap < need {
            return Err(StoreError::PageFull {
                pgno: self.view().pgno(),
                needed: need,
                available: gap,
            });
        }

        let new_upper = self.upper() - align2(node.len());
        let at = PAGE_HEADER_SIZE + new_upper;
        self.bytes[at..at + node.len()].copy_from_slice(node);

        for i in (idx..n).rev() {
            let off = self.view().entry_offset(i);
            self.set_entry_offset(i + 1, off);
        }
        self.set_entry_offset(idx, new_upper);
        self.set_lower(self.lower() + 2);
        self.set_upper(new_upper);
        Ok(())
    }

    /// Remove entry `idx`, shifting the index left. The node bytes remain
    /// as a hole until the next `compact`.
    pub fn remove_entry(&mut self, idx: usize) -> Result<()> {
        let n = self.view().entries();
        if idx >= n {
            return Err(StoreError::corrupted("remove index out of bounds"));
        }
        let removed_off = self.view().entry_offset(idx);
        let removed_len = align2(self.view().node(idx)?.stored_size());
        for i in idx..n - 1 {
            let off = self.view().entry_offset(i + 1);
            self.set_entry_offset(i, off);
        }
        self.set_lower(self.lower() - 2);
        // reclaim immediately when the topmost node was removed
        if removed_off == self.upper() {
            self.set_upper(removed_off + removed_len);
        }
        Ok(())
    }

    /// Replace entry `idx` with a new node image.
    ///
    /// Writes in place when the new image fits the old slot; otherwise
    /// removes and reinserts (the caller guarantees space, compacting
    /// first where `total_free` allows).
    pub fn replace_entry(&mut self, idx: usize, node: &[u8]) -> Result<()> {
        let old_off = self.view().entry_offset(idx);
        let old_len = align2(self.view().node(idx)?.stored_size());
        if align2(node.len()) <= old_len {
            let at = PAGE_HEADER_SIZE + old_off;
            self.bytes[at..at + node.len()].copy_from_slice(node);
            return Ok(());
        }
        self.remove_entry(idx)?;
        self.insert_entry(idx, node)
    }

    /// Overwrite the value area of entry `idx` in place. The new value
    /// must have exactly the stored length.
    pub fn write_value_in_place(&mut self, idx: usize, value: &[u8]) -> Result<()> {
        let off = self.view().entry_offset(idx);
        let node = self.view().node(idx)?;
        if node.stored_value_len() != value.len() {
            return Err(StoreError::corrupted("in-place value length mismatch"));
        }
        let at = PAGE_HEADER_SIZE + off + NODE_HEADER_SIZE + node.key_size();
        self.bytes[at..at + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Rewrite the child page number of branch entry `idx`
    pub fn set_child(&mut self, idx: usize, child: Pgno) -> Result<()> {
        debug_assert!(self.view().is_branch());
        if idx >= self.view().entries() {
            return Err(StoreError::corrupted("child index out of bounds"));
        }
        let off = self.view().entry_offset(idx);
        let at = PAGE_HEADER_SIZE + off;
        self.bytes[at..at + 4].copy_from_slice(&child.value().to_le_bytes());
        Ok(())
    }

    /// Repack all nodes against the end of the page, closing holes.
    ///
    /// Uses the in-page free gap as scratch when it covers the live bytes,
    /// otherwise a transient buffer.
    pub fn compact(&mut self) -> Result<()> {
        if self.view().is_dupfix() {
            return Ok(());
        }
        let n = self.view().entries();
        let payload = self.view().payload_len();

        let mut live = 0usize;
        for i in 0..n {
            live += align2(self.view().node(i)?.stored_size());
        }
        let gap = self.upper() - self.lower();

        if gap >= live {
            // enough room to stage every node inside the gap
            self.compact_via(self.lower(), n, payload)?;
        } else {
            let mut scratch = vec![0u8; live];
            let mut at = 0usize;
            let mut sizes = Vec::with_capacity(n);
            for i in 0..n {
                let node = self.view().node(i)?;
                let sz = node.stored_size();
                let off = self.view().entry_offset(i);
                scratch[at..at + sz]
                    .copy_from_slice(&self.bytes[PAGE_HEADER_SIZE + off..PAGE_HEADER_SIZE + off + sz]);
                sizes.push(sz);
                at += align2(sz);
            }
            let mut upper = payload;
            let mut src = 0usize;
            for (i, sz) in sizes.iter().enumerate() {
                upper -= align2(*sz);
                let dst = PAGE_HEADER_SIZE + upper;
                self.bytes[dst..dst + sz].copy_from_slice(&scratch[src..src + sz]);
                self.set_entry_offset(i, upper);
                src += align2(*sz);
            }
            self.set_upper(upper);
        }
        Ok(())
    }

    /// Stage nodes into the free gap at `stage_base`, then settle them
    /// against the payload end.
    fn compact_via(&mut self, stage_base: usize, n: usize, payload: usize) -> Result<()> {
        let mut at = stage_base;
        let mut sizes = Vec::with_capacity(n);
        for i in 0..n {
            let node = self.view().node(i)?;
            let sz = node.stored_size();
            let off = self.view().entry_offset(i);
            self.bytes
                .copy_within(PAGE_HEADER_SIZE + off..PAGE_HEADER_SIZE + off + sz, PAGE_HEADER_SIZE + at);
            self.set_entry_offset(i, at);
            sizes.push(sz);
            at += align2(sz);
        }
        let mut upper = payload;
        for i in (0..n).rev() {
            let sz = sizes[i];
            upper -= align2(sz);
            let off = self.view().entry_offset(i);
            self.bytes
                .copy_within(PAGE_HEADER_SIZE + off..PAGE_HEADER_SIZE + off + sz, PAGE_HEADER_SIZE + upper);
            self.set_entry_offset(i, upper);
        }
        self.set_upper(upper);
        Ok(())
    }

    /// Make room for `node_len` more bytes, compacting when the holes
    /// hold what the gap lacks. Returns false when the page truly cannot
    /// take the node.
    pub fn ensure_gap(&mut self, node_len: usize) -> Result<bool> {
        let need = 2 + align2(node_len);
        if self.upper() - self.lower() >= need {
            return Ok(true);
        }
        if self.view().total_free()? >= need {
            self.compact()?;
            return Ok(self.upper() - self.lower() >= need);
        }
        Ok(false)
    }

    // --- DUPFIX layout -----------------------------------------------------

    /// Insert a fixed-stride key at index `idx` of a DUPFIX page
    pub fn dupfix_insert(&mut self, idx: usize, key: &[u8]) -> Result<()> {
        let ksize = u16::from_le_bytes(self.bytes[8..10].try_into().unwrap()) as usize;
        debug_assert_eq!(key.len(), ksize);
        let n = self.view().entries();
        debug_assert!(idx <= n);
        if (n + 1) * ksize > self.view().payload_len() {
            return Err(StoreError::PageFull {
                pgno: self.view().pgno(),
                needed: ksize,
                available: self.view().payload_len() - n * ksize,
            });
        }
        let base = PAGE_HEADER_SIZE + idx * ksize;
        let end = PAGE_HEADER_SIZE + n * ksize;
        self.bytes.copy_within(base..end, base + ksize);
        self.bytes[base..base + ksize].copy_from_slice(key);
        self.set_lower((n + 1) * 2);
        Ok(())
    }

    /// Remove the fixed-stride key at index `idx` of a DUPFIX page
    pub fn dupfix_remove(&mut self, idx: usize) -> Result<()> {
        let ksize = u16::from_le_bytes(self.bytes[8..10].try_into().unwrap()) as usize;
        let n = self.view().entries();
        if idx >= n {
            return Err(StoreError::corrupted("dupfix remove out of bounds"));
        }
        let base = PAGE_HEADER_SIZE + idx * ksize;
        let end = PAGE_HEADER_SIZE + n * ksize;
        self.bytes.copy_within(base + ksize..end, base);
        self.set_lower((n - 1) * 2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{NodeBuilder, PageBuf};
    use crate::types::NodeFlags;

    fn leaf_page(size: usize) -> PageBuf {
        let mut buf = PageBuf::zeroed(size);
        PageMut::init(buf.as_bytes_mut(), Pgno(5), PageFlags::LEAF, 1).unwrap();
        buf
    }

    fn put(buf: &mut PageBuf, idx: usize, key: &[u8], val: &[u8]) {
        let node = NodeBuilder::leaf(key, val, NodeFlags::empty());
        PageMut::new(buf.as_bytes_mut())
            .unwrap()
            .insert_entry(idx, &node)
            .unwrap();
    }

    #[test]
    fn test_insert_preserves_order_and_space() {
        let mut buf = leaf_page(4096);
        put(&mut buf, 0, b"bb", b"2");
        put(&mut buf, 0, b"aa", b"1");
        put(&mut buf, 2, b"cc", b"3");

        let view = PageView::new(buf.as_bytes()).unwrap();
        assert_eq!(view.entries(), 3);
        assert_eq!(view.node(0).unwrap().key(), b"aa");
        assert_eq!(view.node(1).unwrap().key(), b"bb");
        assert_eq!(view.node(2).unwrap().key(), b"cc");
        assert_eq!(view.total_free().unwrap(), view.free_space());
    }

    #[test]
    fn test_search_and_fast_path() {
        let mut buf = leaf_page(4096);
        for (i, k) in [b"aa", b"cc", b"ee"].iter().enumerate() {
            put(&mut buf, i, *k, b"v");
        }
        let view = PageView::new(buf.as_bytes()).unwrap();
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
        assert_eq!(view.search(b"cc", cmp).unwrap(), SearchResult::Found(1));
        assert_eq!(view.search(b"dd", cmp).unwrap(), SearchResult::NotFound(2));
        assert_eq!(view.search(b"zz", cmp).unwrap(), SearchResult::NotFound(3));
        assert_eq!(view.search(b"ee", cmp).unwrap(), SearchResult::Found(2));
        assert_eq!(view.search(b"a", cmp).unwrap(), SearchResult::NotFound(0));
    }

    #[test]
    fn test_remove_leaves_hole_and_compact_reclaims() {
        let mut buf = leaf_page(4096);
        for i in 0..8 {
            let k = format!("key{i}");
            put(&mut buf, i, k.as_bytes(), b"0123456789");
        }
        let before_gap = PageView::new(buf.as_bytes()).unwrap().free_space();

        PageMut::new(buf.as_bytes_mut()).unwrap().remove_entry(3).unwrap();
        let view = PageView::new(buf.as_bytes()).unwrap();
        assert_eq!(view.entries(), 7);
        // index slot freed, node bytes still a hole
        assert_eq!(view.free_space(), before_gap + 2);
        assert!(view.total_free().unwrap() > view.free_space());

        PageMut::new(buf.as_bytes_mut()).unwrap().compact().unwrap();
        let view = PageView::new(buf.as_bytes()).unwrap();
        assert_eq!(view.total_free().unwrap(), view.free_space());
        assert_eq!(view.node(3).unwrap().key(), b"key4");
    }

    #[test]
    fn test_remove_topmost_reclaims_immediately() {
        let mut buf = leaf_page(4096);
        put(&mut buf, 0, b"aa", b"1");
        put(&mut buf, 1, b"bb", b"2");
        // entry 1 was placed last, so it is the topmost node
        let gap = PageView::new(buf.as_bytes()).unwrap().free_space();
        PageMut::new(buf.as_bytes_mut()).unwrap().remove_entry(1).unwrap();
        let view = PageView::new(buf.as_bytes()).unwrap();
        assert!(view.free_space() > gap + 2);
        assert_eq!(view.total_free().unwrap(), view.free_space());
    }

    #[test]
    fn test_replace_entry_in_place_and_grow() {
        let mut buf = leaf_page(4096);
        put(&mut buf, 0, b"key", b"aaaaaaaa");
        let off_before = PageView::new(buf.as_bytes()).unwrap().entry_offset(0);

        let same = NodeBuilder::leaf(b"key", b"bbbbbbbb", NodeFlags::empty());
        PageMut::new(buf.as_bytes_mut()).unwrap().replace_entry(0, &same).unwrap();
        let view = PageView::new(buf.as_bytes()).unwrap();
        assert_eq!(view.entry_offset(0), off_before);
        assert_eq!(view.node(0).unwrap().value_area().unwrap(), b"bbbbbbbb");

        let bigger = NodeBuilder::leaf(b"key", &[7u8; 64], NodeFlags::empty());
        PageMut::new(buf.as_bytes_mut()).unwrap().replace_entry(0, &bigger).unwrap();
        let view = PageView::new(buf.as_bytes()).unwrap();
        assert_eq!(view.node(0).unwrap().value_area().unwrap(), &[7u8; 64][..]);
    }

    #[test]
    fn test_page_full() {
        let mut buf = leaf_page(256);
        let node = NodeBuilder::leaf(b"key", &[0u8; 90], NodeFlags::empty());
        let mut page = PageMut::new(buf.as_bytes_mut()).unwrap();
        page.insert_entry(0, &node).unwrap();
        page.insert_entry(1, &node).unwrap();
        let err = page.insert_entry(2, &node).unwrap_err();
        assert!(matches!(err, StoreError::PageFull { .. }));
    }

    #[test]
    fn test_branch_child_index() {
        let mut buf = PageBuf::zeroed(4096);
        let mut page =
            PageMut::init(buf.as_bytes_mut(), Pgno(3), PageFlags::BRANCH, 1).unwrap();
        page.insert_entry(0, &NodeBuilder::branch(b"", Pgno(10))).unwrap();
        page.insert_entry(1, &NodeBuilder::branch(b"m", Pgno(20))).unwrap();
        page.insert_entry(2, &NodeBuilder::branch(b"t", Pgno(30))).unwrap();

        let view = PageView::new(buf.as_bytes()).unwrap();
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
        assert_eq!(view.branch_child_index(b"a", cmp).unwrap(), 0);
        assert_eq!(view.branch_child_index(b"m", cmp).unwrap(), 1);
        assert_eq!(view.branch_child_index(b"n", cmp).unwrap(), 1);
        assert_eq!(view.branch_child_index(b"t", cmp).unwrap(), 2);
        assert_eq!(view.branch_child_index(b"z", cmp).unwrap(), 2);
        assert_eq!(view.node(1).unwrap().child(), Pgno(20));
    }

    #[test]
    fn test_split_point_biases_toward_append() {
        let mut buf = leaf_page(1024);
        let mut i = 0;
        loop {
            let k = format!("key{i:03}");
            let node = NodeBuilder::leaf(k.as_bytes(), &[0u8; 24], NodeFlags::empty());
            let mut page = PageMut::new(buf.as_bytes_mut()).unwrap();
            if page.insert_entry(i, &node).is_err() {
                break;
            }
            i += 1;
        }
        let view = PageView::new(buf.as_bytes()).unwrap();
        let n = view.entries();

        // appending: the split lands at or right of the midpoint
        let s = view.split_point(40, n).unwrap();
        assert!(s >= (n + 1) / 2);
        // prepending: at or left of the midpoint
        let s = view.split_point(40, 0).unwrap();
        assert!(s <= (n + 1) / 2);
    }

    #[test]
    fn test_dupfix_layout() {
        let mut buf = PageBuf::zeroed(256);
        let mut page = PageMut::init(
            buf.as_bytes_mut(),
            Pgno(8),
            PageFlags::LEAF | PageFlags::DUPFIX,
            1,
        )
        .unwrap();
        page.set_dupfix_ksize(4);
        page.dupfix_insert(0, b"bbbb").unwrap();
        page.dupfix_insert(0, b"aaaa").unwrap();
        page.dupfix_insert(2, b"cccc").unwrap();

        let view = PageView::new(buf.as_bytes()).unwrap();
        assert_eq!(view.entries(), 3);
        assert_eq!(view.key(0).unwrap(), b"aaaa");
        assert_eq!(view.key(1).unwrap(), b"bbbb");
        assert_eq!(view.key(2).unwrap(), b"cccc");

        PageMut::new(buf.as_bytes_mut()).unwrap().dupfix_remove(1).unwrap();
        let view = PageView::new(buf.as_bytes()).unwrap();
        assert_eq!(view.entries(), 2);
        assert_eq!(view.key(1).unwrap(), b"cccc");
    }
}
