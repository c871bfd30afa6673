//! The DUPSORT engine: duplicate values per key.
//!
//! A key's value slot is a tagged variant: a single value, an inline
//! sub-page (a mini page embedded in the node, values playing the role of
//! keys), or a nested sub-tree rooted at its own leaf page. Growth past
//! the inline limit migrates sub-page → sub-tree; deletion down to one
//! value collapses either form back to a single-value node. Both
//! conversions are invisible to iteration.

use crate::error::{Result, StoreError};
use crate::page::{align2, NodeBuilder, PageBuf, PageMut, PageView, SearchResult, NODE_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::tree::{sub_tree_flags, TreeDesc};
use crate::types::{DbFlags, NodeFlags, PageFlags, Pgno, PutFlags};
use super::ops::{self, Edge, Entry, Level, TreeCtx, ValueKind};
use super::Cursor;
use std::cmp::Ordering;

/// Where the cursor stands within the current key's duplicates
pub(crate) enum DupState {
    /// Single value (or not a DUPSORT tree)
    None,
    /// Index into the inline sub-page
    Inline { idx: usize },
    /// Nested sub-tree position
    Tree { desc: TreeDesc, stack: Vec<Level> },
}

impl<'t, 'env> Cursor<'t, 'env> {
    /// Read the raw value area of the current node
    fn node_value_area(&self) -> Result<Vec<u8>> {
        let leaf = self.leaf()?;
        let page = self.txn.page(leaf.pgno)?;
        let view = PageView::new(&page)?;
        if view.is_dupfix() {
            // sub-tree leaves have no separate value; the key is the value
            return Ok(view.dupfix_key(leaf.idx)?.to_vec());
        }
        let node = view.node(leaf.idx)?;
        if node.flags().contains(NodeFlags::BIG) {
            return ops::read_overflow(self.txn, node.overflow_pgno()?, node.data_size());
        }
        Ok(node.value_area()?.to_vec())
    }

    /// The value at the cursor, honoring the duplicate position
    pub(crate) fn current_value(&self) -> Result<Vec<u8>> {
        match &self.dup {
            DupState::None => self.node_value_area(),
            DupState::Inline { idx } => {
                let area = self.node_value_area()?;
                let view = PageView::new(&area)?;
                Ok(view.key(*idx)?.to_vec())
            }
            DupState::Tree { stack, .. } => {
                let level = stack.last().ok_or(StoreError::Invalid("empty dup stack"))?;
                let page = self.txn.page(level.pgno)?;
                Ok(PageView::new(&page)?.key(level.idx)?.to_vec())
            }
        }
    }

    /// Establish the duplicate position for the entry the cursor just
    /// landed on
    pub(crate) fn load_dup(&mut self, edge: Edge) -> Result<()> {
        self.dup = DupState::None;
        self.cur_dup.clear();
        if !self.is_dupsort() {
            return Ok(());
        }
        match self.current_kind()? {
            ValueKind::Plain | ValueKind::Big => {
                self.cur_dup = self.node_value_area()?;
            }
            ValueKind::InlineDup => {
                let area = self.node_value_area()?;
                let view = PageView::new(&area)?;
                let n = view.entries();
                let idx = match edge {
                    Edge::First => 0,
                    Edge::Last => n.saturating_sub(1),
                };
                self.cur_dup = view.key(idx)?.to_vec();
                self.dup = DupState::Inline { idx };
            }
            ValueKind::SubTree => {
                let mut desc = TreeDesc::read(&self.node_value_area()?)?;
                let mut stack = Vec::new();
                {
                    let mut ctx = TreeCtx {
                        stack: &mut stack,
                        desc: &mut desc,
                        cmp: self.dup_cmp,
                    };
                    if !ops::descend_edge(self.txn, &mut ctx, edge)? {
                        return Err(StoreError::corrupted("empty duplicate sub-tree"));
                    }
                }
                let level = *stack.last().unwrap();
                let page = self.txn.page(level.pgno)?;
                self.cur_dup = PageView::new(&page)?.key(level.idx)?.to_vec();
                self.dup = DupState::Tree { desc, stack };
            }
        }
        Ok(())
    }

    /// Step to the next duplicate of the current key
    pub(crate) fn dup_next(&mut self) -> Result<Option<Vec<u8>>> {
        match std::mem::replace(&mut self.dup, DupState::None) {
            DupState::None => {
                self.dup = DupState::None;
                Ok(None)
            }
            DupState::Inline { idx } => {
                let area = self.node_value_area()?;
                let view = PageView::new(&area)?;
                if idx + 1 < view.entries() {
                    let value = view.key(idx + 1)?.to_vec();
                    self.dup = DupState::Inline { idx: idx + 1 };
                    Ok(Some(value))
                } else {
                    self.dup = DupState::Inline { idx };
                    Ok(None)
                }
            }
            DupState::Tree { mut desc, mut stack } => {
                let moved = {
                    let level = stack.last_mut().ok_or(StoreError::Invalid("empty dup stack"))?;
                    if level.idx + 1 < level.count {
                        level.idx += 1;
                        true
                    } else {
                        let mut ctx = TreeCtx {
                            stack: &mut stack,
                            desc: &mut desc,
                            cmp: self.dup_cmp,
                        };
                        ops::next_leaf(self.txn, &mut ctx)?
                    }
                };
                let out = if moved {
                    let level = *stack.last().unwrap();
                    let page = self.txn.page(level.pgno)?;
                    Some(PageView::new(&page)?.key(level.idx)?.to_vec())
                } else {
                    None
                };
                self.dup = DupState::Tree { desc, stack };
                Ok(out)
            }
        }
    }

    /// Step to the previous duplicate of the current key
    pub(crate) fn dup_prev(&mut self) -> Result<Option<Vec<u8>>> {
        match std::mem::replace(&mut self.dup, DupState::None) {
            DupState::None => Ok(None),
            DupState::Inline { idx } => {
                let area = self.node_value_area()?;
                let view = PageView::new(&area)?;
                if idx > 0 {
                    let value = view.key(idx - 1)?.to_vec();
                    self.dup = DupState::Inline { idx: idx - 1 };
                    Ok(Some(value))
                } else {
                    self.dup = DupState::Inline { idx };
                    Ok(None)
                }
            }
            DupState::Tree { mut desc, mut stack } => {
                let moved = {
                    let level = stack.last_mut().ok_or(StoreError::Invalid("empty dup stack"))?;
                    if level.idx > 0 {
                        level.idx -= 1;
                        true
                    } else {
                        let mut ctx = TreeCtx {
                            stack: &mut stack,
                            desc: &mut desc,
                            cmp: self.dup_cmp,
                        };
                        ops::prev_leaf(self.txn, &mut ctx)?
                    }
                };
                let out = if moved {
                    let level = *stack.last().unwrap();
                    let page = self.txn.page(level.pgno)?;
                    Some(PageView::new(&page)?.key(level.idx)?.to_vec())
                } else {
                    None
                };
                self.dup = DupState::Tree { desc, stack };
                Ok(out)
            }
        }
    }

    /// Position within the current key's duplicates at `value` (`exact`)
    /// or the first duplicate not below it
    pub(crate) fn dup_seek(&mut self, value: &[u8], exact: bool) -> Result<Option<Vec<u8>>> {
        match self.current_kind()? {
            ValueKind::Plain => {
                let stored = self.node_value_area()?;
                let ord = (self.dup_cmp)(&stored, value);
                let hit = if exact {
                    ord == Ordering::Equal
                } else {
                    ord != Ordering::Less
                };
                self.dup = DupState::None;
                if hit {
                    self.cur_dup = stored.clone();
                    Ok(Some(stored))
                } else {
                    Ok(None)
                }
            }
            ValueKind::InlineDup => {
                let area = self.node_value_area()?;
                let view = PageView::new(&area)?;
                match view.search(value, self.dup_cmp)? {
                    SearchResult::Found(idx) => {
                        let found = view.key(idx)?.to_vec();
                        self.dup = DupState::Inline { idx };
                        self.cur_dup = found.clone();
                        Ok(Some(found))
                    }
                    SearchResult::NotFound(idx) => {
                        if exact || idx >= view.entries() {
                            self.load_dup(Edge::First)?;
                            return Ok(None);
                        }
                        let found = view.key(idx)?.to_vec();
                        self.dup = DupState::Inline { idx };
                        self.cur_dup = found.clone();
                        Ok(Some(found))
                    }
                }
            }
            ValueKind::SubTree => {
                let mut desc = TreeDesc::read(&self.node_value_area()?)?;
                let mut stack = Vec::new();
                let result = {
                    let mut ctx = TreeCtx {
                        stack: &mut stack,
                        desc: &mut desc,
                        cmp: self.dup_cmp,
                    };
                    let result = ops::search(self.txn, &mut ctx, value)?;
                    match result {
                        Some(SearchResult::Found(_)) => true,
                        Some(SearchResult::NotFound(idx)) if !exact => {
                            let count = ctx.stack.last().map(|l| l.count).unwrap_or(0);
                            idx < count || ops::next_leaf(self.txn, &mut ctx)?
                        }
                        _ => false,
                    }
                };
                if !result {
                    self.load_dup(Edge::First)?;
                    return Ok(None);
                }
                let level = *stack.last().unwrap();
                let found = {
                    let page = self.txn.page(level.pgno)?;
                    PageView::new(&page)?.key(level.idx)?.to_vec()
                };
                self.dup = DupState::Tree { desc, stack };
                self.cur_dup = found.clone();
                Ok(Some(found))
            }
            ValueKind::Big => Err(StoreError::corrupted("big value inside a DUPSORT tree")),
        }
    }

    /// Distinct values stored for the current key
    pub(crate) fn dup_count(&self) -> Result<u64> {
        if !self.is_dupsort() {
            return Ok(1);
        }
        match self.current_kind()? {
            ValueKind::Plain | ValueKind::Big => Ok(1),
            ValueKind::InlineDup => {
                let area = self.node_value_area()?;
                Ok(PageView::new(&area)?.entries() as u64)
            }
            ValueKind::SubTree => Ok(TreeDesc::read(&self.node_value_area()?)?.items),
        }
    }

    // --- writes ------------------------------------------------------------

    /// Add `value` to the current key's duplicates. The path is touched
    /// and the key exists; main-tree `items` is bumped here on success.
    pub(crate) fn dup_put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        let no_dup = flags.contains(PutFlags::NO_DUP_DATA);
        let append = flags.contains(PutFlags::APPEND_DUP);

        match self.current_kind()? {
            ValueKind::Plain => {
                let stored = self.node_value_area()?;
                self.check_dupfixed_stride(value, stored.len())?;
                match (self.dup_cmp)(value, &stored) {
                    Ordering::Equal => {
                        if no_dup {
                            return Err(StoreError::KeyExists);
                        }
                        self.cur_dup = stored;
                        self.dup = DupState::None;
                        return Ok(());
                    }
                    Ordering::Less if append => return Err(StoreError::KeyExists),
                    Ordering::Less => self.grow_dups(key, vec![value.to_vec(), stored], 0)?,
                    Ordering::Greater => self.grow_dups(key, vec![stored, value.to_vec()], 1)?,
                }
            }
            ValueKind::InlineDup => {
                let area = self.node_value_area()?;
                let view = PageView::new(&area)?;
                let n = view.entries();
                self.check_dupfixed_stride(value, view.key(0)?.len())?;
                match view.search(value, self.dup_cmp)? {
                    SearchResult::Found(idx) => {
                        if no_dup {
                            return Err(StoreError::KeyExists);
                        }
                        self.dup = DupState::Inline { idx };
                        self.cur_dup = value.to_vec();
                        return Ok(());
                    }
                    SearchResult::NotFound(idx) => {
                        if append && idx != n {
                            return Err(StoreError::KeyExists);
                        }
                        let mut values: Vec<Vec<u8>> = Vec::with_capacity(n + 1);
                        for i in 0..n {
                            values.push(view.key(i)?.to_vec());
                        }
                        values.insert(idx, value.to_vec());
                        self.grow_dups(key, values, idx)?;
                    }
                }
            }
            ValueKind::SubTree => {
                if !self.subtree_put(key, value, no_dup, append)? {
                    self.cur_dup = value.to_vec();
                    return Ok(());
                }
            }
            ValueKind::Big => {
                return Err(StoreError::corrupted("big value inside a DUPSORT tree"))
            }
        }

        let mut desc = self.txn.tree(self.dbi)?;
        desc.items += 1;
        self.txn.set_tree(self.dbi, desc);
        self.cur_dup = value.to_vec();
        Ok(())
    }

    fn check_dupfixed_stride(&self, value: &[u8], stride: usize) -> Result<()> {
        if self.db_flags.contains(DbFlags::DUP_FIXED) && value.len() != stride {
            return Err(StoreError::bad_val_size(value.len(), stride));
        }
        Ok(())
    }

    /// Rebuild the current node holding `values` (sorted), as an inline
    /// sub-page when it fits and a sub-tree otherwise. `pos` is the index
    /// of the just-added value.
    fn grow_dups(&mut self, key: &[u8], values: Vec<Vec<u8>>, pos: usize) -> Result<()> {
        match self.build_subpage(&values)? {
            Some(subpage) => {
                let node = NodeBuilder::leaf(key, &subpage, NodeFlags::DUP);
                self.swap_current_node(key, &node)?;
                self.dup = DupState::Inline { idx: pos };
            }
            None => {
                let desc = self.spill_to_subtree(&values)?;
                let node =
                    NodeBuilder::leaf(key, &desc.to_bytes(), NodeFlags::DUP | NodeFlags::SUBTREE);
                self.swap_current_node(key, &node)?;
                // land the dup cursor on the added value
                self.dup_seek(&values[pos].clone(), true)?;
            }
        }
        Ok(())
    }

    /// Compose an exact-size inline sub-page, or `None` when the values
    /// exceed the inline limit
    fn build_subpage(&self, values: &[Vec<u8>]) -> Result<Option<Vec<u8>>> {
        let limits = self.txn.env().limits;
        let dupfix = self.db_flags.contains(DbFlags::DUP_FIXED);
        let size = if dupfix {
            PAGE_HEADER_SIZE + values.len() * values[0].len()
        } else {
            PAGE_HEADER_SIZE
                + values
                    .iter()
                    .map(|v| 2 + align2(NODE_HEADER_SIZE + v.len()))
                    .sum::<usize>()
        };
        if size > limits.subpage_max {
            return Ok(None);
        }
        let mut buf = PageBuf::zeroed(size);
        let mut flags = PageFlags::LEAF | PageFlags::SUB;
        if dupfix {
            flags |= PageFlags::DUPFIX;
        }
        let mut page = PageMut::new(buf.as_bytes_mut())?;
        page.reinit(Pgno(0), flags, self.txn.id());
        if dupfix {
            page.set_dupfix_ksize(values[0].len() as u16);
            for (i, value) in values.iter().enumerate() {
                page.dupfix_insert(i, value)?;
            }
        } else {
            for (i, value) in values.iter().enumerate() {
                page.insert_entry(i, &NodeBuilder::leaf(value, b"", NodeFlags::empty()))?;
            }
        }
        Ok(Some(buf.as_bytes().to_vec()))
    }

    /// Move `values` (sorted) into a fresh sub-tree leaf
    fn spill_to_subtree(&self, values: &[Vec<u8>]) -> Result<TreeDesc> {
        let flags = sub_tree_flags(self.db_flags);
        let dupfix = flags.contains(DbFlags::DUP_FIXED);
        let stride = if dupfix { values[0].len() } else { 0 };
        let mut page_flags = PageFlags::LEAF;
        if dupfix {
            page_flags |= PageFlags::DUPFIX;
        }
        let root = self.txn.alloc_page(1)?;
        let txnid = self.txn.id();
        self.txn.with_dirty(root, |p| {
            p.reinit(root, page_flags, txnid);
            if dupfix {
                p.set_dupfix_ksize(stride as u16);
                for (i, value) in values.iter().enumerate() {
                    p.dupfix_insert(i, value)?;
                }
            } else {
                for (i, value) in values.iter().enumerate() {
                    p.insert_entry(i, &NodeBuilder::leaf(value, b"", NodeFlags::empty()))?;
                }
            }
            Ok(())
        })?;
        Ok(TreeDesc {
            flags: flags.persistent(),
            height: 1,
            dupfix_size: stride as u32,
            root,
            branch_pages: 0,
            leaf_pages: 1,
            large_pages: 0,
            sequence: 0,
            items: values.len() as u64,
            mod_txnid: txnid,
        })
    }

    /// Insert into the nested sub-tree of the current node; false means
    /// the value was already there
    fn subtree_put(&mut self, key: &[u8], value: &[u8], no_dup: bool, append: bool) -> Result<bool> {
        let mut desc = TreeDesc::read(&self.node_value_area()?)?;
        if self.db_flags.contains(DbFlags::DUP_FIXED) && desc.dupfix_size as usize != value.len() {
            return Err(StoreError::bad_val_size(value.len(), desc.dupfix_size as usize));
        }
        let dupfix = desc.db_flags().contains(DbFlags::DUP_FIXED);
        let mut stack = Vec::new();

        let (found, at_end) = {
            let mut ctx = TreeCtx {
                stack: &mut stack,
                desc: &mut desc,
                cmp: self.dup_cmp,
            };
            match ops::search(self.txn, &mut ctx, value)? {
                Some(SearchResult::Found(_)) => (true, false),
                Some(SearchResult::NotFound(idx)) => {
                    let leaf = ctx.stack.last().unwrap();
                    (false, idx == leaf.count && ctx.stack.iter().all(|l| l.idx + 1 >= l.count))
                }
                None => return Err(StoreError::corrupted("empty duplicate sub-tree")),
            }
        };
        if found {
            if no_dup {
                return Err(StoreError::KeyExists);
            }
            self.dup = DupState::Tree { desc, stack };
            return Ok(false);
        }
        if append && !at_end {
            return Err(StoreError::KeyExists);
        }

        {
            let mut ctx = TreeCtx {
                stack: &mut stack,
                desc: &mut desc,
                cmp: self.dup_cmp,
            };
            ops::touch(self.txn, &mut ctx)?;
            let node;
            let entry = if dupfix {
                Entry::Fixed(value)
            } else {
                node = NodeBuilder::leaf(value, b"", NodeFlags::empty());
                Entry::Node(&node)
            };
            let split = ops::insert(self.txn, &mut ctx, entry)?;
            if split {
                match ops::search(self.txn, &mut ctx, value)? {
                    Some(SearchResult::Found(_)) => {}
                    _ => return Err(StoreError::corrupted("duplicate vanished after split")),
                }
            }
        }
        desc.items += 1;
        desc.mod_txnid = self.txn.id();
        self.write_sub_desc(&desc)?;
        self.dup = DupState::Tree { desc, stack };
        Ok(true)
    }

    /// Write the nested tree's descriptor back into the owning node
    fn write_sub_desc(&self, desc: &TreeDesc) -> Result<()> {
        let leaf = self.leaf()?;
        self.txn
            .with_dirty(leaf.pgno, |p| p.write_value_in_place(leaf.idx, &desc.to_bytes()))
    }

    /// `CURRENT`-flag replacement of the duplicate under the cursor; the
    /// replacement must sort identically, which for duplicates means the
    /// same bytes, so this only validates
    pub(crate) fn dup_replace_current(&mut self, value: &[u8]) -> Result<()> {
        let current = self.current_value()?;
        if (self.dup_cmp)(&current, value) != Ordering::Equal {
            return Err(StoreError::Incompatible(
                "current-replace must keep the duplicate's sort position",
            ));
        }
        Ok(())
    }

    /// Remove the duplicate under the cursor from an inline sub-page or a
    /// sub-tree, collapsing back to a single-value node at one survivor.
    /// The caller already touched the path and adjusts `items`.
    pub(crate) fn dup_del(&mut self) -> Result<()> {
        let key = self.last_key.clone();
        let deleted = self.cur_dup.clone();
        match std::mem::replace(&mut self.dup, DupState::None) {
            DupState::None => Err(StoreError::Invalid("no duplicate to delete")),
            DupState::Inline { idx } => {
                let area = self.node_value_area()?;
                let view = PageView::new(&area)?;
                let n = view.entries();
                let mut values: Vec<Vec<u8>> = Vec::with_capacity(n - 1);
                for i in 0..n {
                    if i != idx {
                        values.push(view.key(i)?.to_vec());
                    }
                }
                if values.len() == 1 {
                    // back to a single-value node
                    let node = NodeBuilder::leaf(&key, &values[0], NodeFlags::empty());
                    self.swap_current_node(&key, &node)?;
                    self.dup = DupState::None;
                    self.cur_dup = values[0].clone();
                    self.after_delete = idx == 0;
                } else {
                    let subpage = self
                        .build_subpage(&values)?
                        .ok_or_else(|| StoreError::corrupted("shrunken sub-page does not fit"))?;
                    let node = NodeBuilder::leaf(&key, &subpage, NodeFlags::DUP);
                    self.swap_current_node(&key, &node)?;
                    if idx < values.len() {
                        self.dup = DupState::Inline { idx };
                        let area = self.node_value_area()?;
                        self.cur_dup = PageView::new(&area)?.key(idx)?.to_vec();
                        self.after_delete = true;
                    } else {
                        self.dup = DupState::Inline { idx: values.len() - 1 };
                        let area = self.node_value_area()?;
                        self.cur_dup =
                            PageView::new(&area)?.key(values.len() - 1)?.to_vec();
                    }
                }
                Ok(())
            }
            DupState::Tree { mut desc, mut stack } => {
                {
                    let mut ctx = TreeCtx {
                        stack: &mut stack,
                        desc: &mut desc,
                        cmp: self.dup_cmp,
                    };
                    ops::touch(self.txn, &mut ctx)?;
                    ops::delete(self.txn, &mut ctx)?;
                }
                desc.items = desc.items.saturating_sub(1);
                desc.mod_txnid = self.txn.id();

                if desc.items == 1 {
                    // one survivor: read it, free the sub-tree, inline it
                    let survivor = {
                        let mut ctx = TreeCtx {
                            stack: &mut stack,
                            desc: &mut desc,
                            cmp: self.dup_cmp,
                        };
                        if !ops::descend_edge(self.txn, &mut ctx, Edge::First)? {
                            return Err(StoreError::corrupted("sub-tree lost its last value"));
                        }
                        let level = *ctx.stack.last().unwrap();
                        let page = self.txn.page(level.pgno)?;
                        PageView::new(&page)?.key(level.idx)?.to_vec()
                    };
                    ops::free_tree(self.txn, &desc, false)?;
                    let node = NodeBuilder::leaf(&key, &survivor, NodeFlags::empty());
                    self.swap_current_node(&key, &node)?;
                    self.dup = DupState::None;
                    self.after_delete = (self.dup_cmp)(&deleted, &survivor) == Ordering::Less;
                    self.cur_dup = survivor;
                    return Ok(());
                }

                self.write_sub_desc(&desc)?;
                // sit on the successor duplicate, if any
                let positioned = {
                    let mut ctx = TreeCtx {
                        stack: &mut stack,
                        desc: &mut desc,
                        cmp: self.dup_cmp,
                    };
                    match ops::search(self.txn, &mut ctx, &deleted)? {
                        Some(SearchResult::Found(_)) => true,
                        Some(SearchResult::NotFound(idx)) => {
                            let count = ctx.stack.last().map(|l| l.count).unwrap_or(0);
                            idx < count || ops::next_leaf(self.txn, &mut ctx)?
                        }
                        None => false,
                    }
                };
                if positioned {
                    let level = *stack.last().unwrap();
                    let page = self.txn.page(level.pgno)?;
                    self.cur_dup = PageView::new(&page)?.key(level.idx)?.to_vec();
                    drop(page);
                    self.dup = DupState::Tree { desc, stack };
                    self.after_delete = true;
                } else {
                    // removed the greatest duplicate; stand on the new last
                    {
                        let mut ctx = TreeCtx {
                            stack: &mut stack,
                            desc: &mut desc,
                            cmp: self.dup_cmp,
                        };
                        ops::descend_edge(self.txn, &mut ctx, Edge::Last)?;
                    }
                    let level = *stack.last().unwrap();
                    let page = self.txn.page(level.pgno)?;
                    self.cur_dup = PageView::new(&page)?.key(level.idx)?.to_vec();
                    drop(page);
                    self.dup = DupState::Tree { desc, stack };
                }
                Ok(())
            }
        }
    }

    /// Swap in a rebuilt node for the current entry, splitting the leaf
    /// when the replacement no longer fits
    pub(crate) fn swap_current_node(&mut self, key: &[u8], node: &[u8]) -> Result<()> {
        let leaf = self.leaf()?;
        let fitted = self.txn.with_dirty(leaf.pgno, |p| {
            if p.ensure_gap(node.len())? {
                p.replace_entry(leaf.idx, node)?;
                Ok(true)
            } else {
                p.remove_entry(leaf.idx)?;
                Ok(false)
            }
        })?;
        if fitted {
            return Ok(());
        }
        let mut desc = self.txn.tree(self.dbi)?;
        let split = {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::insert(self.txn, &mut ctx, Entry::Node(node))?
        };
        self.txn.set_tree(self.dbi, desc);
        if split {
            self.reseek_exact(key)?;
        }
        Ok(())
    }
}
