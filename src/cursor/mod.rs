//! Cursors: stateful navigation and mutation of one tree.
//!
//! A cursor keeps a bounded stack of `(pgno, index, expected-count)`
//! levels. Page numbers, not pointers, are cached, so remaps cost
//! nothing; before every operation the stack is checked against the
//! tree's current root and the leaf's entry count, and rebuilt from the
//! saved position when a sibling cursor moved things underneath it.

mod dup;
pub(crate) mod ops;

pub(crate) use ops::Level;

use crate::error::{Result, StoreError};
use crate::page::{NodeBuilder, PageView, SearchResult, PAGE_HEADER_SIZE};
use crate::tree::{for_dups, for_keys, Cmp, TreeDesc};
use crate::txn::{Txn, ValueLocation, LARGE_PAYLOAD_OFFSET};
use crate::types::{DbFlags, NodeFlags, Pgno, PutFlags};
use dup::DupState;
use ops::{Edge, Entry, TreeCtx, ValueKind};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
    Unset,
    At,
    Eof,
}

/// A cursor over one tree of a transaction.
pub struct Cursor<'t, 'env> {
    txn: &'t Txn<'env>,
    dbi: usize,
    db_flags: DbFlags,
    key_cmp: Cmp,
    dup_cmp: Cmp,
    stack: Vec<Level>,
    state: Pos,
    after_delete: bool,
    dup: DupState,
    last_key: Vec<u8>,
    cur_dup: Vec<u8>,
}

impl<'t, 'env> Cursor<'t, 'env> {
    pub(crate) fn new(txn: &'t Txn<'env>, dbi: usize) -> Result<Self> {
        txn.materialize_tree(dbi)?;
        let desc = txn.tree(dbi)?;
        let flags = desc.db_flags();
        Ok(Self {
            txn,
            dbi,
            db_flags: flags,
            key_cmp: for_keys(flags),
            dup_cmp: for_dups(flags),
            stack: Vec::new(),
            state: Pos::Unset,
            after_delete: false,
            dup: DupState::None,
            last_key: Vec::new(),
            cur_dup: Vec::new(),
        })
    }

    fn is_dupsort(&self) -> bool {
        self.db_flags.contains(DbFlags::DUP_SORT)
    }

    // --- stack freshness ---------------------------------------------------

    /// Rebuild the stack from the saved position if a sibling cursor (or a
    /// remap-triggering operation) changed the tree underneath us.
    fn refresh(&mut self) -> Result<()> {
        self.txn.check_active()?;
        if self.state != Pos::At {
            return Ok(());
        }
        let desc = self.txn.tree(self.dbi)?;
        let mut stale = self.stack.is_empty() || self.stack[0].pgno != desc.root;
        if !stale {
            let leaf = *self.stack.last().unwrap();
            let entries = {
                let page = self.txn.page(leaf.pgno)?;
                PageView::new(&page)?.entries()
            };
            stale = entries != leaf.count || leaf.idx >= entries;
        }
        if !stale {
            return Ok(());
        }

        let key = std::mem::take(&mut self.last_key);
        let dup_value = std::mem::take(&mut self.cur_dup);
        let mut desc = desc;
        let result = {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::search(self.txn, &mut ctx, &key)?
        };
        match result {
            None => {
                self.state = Pos::Eof;
                self.dup = DupState::None;
            }
            Some(SearchResult::Found(_)) => {
                self.state = Pos::At;
                self.last_key = key;
                if self.is_dupsort() && !dup_value.is_empty() {
                    if self.dup_seek(&dup_value, true)?.is_none() {
                        // our duplicate is gone; sit on its successor and
                        // let the next advance return it
                        if self.dup_seek(&dup_value, false)?.is_some() {
                            self.after_delete = true;
                        } else {
                            self.load_dup(Edge::Last)?;
                        }
                    }
                } else {
                    self.load_dup(Edge::First)?;
                }
            }
            Some(SearchResult::NotFound(idx)) => {
                // our entry is gone; sit on its successor and let the next
                // advance return it
                let leaf = self.stack.last().unwrap();
                if idx < leaf.count {
                    self.state = Pos::At;
                    self.after_delete = true;
                    self.save_position(Edge::First)?;
                } else {
                    let advanced = {
                        let mut ctx = TreeCtx {
                            stack: &mut self.stack,
                            desc: &mut desc,
                            cmp: self.key_cmp,
                        };
                        ops::next_leaf(self.txn, &mut ctx)?
                    };
                    if advanced {
                        self.state = Pos::At;
                        self.after_delete = true;
                        self.save_position(Edge::First)?;
                    } else {
                        self.state = Pos::Eof;
                        self.dup = DupState::None;
                    }
                }
            }
        }
        Ok(())
    }

    // --- current entry access ----------------------------------------------

    fn leaf(&self) -> Result<Level> {
        self.stack
            .last()
            .copied()
            .ok_or(StoreError::Invalid("cursor is not positioned"))
    }

    /// Read the current entry's key bytes
    fn current_key(&self) -> Result<Vec<u8>> {
        let leaf = self.leaf()?;
        let page = self.txn.page(leaf.pgno)?;
        let view = PageView::new(&page)?;
        Ok(view.key(leaf.idx)?.to_vec())
    }

    /// What the current node's value area holds
    fn current_kind(&self) -> Result<ValueKind> {
        let leaf = self.leaf()?;
        let page = self.txn.page(leaf.pgno)?;
        let view = PageView::new(&page)?;
        if view.is_dupfix() {
            return Ok(ValueKind::Plain);
        }
        Ok(ops::value_kind(view.node(leaf.idx)?.flags()))
    }

    /// Record key (and initial duplicate position) for the current entry
    fn save_position(&mut self, edge: Edge) -> Result<()> {
        self.last_key = self.current_key()?;
        self.load_dup(edge)?;
        Ok(())
    }

    /// Current (key, value), honoring the duplicate position
    fn current_pair(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.current_key()?;
        let value = self.current_value()?;
        Ok((key, value))
    }

    // --- navigation --------------------------------------------------------

    /// Position at the first entry
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.txn.check_active()?;
        self.move_to_edge(Edge::First)
    }

    /// Position at the last entry
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.txn.check_active()?;
        self.move_to_edge(Edge::Last)
    }

    fn move_to_edge(&mut self, edge: Edge) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut desc = self.txn.tree(self.dbi)?;
        self.after_delete = false;
        let non_empty = {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::descend_edge(self.txn, &mut ctx, edge)?
        };
        if !non_empty {
            self.state = Pos::Eof;
            self.dup = DupState::None;
            return Ok(None);
        }
        self.state = Pos::At;
        self.save_position(edge)?;
        self.current_pair().map(Some)
    }

    /// Advance to the next entry (next duplicate first for DUPSORT)
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.state {
            Pos::Unset => return self.first(),
            Pos::Eof => return Ok(None),
            Pos::At => {}
        }
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        if self.after_delete {
            // deletion already moved us onto the successor
            self.after_delete = false;
            return self.current_pair().map(Some);
        }
        if self.is_dupsort() {
            if let Some(value) = self.dup_next()? {
                self.cur_dup = value.clone();
                return Ok(Some((self.last_key.clone(), value)));
            }
        }
        self.advance_key(Edge::First)
    }

    /// Step back to the previous entry (previous duplicate first)
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.state {
            Pos::Unset | Pos::Eof => return self.last(),
            Pos::At => {}
        }
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.after_delete = false;
        if self.is_dupsort() {
            if let Some(value) = self.dup_prev()? {
                self.cur_dup = value.clone();
                return Ok(Some((self.last_key.clone(), value)));
            }
        }
        self.retreat_key(Edge::Last)
    }

    /// Advance to the first duplicate of the next key
    pub fn next_nodup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.state {
            Pos::Unset => return self.first(),
            Pos::Eof => return Ok(None),
            Pos::At => {}
        }
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.after_delete = false;
        self.advance_key(Edge::First)
    }

    /// Step back to the last duplicate of the previous key
    pub fn prev_nodup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.state {
            Pos::Unset | Pos::Eof => return self.last(),
            Pos::At => {}
        }
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.after_delete = false;
        self.retreat_key(Edge::Last)
    }

    /// Position at the first duplicate of the current key
    pub fn first_dup(&mut self) -> Result<Option<Vec<u8>>> {
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.after_delete = false;
        self.load_dup(Edge::First)?;
        self.current_value().map(Some)
    }

    /// Position at the last duplicate of the current key
    pub fn last_dup(&mut self) -> Result<Option<Vec<u8>>> {
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.after_delete = false;
        self.load_dup(Edge::Last)?;
        self.current_value().map(Some)
    }

    /// Advance within the current key's duplicates only
    pub fn next_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.after_delete = false;
        match self.dup_next()? {
            Some(value) => {
                self.cur_dup = value.clone();
                Ok(Some((self.last_key.clone(), value)))
            }
            None => Ok(None),
        }
    }

    /// Step back within the current key's duplicates only
    pub fn prev_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.after_delete = false;
        match self.dup_prev()? {
            Some(value) => {
                self.cur_dup = value.clone();
                Ok(Some((self.last_key.clone(), value)))
            }
            None => Ok(None),
        }
    }

    fn advance_key(&mut self, dup_edge: Edge) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut desc = self.txn.tree(self.dbi)?;
        let leaf = self.leaf()?;
        let moved = if leaf.idx + 1 < leaf.count {
            self.stack.last_mut().unwrap().idx += 1;
            true
        } else {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::next_leaf(self.txn, &mut ctx)?
        };
        if !moved {
            self.state = Pos::Eof;
            self.dup = DupState::None;
            return Ok(None);
        }
        self.save_position(dup_edge)?;
        self.current_pair().map(Some)
    }

    fn retreat_key(&mut self, dup_edge: Edge) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut desc = self.txn.tree(self.dbi)?;
        let leaf = self.leaf()?;
        let moved = if leaf.idx > 0 {
            self.stack.last_mut().unwrap().idx -= 1;
            true
        } else {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::prev_leaf(self.txn, &mut ctx)?
        };
        if !moved {
            self.state = Pos::Eof;
            self.dup = DupState::None;
            return Ok(None);
        }
        self.save_position(dup_edge)?;
        self.current_pair().map(Some)
    }

    // --- targeted positioning ----------------------------------------------

    fn seek(&mut self, key: &[u8]) -> Result<Option<SearchResult>> {
        self.txn.check_active()?;
        self.after_delete = false;
        let mut desc = self.txn.tree(self.dbi)?;
        let mut ctx = TreeCtx {
            stack: &mut self.stack,
            desc: &mut desc,
            cmp: self.key_cmp,
        };
        ops::search(self.txn, &mut ctx, key)
    }

    /// Position at `key` exactly. Returns whether it is present.
    pub fn set(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.set_key(key)?.is_some())
    }

    /// Position at `key` exactly and return its value (the first
    /// duplicate for DUPSORT)
    pub fn set_key(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.seek(key)? {
            Some(SearchResult::Found(_)) => {
                self.state = Pos::At;
                self.save_position(Edge::First)?;
                self.current_value().map(Some)
            }
            _ => {
                self.state = Pos::Unset;
                self.dup = DupState::None;
                Ok(None)
            }
        }
    }

    /// Position at the first key not less than `key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.seek(key)? {
            None => {
                self.state = Pos::Eof;
                Ok(None)
            }
            Some(SearchResult::Found(_)) => {
                self.state = Pos::At;
                self.save_position(Edge::First)?;
                self.current_pair().map(Some)
            }
            Some(SearchResult::NotFound(idx)) => {
                let count = self.stack.last().map(|l| l.count).unwrap_or(0);
                if idx < count {
                    self.state = Pos::At;
                    self.save_position(Edge::First)?;
                    return self.current_pair().map(Some);
                }
                let mut desc = self.txn.tree(self.dbi)?;
                let advanced = {
                    let mut ctx = TreeCtx {
                        stack: &mut self.stack,
                        desc: &mut desc,
                        cmp: self.key_cmp,
                    };
                    ops::next_leaf(self.txn, &mut ctx)?
                };
                if !advanced {
                    self.state = Pos::Eof;
                    return Ok(None);
                }
                self.state = Pos::At;
                self.save_position(Edge::First)?;
                self.current_pair().map(Some)
            }
        }
    }

    /// Position at the exact key/value pair of a DUPSORT tree
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.is_dupsort() {
            return Err(StoreError::Incompatible("get-both needs a DUPSORT tree"));
        }
        if self.set_key(key)?.is_none() {
            return Ok(None);
        }
        self.dup_seek(value, true)
    }

    /// Position at `key` and its first duplicate not less than `value`
    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.is_dupsort() {
            return Err(StoreError::Incompatible("get-both needs a DUPSORT tree"));
        }
        if self.set_key(key)?.is_none() {
            return Ok(None);
        }
        self.dup_seek(value, false)
    }

    /// First pair not less than `(key, value)`; without `value` this is
    /// `set_range`
    pub fn set_lowerbound(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some((found_key, found_value)) = self.set_range(key)? else {
            return Ok(None);
        };
        let (Some(value), true) = (value, self.is_dupsort()) else {
            return Ok(Some((found_key, found_value)));
        };
        if found_key != key {
            return Ok(Some((found_key, found_value)));
        }
        match self.dup_seek(value, false)? {
            Some(dup) => Ok(Some((found_key, dup))),
            // all duplicates of this key sort below `value`
            None => self.next_nodup(),
        }
    }

    /// First pair strictly greater than `(key, value)`
    pub fn set_upperbound(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some((found_key, found_value)) = self.set_lowerbound(key, value)? else {
            return Ok(None);
        };
        let key_equal = (self.key_cmp)(&found_key, key) == Ordering::Equal;
        let exact = match (value, self.is_dupsort()) {
            (Some(value), true) => {
                key_equal && (self.dup_cmp)(&found_value, value) == Ordering::Equal
            }
            _ => key_equal,
        };
        if exact {
            return self.next();
        }
        Ok(Some((found_key, found_value)))
    }

    /// The entry the cursor is positioned on
    pub fn current(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.refresh()?;
        if self.state != Pos::At {
            return Ok(None);
        }
        self.current_pair().map(Some)
    }

    /// Number of duplicate values stored for the current key
    pub fn count(&mut self) -> Result<u64> {
        self.refresh()?;
        if self.state != Pos::At {
            return Err(StoreError::Invalid("cursor is not positioned"));
        }
        self.dup_count()
    }

    // --- writes ------------------------------------------------------------

    /// Store `value` under `key`
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        self.put_located(key, value, flags).map(|_| ())
    }

    pub(crate) fn put_located(
        &mut self,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
    ) -> Result<Option<ValueLocation>> {
        self.txn.require_write()?;
        let limits = self.txn.env().limits;
        let dupsort = self.is_dupsort();

        if key.is_empty() || key.len() > limits.key_max {
            return Err(StoreError::bad_key_size(key.len(), limits.key_max));
        }
        if self.db_flags.contains(DbFlags::INTEGER_KEY) && key.len() != 4 && key.len() != 8 {
            return Err(StoreError::bad_key_size(key.len(), 8));
        }
        if dupsort {
            if NodeBuilder::leaf_size(key.len(), value.len()) > limits.leaf_node_max {
                return Err(StoreError::bad_val_size(value.len(), limits.key_max));
            }
            if self.db_flags.contains(DbFlags::INTEGER_DUP)
                && value.len() != 4
                && value.len() != 8
            {
                return Err(StoreError::bad_val_size(value.len(), 8));
            }
            if flags.contains(PutFlags::RESERVE) {
                return Err(StoreError::Incompatible("reserve does not work with DUPSORT"));
            }
        } else if value.len() > limits.val_max {
            return Err(StoreError::bad_val_size(value.len(), limits.val_max));
        }

        if flags.contains(PutFlags::CURRENT) {
            self.refresh()?;
            if self.state != Pos::At {
                return Err(StoreError::Invalid("no current entry to replace"));
            }
            let current = self.current_key()?;
            if current != key {
                return Err(StoreError::KeyNotFound);
            }
            return self.overwrite(value, flags);
        }

        let mut desc = self.txn.tree(self.dbi)?;
        self.after_delete = false;

        // position: appends go straight to the right edge
        let found = if flags.intersects(PutFlags::APPEND | PutFlags::APPEND_DUP) {
            let non_empty = {
                let mut ctx = TreeCtx {
                    stack: &mut self.stack,
                    desc: &mut desc,
                    cmp: self.key_cmp,
                };
                ops::descend_edge(self.txn, &mut ctx, Edge::Last)?
            };
            if non_empty {
                let last_key = self.current_key()?;
                match (self.key_cmp)(key, &last_key) {
                    Ordering::Less => return Err(StoreError::KeyExists),
                    Ordering::Equal => true,
                    Ordering::Greater => {
                        let leaf = self.stack.last_mut().unwrap();
                        leaf.idx = leaf.count;
                        false
                    }
                }
            } else {
                false
            }
        } else {
            match self.seek(key)? {
                Some(SearchResult::Found(_)) => true,
                Some(SearchResult::NotFound(_)) => false,
                None => false,
            }
        };

        if found {
            self.state = Pos::At;
            self.last_key = key.to_vec();
            if dupsort {
                if flags.contains(PutFlags::NO_OVERWRITE) {
                    return Err(StoreError::KeyExists);
                }
                {
                    let mut ctx = TreeCtx {
                        stack: &mut self.stack,
                        desc: &mut desc,
                        cmp: self.key_cmp,
                    };
                    ops::touch(self.txn, &mut ctx)?;
                }
                self.txn.set_tree(self.dbi, desc);
                self.dup_put(key, value, flags)?;
                return Ok(None);
            }
            if flags.contains(PutFlags::NO_OVERWRITE) {
                return Err(StoreError::KeyExists);
            }
            {
                let mut ctx = TreeCtx {
                    stack: &mut self.stack,
                    desc: &mut desc,
                    cmp: self.key_cmp,
                };
                ops::touch(self.txn, &mut ctx)?;
            }
            self.txn.set_tree(self.dbi, desc);
            return self.overwrite(value, flags);
        }

        // fresh key
        if desc.is_empty() {
            let root = self.txn.alloc_page(1)?;
            let txnid = self.txn.id();
            self.txn.with_dirty(root, |p| {
                p.reinit(root, crate::types::PageFlags::LEAF, txnid);
                Ok(())
            })?;
            desc.root = root;
            desc.height = 1;
            desc.leaf_pages = 1;
            self.stack.clear();
            self.stack.push(Level {
                pgno: root,
                idx: 0,
                count: 0,
            });
        } else {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::touch(self.txn, &mut ctx)?;
        }

        let (node, big_chain) = self.build_leaf_node(key, value, &mut desc)?;
        let split = {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::insert(self.txn, &mut ctx, Entry::Node(&node))?
        };
        desc.items += 1;
        self.txn.set_tree(self.dbi, desc);

        if split {
            self.reseek_exact(key)?;
        }
        self.state = Pos::At;
        self.last_key = key.to_vec();
        self.dup = DupState::None;
        if dupsort {
            self.cur_dup = value.to_vec();
        }

        if flags.contains(PutFlags::RESERVE) {
            return self.value_location(big_chain);
        }
        Ok(None)
    }

    /// Build the node image for a fresh value, spilling big values to an
    /// overflow chain
    fn build_leaf_node(
        &self,
        key: &[u8],
        value: &[u8],
        desc: &mut TreeDesc,
    ) -> Result<(Vec<u8>, Option<Pgno>)> {
        let limits = self.txn.env().limits;
        if NodeBuilder::leaf_size(key.len(), value.len()) > limits.leaf_node_max {
            let (chain, npages) = ops::write_overflow(self.txn, value)?;
            desc.large_pages += npages;
            Ok((NodeBuilder::big_leaf(key, value.len(), chain), Some(chain)))
        } else {
            Ok((
                NodeBuilder::leaf(key, value, NodeFlags::empty()),
                None,
            ))
        }
    }

    /// Where the current entry's value bytes live in the dirty set
    fn value_location(&self, big_chain: Option<Pgno>) -> Result<Option<ValueLocation>> {
        if let Some(chain) = big_chain {
            return Ok(Some(ValueLocation {
                pgno: chain,
                offset: LARGE_PAYLOAD_OFFSET,
            }));
        }
        let leaf = self.leaf()?;
        let page = self.txn.page(leaf.pgno)?;
        let view = PageView::new(&page)?;
        let node = view.node(leaf.idx)?;
        let offset = PAGE_HEADER_SIZE
            + view.entry_offset(leaf.idx)
            + crate::page::NODE_HEADER_SIZE
            + node.key_size();
        Ok(Some(ValueLocation {
            pgno: leaf.pgno,
            offset,
        }))
    }

    /// Replace the value of the entry the cursor sits on (path touched)
    fn overwrite(&mut self, value: &[u8], flags: PutFlags) -> Result<Option<ValueLocation>> {
        let mut desc = self.txn.tree(self.dbi)?;
        {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::touch(self.txn, &mut ctx)?;
        }
        let leaf = self.leaf()?;
        let key = self.current_key()?;
        let limits = self.txn.env().limits;

        if self.is_dupsort() {
            match self.current_kind()? {
                ValueKind::Plain => {
                    let stored = {
                        let page = self.txn.page(leaf.pgno)?;
                        PageView::new(&page)?.node(leaf.idx)?.value_area()?.to_vec()
                    };
                    if (self.dup_cmp)(&stored, value) != Ordering::Equal {
                        return Err(StoreError::Incompatible(
                            "current-replace must keep the duplicate's sort position",
                        ));
                    }
                    self.txn.set_tree(self.dbi, desc);
                    return self.replace_plain_value(leaf, &key, value);
                }
                _ => {
                    self.txn.set_tree(self.dbi, desc);
                    return self.dup_replace_current(value).map(|_| None);
                }
            }
        }

        let kind = self.current_kind()?;
        let new_is_big = NodeBuilder::leaf_size(key.len(), value.len()) > limits.leaf_node_max;

        if kind == ValueKind::Big {
            let (old_len, chain) = {
                let page = self.txn.page(leaf.pgno)?;
                let node = PageView::new(&page)?.node(leaf.idx)?;
                (node.data_size(), node.overflow_pgno()?)
            };
            let old_npages = limits.overflow_pages(old_len);
            let new_npages = limits.overflow_pages(value.len());
            let no_old_readers = self.txn.env().lock.oldest(self.txn.id()) >= self.txn.id();
            if new_is_big && new_npages == old_npages && (no_old_readers || self.txn.is_dirty(chain)) {
                // same chain length: overwrite the pages in place
                self.txn.adopt_page_in_place(chain, old_npages as usize)?;
                self.txn.with_dirty(chain, |p| {
                    let bytes = p.raw_bytes_mut();
                    bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + value.len()]
                        .copy_from_slice(value);
                    Ok(())
                })?;
                let node = NodeBuilder::big_leaf(&key, value.len(), chain);
                self.txn.with_dirty(leaf.pgno, |p| p.replace_entry(leaf.idx, &node))?;
                self.txn.set_tree(self.dbi, desc);
                if flags.contains(PutFlags::RESERVE) {
                    return self.value_location(Some(chain));
                }
                return Ok(None);
            }
            let freed = ops::free_overflow(self.txn, chain)?;
            desc.large_pages = desc.large_pages.saturating_sub(freed);
        }

        if kind == ValueKind::Plain && !new_is_big {
            let same_len = {
                let page = self.txn.page(leaf.pgno)?;
                PageView::new(&page)?.node(leaf.idx)?.stored_value_len() == value.len()
            };
            if same_len {
                self.txn
                    .with_dirty(leaf.pgno, |p| p.write_value_in_place(leaf.idx, value))?;
                self.txn.set_tree(self.dbi, desc);
                if flags.contains(PutFlags::RESERVE) {
                    return self.value_location(None);
                }
                return Ok(None);
            }
        }

        self.txn.set_tree(self.dbi, desc);
        let location = self.replace_plain_value(leaf, &key, value)?;
        if flags.contains(PutFlags::RESERVE) {
            return Ok(location);
        }
        Ok(None)
    }

    /// Swap in a freshly built node for the current entry, splitting when
    /// it no longer fits its page
    fn replace_plain_value(
        &mut self,
        leaf: Level,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<ValueLocation>> {
        let mut desc = self.txn.tree(self.dbi)?;
        let (node, big_chain) = self.build_leaf_node(key, value, &mut desc)?;
        let fitted = self.txn.with_dirty(leaf.pgno, |p| {
            if p.ensure_gap(node.len())? {
                p.replace_entry(leaf.idx, &node)?;
                Ok(true)
            } else {
                p.remove_entry(leaf.idx)?;
                Ok(false)
            }
        })?;
        if !fitted {
            let split = {
                let mut ctx = TreeCtx {
                    stack: &mut self.stack,
                    desc: &mut desc,
                    cmp: self.key_cmp,
                };
                ops::insert(self.txn, &mut ctx, Entry::Node(&node))?
            };
            self.txn.set_tree(self.dbi, desc);
            if split {
                self.reseek_exact(key)?;
            }
        } else {
            self.txn.set_tree(self.dbi, desc);
        }
        self.value_location(big_chain)
    }

    /// Rebuild the stack onto `key`, which must exist
    fn reseek_exact(&mut self, key: &[u8]) -> Result<()> {
        match self.seek(key)? {
            Some(SearchResult::Found(_)) => {
                self.state = Pos::At;
                Ok(())
            }
            _ => Err(StoreError::corrupted("inserted key vanished after split")),
        }
    }

    /// Delete the entry at the cursor. For DUPSORT, `all_dups` removes
    /// the whole key; otherwise only the current duplicate goes.
    pub fn del_current(&mut self, all_dups: bool) -> Result<()> {
        self.txn.require_write()?;
        self.refresh()?;
        if self.state != Pos::At {
            return Err(StoreError::Invalid("cursor is not positioned"));
        }
        let mut desc = self.txn.tree(self.dbi)?;
        {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::touch(self.txn, &mut ctx)?;
        }
        self.txn.set_tree(self.dbi, desc);

        let kind = self.current_kind()?;
        if kind == ValueKind::SubTree && !self.is_dupsort() {
            // a named-tree record; its pages are only released by drop
            return Err(StoreError::Incompatible("drop the named tree instead"));
        }
        if self.is_dupsort()
            && !all_dups
            && matches!(kind, ValueKind::InlineDup | ValueKind::SubTree)
        {
            self.dup_del()?;
            let mut desc = self.txn.tree(self.dbi)?;
            desc.items = desc.items.saturating_sub(1);
            self.txn.set_tree(self.dbi, desc);
            return Ok(());
        }

        // remove the whole entry, releasing whatever its value owns
        let mut desc = self.txn.tree(self.dbi)?;
        let removed = if self.is_dupsort() { self.dup_count()? } else { 1 };
        let leaf = self.leaf()?;
        match kind {
            ValueKind::Big => {
                let chain = {
                    let page = self.txn.page(leaf.pgno)?;
                    PageView::new(&page)?.node(leaf.idx)?.overflow_pgno()?
                };
                let freed = ops::free_overflow(self.txn, chain)?;
                desc.large_pages = desc.large_pages.saturating_sub(freed);
            }
            ValueKind::SubTree => {
                let sub = {
                    let page = self.txn.page(leaf.pgno)?;
                    TreeDesc::read(PageView::new(&page)?.node(leaf.idx)?.value_area()?)?
                };
                ops::free_tree(self.txn, &sub, false)?;
            }
            _ => {}
        }
        {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::delete(self.txn, &mut ctx)?;
        }
        desc.items = desc.items.saturating_sub(removed);
        self.txn.set_tree(self.dbi, desc);
        self.dup = DupState::None;
        self.reposition_after_delete()
    }

    /// After a removal, sit on the successor entry and arm `after_delete`
    /// so the next advance yields it
    fn reposition_after_delete(&mut self) -> Result<()> {
        let key = std::mem::take(&mut self.last_key);
        let mut desc = self.txn.tree(self.dbi)?;
        let result = {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut desc,
                cmp: self.key_cmp,
            };
            ops::search(self.txn, &mut ctx, &key)?
        };
        match result {
            None => {
                self.state = Pos::Eof;
                self.after_delete = false;
            }
            Some(SearchResult::Found(_)) => {
                // duplicates of the key survive
                self.state = Pos::At;
                self.after_delete = true;
                self.save_position(Edge::First)?;
            }
            Some(SearchResult::NotFound(idx)) => {
                let count = self.stack.last().map(|l| l.count).unwrap_or(0);
                let advanced = if idx < count {
                    true
                } else {
                    let mut ctx = TreeCtx {
                        stack: &mut self.stack,
                        desc: &mut desc,
                        cmp: self.key_cmp,
                    };
                    ops::next_leaf(self.txn, &mut ctx)?
                };
                if advanced {
                    self.state = Pos::At;
                    self.after_delete = true;
                    self.save_position(Edge::First)?;
                } else {
                    self.state = Pos::Eof;
                    self.after_delete = false;
                }
            }
        }
        Ok(())
    }

    // --- named-tree directory records ---------------------------------------

    /// Look up a named tree's descriptor in this (main) tree
    pub(crate) fn tree_record(&mut self, name: &[u8]) -> Result<Option<TreeDesc>> {
        match self.seek(name)? {
            Some(SearchResult::Found(_)) => {
                let leaf = self.leaf()?;
                let page = self.txn.page(leaf.pgno)?;
                let node = PageView::new(&page)?.node(leaf.idx)?;
                if !node.flags().contains(NodeFlags::SUBTREE) {
                    return Err(StoreError::Incompatible("entry is not a named tree"));
                }
                Ok(Some(TreeDesc::read(node.value_area()?)?))
            }
            _ => Ok(None),
        }
    }

    /// Write a named tree's descriptor into this (main) tree
    pub(crate) fn put_tree_record(&mut self, name: &[u8], desc: &TreeDesc) -> Result<()> {
        let bytes = desc.to_bytes();
        let node = NodeBuilder::leaf(name, &bytes, NodeFlags::SUBTREE);
        let mut main = self.txn.tree(self.dbi)?;

        let found = match self.seek(name)? {
            Some(SearchResult::Found(_)) => true,
            _ => false,
        };

        if main.is_empty() {
            let root = self.txn.alloc_page(1)?;
            let txnid = self.txn.id();
            self.txn.with_dirty(root, |p| {
                p.reinit(root, crate::types::PageFlags::LEAF, txnid);
                Ok(())
            })?;
            main.root = root;
            main.height = 1;
            main.leaf_pages = 1;
            self.stack.clear();
            self.stack.push(Level {
                pgno: root,
                idx: 0,
                count: 0,
            });
        } else {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut main,
                cmp: self.key_cmp,
            };
            ops::touch(self.txn, &mut ctx)?;
        }

        if found {
            let leaf = self.leaf()?;
            {
                let page = self.txn.page(leaf.pgno)?;
                let existing = PageView::new(&page)?.node(leaf.idx)?;
                if !existing.flags().contains(NodeFlags::SUBTREE) {
                    return Err(StoreError::Incompatible("name collides with a plain key"));
                }
            }
            // descriptors never change size, so this lands in place
            self.txn.with_dirty(leaf.pgno, |p| p.replace_entry(leaf.idx, &node))?;
            self.txn.set_tree(self.dbi, main);
            return Ok(());
        }

        let split = {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut main,
                cmp: self.key_cmp,
            };
            ops::insert(self.txn, &mut ctx, Entry::Node(&node))?
        };
        main.items += 1;
        self.txn.set_tree(self.dbi, main);
        if split {
            self.reseek_exact(name)?;
        }
        Ok(())
    }

    /// Remove a named tree's directory record without touching the pages
    /// it described (the caller freed them through its current state)
    pub(crate) fn del_tree_record(&mut self, name: &[u8]) -> Result<()> {
        match self.seek(name)? {
            Some(SearchResult::Found(_)) => {}
            _ => return Ok(()),
        }
        self.state = Pos::At;
        self.last_key = name.to_vec();
        let mut main = self.txn.tree(self.dbi)?;
        {
            let mut ctx = TreeCtx {
                stack: &mut self.stack,
                desc: &mut main,
                cmp: self.key_cmp,
            };
            ops::touch(self.txn, &mut ctx)?;
            ops::delete(self.txn, &mut ctx)?;
        }
        main.items = main.items.saturating_sub(1);
        self.txn.set_tree(self.dbi, main);
        self.state = Pos::Unset;
        Ok(())
    }

    /// Free every page of this cursor's tree (used by drop)
    pub(crate) fn free_whole_tree(&mut self) -> Result<()> {
        self.txn.require_write()?;
        let desc = self.txn.tree(self.dbi)?;
        ops::free_tree(self.txn, &desc, true)?;
        self.stack.clear();
        self.state = Pos::Unset;
        self.dup = DupState::None;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
