//! Tree mutation machinery shared by cursors and DUPSORT sub-cursors.
//!
//! Everything here operates on a [`TreeCtx`]: a page stack plus the tree
//! descriptor it navigates. The main cursor passes its own stack; a
//! duplicate sub-cursor passes the nested tree's. All page access funnels
//! through the transaction so dirty copies win transparently.

use crate::error::{Result, StoreError};
use crate::page::{
    NodeBuilder, NodeRef, PageHeader, PageMut, PageView, SearchResult, PAGE_HEADER_SIZE,
};
use crate::tree::{Cmp, TreeDesc};
use crate::txn::Txn;
use crate::types::{NodeFlags, PageFlags, Pgno, CURSOR_STACK_MAX};
use tracing::trace;

/// One level of a cursor's page stack
#[derive(Debug, Clone, Copy)]
pub(crate) struct Level {
    pub pgno: Pgno,
    pub idx: usize,
    /// Entry count observed when this level was built; a mismatch means a
    /// sibling cursor moved things and the stack must be rebuilt
    pub count: usize,
}

/// Which edge of the tree to walk to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    First,
    Last,
}

/// A tree being navigated: its stack and descriptor
pub(crate) struct TreeCtx<'a> {
    pub stack: &'a mut Vec<Level>,
    pub desc: &'a mut TreeDesc,
    pub cmp: Cmp,
}

/// What a leaf node's value area holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    /// The bytes themselves
    Plain,
    /// A u32 overflow page number; the real value is on a Large chain
    Big,
    /// An inline duplicate sub-page
    InlineDup,
    /// A 48-byte descriptor of a nested duplicate tree
    SubTree,
}

pub(crate) fn value_kind(flags: NodeFlags) -> ValueKind {
    if flags.contains(NodeFlags::DUP) {
        if flags.contains(NodeFlags::SUBTREE) {
            ValueKind::SubTree
        } else {
            ValueKind::InlineDup
        }
    } else if flags.contains(NodeFlags::BIG) {
        ValueKind::Big
    } else if flags.contains(NodeFlags::SUBTREE) {
        ValueKind::SubTree
    } else {
        ValueKind::Plain
    }
}

/// An entry to place into a page
pub(crate) enum Entry<'a> {
    /// A prebuilt node image
    Node(&'a [u8]),
    /// A fixed-stride key for a DUPFIX page
    Fixed(&'a [u8]),
}

impl Entry<'_> {
    fn len(&self) -> usize {
        match self {
            Entry::Node(bytes) | Entry::Fixed(bytes) => bytes.len(),
        }
    }
}

/// Raw image of entry `i` (its node, or its fixed key)
pub(crate) fn raw_entry(view: &PageView<'_>, i: usize) -> Result<Vec<u8>> {
    if view.is_dupfix() {
        return Ok(view.dupfix_key(i)?.to_vec());
    }
    let node = view.node(i)?;
    let off = PAGE_HEADER_SIZE + view.entry_offset(i);
    Ok(view.bytes()[off..off + node.stored_size()].to_vec())
}

fn image_key<'a>(image: &'a [u8], dupfix: bool) -> Result<&'a [u8]> {
    if dupfix {
        Ok(image)
    } else {
        Ok(NodeRef::parse(image)?.key())
    }
}

// --- descent ---------------------------------------------------------------

/// Descend from the root looking for `key`; fills the stack and returns
/// the leaf-level search result, or `None` for an empty tree.
pub(crate) fn search(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>, key: &[u8]) -> Result<Option<SearchResult>> {
    ctx.stack.clear();
    if ctx.desc.is_empty() {
        return Ok(None);
    }
    let mut pgno = ctx.desc.root;
    loop {
        if ctx.stack.len() >= CURSOR_STACK_MAX {
            return Err(StoreError::CursorFull);
        }
        let page = txn.page(pgno)?;
        let view = PageView::new(&page)?;
        let count = view.entries();
        if view.is_branch() {
            if count == 0 {
                return Err(StoreError::corrupted("empty branch page"));
            }
            let idx = view.branch_child_index(key, ctx.cmp)?;
            let child = view.node(idx)?.child();
            ctx.stack.push(Level { pgno, idx, count });
            pgno = child;
        } else {
            let result = view.search(key, ctx.cmp)?;
            ctx.stack.push(Level {
                pgno,
                idx: result.index(),
                count,
            });
            return Ok(Some(result));
        }
    }
}

/// Walk to the first or last entry of the tree. Returns false for an
/// empty tree.
pub(crate) fn descend_edge(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>, edge: Edge) -> Result<bool> {
    ctx.stack.clear();
    if ctx.desc.is_empty() {
        return Ok(false);
    }
    descend_edge_from(txn, ctx, ctx.desc.root, edge)
}

/// Continue an edge walk downward from `pgno`
pub(crate) fn descend_edge_from(
    txn: &Txn<'_>,
    ctx: &mut TreeCtx<'_>,
    mut pgno: Pgno,
    edge: Edge,
) -> Result<bool> {
    loop {
        if ctx.stack.len() >= CURSOR_STACK_MAX {
            return Err(StoreError::CursorFull);
        }
        let page = txn.page(pgno)?;
        let view = PageView::new(&page)?;
        let count = view.entries();
        let idx = match edge {
            Edge::First => 0,
            Edge::Last => count.saturating_sub(1),
        };
        if view.is_branch() {
            if count == 0 {
                return Err(StoreError::corrupted("empty branch page"));
            }
            let child = view.node(idx)?.child();
            ctx.stack.push(Level { pgno, idx, count });
            pgno = child;
        } else {
            if count == 0 {
                // only a freshly created root may be an empty leaf
                ctx.stack.push(Level { pgno, idx: 0, count });
                return Ok(false);
            }
            ctx.stack.push(Level { pgno, idx, count });
            return Ok(true);
        }
    }
}

/// Step the stack to the first entry of the next leaf. Returns false at
/// the right edge of the tree.
pub(crate) fn next_leaf(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>) -> Result<bool> {
    let depth = ctx.stack.len();
    if depth <= 1 {
        return Ok(false);
    }
    for level in (0..depth - 1).rev() {
        if ctx.stack[level].idx + 1 < ctx.stack[level].count {
            ctx.stack[level].idx += 1;
            let child = {
                let page = txn.page(ctx.stack[level].pgno)?;
                PageView::new(&page)?.node(ctx.stack[level].idx)?.child()
            };
            ctx.stack.truncate(level + 1);
            return descend_edge_from(txn, ctx, child, Edge::First);
        }
    }
    Ok(false)
}

/// Step the stack to the last entry of the previous leaf
pub(crate) fn prev_leaf(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>) -> Result<bool> {
    let depth = ctx.stack.len();
    if depth <= 1 {
        return Ok(false);
    }
    for level in (0..depth - 1).rev() {
        if ctx.stack[level].idx > 0 {
            ctx.stack[level].idx -= 1;
            let child = {
                let page = txn.page(ctx.stack[level].pgno)?;
                PageView::new(&page)?.node(ctx.stack[level].idx)?.child()
            };
            ctx.stack.truncate(level + 1);
            return descend_edge_from(txn, ctx, child, Edge::Last);
        }
    }
    Ok(false)
}

// --- copy-on-write ---------------------------------------------------------

/// CoW every page on the stack, updating child pointers and the root.
///
/// After this, every level is privately owned and may be mutated in place.
pub(crate) fn touch(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>) -> Result<()> {
    for level in 0..ctx.stack.len() {
        let old = ctx.stack[level].pgno;
        let new = txn.cow_page(old)?;
        if new == old {
            continue;
        }
        ctx.stack[level].pgno = new;
        if level == 0 {
            ctx.desc.root = new;
        } else {
            let parent = ctx.stack[level - 1];
            txn.with_dirty(parent.pgno, |p| p.set_child(parent.idx, new))?;
        }
    }
    Ok(())
}

// --- insertion and splitting -----------------------------------------------

/// Insert `entry` at the stack's leaf position, splitting as needed.
/// The path must already be touched. The stack is left VALID only when no
/// split happened; after a split the caller re-seeks.
/// Returns true when a split occurred.
pub(crate) fn insert(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>, entry: Entry<'_>) -> Result<bool> {
    let leaf = *ctx.stack.last().ok_or(StoreError::CursorFull)?;
    let fits = try_insert(txn, leaf.pgno, leaf.idx, &entry)?;
    if fits {
        ctx.stack.last_mut().unwrap().count += 1;
        return Ok(false);
    }
    let level = ctx.stack.len() - 1;
    split_level(txn, ctx, level, entry)?;
    Ok(true)
}

fn try_insert(txn: &Txn<'_>, pgno: Pgno, idx: usize, entry: &Entry<'_>) -> Result<bool> {
    txn.with_dirty(pgno, |p| match entry {
        Entry::Node(node) => {
            if p.ensure_gap(node.len())? {
                p.insert_entry(idx, node)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Entry::Fixed(key) => {
            let view = p.view();
            let ksize = key.len();
            if (view.entries() + 1) * ksize <= view.payload_len() {
                p.dupfix_insert(idx, key)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    })
}

/// Split the page at `level`, distributing the virtual post-insert entry
/// sequence across the old page and a new right sibling, then push the
/// separator into the parent (possibly recursively).
fn split_level(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>, level: usize, entry: Entry<'_>) -> Result<usize> {
    let Level { pgno, idx, .. } = ctx.stack[level];

    let (flags, dupfix_ksize, split_at, mut images) = {
        let page = txn.page(pgno)?;
        let view = PageView::new(&page)?;
        let header = view.header()?;
        let n = view.entries();
        let mut images = Vec::with_capacity(n + 1);
        for i in 0..n {
            images.push(raw_entry(&view, i)?);
        }
        let split_at = view.split_point(entry.len(), idx)?;
        (header.flags, header.dupfix_ksize, split_at, images)
    };
    let is_branch = flags.contains(PageFlags::BRANCH);
    let dupfix = flags.contains(PageFlags::DUPFIX);

    let new_image = match entry {
        Entry::Node(bytes) | Entry::Fixed(bytes) => bytes.to_vec(),
    };
    images.insert(idx, new_image);

    let separator = image_key(&images[split_at], dupfix)?.to_vec();
    let right_pgno = txn.alloc_page(1)?;
    trace!(left = %pgno, right = %right_pgno, split_at, "page split");

    // fill the right sibling
    let txnid = txn.id();
    txn.with_dirty(right_pgno, |p| {
        rebuild_page(p, right_pgno, flags, dupfix_ksize, txnid, &images[split_at..], is_branch)
    })?;

    // rebuild the left page with the remaining prefix
    txn.with_dirty(pgno, |p| {
        rebuild_page(p, pgno, flags, dupfix_ksize, txnid, &images[..split_at], false)
    })?;

    if is_branch {
        ctx.desc.branch_pages += 1;
    } else {
        ctx.desc.leaf_pages += 1;
    }

    if level == 0 {
        // the root split: a new branch takes over and the tree grows
        let root = txn.alloc_page(1)?;
        txn.with_dirty(root, |p| {
            p.reinit(root, PageFlags::BRANCH, txnid);
            p.insert_entry(0, &NodeBuilder::branch(b"", pgno))?;
            p.insert_entry(1, &NodeBuilder::branch(&separator, right_pgno))?;
            Ok(())
        })?;
        ctx.desc.root = root;
        ctx.desc.height += 1;
        ctx.desc.branch_pages += 1;
        Ok(split_at)
    } else {
        let parent_idx = ctx.stack[level - 1].idx + 1;
        insert_into_branch(txn, ctx, level - 1, parent_idx, &separator, right_pgno)?;
        Ok(split_at)
    }
}

fn insert_into_branch(
    txn: &Txn<'_>,
    ctx: &mut TreeCtx<'_>,
    level: usize,
    idx: usize,
    key: &[u8],
    child: Pgno,
) -> Result<()> {
    let node = NodeBuilder::branch(key, child);
    let pgno = ctx.stack[level].pgno;
    let fits = try_insert(txn, pgno, idx, &Entry::Node(&node))?;
    if fits {
        ctx.stack[level].count += 1;
        return Ok(());
    }
    ctx.stack[level].idx = idx;
    split_level(txn, ctx, level, Entry::Node(&node))?;
    Ok(())
}

fn rebuild_page(
    page: &mut PageMut<'_>,
    pgno: Pgno,
    flags: PageFlags,
    dupfix_ksize: u16,
    txnid: crate::types::TxnId,
    images: &[Vec<u8>],
    strip_first_branch_key: bool,
) -> Result<()> {
    page.reinit(pgno, flags, txnid);
    page.set_dupfix_ksize(dupfix_ksize);
    let dupfix = flags.contains(PageFlags::DUPFIX);
    for (i, image) in images.iter().enumerate() {
        if dupfix {
            page.dupfix_insert(i, image)?;
        } else if i == 0 && strip_first_branch_key && flags.contains(PageFlags::BRANCH) {
            // the right sibling's first child is reached through the
            // separator in the parent; its own slot carries no key
            let node = NodeRef::parse(image)?;
            page.insert_entry(i, &NodeBuilder::branch(b"", node.child()))?;
        } else {
            page.insert_entry(i, image)?;
        }
    }
    Ok(())
}

// --- deletion and collapse -------------------------------------------------

/// Remove the entry at the stack's leaf position. The path must be
/// touched. Handles empty-leaf unlinking and root collapse; afterwards
/// the stack may be stale and the caller re-seeks.
pub(crate) fn delete(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>) -> Result<()> {
    let level = ctx.stack.len() - 1;
    let Level { pgno, idx, .. } = ctx.stack[level];
    let dupfix = {
        let page = txn.page(pgno)?;
        PageView::new(&page)?.is_dupfix()
    };
    let remaining = txn.with_dirty(pgno, |p| {
        if dupfix {
            p.dupfix_remove(idx)?;
        } else {
            p.remove_entry(idx)?;
        }
        Ok(p.view().entries())
    })?;
    ctx.stack[level].count = remaining;

    if remaining == 0 {
        if level == 0 {
            // the tree emptied out entirely
            txn.free_page(pgno, 1);
            ctx.desc.leaf_pages = ctx.desc.leaf_pages.saturating_sub(1);
            ctx.desc.root = Pgno::ABSENT;
            ctx.desc.height = 0;
            ctx.stack.clear();
        } else {
            txn.free_page(pgno, 1);
            ctx.desc.leaf_pages = ctx.desc.leaf_pages.saturating_sub(1);
            remove_branch_entry(txn, ctx, level - 1)?;
        }
    }
    collapse_root(txn, ctx)
}

fn remove_branch_entry(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>, level: usize) -> Result<()> {
    let Level { pgno, idx, .. } = ctx.stack[level];
    let remaining = txn.with_dirty(pgno, |p| {
        p.remove_entry(idx)?;
        Ok(p.view().entries())
    })?;
    ctx.stack[level].count = remaining;
    if remaining == 0 {
        txn.free_page(pgno, 1);
        ctx.desc.branch_pages = ctx.desc.branch_pages.saturating_sub(1);
        if level == 0 {
            ctx.desc.root = Pgno::ABSENT;
            ctx.desc.height = 0;
            ctx.stack.clear();
        } else {
            remove_branch_entry(txn, ctx, level - 1)?;
        }
    }
    Ok(())
}

/// While the root is a branch with a single child, the child takes over
/// and the tree shrinks
fn collapse_root(txn: &Txn<'_>, ctx: &mut TreeCtx<'_>) -> Result<()> {
    loop {
        if !ctx.desc.root.is_present() {
            return Ok(());
        }
        let (is_single_branch, child) = {
            let page = txn.page(ctx.desc.root)?;
            let view = PageView::new(&page)?;
            if view.is_branch() && view.entries() == 1 {
                (true, view.node(0)?.child())
            } else {
                (false, Pgno::ABSENT)
            }
        };
        if !is_single_branch {
            return Ok(());
        }
        txn.free_page(ctx.desc.root, 1);
        ctx.desc.branch_pages = ctx.desc.branch_pages.saturating_sub(1);
        ctx.desc.root = child;
        ctx.desc.height = ctx.desc.height.saturating_sub(1);
        trace!(new_root = %child, "root collapsed");
    }
}

// --- overflow chains -------------------------------------------------------

/// Store a value on a fresh overflow chain; returns its first page and
/// the chain length
pub(crate) fn write_overflow(txn: &Txn<'_>, value: &[u8]) -> Result<(Pgno, u32)> {
    let limits = txn.env().limits;
    let npages = limits.overflow_pages(value.len());
    let pgno = txn.alloc_page(npages as usize)?;
    let txnid = txn.id();
    txn.with_dirty(pgno, |p| {
        let bytes = p.raw_bytes_mut();
        let mut header = PageHeader {
            txnid,
            dupfix_ksize: 0,
            flags: PageFlags::LARGE,
            lower: 0,
            upper: 0,
            pgno,
        };
        header.set_large_pages(npages);
        header.write(bytes);
        bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + value.len()].copy_from_slice(value);
        Ok(())
    })?;
    Ok((pgno, npages))
}

/// Read a value of `len` bytes from the chain at `pgno`
pub(crate) fn read_overflow(txn: &Txn<'_>, pgno: Pgno, len: usize) -> Result<Vec<u8>> {
    let header = {
        let page = txn.page(pgno)?;
        PageHeader::read(&page).ok_or_else(|| StoreError::corrupted("bad overflow header"))?
    };
    if !header.is_large() {
        return Err(StoreError::corrupted("node points at a non-overflow page"));
    }
    let npages = header.large_pages() as usize;
    let chain = txn.page_multi(pgno, npages)?;
    if PAGE_HEADER_SIZE + len > chain.len() {
        return Err(StoreError::corrupted("overflow value extends past its chain"));
    }
    Ok(chain[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len].to_vec())
}

/// Release a chain; returns how many pages it held
pub(crate) fn free_overflow(txn: &Txn<'_>, pgno: Pgno) -> Result<u32> {
    let header = {
        let page = txn.page(pgno)?;
        PageHeader::read(&page).ok_or_else(|| StoreError::corrupted("bad overflow header"))?
    };
    if !header.is_large() {
        return Err(StoreError::corrupted("freeing a non-overflow page as a chain"));
    }
    let npages = header.large_pages();
    txn.free_page(pgno, npages as usize);
    Ok(npages)
}

// --- whole-tree release ----------------------------------------------------

/// Free every page of a tree. With `free_nested`, leaf values' overflow
/// chains and duplicate sub-trees go too (pass false for sub-trees, whose
/// entries hold no data).
pub(crate) fn free_tree(txn: &Txn<'_>, desc: &TreeDesc, free_nested: bool) -> Result<()> {
    if !desc.root.is_present() {
        return Ok(());
    }
    free_subtree_pages(txn, desc.root, free_nested)
}

fn free_subtree_pages(txn: &Txn<'_>, pgno: Pgno, free_nested: bool) -> Result<()> {
    enum Todo {
        Child(Pgno),
        Chain(Pgno),
        Nested(TreeDesc, bool),
    }
    let mut todo = Vec::new();
    {
        let page = txn.page(pgno)?;
        let view = PageView::new(&page)?;
        if view.is_branch() {
            for i in 0..view.entries() {
                todo.push(Todo::Child(view.node(i)?.child()));
            }
        } else if free_nested && !view.is_dupfix() {
            for i in 0..view.entries() {
                let node = view.node(i)?;
                match value_kind(node.flags()) {
                    ValueKind::Big => todo.push(Todo::Chain(node.overflow_pgno()?)),
                    ValueKind::SubTree => {
                        // a named-tree record's leaves own nested storage;
                        // a duplicate sub-tree's entries hold no data
                        let named = !node.flags().contains(NodeFlags::DUP);
                        todo.push(Todo::Nested(TreeDesc::read(node.value_area()?)?, named));
                    }
                    _ => {}
                }
            }
        }
    }
    for item in todo {
        match item {
            Todo::Child(child) => free_subtree_pages(txn, child, free_nested)?,
            Todo::Chain(chain) => {
                free_overflow(txn, chain)?;
            }
            Todo::Nested(nested, named) => free_tree(txn, &nested, named)?,
        }
    }
    txn.free_page(pgno, 1);
    Ok(())
}
