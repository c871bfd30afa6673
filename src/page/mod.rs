//! Page layer: the on-disk page format.
//!
//! Every page starts with a 20-byte header. Data pages (branch, leaf and
//! inline sub-pages) follow it with a u16 entry index growing upward and
//! variable-length nodes growing downward from the end of the page:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Page Header (20 B)              │
//! ├──────────────────────────────────────────────┤
//! │  Entry Index  [off0][off1]...   →            │
//! ├──────────────────────────────────────────────┤
//! │                 Free Space                   │
//! ├──────────────────────────────────────────────┤
//! │     ←  [node2][node1][node0]                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! `lower` is the byte size of the entry index (2·entries); `upper` is the
//! offset of the topmost node. Both, like the stored entry offsets, are
//! relative to the end of the header, so the same codec serves full pages
//! and the inline sub-pages embedded in DUPSORT leaf nodes.

mod data;
mod header;
mod node;

pub use data::{align2, PageMut, PageView, SearchResult};
pub use header::{PageHeader, PAGE_HEADER_SIZE};
pub use node::{NodeBuilder, NodeRef, NODE_HEADER_SIZE};

/// An owned, heap-allocated page image.
///
/// Dirty pages of a write transaction live in these until commit flushes
/// them into the file. Multi-page buffers back overflow chains.
#[derive(Clone)]
pub struct PageBuf {
    data: Box<[u8]>,
}

impl PageBuf {
    /// Allocate a zeroed buffer of `len` bytes (one page, or a whole
    /// overflow chain)
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    /// Copy an existing page image
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
