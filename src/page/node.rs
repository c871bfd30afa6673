//! Node encoding and decoding.
//!
//! Nodes are the variable-length entries inside branch and leaf pages.
//! Each starts with an 8-byte header followed by the key bytes and the
//! value bytes. In a branch node the `data_size` field holds the child
//! page number and there is no value area.

use crate::error::{Result, StoreError};
use crate::types::{NodeFlags, Pgno};

/// Size of the node header
pub const NODE_HEADER_SIZE: usize = 8;

/// Node header layout (little-endian):
/// ```text
/// Offset  Size  Field
/// 0       4     data size (branch: child pgno)
/// 4       1     flags
/// 5       1     extra (unused, zero)
/// 6       2     key size
/// ```
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    bytes: &'a [u8],
}

impl<'a> NodeRef<'a> {
    /// Interpret `bytes` (starting at a node header) as a node.
    ///
    /// `bytes` may extend past the node; accessors stay within the sizes
    /// the header declares.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(StoreError::corrupted("node header truncated"));
        }
        let node = Self { bytes };
        if NODE_HEADER_SIZE + node.key_size() > bytes.len() {
            return Err(StoreError::corrupted("node key extends past page"));
        }
        Ok(node)
    }

    pub fn data_size(&self) -> usize {
        u32::from_le_bytes(self.bytes[0..4].try_into().unwrap()) as usize
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.bytes[4])
    }

    pub fn key_size(&self) -> usize {
        u16::from_le_bytes(self.bytes[6..8].try_into().unwrap()) as usize
    }

    pub fn key(&self) -> &'a [u8] {
        &self.bytes[NODE_HEADER_SIZE..NODE_HEADER_SIZE + self.key_size()]
    }

    /// Child page number of a branch node
    pub fn child(&self) -> Pgno {
        Pgno(u32::from_le_bytes(self.bytes[0..4].try_into().unwrap()))
    }

    /// The raw value area of a leaf node.
    ///
    /// For a plain node this is the value itself; for `BIG` it is a u32
    /// overflow page number; for `SUBTREE` a 48-byte tree descriptor; for
    /// `DUP` an inline sub-page.
    pub fn value_area(&self) -> Result<&'a [u8]> {
        let start = NODE_HEADER_SIZE + self.key_size();
        let len = self.stored_value_len();
        if start + len > self.bytes.len() {
            return Err(StoreError::corrupted("node value extends past page"));
        }
        Ok(&self.bytes[start..start + len])
    }

    /// Bytes the value area occupies inside the page (differs from
    /// `data_size` for BIG nodes, whose true length lives on overflow pages)
    pub fn stored_value_len(&self) -> usize {
        if self.flags().contains(NodeFlags::BIG) {
            4
        } else {
            self.data_size()
        }
    }

    /// Overflow page number of a BIG node
    pub fn overflow_pgno(&self) -> Result<Pgno> {
        debug_assert!(self.flags().contains(NodeFlags::BIG));
        let area = self.value_area()?;
        Ok(Pgno(u32::from_le_bytes(area[0..4].try_into().unwrap())))
    }

    /// Total bytes this node occupies in the page, including its header
    pub fn stored_size(&self) -> usize {
        NODE_HEADER_SIZE + self.key_size() + self.stored_value_len()
    }
}

/// Composes node images for insertion into a page.
pub struct NodeBuilder;

impl NodeBuilder {
    /// Bytes a leaf node occupies for an inline value of `vlen` bytes
    pub fn leaf_size(klen: usize, vlen: usize) -> usize {
        NODE_HEADER_SIZE + klen + vlen
    }

    /// Bytes a leaf node with its value on overflow pages occupies
    pub fn big_leaf_size(klen: usize) -> usize {
        NODE_HEADER_SIZE + klen + 4
    }

    /// Bytes a branch node occupies
    pub fn branch_size(klen: usize) -> usize {
        NODE_HEADER_SIZE + klen
    }

    /// Build a plain leaf node
    pub fn leaf(key: &[u8], value: &[u8], flags: NodeFlags) -> Vec<u8> {
        debug_assert!(!flags.contains(NodeFlags::BIG));
        let mut buf = Vec::with_capacity(Self::leaf_size(key.len(), value.len()));
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.push(flags.bits());
        buf.push(0);
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    /// Build a leaf node whose value lives on overflow pages.
    /// `data_size` records the true value length.
    pub fn big_leaf(key: &[u8], value_len: usize, overflow: Pgno) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::big_leaf_size(key.len()));
        buf.extend_from_slice(&(value_len as u32).to_le_bytes());
        buf.push(NodeFlags::BIG.bits());
        buf.push(0);
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&overflow.value().to_le_bytes());
        buf
    }

    /// Build a branch node. Entry 0 of a branch page uses an empty key.
    pub fn branch(key: &[u8], child: Pgno) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::branch_size(key.len()));
        buf.extend_from_slice(&child.value().to_le_bytes());
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_roundtrip() {
        let bytes = NodeBuilder::leaf(b"hello", b"world", NodeFlags::empty());
        let node = NodeRef::parse(&bytes).unwrap();
        assert_eq!(node.key(), b"hello");
        assert_eq!(node.value_area().unwrap(), b"world");
        assert_eq!(node.data_size(), 5);
        assert_eq!(node.stored_size(), bytes.len());
    }

    #[test]
    fn test_branch_roundtrip() {
        let bytes = NodeBuilder::branch(b"separator", Pgno(42));
        let node = NodeRef::parse(&bytes).unwrap();
        assert_eq!(node.key(), b"separator");
        assert_eq!(node.child(), Pgno(42));
        assert_eq!(node.stored_size(), NODE_HEADER_SIZE + 9);
    }

    #[test]
    fn test_big_leaf() {
        let bytes = NodeBuilder::big_leaf(b"k", 100_000, Pgno(7));
        let node = NodeRef::parse(&bytes).unwrap();
        assert!(node.flags().contains(NodeFlags::BIG));
        assert_eq!(node.data_size(), 100_000);
        assert_eq!(node.stored_value_len(), 4);
        assert_eq!(node.overflow_pgno().unwrap(), Pgno(7));
    }

    #[test]
    fn test_truncated_node_rejected() {
        let bytes = NodeBuilder::leaf(b"abc", b"xyz", NodeFlags::empty());
        assert!(NodeRef::parse(&bytes[..6]).is_err());
        // header claims a 3-byte key but the slice ends after the header
        assert!(NodeRef::parse(&bytes[..8]).is_err());
    }
}
