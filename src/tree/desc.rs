//! Tree descriptor codec.

use crate::error::{Result, StoreError};
use crate::types::{DbFlags, Pgno, TxnId};

/// Size of a serialized tree descriptor
pub const TREE_DESC_SIZE: usize = 48;

/// Descriptor of one B+tree: its root, shape statistics and flags.
///
/// Two of these live in every meta (GC tree and main tree); named trees
/// store theirs in the main tree's directory node, and DUPSORT sub-trees
/// store theirs inside the owning leaf node.
///
/// Layout (48 bytes, little-endian): flags u16, height u16, dupfix size
/// u32, root u32, branch pages u32, leaf pages u32, large pages u32,
/// sequence u64, items u64, mod txnid u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeDesc {
    pub flags: u16,
    pub height: u16,
    pub dupfix_size: u32,
    pub root: Pgno,
    pub branch_pages: u32,
    pub leaf_pages: u32,
    pub large_pages: u32,
    pub sequence: u64,
    pub items: u64,
    pub mod_txnid: TxnId,
}

impl TreeDesc {
    /// Descriptor of a tree with no pages yet
    pub fn empty(flags: DbFlags) -> Self {
        Self {
            flags: flags.persistent(),
            height: 0,
            dupfix_size: 0,
            root: Pgno::ABSENT,
            branch_pages: 0,
            leaf_pages: 0,
            large_pages: 0,
            sequence: 0,
            items: 0,
            mod_txnid: 0,
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TREE_DESC_SIZE {
            return Err(StoreError::corrupted("tree descriptor truncated"));
        }
        Ok(Self {
            flags: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            height: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            dupfix_size: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            root: Pgno(u32::from_le_bytes(bytes[8..12].try_into().unwrap())),
            branch_pages: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            leaf_pages: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            large_pages: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            sequence: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            items: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            mod_txnid: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..2].copy_from_slice(&self.flags.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.height.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.dupfix_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.root.value().to_le_bytes());
        bytes[12..16].copy_from_slice(&self.branch_pages.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.leaf_pages.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.large_pages.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.items.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.mod_txnid.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; TREE_DESC_SIZE] {
        let mut buf = [0u8; TREE_DESC_SIZE];
        self.write(&mut buf);
        buf
    }

    pub fn db_flags(&self) -> DbFlags {
        DbFlags::from_persistent(self.flags)
    }

    pub fn is_empty(&self) -> bool {
        !self.root.is_present()
    }

    /// Total pages this tree occupies
    pub fn total_pages(&self) -> u64 {
        self.branch_pages as u64 + self.leaf_pages as u64 + self.large_pages as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let desc = TreeDesc {
            flags: DbFlags::DUP_SORT.persistent(),
            height: 3,
            dupfix_size: 0,
            root: Pgno(17),
            branch_pages: 2,
            leaf_pages: 9,
            large_pages: 1,
            sequence: 55,
            items: 1234,
            mod_txnid: 42,
        };
        let bytes = desc.to_bytes();
        assert_eq!(TreeDesc::read(&bytes).unwrap(), desc);
    }

    #[test]
    fn test_empty() {
        let desc = TreeDesc::empty(DbFlags::empty());
        assert!(desc.is_empty());
        assert_eq!(desc.total_pages(), 0);
        assert_eq!(desc.to_bytes().len(), TREE_DESC_SIZE);
    }
}
