//! Flag families.
//!
//! `PageFlags`, `NodeFlags` and the low 16 bits of `DbFlags` are on-disk
//! values; the rest are runtime-only.

use bitflags::bitflags;

bitflags! {
    /// Environment open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Open the environment read-only
        const READ_ONLY = 0x0001;
        /// Map the data file writable and flush dirty pages through the mapping
        const WRITE_MAP = 0x0002;
        /// The path names the data file itself, not a containing directory
        const NO_SUBDIR = 0x0004;
        /// Skip the meta-page fsync at commit (data is still fsynced)
        const NO_META_SYNC = 0x0008;
        /// Skip all fsyncs at commit; metas are signed weak until `Env::sync`
        const SAFE_NO_SYNC = 0x0010;
        /// Reclaim GC entries newest-first instead of oldest-first
        const LIFO_RECLAIM = 0x0020;
        /// Hold the writer lock for the whole environment lifetime
        const EXCLUSIVE = 0x0040;
    }
}

bitflags! {
    /// Page header flags (on-disk, u16)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch page: entries carry separator keys and child page numbers
        const BRANCH = 0x0001;
        /// Leaf page: entries carry keys and values
        const LEAF = 0x0002;
        /// Large page: first page of an overflow chain
        const LARGE = 0x0004;
        /// Meta page
        const META = 0x0008;
        /// Dupfix leaf: fixed-stride keys, no per-entry node headers
        const DUPFIX = 0x0020;
        /// Inline sub-page embedded in a leaf node's value area
        const SUB = 0x0040;
        /// Page was spilled to the file mid-transaction
        const SPILLED = 0x2000;
        /// Page is detached from any tree and immediately reusable
        const LOOSE = 0x4000;
        /// Page belongs to a committed snapshot and must be CoWed
        const FROZEN = 0x8000;

        /// Bits that describe the page kind rather than its state
        const KIND = Self::BRANCH.bits()
            | Self::LEAF.bits()
            | Self::LARGE.bits()
            | Self::META.bits()
            | Self::DUPFIX.bits()
            | Self::SUB.bits();
    }
}

bitflags! {
    /// Node flags (on-disk, u8)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Value lives on overflow pages; the data area holds a u32 pgno
        const BIG = 0x01;
        /// Data area holds a 48-byte tree descriptor
        const SUBTREE = 0x02;
        /// Data area holds an inline duplicate sub-page
        const DUP = 0x04;
    }
}

bitflags! {
    /// Tree / DBI flags. The low 16 bits are persisted in the tree
    /// descriptor; `CREATE` is an open-time request only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        /// Compare keys from their last byte backwards
        const REVERSE_KEY = 0x0002;
        /// Allow multiple sorted values per key
        const DUP_SORT = 0x0004;
        /// Keys are native-endian u32/u64 integers
        const INTEGER_KEY = 0x0008;
        /// All duplicate values have the same size (requires DUP_SORT)
        const DUP_FIXED = 0x0010;
        /// Duplicate values are native-endian integers (requires DUP_SORT)
        const INTEGER_DUP = 0x0020;
        /// Compare duplicate values back-to-front (requires DUP_SORT)
        const REVERSE_DUP = 0x0040;
        /// Create the named tree if it does not exist
        const CREATE = 0x1_0000;
    }
}

impl DbFlags {
    /// The bits stored in the on-disk tree descriptor
    pub fn persistent(self) -> u16 {
        (self.bits() & 0xFFFF) as u16
    }

    /// Rebuild from the persisted 16-bit image
    pub fn from_persistent(bits: u16) -> Self {
        Self::from_bits_truncate(bits as u32)
    }
}

bitflags! {
    /// Write-operation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PutFlags: u32 {
        /// Fail with `KeyExists` if the key is already present
        const NO_OVERWRITE = 0x0010;
        /// Fail with `KeyExists` if the exact key+value pair is present
        const NO_DUP_DATA = 0x0020;
        /// Replace the value at the cursor's current position
        const CURRENT = 0x0040;
        /// Allocate space for the value and return it zeroed for the caller to fill
        const RESERVE = 0x1_0000;
        /// Key must sort strictly after the current maximum
        const APPEND = 0x2_0000;
        /// Duplicate value must sort after the key's current maximum value
        const APPEND_DUP = 0x4_0000;
        /// Store several contiguous fixed-size values in one call
        const MULTIPLE = 0x8_0000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_flags_persistence() {
        let f = DbFlags::DUP_SORT | DbFlags::REVERSE_DUP | DbFlags::CREATE;
        assert_eq!(f.persistent(), 0x0044);
        let back = DbFlags::from_persistent(f.persistent());
        assert!(back.contains(DbFlags::DUP_SORT | DbFlags::REVERSE_DUP));
        assert!(!back.contains(DbFlags::CREATE));
    }

    #[test]
    fn test_page_kind_mask() {
        let f = PageFlags::LEAF | PageFlags::DUPFIX | PageFlags::SPILLED;
        assert_eq!(f & PageFlags::KIND, PageFlags::LEAF | PageFlags::DUPFIX);
    }
}
