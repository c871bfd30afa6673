//! Tree descriptors and per-tree ordering.
//!
//! The B+tree algorithms themselves live in the cursor module; this layer
//! owns the descriptor codec and comparator selection shared by full trees
//! and DUPSORT sub-trees.

pub mod comparator;
mod desc;

pub use comparator::{for_dups, for_keys, sub_tree_flags, Cmp};
pub use desc::{TreeDesc, TREE_DESC_SIZE};
