//! Key and duplicate-value comparators.
//!
//! Every tree carries two comparator choices: one for keys and one for
//! duplicate values (which act as keys inside sub-trees). The default is
//! element-wise unsigned byte comparison; flags select reversed or
//! native-endian integer orders.

use crate::types::DbFlags;
use std::cmp::Ordering;

/// A total order over byte strings
pub type Cmp = fn(&[u8], &[u8]) -> Ordering;

/// Element-wise unsigned byte comparison
pub fn lexical(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Byte comparison starting from the last byte of each key
pub fn reverse(a: &[u8], b: &[u8]) -> Ordering {
    let mut ia = a.iter().rev();
    let mut ib = b.iter().rev();
    loop {
        match (ia.next(), ib.next()) {
            (Some(x), Some(y)) => match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

/// Keys interpreted as native-endian u32 or u64 by length.
///
/// Mixed or unsupported widths fall back to length order so the relation
/// stays total; size validation rejects them before they are stored.
pub fn integer(a: &[u8], b: &[u8]) -> Ordering {
    match (a.len(), b.len()) {
        (4, 4) => {
            let x = u32::from_ne_bytes(a.try_into().unwrap());
            let y = u32::from_ne_bytes(b.try_into().unwrap());
            x.cmp(&y)
        }
        (8, 8) => {
            let x = u64::from_ne_bytes(a.try_into().unwrap());
            let y = u64::from_ne_bytes(b.try_into().unwrap());
            x.cmp(&y)
        }
        _ => a.len().cmp(&b.len()),
    }
}

/// Select the key comparator for a tree
pub fn for_keys(flags: DbFlags) -> Cmp {
    if flags.contains(DbFlags::INTEGER_KEY) {
        integer
    } else if flags.contains(DbFlags::REVERSE_KEY) {
        reverse
    } else {
        lexical
    }
}

/// Select the duplicate-value comparator for a DUPSORT tree
pub fn for_dups(flags: DbFlags) -> Cmp {
    if flags.contains(DbFlags::INTEGER_DUP) {
        integer
    } else if flags.contains(DbFlags::REVERSE_DUP) {
        reverse
    } else {
        lexical
    }
}

/// Translate the duplicate-order flags of a DUPSORT tree into the key
/// flags of its sub-trees
pub fn sub_tree_flags(flags: DbFlags) -> DbFlags {
    let mut sub = DbFlags::empty();
    if flags.contains(DbFlags::INTEGER_DUP) {
        sub |= DbFlags::INTEGER_KEY;
    }
    if flags.contains(DbFlags::REVERSE_DUP) {
        sub |= DbFlags::REVERSE_KEY;
    }
    if flags.contains(DbFlags::DUP_FIXED) {
        sub |= DbFlags::DUP_FIXED;
    }
    sub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexical() {
        assert_eq!(lexical(b"abc", b"abd"), Ordering::Less);
        assert_eq!(lexical(b"ab", b"abc"), Ordering::Less);
        assert_eq!(lexical(&[0xFF], &[0x01]), Ordering::Greater);
    }

    #[test]
    fn test_reverse() {
        // compared from the tail: "ba" < "ab" because 'a' < 'b'
        assert_eq!(reverse(b"ba", b"ab"), Ordering::Less);
        assert_eq!(reverse(b"xa", b"ya"), Ordering::Less);
        assert_eq!(reverse(b"a", b"ba"), Ordering::Less);
        assert_eq!(reverse(b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn test_integer() {
        let a = 1u32.to_ne_bytes();
        let b = 300u32.to_ne_bytes();
        assert_eq!(integer(&a, &b), Ordering::Less);
        let a = u64::MAX.to_ne_bytes();
        let b = 5u64.to_ne_bytes();
        assert_eq!(integer(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_selection() {
        assert_eq!(for_keys(DbFlags::REVERSE_KEY)(b"ba", b"ab"), Ordering::Less);
        assert_eq!(
            for_dups(DbFlags::DUP_SORT | DbFlags::REVERSE_DUP)(b"ba", b"ab"),
            Ordering::Less
        );
        let sub = sub_tree_flags(DbFlags::DUP_SORT | DbFlags::INTEGER_DUP);
        assert!(sub.contains(DbFlags::INTEGER_KEY));
        assert!(!sub.contains(DbFlags::INTEGER_DUP));
    }
}
