//! # cowdb
//!
//! An embedded, transactional, ordered key-value store over a
//! memory-mapped copy-on-write B+tree, file-format compatible with the
//! MDBX/LMDB lineage.
//!
//! ## Architecture
//!
//! - **Page layer** (`page`): the 20-byte page header, 8-byte node
//!   header, and the entry-index page format shared by branch pages,
//!   leaf pages and inline duplicate sub-pages
//! - **Meta layer** (`meta`): the three rotating meta pages and the
//!   two-phase update that publishes a commit
//! - **Environment** (`env`): files, the data mapping, geometry, the
//!   lock file with its reader-slot table
//! - **Transactions** (`txn`): MVCC snapshots for readers, the
//!   single-writer dirty-page tracker, allocator and GC
//! - **Cursors** (`cursor`): stack-based navigation and all tree
//!   mutation, including the DUPSORT engine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cowdb::{Env, EnvFlags, PutFlags, MAIN_DBI};
//!
//! let env = Env::open("my-database", EnvFlags::empty())?;
//!
//! let txn = env.begin_write()?;
//! txn.put(MAIN_DBI, b"hello", b"world", PutFlags::empty())?;
//! txn.commit()?;
//!
//! let txn = env.begin_read()?;
//! assert_eq!(txn.get(MAIN_DBI, b"hello")?, Some(b"world".to_vec()));
//! ```
//!
//! One write transaction runs at a time (per process via a mutex, across
//! processes via the lock file); readers are unlimited and never block.

pub mod cursor;
pub mod env;
pub mod error;
pub mod meta;
pub mod page;
pub mod tree;
pub mod txn;
pub mod types;

pub use cursor::Cursor;
pub use env::{Env, EnvInfo, EnvOptions, ReaderInfo, Stat};
pub use error::{Result, StoreError};
pub use meta::GeometrySettings;
pub use txn::{NestedTxn, ReservedValue, Txn};
pub use types::{
    Canary, DbFlags, EnvFlags, Pgno, PutFlags, TxnId, FREE_DBI, MAIN_DBI,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use tempfile::tempdir;

    fn open_env(dir: &std::path::Path) -> Env {
        Env::options()
            .page_size(4096)
            .open(dir, EnvFlags::empty())
            .unwrap()
    }

    #[test]
    fn test_single_put_get() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        txn.put(MAIN_DBI, b"hello", b"world", PutFlags::empty())?;
        txn.commit()?;

        let txn = env.begin_read()?;
        assert_eq!(txn.get(MAIN_DBI, b"hello")?, Some(b"world".to_vec()));
        assert_eq!(txn.get(MAIN_DBI, b"absent")?, None);
        Ok(())
    }

    #[test]
    fn test_no_overwrite_guard() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        txn.put(MAIN_DBI, b"hello", b"world", PutFlags::empty())?;
        txn.commit()?;

        let txn = env.begin_write()?;
        let err = txn
            .put(MAIN_DBI, b"hello", b"x", PutFlags::NO_OVERWRITE)
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyExists));
        assert_eq!(txn.get(MAIN_DBI, b"hello")?, Some(b"world".to_vec()));
        txn.abort();
        Ok(())
    }

    #[test]
    fn test_ordered_iteration() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        for key in ["zzz", "aaa", "key1", "key2", "key3"] {
            txn.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::empty())?;
        }
        txn.commit()?;

        let txn = env.begin_read()?;
        let mut cursor = txn.cursor(MAIN_DBI)?;
        let mut keys = Vec::new();
        let mut entry = cursor.first()?;
        while let Some((key, _)) = entry {
            keys.push(String::from_utf8(key).unwrap());
            entry = cursor.next()?;
        }
        assert_eq!(keys, ["aaa", "key1", "key2", "key3", "zzz"]);
        Ok(())
    }

    #[test]
    fn test_dupsort_conversion_and_count() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        let dbi = txn.open_dbi(Some("dups"), DbFlags::DUP_SORT | DbFlags::CREATE)?;
        for i in 0..200 {
            let value = format!("value-{i:04}");
            txn.put(dbi, b"K", value.as_bytes(), PutFlags::empty())?;
        }
        txn.commit()?;

        let txn = env.begin_read()?;
        let dbi = txn.open_dbi(Some("dups"), DbFlags::empty())?;
        let mut cursor = txn.cursor(dbi)?;
        assert!(cursor.set_key(b"K")?.is_some());
        assert_eq!(cursor.count()?, 200);
        let mut seen = Vec::new();
        let mut value = cursor.first_dup()?;
        while let Some(v) = value {
            seen.push(String::from_utf8(v).unwrap());
            value = cursor.next_dup()?.map(|(_, v)| v);
        }
        let expected: Vec<String> = (0..200).map(|i| format!("value-{i:04}")).collect();
        assert_eq!(seen, expected);
        drop(cursor);
        drop(txn);

        // delete every even-indexed value
        let txn = env.begin_write()?;
        let dbi = txn.open_dbi(Some("dups"), DbFlags::empty())?;
        for i in (0..200).step_by(2) {
            let value = format!("value-{i:04}");
            assert!(txn.del(dbi, b"K", Some(value.as_bytes()))?);
        }
        txn.commit()?;

        let txn = env.begin_read()?;
        let dbi = txn.open_dbi(Some("dups"), DbFlags::empty())?;
        let mut cursor = txn.cursor(dbi)?;
        assert!(cursor.set_key(b"K")?.is_some());
        assert_eq!(cursor.count()?, 100);
        let mut seen = Vec::new();
        let mut value = cursor.first_dup()?;
        while let Some(v) = value {
            seen.push(String::from_utf8(v).unwrap());
            value = cursor.next_dup()?.map(|(_, v)| v);
        }
        let expected: Vec<String> = (0..200)
            .filter(|i| i % 2 == 1)
            .map(|i| format!("value-{i:04}"))
            .collect();
        assert_eq!(seen, expected);
        Ok(())
    }

    /// Walk the main tree by hand and return the overflow-chain page of a
    /// big value
    fn overflow_pgno_of(txn: &Txn<'_>, key: &[u8]) -> Pgno {
        use crate::cursor::ops::{self, TreeCtx};
        use crate::page::{PageView, SearchResult};
        let mut desc = txn.tree(MAIN_DBI).unwrap();
        let mut stack = Vec::new();
        let mut ctx = TreeCtx {
            stack: &mut stack,
            desc: &mut desc,
            cmp: crate::tree::comparator::lexical,
        };
        let result = ops::search(txn, &mut ctx, key).unwrap().unwrap();
        let SearchResult::Found(_) = result else {
            panic!("key missing");
        };
        let leaf = *stack.last().unwrap();
        let page = txn.page(leaf.pgno).unwrap();
        let view = PageView::new(&page).unwrap();
        view.node(leaf.idx).unwrap().overflow_pgno().unwrap()
    }

    #[test]
    fn test_large_value_overflow_and_in_place_update() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let big: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 1500]).collect();
        let txn = env.begin_write()?;
        for (i, value) in big.iter().enumerate() {
            let key = format!("key{i}");
            txn.put(MAIN_DBI, key.as_bytes(), value, PutFlags::empty())?;
        }
        for i in 0..100u8 {
            let key = format!("small{i:03}");
            txn.put(MAIN_DBI, key.as_bytes(), &[i; 50], PutFlags::empty())?;
        }
        txn.commit()?;

        let txn = env.begin_read()?;
        for (i, value) in big.iter().enumerate() {
            let key = format!("key{i}");
            assert_eq!(txn.get(MAIN_DBI, key.as_bytes())?.as_deref(), Some(&value[..]));
        }
        for i in 0..100u8 {
            let key = format!("small{i:03}");
            assert_eq!(txn.get(MAIN_DBI, key.as_bytes())?.as_deref(), Some(&[i; 50][..]));
        }
        let chain_before = overflow_pgno_of(&txn, b"key7");
        let entries_before = txn.stat(MAIN_DBI)?.entries;
        drop(txn);

        // a same-length replacement keeps the overflow pages
        let replacement = vec![0xEEu8; 1500];
        let txn = env.begin_write()?;
        txn.put(MAIN_DBI, b"key7", &replacement, PutFlags::empty())?;
        txn.commit()?;

        let txn = env.begin_read()?;
        assert_eq!(txn.get(MAIN_DBI, b"key7")?.as_deref(), Some(&replacement[..]));
        assert_eq!(overflow_pgno_of(&txn, b"key7"), chain_before);
        assert_eq!(txn.stat(MAIN_DBI)?.entries, entries_before);
        Ok(())
    }

    #[test]
    fn test_isolation_under_concurrent_commit() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        for i in 0..100 {
            let key = format!("key{i:05}");
            txn.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::empty())?;
        }
        txn.commit()?;

        let reader = env.begin_read()?;

        let writer = env.begin_write()?;
        for i in 100..200 {
            let key = format!("key{i:05}");
            writer.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::empty())?;
        }
        writer.commit()?;

        // the old snapshot still sees exactly its 100 keys
        let mut cursor = reader.cursor(MAIN_DBI)?;
        let mut count = 0;
        let mut entry = cursor.first()?;
        while entry.is_some() {
            count += 1;
            entry = cursor.next()?;
        }
        assert_eq!(count, 100);
        drop(cursor);
        drop(reader);

        let fresh = env.begin_read()?;
        assert_eq!(fresh.stat(MAIN_DBI)?.entries, 200);
        Ok(())
    }

    #[test]
    fn test_crash_safety_partial_meta() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let commits = 5u64;
        for i in 0..commits {
            let txn = env.begin_write()?;
            let key = format!("commit{i}");
            txn.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::empty())?;
            txn.commit()?;
        }
        let last_txnid = env.info()?.recent_txnid;
        drop(env);

        // zero the recent meta's txnid_b, as a torn rotation would leave it
        let data_path = dir.path().join(env::DATA_NAME);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)?;
        let mut recent_slot = 0;
        let mut recent_txnid = 0;
        for slot in 0..3 {
            let mut page = vec![0u8; 4096];
            file.read_exact_at(&mut page, slot as u64 * 4096)?;
            if let Some(m) = meta::Meta::decode(&page)? {
                if m.txnid > recent_txnid {
                    recent_txnid = m.txnid;
                    recent_slot = slot;
                }
            }
        }
        assert_eq!(recent_txnid, last_txnid);
        let off = recent_slot as u64 * 4096 + meta::META_TXNID_B_OFFSET as u64;
        file.write_at(&0u64.to_le_bytes(), off)?;
        file.sync_all()?;
        drop(file);

        // the prior commit is selected; the torn one is gone without damage
        let env = open_env(dir.path());
        assert_eq!(env.info()?.recent_txnid, last_txnid - 1);
        let txn = env.begin_read()?;
        assert_eq!(
            txn.get(MAIN_DBI, format!("commit{}", commits - 2).as_bytes())?,
            Some(b"v".to_vec())
        );
        assert_eq!(txn.get(MAIN_DBI, format!("commit{}", commits - 1).as_bytes())?, None);
        Ok(())
    }

    #[test]
    fn test_durability_across_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let env = open_env(dir.path());
            let txn = env.begin_write()?;
            for i in 0..500 {
                let key = format!("key{i:04}");
                let value = format!("value{i}");
                txn.put(MAIN_DBI, key.as_bytes(), value.as_bytes(), PutFlags::empty())?;
            }
            txn.commit()?;
        }
        let env = open_env(dir.path());
        let txn = env.begin_read()?;
        for i in 0..500 {
            let key = format!("key{i:04}");
            let value = format!("value{i}");
            assert_eq!(
                txn.get(MAIN_DBI, key.as_bytes())?,
                Some(value.into_bytes()),
                "key {i}"
            );
        }
        assert_eq!(txn.stat(MAIN_DBI)?.entries, 500);
        Ok(())
    }

    #[test]
    fn test_named_trees_and_drop() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        let a = txn.open_dbi(Some("alpha"), DbFlags::CREATE)?;
        let b = txn.open_dbi(Some("beta"), DbFlags::CREATE)?;
        txn.put(a, b"k", b"in-alpha", PutFlags::empty())?;
        txn.put(b, b"k", b"in-beta", PutFlags::empty())?;
        txn.commit()?;

        let txn = env.begin_read()?;
        let a = txn.open_dbi(Some("alpha"), DbFlags::empty())?;
        assert_eq!(txn.get(a, b"k")?, Some(b"in-alpha".to_vec()));
        // flag mismatch is refused
        assert!(matches!(
            txn.open_dbi(Some("alpha"), DbFlags::DUP_SORT),
            Err(StoreError::Incompatible(_))
        ));
        drop(txn);

        let txn = env.begin_write()?;
        let a = txn.open_dbi(Some("alpha"), DbFlags::empty())?;
        txn.drop_dbi(a, true)?;
        txn.commit()?;

        let txn = env.begin_read()?;
        assert!(matches!(
            txn.open_dbi(Some("alpha"), DbFlags::empty()),
            Err(StoreError::KeyNotFound)
        ));
        let b = txn.open_dbi(Some("beta"), DbFlags::empty())?;
        assert_eq!(txn.get(b, b"k")?, Some(b"in-beta".to_vec()));
        Ok(())
    }

    #[test]
    fn test_reset_renew_and_reader_slots() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        txn.put(MAIN_DBI, b"k", b"1", PutFlags::empty())?;
        txn.commit()?;

        let mut reader = env.begin_read()?;
        let first_seen = reader.id();
        assert_eq!(env.reader_list().len(), 1);
        reader.reset()?;

        let txn = env.begin_write()?;
        txn.put(MAIN_DBI, b"k", b"2", PutFlags::empty())?;
        txn.commit()?;

        reader.renew()?;
        assert!(reader.id() > first_seen);
        assert_eq!(reader.get(MAIN_DBI, b"k")?, Some(b"2".to_vec()));
        drop(reader);
        assert_eq!(env.reader_list().len(), 0);
        assert_eq!(env.reader_check(), 0);
        Ok(())
    }

    #[test]
    fn test_sequence_and_canary() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        assert_eq!(txn.sequence(MAIN_DBI, 5)?, 0);
        assert_eq!(txn.sequence(MAIN_DBI, 1)?, 5);
        txn.put_canary(&Canary { x: 7, y: 8, z: 9, v: 0 })?;
        txn.commit()?;

        let txn = env.begin_read()?;
        assert_eq!(txn.sequence(MAIN_DBI, 0)?, 6);
        let canary = txn.canary();
        assert_eq!((canary.x, canary.y, canary.z), (7, 8, 9));
        assert_eq!(canary.v, txn.id());
        Ok(())
    }

    #[test]
    fn test_nested_txn_commit_and_abort() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        txn.put(MAIN_DBI, b"base", b"1", PutFlags::empty())?;

        {
            let child = txn.nested()?;
            child.put(MAIN_DBI, b"kept", b"2", PutFlags::empty())?;
            child.commit()?;
        }
        {
            let child = txn.nested()?;
            child.put(MAIN_DBI, b"dropped", b"3", PutFlags::empty())?;
            child.abort();
        }
        assert_eq!(txn.get(MAIN_DBI, b"kept")?, Some(b"2".to_vec()));
        assert_eq!(txn.get(MAIN_DBI, b"dropped")?, None);
        txn.commit()?;

        let txn = env.begin_read()?;
        assert_eq!(txn.get(MAIN_DBI, b"base")?, Some(b"1".to_vec()));
        assert_eq!(txn.get(MAIN_DBI, b"kept")?, Some(b"2".to_vec()));
        assert_eq!(txn.get(MAIN_DBI, b"dropped")?, None);
        Ok(())
    }

    #[test]
    fn test_put_reserve() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let txn = env.begin_write()?;
        {
            let mut reserved = txn.put_reserve(MAIN_DBI, b"r", 8, PutFlags::empty())?;
            reserved.copy_from_slice(b"reserved");
        }
        txn.commit()?;

        let txn = env.begin_read()?;
        assert_eq!(txn.get(MAIN_DBI, b"r")?, Some(b"reserved".to_vec()));
        Ok(())
    }

    #[test]
    fn test_randomized_against_reference() -> Result<()> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::BTreeMap;

        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for round in 0..20 {
            let txn = env.begin_write()?;
            for _ in 0..200 {
                let key = format!("key{:03}", rng.gen_range(0..400)).into_bytes();
                if rng.gen_bool(0.7) {
                    let value = vec![rng.gen::<u8>(); rng.gen_range(1..120)];
                    txn.put(MAIN_DBI, &key, &value, PutFlags::empty())?;
                    reference.insert(key, value);
                } else {
                    let removed = txn.del(MAIN_DBI, &key, None)?;
                    assert_eq!(removed, reference.remove(&key).is_some(), "round {round}");
                }
            }
            txn.commit()?;
        }

        let txn = env.begin_read()?;
        assert_eq!(txn.stat(MAIN_DBI)?.entries, reference.len() as u64);
        let mut cursor = txn.cursor(MAIN_DBI)?;
        let mut entry = cursor.first()?;
        for (key, value) in &reference {
            let (got_key, got_value) = entry.expect("store ended early");
            assert_eq!(&got_key, key);
            assert_eq!(&got_value, value);
            entry = cursor.next()?;
        }
        assert!(entry.is_none());
        Ok(())
    }

    #[test]
    fn test_env_copy_snapshot() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let txn = env.begin_write()?;
        for i in 0..50 {
            let key = format!("key{i:02}");
            txn.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::empty())?;
        }
        txn.commit()?;

        let copy_path = dir.path().join("copy.db");
        env.copy(&copy_path)?;

        let copied = Env::open(&copy_path, EnvFlags::NO_SUBDIR)?;
        let txn = copied.begin_read()?;
        assert_eq!(txn.stat(MAIN_DBI)?.entries, 50);
        assert_eq!(txn.get(MAIN_DBI, b"key31")?, Some(b"v".to_vec()));
        Ok(())
    }
}
