use crate::env::Env;
use crate::error::{Result, StoreError};
use crate::types::{DbFlags, EnvFlags, PutFlags, MAIN_DBI};
use tempfile::{tempdir, TempDir};

fn test_env() -> (Env, TempDir) {
    let dir = tempdir().unwrap();
    let env = Env::options()
        .page_size(4096)
        .open(dir.path(), EnvFlags::empty())
        .unwrap();
    (env, dir)
}

#[test]
fn test_navigation_across_splits() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    // descending insertion order exercises the prepend split bias
    for i in (0..500).rev() {
        let key = format!("key{i:04}");
        let value = vec![b'x'; 40];
        txn.put(MAIN_DBI, key.as_bytes(), &value, PutFlags::empty())?;
    }
    txn.commit()?;

    let txn = env.begin_read()?;
    assert!(txn.stat(MAIN_DBI)?.depth > 1);
    assert_eq!(txn.stat(MAIN_DBI)?.entries, 500);

    let mut cursor = txn.cursor(MAIN_DBI)?;
    let mut entry = cursor.first()?;
    for i in 0..500 {
        let (key, _) = entry.expect("scan ended early");
        assert_eq!(key, format!("key{i:04}").into_bytes());
        entry = cursor.next()?;
    }
    assert!(entry.is_none());
    // and the same walk backwards
    let mut entry = cursor.last()?;
    for i in (0..500).rev() {
        let (key, _) = entry.expect("reverse scan ended early");
        assert_eq!(key, format!("key{i:04}").into_bytes());
        entry = cursor.prev()?;
    }
    assert!(entry.is_none());
    Ok(())
}

#[test]
fn test_set_range_and_bounds() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    for key in ["b", "d", "f"] {
        txn.put(MAIN_DBI, key.as_bytes(), key.as_bytes(), PutFlags::empty())?;
    }

    let mut cursor = txn.cursor(MAIN_DBI)?;
    assert_eq!(cursor.set_range(b"c")?.unwrap().0, b"d".to_vec());
    assert_eq!(cursor.set_range(b"d")?.unwrap().0, b"d".to_vec());
    assert!(cursor.set_range(b"g")?.is_none());

    assert!(cursor.set(b"d")?);
    assert!(!cursor.set(b"c")?);
    assert_eq!(cursor.set_key(b"f")?, Some(b"f".to_vec()));

    assert_eq!(cursor.set_lowerbound(b"d", None)?.unwrap().0, b"d".to_vec());
    assert_eq!(cursor.set_upperbound(b"d", None)?.unwrap().0, b"f".to_vec());
    assert!(cursor.set_upperbound(b"f", None)?.is_none());
    Ok(())
}

#[test]
fn test_delete_empties_and_collapses_tree() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    for i in 0..300 {
        let key = format!("key{i:04}");
        txn.put(MAIN_DBI, key.as_bytes(), &[0u8; 40], PutFlags::empty())?;
    }
    txn.commit()?;

    let txn = env.begin_write()?;
    assert!(txn.stat(MAIN_DBI)?.depth > 1);
    for i in 0..300 {
        let key = format!("key{i:04}");
        assert!(txn.del(MAIN_DBI, key.as_bytes(), None)?, "key {i}");
    }
    assert_eq!(txn.stat(MAIN_DBI)?.entries, 0);
    assert_eq!(txn.stat(MAIN_DBI)?.depth, 0);
    // the emptied tree accepts data again
    txn.put(MAIN_DBI, b"again", b"1", PutFlags::empty())?;
    txn.commit()?;

    let txn = env.begin_read()?;
    assert_eq!(txn.get(MAIN_DBI, b"again")?, Some(b"1".to_vec()));
    assert_eq!(txn.stat(MAIN_DBI)?.entries, 1);
    Ok(())
}

#[test]
fn test_after_delete_advance() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    for key in ["a", "b", "c", "d"] {
        txn.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::empty())?;
    }
    let mut cursor = txn.cursor(MAIN_DBI)?;
    assert!(cursor.set(b"b")?);
    cursor.del_current(false)?;
    // the entry that slid into the hole comes out of the next advance
    assert_eq!(cursor.next()?.unwrap().0, b"c".to_vec());
    assert_eq!(cursor.next()?.unwrap().0, b"d".to_vec());
    assert!(cursor.next()?.is_none());
    Ok(())
}

#[test]
fn test_sibling_cursor_sees_mutations() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    for key in ["a", "b", "c", "d", "e"] {
        txn.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::empty())?;
    }

    let mut walker = txn.cursor(MAIN_DBI)?;
    assert_eq!(walker.first()?.unwrap().0, b"a".to_vec());

    // a second cursor deletes ahead of and inserts behind the walker
    let mut editor = txn.cursor(MAIN_DBI)?;
    assert!(editor.set(b"c")?);
    editor.del_current(false)?;
    editor.put(b"ab", b"v", PutFlags::empty())?;

    assert_eq!(walker.next()?.unwrap().0, b"ab".to_vec());
    assert_eq!(walker.next()?.unwrap().0, b"b".to_vec());
    assert_eq!(walker.next()?.unwrap().0, b"d".to_vec());
    assert_eq!(walker.next()?.unwrap().0, b"e".to_vec());
    assert!(walker.next()?.is_none());
    Ok(())
}

#[test]
fn test_append_flag() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    for i in 0..100 {
        let key = format!("key{i:04}");
        txn.put(MAIN_DBI, key.as_bytes(), b"v", PutFlags::APPEND)?;
    }
    // appending out of order is refused
    let err = txn
        .put(MAIN_DBI, b"key0000", b"v", PutFlags::APPEND)
        .unwrap_err();
    assert!(matches!(err, StoreError::KeyExists));
    assert_eq!(txn.stat(MAIN_DBI)?.entries, 100);
    txn.commit()?;
    Ok(())
}

#[test]
fn test_dup_inline_basics() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    let dbi = txn.open_dbi(Some("dups"), DbFlags::DUP_SORT | DbFlags::CREATE)?;
    txn.put(dbi, b"k", b"banana", PutFlags::empty())?;
    txn.put(dbi, b"k", b"apple", PutFlags::empty())?;
    txn.put(dbi, b"k", b"cherry", PutFlags::empty())?;
    // an exact duplicate is a quiet no-op without NO_DUP_DATA
    txn.put(dbi, b"k", b"apple", PutFlags::empty())?;
    let err = txn.put(dbi, b"k", b"apple", PutFlags::NO_DUP_DATA).unwrap_err();
    assert!(matches!(err, StoreError::KeyExists));

    let mut cursor = txn.cursor(dbi)?;
    assert!(cursor.set_key(b"k")?.is_some());
    assert_eq!(cursor.count()?, 3);

    let mut values = Vec::new();
    let mut entry = cursor.set_key(b"k")?;
    while let Some(value) = entry {
        values.push(value);
        entry = cursor.next()?.map(|(_, v)| v);
    }
    assert_eq!(values, vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]);

    assert_eq!(cursor.get_both(b"k", b"banana")?, Some(b"banana".to_vec()));
    assert_eq!(cursor.get_both(b"k", b"blueberry")?, None);
    assert_eq!(cursor.get_both_range(b"k", b"b")?, Some(b"banana".to_vec()));

    // duplicate-only steps stay within the key
    assert_eq!(cursor.last_dup()?, Some(b"cherry".to_vec()));
    assert_eq!(cursor.prev_dup()?.unwrap().1, b"banana".to_vec());
    assert_eq!(cursor.prev_dup()?.unwrap().1, b"apple".to_vec());
    assert!(cursor.prev_dup()?.is_none());
    assert_eq!(cursor.first_dup()?, Some(b"apple".to_vec()));
    assert_eq!(cursor.next_dup()?.unwrap().1, b"banana".to_vec());
    Ok(())
}

#[test]
fn test_dup_spill_and_collapse() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    let dbi = txn.open_dbi(Some("dups"), DbFlags::DUP_SORT | DbFlags::CREATE)?;

    // enough duplicates to outgrow the inline sub-page
    for i in 0..300 {
        let value = format!("dup{i:05}");
        txn.put(dbi, b"k", value.as_bytes(), PutFlags::empty())?;
    }
    let mut cursor = txn.cursor(dbi)?;
    assert!(cursor.set_key(b"k")?.is_some());
    assert_eq!(cursor.count()?, 300);
    drop(cursor);

    // shrink back to a single value; the node collapses to plain form
    for i in 1..300 {
        let value = format!("dup{i:05}");
        assert!(txn.del(dbi, b"k", Some(value.as_bytes()))?);
    }
    let mut cursor = txn.cursor(dbi)?;
    assert_eq!(cursor.set_key(b"k")?, Some(b"dup00000".to_vec()));
    assert_eq!(cursor.count()?, 1);
    drop(cursor);
    txn.commit()?;

    let txn = env.begin_read()?;
    let dbi = txn.open_dbi(Some("dups"), DbFlags::empty())?;
    assert_eq!(txn.get(dbi, b"k")?, Some(b"dup00000".to_vec()));
    Ok(())
}

#[test]
fn test_dupfixed_multiple_put() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    let dbi = txn.open_dbi(
        Some("fixed"),
        DbFlags::DUP_SORT | DbFlags::DUP_FIXED | DbFlags::CREATE,
    )?;
    let mut data = Vec::new();
    for i in 0..64u32 {
        data.extend_from_slice(&i.to_be_bytes());
    }
    let stored = txn.put_multiple(dbi, b"k", 4, &data, PutFlags::empty())?;
    assert_eq!(stored, 64);

    // a wrong-sized duplicate is rejected
    let err = txn.put(dbi, b"k", b"12345", PutFlags::empty()).unwrap_err();
    assert!(matches!(err, StoreError::BadValSize { .. }));

    let mut cursor = txn.cursor(dbi)?;
    assert!(cursor.set_key(b"k")?.is_some());
    assert_eq!(cursor.count()?, 64);
    let mut n = 0u32;
    let mut entry = cursor.set_key(b"k")?;
    while let Some(value) = entry {
        assert_eq!(value, n.to_be_bytes().to_vec());
        n += 1;
        entry = cursor.next()?.map(|(_, v)| v);
    }
    assert_eq!(n, 64);
    Ok(())
}

#[test]
fn test_integer_keys() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    let dbi = txn.open_dbi(Some("ints"), DbFlags::INTEGER_KEY | DbFlags::CREATE)?;
    for value in [300u32, 5, 70_000, 2, 1_000_000] {
        txn.put(dbi, &value.to_ne_bytes(), b"v", PutFlags::empty())?;
    }
    let err = txn.put(dbi, b"abc", b"v", PutFlags::empty()).unwrap_err();
    assert!(matches!(err, StoreError::BadValSize { .. }));

    let mut cursor = txn.cursor(dbi)?;
    let mut seen = Vec::new();
    let mut entry = cursor.first()?;
    while let Some((key, _)) = entry {
        seen.push(u32::from_ne_bytes(key.as_slice().try_into().unwrap()));
        entry = cursor.next()?;
    }
    assert_eq!(seen, vec![2, 5, 300, 70_000, 1_000_000]);
    Ok(())
}

#[test]
fn test_reverse_keys() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    let dbi = txn.open_dbi(Some("rev"), DbFlags::REVERSE_KEY | DbFlags::CREATE)?;
    for key in ["xa", "yb", "za", "ab"] {
        txn.put(dbi, key.as_bytes(), b"v", PutFlags::empty())?;
    }
    let mut cursor = txn.cursor(dbi)?;
    let mut seen = Vec::new();
    let mut entry = cursor.first()?;
    while let Some((key, _)) = entry {
        seen.push(String::from_utf8(key).unwrap());
        entry = cursor.next()?;
    }
    // compared from the last byte: ...a before ...b
    assert_eq!(seen, vec!["xa", "za", "ab", "yb"]);
    Ok(())
}

#[test]
fn test_gc_reuses_freed_pages() -> Result<()> {
    let (env, _dir) = test_env();
    for round in 0..4 {
        let txn = env.begin_write()?;
        for i in 0..200 {
            let key = format!("key{i:04}");
            txn.put(MAIN_DBI, key.as_bytes(), &[round as u8; 64], PutFlags::empty())?;
        }
        txn.commit()?;

        let txn = env.begin_write()?;
        for i in 0..200 {
            let key = format!("key{i:04}");
            txn.del(MAIN_DBI, key.as_bytes(), None)?;
        }
        txn.commit()?;
    }
    // retired pages cycle back through the GC tree instead of growing
    // the file round after round
    let info = env.info()?;
    assert!(
        info.last_pgno < 120,
        "file kept growing: last_pgno {}",
        info.last_pgno
    );
    Ok(())
}

#[test]
fn test_cursor_full_scan_during_write() -> Result<()> {
    let (env, _dir) = test_env();
    let txn = env.begin_write()?;
    for i in 0..50 {
        let key = format!("key{i:02}");
        txn.put(MAIN_DBI, key.as_bytes(), b"committed", PutFlags::empty())?;
    }
    txn.commit()?;

    // a cursor inside a write txn sees that txn's own dirty state
    let txn = env.begin_write()?;
    txn.put(MAIN_DBI, b"key10", b"dirty", PutFlags::empty())?;
    let mut cursor = txn.cursor(MAIN_DBI)?;
    assert_eq!(cursor.set_key(b"key10")?, Some(b"dirty".to_vec()));
    assert_eq!(cursor.set_key(b"key11")?, Some(b"committed".to_vec()));
    txn.abort();

    let txn = env.begin_read()?;
    assert_eq!(txn.get(MAIN_DBI, b"key10")?, Some(b"committed".to_vec()));
    Ok(())
}
