//! The GC tree: retired-page lists keyed by the txnid that retired them.
//!
//! A write transaction pulls one reclaimable entry at a time out of the
//! tree (oldest-first, or newest-first under LIFO reclaim) and hands the
//! pages to its allocator. At commit, everything the transaction retired
//! or left unused is written back under the committing txnid. Entries are
//! reclaimable only once no reader still holds a snapshot at or before
//! their key.

use crate::cursor::Cursor;
use crate::error::{Result, StoreError};
use crate::txn::Txn;
use crate::types::{EnvFlags, Pgno, PutFlags, TxnId, FREE_DBI};
use tracing::{debug, trace};

/// GC keys are txnids stored as the integer-key trees expect them
pub(crate) fn gc_key(txnid: TxnId) -> [u8; 8] {
    txnid.to_ne_bytes()
}

pub(crate) fn gc_key_txnid(key: &[u8]) -> Result<TxnId> {
    Ok(TxnId::from_ne_bytes(
        key.try_into()
            .map_err(|_| StoreError::corrupted("gc key is not a txnid"))?,
    ))
}

/// Encode a page-number list with `capacity` slots so that commit-time
/// rewrites with a few extra pages land in place
pub(crate) fn encode_pnl(pages: &[Pgno], capacity: usize) -> Vec<u8> {
    debug_assert!(capacity >= pages.len());
    let mut buf = vec![0u8; 4 + capacity * 4];
    buf[0..4].copy_from_slice(&(pages.len() as u32).to_le_bytes());
    for (i, pgno) in pages.iter().enumerate() {
        buf[4 + i * 4..8 + i * 4].copy_from_slice(&pgno.value().to_le_bytes());
    }
    buf
}

pub(crate) fn decode_pnl(bytes: &[u8]) -> Result<Vec<Pgno>> {
    if bytes.len() < 4 {
        return Err(StoreError::corrupted("gc entry truncated"));
    }
    let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if 4 + count * 4 > bytes.len() {
        return Err(StoreError::corrupted("gc entry count exceeds its value"));
    }
    let mut pages = Vec::with_capacity(count);
    for i in 0..count {
        pages.push(Pgno(u32::from_le_bytes(
            bytes[4 + i * 4..8 + i * 4].try_into().unwrap(),
        )));
    }
    Ok(pages)
}

/// Pull one reclaimable GC entry into the transaction's allocator.
///
/// A no-op when nothing is eligible; applies the slow-reader policy when
/// an old snapshot is the only thing standing in the way.
pub(crate) fn refill(txn: &Txn<'_>) -> Result<()> {
    let txnid = txn.id();
    let mut oldest = txn.env().lock.oldest(txnid);

    let candidate = match find_candidate(txn, oldest)? {
        Some(found) => Some(found),
        None => {
            // maybe a slow reader blocks everything reclaimable
            if let Some(cb) = txn.env().slow_reader.as_ref() {
                let readers = txn.env().lock.reader_list();
                if let Some(victim) = readers.iter().min_by_key(|r| r.txnid) {
                    if victim.txnid < txnid && cb(victim, txnid - victim.txnid) {
                        txn.env().lock.oust_slot(victim.slot);
                        oldest = txn.env().lock.oldest(txnid);
                        find_candidate(txn, oldest)?
                    } else {
                        None
                    }
                } else {
                    None
                }
            } else {
                None
            }
        }
    };

    let Some(key_txnid) = candidate else {
        return Ok(());
    };

    txn.set_in_gc(true);
    let result = (|| {
        let mut cursor = Cursor::new(txn, FREE_DBI)?;
        let Some(value) = cursor.set_key(&gc_key(key_txnid))? else {
            return Err(StoreError::corrupted("gc candidate vanished"));
        };
        let pages = decode_pnl(&value)?;
        cursor.del_current(false)?;
        trace!(key_txnid, pages = pages.len(), "reclaimed gc entry");
        txn.stash_reclaimed(pages);
        Ok(())
    })();
    txn.set_in_gc(false);
    result
}

/// The newest (LIFO) or oldest (FIFO) GC key strictly below every live
/// reader snapshot
fn find_candidate(txn: &Txn<'_>, oldest: TxnId) -> Result<Option<TxnId>> {
    let mut cursor = Cursor::new(txn, FREE_DBI)?;
    if txn.env().flags.contains(EnvFlags::LIFO_RECLAIM) {
        let positioned = match cursor.set_range(&gc_key(oldest))? {
            Some(_) => cursor.prev()?,
            None => cursor.last()?,
        };
        if let Some((key, _)) = positioned {
            let key_txnid = gc_key_txnid(&key)?;
            if key_txnid < oldest {
                return Ok(Some(key_txnid));
            }
        }
    } else if let Some((key, _)) = cursor.first()? {
        let key_txnid = gc_key_txnid(&key)?;
        if key_txnid < oldest {
            return Ok(Some(key_txnid));
        }
    }
    Ok(None)
}

/// Commit-time GC update: record everything this transaction retired.
///
/// Writing the entry CoWs GC pages and can retire more of them, so the
/// list is written with capacity slack and rewritten until it covers
/// itself.
pub(crate) fn update(txn: &Txn<'_>) -> Result<()> {
    txn.set_in_gc(true);
    let result = update_inner(txn);
    txn.set_in_gc(false);
    result
}

fn update_inner(txn: &Txn<'_>) -> Result<()> {
    let txnid = txn.id();
    let mut written: Option<Vec<Pgno>> = None;
    let mut capacity = 0usize;

    for round in 0..16 {
        let mut pending = txn.pending_garbage();
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_unstable();
        pending.dedup();
        if written.as_deref() == Some(pending.as_slice()) {
            debug!(txnid, pages = pending.len(), rounds = round, "gc entry settled");
            return Ok(());
        }
        while capacity < pending.len() {
            capacity = (capacity * 2).max(pending.len()).max(8);
        }
        let value = encode_pnl(&pending, capacity);
        let mut cursor = Cursor::new(txn, FREE_DBI)?;
        cursor.put(&gc_key(txnid), &value, PutFlags::empty())?;
        written = Some(pending);
    }
    Err(StoreError::corrupted("gc update did not settle"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_roundtrip() {
        let pages = vec![Pgno(3), Pgno(17), Pgno(4)];
        let bytes = encode_pnl(&pages, 8);
        assert_eq!(bytes.len(), 4 + 8 * 4);
        assert_eq!(decode_pnl(&bytes).unwrap(), pages);
    }

    #[test]
    fn test_pnl_rejects_overrun() {
        let mut bytes = encode_pnl(&[Pgno(1)], 1);
        bytes[0..4].copy_from_slice(&9u32.to_le_bytes());
        assert!(decode_pnl(&bytes).is_err());
    }

    #[test]
    fn test_gc_key_order_matches_integer_cmp() {
        use crate::tree::comparator::integer;
        let a = gc_key(5);
        let b = gc_key(1000);
        assert_eq!(integer(&a, &b), std::cmp::Ordering::Less);
        assert_eq!(gc_key_txnid(&a).unwrap(), 5);
    }
}
