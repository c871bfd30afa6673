//! Meta pages: the rotating triple that publishes database roots.
//!
//! Pages 0, 1 and 2 each hold a meta. A meta is valid when its magic
//! matches and `txnid_a == txnid_b`; the two-phase commit write zeroes
//! `txnid_b` first and restores it last, so a torn write leaves an
//! inconsistent meta the next open rejects. The *recent* meta carries the
//! highest txnid among the consistent ones; the *steady* meta is the
//! newest one whose signature records a completed fsync.

mod geometry;

pub use geometry::{grown_size, shrunk_size, Geometry, GeometrySettings, GEOMETRY_SIZE};

use crate::error::{Result, StoreError};
use crate::page::{PageBuf, PageHeader, PAGE_HEADER_SIZE};
use crate::tree::{TreeDesc, TREE_DESC_SIZE};
use crate::types::{
    Canary, PageFlags, Pgno, TxnId, DATA_MAGIC, MAGIC, MIN_PAGE_SIZE, NUM_METAS, SIGN_STEADY,
    SIGN_WEAK,
};
use static_assertions::const_assert;

/// Serialized size of a meta body (follows the 20-byte page header)
pub const META_BODY_SIZE: usize = 224;

const_assert!(PAGE_HEADER_SIZE + META_BODY_SIZE <= MIN_PAGE_SIZE);

// body-relative field offsets
const OFF_MAGIC: usize = 0;
const OFF_TXNID_A: usize = 8;
const OFF_GEOMETRY: usize = 20;
const OFF_GC: usize = 40;
const OFF_MAIN: usize = 88;
const OFF_CANARY: usize = 136;
const OFF_SIGN: usize = 168;
const OFF_TXNID_B: usize = 176;
const OFF_PAGES_RETIRED: usize = 184;
const OFF_BOOT_ID: usize = 192;
const OFF_DXB_ID: usize = 208;

/// Byte offset of `txnid_b` within a meta page (used by the two-phase
/// commit write and by crash-safety tests)
pub const META_TXNID_B_OFFSET: usize = PAGE_HEADER_SIZE + OFF_TXNID_B;

/// Byte offset of the signature within a meta page
pub const META_SIGN_OFFSET: usize = PAGE_HEADER_SIZE + OFF_SIGN;

/// A decoded meta page body.
///
/// The environment's page size travels in `gc.dupfix_size`; the GC tree
/// never uses the dupfix layout, so the slot is free and keeps the page
/// size readable before any mapping exists.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    pub txnid: TxnId,
    pub geometry: Geometry,
    pub gc: TreeDesc,
    pub main: TreeDesc,
    pub canary: Canary,
    pub sign: u64,
    pub pages_retired: u64,
    pub boot_id: [u8; 16],
    pub dxb_id: [u8; 16],
}

impl Meta {
    /// Decode a meta from a full page image.
    ///
    /// Magic or version trouble is an error; an inconsistent
    /// (`txnid_a != txnid_b`) meta decodes to `Ok(None)` so the caller can
    /// fall back to an older slot.
    pub fn decode(page: &[u8]) -> Result<Option<Self>> {
        if page.len() < PAGE_HEADER_SIZE + META_BODY_SIZE {
            return Err(StoreError::corrupted("meta page truncated"));
        }
        let header = PageHeader::read(page)
            .ok_or_else(|| StoreError::corrupted("bad meta page header"))?;
        if !header.is_meta() {
            return Err(StoreError::Invalid("page is not a meta"));
        }
        let body = &page[PAGE_HEADER_SIZE..];
        let magic = u64::from_le_bytes(body[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic >> 8 != MAGIC {
            return Err(StoreError::Invalid("not a database file"));
        }
        if magic != DATA_MAGIC {
            return Err(StoreError::VersionMismatch);
        }
        let txnid_a =
            u64::from_le_bytes(body[OFF_TXNID_A..OFF_TXNID_A + 8].try_into().unwrap());
        let txnid_b =
            u64::from_le_bytes(body[OFF_TXNID_B..OFF_TXNID_B + 8].try_into().unwrap());
        if txnid_a == 0 || txnid_a != txnid_b {
            return Ok(None);
        }
        Ok(Some(Self {
            txnid: txnid_a,
            geometry: Geometry::read(&body[OFF_GEOMETRY..])?,
            gc: TreeDesc::read(&body[OFF_GC..])?,
            main: TreeDesc::read(&body[OFF_MAIN..])?,
            canary: Canary {
                x: u64::from_le_bytes(body[OFF_CANARY..OFF_CANARY + 8].try_into().unwrap()),
                y: u64::from_le_bytes(body[OFF_CANARY + 8..OFF_CANARY + 16].try_into().unwrap()),
                z: u64::from_le_bytes(body[OFF_CANARY + 16..OFF_CANARY + 24].try_into().unwrap()),
                v: u64::from_le_bytes(body[OFF_CANARY + 24..OFF_CANARY + 32].try_into().unwrap()),
            },
            sign: u64::from_le_bytes(body[OFF_SIGN..OFF_SIGN + 8].try_into().unwrap()),
            pages_retired: u64::from_le_bytes(
                body[OFF_PAGES_RETIRED..OFF_PAGES_RETIRED + 8].try_into().unwrap(),
            ),
            boot_id: body[OFF_BOOT_ID..OFF_BOOT_ID + 16].try_into().unwrap(),
            dxb_id: body[OFF_DXB_ID..OFF_DXB_ID + 16].try_into().unwrap(),
        }))
    }

    /// Encode a full meta page image.
    ///
    /// When `in_progress` is set, `txnid_b` stays zero; the caller writes
    /// it separately as the final step of the two-phase update.
    pub fn encode(&self, pgno: Pgno, page_size: usize, in_progress: bool) -> PageBuf {
        let mut buf = PageBuf::zeroed(page_size);
        PageHeader {
            txnid: 0,
            dupfix_ksize: 0,
            flags: PageFlags::META,
            lower: 0,
            upper: 0,
            pgno,
        }
        .write(buf.as_bytes_mut());

        let body = &mut buf.as_bytes_mut()[PAGE_HEADER_SIZE..];
        body[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&DATA_MAGIC.to_le_bytes());
        body[OFF_TXNID_A..OFF_TXNID_A + 8].copy_from_slice(&self.txnid.to_le_bytes());
        self.geometry.write(&mut body[OFF_GEOMETRY..OFF_GEOMETRY + GEOMETRY_SIZE]);
        self.gc.write(&mut body[OFF_GC..OFF_GC + TREE_DESC_SIZE]);
        self.main.write(&mut body[OFF_MAIN..OFF_MAIN + TREE_DESC_SIZE]);
        body[OFF_CANARY..OFF_CANARY + 8].copy_from_slice(&self.canary.x.to_le_bytes());
        body[OFF_CANARY + 8..OFF_CANARY + 16].copy_from_slice(&self.canary.y.to_le_bytes());
        body[OFF_CANARY + 16..OFF_CANARY + 24].copy_from_slice(&self.canary.z.to_le_bytes());
        body[OFF_CANARY + 24..OFF_CANARY + 32].copy_from_slice(&self.canary.v.to_le_bytes());
        body[OFF_SIGN..OFF_SIGN + 8].copy_from_slice(&self.sign.to_le_bytes());
        let txnid_b = if in_progress { 0 } else { self.txnid };
        body[OFF_TXNID_B..OFF_TXNID_B + 8].copy_from_slice(&txnid_b.to_le_bytes());
        body[OFF_PAGES_RETIRED..OFF_PAGES_RETIRED + 8]
            .copy_from_slice(&self.pages_retired.to_le_bytes());
        body[OFF_BOOT_ID..OFF_BOOT_ID + 16].copy_from_slice(&self.boot_id);
        body[OFF_DXB_ID..OFF_DXB_ID + 16].copy_from_slice(&self.dxb_id);
        buf
    }

    pub fn is_steady(&self) -> bool {
        self.sign == SIGN_STEADY
    }

    /// Read the page size out of a meta page image without requiring the
    /// meta to be consistent; the creation-time field is rewritten
    /// identically by every commit, so it survives a torn rotation.
    pub fn probe_page_size(page: &[u8]) -> Result<usize> {
        if page.len() < PAGE_HEADER_SIZE + META_BODY_SIZE {
            return Err(StoreError::corrupted("meta page truncated"));
        }
        let body = &page[PAGE_HEADER_SIZE..];
        let magic = u64::from_le_bytes(body[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic >> 8 != MAGIC {
            return Err(StoreError::Invalid("not a database file"));
        }
        if magic != DATA_MAGIC {
            return Err(StoreError::VersionMismatch);
        }
        let gc = TreeDesc::read(&body[OFF_GC..])?;
        let ps = gc.dupfix_size as usize;
        if !ps.is_power_of_two() || !(crate::types::MIN_PAGE_SIZE..=crate::types::MAX_PAGE_SIZE).contains(&ps) {
            return Err(StoreError::corrupted("meta carries an invalid page size"));
        }
        Ok(ps)
    }

    /// The `txnid_a` of a slot regardless of consistency; an interrupted
    /// rotation leaves it newer than any consistent meta.
    pub fn raw_txnid_a(page: &[u8]) -> TxnId {
        u64::from_le_bytes(
            page[PAGE_HEADER_SIZE + OFF_TXNID_A..PAGE_HEADER_SIZE + OFF_TXNID_A + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// The meta pair written for a brand-new database
    pub fn bootstrap(geometry: Geometry, page_size: usize) -> Self {
        let mut gc = TreeDesc::empty(crate::types::DbFlags::INTEGER_KEY);
        gc.dupfix_size = page_size as u32;
        Self {
            txnid: 1,
            geometry,
            gc,
            main: TreeDesc::empty(crate::types::DbFlags::empty()),
            canary: Canary::default(),
            sign: SIGN_STEADY,
            pages_retired: 0,
            boot_id: runtime_id(),
            dxb_id: runtime_id(),
        }
    }

    /// Page size recorded at database creation
    pub fn page_size(&self) -> usize {
        self.gc.dupfix_size as usize
    }

    /// Signature for a commit, by durability
    pub fn sign_for(durable: bool) -> u64 {
        if durable {
            SIGN_STEADY
        } else {
            SIGN_WEAK
        }
    }
}

/// Pick the recent meta: highest txnid among the consistent slots
pub fn pick_recent(metas: &[Option<Meta>; NUM_METAS]) -> Option<(usize, Meta)> {
    metas
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.map(|m| (i, m)))
        .max_by_key(|(_, m)| m.txnid)
}

/// Pick the steady meta: highest txnid among slots signed as synced
pub fn pick_steady(metas: &[Option<Meta>; NUM_METAS]) -> Option<(usize, Meta)> {
    metas
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.map(|m| (i, m)))
        .filter(|(_, m)| m.is_steady())
        .max_by_key(|(_, m)| m.txnid)
}

/// Pick the slot the next commit overwrites: an invalid slot if any,
/// otherwise the oldest txnid
pub fn pick_target(metas: &[Option<Meta>; NUM_METAS]) -> usize {
    for (i, m) in metas.iter().enumerate() {
        if m.is_none() {
            return i;
        }
    }
    metas
        .iter()
        .enumerate()
        .min_by_key(|(_, m)| m.unwrap().txnid)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Process-stable 16-byte id; stands in for the host boot id in metas
pub fn process_boot_id() -> [u8; 16] {
    use std::sync::OnceLock;
    static ID: OnceLock<[u8; 16]> = OnceLock::new();
    *ID.get_or_init(runtime_id)
}

/// A 16-byte id from the process and the clock; stands in for the host
/// boot id and stamps fresh database files
pub fn runtime_id() -> [u8; 16] {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let pid = std::process::id() as u128;
    let mixed = nanos ^ (pid << 96) ^ 0x9E37_79B9_7F4A_7C15_u128.rotate_left(17);
    mixed.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DbFlags;

    fn sample(txnid: TxnId, sign: u64) -> Meta {
        let geo = GeometrySettings::default().resolve(4096).unwrap();
        let mut meta = Meta::bootstrap(geo, 4096);
        meta.txnid = txnid;
        meta.sign = sign;
        meta
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut meta = sample(9, SIGN_STEADY);
        meta.main = TreeDesc {
            root: Pgno(11),
            items: 70,
            height: 2,
            leaf_pages: 4,
            ..TreeDesc::empty(DbFlags::empty())
        };
        meta.canary = Canary { x: 1, y: 2, z: 3, v: 9 };
        let page = meta.encode(Pgno(1), 4096, false);
        let back = Meta::decode(page.as_bytes()).unwrap().unwrap();
        assert_eq!(back.txnid, 9);
        assert_eq!(back.main.root, Pgno(11));
        assert_eq!(back.main.items, 70);
        assert_eq!(back.canary.v, 9);
        assert_eq!(back.page_size(), 4096);
        assert!(back.is_steady());
    }

    #[test]
    fn test_in_progress_meta_is_rejected() {
        let meta = sample(5, SIGN_STEADY);
        let page = meta.encode(Pgno(0), 4096, true);
        assert!(Meta::decode(page.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_and_version() {
        let meta = sample(5, SIGN_STEADY);
        let mut page = meta.encode(Pgno(0), 4096, false);
        page.as_bytes_mut()[PAGE_HEADER_SIZE + 7] ^= 0xFF;
        assert!(matches!(
            Meta::decode(page.as_bytes()),
            Err(StoreError::Invalid(_))
        ));

        let mut page = meta.encode(Pgno(0), 4096, false);
        page.as_bytes_mut()[PAGE_HEADER_SIZE] = 4; // version byte
        assert!(matches!(
            Meta::decode(page.as_bytes()),
            Err(StoreError::VersionMismatch)
        ));
    }

    #[test]
    fn test_recent_steady_target() {
        let metas = [
            Some(sample(4, SIGN_WEAK)),
            Some(sample(3, SIGN_STEADY)),
            Some(sample(2, SIGN_STEADY)),
        ];
        assert_eq!(pick_recent(&metas).unwrap().0, 0);
        assert_eq!(pick_steady(&metas).unwrap().0, 1);
        assert_eq!(pick_target(&metas), 2);

        let with_hole = [Some(sample(4, SIGN_WEAK)), None, Some(sample(2, SIGN_STEADY))];
        assert_eq!(pick_target(&with_hole), 1);
        assert_eq!(pick_recent(&with_hole).unwrap().1.txnid, 4);
    }
}
