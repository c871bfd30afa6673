//! Database geometry: the file-size policy.

use crate::error::{Result, StoreError};
use crate::types::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Size of the serialized geometry inside a meta
pub const GEOMETRY_SIZE: usize = 20;

/// On-disk geometry, all sizes in pages.
///
/// Layout (20 bytes, little-endian): grow step u16, shrink threshold u16,
/// lower u32, upper u32, now u32, next u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// File growth step in pages
    pub grow: u16,
    /// Shrink back when this many pages sit unused past the watermark
    pub shrink: u16,
    /// Smallest allowed file size
    pub lower: u32,
    /// Largest allowed file size
    pub upper: u32,
    /// Current file size
    pub now: u32,
    /// First never-allocated page
    pub next: u32,
}

impl Geometry {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GEOMETRY_SIZE {
            return Err(StoreError::corrupted("geometry truncated"));
        }
        Ok(Self {
            grow: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            shrink: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            lower: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            upper: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            now: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            next: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..2].copy_from_slice(&self.grow.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.shrink.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.lower.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.upper.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.now.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.next.to_le_bytes());
    }
}

/// User-facing geometry configuration, all sizes in bytes.
///
/// Values are rounded up to whole pages and to the host memory-page size
/// at open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeometrySettings {
    /// Smallest file size the environment may shrink to
    pub size_lower: usize,
    /// Initial file size for a fresh database
    pub size_now: usize,
    /// Hard ceiling for file growth; `MapFull` beyond this
    pub size_upper: usize,
    /// Bytes added per growth step
    pub growth_step: usize,
    /// Shrink the file once this many bytes sit unused past the watermark
    pub shrink_threshold: usize,
}

impl Default for GeometrySettings {
    fn default() -> Self {
        Self {
            size_lower: 64 * 1024,
            size_now: 1024 * 1024,
            size_upper: 1024 * 1024 * 1024,
            growth_step: 1024 * 1024,
            shrink_threshold: 4 * 1024 * 1024,
        }
    }
}

impl GeometrySettings {
    /// Resolve the byte-based settings into page counts.
    ///
    /// The file must stay aligned to the host memory page, so every bound
    /// is rounded up to the least common granule of the database page and
    /// the host page.
    pub fn resolve(&self, page_size: usize) -> Result<Geometry> {
        if !page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
        {
            return Err(StoreError::Invalid("unsupported page size"));
        }
        let granule = page_size.max(page_size::get());
        let round = |bytes: usize| -> u32 {
            (bytes.div_ceil(granule) * granule / page_size) as u32
        };

        let lower = round(self.size_lower).max(crate::types::NUM_METAS as u32 + 1);
        let upper = round(self.size_upper);
        let now = round(self.size_now).clamp(lower, upper.max(lower));
        if upper < lower {
            return Err(StoreError::Invalid("geometry upper below lower"));
        }
        let grow = round(self.growth_step).min(u16::MAX as u32) as u16;
        let shrink = round(self.shrink_threshold).min(u16::MAX as u32) as u16;
        Ok(Geometry {
            grow: grow.max(1),
            shrink,
            lower,
            upper,
            now,
            next: crate::types::NUM_METAS as u32,
        })
    }
}

/// Pages the file should hold after growing to reach `needed`
pub fn grown_size(geo: &Geometry, needed: u32) -> Result<u32> {
    if needed > geo.upper {
        return Err(StoreError::MapFull);
    }
    let step = geo.grow.max(1) as u32;
    let grown = geo.now.max(needed.div_ceil(step) * step);
    Ok(grown.min(geo.upper).max(needed))
}

/// Pages the file may shrink to, honoring the shrink threshold, or `None`
/// when no shrink is due
pub fn shrunk_size(geo: &Geometry) -> Option<u32> {
    if geo.shrink == 0 {
        return None;
    }
    let slack = geo.now.saturating_sub(geo.next);
    if slack < geo.shrink as u32 {
        return None;
    }
    let step = geo.grow.max(1) as u32;
    let target = geo.next.div_ceil(step) * step;
    Some(target.clamp(geo.lower, geo.now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let geo = Geometry {
            grow: 16,
            shrink: 64,
            lower: 4,
            upper: 1000,
            now: 256,
            next: 37,
        };
        let mut bytes = [0u8; GEOMETRY_SIZE];
        geo.write(&mut bytes);
        assert_eq!(Geometry::read(&bytes).unwrap(), geo);
    }

    #[test]
    fn test_resolve_defaults() {
        let geo = GeometrySettings::default().resolve(4096).unwrap();
        assert!(geo.lower >= 4);
        assert!(geo.now >= geo.lower);
        assert!(geo.upper >= geo.now);
        assert_eq!(geo.next, 3);
    }

    #[test]
    fn test_grow_steps() {
        let geo = Geometry {
            grow: 16,
            shrink: 0,
            lower: 4,
            upper: 100,
            now: 32,
            next: 30,
        };
        // within the current size nothing grows
        assert_eq!(grown_size(&geo, 20).unwrap(), 32);
        // beyond it, grow in whole steps
        assert_eq!(grown_size(&geo, 33).unwrap(), 48);
        // clamped at the upper bound
        assert_eq!(grown_size(&geo, 99).unwrap(), 100);
        assert!(matches!(grown_size(&geo, 101), Err(StoreError::MapFull)));
    }

    #[test]
    fn test_shrink_threshold() {
        let mut geo = Geometry {
            grow: 16,
            shrink: 32,
            lower: 16,
            upper: 1000,
            now: 128,
            next: 40,
        };
        assert_eq!(shrunk_size(&geo), Some(48));
        geo.next = 120;
        assert_eq!(shrunk_size(&geo), None);
    }
}
