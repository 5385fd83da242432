//! Address-range keys and page alignment.

use crate::error::{Error, Result};
use std::fmt;

/// A registered (or requested) byte range `[address, address + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// First byte of the range.
    pub address: u64,
    /// Length of the range in bytes.
    pub length: u64,
}

impl CacheKey {
    /// Create a key without validation.
    #[inline]
    pub const fn new(address: u64, length: u64) -> Self {
        Self { address, length }
    }

    /// Create a key, rejecting empty ranges and ranges that wrap the
    /// address space.
    pub fn checked(address: u64, length: u64) -> Result<Self> {
        if length == 0 {
            return Err(Error::InvalidArgument("length must be > 0".into()));
        }
        address.checked_add(length).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "range {address:#x}+{length:#x} overflows the address space"
            ))
        })?;
        Ok(Self { address, length })
    }

    /// One past the last byte of the range.
    #[inline]
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.length)
    }

    /// Inclusive-endpoint overlap test.
    ///
    /// Ranges that merely touch (`a.end() == b.address`) count as
    /// overlapping, so back-to-back registrations get merged.
    #[inline]
    pub fn overlaps(&self, other: &CacheKey) -> bool {
        self.address <= other.end() && other.address <= self.end()
    }

    /// True if `self` fully contains `other`.
    #[inline]
    pub fn subsumes(&self, other: &CacheKey) -> bool {
        self.address <= other.address && self.end() >= other.end()
    }

    /// Smallest range covering both keys.
    pub fn union(&self, other: &CacheKey) -> CacheKey {
        let address = self.address.min(other.address);
        let end = self.end().max(other.end());
        CacheKey::new(address, end - address)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.address, self.length)
    }
}

/// Host page size in bytes.
pub fn page_size() -> u64 {
    rustix::param::page_size() as u64
}

/// Expand `[address, address + length)` to whole pages.
///
/// The start is rounded down and the end rounded up to `page_size`, which
/// must be a power of two.
pub fn page_align(address: u64, length: u64, page_size: u64) -> Result<CacheKey> {
    if !page_size.is_power_of_two() {
        return Err(Error::InvalidArgument(format!(
            "page size {page_size} is not a power of two"
        )));
    }
    let requested = CacheKey::checked(address, length)?;

    let mask = page_size - 1;
    let base = requested.address & !mask;
    let end = requested
        .end()
        .checked_add(mask)
        .map(|end| end & !mask)
        .ok_or_else(|| {
            Error::InvalidArgument(format!("range {requested} cannot be page aligned"))
        })?;

    Ok(CacheKey::new(base, end - base))
}
