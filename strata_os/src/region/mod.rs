//! Managed address ranges.
//!
//! A [`MemoryRegion`] is a page-aligned range reserved from the OS and
//! tracked as one unit of placement and protection. The
//! [`RegionRegistry`] keeps every live region and answers "which region,
//! if any, owns this address" from any thread, including from inside the
//! protection-fault handler.

mod registry;

pub use registry::RegionRegistry;
pub(crate) use registry::RegionState;

use crate::protect::Protection;

/// A contiguous, page-aligned address range owned by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    /// Human-readable name used in diagnostics (e.g. `"dynamic"`).
    pub name: &'static str,
    /// First byte of the region.
    pub base: usize,
    /// Length in bytes (a whole number of pages).
    pub len: usize,
    /// Rights most recently applied to the whole region.
    pub protection: Protection,
    /// Whether the base address was chosen by the OS.
    pub movable: bool,
}

impl MemoryRegion {
    /// Describe a region.
    #[inline]
    pub const fn new(
        name: &'static str,
        base: usize,
        len: usize,
        protection: Protection,
        movable: bool,
    ) -> Self {
        Self {
            name,
            base,
            len,
            protection,
            movable,
        }
    }

    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> usize {
        self.base + self.len
    }

    /// Whether `addr` lies inside the region.
    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.len
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region.
    #[inline]
    pub const fn contains_range(&self, addr: usize, len: usize) -> bool {
        self.contains(addr) && len <= self.len - (addr - self.base)
    }

    /// Whether two regions share at least one byte.
    #[inline]
    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Base address as a raw pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: usize, len: usize) -> MemoryRegion {
        MemoryRegion::new("test", base, len, Protection::READ_WRITE, true)
    }

    #[test]
    fn test_contains_is_half_open() {
        let r = region(0x1000, 0x2000);
        assert!(r.contains(0x1000));
        assert!(r.contains(0x2fff));
        assert!(!r.contains(0x3000));
        assert!(!r.contains(0x0fff));
        assert_eq!(r.end(), 0x3000);
    }

    #[test]
    fn test_contains_range() {
        let r = region(0x1000, 0x2000);
        assert!(r.contains_range(0x1000, 0x2000));
        assert!(r.contains_range(0x2000, 0x1000));
        assert!(!r.contains_range(0x2000, 0x1001));
        assert!(!r.contains_range(0x0, 0x1000));
    }

    #[test]
    fn test_overlaps() {
        let a = region(0x1000, 0x2000);
        assert!(a.overlaps(&region(0x2000, 0x1000)));
        assert!(a.overlaps(&region(0x0, 0x2000)));
        assert!(!a.overlaps(&region(0x3000, 0x1000)));
        assert!(!a.overlaps(&region(0x0, 0x1000)));
    }
}
