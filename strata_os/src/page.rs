//! Page size discovery and page-grain alignment helpers.
//!
//! The OS page size is queried once when the [`OsContext`](crate::OsContext)
//! is created and then carried by value. Every helper here is a pure
//! function over that cached size.

use std::fmt;

/// The platform page size, guaranteed to be a power of two.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSize(usize);

impl PageSize {
    /// Query the page size from the OS.
    #[cfg(unix)]
    pub fn query() -> Self {
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        // sysconf only fails for unknown names; _SC_PAGESIZE is always known.
        let size = if raw > 0 { raw as usize } else { 4096 };
        Self::new(size).unwrap_or(PageSize(4096))
    }

    /// Wrap an explicit page size. Returns `None` unless `size` is a
    /// non-zero power of two.
    #[inline]
    pub const fn new(size: usize) -> Option<Self> {
        if size.is_power_of_two() {
            Some(PageSize(size))
        } else {
            None
        }
    }

    /// Page size in bytes.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    const fn mask(self) -> usize {
        self.0 - 1
    }

    /// Truncate an address down to the start of its page.
    #[inline]
    pub const fn trunc(self, addr: usize) -> usize {
        addr & !self.mask()
    }

    /// Round an address up to the next page boundary.
    ///
    /// Saturates at the last page boundary of the address space instead of
    /// wrapping.
    #[inline]
    pub const fn round_up(self, addr: usize) -> usize {
        match addr.checked_add(self.mask()) {
            Some(sum) => sum & !self.mask(),
            None => usize::MAX & !self.mask(),
        }
    }

    /// Truncate a byte count down to a whole number of pages.
    #[inline]
    pub const fn trunc_size(self, size: usize) -> usize {
        self.trunc(size)
    }

    /// Round a byte count up to a whole number of pages.
    #[inline]
    pub const fn round_up_size(self, size: usize) -> usize {
        self.round_up(size)
    }

    /// Check whether an address (or size) is page aligned.
    #[inline]
    pub const fn is_aligned(self, addr: usize) -> bool {
        addr & self.mask() == 0
    }

    /// Number of pages spanned by `len` bytes starting at a page boundary.
    #[inline]
    pub const fn page_count(self, len: usize) -> usize {
        self.round_up_size(len) >> self.0.trailing_zeros()
    }

    /// Smallest page-aligned range that covers `[addr, addr + len)`.
    ///
    /// Returns `(base, len)`.
    #[inline]
    pub const fn covering(self, addr: usize, len: usize) -> (usize, usize) {
        let base = self.trunc(addr);
        let end = self.round_up(addr.saturating_add(len));
        (base, end - base)
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageSize({:#x})", self.0)
    }
}
