//! Page protection flags and protection requests.
//!
//! Protection control is the write-barrier mechanism: the collector marks
//! pages read-only after a collection and the first store to such a page
//! traps into the fault trampoline.

use crate::page::PageSize;

bitflags::bitflags! {
    /// Access rights for a page-aligned range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        /// Pages may be read.
        const READ = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// No access at all (guard pages).
    pub const NONE: Self = Self::empty();

    /// Read and write, the default for heap reservations.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Read, write and execute.
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    /// Whether this is the write-barrier state: readable but not writable.
    #[inline]
    pub const fn is_write_protected(self) -> bool {
        self.contains(Self::READ) && !self.contains(Self::WRITE)
    }

    /// Convert to the `PROT_*` bits expected by `mmap`/`mprotect`.
    #[cfg(unix)]
    #[inline]
    pub fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl Default for Protection {
    #[inline]
    fn default() -> Self {
        Self::READ_WRITE
    }
}

/// A request to change access rights on a range of memory.
///
/// The range is widened to whole pages when applied: the address is
/// truncated to its page and the end is rounded up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionRequest {
    /// Start of the range (need not be page aligned).
    pub addr: usize,
    /// Length of the range in bytes.
    pub len: usize,
    /// Rights to apply.
    pub flags: Protection,
}

impl ProtectionRequest {
    /// Create a new request.
    #[inline]
    pub const fn new(addr: usize, len: usize, flags: Protection) -> Self {
        Self { addr, len, flags }
    }

    /// Write-protect a range (read-only).
    #[inline]
    pub const fn write_protect(addr: usize, len: usize) -> Self {
        Self::new(addr, len, Protection::READ)
    }

    /// Lift write protection on a range.
    #[inline]
    pub const fn unprotect(addr: usize, len: usize) -> Self {
        Self::new(addr, len, Protection::READ_WRITE)
    }

    /// The page-aligned superset this request applies to, as `(base, len)`.
    #[inline]
    pub const fn aligned(&self, page: PageSize) -> (usize, usize) {
        page.covering(self.addr, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert!(Protection::NONE.is_empty());
        assert_eq!(Protection::ALL.bits(), 0b111);
        assert_eq!(Protection::default(), Protection::READ_WRITE);
    }

    #[test]
    fn test_is_write_protected() {
        assert!(Protection::READ.is_write_protected());
        assert!((Protection::READ | Protection::EXECUTE).is_write_protected());
        assert!(!Protection::READ_WRITE.is_write_protected());
        assert!(!Protection::NONE.is_write_protected());
    }

    #[test]
    fn test_to_native() {
        assert_eq!(Protection::NONE.to_native(), libc::PROT_NONE);
        assert_eq!(
            Protection::READ_WRITE.to_native(),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            Protection::ALL.to_native(),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        );
    }

    #[test]
    fn test_request_alignment() {
        let page = PageSize::new(4096).unwrap();
        let req = ProtectionRequest::write_protect(0x1800, 0x1000);
        assert_eq!(req.aligned(page), (0x1000, 0x2000));
        assert_eq!(req.flags, Protection::READ);
    }
}
