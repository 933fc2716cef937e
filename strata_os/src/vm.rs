//! Address-space reservation and protection control.
//!
//! [`AddressSpace`] wraps `mmap`/`munmap`/`mprotect` behind one contract
//! and keeps the [`RegionRegistry`] in step with what the OS has mapped:
//! every successful reservation is registered, every release unregisters
//! before unmapping.
//!
//! # Failure policy
//!
//! | Operation                  | On failure                          |
//! |----------------------------|-------------------------------------|
//! | `Any` / `Preferred` / `Low`| retry with an OS-chosen address     |
//! | `Fixed`                    | `AddressUnavailable`                |
//! | `map_file`                 | `MapFailed`                         |
//! | `protect`                  | `ProtectFailed` / `NotManaged`      |
//!
//! The `*_or_die` forms are for critical paths and abort the process.

use std::os::fd::{AsRawFd, BorrowedFd};

use tracing::{debug, trace, warn};

use crate::error::{OsError, fatal};
use crate::page::PageSize;
use crate::protect::{Protection, ProtectionRequest};
use crate::region::{MemoryRegion, RegionRegistry};
use crate::stats::OsStats;

// =============================================================================
// Platform layer
// =============================================================================

#[cfg(unix)]
pub(crate) mod platform {
    use std::io;
    use std::ptr;

    use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, c_int, c_void};

    use crate::protect::Protection;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const ANON_FLAGS: c_int = MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const ANON_FLAGS: c_int = MAP_PRIVATE | MAP_ANONYMOUS;

    /// Extra flags asking for an exact address without clobbering mappings.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NOREPLACE: c_int = libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NOREPLACE: c_int = 0;

    /// Extra flags preferring the low 2GB of the address space.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub const LOW_FLAGS: c_int = libc::MAP_32BIT;
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    pub const LOW_FLAGS: c_int = 0;

    /// Map anonymous memory, using `hint` only as a preference.
    pub fn map_anonymous(hint: usize, len: usize, prot: Protection, extra: c_int) -> io::Result<usize> {
        let ptr = unsafe {
            libc::mmap(
                hint as *mut c_void,
                len,
                prot.to_native(),
                ANON_FLAGS | extra,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as usize)
        }
    }

    /// Map anonymous memory at exactly `addr`, failing if anything is there.
    pub fn map_exact(addr: usize, len: usize, prot: Protection) -> io::Result<usize> {
        let base = map_anonymous(addr, len, prot, NOREPLACE)?;
        if base != addr {
            // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
            unsafe { unmap(base, len) }?;
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        Ok(base)
    }

    /// Replace `[addr, addr + len)` with fresh zero pages.
    ///
    /// # Safety
    ///
    /// The range must be owned by the caller; its contents are discarded.
    pub unsafe fn remap_anonymous(addr: usize, len: usize, prot: Protection) -> io::Result<()> {
        let ptr = unsafe {
            libc::mmap(
                addr as *mut c_void,
                len,
                prot.to_native(),
                ANON_FLAGS | MAP_FIXED,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Map `len` bytes of a file at `addr`.
    ///
    /// # Safety
    ///
    /// With `replace` set, whatever was mapped at `addr` is discarded.
    pub unsafe fn map_file(
        fd: c_int,
        offset: u64,
        addr: usize,
        len: usize,
        prot: Protection,
        replace: bool,
    ) -> io::Result<usize> {
        let placement = if replace { MAP_FIXED } else { NOREPLACE };
        let ptr = unsafe {
            libc::mmap(
                addr as *mut c_void,
                len,
                prot.to_native(),
                MAP_PRIVATE | placement,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = ptr as usize;
        if base != addr {
            unsafe { unmap(base, len) }?;
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        Ok(base)
    }

    /// Unmap a range.
    ///
    /// # Safety
    ///
    /// Nothing may access the range afterwards.
    pub unsafe fn unmap(addr: usize, len: usize) -> io::Result<()> {
        if unsafe { libc::munmap(addr as *mut c_void, len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Change access rights. Async-signal-safe.
    ///
    /// # Safety
    ///
    /// Removing rights makes later accesses to the range fault.
    #[inline]
    pub unsafe fn protect(addr: usize, len: usize, prot: Protection) -> bool {
        unsafe { libc::mprotect(addr as *mut c_void, len, prot.to_native()) == 0 }
    }

    /// Make freshly written instructions in a range visible to execution.
    #[cfg(target_arch = "aarch64")]
    pub fn flush_icache(addr: usize, len: usize) {
        use std::arch::asm;

        let end = addr + len;
        let ctr: u64;
        unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);

        let mut line = addr & !(dline - 1);
        while line < end {
            unsafe { asm!("dc cvau, {}", in(reg) line, options(nostack)) };
            line += dline;
        }
        unsafe { asm!("dsb ish", options(nostack)) };

        let mut line = addr & !(iline - 1);
        while line < end {
            unsafe { asm!("ic ivau, {}", in(reg) line, options(nostack)) };
            line += iline;
        }
        unsafe { asm!("dsb ish", "isb", options(nostack)) };
    }

    /// Instruction and data caches are coherent; nothing to do.
    #[cfg(not(target_arch = "aarch64"))]
    #[inline]
    pub fn flush_icache(_addr: usize, _len: usize) {
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// Fill a range with zero bytes.
    ///
    /// # Safety
    ///
    /// The range must be mapped writable (or write-protected with the
    /// fault handler installed).
    #[inline]
    pub unsafe fn fill_zero(addr: usize, len: usize) {
        if len > 0 {
            unsafe { ptr::write_bytes(addr as *mut u8, 0, len) };
        }
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Where a reservation should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Exactly this address or fail. For regions whose address is baked
    /// into other data structures.
    Fixed(usize),
    /// This address if free, otherwise anywhere.
    Preferred(usize),
    /// Anywhere, preferring low addresses where the platform can express it.
    Low,
    /// Anywhere.
    Any,
}

impl Placement {
    /// Whether the OS may choose a different address than requested.
    #[inline]
    pub fn is_relocatable(self) -> bool {
        !matches!(self, Placement::Fixed(_))
    }
}

// =============================================================================
// AddressSpace
// =============================================================================

/// Reservation, release, file mapping and protection over the registry.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace<'a> {
    registry: &'a RegionRegistry,
    stats: &'a OsStats,
    page: PageSize,
    zero_remap_threshold: usize,
}

impl<'a> AddressSpace<'a> {
    /// Bind an address space to a registry.
    pub fn new(registry: &'a RegionRegistry, stats: &'a OsStats, zero_remap_threshold: usize) -> Self {
        Self {
            registry,
            stats,
            page: registry.page_size(),
            zero_remap_threshold,
        }
    }

    /// Page size used for all alignment.
    #[inline]
    pub fn page_size(&self) -> PageSize {
        self.page
    }

    // =========================================================================
    // Reservation
    // =========================================================================

    /// Reserve `len` bytes (rounded up to whole pages) read/write.
    pub fn reserve(
        &self,
        name: &'static str,
        len: usize,
        placement: Placement,
    ) -> Result<MemoryRegion, OsError> {
        self.reserve_with(name, len, placement, Protection::READ_WRITE)
    }

    /// Reserve `len` bytes with explicit initial rights.
    ///
    /// The new region is registered before this returns; if registration
    /// fails the mapping is undone.
    pub fn reserve_with(
        &self,
        name: &'static str,
        len: usize,
        placement: Placement,
        protection: Protection,
    ) -> Result<MemoryRegion, OsError> {
        if len == 0 {
            return Err(OsError::EmptyRange);
        }
        let len = self.page.round_up_size(len);

        let base = match placement {
            Placement::Fixed(addr) => {
                if !self.page.is_aligned(addr) {
                    return Err(OsError::Unaligned { addr });
                }
                platform::map_exact(addr, len, protection).map_err(|err| {
                    debug!(addr = format_args!("{:#x}", addr), len, %err, "fixed reservation refused");
                    OsError::AddressUnavailable {
                        requested: addr,
                        len,
                    }
                })?
            }
            Placement::Preferred(addr) => self.map_relocatable(self.page.trunc(addr), len, protection, 0)?,
            Placement::Low => self.map_relocatable(0, len, protection, platform::LOW_FLAGS)?,
            Placement::Any => self.map_relocatable(0, len, protection, 0)?,
        };

        let region = MemoryRegion::new(name, base, len, protection, placement.is_relocatable());
        if let Err(err) = self.registry.register(region) {
            // Safety: the mapping was created above and never handed out.
            if let Err(unmap_err) = unsafe { platform::unmap(base, len) } {
                warn!(%unmap_err, "failed to undo reservation of {:#x}+{:#x}", base, len);
            }
            return Err(err);
        }

        self.stats.record_reserve(len);
        debug!(
            name,
            base = format_args!("{:#x}", base),
            len,
            ?placement,
            "reserved region"
        );
        Ok(region)
    }

    /// Map relocatable memory, retrying with an OS-chosen address.
    fn map_relocatable(
        &self,
        hint: usize,
        len: usize,
        protection: Protection,
        extra: libc::c_int,
    ) -> Result<usize, OsError> {
        match platform::map_anonymous(hint, len, protection, extra) {
            Ok(base) => {
                if hint != 0 && base != hint {
                    debug!(
                        hint = format_args!("{:#x}", hint),
                        base = format_args!("{:#x}", base),
                        "preferred address taken, placed elsewhere"
                    );
                }
                return Ok(base);
            }
            Err(err) if hint == 0 && extra == 0 => {
                return Err(OsError::MapFailed {
                    addr: 0,
                    len,
                    reason: err.to_string(),
                });
            }
            Err(err) => debug!(%err, "placement preference failed, retrying anywhere"),
        }

        platform::map_anonymous(0, len, protection, 0).map_err(|err| OsError::MapFailed {
            addr: hint,
            len,
            reason: err.to_string(),
        })
    }

    /// Reserve or abort. For regions the collector cannot live without.
    pub fn reserve_or_die(&self, name: &'static str, len: usize, placement: Placement) -> MemoryRegion {
        match self.reserve(name, len, placement) {
            Ok(region) => region,
            Err(err) => {
                let addr = match placement {
                    Placement::Fixed(a) | Placement::Preferred(a) => a,
                    Placement::Low | Placement::Any => 0,
                };
                fatal("os_validate", addr, len, &err)
            }
        }
    }

    /// Undo a reservation.
    ///
    /// The region is unregistered before it is unmapped, so the fault
    /// handler never classifies an address that is about to disappear.
    pub fn release(&self, region: &MemoryRegion) -> Result<(), OsError> {
        let removed = self
            .registry
            .unregister(region)
            .map_err(|_| OsError::NotReserved { base: region.base })?;

        // Safety: the region is no longer registered; the caller gives up
        // every reference into it.
        if let Err(err) = unsafe { platform::unmap(removed.base, removed.len) } {
            warn!(%err, "munmap({:#x}, {:#x}) failed", removed.base, removed.len);
        }
        self.stats.record_release(removed.len);
        debug!(
            name = removed.name,
            base = format_args!("{:#x}", removed.base),
            len = removed.len,
            "released region"
        );
        Ok(())
    }

    /// Scratch memory at an OS-chosen address.
    pub fn allocate(&self, len: usize) -> Result<MemoryRegion, OsError> {
        self.reserve("scratch", len, Placement::Any)
    }

    /// Release memory obtained from [`allocate`](Self::allocate).
    pub fn deallocate(&self, region: &MemoryRegion) -> Result<(), OsError> {
        self.release(region)
    }

    // =========================================================================
    // File mapping
    // =========================================================================

    /// Map `len` bytes of `fd` starting at `offset` at exactly `addr`.
    ///
    /// Used to restore a saved heap image whose internal pointers depend on
    /// its address. Inside a managed region the pages are replaced in place;
    /// over unmanaged memory the range must be free and is registered as a
    /// new fixed region named `"image"`.
    ///
    /// # Safety
    ///
    /// Any previous contents of a managed range are discarded.
    pub unsafe fn map_file(
        &self,
        fd: BorrowedFd<'_>,
        offset: u64,
        addr: usize,
        len: usize,
    ) -> Result<(), OsError> {
        if !self.page.is_aligned(addr) {
            return Err(OsError::Unaligned { addr });
        }
        if !self.page.is_aligned(offset as usize) {
            return Err(OsError::Unaligned {
                addr: offset as usize,
            });
        }
        if len == 0 {
            return Err(OsError::EmptyRange);
        }
        let len = self.page.round_up_size(len);
        let prot = Protection::READ_WRITE;
        let raw = fd.as_raw_fd();

        let managed = self.registry.with_range(addr, len, |state| {
            // Safety: the range lies in a region we own.
            let mapped = unsafe { platform::map_file(raw, offset, addr, len, prot, true) };
            if mapped.is_ok() {
                state.store_pages(addr, len, prot);
            }
            mapped
        });

        match managed {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                return Err(OsError::MapFailed {
                    addr,
                    len,
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                // Safety: NOREPLACE placement never clobbers an existing mapping.
                unsafe { platform::map_file(raw, offset, addr, len, prot, false) }.map_err(
                    |err| OsError::MapFailed {
                        addr,
                        len,
                        reason: err.to_string(),
                    },
                )?;
                let region = MemoryRegion::new("image", addr, len, prot, false);
                if let Err(err) = self.registry.register(region) {
                    // Safety: we mapped it just above.
                    if let Err(unmap_err) = unsafe { platform::unmap(addr, len) } {
                        warn!(%unmap_err, "failed to undo image mapping at {:#x}+{:#x}", addr, len);
                    }
                    return Err(err);
                }
                self.stats.record_reserve(len);
            }
        }

        debug!(
            addr = format_args!("{:#x}", addr),
            len, offset, "mapped heap image"
        );
        Ok(())
    }

    /// [`map_file`](Self::map_file) or abort: a heap image that cannot be
    /// placed at its address is unusable.
    ///
    /// # Safety
    ///
    /// As for [`map_file`](Self::map_file).
    pub unsafe fn map_file_or_die(&self, fd: BorrowedFd<'_>, offset: u64, addr: usize, len: usize) {
        if let Err(err) = unsafe { self.map_file(fd, offset, addr, len) } {
            fatal("os_map", addr, len, &err)
        }
    }

    // =========================================================================
    // Zeroing
    // =========================================================================

    /// Clear `[addr, addr + len)`.
    ///
    /// Large page-aligned interiors of managed ranges are replaced with
    /// fresh pages (keeping each page's current rights); everything else is
    /// filled byte by byte. The result is the same either way.
    ///
    /// # Safety
    ///
    /// The range must be mapped and owned by the caller. Byte-filled parts
    /// must be writable, or write-protected with the fault handler
    /// installed.
    pub unsafe fn zero(&self, addr: usize, len: usize) -> Result<(), OsError> {
        if len == 0 {
            return Ok(());
        }
        let end = addr
            .checked_add(len)
            .ok_or(OsError::NotManaged { addr, len })?;
        let inner_start = self.page.round_up(addr);
        let inner_end = self.page.trunc(end);

        if inner_end > inner_start && inner_end - inner_start >= self.zero_remap_threshold {
            let inner_len = inner_end - inner_start;
            let remapped = self.registry.with_range(inner_start, inner_len, |state| {
                let mut ok = true;
                state.for_each_run(inner_start, inner_len, |base, run_len, prot| {
                    // Safety: the run is inside a region the caller owns.
                    ok &= unsafe { platform::remap_anonymous(base, run_len, prot) }.is_ok();
                });
                ok
            });

            if remapped == Ok(true) {
                trace!(
                    addr = format_args!("{:#x}", inner_start),
                    len = inner_len,
                    "zeroed by remap"
                );
                unsafe {
                    platform::fill_zero(addr, inner_start - addr);
                    platform::fill_zero(inner_end, end - inner_end);
                }
                return Ok(());
            }
        }

        unsafe { platform::fill_zero(addr, len) };
        Ok(())
    }

    // =========================================================================
    // Protection
    // =========================================================================

    /// Apply a protection request to its page-aligned superset.
    ///
    /// The whole range must lie inside one managed region. Applying the
    /// same request twice has the same effect as applying it once.
    ///
    /// Per-page bookkeeping first drops the rights being removed, then the
    /// OS protection changes, then the new rights are recorded. A fault
    /// racing with this call therefore never sees a page recorded as more
    /// permissive than the hardware allows.
    pub fn protect(&self, request: ProtectionRequest) -> Result<(), OsError> {
        let (base, len) = request.aligned(self.page);
        if len == 0 {
            return Ok(());
        }

        self.registry.with_range(base, len, |state| {
            state.restrict_pages(base, len, request.flags);
            // Safety: the range is inside a managed region.
            if !unsafe { platform::protect(base, len, request.flags) } {
                return Err(OsError::protect_failed(base, len));
            }
            state.store_pages(base, len, request.flags);
            Ok(())
        })??;

        self.stats.record_protect();
        trace!(
            base = format_args!("{:#x}", base),
            len,
            flags = ?request.flags,
            "protect"
        );
        Ok(())
    }

    /// Protect or abort: an inconsistent protection state makes the write
    /// barrier unsound.
    pub fn protect_or_die(&self, request: ProtectionRequest) {
        if let Err(err) = self.protect(request) {
            let (base, len) = request.aligned(self.page);
            fatal("os_protect", base, len, &err)
        }
    }

    /// Make instructions written into `[addr, addr + len)` executable.
    pub fn flush_icache(&self, addr: usize, len: usize) {
        platform::flush_icache(addr, len);
    }
}

// =============================================================================
// Tests
// =============================================================================
