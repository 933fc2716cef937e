//! Region registry with a signal-safe read path.
//!
//! # Design
//!
//! Writers (`register` / `unregister`) serialize on a mutex, build a new
//! sorted table and publish it with a single pointer swap. Readers never
//! lock: they announce themselves on one of two reader counters (selected
//! by the parity of a publish epoch), load the current table and
//! binary-search it. After the swap a writer flips the epoch and waits for
//! the counter of the previous parity to drain before freeing the table it
//! replaced. Readers arriving after the flip use the other counter, so a
//! steady stream of readers cannot starve a writer.
//!
//! ```text
//!  writer:  lock ─► build table ─► swap(current) ─► epoch += 1 ─► wait readers[old] == 0 ─► free old
//!  reader:  readers[epoch] += 1 ─► load(current) ─► binary search ─► readers[epoch] -= 1
//! ```
//!
//! The read path performs no allocation and takes no lock, so it is used
//! directly by the protection-fault handler.
//!
//! Per-page protection is tracked in one byte per page. For a region of
//! `n` pages this costs `n` bytes, allocated at registration time.

use parking_lot::Mutex;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use super::MemoryRegion;
use crate::error::OsError;
use crate::page::PageSize;
use crate::protect::Protection;

// =============================================================================
// RegionState
// =============================================================================

/// Live bookkeeping for one registered region.
pub(crate) struct RegionState {
    name: &'static str,
    base: usize,
    len: usize,
    movable: bool,
    page_shift: u32,
    /// Rights most recently applied to the whole region.
    protection: AtomicU8,
    /// Current rights of each page.
    pages: Box<[AtomicU8]>,
    /// Bumped whenever rights are applied through `store_pages`.
    generation: AtomicUsize,
}

impl RegionState {
    fn new(region: &MemoryRegion, page: PageSize) -> Self {
        let bits = region.protection.bits();
        let pages = (0..page.page_count(region.len))
            .map(|_| AtomicU8::new(bits))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            name: region.name,
            base: region.base,
            len: region.len,
            movable: region.movable,
            page_shift: page.get().trailing_zeros(),
            protection: AtomicU8::new(bits),
            pages,
            generation: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn end(&self) -> usize {
        self.base + self.len
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.len
    }

    #[inline]
    pub(crate) fn movable(&self) -> bool {
        self.movable
    }

    /// Copy out a plain description of the region.
    pub(crate) fn snapshot(&self) -> MemoryRegion {
        MemoryRegion {
            name: self.name,
            base: self.base,
            len: self.len,
            protection: Protection::from_bits_truncate(self.protection.load(Ordering::Acquire)),
            movable: self.movable,
        }
    }

    #[inline]
    fn page_index(&self, addr: usize) -> usize {
        (addr - self.base) >> self.page_shift
    }

    /// Pages covering `[base, base + len)`; the range must be inside the region.
    #[inline]
    fn pages_in(&self, base: usize, len: usize) -> &[AtomicU8] {
        let first = self.page_index(base);
        let count = len >> self.page_shift;
        &self.pages[first..first + count]
    }

    /// Current rights of the page containing `addr`.
    #[inline]
    pub(crate) fn page_protection(&self, addr: usize) -> Protection {
        let bits = self.pages[self.page_index(addr)].load(Ordering::Acquire);
        Protection::from_bits_truncate(bits)
    }

    /// Record new rights for the page containing `addr`.
    #[inline]
    pub(crate) fn set_page_protection(&self, addr: usize, prot: Protection) {
        self.pages[self.page_index(addr)].store(prot.bits(), Ordering::Release);
    }

    /// Drop every right not in `keep` from the pages of a range.
    pub(crate) fn restrict_pages(&self, base: usize, len: usize, keep: Protection) {
        for page in self.pages_in(base, len) {
            page.fetch_and(keep.bits(), Ordering::AcqRel);
        }
    }

    /// Record new rights for every page of a range.
    pub(crate) fn store_pages(&self, base: usize, len: usize, prot: Protection) {
        for page in self.pages_in(base, len) {
            page.store(prot.bits(), Ordering::Release);
        }
        if base == self.base && len == self.len {
            self.protection.store(prot.bits(), Ordering::Release);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Protection generation of the region. Fault-handler unprotects do
    /// not change it.
    #[inline]
    pub(crate) fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Split a range into runs of pages with identical rights.
    ///
    /// Calls `f(run_base, run_len, prot)` for each run, in address order.
    pub(crate) fn for_each_run<F>(&self, base: usize, len: usize, mut f: F)
    where
        F: FnMut(usize, usize, Protection),
    {
        let page_size = 1usize << self.page_shift;
        let mut run_start = base;
        let mut run_prot: Option<Protection> = None;
        for (i, page) in self.pages_in(base, len).iter().enumerate() {
            let addr = base + i * page_size;
            let prot = Protection::from_bits_truncate(page.load(Ordering::Acquire));
            match run_prot {
                Some(current) if current == prot => {}
                Some(current) => {
                    f(run_start, addr - run_start, current);
                    run_start = addr;
                    run_prot = Some(prot);
                }
                None => run_prot = Some(prot),
            }
        }
        if let Some(current) = run_prot {
            f(run_start, base + len - run_start, current);
        }
    }
}

// =============================================================================
// Published table
// =============================================================================

/// Immutable snapshot of all regions, sorted by base address.
struct RegionTable {
    entries: Box<[Arc<RegionState>]>,
}

impl RegionTable {
    fn empty() -> Self {
        Self {
            entries: Box::new([]),
        }
    }

    /// Binary search for the region containing `addr`.
    #[inline]
    fn find(&self, addr: usize) -> Option<&RegionState> {
        let idx = self.entries.partition_point(|e| e.base <= addr);
        if idx == 0 {
            return None;
        }
        let entry = &self.entries[idx - 1];
        entry.contains(addr).then_some(&**entry)
    }
}

/// A reader's claim on the published table.
struct ReadGuard<'a> {
    readers: &'a AtomicUsize,
    table: &'a RegionTable,
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }
}

// =============================================================================
// RegionRegistry
// =============================================================================

/// Registry of managed regions, queried by point containment.
///
/// No two registered regions ever overlap, so classification is a total
/// function from addresses to "region or unmanaged".
pub struct RegionRegistry {
    page: PageSize,
    capacity: usize,
    /// Authoritative sorted list; only touched by writers.
    writer: Mutex<Vec<Arc<RegionState>>>,
    /// Table visible to readers.
    current: AtomicPtr<RegionTable>,
    /// Bumped by every publish; its parity selects the reader counter.
    epoch: AtomicUsize,
    /// Readers currently holding a table reference, per epoch parity.
    readers: [AtomicUsize; 2],
}

// Safety: the raw table pointer is only dereferenced under the reader
// protocol described in the module docs.
unsafe impl Send for RegionRegistry {}
unsafe impl Sync for RegionRegistry {}

impl RegionRegistry {
    /// Create an empty registry holding at most `capacity` regions.
    pub fn new(page: PageSize, capacity: usize) -> Self {
        Self {
            page,
            capacity,
            writer: Mutex::new(Vec::with_capacity(capacity)),
            current: AtomicPtr::new(Box::into_raw(Box::new(RegionTable::empty()))),
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Page size regions are aligned to.
    #[inline]
    pub fn page_size(&self) -> PageSize {
        self.page
    }

    /// Maximum number of regions.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Register a region.
    ///
    /// Fails with [`OsError::Overlap`] if the range intersects any existing
    /// region.
    pub fn register(&self, region: MemoryRegion) -> Result<(), OsError> {
        if region.len == 0 {
            return Err(OsError::EmptyRange);
        }
        if !self.page.is_aligned(region.base) {
            return Err(OsError::Unaligned { addr: region.base });
        }
        if !self.page.is_aligned(region.len) {
            return Err(OsError::Unaligned { addr: region.len });
        }
        let overlap = OsError::Overlap {
            base: region.base,
            len: region.len,
        };
        let end = region.base.checked_add(region.len).ok_or(overlap.clone())?;

        let mut entries = self.writer.lock();
        if entries.len() >= self.capacity {
            return Err(OsError::RegistryFull {
                capacity: self.capacity,
            });
        }

        let idx = entries.partition_point(|e| e.base < region.base);
        if idx > 0 && entries[idx - 1].end() > region.base {
            return Err(overlap);
        }
        if idx < entries.len() && entries[idx].base < end {
            return Err(overlap);
        }

        entries.insert(idx, Arc::new(RegionState::new(&region, self.page)));
        self.publish(&entries);
        Ok(())
    }

    /// Remove a previously registered region.
    ///
    /// The base and length must match a registered region exactly.
    /// Returns the region as it was at removal time.
    pub fn unregister(&self, region: &MemoryRegion) -> Result<MemoryRegion, OsError> {
        let mut entries = self.writer.lock();
        let idx = entries
            .binary_search_by_key(&region.base, |e| e.base)
            .ok()
            .filter(|&i| entries[i].len == region.len)
            .ok_or(OsError::NotFound { base: region.base })?;

        let removed = entries.remove(idx);
        self.publish(&entries);
        Ok(removed.snapshot())
    }

    /// Publish `entries` as the new reader-visible table.
    ///
    /// Must be called with the writer lock held.
    fn publish(&self, entries: &[Arc<RegionState>]) {
        let table = Box::new(RegionTable {
            entries: entries.to_vec().into_boxed_slice(),
        });
        let old = self.current.swap(Box::into_raw(table), Ordering::SeqCst);
        let old_epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.wait_for_readers(&self.readers[old_epoch & 1]);
        // Safety: `old` came from Box::into_raw and every reader that could
        // have loaded it announced itself on the drained counter.
        drop(unsafe { Box::from_raw(old) });
    }

    /// Wait until a reader counter drains.
    fn wait_for_readers(&self, readers: &AtomicUsize) {
        let mut spins = 0u32;
        while readers.load(Ordering::SeqCst) != 0 {
            if spins < 1000 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    // =========================================================================
    // Lock-free queries
    // =========================================================================

    #[inline]
    fn read(&self) -> ReadGuard<'_> {
        let readers = loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let slot = &self.readers[epoch & 1];
            slot.fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                break slot;
            }
            // A publish flipped the epoch underneath us; retry on the new parity.
            slot.fetch_sub(1, Ordering::SeqCst);
        };
        let table = self.current.load(Ordering::SeqCst);
        // Safety: the table cannot be freed while our counter is non-zero.
        ReadGuard {
            readers,
            table: unsafe { &*table },
        }
    }

    /// Run `f` on the region containing `addr`.
    ///
    /// Signal safe as long as `f` is.
    #[inline]
    pub(crate) fn with_region<R>(&self, addr: usize, f: impl FnOnce(&RegionState) -> R) -> Option<R> {
        let guard = self.read();
        guard.table.find(addr).map(f)
    }

    /// Run `f` on the region containing all of `[base, base + len)`.
    pub(crate) fn with_range<R>(
        &self,
        base: usize,
        len: usize,
        f: impl FnOnce(&RegionState) -> R,
    ) -> Result<R, OsError> {
        let guard = self.read();
        match guard.table.find(base) {
            Some(state) if len <= state.end() - base => Ok(f(state)),
            _ => Err(OsError::NotManaged { addr: base, len }),
        }
    }

    /// The region owning `addr`, or `None` if the address is unmanaged.
    ///
    /// O(log n), allocation free and lock free.
    #[inline]
    pub fn classify(&self, addr: usize) -> Option<MemoryRegion> {
        self.with_region(addr, RegionState::snapshot)
    }

    /// Like [`classify`](Self::classify), after clearing the low tag bits
    /// of a tagged reference.
    #[inline]
    pub fn classify_tagged(&self, tagged: usize, lowtag_mask: usize) -> Option<MemoryRegion> {
        self.classify(tagged & !lowtag_mask)
    }

    /// Whether `addr` lies in any registered region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.with_region(addr, |_| ()).is_some()
    }

    /// Whether `addr` lies in a region whose base was chosen by the OS.
    #[inline]
    pub fn is_movable(&self, addr: usize) -> bool {
        self.with_region(addr, RegionState::movable).unwrap_or(false)
    }

    /// Current rights of the page containing `addr`.
    #[inline]
    pub fn page_protection(&self, addr: usize) -> Option<Protection> {
        self.with_region(addr, |state| state.page_protection(addr))
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Snapshot of every region, in address order.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        let guard = self.read();
        guard.table.entries.iter().map(|e| e.snapshot()).collect()
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        let guard = self.read();
        guard.table.entries.len()
    }

    /// Whether no region is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RegionRegistry {
    fn drop(&mut self) {
        let table = std::mem::replace(self.current.get_mut(), ptr::null_mut());
        if !table.is_null() {
            // Safety: `&mut self` means there are no readers left.
            drop(unsafe { Box::from_raw(table) });
        }
    }
}

impl std::fmt::Debug for RegionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRegistry")
            .field("page", &self.page)
            .field("capacity", &self.capacity)
            .field("regions", &self.regions())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PAGE: usize = 4096;

    fn registry() -> RegionRegistry {
        RegionRegistry::new(PageSize::new(PAGE).unwrap(), 16)
    }

    fn region(base: usize, pages: usize) -> MemoryRegion {
        MemoryRegion::new("test", base, pages * PAGE, Protection::READ_WRITE, false)
    }

    // =========================================================================
    // Register / Unregister
    // =========================================================================

    #[test]
    fn test_register_then_classify() {
        let reg = registry();
        let r = region(0x10_0000, 4);
        reg.register(r).unwrap();

        assert_eq!(reg.classify(0x10_0000), Some(r));
        assert_eq!(reg.classify(0x10_3fff), Some(r));
        assert_eq!(reg.classify(0x10_4000), None);
        assert_eq!(reg.classify(0x0f_ffff), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_overlap_rejected() {
        let reg = registry();
        reg.register(region(0x10_0000, 4)).unwrap();

        let err = reg.register(region(0x10_3000, 2)).unwrap_err();
        assert!(matches!(err, OsError::Overlap { .. }));
        let err = reg.register(region(0x0f_f000, 2)).unwrap_err();
        assert!(matches!(err, OsError::Overlap { .. }));

        // Adjacent on both sides is fine.
        reg.register(region(0x10_4000, 1)).unwrap();
        reg.register(region(0x0f_f000, 1)).unwrap();
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_register_rejects_unaligned_and_empty() {
        let reg = registry();
        assert!(matches!(
            reg.register(MemoryRegion::new("x", 0x1001, PAGE, Protection::READ, false)),
            Err(OsError::Unaligned { addr: 0x1001 })
        ));
        assert!(matches!(
            reg.register(MemoryRegion::new("x", 0x1000, 100, Protection::READ, false)),
            Err(OsError::Unaligned { .. })
        ));
        assert_eq!(reg.register(region(0x1000, 0)), Err(OsError::EmptyRange));
    }

    #[test]
    fn test_register_capacity() {
        let reg = RegionRegistry::new(PageSize::new(PAGE).unwrap(), 2);
        reg.register(region(0x1000, 1)).unwrap();
        reg.register(region(0x3000, 1)).unwrap();
        assert_eq!(
            reg.register(region(0x5000, 1)),
            Err(OsError::RegistryFull { capacity: 2 })
        );
    }

    #[test]
    fn test_unregister_requires_exact_match() {
        let reg = registry();
        let r = region(0x10_0000, 4);
        reg.register(r).unwrap();

        assert_eq!(
            reg.unregister(&region(0x10_0000, 2)),
            Err(OsError::NotFound { base: 0x10_0000 })
        );
        assert_eq!(reg.unregister(&r), Ok(r));
        assert_eq!(reg.classify(0x10_0000), None);
        assert_eq!(
            reg.unregister(&r),
            Err(OsError::NotFound { base: 0x10_0000 })
        );
        assert!(reg.is_empty());
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn test_classify_tagged_strips_lowtag() {
        let reg = registry();
        let r = region(0x20_0000, 1);
        reg.register(r).unwrap();

        // A tagged reference to the last word of the page.
        let tagged = 0x20_0ff8 | 0x7;
        assert_eq!(reg.classify_tagged(tagged, 0xf), Some(r));
        // Tag bits pushing past the end must not leak into the next page.
        assert_eq!(reg.classify_tagged(0x20_1003, 0xf), None);
    }

    #[test]
    fn test_is_movable() {
        let reg = registry();
        reg.register(MemoryRegion::new("fixed", 0x1000, PAGE, Protection::READ, false))
            .unwrap();
        reg.register(MemoryRegion::new("heap", 0x4000, PAGE, Protection::READ, true))
            .unwrap();
        assert!(!reg.is_movable(0x1000));
        assert!(reg.is_movable(0x4000));
        assert!(!reg.is_movable(0x9000));
        assert!(reg.contains(0x1000) && reg.contains(0x4000) && !reg.contains(0x9000));
    }

    #[test]
    fn test_regions_sorted() {
        let reg = registry();
        reg.register(region(0x30_0000, 1)).unwrap();
        reg.register(region(0x10_0000, 1)).unwrap();
        reg.register(region(0x20_0000, 1)).unwrap();
        let bases: Vec<usize> = reg.regions().iter().map(|r| r.base).collect();
        assert_eq!(bases, vec![0x10_0000, 0x20_0000, 0x30_0000]);
    }

    // =========================================================================
    // Page protection bookkeeping
    // =========================================================================

    #[test]
    fn test_page_protection_tracking() {
        let reg = registry();
        reg.register(region(0x10_0000, 4)).unwrap();

        reg.with_range(0x10_1000, 2 * PAGE, |s| {
            s.store_pages(0x10_1000, 2 * PAGE, Protection::READ)
        })
        .unwrap();

        assert_eq!(reg.page_protection(0x10_0000), Some(Protection::READ_WRITE));
        assert_eq!(reg.page_protection(0x10_1abc), Some(Protection::READ));
        assert_eq!(reg.page_protection(0x10_2000), Some(Protection::READ));
        assert_eq!(reg.page_protection(0x10_3000), Some(Protection::READ_WRITE));
        assert_eq!(reg.page_protection(0x50_0000), None);

        // Partial update leaves the region-level flags alone.
        assert_eq!(
            reg.classify(0x10_0000).map(|r| r.protection),
            Some(Protection::READ_WRITE)
        );
    }

    #[test]
    fn test_whole_region_update_sets_region_flags() {
        let reg = registry();
        reg.register(region(0x10_0000, 2)).unwrap();
        reg.with_range(0x10_0000, 2 * PAGE, |s| {
            s.store_pages(0x10_0000, 2 * PAGE, Protection::READ)
        })
        .unwrap();
        assert_eq!(
            reg.classify(0x10_0000).map(|r| r.protection),
            Some(Protection::READ)
        );
    }

    #[test]
    fn test_generation_tracks_applied_rights_only() {
        let reg = registry();
        reg.register(region(0x10_0000, 2)).unwrap();
        let generation = |reg: &RegionRegistry| reg.with_region(0x10_0000, |s| s.generation());
        let start = generation(&reg);

        // Handler-side unprotects do not start a new generation.
        reg.with_region(0x10_0000, |s| {
            s.set_page_protection(0x10_0000, Protection::READ_WRITE)
        });
        assert_eq!(generation(&reg), start);

        reg.with_range(0x10_0000, PAGE, |s| {
            s.store_pages(0x10_0000, PAGE, Protection::READ)
        })
        .unwrap();
        assert_ne!(generation(&reg), start);
    }

    #[test]
    fn test_with_range_spanning_regions_is_not_managed() {
        let reg = registry();
        reg.register(region(0x10_0000, 1)).unwrap();
        reg.register(region(0x10_1000, 1)).unwrap();
        assert_eq!(
            reg.with_range(0x10_0000, 2 * PAGE, |_| ()),
            Err(OsError::NotManaged {
                addr: 0x10_0000,
                len: 2 * PAGE
            })
        );
        assert!(reg.with_range(0x10_1000, PAGE, |_| ()).is_ok());
    }

    #[test]
    fn test_for_each_run_groups_pages() {
        let reg = registry();
        reg.register(region(0x10_0000, 5)).unwrap();
        let runs = reg
            .with_range(0x10_0000, 5 * PAGE, |s| {
                s.store_pages(0x10_2000, PAGE, Protection::READ);
                let mut runs = Vec::new();
                s.for_each_run(0x10_0000, 5 * PAGE, |b, l, p| runs.push((b, l, p)));
                runs
            })
            .unwrap();
        assert_eq!(
            runs,
            vec![
                (0x10_0000, 2 * PAGE, Protection::READ_WRITE),
                (0x10_2000, PAGE, Protection::READ),
                (0x10_3000, 2 * PAGE, Protection::READ_WRITE),
            ]
        );
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[test]
    fn test_concurrent_classify_during_churn() {
        use std::sync::atomic::AtomicBool;

        let reg = Arc::new(registry());
        let stable = region(0x100_0000, 1);
        reg.register(stable).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        assert_eq!(reg.classify(0x100_0000), Some(stable));
                        if let Some(r) = reg.classify(0x200_0000) {
                            assert_eq!(r.base, 0x200_0000);
                            assert_eq!(r.len, 2 * PAGE);
                        }
                    }
                })
            })
            .collect();

        let churn = region(0x200_0000, 2);
        for _ in 0..500 {
            reg.register(churn).unwrap();
            reg.unregister(&churn).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for handle in readers {
            handle.join().unwrap();
        }
    }

    // =========================================================================
    // Property tests
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Register { page: usize, pages: usize },
        Unregister { pick: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..64, 1usize..8).prop_map(|(page, pages)| Op::Register { page, pages }),
            (0usize..16).prop_map(|pick| Op::Unregister { pick }),
        ]
    }

    proptest! {
        #[test]
        fn prop_regions_never_overlap(ops in proptest::collection::vec(op(), 1..64)) {
            let reg = RegionRegistry::new(PageSize::new(PAGE).unwrap(), 64);
            let mut model: Vec<MemoryRegion> = Vec::new();

            for op in ops {
                match op {
                    Op::Register { page, pages } => {
                        let r = region(page * PAGE, pages);
                        let expect_overlap = model.iter().any(|m| m.overlaps(&r));
                        match reg.register(r) {
                            Ok(()) => {
                                prop_assert!(!expect_overlap);
                                model.push(r);
                            }
                            Err(OsError::Overlap { .. }) => prop_assert!(expect_overlap),
                            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                        }
                    }
                    Op::Unregister { pick } => {
                        if model.is_empty() {
                            continue;
                        }
                        let r = model.remove(pick % model.len());
                        prop_assert_eq!(reg.unregister(&r), Ok(r));
                    }
                }

                let regions = reg.regions();
                prop_assert_eq!(regions.len(), model.len());
                for pair in regions.windows(2) {
                    prop_assert!(pair[0].end() <= pair[1].base);
                }
            }
        }

        #[test]
        fn prop_classify_matches_model(
            bases in proptest::collection::btree_set(0usize..32, 1..8),
            scout in 0usize..(40 * PAGE),
        ) {
            let reg = RegionRegistry::new(PageSize::new(PAGE).unwrap(), 64);
            // Every region is one page, two pages apart, so none overlap.
            let model: Vec<MemoryRegion> =
                bases.iter().map(|&b| region(b * 2 * PAGE, 1)).collect();
            for r in &model {
                reg.register(*r).unwrap();
            }

            let expected = model.iter().find(|r| r.contains(scout)).copied();
            prop_assert_eq!(reg.classify(scout), expected);
        }
    }
}
