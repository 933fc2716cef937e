//! Protection-fault trampoline.
//!
//! Every protection fault delivered to the process passes through
//! [`FaultTrampoline::dispatch`], which decides between three outcomes:
//!
//! ```text
//!   fault ─► truncate to page ─► classify
//!              │
//!              ├─ unmanaged / no read access / nested ──────────► Fatal
//!              ├─ page already writable (lost a race) ──────────► Spurious (retry)
//!              └─ write-protected ─► hook(page, pc) ─► lift WRITE ─► Resolved
//! ```
//!
//! # Signal safety
//!
//! `dispatch` runs inside the signal handler. It does not allocate, lock,
//! or log; it reads the registry through its lock-free path, calls the
//! collector hook, issues one `mprotect` and bumps atomic counters.
//!
//! # Concurrent faults on one page
//!
//! Two threads faulting on the same write-protected page may both reach
//! the hook before either lifts the protection. Both then call the hook
//! and both unprotect; the second `mprotect` is redundant. The hook is
//! therefore called at least once per page between protection changes,
//! and must tolerate duplicate notifications.

mod context;
pub(crate) mod signal;

pub use context::{
    ContextView, NativeContext, SYNTHETIC_REGISTERS, SyntheticContext, TrappedContext,
};

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::protect::Protection;
use crate::region::RegionRegistry;
use crate::stats::OsStats;
use crate::vm::platform;

/// Nested faults deeper than this are treated as unrecoverable.
const MAX_NESTING: usize = 4;

/// Consecutive spurious faults on one page, with no protection change in
/// between, before giving up.
const MAX_SPURIOUS_RETRIES: u32 = 8;

// =============================================================================
// Hook and outcome types
// =============================================================================

/// Where the faulting thread continues after the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Re-execute the faulting instruction.
    Retry,
    /// Continue at this address instead.
    At(usize),
}

/// Collector callback for write-barrier traps.
///
/// Receives the faulting page and the program counter of the faulting
/// instruction. Runs in signal context: it must not allocate, block, or
/// take locks that the interrupted thread might hold.
pub type WriteFaultHook = fn(page: usize, pc: usize) -> Resume;

/// Why a fault could not be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// The address is outside every managed region.
    Unmanaged,
    /// The page is managed but not readable (e.g. a guard page).
    NoAccess,
    /// A fault occurred while handling a fault on the same page, or
    /// faults nested too deeply.
    DoubleFault,
    /// The page kept faulting even though it is recorded as writable.
    RetryLimit,
    /// Lifting the protection failed.
    ProtectFailed,
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::Unmanaged => write!(f, "access to unmanaged memory"),
            FatalReason::NoAccess => write!(f, "access to an inaccessible managed page"),
            FatalReason::DoubleFault => write!(f, "fault while handling a fault"),
            FatalReason::RetryLimit => write!(f, "page keeps faulting after unprotect"),
            FatalReason::ProtectFailed => write!(f, "failed to lift write protection"),
        }
    }
}

/// Result of dispatching one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A write-barrier trap: the hook ran and the page is now writable.
    Resolved {
        /// The faulting page.
        page: usize,
    },
    /// The page was already writable by the time it was classified.
    Spurious {
        /// The faulting page.
        page: usize,
    },
    /// Not ours to handle; forward to the process's fault reporting.
    Fatal(FatalReason),
}

impl FaultOutcome {
    /// Whether the fault must be forwarded.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, FaultOutcome::Fatal(_))
    }
}

// =============================================================================
// Per-thread handler state
// =============================================================================

thread_local! {
    /// Pages whose faults are being handled on this thread, innermost last.
    static IN_FLIGHT: Cell<[usize; MAX_NESTING]> = const { Cell::new([0; MAX_NESTING]) };
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    /// Last spuriously faulting page, its region's protection generation,
    /// and how many times in a row it faulted under that generation.
    static SPURIOUS: Cell<(usize, usize, u32)> = const { Cell::new((0, 0, 0)) };
}

/// Marks a page as being handled on this thread.
struct NestingGuard;

impl NestingGuard {
    fn enter(page: usize) -> Result<Self, FatalReason> {
        DEPTH.with(|depth| {
            let d = depth.get();
            if d >= MAX_NESTING {
                return Err(FatalReason::DoubleFault);
            }
            let mut pages = IN_FLIGHT.with(Cell::get);
            if pages[..d].contains(&page) {
                return Err(FatalReason::DoubleFault);
            }
            pages[d] = page;
            IN_FLIGHT.with(|p| p.set(pages));
            depth.set(d + 1);
            Ok(NestingGuard)
        })
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Count a lost race on `page`. Re-protecting the region starts a new run.
fn note_spurious(page: usize, generation: usize) -> u32 {
    SPURIOUS.with(|s| {
        let (last, last_generation, count) = s.get();
        let count = if last == page && last_generation == generation {
            count + 1
        } else {
            1
        };
        s.set((page, generation, count));
        count
    })
}

fn clear_spurious() {
    SPURIOUS.with(|s| s.set((0, 0, 0)));
}

// =============================================================================
// FaultTrampoline
// =============================================================================

/// Classifies protection faults and resolves write-barrier traps.
#[derive(Debug)]
pub struct FaultTrampoline {
    /// `WriteFaultHook` as an address; 0 when unset.
    hook: AtomicUsize,
}

impl FaultTrampoline {
    /// A trampoline with no hook.
    pub const fn new() -> Self {
        Self {
            hook: AtomicUsize::new(0),
        }
    }

    /// Set (or clear) the collector hook.
    pub fn set_hook(&self, hook: Option<WriteFaultHook>) {
        let raw = hook.map_or(0, |f| f as usize);
        self.hook.store(raw, Ordering::Release);
    }

    /// The current collector hook.
    #[inline]
    pub fn hook(&self) -> Option<WriteFaultHook> {
        let raw = self.hook.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            // Safety: only `set_hook` stores non-zero values, and it stores
            // a `WriteFaultHook`.
            Some(unsafe { std::mem::transmute::<usize, WriteFaultHook>(raw) })
        }
    }

    /// Handle one protection fault at `fault_addr`.
    ///
    /// Signal safe. On `Resolved` the page is writable and recorded as such
    /// before this returns; the caller then applies any resume target with
    /// [`TrappedContext::finish`].
    pub fn dispatch<C: ContextView>(
        &self,
        registry: &RegionRegistry,
        stats: &OsStats,
        fault_addr: usize,
        ctx: &mut TrappedContext<C>,
    ) -> FaultOutcome {
        stats.record_fault();
        let outcome = self.classify_and_resolve(registry, fault_addr, ctx);
        match outcome {
            FaultOutcome::Resolved { .. } => stats.record_resolved(),
            FaultOutcome::Spurious { .. } => stats.record_spurious(),
            FaultOutcome::Fatal(_) => stats.record_fatal(),
        }
        outcome
    }

    fn classify_and_resolve<C: ContextView>(
        &self,
        registry: &RegionRegistry,
        fault_addr: usize,
        ctx: &mut TrappedContext<C>,
    ) -> FaultOutcome {
        let page_size = registry.page_size();
        let page = page_size.trunc(fault_addr);

        let _guard = match NestingGuard::enter(page) {
            Ok(guard) => guard,
            Err(reason) => return FaultOutcome::Fatal(reason),
        };

        // Classify without holding the registry across the hook call.
        let Some((prot, generation)) =
            registry.with_region(page, |state| (state.page_protection(page), state.generation()))
        else {
            return FaultOutcome::Fatal(FatalReason::Unmanaged);
        };
        if !prot.contains(Protection::READ) {
            return FaultOutcome::Fatal(FatalReason::NoAccess);
        }
        if prot.contains(Protection::WRITE) {
            if note_spurious(page, generation) > MAX_SPURIOUS_RETRIES {
                return FaultOutcome::Fatal(FatalReason::RetryLimit);
            }
            return FaultOutcome::Spurious { page };
        }

        let resume = match self.hook() {
            Some(hook) => hook(page, ctx.pc()),
            None => Resume::Retry,
        };

        let granted = prot | Protection::WRITE;
        let lifted = registry.with_region(page, |state| {
            // Safety: the page belongs to a registered region.
            if !unsafe { platform::protect(page, page_size.get(), granted) } {
                return false;
            }
            state.set_page_protection(page, granted);
            true
        });
        match lifted {
            Some(true) => {}
            Some(false) => return FaultOutcome::Fatal(FatalReason::ProtectFailed),
            // Released while the hook ran.
            None => return FaultOutcome::Fatal(FatalReason::Unmanaged),
        }

        clear_spurious();
        if let Resume::At(pc) = resume {
            ctx.resume_at(pc);
        }
        FaultOutcome::Resolved { page }
    }
}

impl Default for FaultTrampoline {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageSize;
    use crate::protect::ProtectionRequest;
    use crate::vm::{AddressSpace, Placement};
    use std::sync::atomic::AtomicUsize;

    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);
    static LAST_PAGE: AtomicUsize = AtomicUsize::new(0);
    static LAST_PC: AtomicUsize = AtomicUsize::new(0);

    fn counting_hook(page: usize, pc: usize) -> Resume {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
        LAST_PAGE.store(page, Ordering::SeqCst);
        LAST_PC.store(pc, Ordering::SeqCst);
        Resume::Retry
    }

    fn skipping_hook(_page: usize, pc: usize) -> Resume {
        Resume::At(pc + 4)
    }

    // Tests in this module share the counting hook's statics.
    static SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    struct Fixture {
        registry: RegionRegistry,
        stats: OsStats,
        trampoline: FaultTrampoline,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: RegionRegistry::new(PageSize::query(), 8),
                stats: OsStats::new(),
                trampoline: FaultTrampoline::new(),
            }
        }

        fn space(&self) -> AddressSpace<'_> {
            AddressSpace::new(&self.registry, &self.stats, 1 << 20)
        }

        fn fault(&self, addr: usize, pc: usize) -> (FaultOutcome, SyntheticContext) {
            let mut ctx = TrappedContext::new(SyntheticContext::new(pc, 0));
            let outcome = self
                .trampoline
                .dispatch(&self.registry, &self.stats, addr, &mut ctx);
            (outcome, ctx.finish())
        }
    }

    #[test]
    fn test_hook_round_trip() {
        let trampoline = FaultTrampoline::new();
        assert!(trampoline.hook().is_none());
        trampoline.set_hook(Some(counting_hook));
        assert!(trampoline.hook().is_some());
        trampoline.set_hook(None);
        assert!(trampoline.hook().is_none());
    }

    #[test]
    fn test_unmanaged_fault_is_fatal_without_hook_call() {
        let _serial = SERIAL.lock();
        let fx = Fixture::new();
        fx.trampoline.set_hook(Some(counting_hook));
        let before = HOOK_CALLS.load(Ordering::SeqCst);

        let (outcome, _) = fx.fault(0x1000, 0x400000);
        assert_eq!(outcome, FaultOutcome::Fatal(FatalReason::Unmanaged));
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), before);
        assert_eq!(fx.stats.faults_fatal(), 1);
    }

    #[test]
    fn test_write_protected_fault_resolves_once() {
        let _serial = SERIAL.lock();
        let fx = Fixture::new();
        fx.trampoline.set_hook(Some(counting_hook));
        let space = fx.space();
        let page = space.page_size().get();
        let region = space.reserve("dynamic", page * 4, Placement::Any).unwrap();
        space
            .protect(ProtectionRequest::write_protect(region.base, region.len))
            .unwrap();

        let before = HOOK_CALLS.load(Ordering::SeqCst);
        let target = region.base + page * 2 + 24;
        let (outcome, ctx) = fx.fault(target, 0xabc0);
        assert_eq!(
            outcome,
            FaultOutcome::Resolved {
                page: region.base + page * 2
            }
        );
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), before + 1);
        assert_eq!(LAST_PAGE.load(Ordering::SeqCst), region.base + page * 2);
        assert_eq!(LAST_PC.load(Ordering::SeqCst), 0xabc0);
        assert_eq!(ctx.pc, 0xabc0);

        // The page is writable now, both in bookkeeping and in hardware.
        assert_eq!(
            fx.registry.page_protection(target),
            Some(Protection::READ_WRITE)
        );
        unsafe { std::ptr::write_volatile(target as *mut u8, 1) };

        // A second delivery for the same page is a lost race, not a new trap.
        let (outcome, _) = fx.fault(target, 0xabc0);
        assert_eq!(
            outcome,
            FaultOutcome::Spurious {
                page: region.base + page * 2
            }
        );
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), before + 1);

        // Neighbouring pages stay protected.
        assert_eq!(
            fx.registry.page_protection(region.base + page),
            Some(Protection::READ)
        );

        fx.trampoline.set_hook(None);
        space.release(&region).unwrap();
    }

    #[test]
    fn test_hook_can_redirect_resume() {
        let _serial = SERIAL.lock();
        let fx = Fixture::new();
        fx.trampoline.set_hook(Some(skipping_hook));
        let space = fx.space();
        let region = space.reserve("dynamic", 4096, Placement::Any).unwrap();
        space
            .protect(ProtectionRequest::write_protect(region.base, region.len))
            .unwrap();

        let (outcome, ctx) = fx.fault(region.base, 0x5000);
        assert!(matches!(outcome, FaultOutcome::Resolved { .. }));
        assert_eq!(ctx.pc, 0x5004);
        space.release(&region).unwrap();
    }

    #[test]
    fn test_inaccessible_page_is_fatal() {
        let fx = Fixture::new();
        let space = fx.space();
        let region = space.reserve("guard", 4096, Placement::Any).unwrap();
        space
            .protect(ProtectionRequest::new(region.base, region.len, Protection::NONE))
            .unwrap();

        let (outcome, _) = fx.fault(region.base + 8, 0);
        assert_eq!(outcome, FaultOutcome::Fatal(FatalReason::NoAccess));
        space.release(&region).unwrap();
    }

    #[test]
    fn test_repeated_spurious_faults_give_up() {
        let fx = Fixture::new();
        let space = fx.space();
        let region = space.reserve("dynamic", 4096, Placement::Any).unwrap();

        for _ in 0..MAX_SPURIOUS_RETRIES {
            let (outcome, _) = fx.fault(region.base, 0);
            assert!(matches!(outcome, FaultOutcome::Spurious { .. }));
        }
        let (outcome, _) = fx.fault(region.base, 0);
        assert_eq!(outcome, FaultOutcome::Fatal(FatalReason::RetryLimit));
        assert_eq!(fx.stats.faults_spurious(), MAX_SPURIOUS_RETRIES as u64);
        clear_spurious();
        space.release(&region).unwrap();
    }

    #[test]
    fn test_lost_races_across_protection_cycles_stay_spurious() {
        let fx = Fixture::new();
        let space = fx.space();
        let region = space.reserve("dynamic", 4096, Placement::Any).unwrap();

        for cycle in 0..MAX_SPURIOUS_RETRIES * 2 {
            space
                .protect(ProtectionRequest::write_protect(region.base, region.len))
                .unwrap();

            // Another thread wins the race and lifts the protection.
            std::thread::scope(|s| {
                let winner = s.spawn(|| fx.fault(region.base, 0).0);
                assert!(matches!(
                    winner.join().unwrap(),
                    FaultOutcome::Resolved { .. }
                ));
            });

            let (outcome, _) = fx.fault(region.base, 0);
            assert_eq!(
                outcome,
                FaultOutcome::Spurious { page: region.base },
                "cycle {cycle}"
            );
        }
        assert_eq!(fx.stats.faults_fatal(), 0);
        clear_spurious();
        space.release(&region).unwrap();
    }

    #[test]
    fn test_nested_fault_on_same_page_is_fatal() {
        let outer = NestingGuard::enter(0x7000).unwrap();
        assert_eq!(
            NestingGuard::enter(0x7000).err(),
            Some(FatalReason::DoubleFault)
        );
        {
            let _inner = NestingGuard::enter(0x8000).unwrap();
        }
        drop(outer);
        assert!(NestingGuard::enter(0x7000).is_ok());
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let guards: Vec<_> = (0..MAX_NESTING)
            .map(|i| NestingGuard::enter(0x1000 * (i + 1)).unwrap())
            .collect();
        assert_eq!(
            NestingGuard::enter(0x100_000).err(),
            Some(FatalReason::DoubleFault)
        );
        drop(guards);
        assert!(NestingGuard::enter(0x100_000).is_ok());
    }

    #[test]
    fn test_fatal_reason_display() {
        assert_eq!(
            FatalReason::Unmanaged.to_string(),
            "access to unmanaged memory"
        );
    }
}
