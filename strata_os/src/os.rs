//! The process-wide OS-layer context.
//!
//! One [`OsContext`] owns the region registry, the fault trampoline, the
//! pause semaphore and the statistics. [`os_init`] creates the global
//! instance; tests and embedders that need several independent contexts
//! can build their own with [`OsContext::new`], but only one context at a
//! time may own the protection-fault handlers.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::{debug, info, warn};

use crate::config::OsConfig;
use crate::error::{OsError, fatal};
use crate::fault::{
    ContextView, FaultOutcome, FaultTrampoline, TrappedContext, WriteFaultHook, signal,
};
use crate::page::PageSize;
use crate::region::RegionRegistry;
use crate::sem::PauseSemaphore;
use crate::stats::OsStats;
use crate::vm::AddressSpace;

/// Everything the OS layer knows about the process.
#[derive(Debug)]
pub struct OsContext {
    config: OsConfig,
    page: PageSize,
    registry: RegionRegistry,
    trampoline: FaultTrampoline,
    stats: OsStats,
    pause: PauseSemaphore,
}

impl OsContext {
    /// Build a context from validated configuration.
    pub fn new(config: OsConfig) -> Result<Self, OsError> {
        let page = PageSize::query();
        config.validate_for(page)?;
        debug!(page = page.get(), ?config, "initializing OS layer");

        Ok(Self {
            page,
            registry: RegionRegistry::new(page, config.max_regions),
            trampoline: FaultTrampoline::new(),
            stats: OsStats::new(),
            pause: PauseSemaphore::new(config.pause_initial),
            config,
        })
    }

    /// Configuration this context was built with.
    #[inline]
    pub fn config(&self) -> &OsConfig {
        &self.config
    }

    /// The OS page size, queried once at construction.
    #[inline]
    pub fn page_size(&self) -> PageSize {
        self.page
    }

    /// The region registry.
    #[inline]
    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Fault and reservation counters.
    #[inline]
    pub fn stats(&self) -> &OsStats {
        &self.stats
    }

    /// The thread-pause semaphore.
    #[inline]
    pub fn pause(&self) -> &PauseSemaphore {
        &self.pause
    }

    /// Reservation and protection operations over this context's registry.
    #[inline]
    pub fn address_space(&self) -> AddressSpace<'_> {
        AddressSpace::new(&self.registry, &self.stats, self.config.zero_remap_threshold)
    }

    // =========================================================================
    // Fault handling
    // =========================================================================

    /// Set the collector's write-barrier callback.
    pub fn set_write_fault_hook(&self, hook: Option<WriteFaultHook>) {
        self.trampoline.set_hook(hook);
    }

    /// Route the platform's protection-fault signals to this context.
    ///
    /// Does nothing when `page_protection` is disabled in the configuration.
    pub fn install_interrupt_handlers(&'static self) -> Result<(), OsError> {
        if !self.config.page_protection {
            info!("page protection disabled; fault handlers not installed");
            return Ok(());
        }
        signal::install(self, self.config.chain_previous_handler)
    }

    /// Whether this context currently receives protection faults.
    pub fn handlers_installed(&self) -> bool {
        signal::is_installed(self)
    }

    /// Restore the fault dispositions in place before installation.
    ///
    /// Returns false if this context did not own the handlers.
    pub fn uninstall_interrupt_handlers(&self) -> bool {
        signal::uninstall(self)
    }

    /// Run the fault state machine for a fault at `fault_addr`.
    ///
    /// Called by the signal handler; also usable directly with a
    /// [`SyntheticContext`](crate::fault::SyntheticContext) to simulate faults.
    #[inline]
    pub fn dispatch_fault<C: ContextView>(
        &self,
        fault_addr: usize,
        ctx: &mut TrappedContext<C>,
    ) -> FaultOutcome {
        self.trampoline
            .dispatch(&self.registry, &self.stats, fault_addr, ctx)
    }

    // =========================================================================
    // Predicates
    // =========================================================================

    /// Whether a (possibly tagged) reference points into managed memory.
    #[inline]
    pub fn is_managed(&self, addr: usize) -> bool {
        self.registry.contains(addr & !self.config.lowtag_mask)
    }

    /// Whether a (possibly tagged) reference points into a region whose
    /// address was chosen by the OS.
    #[inline]
    pub fn is_relocatable(&self, addr: usize) -> bool {
        self.registry.is_movable(addr & !self.config.lowtag_mask)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Best-effort teardown: uninstall handlers and release every region.
    ///
    /// The pause semaphore is left alone so threads still parked on a
    /// shared context are not stranded. The process-wide context's
    /// semaphore lives until exit; owned contexts destroy theirs with
    /// [`OsContext::teardown`].
    pub fn shutdown(&self) {
        self.uninstall_interrupt_handlers();
        let space = self.address_space();
        for region in self.registry.regions() {
            if let Err(err) = space.release(&region) {
                warn!(name = region.name, %err, "failed to release region during shutdown");
            }
        }
        info!(
            released = self.stats.bytes_released(),
            faults = self.stats.faults_delivered(),
            "OS layer shut down"
        );
    }

    /// Full teardown of an owned context: [`shutdown`](Self::shutdown), then
    /// destroy the pause semaphore.
    pub fn teardown(self) {
        self.shutdown();
        self.pause.destroy();
    }
}

// =============================================================================
// Process-wide instance
// =============================================================================

static GLOBAL: OnceLock<OsContext> = OnceLock::new();

/// Create the process-wide context. Must run before any other operation.
///
/// Aborts if the configuration is invalid; a second call aborts with
/// [`OsError::AlreadyInitialized`].
pub fn os_init(config: OsConfig) -> &'static OsContext {
    match try_os_init(config) {
        Ok(os) => os,
        Err(err) => fatal("os_init", 0, 0, &err),
    }
}

/// [`os_init`] without the abort.
pub fn try_os_init(config: OsConfig) -> Result<&'static OsContext, OsError> {
    let context = OsContext::new(config)?;
    let mut fresh = false;
    let os = GLOBAL.get_or_init(|| {
        fresh = true;
        context
    });
    if !fresh {
        return Err(OsError::AlreadyInitialized);
    }
    Ok(os)
}

/// The process-wide context, if [`os_init`] has run.
pub fn os_context() -> Option<&'static OsContext> {
    GLOBAL.get()
}

/// Install the fault handlers for the process-wide context. Aborts on
/// failure; a write barrier that cannot trap is unsound.
pub fn os_install_interrupt_handlers() {
    let Some(os) = GLOBAL.get() else {
        fatal("os_install_interrupt_handlers", 0, 0, &"os_init has not run")
    };
    if let Err(err) = os.install_interrupt_handlers() {
        fatal("os_install_interrupt_handlers", 0, 0, &err)
    }
}

/// Absolute path of the running executable.
///
/// With `external` false a process-local alias may be returned
/// (`/proc/self/exe` on Linux), which stays valid even if the file is
/// renamed.
pub fn runtime_executable_path(external: bool) -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if !external {
            return Some(PathBuf::from("/proc/self/exe"));
        }
    }
    let _ = external;
    std::env::current_exe().ok()
}
