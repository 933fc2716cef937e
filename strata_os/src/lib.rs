//! Strata OS layer
//!
//! Virtual-memory and fault-interception services for a generational,
//! moving garbage collector.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────── OsContext ────────────────────────────┐
//!  collector ──► │ AddressSpace ──► reserve / release / map_file / zero / protect   │
//!                │      │                                                            │
//!                │      ▼                                                            │
//!                │ RegionRegistry ◄── classify (lock-free) ◄── FaultTrampoline ◄────┼── SIGSEGV / SIGBUS
//!                │                                                  │                │
//!                │                                       WriteFaultHook(page, pc) ──┼──► collector
//!                │ PauseSemaphore (stop-the-world handshake)                         │
//!                └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Region Registry**: the set of address ranges the collector owns,
//!   queried from any thread including the fault handler.
//! - **Address Space**: reservation with placement control, release,
//!   file-backed heap restore, fast zeroing and page protection.
//! - **Fault Trampoline**: turns protection faults on write-protected heap
//!   pages into write-barrier notifications and unprotects the page.
//! - **Pause Semaphore**: counting semaphore for parking mutator threads.
//!
//! # Usage
//!
//! ```ignore
//! use strata_os::{OsConfig, Placement, ProtectionRequest, Resume};
//!
//! fn remember(page: usize, _pc: usize) -> Resume {
//!     // mark `page` dirty in the remembered set
//!     Resume::Retry
//! }
//!
//! let os = strata_os::os_init(OsConfig::from_env());
//! os.set_write_fault_hook(Some(remember));
//! strata_os::os_install_interrupt_handlers();
//!
//! let space = os.address_space();
//! let heap = space.reserve_or_die("dynamic", 64 << 20, Placement::Any);
//! space.protect_or_die(ProtectionRequest::write_protect(heap.base, heap.len));
//! ```
//!
//! # Platforms
//!
//! Linux and macOS on x86_64 and aarch64.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod fault;
pub mod page;
pub mod protect;
pub mod region;
pub mod sem;
pub mod vm;

mod os;
mod stats;

// Re-exports for convenient access
pub use config::{ConfigError, OsConfig};
pub use error::{OsError, fatal};
pub use fault::{
    ContextView, FatalReason, FaultOutcome, FaultTrampoline, Resume, SyntheticContext,
    TrappedContext, WriteFaultHook,
};
pub use os::{
    OsContext, os_context, os_init, os_install_interrupt_handlers, runtime_executable_path,
    try_os_init,
};
pub use page::PageSize;
pub use protect::{Protection, ProtectionRequest};
pub use region::{MemoryRegion, RegionRegistry};
pub use sem::PauseSemaphore;
pub use stats::OsStats;
pub use vm::{AddressSpace, Placement};
