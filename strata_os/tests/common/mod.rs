//! Shared helpers for integration tests.
//!
//! Write-fault hooks are plain function pointers running in signal
//! context, so hits are recorded in a fixed, lock-free table keyed by page.

#![allow(dead_code)]

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use strata_os::{OsConfig, OsContext, Resume};

const SLOTS: usize = 1024;

static PAGES: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];
static HITS: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];

/// Find (or claim) the slot for `page`.
fn slot(page: usize, claim: bool) -> Option<usize> {
    for (i, entry) in PAGES.iter().enumerate() {
        match entry.load(Ordering::Acquire) {
            p if p == page => return Some(i),
            0 if claim => match entry.compare_exchange(0, page, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(i),
                Err(p) if p == page => return Some(i),
                Err(_) => continue,
            },
            0 => return None,
            _ => continue,
        }
    }
    None
}

/// Write-fault hook that counts calls per page.
pub fn record(page: usize, _pc: usize) -> Resume {
    if let Some(i) = slot(page, true) {
        HITS[i].fetch_add(1, Ordering::AcqRel);
    }
    Resume::Retry
}

/// How many times [`record`] saw `page`.
pub fn hits(page: usize) -> usize {
    slot(page, false).map_or(0, |i| HITS[i].load(Ordering::Acquire))
}

/// The process-wide context with fault handlers installed and [`record`]
/// as the hook.
pub fn os() -> &'static OsContext {
    static OS: OnceLock<&'static OsContext> = OnceLock::new();
    OS.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let os = strata_os::os_init(OsConfig::default());
        os.set_write_fault_hook(Some(record));
        os.install_interrupt_handlers()
            .expect("install protection-fault handlers");
        os
    })
}

/// Store a byte through a raw address.
#[inline(never)]
pub fn poke(addr: usize, value: u8) {
    unsafe { std::ptr::write_volatile(addr as *mut u8, value) };
}

/// Load a byte through a raw address.
#[inline(never)]
pub fn peek(addr: usize) -> u8 {
    unsafe { std::ptr::read_volatile(addr as *const u8) }
}
