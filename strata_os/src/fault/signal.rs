//! Unix signal plumbing for the fault trampoline.
//!
//! | Platform | Signals              |
//! |----------|----------------------|
//! | Linux    | SIGSEGV              |
//! | macOS    | SIGSEGV, SIGBUS      |
//!
//! The handler is installed with `SA_NODEFER` so a fault raised while a
//! fault is being handled reaches the trampoline (which reports it as a
//! double fault) instead of killing the process silently.

use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use libc::{c_int, c_void, siginfo_t};
use tracing::{debug, info};

use super::{NativeContext, TrappedContext};
use crate::error::OsError;
use crate::os::OsContext;

/// Signals the OS raises on protection violations.
#[cfg(target_os = "macos")]
pub const FAULT_SIGNALS: [c_int; SIGNAL_COUNT] = [libc::SIGSEGV, libc::SIGBUS];
#[cfg(not(target_os = "macos"))]
pub const FAULT_SIGNALS: [c_int; SIGNAL_COUNT] = [libc::SIGSEGV];

#[cfg(target_os = "macos")]
const SIGNAL_COUNT: usize = 2;
#[cfg(not(target_os = "macos"))]
const SIGNAL_COUNT: usize = 1;

/// Context faults are dispatched to; null when no handler is installed.
static ACTIVE: AtomicPtr<OsContext> = AtomicPtr::new(ptr::null_mut());

/// Forward fatal faults to the handlers we replaced.
static CHAIN_PREVIOUS: AtomicBool = AtomicBool::new(true);

/// Dispositions in place before the first installation.
static PREVIOUS: OnceLock<SavedActions> = OnceLock::new();

struct SavedActions {
    actions: [libc::sigaction; SIGNAL_COUNT],
}

impl SavedActions {
    fn find(&self, sig: c_int) -> Option<&libc::sigaction> {
        FAULT_SIGNALS
            .iter()
            .position(|&s| s == sig)
            .map(|i| &self.actions[i])
    }
}

// =============================================================================
// Installation
// =============================================================================

/// Route protection faults to `os`.
pub(crate) fn install(os: &'static OsContext, chain_previous: bool) -> Result<(), OsError> {
    let target = os as *const OsContext as *mut OsContext;
    if ACTIVE
        .compare_exchange(ptr::null_mut(), target, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(OsError::HandlerInstallFailure {
            signal: FAULT_SIGNALS[0],
            reason: "fault handlers are already installed".to_string(),
        });
    }
    CHAIN_PREVIOUS.store(chain_previous, Ordering::Release);

    let mut saved: [libc::sigaction; SIGNAL_COUNT] = unsafe { std::mem::zeroed() };
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_fault as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);

        for (i, &sig) in FAULT_SIGNALS.iter().enumerate() {
            if libc::sigaction(sig, &action, &mut saved[i]) != 0 {
                let reason = std::io::Error::last_os_error().to_string();
                for (j, &done) in FAULT_SIGNALS[..i].iter().enumerate() {
                    libc::sigaction(done, &saved[j], ptr::null_mut());
                }
                ACTIVE.store(ptr::null_mut(), Ordering::Release);
                return Err(OsError::HandlerInstallFailure { signal: sig, reason });
            }
        }
    }

    // Keep the dispositions from the first installation; later ones would
    // only record what an earlier uninstall restored.
    let _ = PREVIOUS.set(SavedActions { actions: saved });
    info!(signals = ?FAULT_SIGNALS, chain_previous, "protection-fault handlers installed");
    Ok(())
}

/// Restore the dispositions that were in place before [`install`].
pub(crate) fn uninstall(os: &OsContext) -> bool {
    let current = ACTIVE.load(Ordering::Acquire);
    if !ptr::eq(current, os) {
        return false;
    }
    if let Some(previous) = PREVIOUS.get() {
        for (sig, action) in FAULT_SIGNALS.iter().zip(previous.actions.iter()) {
            unsafe { libc::sigaction(*sig, action, ptr::null_mut()) };
        }
    }
    ACTIVE.store(ptr::null_mut(), Ordering::Release);
    debug!("protection-fault handlers uninstalled");
    true
}

/// Whether `os` currently owns the fault handlers.
pub(crate) fn is_installed(os: &OsContext) -> bool {
    ptr::eq(ACTIVE.load(Ordering::Acquire), os)
}

// =============================================================================
// Handler
// =============================================================================

extern "C" fn on_fault(sig: c_int, info: *mut siginfo_t, uc: *mut c_void) {
    let errno = Errno::save();

    let active = ACTIVE.load(Ordering::Acquire);
    if active.is_null() {
        unsafe { forward(sig, info, uc) };
        errno.restore();
        return;
    }

    // Safety: ACTIVE only ever holds a `&'static OsContext`.
    let os = unsafe { &*active };
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    let mut ctx = TrappedContext::new(unsafe { NativeContext::from_raw(uc) });

    if os.dispatch_fault(fault_addr, &mut ctx).is_fatal() {
        unsafe { forward(sig, info, uc) };
    } else {
        ctx.finish();
    }
    errno.restore();
}

/// Hand a fault we do not own to whoever should report it.
///
/// Chains to the previous handler when there is one; otherwise resets the
/// default disposition so the faulting instruction re-executes and the
/// kernel produces its normal crash report.
unsafe fn forward(sig: c_int, info: *mut siginfo_t, uc: *mut c_void) {
    if CHAIN_PREVIOUS.load(Ordering::Acquire) {
        if let Some(previous) = PREVIOUS.get().and_then(|p| p.find(sig)) {
            let handler = previous.sa_sigaction;
            if handler != libc::SIG_DFL && handler != libc::SIG_IGN {
                unsafe {
                    if previous.sa_flags & libc::SA_SIGINFO != 0 {
                        let f: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                            std::mem::transmute(handler);
                        f(sig, info, uc);
                    } else {
                        let f: extern "C" fn(c_int) = std::mem::transmute(handler);
                        f(sig);
                    }
                }
                return;
            }
        }
    }

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(sig, &action, ptr::null_mut());

        // A signal sent with kill() will not recur on return; deliver it again.
        if (*info).si_code <= 0 {
            libc::raise(sig);
        }
    }
}

/// `errno` of the interrupted code, restored before the handler returns.
struct Errno(c_int);

impl Errno {
    #[inline]
    fn save() -> Self {
        Errno(unsafe { *errno_location() })
    }

    #[inline]
    fn restore(self) {
        unsafe { *errno_location() = self.0 };
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(target_os = "macos")]
#[inline]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}
