//! Error types and the fatal-abort path.
//!
//! Recoverable failures are returned as [`OsError`]. Failures on critical
//! paths (fixed placement, heap image restore, protection changes, handler
//! installation) go through [`fatal`], which logs and aborts the process.

use crate::config::ConfigError;
use std::fmt;

/// Errors reported by the OS layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsError {
    /// The range intersects an already registered region.
    Overlap {
        /// Base of the rejected range.
        base: usize,
        /// Length of the rejected range.
        len: usize,
    },
    /// No registered region matches exactly.
    NotFound {
        /// Base of the range that was looked up.
        base: usize,
    },
    /// Release of a region that was never reserved (or already released).
    NotReserved {
        /// Base of the range that was released.
        base: usize,
    },
    /// A fixed placement could not be satisfied at the exact address.
    AddressUnavailable {
        /// The address that was required.
        requested: usize,
        /// Length of the reservation.
        len: usize,
    },
    /// The range does not lie within a single managed region.
    NotManaged {
        /// Start of the range.
        addr: usize,
        /// Length of the range.
        len: usize,
    },
    /// A protection-fault handler could not be installed.
    HandlerInstallFailure {
        /// Signal number.
        signal: i32,
        /// OS error text.
        reason: String,
    },
    /// `mmap` of a file or anonymous range failed.
    MapFailed {
        /// Requested address (0 when the OS chooses).
        addr: usize,
        /// Requested length.
        len: usize,
        /// OS error text.
        reason: String,
    },
    /// `mprotect` failed.
    ProtectFailed {
        /// Page-aligned base.
        addr: usize,
        /// Page-aligned length.
        len: usize,
        /// OS error text.
        reason: String,
    },
    /// The registry has no free slot for another region.
    RegistryFull {
        /// Configured capacity.
        capacity: usize,
    },
    /// An address or length that must be page aligned was not.
    Unaligned {
        /// Offending value.
        addr: usize,
    },
    /// A zero-length reservation was requested.
    EmptyRange,
    /// `os_init` was called twice.
    AlreadyInitialized,
    /// Configuration failed validation.
    InvalidConfig(ConfigError),
}

impl OsError {
    /// Capture `errno` as a `ProtectFailed` error.
    pub(crate) fn protect_failed(addr: usize, len: usize) -> Self {
        OsError::ProtectFailed {
            addr,
            len,
            reason: std::io::Error::last_os_error().to_string(),
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::Overlap { base, len } => {
                write!(f, "range {:#x}+{:#x} overlaps a registered region", base, len)
            }
            OsError::NotFound { base } => write!(f, "no region registered at {:#x}", base),
            OsError::NotReserved { base } => write!(f, "no reservation at {:#x}", base),
            OsError::AddressUnavailable { requested, len } => write!(
                f,
                "cannot reserve {:#x} bytes at fixed address {:#x}",
                len, requested
            ),
            OsError::NotManaged { addr, len } => write!(
                f,
                "range {:#x}+{:#x} is not inside a single managed region",
                addr, len
            ),
            OsError::HandlerInstallFailure { signal, reason } => {
                write!(f, "cannot install handler for signal {}: {}", signal, reason)
            }
            OsError::MapFailed { addr, len, reason } => {
                write!(f, "mmap({:#x}, {:#x}) failed: {}", addr, len, reason)
            }
            OsError::ProtectFailed { addr, len, reason } => {
                write!(f, "mprotect({:#x}, {:#x}) failed: {}", addr, len, reason)
            }
            OsError::RegistryFull { capacity } => {
                write!(f, "region registry is full ({} regions)", capacity)
            }
            OsError::Unaligned { addr } => write!(f, "{:#x} is not page aligned", addr),
            OsError::EmptyRange => write!(f, "zero-length range"),
            OsError::AlreadyInitialized => write!(f, "OS layer already initialized"),
            OsError::InvalidConfig(err) => write!(f, "invalid configuration: {}", err),
        }
    }
}

impl std::error::Error for OsError {}

impl From<ConfigError> for OsError {
    fn from(err: ConfigError) -> Self {
        OsError::InvalidConfig(err)
    }
}

/// Build the diagnostic printed before a fatal abort.
pub fn fatal_message(primitive: &str, addr: usize, len: usize, reason: &dyn fmt::Display) -> String {
    format!("{}({:#x}, {:#x}): {}", primitive, addr, len, reason)
}

/// Abort the process after a failure the collector cannot recover from.
///
/// Not for signal context: this formats and logs.
#[cold]
pub fn fatal(primitive: &str, addr: usize, len: usize, reason: &dyn fmt::Display) -> ! {
    let message = fatal_message(primitive, addr, len, reason);
    tracing::error!(target: "strata_os", "fatal: {}", message);
    eprintln!("fatal error in OS layer: {}", message);
    std::process::abort()
}
