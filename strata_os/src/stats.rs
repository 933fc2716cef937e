//! Counters for reservation, protection and fault handling.
//!
//! Every counter is a relaxed atomic so the fault handler can update them
//! from signal context.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for the OS layer.
#[derive(Debug, Default)]
pub struct OsStats {
    /// Protection faults delivered to the trampoline.
    faults_delivered: AtomicU64,

    /// Faults resolved as write-barrier traps.
    faults_resolved: AtomicU64,

    /// Faults on pages another thread had already unprotected.
    faults_spurious: AtomicU64,

    /// Faults escalated to the fatal path.
    faults_fatal: AtomicU64,

    /// Successful `protect` calls.
    protect_calls: AtomicU64,

    /// Total bytes currently reserved through this layer.
    bytes_reserved: AtomicU64,

    /// Total bytes ever released.
    bytes_released: AtomicU64,
}

impl OsStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_fault(&self) {
        self.faults_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_resolved(&self) {
        self.faults_resolved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_spurious(&self) {
        self.faults_spurious.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_fatal(&self) {
        self.faults_fatal.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_protect(&self) {
        self.protect_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reserve(&self, len: usize) {
        self.bytes_reserved.fetch_add(len as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_release(&self, len: usize) {
        self.bytes_reserved.fetch_sub(len as u64, Ordering::Relaxed);
        self.bytes_released.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Protection faults delivered.
    pub fn faults_delivered(&self) -> u64 {
        self.faults_delivered.load(Ordering::Relaxed)
    }

    /// Faults resolved as write-barrier traps.
    pub fn faults_resolved(&self) -> u64 {
        self.faults_resolved.load(Ordering::Relaxed)
    }

    /// Faults that lost a race to another thread's unprotect.
    pub fn faults_spurious(&self) -> u64 {
        self.faults_spurious.load(Ordering::Relaxed)
    }

    /// Faults escalated as fatal.
    pub fn faults_fatal(&self) -> u64 {
        self.faults_fatal.load(Ordering::Relaxed)
    }

    /// Successful protection changes.
    pub fn protect_calls(&self) -> u64 {
        self.protect_calls.load(Ordering::Relaxed)
    }

    /// Bytes currently reserved.
    pub fn bytes_reserved(&self) -> u64 {
        self.bytes_reserved.load(Ordering::Relaxed)
    }

    /// Bytes released so far.
    pub fn bytes_released(&self) -> u64 {
        self.bytes_released.load(Ordering::Relaxed)
    }
}
