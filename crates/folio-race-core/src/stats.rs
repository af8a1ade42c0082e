//! Relocation statistics
//!
//! Counters are bumped from the SIGBUS handler, so they are plain relaxed
//! atomics: no locks, no allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the sweep and the fault handler
#[derive(Debug, Default)]
pub struct RelocationStats {
    /// Pages this process moved itself
    moved: AtomicU64,
    /// EEXIST: someone else resolved the page first
    already_resolved: AtomicU64,
    /// ENOENT: nothing at the source
    not_found: AtomicU64,
    /// EAGAIN retries
    busy_retries: AtomicU64,
    /// Missing-page notifications handled
    faults: AtomicU64,
}

impl RelocationStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_moved(&self) {
        self.moved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_already_resolved(&self) {
        self.already_resolved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_busy(&self) {
        self.busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> RelocationSnapshot {
        RelocationSnapshot {
            moved: self.moved.load(Ordering::Relaxed),
            already_resolved: self.already_resolved.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`RelocationStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationSnapshot {
    pub moved: u64,
    pub already_resolved: u64,
    pub not_found: u64,
    pub busy_retries: u64,
    pub faults: u64,
}

impl RelocationSnapshot {
    /// Relocation calls that returned (any non-fatal outcome)
    pub fn attempts(&self) -> u64 {
        self.moved + self.already_resolved + self.not_found
    }

    /// Fraction of attempts that lost the race to another actor
    pub fn contention_ratio(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.already_resolved as f64 / attempts as f64
    }
}
