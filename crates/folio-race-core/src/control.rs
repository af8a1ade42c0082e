//! Shared control state between the driver and the worker threads
//!
//! All accesses are sequentially consistent. A worker that observes the
//! driver leave the `Run` phase must also observe every page move the
//! driver issued before it, and the driver must see every increment of
//! `completed` before it swaps the regions.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Phase signal published by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// No sweep in progress
    Idle = 0,
    /// Sweep in progress; workers validate concurrently
    Run = 1,
    /// Workers exit
    Terminate = 2,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Phase::Run,
            2 => Phase::Terminate,
            _ => Phase::Idle,
        }
    }
}

/// What a worker should do after polling [`SharedControl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    Wait,
    /// Validate the destination for this epoch
    Validate(u64),
    Exit,
}

/// Atomics shared by the driver and all workers
#[derive(Debug)]
pub struct SharedControl {
    phase: AtomicU8,
    completed: AtomicUsize,
    /// Bumped once per iteration so a worker validates exactly once each
    epoch: AtomicU64,
    failed: AtomicBool,
}

impl Default for SharedControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedControl {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            completed: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::SeqCst))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a sweep: clear completions, signal `Run` and open a new epoch.
    /// Returns the new epoch.
    ///
    /// `Run` is published before the epoch and `completed` is cleared before
    /// both, so no worker can count toward the new epoch early.
    pub fn begin_run(&self) -> u64 {
        self.completed.store(0, Ordering::SeqCst);
        self.phase.store(Phase::Run as u8, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Next step for a worker whose last validated epoch is `last_epoch`.
    ///
    /// A worker that only notices the new epoch after the sweep finished
    /// still validates it once; the driver is waiting for it.
    pub fn next_step(&self, last_epoch: u64) -> WorkerStep {
        let epoch = self.epoch();
        match self.phase() {
            Phase::Terminate => WorkerStep::Exit,
            _ if epoch != last_epoch => WorkerStep::Validate(epoch),
            _ => WorkerStep::Wait,
        }
    }

    /// Sweep done
    pub fn finish_sweep(&self) {
        self.phase.store(Phase::Idle as u8, Ordering::SeqCst);
    }

    pub fn terminate(&self) {
        self.phase.store(Phase::Terminate as u8, Ordering::SeqCst);
    }

    /// Record one worker's completed validation pass
    pub fn complete(&self) -> usize {
        self.completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn raise_failure(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
