//! Iteration driver
//!
//! Each iteration runs PreCoalesce, Sweep, AwaitCompletion and Swap:
//!
//! ```text
//!   Setup -> PreCoalesce -> Sweep -> AwaitCompletion -> Swap --+
//!               ^                                              |
//!               +----------------------------------------------+
//!                                                  (exhausted) -> Done
//! ```
//!
//! Entering Sweep releases the workers. The driver relocates every page in
//! order while the workers read the destination and fault the same pages in
//! reactively. The two paths meet in the move primitive.

use crate::config::ReproConfig;
use crate::control::SharedControl;
use crate::error::{ReproError, Result};
use crate::fault::FaultHandler;
use crate::mover::PageMover;
use crate::region::RegionPair;
use crate::shim::KernelShim;
use crate::stats::{RelocationSnapshot, RelocationStats};
use crate::worker::{ValidationTarget, WorkerPool};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Driver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Setup,
    PreCoalesce,
    Sweep,
    AwaitCompletion,
    Swap,
    Done,
}

/// Outcome of one completed iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    /// Zero-based iteration index
    pub iteration: usize,
    pub workers: usize,
    /// Completion counter observed at the barrier
    pub completed: usize,
    /// True if MADV_COLLAPSE was requested and accepted
    pub coalesced: bool,
    pub elapsed: Duration,
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub iterations: usize,
    /// Collapse requests the kernel declined
    pub coalesce_refusals: usize,
    pub relocation: RelocationSnapshot,
    pub elapsed: Duration,
}

/// Runs move/validate/swap cycles over a region pair and a worker pool
pub struct Driver {
    // Declared first so workers are joined before the regions are unmapped
    pool: WorkerPool,
    regions: RegionPair,
    mover: PageMover,
    control: Arc<SharedControl>,
    stats: Arc<RelocationStats>,
    config: ReproConfig,
    state: DriverState,
}

impl Driver {
    /// Set up the regions, install the fault handler and start the workers.
    ///
    /// With [`crate::shim::RealKernel`] the fault handler is process-wide, so
    /// only one driver can be set up per process.
    pub fn setup(kernel: Arc<dyn KernelShim>, config: ReproConfig) -> Result<Self> {
        trace!(state = ?DriverState::Setup, "Driver state");
        let regions = RegionPair::setup(Arc::clone(&kernel), &config)?;
        let stats = Arc::new(RelocationStats::new());
        let mover = PageMover::for_regions(&regions, Arc::clone(&stats));
        FaultHandler::install(kernel.as_ref(), mover.clone())?;

        let control = Arc::new(SharedControl::new());
        let destination = regions.destination();
        let target = ValidationTarget {
            kernel,
            base: destination.base(),
            len: destination.len(),
            page_size: destination.page_size(),
            fill_byte: config.fill_byte,
        };
        let pool = WorkerPool::spawn(config.workers, Arc::clone(&control), target, config.wait)?;

        info!(
            source = format_args!("{:#x}", regions.source().base()),
            destination = format_args!("{:#x}", destination.base()),
            len = destination.len(),
            workers = config.workers,
            coalesce = config.coalesce,
            "Reproducer ready"
        );

        Ok(Self {
            pool,
            regions,
            mover,
            control,
            stats,
            config,
            state: DriverState::Setup,
        })
    }

    pub fn regions(&self) -> &RegionPair {
        &self.regions
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> RelocationSnapshot {
        self.stats.snapshot()
    }

    fn transition(&mut self, next: DriverState) {
        trace!(from = ?self.state, to = ?next, "Driver state");
        self.state = next;
    }

    /// Run every configured iteration, handing each report to `observer`,
    /// then terminate and join the workers.
    ///
    /// Any failure stops the run. A worker error takes precedence over the
    /// barrier error the driver sees when that worker bails out. Any other
    /// driver error wins over a worker error.
    pub fn run(mut self, mut observer: impl FnMut(&IterationReport)) -> Result<RunSummary> {
        let started = Instant::now();
        let result = self.iterate(&mut observer);

        self.transition(DriverState::Done);
        self.control.terminate();
        let joined = self.pool.join();

        let (iterations, coalesce_refusals) = match (result, joined) {
            (Ok(counts), Ok(())) => counts,
            (Err(e), Ok(())) | (Ok(_), Err(e)) => return Err(e),
            (Err(driver_err @ ReproError::Barrier { .. }), Err(worker_err)) => {
                debug!(error = %driver_err, "Barrier abandoned by failed worker");
                return Err(worker_err);
            }
            (Err(driver_err), Err(worker_err)) => {
                debug!(error = %worker_err, "Worker failed after driver error");
                return Err(driver_err);
            }
        };

        let summary = RunSummary {
            iterations,
            coalesce_refusals,
            relocation: self.stats.snapshot(),
            elapsed: started.elapsed(),
        };
        info!(
            iterations = summary.iterations,
            moved = summary.relocation.moved,
            faults = summary.relocation.faults,
            contention = summary.relocation.contention_ratio(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Run complete"
        );
        Ok(summary)
    }

    /// Returns (completed iterations, declined collapses)
    fn iterate(&mut self, observer: &mut impl FnMut(&IterationReport)) -> Result<(usize, usize)> {
        let mut refusals = 0;
        for iteration in 0..self.config.iterations {
            let report = self.iteration(iteration)?;
            if self.config.coalesce && !report.coalesced {
                refusals += 1;
            }
            observer(&report);
        }
        Ok((self.config.iterations, refusals))
    }

    fn iteration(&mut self, iteration: usize) -> Result<IterationReport> {
        let started = Instant::now();

        self.transition(DriverState::PreCoalesce);
        let coalesced = self.config.coalesce && self.regions.coalesce_source();

        self.transition(DriverState::Sweep);
        let epoch = self.control.begin_run();
        self.mover.sweep()?;

        self.transition(DriverState::AwaitCompletion);
        self.control.finish_sweep();
        let completed = self.await_completion()?;

        self.transition(DriverState::Swap);
        self.regions.swap_roles()?;

        info!(iteration, epoch, completed, coalesced, "Iteration finished");
        Ok(IterationReport {
            iteration,
            workers: self.config.workers,
            completed,
            coalesced,
            elapsed: started.elapsed(),
        })
    }

    fn await_completion(&self) -> Result<usize> {
        let workers = self.config.workers;
        let control = &self.control;
        self.config
            .wait
            .wait_until(|| control.completed() >= workers || control.has_failed());

        let completed = control.completed();
        if control.has_failed() || completed != workers {
            return Err(ReproError::Barrier { completed, workers });
        }
        Ok(completed)
    }
}
