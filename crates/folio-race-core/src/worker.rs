//! Reader thread pool
//!
//! Workers validate the destination once per iteration, in lock-step with
//! the driver through [`SharedControl`]. They only read: a missing page is
//! resolved by the fault handler on the worker's own thread.

use crate::config::WaitStrategy;
use crate::control::{SharedControl, WorkerStep};
use crate::error::{ReproError, Result};
use crate::shim::KernelShim;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// What a worker reads and what it expects to find
#[derive(Clone)]
pub struct ValidationTarget {
    pub kernel: Arc<dyn KernelShim>,
    /// Destination base address
    pub base: usize,
    pub len: usize,
    pub page_size: usize,
    pub fill_byte: u8,
}

impl ValidationTarget {
    /// Check the first byte of every page
    pub fn validate(&self) -> Result<()> {
        for addr in (self.base..self.base + self.len).step_by(self.page_size) {
            let found = self
                .kernel
                .read_byte(addr)
                .map_err(|source| ReproError::Read { addr, source })?;
            if found != self.fill_byte {
                return Err(ReproError::Corruption {
                    addr,
                    expected: self.fill_byte,
                    found,
                });
            }
        }
        Ok(())
    }
}

/// Handle for a running worker thread
pub struct WorkerHandle {
    pub index: usize,
    pub thread: JoinHandle<Result<()>>,
}

/// Pool of reader threads
pub struct WorkerPool {
    control: Arc<SharedControl>,
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `count` workers named `folio-worker-<n>`.
    ///
    /// If a spawn fails the already-running workers are terminated and
    /// joined before the error is returned.
    pub fn spawn(
        count: usize,
        control: Arc<SharedControl>,
        target: ValidationTarget,
        wait: WaitStrategy,
    ) -> Result<Self> {
        let mut pool = Self {
            control,
            workers: Vec::with_capacity(count),
        };
        for index in 0..count {
            let control = Arc::clone(&pool.control);
            let target = target.clone();
            let spawned = thread::Builder::new()
                .name(format!("folio-worker-{index}"))
                .spawn(move || run_worker(index, &control, &target, wait));
            match spawned {
                Ok(thread) => pool.workers.push(WorkerHandle { index, thread }),
                Err(source) => {
                    pool.control.terminate();
                    let _ = pool.join();
                    return Err(ReproError::ThreadSpawn { index, source });
                }
            }
        }
        debug!(workers = count, "Worker pool started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn control(&self) -> &Arc<SharedControl> {
        &self.control
    }

    /// Join every worker. Returns the first worker error, or
    /// [`ReproError::ThreadJoin`] for a panicked worker.
    ///
    /// Does not signal termination; callers do that first.
    pub fn join(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.workers.drain(..) {
            let result = match handle.thread.join() {
                Ok(result) => result,
                Err(_) => Err(ReproError::ThreadJoin {
                    index: handle.index,
                }),
            };
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.control.terminate();
            let _ = self.join();
        }
    }
}

/// Raises the failure flag if the worker unwinds
struct PanicGuard<'a>(&'a SharedControl);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.raise_failure();
        }
    }
}

fn run_worker(
    index: usize,
    control: &SharedControl,
    target: &ValidationTarget,
    wait: WaitStrategy,
) -> Result<()> {
    let _guard = PanicGuard(control);
    let mut last_epoch = 0;
    loop {
        let mut step = WorkerStep::Wait;
        wait.wait_until(|| {
            step = control.next_step(last_epoch);
            step != WorkerStep::Wait
        });

        match step {
            WorkerStep::Validate(epoch) => {
                if let Err(e) = target.validate() {
                    error!(worker = index, epoch, error = %e, "Validation failed");
                    control.raise_failure();
                    return Err(e);
                }
                last_epoch = epoch;
                control.complete();
            }
            WorkerStep::Exit | WorkerStep::Wait => return Ok(()),
        }
    }
}
