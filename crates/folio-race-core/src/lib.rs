//! Reproducer engine for a kernel deadlock between folio splitting during
//! `MADV_COLLAPSE` and concurrent `UFFDIO_MOVE`.
//!
//! A driver thread relocates every page of a populated source region into a
//! userfaultfd-registered destination while worker threads read the
//! destination. Pages the workers reach first are resolved by the fault
//! handler on the worker's thread, so both paths race inside the kernel's
//! move primitive. After each iteration the destination is remapped back
//! onto the source and, optionally, collapsed into a huge page again.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use folio_race_core::{Driver, ReproConfig, SimKernel, WaitStrategy};
//!
//! let config = ReproConfig::new(false, 2, 3)
//!     .with_region_len(64 * 4096)
//!     .with_wait(WaitStrategy::yielding());
//! let driver = Driver::setup(Arc::new(SimKernel::new()), config).unwrap();
//! let summary = driver
//!     .run(|report| println!("iteration {} completed", report.iteration))
//!     .unwrap();
//!
//! assert_eq!(summary.iterations, 3);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

#[cfg(not(target_os = "linux"))]
compile_error!("folio-race-core requires Linux (userfaultfd)");

pub mod config;
pub mod control;
pub mod driver;
mod error;
pub mod fault;
pub mod mover;
pub mod region;
pub mod shim;
pub mod sim;
pub mod stats;
pub mod sys;
pub mod worker;

pub use config::{ReproConfig, WaitStrategy};
pub use control::{Phase, SharedControl};
pub use driver::{Driver, DriverState, IterationReport, RunSummary};
pub use error::{ReproError, Result};
pub use fault::FaultHandler;
pub use mover::{MoveOutcome, PageMover};
pub use region::{HugePagePolicy, Region, RegionPair, Residency};
pub use shim::{Advice, FaultSink, KernelShim, RealKernel};
pub use sim::SimKernel;
pub use stats::{RelocationSnapshot, RelocationStats};
pub use sys::{HUGE_PAGE_SIZE, PAGE_SIZE};
pub use worker::{ValidationTarget, WorkerPool};
