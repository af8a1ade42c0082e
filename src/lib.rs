//! # folio-race
//!
//! Reproducer for a kernel deadlock between folio splitting during
//! `MADV_COLLAPSE` and concurrent `UFFDIO_MOVE`.
//!
//! This is the workspace root crate that re-exports the engine.
//! For direct usage, depend on individual sub-crates:
//!
//! - [`folio-race-core`] - Regions, page relocation, fault handling, driver
//! - [`folio-race-cli`] - CLI tool (`folio-race` binary)

pub use folio_race_core::*;
