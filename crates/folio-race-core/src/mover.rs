//! Idempotent single-page relocation
//!
//! Both the driver's proactive sweep and the reactive fault handler call
//! [`PageMover::relocate`] for the same pages at the same time. The move
//! primitive resolves the race: whoever loses gets `EEXIST` (already
//! resolved) or `ENOENT` (the source is already gone) and treats it as done.

use crate::error::{ReproError, Result};
use crate::region::{Region, RegionPair};
use crate::shim::KernelShim;
use crate::stats::RelocationStats;
use std::sync::Arc;

/// Non-fatal result of a relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// This call moved the page
    Moved,
    /// The destination page was already present
    AlreadyResolved,
    /// Nothing at the source to move
    NotFound,
}

/// Moves pages from the source region to the same offset in the destination
#[derive(Clone)]
pub struct PageMover {
    kernel: Arc<dyn KernelShim>,
    destination: Region,
    src_base: usize,
    stats: Arc<RelocationStats>,
}

impl PageMover {
    /// Mover into `destination` from a source of the same length at `src_base`
    pub fn new(
        kernel: Arc<dyn KernelShim>,
        destination: Region,
        src_base: usize,
        stats: Arc<RelocationStats>,
    ) -> Self {
        Self {
            kernel,
            destination,
            src_base,
            stats,
        }
    }

    /// Mover bound to the destination and source of `regions`
    pub fn for_regions(regions: &RegionPair, stats: Arc<RelocationStats>) -> Self {
        Self::new(
            Arc::clone(regions.kernel()),
            *regions.destination(),
            regions.source().base(),
            stats,
        )
    }

    pub fn destination(&self) -> &Region {
        &self.destination
    }

    pub fn stats(&self) -> &Arc<RelocationStats> {
        &self.stats
    }

    /// Move one page from `src_off` in the source to `dst_off` in the
    /// destination. Offsets are rounded down to page boundaries.
    ///
    /// `EAGAIN` is retried until the kernel reports something else. There
    /// is no bound and no backoff.
    pub fn relocate(&self, dst_off: usize, src_off: usize) -> Result<MoveOutcome> {
        let page_size = self.destination.page_size();
        let dst = self.destination.base() + self.destination.page_offset(dst_off)?;
        let src = self.src_base + self.destination.page_offset(src_off)?;
        loop {
            let Err(err) = self.kernel.move_page(dst, src, page_size) else {
                self.stats.record_moved();
                return Ok(MoveOutcome::Moved);
            };
            match err.raw_os_error() {
                Some(errno) if ReproError::is_retriable_errno(errno) => {
                    self.stats.record_busy();
                }
                Some(nix::libc::EEXIST) => {
                    self.stats.record_already_resolved();
                    return Ok(MoveOutcome::AlreadyResolved);
                }
                Some(errno) if ReproError::is_idempotent_errno(errno) => {
                    self.stats.record_not_found();
                    return Ok(MoveOutcome::NotFound);
                }
                _ => {
                    return Err(ReproError::Relocate {
                        dst,
                        src,
                        source: err,
                    })
                }
            }
        }
    }

    /// Relocate every page in ascending offset order, stopping at the first
    /// fatal error.
    pub fn sweep(&self) -> Result<()> {
        for offset in self.destination.page_offsets() {
            self.relocate(offset, offset)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PageMover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMover")
            .field("dst_base", &format_args!("{:#x}", self.destination.base()))
            .field("src_base", &format_args!("{:#x}", self.src_base))
            .field("len", &self.destination.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReproConfig;
    use crate::region::{HugePagePolicy, Residency};
    use crate::sim::SimKernel;
    use crate::sys::PAGE_SIZE;

    const PAGES: usize = 8;

    fn setup() -> (Arc<SimKernel>, RegionPair, PageMover) {
        let sim = Arc::new(SimKernel::new());
        let config = ReproConfig::default().with_region_len(PAGES * PAGE_SIZE);
        let pair = RegionPair::setup(sim.clone(), &config).unwrap();
        let mover = PageMover::for_regions(&pair, Arc::new(RelocationStats::new()));
        (sim, pair, mover)
    }

    // ========================================================================
    // relocate
    // ========================================================================

    #[test]
    fn test_relocate_moves_page() {
        let (sim, pair, mover) = setup();
        let dst = pair.destination().base();
        let src = pair.source().base();

        assert_eq!(mover.relocate(0, 0).unwrap(), MoveOutcome::Moved);
        assert_eq!(sim.peek(dst), Some(b'a'));
        assert!(!sim.is_resolved(src));
        assert_eq!(mover.stats().snapshot().moved, 1);
    }

    #[test]
    fn test_relocate_idempotent() {
        let (sim, pair, mover) = setup();
        let dst = pair.destination().base();

        mover.relocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(
            mover.relocate(PAGE_SIZE, PAGE_SIZE).unwrap(),
            MoveOutcome::AlreadyResolved
        );
        assert_eq!(sim.peek(dst + PAGE_SIZE), Some(b'a'));
        assert_eq!(sim.move_count(), 1);
    }

    #[test]
    fn test_relocate_rounds_down() {
        let (sim, pair, mover) = setup();
        let dst = pair.destination().base();

        mover.relocate(2 * PAGE_SIZE + 123, 2 * PAGE_SIZE + 4000).unwrap();
        assert!(sim.is_resolved(dst + 2 * PAGE_SIZE));
        assert!(!sim.is_resolved(dst + 3 * PAGE_SIZE));
    }

    #[test]
    fn test_relocate_source_missing() {
        let (_sim, pair, mover) = setup();
        let src = pair.source().base();
        let kernel = pair.kernel();
        // Drain the source page into the destination at another offset
        kernel
            .move_page(pair.destination().base() + PAGE_SIZE, src, PAGE_SIZE)
            .unwrap();
        assert_eq!(mover.relocate(0, 0).unwrap(), MoveOutcome::NotFound);
        assert_eq!(mover.stats().snapshot().not_found, 1);
    }

    #[test]
    fn test_relocate_injected_not_found() {
        let (sim, pair, mover) = setup();
        sim.inject_not_found(pair.destination().base() + 3 * PAGE_SIZE);
        assert_eq!(
            mover.relocate(3 * PAGE_SIZE, 3 * PAGE_SIZE).unwrap(),
            MoveOutcome::NotFound
        );
        assert!(!sim.is_resolved(pair.destination().base() + 3 * PAGE_SIZE));
    }

    #[test]
    fn test_relocate_retries_busy() {
        let (sim, pair, mover) = setup();
        sim.inject_busy(5);
        assert_eq!(mover.relocate(0, 0).unwrap(), MoveOutcome::Moved);
        assert!(sim.is_resolved(pair.destination().base()));
        assert_eq!(mover.stats().snapshot().busy_retries, 5);
    }

    #[test]
    fn test_relocate_out_of_range() {
        let (_sim, _pair, mover) = setup();
        assert!(matches!(
            mover.relocate(PAGES * PAGE_SIZE, 0),
            Err(ReproError::OutOfRange { .. })
        ));
        assert!(matches!(
            mover.relocate(0, PAGES * PAGE_SIZE),
            Err(ReproError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_relocate_fatal_error() {
        let sim = Arc::new(SimKernel::new());
        // Never negotiated: the move fails with EBADF
        let destination = Region::new(
            0x7000_0000,
            PAGE_SIZE,
            PAGE_SIZE,
            Residency::DemandZero,
            HugePagePolicy::Disable,
        )
        .unwrap();
        let mover = PageMover::new(sim, destination, 0x2340_0000, Arc::new(RelocationStats::new()));
        let err = mover.relocate(0, 0).unwrap_err();
        assert!(matches!(err, ReproError::Relocate { .. }));
        assert_eq!(err.to_errno(), -nix::libc::EBADF);
    }

    // ========================================================================
    // sweep
    // ========================================================================

    #[test]
    fn test_sweep_resolves_all() {
        let (sim, pair, mover) = setup();
        mover.sweep().unwrap();
        let dst = *pair.destination();
        for offset in dst.page_offsets() {
            assert_eq!(sim.peek(dst.base() + offset), Some(b'a'));
        }
        assert_eq!(mover.stats().snapshot().moved, PAGES as u64);
    }

    #[test]
    fn test_sweep_skips_not_found() {
        let (sim, pair, mover) = setup();
        let dst = *pair.destination();
        sim.inject_not_found(dst.base() + 5 * PAGE_SIZE);
        mover.sweep().unwrap();
        for offset in dst.page_offsets() {
            assert_eq!(sim.is_resolved(dst.base() + offset), offset != 5 * PAGE_SIZE);
        }
        let snap = mover.stats().snapshot();
        assert_eq!(snap.moved, PAGES as u64 - 1);
        assert_eq!(snap.not_found, 1);
    }

    #[test]
    fn test_sweep_after_partial_resolution() {
        let (_sim, _pair, mover) = setup();
        mover.relocate(0, 0).unwrap();
        mover.relocate(4 * PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        mover.sweep().unwrap();
        let snap = mover.stats().snapshot();
        assert_eq!(snap.moved, PAGES as u64);
        assert_eq!(snap.already_resolved, 2);
    }
}
