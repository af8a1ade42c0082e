//! Source and destination regions
//!
//! The source is pre-populated with the fill pattern at a fixed address and
//! made huge-page eligible when coalescing is on. The destination is
//! demand-zero, never huge-page eligible, and registered for missing-page
//! notification so touching an unresolved page faults into the handler.

use crate::config::ReproConfig;
use crate::error::{ReproError, Result};
use crate::shim::{Advice, KernelShim};
use crate::sys::{align_down, is_aligned, PAGE_SIZE, UFFD_FEATURE_MOVE, UFFD_FEATURE_SIGBUS};
use nix::libc;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a region gets its physical pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Every page written at setup
    Populated,
    /// Nothing resident until first touch
    DemandZero,
}

/// Huge-page eligibility applied with madvise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugePagePolicy {
    Enable,
    Disable,
}

impl HugePagePolicy {
    pub fn from_coalesce(coalesce: bool) -> Self {
        if coalesce {
            Self::Enable
        } else {
            Self::Disable
        }
    }

    pub fn advice(self) -> Advice {
        match self {
            Self::Enable => Advice::HugePage,
            Self::Disable => Advice::NoHugePage,
        }
    }
}

/// A contiguous, page-divided virtual address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: usize,
    len: usize,
    page_size: usize,
    residency: Residency,
    huge: HugePagePolicy,
}

impl Region {
    pub fn new(
        base: usize,
        len: usize,
        page_size: usize,
        residency: Residency,
        huge: HugePagePolicy,
    ) -> Result<Self> {
        if len == 0 || !page_size.is_power_of_two() || !is_aligned(len, page_size) {
            return Err(ReproError::Config(format!(
                "region length {len:#x} is not a multiple of page size {page_size:#x}"
            )));
        }
        Ok(Self {
            base,
            len,
            page_size,
            residency,
            huge,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn huge_policy(&self) -> HugePagePolicy {
        self.huge
    }

    pub fn page_count(&self) -> usize {
        self.len / self.page_size
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Page-aligned offset of `addr` from the base
    pub fn page_offset_of(&self, addr: usize) -> Result<usize> {
        self.page_offset(addr.wrapping_sub(self.base))
    }

    /// `offset` rounded down to a page boundary, if it lies in the region
    pub fn page_offset(&self, offset: usize) -> Result<usize> {
        if offset >= self.len {
            return Err(ReproError::OutOfRange {
                addr: self.base.wrapping_add(offset),
                base: self.base,
                len: self.len,
            });
        }
        Ok(align_down(offset, self.page_size))
    }

    /// Page offsets in ascending order
    pub fn page_offsets(&self) -> impl Iterator<Item = usize> {
        (0..self.len).step_by(self.page_size)
    }
}

/// The source/destination pair plus the kernel that owns their mappings
pub struct RegionPair {
    kernel: Arc<dyn KernelShim>,
    source: Region,
    destination: Region,
}

impl RegionPair {
    /// Negotiate userfaultfd, then allocate and configure both regions.
    pub fn setup(kernel: Arc<dyn KernelShim>, config: &ReproConfig) -> Result<Self> {
        config.validate()?;
        let page_size = kernel.page_size();
        if page_size != PAGE_SIZE {
            return Err(ReproError::Config(format!(
                "kernel page size {page_size} unsupported, need {PAGE_SIZE}"
            )));
        }

        negotiate(kernel.as_ref())?;

        let policy = HugePagePolicy::from_coalesce(config.coalesce);
        let source = map_source(kernel.as_ref(), config, policy)?;
        // From here on the pair owns the source mapping and unmaps it on error
        let mut pair = Self {
            kernel: Arc::clone(&kernel),
            source,
            destination: source,
        };
        pair.populate_source(config.fill_byte)?;
        pair.destination = map_destination(kernel.as_ref(), config.region_len)?;

        if pair.source.overlaps(&pair.destination) {
            return Err(ReproError::Config(format!(
                "source {:#x} and destination {:#x} overlap",
                pair.source.base, pair.destination.base
            )));
        }

        debug!(
            source = format_args!("{:#x}", pair.source.base),
            destination = format_args!("{:#x}", pair.destination.base),
            len = config.region_len,
            pages = pair.source.page_count(),
            huge = ?policy,
            "Regions configured"
        );
        Ok(pair)
    }

    pub fn source(&self) -> &Region {
        &self.source
    }

    pub fn destination(&self) -> &Region {
        &self.destination
    }

    pub fn kernel(&self) -> &Arc<dyn KernelShim> {
        &self.kernel
    }

    fn populate_source(&self, fill: u8) -> Result<()> {
        for offset in self.source.page_offsets() {
            let addr = self.source.base + offset;
            self.kernel
                .write_byte(addr, fill)
                .map_err(|source| ReproError::Map {
                    what: "source populate",
                    addr,
                    len: self.source.page_size,
                    source,
                })?;
        }
        Ok(())
    }

    /// Request MADV_COLLAPSE on the source. Best effort: returns false if the
    /// kernel declined.
    pub fn coalesce_source(&self) -> bool {
        match self
            .kernel
            .advise(self.source.base, self.source.len, Advice::Collapse)
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    addr = format_args!("{:#x}", self.source.base),
                    error = %e,
                    "MADV_COLLAPSE declined"
                );
                false
            }
        }
    }

    /// Move the resolved destination pages onto the source address and
    /// reapply the source huge-page policy.
    pub fn swap_roles(&self) -> Result<()> {
        let from = self.destination.base;
        let to = self.source.base;
        self.kernel
            .remap_dontunmap(from, self.destination.len, to)
            .map_err(|source| ReproError::Remap { from, to, source })?;

        let advice = self.source.huge.advice();
        self.kernel
            .advise(to, self.source.len, advice)
            .map_err(|source| ReproError::Advise {
                advice: advice.name(),
                addr: to,
                source,
            })
    }
}

impl Drop for RegionPair {
    fn drop(&mut self) {
        let mut regions = vec![self.source];
        if self.destination != self.source {
            regions.push(self.destination);
        }
        for region in regions {
            if let Err(e) = self.kernel.unmap(region.base, region.len) {
                debug!(addr = format_args!("{:#x}", region.base), error = %e, "munmap failed");
            }
        }
    }
}

/// Capability handshake: SIGBUS delivery requested, MOVE required.
fn negotiate(kernel: &dyn KernelShim) -> Result<u64> {
    let features = kernel
        .negotiate(UFFD_FEATURE_SIGBUS)
        .map_err(ReproError::Handshake)?;
    if features & UFFD_FEATURE_SIGBUS == 0 {
        return Err(ReproError::MissingCapability {
            feature: "UFFD_FEATURE_SIGBUS",
            available: features,
        });
    }
    if features & UFFD_FEATURE_MOVE == 0 {
        return Err(ReproError::MissingCapability {
            feature: "UFFD_FEATURE_MOVE",
            available: features,
        });
    }
    Ok(features)
}

/// Map the source at the hint, probing upward on EEXIST.
fn map_source(
    kernel: &dyn KernelShim,
    config: &ReproConfig,
    policy: HugePagePolicy,
) -> Result<Region> {
    let len = config.region_len;
    let mut addr = config.source_hint;
    let base = loop {
        match kernel.map_fixed_noreplace(addr, len) {
            Ok(base) => break base,
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                debug!(addr = format_args!("{addr:#x}"), "Source address in use, probing");
                addr = addr
                    .checked_add(config.probe_stride)
                    .filter(|a| a.checked_add(len).is_some())
                    .ok_or(ReproError::AddressSpaceExhausted {
                        start: config.source_hint,
                    })?;
            }
            Err(source) => {
                return Err(ReproError::Map {
                    what: "source",
                    addr,
                    len,
                    source,
                })
            }
        }
    };

    let advice = policy.advice();
    if let Err(source) = kernel.advise(base, len, advice) {
        let _ = kernel.unmap(base, len);
        return Err(ReproError::Advise {
            advice: advice.name(),
            addr: base,
            source,
        });
    }
    Region::new(base, len, kernel.page_size(), Residency::Populated, policy)
}

/// Map the demand-zero destination and register it for missing faults.
fn map_destination(kernel: &dyn KernelShim, len: usize) -> Result<Region> {
    let base = kernel.map_anonymous(len).map_err(|source| ReproError::Map {
        what: "destination",
        addr: 0,
        len,
        source,
    })?;

    let configure = || -> Result<Region> {
        kernel
            .advise(base, len, Advice::NoHugePage)
            .map_err(|source| ReproError::Advise {
                advice: Advice::NoHugePage.name(),
                addr: base,
                source,
            })?;
        kernel
            .register_missing(base, len)
            .map_err(|source| ReproError::Register {
                addr: base,
                len,
                source,
            })?;
        Region::new(
            base,
            len,
            kernel.page_size(),
            Residency::DemandZero,
            HugePagePolicy::Disable,
        )
    };

    configure().inspect_err(|_| {
        let _ = kernel.unmap(base, len);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;
    use crate::sys::HUGE_PAGE_SIZE;

    fn small_config() -> ReproConfig {
        ReproConfig::default().with_region_len(8 * PAGE_SIZE)
    }

    // ========================================================================
    // Region
    // ========================================================================

    #[test]
    fn test_region_rejects_unaligned_len() {
        let r = Region::new(0, PAGE_SIZE + 1, PAGE_SIZE, Residency::DemandZero, HugePagePolicy::Disable);
        assert!(r.is_err());
    }

    #[test]
    fn test_region_page_offset_of() {
        let r = Region::new(0x10000, 4 * PAGE_SIZE, PAGE_SIZE, Residency::DemandZero, HugePagePolicy::Disable)
            .unwrap();
        assert_eq!(r.page_offset_of(0x10000).unwrap(), 0);
        assert_eq!(r.page_offset_of(0x10000 + PAGE_SIZE + 17).unwrap(), PAGE_SIZE);
        assert_eq!(r.page_offset_of(0x10000 + 4 * PAGE_SIZE - 1).unwrap(), 3 * PAGE_SIZE);
        assert!(matches!(
            r.page_offset_of(0x10000 + 4 * PAGE_SIZE),
            Err(ReproError::OutOfRange { .. })
        ));
        assert!(r.page_offset_of(0x10000 - 1).is_err());
    }

    #[test]
    fn test_region_page_offset_rounds_down() {
        let r = Region::new(0x10000, 4 * PAGE_SIZE, PAGE_SIZE, Residency::Populated, HugePagePolicy::Enable)
            .unwrap();
        assert_eq!(r.page_offset(PAGE_SIZE + 5).unwrap(), PAGE_SIZE);
        assert!(r.page_offset(4 * PAGE_SIZE).is_err());
    }

    #[test]
    fn test_region_offsets_ascending() {
        let r = Region::new(0, 3 * PAGE_SIZE, PAGE_SIZE, Residency::Populated, HugePagePolicy::Disable)
            .unwrap();
        let offsets: Vec<usize> = r.page_offsets().collect();
        assert_eq!(offsets, vec![0, PAGE_SIZE, 2 * PAGE_SIZE]);
        assert_eq!(r.page_count(), 3);
    }

    #[test]
    fn test_region_overlap() {
        let a = Region::new(0, 2 * PAGE_SIZE, PAGE_SIZE, Residency::Populated, HugePagePolicy::Disable)
            .unwrap();
        let b = Region::new(PAGE_SIZE, 2 * PAGE_SIZE, PAGE_SIZE, Residency::DemandZero, HugePagePolicy::Disable)
            .unwrap();
        let c = Region::new(2 * PAGE_SIZE, PAGE_SIZE, PAGE_SIZE, Residency::DemandZero, HugePagePolicy::Disable)
            .unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    // ========================================================================
    // Setup
    // ========================================================================

    #[test]
    fn test_setup_populates_source() {
        let sim = Arc::new(SimKernel::new());
        let pair = RegionPair::setup(sim.clone(), &small_config()).unwrap();
        let src = *pair.source();
        assert_eq!(src.base(), 0x2340_0000);
        assert_eq!(src.residency(), Residency::Populated);
        for offset in src.page_offsets() {
            assert_eq!(sim.peek(src.base() + offset), Some(b'a'));
        }
    }

    #[test]
    fn test_setup_destination_unresolved_and_registered() {
        let sim = Arc::new(SimKernel::new());
        let pair = RegionPair::setup(sim.clone(), &small_config()).unwrap();
        let dst = *pair.destination();
        assert_eq!(dst.residency(), Residency::DemandZero);
        assert_eq!(dst.huge_policy(), HugePagePolicy::Disable);
        assert!(sim.is_registered(dst.base()));
        assert!(!sim.is_registered(pair.source().base()));
        for offset in dst.page_offsets() {
            assert!(!sim.is_resolved(dst.base() + offset));
        }
        assert_eq!(sim.huge_policy(dst.base()), Some(false));
    }

    #[test]
    fn test_setup_applies_huge_policy() {
        let sim = Arc::new(SimKernel::new());
        let mut config = small_config();
        config.coalesce = true;
        let pair = RegionPair::setup(sim.clone(), &config).unwrap();
        assert_eq!(sim.huge_policy(pair.source().base()), Some(true));

        let sim = Arc::new(SimKernel::new());
        let pair = RegionPair::setup(sim.clone(), &small_config()).unwrap();
        assert_eq!(sim.huge_policy(pair.source().base()), Some(false));
    }

    #[test]
    fn test_setup_probes_past_collision() {
        let sim = Arc::new(SimKernel::new());
        sim.reserve(0x2340_0000, 2 * HUGE_PAGE_SIZE);
        let pair = RegionPair::setup(sim.clone(), &small_config()).unwrap();
        assert_eq!(pair.source().base(), 0x2340_0000 + 2 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn test_setup_missing_move_capability() {
        let sim = Arc::new(SimKernel::with_features(UFFD_FEATURE_SIGBUS));
        let err = RegionPair::setup(sim, &small_config()).err().unwrap();
        assert!(matches!(
            err,
            ReproError::MissingCapability {
                feature: "UFFD_FEATURE_MOVE",
                ..
            }
        ));
    }

    #[test]
    fn test_setup_rejects_invalid_config() {
        let sim = Arc::new(SimKernel::new());
        let config = ReproConfig::default().with_region_len(100);
        assert!(matches!(
            RegionPair::setup(sim, &config),
            Err(ReproError::Config(_))
        ));
    }

    #[test]
    fn test_drop_unmaps_both() {
        let sim = Arc::new(SimKernel::new());
        let pair = RegionPair::setup(sim.clone(), &small_config()).unwrap();
        let src = pair.source().base();
        let dst = pair.destination().base();
        drop(pair);
        assert!(sim.peek(src).is_none());
        assert!(!sim.is_registered(dst));
    }

    // ========================================================================
    // Coalesce and swap
    // ========================================================================

    #[test]
    fn test_coalesce_declined_is_not_fatal() {
        let sim = Arc::new(SimKernel::new());
        let mut config = small_config();
        config.coalesce = true;
        let pair = RegionPair::setup(sim.clone(), &config).unwrap();
        assert!(pair.coalesce_source());
        sim.set_decline_collapse(true);
        assert!(!pair.coalesce_source());
    }

    #[test]
    fn test_swap_roles_restores_source() {
        let sim = Arc::new(SimKernel::new());
        let pair = RegionPair::setup(sim.clone(), &small_config()).unwrap();
        let src = *pair.source();
        let dst = *pair.destination();
        for offset in src.page_offsets() {
            sim.move_page(dst.base() + offset, src.base() + offset, PAGE_SIZE)
                .unwrap();
        }
        pair.swap_roles().unwrap();

        for offset in src.page_offsets() {
            assert_eq!(sim.peek(src.base() + offset), Some(b'a'));
            assert!(!sim.is_resolved(dst.base() + offset));
        }
        assert!(sim.is_registered(dst.base()));
        assert_eq!(sim.huge_policy(src.base()), Some(false));
    }
}
