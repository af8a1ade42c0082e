//! Regression tests for known edge cases

use std::sync::Arc;

use folio_race::{
    Driver, KernelShim, ReproConfig, ReproError, SimKernel, WaitStrategy, HUGE_PAGE_SIZE,
    PAGE_SIZE,
};

fn yielding(workers: usize, iterations: usize) -> ReproConfig {
    ReproConfig::new(false, workers, iterations).with_wait(WaitStrategy::yielding())
}

#[test]
fn test_single_page_region() {
    let driver = Driver::setup(
        Arc::new(SimKernel::new()),
        yielding(3, 4).with_region_len(PAGE_SIZE),
    )
    .unwrap();
    let summary = driver.run(|r| assert_eq!(r.completed, 3)).unwrap();
    assert_eq!(summary.relocation.moved, 4);
}

#[test]
fn test_zero_iterations() {
    let sim = Arc::new(SimKernel::new());
    let driver = Driver::setup(sim.clone(), yielding(2, 0).with_region_len(4 * PAGE_SIZE)).unwrap();
    let summary = driver.run(|_| panic!("no iteration expected")).unwrap();
    assert_eq!(summary.iterations, 0);
    assert_eq!(sim.move_count(), 0);
}

#[test]
fn test_probe_stops_at_address_space_end() {
    let sim = Arc::new(SimKernel::new());
    // Last 2MB-aligned slot; the next probe would wrap
    let top = usize::MAX - HUGE_PAGE_SIZE + 1;
    sim.reserve(top, HUGE_PAGE_SIZE - 1);
    let config = yielding(1, 1)
        .with_region_len(4 * PAGE_SIZE)
        .with_source_hint(top);
    let err = Driver::setup(sim, config).err().unwrap();
    assert!(matches!(err, ReproError::AddressSpaceExhausted { .. }));
}

#[test]
fn test_source_hint_past_address_space_end() {
    let sim = Arc::new(SimKernel::new());
    let config = yielding(1, 1)
        .with_region_len(4 * PAGE_SIZE)
        .with_source_hint(usize::MAX - PAGE_SIZE + 1);
    let err = Driver::setup(sim.clone(), config).err().unwrap();
    assert!(matches!(err, ReproError::Config(_)), "unexpected error: {err}");
    assert!(sim.negotiate(0).is_ok());
}

#[test]
fn test_unaligned_region_rejected_before_kernel() {
    let sim = Arc::new(SimKernel::new());
    let err = Driver::setup(sim.clone(), yielding(1, 1).with_region_len(PAGE_SIZE + 1))
        .err()
        .unwrap();
    assert!(matches!(err, ReproError::Config(_)));
    // The userfaultfd handshake never happened
    assert!(sim.negotiate(0).is_ok());
}
