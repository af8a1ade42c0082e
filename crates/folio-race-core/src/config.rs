//! Reproducer configuration
//!
//! Defaults match the layout the deadlock was first observed with: a 4MB
//! region probed from 0x23400000 in 2MB steps, filled with `'a'`.

use crate::error::{ReproError, Result};
use crate::sys::{is_aligned, HUGE_PAGE_SIZE, PAGE_SIZE};

/// Default region length (4MB)
pub const DEFAULT_REGION_LEN: usize = 4 * 1024 * 1024;
/// Default fixed address for the source region
pub const DEFAULT_SOURCE_HINT: usize = 0x2340_0000;
/// Fill pattern written into every source page
pub const DEFAULT_FILL_BYTE: u8 = b'a';

/// How threads wait on the shared control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Pure busy-wait. Keeps the timing that makes the race reproduce.
    #[default]
    Spin,
    /// Spin for `spin_cycles`, then yield the CPU.
    Yield { spin_cycles: u32 },
}

impl WaitStrategy {
    /// Yielding strategy with the default spin budget
    pub fn yielding() -> Self {
        Self::Yield { spin_cycles: 1_000 }
    }

    /// Spin until `done` returns true.
    #[inline]
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let mut spins = 0u32;
        while !done() {
            match *self {
                Self::Spin => std::hint::spin_loop(),
                Self::Yield { spin_cycles } => {
                    if spins < spin_cycles {
                        spins += 1;
                        std::hint::spin_loop();
                    } else {
                        spins = 0;
                        std::thread::yield_now();
                    }
                }
            }
        }
    }
}

/// Reproducer configuration
#[derive(Debug, Clone)]
pub struct ReproConfig {
    /// Enable huge-page eligibility on the source and collapse it every iteration
    pub coalesce: bool,

    /// Number of reader threads
    pub workers: usize,

    /// Number of move/validate/swap cycles
    pub iterations: usize,

    /// Length of each region in bytes
    pub region_len: usize,

    /// First address tried for the source mapping
    pub source_hint: usize,

    /// Step between probed source addresses on collision
    pub probe_stride: usize,

    /// Byte written at the start of every source page
    pub fill_byte: u8,

    /// Wait strategy for workers and driver
    pub wait: WaitStrategy,
}

impl Default for ReproConfig {
    fn default() -> Self {
        Self {
            coalesce: false,
            workers: 1,
            iterations: 1,
            region_len: DEFAULT_REGION_LEN,
            source_hint: DEFAULT_SOURCE_HINT,
            probe_stride: HUGE_PAGE_SIZE,
            fill_byte: DEFAULT_FILL_BYTE,
            wait: WaitStrategy::Spin,
        }
    }
}

impl ReproConfig {
    /// Configuration from the three positional CLI arguments
    pub fn new(coalesce: bool, workers: usize, iterations: usize) -> Self {
        Self {
            coalesce,
            workers,
            iterations,
            ..Default::default()
        }
    }

    pub fn with_region_len(mut self, len: usize) -> Self {
        self.region_len = len;
        self
    }

    pub fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_source_hint(mut self, hint: usize) -> Self {
        self.source_hint = hint;
        self
    }

    /// Number of pages in each region
    pub fn pages(&self) -> usize {
        self.region_len / PAGE_SIZE
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.region_len == 0 {
            return Err(ReproError::Config("region length must be > 0".into()));
        }
        if !is_aligned(self.region_len, PAGE_SIZE) {
            return Err(ReproError::Config(format!(
                "region length {} is not a multiple of the {} byte page size",
                self.region_len, PAGE_SIZE
            )));
        }
        if !is_aligned(self.source_hint, PAGE_SIZE) {
            return Err(ReproError::Config(format!(
                "source hint {:#x} is not page aligned",
                self.source_hint
            )));
        }
        if self.source_hint.checked_add(self.region_len).is_none() {
            return Err(ReproError::Config(format!(
                "source hint {:#x} leaves no room for a {:#x} byte region",
                self.source_hint, self.region_len
            )));
        }
        if self.probe_stride == 0 || !is_aligned(self.probe_stride, PAGE_SIZE) {
            return Err(ReproError::Config(format!(
                "probe stride {:#x} must be a non-zero multiple of the page size",
                self.probe_stride
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_config_default() {
        let config = ReproConfig::default();
        assert!(!config.coalesce);
        assert_eq!(config.region_len, 4 * 1024 * 1024);
        assert_eq!(config.pages(), 1024);
        assert_eq!(config.source_hint, 0x2340_0000);
        assert_eq!(config.probe_stride, HUGE_PAGE_SIZE);
        assert_eq!(config.fill_byte, b'a');
        assert_eq!(config.wait, WaitStrategy::Spin);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_new() {
        let config = ReproConfig::new(true, 4, 10);
        assert!(config.coalesce);
        assert_eq!(config.workers, 4);
        assert_eq!(config.iterations, 10);
    }

    #[test]
    fn test_validate_zero_len() {
        let config = ReproConfig::default().with_region_len(0);
        assert!(matches!(config.validate(), Err(ReproError::Config(_))));
    }

    #[test]
    fn test_validate_unaligned_len() {
        let config = ReproConfig::default().with_region_len(PAGE_SIZE + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_unaligned_hint() {
        let config = ReproConfig::default().with_source_hint(0x2340_0010);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_hint_past_address_space_end() {
        let hint = usize::MAX - 2 * PAGE_SIZE + 1;
        let config = ReproConfig::default()
            .with_region_len(4 * PAGE_SIZE)
            .with_source_hint(hint);
        assert!(matches!(config.validate(), Err(ReproError::Config(_))));
        assert!(config.with_region_len(PAGE_SIZE).validate().is_ok());
    }

    #[test]
    fn test_validate_zero_stride() {
        let mut config = ReproConfig::default();
        config.probe_stride = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wait_until_spin() {
        let calls = AtomicUsize::new(0);
        WaitStrategy::Spin.wait_until(|| calls.fetch_add(1, Ordering::SeqCst) >= 5);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_wait_until_yield() {
        let calls = AtomicUsize::new(0);
        WaitStrategy::Yield { spin_cycles: 2 }
            .wait_until(|| calls.fetch_add(1, Ordering::SeqCst) >= 10);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }
}
