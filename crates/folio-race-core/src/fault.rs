//! Reactive page resolution
//!
//! A worker touching an unresolved destination page lands here, on its own
//! thread. The handler relocates the page at the same offset and returns so
//! the access can be retried. No locks, no logging: with the real kernel this
//! runs inside a SIGBUS handler.

use crate::error::{ReproError, Result};
use crate::mover::PageMover;
use crate::shim::{FaultSink, KernelShim};
use std::sync::Arc;

/// [`FaultSink`] that resolves missing pages through a [`PageMover`]
#[derive(Debug)]
pub struct FaultHandler {
    mover: PageMover,
}

impl FaultHandler {
    pub fn new(mover: PageMover) -> Self {
        Self { mover }
    }

    /// Route missing-page notifications from `kernel` to a new handler
    pub fn install(kernel: &dyn KernelShim, mover: PageMover) -> Result<Arc<Self>> {
        let handler = Arc::new(Self::new(mover));
        kernel
            .install_fault_sink(handler.clone())
            .map_err(ReproError::FaultHandler)?;
        Ok(handler)
    }

    /// Resolve the page containing `addr`
    pub fn handle(&self, addr: usize) -> Result<()> {
        let offset = self.mover.destination().page_offset_of(addr)?;
        self.mover.stats().record_fault();
        self.mover.relocate(offset, offset)?;
        Ok(())
    }
}

impl FaultSink for FaultHandler {
    fn on_fault(&self, addr: usize) -> Result<()> {
        self.handle(addr)
    }
}
