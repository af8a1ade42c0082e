//! Error types for folio-race-core.

use nix::libc;
use thiserror::Error;

/// Errors raised while setting up or running the reproducer.
///
/// Every variant is fatal to a run. The idempotent outcomes of the move
/// primitive (`EEXIST`, `ENOENT`) and its transient busy state (`EAGAIN`)
/// never surface here; [`crate::mover::PageMover`] absorbs them.
#[derive(Debug, Error)]
pub enum ReproError {
    /// Configuration rejected before touching the kernel.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failed to create the userfaultfd object or complete the API handshake.
    #[error("userfaultfd handshake failed: {0}")]
    Handshake(std::io::Error),

    /// The kernel did not report a required userfaultfd feature.
    #[error("required capability {feature} not available (kernel features {available:#x})")]
    MissingCapability {
        /// Name of the missing feature bit.
        feature: &'static str,
        /// Feature mask the kernel reported.
        available: u64,
    },

    /// A mapping call failed.
    #[error("{what} mmap at {addr:#x} ({len} bytes) failed: {source}")]
    Map {
        what: &'static str,
        addr: usize,
        len: usize,
        source: std::io::Error,
    },

    /// The source probe ran off the end of the address space.
    #[error("no free address for source region after probing from {start:#x}")]
    AddressSpaceExhausted { start: usize },

    /// madvise failed for a required policy.
    #[error("madvise({advice}) on {addr:#x} failed: {source}")]
    Advise {
        advice: &'static str,
        addr: usize,
        source: std::io::Error,
    },

    /// Registering the destination for missing-page notification failed.
    #[error("UFFDIO_REGISTER on {addr:#x} ({len} bytes) failed: {source}")]
    Register {
        addr: usize,
        len: usize,
        source: std::io::Error,
    },

    /// Installing the fault notification handler failed.
    #[error("failed to install fault handler: {0}")]
    FaultHandler(std::io::Error),

    /// The move primitive failed for a reason other than the idempotent or busy cases.
    #[error("UFFDIO_MOVE {src:#x} -> {dst:#x} failed: {source}")]
    Relocate {
        dst: usize,
        src: usize,
        source: std::io::Error,
    },

    /// An offset or address fell outside the destination region.
    #[error("address {addr:#x} outside region {base:#x}+{len:#x}")]
    OutOfRange { addr: usize, base: usize, len: usize },

    /// The role-swap remap failed.
    #[error("mremap {from:#x} -> {to:#x} failed: {source}")]
    Remap {
        from: usize,
        to: usize,
        source: std::io::Error,
    },

    /// A worker read a byte that does not match the fill pattern.
    #[error("corruption at {addr:#x}: expected {expected:#04x}, found {found:#04x}")]
    Corruption { addr: usize, expected: u8, found: u8 },

    /// A worker could not read the destination region.
    #[error("worker read at {addr:#x} failed: {source}")]
    Read { addr: usize, source: std::io::Error },

    /// The completion counter did not match the worker count.
    #[error("barrier mismatch: {completed} completions for {workers} workers")]
    Barrier { completed: usize, workers: usize },

    /// Spawning a worker thread failed.
    #[error("failed to spawn worker {index}: {source}")]
    ThreadSpawn { index: usize, source: std::io::Error },

    /// A worker thread panicked.
    #[error("worker {index} panicked")]
    ThreadJoin { index: usize },
}

impl ReproError {
    /// Returns true if `errno` from the move primitive means the page is
    /// already resolved or there was nothing to move.
    #[inline]
    pub fn is_idempotent_errno(errno: i32) -> bool {
        matches!(errno, libc::EEXIST | libc::ENOENT)
    }

    /// Returns true if `errno` from the move primitive is transient.
    #[inline]
    pub fn is_retriable_errno(errno: i32) -> bool {
        errno == libc::EAGAIN
    }

    /// Returns true for errors that indicate the race corrupted data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Convert to negative errno for POSIX compatibility.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Handshake(e) | Self::FaultHandler(e) => -e.raw_os_error().unwrap_or(libc::ENOSYS),
            Self::Map { source, .. } => -source.raw_os_error().unwrap_or(libc::ENOMEM),
            Self::Advise { source, .. }
            | Self::Register { source, .. }
            | Self::Relocate { source, .. }
            | Self::Remap { source, .. }
            | Self::Read { source, .. } => -source.raw_os_error().unwrap_or(libc::EINVAL),
            Self::ThreadSpawn { source, .. } => -source.raw_os_error().unwrap_or(libc::EAGAIN),
            Self::MissingCapability { .. } => -libc::ENOSYS,
            Self::AddressSpaceExhausted { .. } => -libc::ENOMEM,
            Self::OutOfRange { .. } => -libc::EFAULT,
            Self::Corruption { .. } => -libc::EIO,
            Self::Config(_) | Self::Barrier { .. } | Self::ThreadJoin { .. } => -libc::EINVAL,
        }
    }
}

/// Result type for reproducer operations.
pub type Result<T> = std::result::Result<T, ReproError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_idempotent_errno() {
        assert!(ReproError::is_idempotent_errno(libc::EEXIST));
        assert!(ReproError::is_idempotent_errno(libc::ENOENT));
        assert!(!ReproError::is_idempotent_errno(libc::EAGAIN));
        assert!(!ReproError::is_idempotent_errno(libc::EINVAL));
    }

    #[test]
    fn test_retriable_errno() {
        assert!(ReproError::is_retriable_errno(libc::EAGAIN));
        assert!(!ReproError::is_retriable_errno(libc::EBUSY));
        assert!(!ReproError::is_retriable_errno(libc::EEXIST));
    }

    #[test]
    fn test_display_relocate() {
        let err = ReproError::Relocate {
            dst: 0x7000,
            src: 0x2340_0000,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        let msg = err.to_string();
        assert!(msg.contains("UFFDIO_MOVE"));
        assert!(msg.contains("0x23400000"));
        assert!(msg.contains("0x7000"));
    }

    #[test]
    fn test_display_corruption() {
        let err = ReproError::Corruption {
            addr: 0x1000,
            expected: b'a',
            found: 0,
        };
        assert!(err.is_corruption());
        assert!(err.to_string().contains("expected 0x61"));
        assert!(err.to_string().contains("found 0x00"));
    }

    #[test]
    fn test_display_missing_capability() {
        let err = ReproError::MissingCapability {
            feature: "UFFD_FEATURE_MOVE",
            available: 0x80,
        };
        assert!(err.to_string().contains("UFFD_FEATURE_MOVE"));
        assert!(err.to_string().contains("0x80"));
    }

    #[test]
    fn test_to_errno() {
        let err = ReproError::Remap {
            from: 0,
            to: 0,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert_eq!(err.to_errno(), -libc::ENOMEM);
        assert_eq!(
            ReproError::Corruption { addr: 0, expected: 1, found: 2 }.to_errno(),
            -libc::EIO
        );
        assert_eq!(
            ReproError::Handshake(io::Error::other("no errno")).to_errno(),
            -libc::ENOSYS
        );
    }
}
