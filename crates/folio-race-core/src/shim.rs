//! Kernel interaction shims for testability
//!
//! This module defines the trait that abstracts the kernel memory-management
//! and fault-notification service, so the engine can run against the real
//! kernel or against [`crate::sim::SimKernel`].
//!
//! Architecture:
//! - `KernelShim`: Trait for kernel operations (userfaultfd, mmap, madvise, mremap)
//! - `FaultSink`: Callback the shim invokes when a reader touches a missing page
//! - `RealKernel`: Production implementation using actual syscalls

use crate::error::ReproError;
use crate::sys::*;
use nix::libc;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, OnceLock};

// ============================================================================
// Kernel Shim Trait
// ============================================================================

/// madvise hints the reproducer issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    /// MADV_HUGEPAGE
    HugePage,
    /// MADV_NOHUGEPAGE
    NoHugePage,
    /// MADV_COLLAPSE
    Collapse,
}

impl Advice {
    pub fn name(self) -> &'static str {
        match self {
            Advice::HugePage => "MADV_HUGEPAGE",
            Advice::NoHugePage => "MADV_NOHUGEPAGE",
            Advice::Collapse => "MADV_COLLAPSE",
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Advice::HugePage => MADV_HUGEPAGE,
            Advice::NoHugePage => MADV_NOHUGEPAGE,
            Advice::Collapse => MADV_COLLAPSE,
        }
    }
}

/// Receiver for missing-page notifications.
///
/// Called on the thread that touched the page, possibly from signal context.
/// Implementations must not take locks or allocate on the success path.
pub trait FaultSink: Send + Sync {
    fn on_fault(&self, addr: usize) -> Result<(), ReproError>;
}

/// Trait abstracting the kernel memory-management service
pub trait KernelShim: Send + Sync {
    /// Base page size
    fn page_size(&self) -> usize;

    /// Create the userfaultfd object and request `features`.
    /// Returns the feature mask the kernel supports.
    fn negotiate(&self, features: u64) -> io::Result<u64>;

    /// Map anonymous memory at exactly `addr`, failing with EEXIST if occupied
    fn map_fixed_noreplace(&self, addr: usize, len: usize) -> io::Result<usize>;

    /// Map demand-zero anonymous memory anywhere
    fn map_anonymous(&self, len: usize) -> io::Result<usize>;

    /// Unmap memory
    fn unmap(&self, addr: usize, len: usize) -> io::Result<()>;

    /// Apply an madvise hint
    fn advise(&self, addr: usize, len: usize, advice: Advice) -> io::Result<()>;

    /// Register a range for missing-page notification
    fn register_missing(&self, addr: usize, len: usize) -> io::Result<()>;

    /// Move `len` bytes of pages from `src` to `dst`.
    /// Errors carry the raw errno (EEXIST, ENOENT, EAGAIN, ...).
    fn move_page(&self, dst: usize, src: usize, len: usize) -> io::Result<()>;

    /// Move the pages of `from` onto `to`, leaving `from` mapped and empty
    fn remap_dontunmap(&self, from: usize, len: usize, to: usize) -> io::Result<()>;

    /// Route missing-page notifications to `sink`
    fn install_fault_sink(&self, sink: Arc<dyn FaultSink>) -> io::Result<()>;

    /// Load one byte, faulting it in if needed
    fn read_byte(&self, addr: usize) -> io::Result<u8>;

    /// Store one byte
    fn write_byte(&self, addr: usize, value: u8) -> io::Result<()>;
}

// ============================================================================
// Real Kernel Shim Implementation
// ============================================================================

/// Sink receiving SIGBUS. Signal dispositions are process-wide, so is this.
static FAULT_SINK: OnceLock<Arc<dyn FaultSink>> = OnceLock::new();

/// Report `msg` on stderr and exit without unwinding or running atexit
/// handlers. Async-signal-safe.
fn die_in_handler(msg: &[u8]) -> ! {
    // SAFETY: write(2) and _exit(2) are async-signal-safe
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::_exit(1)
    }
}

extern "C" fn on_sigbus(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: the kernel passes a valid siginfo_t for SA_SIGINFO handlers
    let addr = unsafe { (*info).si_addr() } as usize;
    let Some(sink) = FAULT_SINK.get() else {
        die_in_handler(b"SIGBUS with no fault handler installed\n");
    };
    if sink.on_fault(addr).is_err() {
        die_in_handler(b"SIGBUS fault handler failed to resolve page\n");
    }
}

/// Production implementation using actual kernel syscalls
pub struct RealKernel {
    uffd: OnceLock<OwnedFd>,
    page_size: usize,
}

impl RealKernel {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            uffd: OnceLock::new(),
            page_size: if page_size > 0 { page_size as usize } else { PAGE_SIZE },
        }
    }

    fn uffd(&self) -> io::Result<RawFd> {
        self.uffd
            .get()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl Default for RealKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelShim for RealKernel {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn negotiate(&self, features: u64) -> io::Result<u64> {
        if self.uffd.get().is_some() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        // SAFETY: raw syscall with integer flags
        let fd = unsafe {
            libc::syscall(
                libc::SYS_userfaultfd,
                libc::O_CLOEXEC | UFFD_USER_MODE_ONLY,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by userfaultfd(2) and is owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

        let mut api = UffdioApi {
            api: UFFD_API,
            features,
            ioctls: 0,
        };
        // SAFETY: api is a valid uffdio_api for the duration of the call
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), UFFDIO_API as _, &mut api) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::debug!(
            fd = fd.as_raw_fd(),
            features = format_args!("{:#x}", api.features),
            ioctls = format_args!("{:#x}", api.ioctls),
            "userfaultfd API negotiated"
        );

        let supported = api.features;
        self.uffd
            .set(fd)
            .map_err(|_| io::Error::from_raw_os_error(libc::EBUSY))?;
        Ok(supported)
    }

    fn map_fixed_noreplace(&self, addr: usize, len: usize) -> io::Result<usize> {
        // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // Kernels older than 4.17 ignore the flag and treat addr as a hint
        if ptr as usize != addr {
            // SAFETY: we own the mapping just created
            unsafe { libc::munmap(ptr, len) };
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        Ok(ptr as usize)
    }

    fn map_anonymous(&self, len: usize) -> io::Result<usize> {
        // SAFETY: mmap with valid parameters
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as usize)
    }

    fn unmap(&self, addr: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller owns the mapping
        let result = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn advise(&self, addr: usize, len: usize, advice: Advice) -> io::Result<()> {
        // SAFETY: madvise on a range we mapped
        let result = unsafe { libc::madvise(addr as *mut libc::c_void, len, advice.raw()) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn register_missing(&self, addr: usize, len: usize) -> io::Result<()> {
        let mut reg = UffdioRegister {
            range: UffdioRange {
                start: addr as u64,
                len: len as u64,
            },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        // SAFETY: reg is a valid uffdio_register for the duration of the call
        let ret = unsafe { libc::ioctl(self.uffd()?, UFFDIO_REGISTER as _, &mut reg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn move_page(&self, dst: usize, src: usize, len: usize) -> io::Result<()> {
        let mut mv = UffdioMove {
            dst: dst as u64,
            src: src as u64,
            len: len as u64,
            mode: 0,
            move_: 0,
        };
        // SAFETY: mv is a valid uffdio_move; the kernel validates both ranges
        let ret = unsafe { libc::ioctl(self.uffd()?, UFFDIO_MOVE as _, &mut mv) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn remap_dontunmap(&self, from: usize, len: usize, to: usize) -> io::Result<()> {
        // SAFETY: both ranges are mappings we own; MREMAP_FIXED replaces `to`
        let ptr = unsafe {
            libc::mremap(
                from as *mut libc::c_void,
                len,
                len,
                MREMAP_MAYMOVE | MREMAP_FIXED | MREMAP_DONTUNMAP,
                to as *mut libc::c_void,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn install_fault_sink(&self, sink: Arc<dyn FaultSink>) -> io::Result<()> {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        FAULT_SINK
            .set(sink)
            .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "fault sink already installed"))?;

        let action = SigAction::new(
            SigHandler::SigAction(on_sigbus),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: on_sigbus only reads the once-cell and calls the sink
        unsafe { sigaction(Signal::SIGBUS, &action) }.map_err(io::Error::from)?;
        Ok(())
    }

    fn read_byte(&self, addr: usize) -> io::Result<u8> {
        // SAFETY: addr lies in a region we mapped; a missing page raises
        // SIGBUS, which resolves it before the load is retried
        Ok(unsafe { std::ptr::read_volatile(addr as *const u8) })
    }

    fn write_byte(&self, addr: usize, value: u8) -> io::Result<()> {
        // SAFETY: addr lies in a writable region we mapped
        unsafe { std::ptr::write_volatile(addr as *mut u8, value) };
        Ok(())
    }
}
