//! Raw userfaultfd and memory-management interface definitions
//!
//! Direct port from Linux include/uapi/linux/userfaultfd.h and the mman
//! constants that older libc releases do not export yet.
//!
//! IMPORTANT: UFFDIO_MOVE and UFFD_FEATURE_MOVE require Linux 6.8+.
//! MADV_COLLAPSE requires Linux 6.1+.

use std::mem::size_of;

// ============================================================================
// ioctl encoding helpers
// ============================================================================

const UFFDIO: u32 = 0xAA;

const fn _iowr(ty: u32, nr: u32, sz: usize) -> u32 {
    (3 << 30) | ((sz as u32) << 16) | (ty << 8) | nr
}

// ============================================================================
// ioctl opcodes
// ============================================================================

const _UFFDIO_REGISTER: u32 = 0x00;
const _UFFDIO_MOVE: u32 = 0x05;
const _UFFDIO_API: u32 = 0x3F;

pub const UFFDIO_API: u32 = _iowr(UFFDIO, _UFFDIO_API, size_of::<UffdioApi>());
pub const UFFDIO_REGISTER: u32 = _iowr(UFFDIO, _UFFDIO_REGISTER, size_of::<UffdioRegister>());
pub const UFFDIO_MOVE: u32 = _iowr(UFFDIO, _UFFDIO_MOVE, size_of::<UffdioMove>());

// ============================================================================
// API handshake
// ============================================================================

pub const UFFD_API: u64 = 0xAA;

/// userfaultfd(2) flag: only handle faults from user mode
pub const UFFD_USER_MODE_ONLY: i32 = 1;

pub const UFFD_FEATURE_SIGBUS: u64 = 1 << 7;
pub const UFFD_FEATURE_THREAD_ID: u64 = 1 << 8;
pub const UFFD_FEATURE_MOVE: u64 = 1 << 16;

pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

// ============================================================================
// mm constants
// ============================================================================

pub const MADV_HUGEPAGE: i32 = 14;
pub const MADV_NOHUGEPAGE: i32 = 15;
pub const MADV_COLLAPSE: i32 = 25;

pub const MREMAP_MAYMOVE: i32 = 1;
pub const MREMAP_FIXED: i32 = 2;
pub const MREMAP_DONTUNMAP: i32 = 4;

pub const MAP_FIXED_NOREPLACE: i32 = 0x10_0000;

/// Base page size the reproducer is written against
pub const PAGE_SIZE: usize = 4096;
/// PMD-sized transparent huge page
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

// ============================================================================
// Kernel Structures
// ============================================================================

/// struct uffdio_api (24 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UffdioApi {
    pub api: u64,
    pub features: u64,
    pub ioctls: u64,
}

/// struct uffdio_range (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UffdioRange {
    pub start: u64,
    pub len: u64,
}

/// struct uffdio_register (32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UffdioRegister {
    pub range: UffdioRange,
    pub mode: u64,
    pub ioctls: u64,
}

/// struct uffdio_move (40 bytes)
///
/// `move_` is written back by the kernel with the number of bytes moved,
/// or a negative errno.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UffdioMove {
    pub dst: u64,
    pub src: u64,
    pub len: u64,
    pub mode: u64,
    pub move_: i64,
}

// ============================================================================
// Helper functions
// ============================================================================

/// Round `value` down to a multiple of `align` (power of two)
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
