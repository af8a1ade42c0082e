//! Simulated kernel memory service
//!
//! Models just enough of the Linux mm and userfaultfd behaviour for the
//! engine to run without `UFFD_FEATURE_MOVE`:
//!
//! - page-granular anonymous memory, demand-zero on first touch
//! - missing-page notification for registered ranges, delivered
//!   synchronously on the touching thread (the SIGBUS model)
//! - `UFFDIO_MOVE` semantics: EEXIST on a present destination, ENOENT on a
//!   missing source, ownership transferred rather than copied
//! - `mremap(MREMAP_DONTUNMAP)`: pages move to the target, the old range
//!   stays mapped and registered, the new range is not registered
//!
//! Fault injection hooks cover address collisions, busy and failing moves,
//! pages that never resolve, declined collapse and corrupted contents.

use crate::error::ReproError;
use crate::shim::{Advice, FaultSink, KernelShim};
use crate::sys::*;
use nix::libc;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// First address handed out by `map_anonymous`
const SIM_MMAP_BASE: usize = 0x7f00_0000_0000;

#[derive(Debug, Clone, Copy)]
struct Mapping {
    len: usize,
    registered: bool,
    huge: Option<bool>,
}

#[derive(Default)]
struct SimState {
    mappings: BTreeMap<usize, Mapping>,
    pages: FxHashMap<usize, Box<[u8]>>,
    reserved: Vec<(usize, usize)>,
    not_found: FxHashSet<usize>,
    fatal: FxHashMap<usize, i32>,
    advice: Vec<(usize, Advice)>,
    next_anon: usize,
}

impl SimState {
    fn mapping_at(&self, addr: usize) -> Option<(usize, Mapping)> {
        self.mappings
            .range(..=addr)
            .next_back()
            .filter(|(base, m)| addr < **base + m.len)
            .map(|(base, m)| (*base, *m))
    }

    fn overlaps(&self, addr: usize, len: usize) -> bool {
        let end = addr.saturating_add(len);
        self.mappings
            .iter()
            .map(|(base, m)| (*base, m.len))
            .chain(self.reserved.iter().copied())
            .any(|(base, l)| addr < base.saturating_add(l) && base < end)
    }

    fn remove_pages(&mut self, addr: usize, len: usize) {
        self.pages.retain(|page, _| *page < addr || *page >= addr + len);
    }
}

/// In-process stand-in for the kernel memory service
pub struct SimKernel {
    page_size: usize,
    features: u64,
    negotiated: AtomicBool,
    state: Mutex<SimState>,
    sink: OnceLock<Arc<dyn FaultSink>>,
    busy_moves: AtomicUsize,
    decline_collapse: AtomicBool,
    moves: AtomicU64,
    faults: AtomicU64,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::with_features(UFFD_FEATURE_SIGBUS | UFFD_FEATURE_THREAD_ID | UFFD_FEATURE_MOVE)
    }

    /// Simulate a kernel advertising only `features`
    pub fn with_features(features: u64) -> Self {
        Self {
            page_size: PAGE_SIZE,
            features,
            negotiated: AtomicBool::new(false),
            state: Mutex::new(SimState {
                next_anon: SIM_MMAP_BASE,
                ..Default::default()
            }),
            sink: OnceLock::new(),
            busy_moves: AtomicUsize::new(0),
            decline_collapse: AtomicBool::new(false),
            moves: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    fn state(&self) -> io::Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("simulated kernel state poisoned"))
    }

    fn page_of(&self, addr: usize) -> usize {
        align_down(addr, self.page_size)
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Occupy `[addr, addr + len)` so fixed mappings there collide
    pub fn reserve(&self, addr: usize, len: usize) {
        if let Ok(mut state) = self.state() {
            state.reserved.push((addr, len));
        }
    }

    /// Make every move into the page containing `dst` report ENOENT
    pub fn inject_not_found(&self, dst: usize) {
        let page = self.page_of(dst);
        if let Ok(mut state) = self.state() {
            state.not_found.insert(page);
        }
    }

    /// Make every move into the page containing `dst` fail with `errno`
    pub fn inject_fatal(&self, dst: usize, errno: i32) {
        let page = self.page_of(dst);
        if let Ok(mut state) = self.state() {
            state.fatal.insert(page, errno);
        }
    }

    /// Make the next `count` moves report EAGAIN
    pub fn inject_busy(&self, count: usize) {
        self.busy_moves.store(count, Ordering::SeqCst);
    }

    /// Make MADV_COLLAPSE fail with EAGAIN
    pub fn set_decline_collapse(&self, decline: bool) {
        self.decline_collapse.store(decline, Ordering::SeqCst);
    }

    /// Overwrite a byte without going through fault delivery
    pub fn corrupt(&self, addr: usize, value: u8) {
        let page = self.page_of(addr);
        let page_size = self.page_size;
        if let Ok(mut state) = self.state() {
            let data = state
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
            data[addr - page] = value;
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// True if the page containing `addr` is present
    pub fn is_resolved(&self, addr: usize) -> bool {
        let page = self.page_of(addr);
        self.state().map(|s| s.pages.contains_key(&page)).unwrap_or(false)
    }

    /// Byte at `addr` if its page is present, without triggering a fault
    pub fn peek(&self, addr: usize) -> Option<u8> {
        let page = self.page_of(addr);
        let state = self.state().ok()?;
        let value = state.pages.get(&page).map(|data| data[addr - page]);
        value
    }

    /// True if `addr` lies in a range registered for missing-page notification
    pub fn is_registered(&self, addr: usize) -> bool {
        self.state()
            .ok()
            .and_then(|s| s.mapping_at(addr))
            .map(|(_, m)| m.registered)
            .unwrap_or(false)
    }

    /// Huge-page policy last applied to the mapping containing `addr`
    pub fn huge_policy(&self, addr: usize) -> Option<bool> {
        self.state().ok()?.mapping_at(addr)?.1.huge
    }

    /// Every madvise call in order
    pub fn advice_log(&self) -> Vec<(usize, Advice)> {
        self.state().map(|s| s.advice.clone()).unwrap_or_default()
    }

    /// Successful page moves
    pub fn move_count(&self) -> u64 {
        self.moves.load(Ordering::SeqCst)
    }

    /// Missing-page notifications delivered
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::SeqCst)
    }

    /// Deliver a missing-page notification for `addr` on this thread
    fn deliver_fault(&self, addr: usize) -> io::Result<()> {
        let sink = self
            .sink
            .get()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
        self.faults.fetch_add(1, Ordering::SeqCst);
        sink.on_fault(addr).map_err(|e: ReproError| io::Error::other(e))
    }

    /// Resolve the page containing `addr` for access, delivering a fault if it
    /// is missing in a registered range. A page the handler fails to resolve is
    /// reported as an error instead of refaulting forever.
    fn fault_in(&self, addr: usize) -> io::Result<()> {
        let page = self.page_of(addr);
        let mut delivered = false;
        loop {
            {
                let mut state = self.state()?;
                let (_, mapping) = state
                    .mapping_at(addr)
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
                if state.pages.contains_key(&page) {
                    return Ok(());
                }
                if !mapping.registered {
                    state
                        .pages
                        .insert(page, vec![0u8; self.page_size].into_boxed_slice());
                    return Ok(());
                }
                if delivered {
                    return Err(io::Error::other(format!(
                        "missing page {page:#x} not resolved by fault handler"
                    )));
                }
            }
            self.deliver_fault(addr)?;
            delivered = true;
        }
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelShim for SimKernel {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn negotiate(&self, features: u64) -> io::Result<u64> {
        if self.negotiated.swap(true, Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if features & !self.features != 0 {
            self.negotiated.store(false, Ordering::SeqCst);
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(self.features)
    }

    fn map_fixed_noreplace(&self, addr: usize, len: usize) -> io::Result<usize> {
        if len == 0 || !is_aligned(addr, self.page_size) || !is_aligned(len, self.page_size) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if addr.checked_add(len).is_none() {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let mut state = self.state()?;
        if state.overlaps(addr, len) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        state.mappings.insert(
            addr,
            Mapping {
                len,
                registered: false,
                huge: None,
            },
        );
        Ok(addr)
    }

    fn map_anonymous(&self, len: usize) -> io::Result<usize> {
        if len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let enomem = || io::Error::from_raw_os_error(libc::ENOMEM);
        let rounded = len.checked_add(self.page_size - 1).ok_or_else(enomem)?;
        let len = align_down(rounded, self.page_size);
        let step = len.checked_add(self.page_size).ok_or_else(enomem)?;
        let mut state = self.state()?;
        let mut addr = state.next_anon;
        while state.overlaps(addr, len) {
            addr = addr.checked_add(step).ok_or_else(enomem)?;
        }
        state.next_anon = addr.checked_add(step).ok_or_else(enomem)?;
        state.mappings.insert(
            addr,
            Mapping {
                len,
                registered: false,
                huge: None,
            },
        );
        Ok(addr)
    }

    fn unmap(&self, addr: usize, len: usize) -> io::Result<()> {
        let mut state = self.state()?;
        match state.mappings.get(&addr) {
            Some(m) if m.len == len => {}
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        state.mappings.remove(&addr);
        state.remove_pages(addr, len);
        Ok(())
    }

    fn advise(&self, addr: usize, len: usize, advice: Advice) -> io::Result<()> {
        let mut state = self.state()?;
        let (base, mapping) = state
            .mapping_at(addr)
            .filter(|(base, m)| addr + len <= base + m.len)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        match advice {
            Advice::HugePage | Advice::NoHugePage => {
                if let Some(m) = state.mappings.get_mut(&base) {
                    m.huge = Some(advice == Advice::HugePage);
                }
            }
            Advice::Collapse => {
                if self.decline_collapse.load(Ordering::SeqCst) {
                    return Err(io::Error::from_raw_os_error(libc::EAGAIN));
                }
                if mapping.huge == Some(false) {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
            }
        }
        state.advice.push((addr, advice));
        Ok(())
    }

    fn register_missing(&self, addr: usize, len: usize) -> io::Result<()> {
        if !self.negotiated.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let mut state = self.state()?;
        match state.mappings.get_mut(&addr) {
            Some(m) if m.len == len => {
                m.registered = true;
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn move_page(&self, dst: usize, src: usize, len: usize) -> io::Result<()> {
        if !self.negotiated.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if len != self.page_size
            || !is_aligned(dst, self.page_size)
            || !is_aligned(src, self.page_size)
        {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let busy = self
            .busy_moves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if busy.is_ok() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }

        let mut state = self.state()?;
        if let Some(errno) = state.fatal.get(&dst) {
            return Err(io::Error::from_raw_os_error(*errno));
        }
        if state.not_found.contains(&dst) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        match state.mapping_at(dst) {
            Some((_, m)) if m.registered => {}
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        if state.mapping_at(src).is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if state.pages.contains_key(&dst) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        let data = state
            .pages
            .remove(&src)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        state.pages.insert(dst, data);
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remap_dontunmap(&self, from: usize, len: usize, to: usize) -> io::Result<()> {
        let mut state = self.state()?;
        let source = match state.mappings.get(&from) {
            Some(m) if m.len == len => *m,
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };

        // MREMAP_FIXED unmaps whatever lived at the target
        let replaced: Vec<usize> = state
            .mappings
            .iter()
            .filter(|(base, m)| to < **base + m.len && **base < to + len)
            .map(|(base, _)| *base)
            .collect();
        for base in replaced {
            state.mappings.remove(&base);
        }
        state.remove_pages(to, len);

        let moved: Vec<usize> = state
            .pages
            .keys()
            .filter(|page| **page >= from && **page < from + len)
            .copied()
            .collect();
        for page in moved {
            if let Some(data) = state.pages.remove(&page) {
                state.pages.insert(to + (page - from), data);
            }
        }

        state.mappings.insert(
            to,
            Mapping {
                len,
                registered: false,
                huge: source.huge,
            },
        );
        Ok(())
    }

    fn install_fault_sink(&self, sink: Arc<dyn FaultSink>) -> io::Result<()> {
        self.sink
            .set(sink)
            .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "fault sink already installed"))
    }

    fn read_byte(&self, addr: usize) -> io::Result<u8> {
        self.fault_in(addr)?;
        self.peek(addr)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }

    fn write_byte(&self, addr: usize, value: u8) -> io::Result<()> {
        self.fault_in(addr)?;
        let page = self.page_of(addr);
        let mut state = self.state()?;
        let data = state
            .pages
            .get_mut(&page)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
        data[addr - page] = value;
        Ok(())
    }
}
