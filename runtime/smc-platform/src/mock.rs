//! Mock secure monitor and host-backed physical memory
//!
//! Physical addresses are identity-mapped onto host allocations. A simulated
//! secure side installed with [`MockSecureMonitor::set_pa_program`] therefore
//! reaches the shared buffers through the same physical addresses a real
//! secure world would receive.
//!
//! Used ONLY for host development and tests.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::hal::{self, EntryFlags, RpcEntry, SecureMonitor, MAX_HAL_ARGS};
use crate::memory::{PageFrame, PhysMemory};
use crate::{PhysAddr, PlatformError, Result, PAGE_SIZE};

/// Value returned by the mock for `API_HAL_KM_CRC_READ`
pub const MOCK_SECURE_CRC: u32 = 0x5EC0_C0DE;

const HEAP_ALIGN: usize = 16;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Pages,
    Heap,
    User,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    layout: Layout,
    kind: RegionKind,
}

/// Host memory with allocation tracking and fault injection
#[derive(Default)]
pub struct MockMemory {
    regions: Mutex<BTreeMap<usize, Region>>,
    pins: Mutex<BTreeMap<PhysAddr, usize>>,
    fail_after: Mutex<Option<usize>>,
    fragmented: AtomicBool,
    dirty_unpins: AtomicUsize,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more allocations succeed, then fail every following one
    pub fn fail_allocations_after(&self, n: usize) {
        *lock(&self.fail_after) = Some(n);
    }

    /// Stop injecting allocation failures
    pub fn clear_allocation_failures(&self) {
        *lock(&self.fail_after) = None;
    }

    /// Report pinned user pages as physically scattered
    pub fn set_fragmented(&self, fragmented: bool) {
        self.fragmented.store(fragmented, Ordering::SeqCst);
    }

    /// Map a page-aligned "user" buffer that can later be pinned
    pub fn map_user_buffer(&self, len: usize) -> Result<usize> {
        self.allocate(len.max(1), PAGE_SIZE, RegionKind::User, false)
    }

    pub fn unmap_user_buffer(&self, vaddr: usize) {
        self.release(vaddr, RegionKind::User);
    }

    /// Page and heap blocks not yet freed (user buffers excluded)
    pub fn live_allocations(&self) -> usize {
        lock(&self.regions)
            .values()
            .filter(|r| r.kind != RegionKind::User)
            .count()
    }

    /// Pins currently held on user pages
    pub fn pinned_pages(&self) -> usize {
        lock(&self.pins).values().sum()
    }

    /// Pages released with the dirty flag set
    pub fn dirty_unpins(&self) -> usize {
        self.dirty_unpins.load(Ordering::SeqCst)
    }

    fn take_allocation_budget(&self) -> bool {
        let mut fail_after = lock(&self.fail_after);
        match fail_after.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    fn allocate(&self, size: usize, align: usize, kind: RegionKind, budgeted: bool) -> Result<usize> {
        if budgeted && !self.take_allocation_budget() {
            return Err(PlatformError::OutOfMemory { requested: size });
        }
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| PlatformError::OutOfMemory { requested: size })?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(PlatformError::OutOfMemory { requested: size });
        }
        let vaddr = ptr as usize;
        lock(&self.regions).insert(vaddr, Region { layout, kind });
        Ok(vaddr)
    }

    fn release(&self, vaddr: usize, kind: RegionKind) {
        let region = {
            let mut regions = lock(&self.regions);
            match regions.get(&vaddr) {
                Some(r) if r.kind == kind => regions.remove(&vaddr),
                _ => None,
            }
        };
        match region {
            // SAFETY: the region was allocated by `allocate` with this layout.
            Some(r) => unsafe { alloc::dealloc(vaddr as *mut u8, r.layout) },
            None => log::error!("mock: free of unknown {:?} block {:#x}", kind, vaddr),
        }
    }

    fn user_range_mapped(&self, vaddr: usize, len: usize) -> bool {
        let regions = lock(&self.regions);
        regions
            .range(..=vaddr)
            .next_back()
            .map(|(&base, r)| r.kind == RegionKind::User && vaddr + len <= base + r.layout.size())
            .unwrap_or(false)
    }
}

impl PhysMemory for MockMemory {
    fn alloc_pages(&self, order: u32) -> Result<usize> {
        if order > 10 {
            return Err(PlatformError::InvalidOrder(order));
        }
        self.allocate(PAGE_SIZE << order, PAGE_SIZE, RegionKind::Pages, true)
    }

    fn free_pages(&self, vaddr: usize, _order: u32) {
        self.release(vaddr, RegionKind::Pages);
    }

    fn alloc(&self, size: usize) -> Result<usize> {
        self.allocate(size, HEAP_ALIGN, RegionKind::Heap, true)
    }

    fn free(&self, vaddr: usize, _size: usize) {
        self.release(vaddr, RegionKind::Heap);
    }

    fn pin_user_pages(&self, vaddr: usize, count: usize, _write: bool) -> Result<Vec<PageFrame>> {
        let len = count * PAGE_SIZE;
        if !self.user_range_mapped(vaddr, len) {
            return Err(PlatformError::Unmapped { vaddr, len });
        }
        let stride = if self.fragmented.load(Ordering::SeqCst) {
            2 * PAGE_SIZE
        } else {
            PAGE_SIZE
        };
        let mut pins = lock(&self.pins);
        let frames = (0..count)
            .map(|i| {
                let phys = vaddr + i * stride;
                *pins.entry(phys).or_insert(0) += 1;
                PageFrame { phys, reserved: false }
            })
            .collect();
        Ok(frames)
    }

    fn unpin_page(&self, frame: PageFrame, dirty: bool) {
        if dirty && !frame.reserved {
            self.dirty_unpins.fetch_add(1, Ordering::SeqCst);
        }
        let mut pins = lock(&self.pins);
        if let Some(n) = pins.get_mut(&frame.phys) {
            *n -= 1;
            if *n == 0 {
                pins.remove(&frame.phys);
            }
        }
    }

    fn virt_to_phys(&self, vaddr: usize) -> PhysAddr {
        vaddr
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> usize {
        phys
    }
}

impl Drop for MockMemory {
    fn drop(&mut self) {
        let regions = std::mem::take(self.regions.get_mut().unwrap_or_else(|p| p.into_inner()));
        for (vaddr, r) in regions {
            // SAFETY: every tracked region was allocated with its layout.
            unsafe { alloc::dealloc(vaddr as *mut u8, r.layout) };
        }
    }
}

/// One bridge entry observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureCall {
    pub appl_id: u32,
    pub proc_id: u32,
    pub flags: EntryFlags,
    pub args: Vec<usize>,
}

/// Context handed to a PA program when `API_HAL_PA_LOAD` is issued
pub struct PaLoad<'a> {
    pub memory: &'a MockMemory,
    /// RPC entry installed by `API_HAL_SEC_RPC_INIT`, if any
    pub rpc: Option<RpcEntry>,
    /// Physical address of the PA info block
    pub pa_info: PhysAddr,
}

/// Secure-side behaviour run on the caller's thread for the PA load call
pub trait PaProgram: Send {
    fn run(&mut self, load: PaLoad<'_>) -> u32;
}

impl<F> PaProgram for F
where
    F: FnMut(PaLoad<'_>) -> u32 + Send,
{
    fn run(&mut self, load: PaLoad<'_>) -> u32 {
        self(load)
    }
}

/// Scriptable secure monitor recording every call
pub struct MockSecureMonitor {
    memory: Arc<MockMemory>,
    calls: Mutex<Vec<SecureCall>>,
    statuses: Mutex<BTreeMap<u32, u32>>,
    rpc_entry: Mutex<Option<RpcEntry>>,
    program: Mutex<Option<Box<dyn PaProgram>>>,
    full_flushes: AtomicUsize,
    range_flushes: Mutex<Vec<(usize, usize)>>,
}

impl MockSecureMonitor {
    pub fn new(memory: Arc<MockMemory>) -> Self {
        Self {
            memory,
            calls: Mutex::new(Vec::new()),
            statuses: Mutex::new(BTreeMap::new()),
            rpc_entry: Mutex::new(None),
            program: Mutex::new(None),
            full_flushes: AtomicUsize::new(0),
            range_flushes: Mutex::new(Vec::new()),
        }
    }

    /// Force the status returned for a HAL service
    pub fn set_status(&self, proc_id: u32, status: u32) {
        lock(&self.statuses).insert(proc_id, status);
    }

    /// Install the secure-side program run by `API_HAL_PA_LOAD`
    pub fn set_pa_program<P: PaProgram + 'static>(&self, program: P) {
        *lock(&self.program) = Some(Box::new(program));
    }

    pub fn calls(&self) -> Vec<SecureCall> {
        lock(&self.calls).clone()
    }

    /// Calls issued for one HAL service
    pub fn calls_to(&self, proc_id: u32) -> Vec<SecureCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.proc_id == proc_id)
            .cloned()
            .collect()
    }

    pub fn rpc_entry(&self) -> Option<RpcEntry> {
        *lock(&self.rpc_entry)
    }

    pub fn full_flushes(&self) -> usize {
        self.full_flushes.load(Ordering::SeqCst)
    }

    pub fn range_flushes(&self) -> Vec<(usize, usize)> {
        lock(&self.range_flushes).clone()
    }

    fn read_args(&self, args: PhysAddr) -> Vec<usize> {
        let base = self.memory.phys_to_virt(args) as *const usize;
        if base.is_null() {
            return Vec::new();
        }
        // SAFETY: the dispatcher hands over a live block of `1 + MAX_HAL_ARGS` words.
        unsafe {
            let n = (*base).min(MAX_HAL_ARGS);
            (1..=n).map(|i| *base.add(i)).collect()
        }
    }

    fn forced_status(&self, proc_id: u32) -> Option<u32> {
        lock(&self.statuses).get(&proc_id).copied()
    }
}

impl SecureMonitor for MockSecureMonitor {
    fn bridge_entry(&self, appl_id: u32, proc_id: u32, flags: EntryFlags, args: PhysAddr) -> u32 {
        let words = self.read_args(args);
        lock(&self.calls).push(SecureCall {
            appl_id,
            proc_id,
            flags,
            args: words.clone(),
        });
        log::debug!("mock: secure call {} args {:x?}", hal::service_name(proc_id), words);

        match proc_id {
            hal::API_HAL_SEC_RPC_INIT => {
                let addr = words.first().copied().unwrap_or(0);
                let entry = (addr != 0).then(|| {
                    // SAFETY: the only value passed here is an `RpcEntry` cast to usize.
                    unsafe { core::mem::transmute::<usize, RpcEntry>(addr) }
                });
                *lock(&self.rpc_entry) = entry;
                self.forced_status(proc_id).unwrap_or(hal::API_HAL_RET_OK)
            }
            hal::API_HAL_KM_CRC_READ => self.forced_status(proc_id).unwrap_or(MOCK_SECURE_CRC),
            hal::API_HAL_PA_LOAD => {
                if let Some(status) = self.forced_status(proc_id) {
                    return status;
                }
                let program = lock(&self.program).take();
                match program {
                    Some(mut program) => {
                        let status = program.run(PaLoad {
                            memory: &self.memory,
                            rpc: self.rpc_entry(),
                            pa_info: words.first().copied().unwrap_or(0),
                        });
                        *lock(&self.program) = Some(program);
                        status
                    }
                    None => hal::API_HAL_RET_OK,
                }
            }
            _ => self.forced_status(proc_id).unwrap_or(hal::API_HAL_RET_OK),
        }
    }

    fn flush_cache_all(&self) {
        self.full_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_cache_range(&self, vaddr: usize, len: usize) {
        lock(&self.range_flushes).push((vaddr, len));
    }
}
