//! Shared buffer descriptors
//!
//! # Purpose
//! Gives the secure world a physically-contiguous view of a client buffer,
//! either by pinning the caller's own pages in place or by allocating a fresh
//! buffer when that is not possible.
//!
//! # Architecture
//! A descriptor holds exactly one [`Backing`]. Registration pins user pages
//! and requires them to be physically contiguous; any registration failure
//! falls back to allocation. Allocation uses a page group when the size is at
//! most four pages or an exact power-of-two number of pages, and an over-sized
//! heap block aligned up to a page boundary otherwise. Release is
//! backing-specific and idempotent.
//!
//! # Testing Strategy
//! - Unit tests: allocation policy, registration fallback, double release

use std::collections::BTreeMap;
use std::sync::Mutex;

use bitflags::bitflags;
use smc_platform::{
    align_down, align_up, order_for_size, PageFrame, PhysAddr, PhysMemory, SecureMonitor, PAGE_SIZE,
};

use crate::error::{CommError, Result};
use crate::signal::lock;

bitflags! {
    /// Client buffer attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmemFlags: u32 {
        const INPUT = 0x0000_0001;
        const OUTPUT = 0x0000_0002;
        /// Try to share the caller's pages directly
        const DIRECT = 0x8000_0000;
        /// Same as DIRECT; kept distinct for callers that insist
        const DIRECT_FORCE = 0x4000_0000;
    }
}

/// Memory currently backing a descriptor
#[derive(Debug, Default)]
pub enum Backing {
    #[default]
    None,
    /// Caller pages pinned in place
    Registered { frames: Vec<PageFrame> },
    /// Heap block, `buffer` is its first page boundary
    Heap { base: usize, size: usize },
    /// Page group of `2^order` pages
    Pages { base: usize, order: u32 },
}

/// Which strategy ended up serving a fill request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The caller's buffer is shared directly
    Registered,
    /// A separate buffer was allocated; the caller's address is not used
    Allocated,
}

/// Result of [`ShmemDescriptor::fill`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilledBuffer {
    pub phys_addr: PhysAddr,
    pub placement: Placement,
}

/// One physically-contiguous region shared with the secure world
#[derive(Debug, Default)]
pub struct ShmemDescriptor {
    backing: Backing,
    buffer: usize,
    buffer_size: usize,
    phys_addr: PhysAddr,
}

impl ShmemDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.backing, Backing::None)
    }

    /// Virtual address of the buffer the secure world sees
    pub fn buffer(&self) -> usize {
        self.buffer
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// Back the descriptor with memory and return its physical address
    ///
    /// `user_addr` is the caller's buffer; it is shared directly only when
    /// `flags` ask for direct access and its pages are contiguous.
    pub fn fill(
        &mut self,
        mem: &dyn PhysMemory,
        user_addr: Option<usize>,
        size: usize,
        flags: ShmemFlags,
    ) -> Result<FilledBuffer> {
        if !self.is_empty() {
            log::warn!("shmem: refilling a live descriptor, releasing it first");
            self.release(mem, false);
        }

        let direct = flags.intersects(ShmemFlags::DIRECT | ShmemFlags::DIRECT_FORCE);
        if let Some(addr) = user_addr.filter(|&a| a != 0 && direct) {
            match self.register(mem, addr, size) {
                Ok(phys_addr) => {
                    return Ok(FilledBuffer {
                        phys_addr,
                        placement: Placement::Registered,
                    })
                }
                Err(e) => {
                    self.release(mem, false);
                    log::warn!("shmem: register of {:#x} failed ({}), allocating instead", addr, e);
                }
            }
        }

        match self.allocate(mem, size) {
            Ok(phys_addr) => Ok(FilledBuffer {
                phys_addr,
                placement: Placement::Allocated,
            }),
            Err(e) => {
                self.release(mem, false);
                Err(e)
            }
        }
    }

    fn register(&mut self, mem: &dyn PhysMemory, addr: usize, size: usize) -> Result<PhysAddr> {
        let start = align_down(addr);
        let count = (align_up(addr + size) - start) / PAGE_SIZE;
        log::debug!("shmem: registering {:#x}: {} pages", addr, count);

        let frames = mem.pin_user_pages(start, count, true)?;
        let pinned = frames.len();
        let first = frames.first().map(|f| f.phys).unwrap_or(0);
        let contiguous = frames
            .iter()
            .enumerate()
            .all(|(i, f)| f.phys == first + i * PAGE_SIZE);
        // Keep whatever got pinned so release can drop it
        self.backing = Backing::Registered { frames };

        if pinned != count {
            log::error!("shmem: pinned {} pages out of {}", pinned, count);
            return Err(CommError::OutOfMemory { requested: size });
        }
        if !contiguous {
            return Err(CommError::NotContiguous);
        }

        let offset = addr & (PAGE_SIZE - 1);
        self.buffer = mem.phys_to_virt(first) + offset;
        self.buffer_size = size;
        self.phys_addr = first + offset;
        log::debug!("shmem: registered {:#x} at phys {:#x}", addr, self.phys_addr);
        Ok(self.phys_addr)
    }

    fn allocate(&mut self, mem: &dyn PhysMemory, size: usize) -> Result<PhysAddr> {
        let pages = size.div_ceil(PAGE_SIZE);
        let page_group = size <= 4 * PAGE_SIZE || (size % PAGE_SIZE == 0 && pages.is_power_of_two());

        if page_group {
            let order = order_for_size(size);
            let base = mem.alloc_pages(order)?;
            self.backing = Backing::Pages { base, order };
            self.buffer = base;
            log::debug!("shmem: page group size={} order={} at {:#x}", size, order, base);
        } else {
            let alloc_size = size + PAGE_SIZE;
            let base = mem.alloc(alloc_size)?;
            self.backing = Backing::Heap {
                base,
                size: alloc_size,
            };
            self.buffer = align_up(base);
            log::debug!("shmem: heap size={} alloc={:#x}->{:#x}", alloc_size, base, self.buffer);
        }
        self.buffer_size = size;
        self.phys_addr = mem.virt_to_phys(self.buffer);
        Ok(self.phys_addr)
    }

    /// Return the backing memory; a no-op on an empty descriptor
    ///
    /// With `full_cleanup`, registered pages are reported dirty.
    pub fn release(&mut self, mem: &dyn PhysMemory, full_cleanup: bool) {
        match std::mem::take(&mut self.backing) {
            Backing::None => {}
            Backing::Registered { frames } => {
                for frame in frames {
                    mem.unpin_page(frame, full_cleanup && !frame.reserved);
                }
            }
            Backing::Heap { base, size } => mem.free(base, size),
            Backing::Pages { base, order } => mem.free_pages(base, order),
        }
        self.buffer = 0;
        self.buffer_size = 0;
        self.phys_addr = 0;
    }

    /// Clean and invalidate the shared range
    pub fn flush(&self, platform: &dyn SecureMonitor) {
        if !self.is_empty() && self.buffer_size > 0 {
            platform.flush_cache_range(self.buffer, self.buffer_size);
        }
    }
}

/// Identifier of a descriptor registered on a connection
pub type DescriptorId = u32;

/// Per-connection set of shared buffer descriptors
///
/// Guarded by its own mutex, narrower than the monitor lock.
#[derive(Debug, Default)]
pub struct SharedMemoryMonitor {
    inner: Mutex<DescriptorSet>,
}

#[derive(Debug, Default)]
struct DescriptorSet {
    descriptors: BTreeMap<DescriptorId, ShmemDescriptor>,
    next_id: DescriptorId,
}

impl SharedMemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill a new descriptor and keep it on this connection
    pub fn register(
        &self,
        mem: &dyn PhysMemory,
        user_addr: Option<usize>,
        size: usize,
        flags: ShmemFlags,
    ) -> Result<(DescriptorId, FilledBuffer)> {
        let mut desc = ShmemDescriptor::new();
        let filled = desc.fill(mem, user_addr, size, flags)?;
        let mut set = lock(&self.inner);
        let id = set.next_id;
        set.next_id = set.next_id.wrapping_add(1);
        set.descriptors.insert(id, desc);
        Ok((id, filled))
    }

    /// Release and forget one descriptor
    pub fn release(&self, mem: &dyn PhysMemory, id: DescriptorId) -> bool {
        let desc = lock(&self.inner).descriptors.remove(&id);
        match desc {
            Some(mut desc) => {
                desc.release(mem, true);
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self, mem: &dyn PhysMemory) {
        let descriptors = std::mem::take(&mut lock(&self.inner).descriptors);
        for (_, mut desc) in descriptors {
            desc.release(mem, true);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush every registered range
    pub fn flush_all(&self, platform: &dyn SecureMonitor) {
        for desc in lock(&self.inner).descriptors.values() {
            desc.flush(platform);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smc_platform::mock::{MockMemory, MockSecureMonitor};
    use std::sync::Arc;

    #[test]
    fn test_small_buffer_uses_page_group() {
        let mem = MockMemory::new();
        let mut desc = ShmemDescriptor::new();
        let filled = desc.fill(&mem, None, 3 * PAGE_SIZE, ShmemFlags::INPUT).unwrap();
        assert_eq!(filled.placement, Placement::Allocated);
        assert!(matches!(desc.backing(), Backing::Pages { order: 2, .. }));
        assert_eq!(filled.phys_addr % PAGE_SIZE, 0);

        desc.release(&mem, false);
        assert!(desc.is_empty());
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_power_of_two_pages_use_page_group() {
        let mem = MockMemory::new();
        let mut desc = ShmemDescriptor::new();
        desc.fill(&mem, None, 8 * PAGE_SIZE, ShmemFlags::empty()).unwrap();
        assert!(matches!(desc.backing(), Backing::Pages { order: 3, .. }));
        desc.release(&mem, false);
    }

    #[test]
    fn test_odd_size_uses_aligned_heap_block() {
        let mem = MockMemory::new();
        let mut desc = ShmemDescriptor::new();
        let size = 5 * PAGE_SIZE + 10;
        let filled = desc.fill(&mem, None, size, ShmemFlags::empty()).unwrap();
        match desc.backing() {
            Backing::Heap { size: alloc, .. } => assert_eq!(*alloc, size + PAGE_SIZE),
            other => panic!("unexpected backing {:?}", other),
        }
        assert_eq!(desc.buffer() % PAGE_SIZE, 0);
        assert_eq!(filled.phys_addr, desc.buffer());
        desc.release(&mem, false);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_register_contiguous_user_buffer() {
        let mem = MockMemory::new();
        let user = mem.map_user_buffer(4 * PAGE_SIZE).unwrap();
        let addr = user + 100;

        let mut desc = ShmemDescriptor::new();
        let filled = desc
            .fill(&mem, Some(addr), 2 * PAGE_SIZE, ShmemFlags::DIRECT)
            .unwrap();
        assert_eq!(filled.placement, Placement::Registered);
        assert_eq!(filled.phys_addr, addr);
        assert_eq!(mem.pinned_pages(), 3);

        desc.release(&mem, true);
        assert_eq!(mem.pinned_pages(), 0);
        assert_eq!(mem.dirty_unpins(), 3);
        mem.unmap_user_buffer(user);
    }

    #[test]
    fn test_scattered_pages_fall_back_to_allocation() {
        let mem = MockMemory::new();
        mem.set_fragmented(true);
        let user = mem.map_user_buffer(2 * PAGE_SIZE).unwrap();

        let mut desc = ShmemDescriptor::new();
        let filled = desc
            .fill(&mem, Some(user), 2 * PAGE_SIZE, ShmemFlags::DIRECT_FORCE)
            .unwrap();
        assert_eq!(filled.placement, Placement::Allocated);
        assert_eq!(mem.pinned_pages(), 0);
        assert!(matches!(desc.backing(), Backing::Pages { .. }));
        desc.release(&mem, false);
        mem.unmap_user_buffer(user);
    }

    #[test]
    fn test_unmapped_user_buffer_falls_back() {
        let mem = MockMemory::new();
        let mut desc = ShmemDescriptor::new();
        let filled = desc
            .fill(&mem, Some(0x1000), PAGE_SIZE, ShmemFlags::DIRECT)
            .unwrap();
        assert_eq!(filled.placement, Placement::Allocated);
        desc.release(&mem, false);
    }

    #[test]
    fn test_user_buffer_without_direct_flag_is_copied() {
        let mem = MockMemory::new();
        let user = mem.map_user_buffer(PAGE_SIZE).unwrap();
        let mut desc = ShmemDescriptor::new();
        let filled = desc.fill(&mem, Some(user), PAGE_SIZE, ShmemFlags::INPUT).unwrap();
        assert_eq!(filled.placement, Placement::Allocated);
        assert_eq!(mem.pinned_pages(), 0);
        desc.release(&mem, false);
        mem.unmap_user_buffer(user);
    }

    #[test]
    fn test_out_of_memory_leaves_descriptor_empty() {
        let mem = MockMemory::new();
        mem.fail_allocations_after(0);
        let mut desc = ShmemDescriptor::new();
        assert!(matches!(
            desc.fill(&mem, None, PAGE_SIZE, ShmemFlags::empty()),
            Err(CommError::Platform(_))
        ));
        assert!(desc.is_empty());
    }

    #[test]
    fn test_double_release_is_noop() {
        let mem = MockMemory::new();
        let mut desc = ShmemDescriptor::new();
        desc.fill(&mem, None, PAGE_SIZE, ShmemFlags::empty()).unwrap();
        desc.release(&mem, false);
        desc.release(&mem, false);
        assert!(desc.is_empty());
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_connection_descriptor_set() {
        let mem = Arc::new(MockMemory::new());
        let platform = MockSecureMonitor::new(mem.clone());
        let set = SharedMemoryMonitor::new();

        let (a, _) = set.register(&*mem, None, PAGE_SIZE, ShmemFlags::INPUT).unwrap();
        let (b, _) = set.register(&*mem, None, 2 * PAGE_SIZE, ShmemFlags::OUTPUT).unwrap();
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);

        set.flush_all(&platform);
        assert_eq!(platform.range_flushes().len(), 2);

        assert!(set.release(&*mem, a));
        assert!(!set.release(&*mem, a));
        set.release_all(&*mem);
        assert!(set.is_empty());
        assert_eq!(mem.live_allocations(), 0);
    }
}
