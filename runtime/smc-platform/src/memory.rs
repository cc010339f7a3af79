//! Physically-contiguous memory shared with the secure world

use crate::{PhysAddr, Result, PAGE_SIZE};

/// A pinned user page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFrame {
    /// Physical address of the page
    pub phys: PhysAddr,
    /// Page is reserved (no dirty tracking on release)
    pub reserved: bool,
}

/// Page and heap allocation plus address translation
///
/// All allocations are zeroed and physically contiguous. Virtual addresses are
/// returned as `usize` and stay valid until the matching free call.
pub trait PhysMemory: Send + Sync {
    /// Size of one page as seen by the secure world
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Allocate `2^order` zeroed pages
    fn alloc_pages(&self, order: u32) -> Result<usize>;

    /// Release a block returned by [`PhysMemory::alloc_pages`]
    fn free_pages(&self, vaddr: usize, order: u32);

    /// Allocate a zeroed heap block of `size` bytes
    fn alloc(&self, size: usize) -> Result<usize>;

    /// Release a block returned by [`PhysMemory::alloc`]
    fn free(&self, vaddr: usize, size: usize);

    /// Pin up to `count` user pages starting at the page-aligned `vaddr`
    ///
    /// Returns the frames actually pinned, which may be fewer than requested.
    fn pin_user_pages(&self, vaddr: usize, count: usize, write: bool) -> Result<Vec<PageFrame>>;

    /// Drop one pin taken by [`PhysMemory::pin_user_pages`]
    fn unpin_page(&self, frame: PageFrame, dirty: bool);

    fn virt_to_phys(&self, vaddr: usize) -> PhysAddr;

    fn phys_to_virt(&self, phys: PhysAddr) -> usize;
}

/// Align address up to the next page boundary
#[inline]
pub const fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Align address down to the page boundary
#[inline]
pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Number of pages covering `size` bytes
#[inline]
pub const fn pages_needed(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Smallest order whose page group covers `size` bytes
pub fn order_for_size(size: usize) -> u32 {
    let pages = pages_needed(size).max(1);
    pages.next_power_of_two().trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 17), PAGE_SIZE);
        assert_eq!(pages_needed(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn test_order_for_size() {
        assert_eq!(order_for_size(1), 0);
        assert_eq!(order_for_size(PAGE_SIZE), 0);
        assert_eq!(order_for_size(PAGE_SIZE + 1), 1);
        assert_eq!(order_for_size(3 * PAGE_SIZE), 2);
        assert_eq!(order_for_size(4 * PAGE_SIZE), 2);
        assert_eq!(order_for_size(8 * PAGE_SIZE), 3);
    }
}
