//! Owned DMA memory

use alloc::sync::Arc;
use core::mem::size_of;

use derive_where::derive_where;
use log::trace;
use x86_64::{PhysAddr, VirtAddr};

use crate::{
    platform::{DmaMemory, DmaRegion},
    NvmeError, PAGE_SIZE,
};

/// Physically contiguous memory shared with the controller.
///
/// The pages are freed when this is dropped. The owner must ensure that the
/// controller no longer accesses the memory at that point.
#[derive_where(Debug)]
pub struct DmaBuffer<P: DmaMemory> {
    region: DmaRegion,
    tag: &'static str,
    #[derive_where(skip)]
    platform: Arc<P>,
}

impl<P: DmaMemory> DmaBuffer<P> {
    /// Allocate `page_count` zeroed pages
    pub fn allocate(
        platform: &Arc<P>,
        tag: &'static str,
        page_count: usize,
    ) -> Result<Self, NvmeError> {
        let region = platform.allocate_dma_pages(tag, page_count)?;
        trace!(
            "allocated {} dma page(s) for {tag} at phys {:p}",
            page_count,
            region.paddr
        );
        Ok(Self {
            region,
            tag,
            platform: platform.clone(),
        })
    }

    /// physical address of the first byte
    pub fn paddr(&self) -> PhysAddr {
        self.region.paddr
    }

    /// virtual address of the first byte
    pub fn vaddr(&self) -> VirtAddr {
        self.region.vaddr
    }

    /// size in bytes
    pub fn len(&self) -> usize {
        self.region.page_count * PAGE_SIZE
    }

    /// returns `true` if the buffer has a size of 0
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// overwrite the entire buffer with 0
    pub fn zero(&mut self) {
        let ptr = self.region.vaddr.as_mut_ptr::<u8>();
        unsafe {
            // Safety: we own the region
            core::ptr::write_bytes(ptr, 0, self.len());
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), NvmeError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(NvmeError::DmaFault),
        }
    }

    /// Pointer to a `T` at `offset` bytes into the buffer
    ///
    /// # Panics
    ///
    /// if `T` does not fit at `offset` or is not aligned
    #[track_caller]
    pub fn ptr_at<T>(&self, offset: usize) -> *mut T {
        assert!(
            self.check_range(offset, size_of::<T>()).is_ok(),
            "offset {offset:#x} out of range for {}",
            self.tag
        );
        let ptr = (self.region.vaddr + offset as u64).as_mut_ptr::<T>();
        assert!(ptr.is_aligned());
        ptr
    }

    /// Read a copy of the `T` at `offset`.
    ///
    /// The memory is read volatile as the controller might write to it.
    ///
    /// # Safety
    ///
    /// `T` must be valid for any bit pattern
    pub unsafe fn read<T: Copy>(&self, offset: usize) -> Result<T, NvmeError> {
        self.check_range(offset, size_of::<T>())?;
        let ptr = (self.region.vaddr + offset as u64).as_ptr::<T>();
        if !ptr.is_aligned() {
            return Err(NvmeError::DmaFault);
        }
        Ok(unsafe { ptr.read_volatile() })
    }

    /// Copy `buffer.len()` bytes starting at `offset` into `buffer`
    pub fn copy_to_slice(&self, offset: usize, buffer: &mut [u8]) -> Result<(), NvmeError> {
        self.check_range(offset, buffer.len())?;
        let src = (self.region.vaddr + offset as u64).as_ptr::<u8>();
        unsafe {
            // Safety: range checked above, buffer can not alias our memory
            core::ptr::copy_nonoverlapping(src, buffer.as_mut_ptr(), buffer.len());
        }
        Ok(())
    }

    /// Copy `data` into the buffer starting at `offset`
    pub fn copy_from_slice(&mut self, offset: usize, data: &[u8]) -> Result<(), NvmeError> {
        self.check_range(offset, data.len())?;
        let dst = (self.region.vaddr + offset as u64).as_mut_ptr::<u8>();
        unsafe {
            // Safety: range checked above, data can not alias our memory
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }
}

impl<P: DmaMemory> Drop for DmaBuffer<P> {
    fn drop(&mut self) {
        trace!("free dma pages for {} at {:p}", self.tag, self.region.paddr);
        unsafe {
            // Safety: the owner of the buffer guarantees that the device is done with it
            self.platform.free_dma_pages(self.region);
        }
    }
}
