//! Collaborators the driver needs from the surrounding kernel.
//!
//! The driver never touches PCI config space, page tables or interrupt
//! controllers directly. Instead everything is requested through the traits
//! in this module, which are combined in [Platform].

use core::fmt;

use shared::types::CoreId;
use thiserror::Error;
use x86_64::{PhysAddr, VirtAddr};

/// Vendor and device id of a PCI function
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl fmt::Display for PciDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.device_id)
    }
}

/// Errors reported by the [Platform]
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    #[error("out of DMA memory")]
    OutOfMemory,
    #[error("failed to map {size:#x} bytes of MMIO at {paddr:p}")]
    MappingFailed { paddr: PhysAddr, size: usize },
    #[error("no interrupt vector available for index {0}")]
    NoInterruptVectors(u16),
}

/// Access to the PCI function of the controller
pub trait PciDevice: Send + Sync {
    /// vendor and device id of the function
    fn device_id(&self) -> PciDeviceId;

    /// set the memory space bit in the command register
    fn enable_memory_space(&self);

    /// set the bus master bit in the command register
    fn enable_bus_mastering(&self);

    /// The physical address the controller registers (BAR0/BAR1) are located at
    fn bar0(&self) -> PhysAddr;
}

/// A physically contiguous region of DMA capable memory
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub paddr: PhysAddr,
    pub vaddr: VirtAddr,
    pub page_count: usize,
}

/// Memory management used by the driver
pub trait DmaMemory: Send + Sync {
    /// Map `size` bytes of device memory at `paddr` as uncached memory
    ///
    /// # Safety
    ///
    /// `paddr` must point to device memory that is not mapped anywhere else
    unsafe fn map_mmio(&self, paddr: PhysAddr, size: usize) -> Result<VirtAddr, PlatformError>;

    /// Unmap memory mapped with [DmaMemory::map_mmio]
    ///
    /// # Safety
    ///
    /// the mapping must no longer be accessed
    unsafe fn unmap_mmio(&self, vaddr: VirtAddr, size: usize);

    /// Allocate `count` physically contiguous, zeroed pages the device can access
    fn allocate_dma_pages(
        &self,
        tag: &'static str,
        count: usize,
    ) -> Result<DmaRegion, PlatformError>;

    /// Free pages allocated with [DmaMemory::allocate_dma_pages]
    ///
    /// # Safety
    ///
    /// neither the cpu nor the device may access the region after this call
    unsafe fn free_dma_pages(&self, region: DmaRegion);
}

/// The kind of interrupts negotiated for a device
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqType {
    Legacy,
    Msi,
    MsiX,
}

/// An interrupt vector bound to one queue of the controller
///
/// The value is passed to the controller in the create completion queue command
/// and is used to route [crate::NvmeController::handle_interrupt] to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrqVector(pub u16);

/// Interrupt allocation
pub trait Interrupts: Send + Sync {
    /// Reserve `count` interrupt sources for the device
    fn reserve_irqs(&self, count: u16, msi_x_preferred: bool) -> Result<IrqType, PlatformError>;

    /// Bind the reserved interrupt source `index` to a vector
    fn allocate_irq(&self, index: u16) -> Result<IrqVector, PlatformError>;
}

/// Cpu topology
pub trait CpuTopology: Send + Sync {
    /// the number of logical cores
    fn core_count(&self) -> u16;

    /// the core the caller is running on
    fn current_core(&self) -> CoreId;
}

/// Busy waiting
pub trait Delay: Send + Sync {
    /// Wait for at least `us` microseconds
    fn delay_us(&self, us: u64);
}

/// Everything the driver needs from the kernel
pub trait Platform: PciDevice + DmaMemory + Interrupts + CpuTopology + Delay {}

impl<T> Platform for T where T: PciDevice + DmaMemory + Interrupts + CpuTopology + Delay {}
