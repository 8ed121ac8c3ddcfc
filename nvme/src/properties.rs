//! Structs representing the different NVME Controller Properties
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{fence, Ordering},
    time::Duration,
};

use bit_field::BitField;
use derive_where::derive_where;
use log::trace;
use shared::primitive_enum::InvalidValue;
use shared_derive::U8Enum;
use volatile::Volatile;
use x86_64::{PhysAddr, VirtAddr};

use crate::{platform::DmaMemory, queue::QueueIdentifier, NvmeError};

/// Byte offsets of the controller properties
///
/// See: NVMe over PCIe Transport Spec: Figure 4: PCI Express Specific Property Definitions
#[allow(missing_docs)]
pub mod offsets {
    pub const CAP: u64 = 0x00;
    pub const VS: u64 = 0x08;
    pub const INTMS: u64 = 0x0c;
    pub const INTMC: u64 = 0x10;
    pub const CC: u64 = 0x14;
    pub const CSTS: u64 = 0x1c;
    pub const AQA: u64 = 0x24;
    pub const ASQ: u64 = 0x28;
    pub const ACQ: u64 = 0x30;
    pub const DOORBELLS: u64 = 0x1000;
}

/// The byte offset of a doorbell relative to the start of the doorbell registers.
///
/// Submission and completion doorbells are interleaved, the submission doorbell of
/// `queue` is at `2 * qid * (4 << stride)`, the completion doorbell right after it.
pub fn doorbell_offset(queue: QueueIdentifier, stride: u8, completion: bool) -> u64 {
    let stride_bytes = 4u64 << stride;
    (2 * queue.as_u16() as u64 + completion as u64) * stride_bytes
}

/// The capabilities of the NVMe Controller
///
/// See: NVM Express Base Spec: Figure 36: Offset 0h: CAP
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// The maximum size of IO submission and completion queues.
    ///
    /// This is a 0 based value, so a value of 1 means a queue can hold 2 entries.
    pub maximum_queue_entries: u16,
    pub contiguous_queues_required: bool,
    pub arbitrations_supported: u8,
    /// worst case time to wait for CSTS.RDY in 500ms units
    pub timeout: u8,
    /// DSTRD. Doorbells are `4 << doorbell_stride` bytes apart
    pub doorbell_stride: u8,
    pub subsystem_reset_supported: bool,
    pub command_sets_supported: u8,
    pub boot_partition_support: bool,
    pub power_scope: u8,
    /// 2 ^ (12 + mpsmin)
    pub mem_min_page_size: u8,
    /// 2 ^ (12 + mpsmax)
    pub mem_max_page_size: u8,
    pub persistent_memory_region_support: bool,
    pub memory_buffer_support: bool,
    pub subsystem_shutdown_support: bool,
    pub ready_modes_support: u8,
}

impl Capabilities {
    /// The maximum number of entries in a single queue
    pub fn max_queue_depth(&self) -> u32 {
        self.maximum_queue_entries as u32 + 1
    }

    /// The worst case time the controller takes to change CSTS.RDY
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis((self.timeout as u64 + 1) * 500)
    }

    /// The distance between 2 doorbells in bytes
    pub fn doorbell_stride_bytes(&self) -> u64 {
        4 << self.doorbell_stride
    }

    /// returns `true` if the NVM command set is supported
    pub fn supports_nvm_command_set(&self) -> bool {
        self.command_sets_supported.get_bit(0)
    }
}

impl From<u64> for Capabilities {
    fn from(value: u64) -> Self {
        Self {
            maximum_queue_entries: value.get_bits(0..=15) as u16,
            contiguous_queues_required: value.get_bit(16),
            arbitrations_supported: value.get_bits(17..=18) as u8,
            timeout: value.get_bits(24..=31) as u8,
            doorbell_stride: value.get_bits(32..=35) as u8,
            subsystem_reset_supported: value.get_bit(36),
            command_sets_supported: value.get_bits(37..=44) as u8,
            boot_partition_support: value.get_bit(45),
            power_scope: value.get_bits(46..=47) as u8,
            mem_min_page_size: value.get_bits(48..=51) as u8,
            mem_max_page_size: value.get_bits(52..=55) as u8,
            persistent_memory_region_support: value.get_bit(56),
            memory_buffer_support: value.get_bit(57),
            subsystem_shutdown_support: value.get_bit(58),
            ready_modes_support: value.get_bits(59..=60) as u8,
        }
    }
}

impl From<Capabilities> for u64 {
    fn from(cap: Capabilities) -> u64 {
        let mut value = 0u64;
        value.set_bits(0..=15, cap.maximum_queue_entries as u64);
        value.set_bit(16, cap.contiguous_queues_required);
        value.set_bits(17..=18, cap.arbitrations_supported as u64);
        value.set_bits(24..=31, cap.timeout as u64);
        value.set_bits(32..=35, cap.doorbell_stride as u64);
        value.set_bit(36, cap.subsystem_reset_supported);
        value.set_bits(37..=44, cap.command_sets_supported as u64);
        value.set_bit(45, cap.boot_partition_support);
        value.set_bits(46..=47, cap.power_scope as u64);
        value.set_bits(48..=51, cap.mem_min_page_size as u64);
        value.set_bits(52..=55, cap.mem_max_page_size as u64);
        value.set_bit(56, cap.persistent_memory_region_support);
        value.set_bit(57, cap.memory_buffer_support);
        value.set_bit(58, cap.subsystem_shutdown_support);
        value.set_bits(59..=60, cap.ready_modes_support as u64);
        value
    }
}

/// The NVMe version implemented by the controller
///
/// See: NVM Express Base Spec: Figure 37: Offset 8h: VS
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u8,
    pub tertiary: u8,
}

impl From<u32> for Version {
    fn from(value: u32) -> Self {
        Self {
            major: value.get_bits(16..=31) as u16,
            minor: value.get_bits(8..=15) as u8,
            tertiary: value.get_bits(0..=7) as u8,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.tertiary)
    }
}

/// The configuration of the NVMe Controller
///
/// See: NVM Express Base Spec: Figure 46: Offset 14H: CC
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfiguration {
    pub enable: bool,
    /// 3 bit value set during initialization
    pub command_set_selected: u8,
    /// host memory page size as 2 ^ (12 + value)
    pub memory_page_size: u8,
    pub arbitration_mechanism: ArbitrationMechanism,
    pub shutdown_notification: ShutdownNotification,
    /// log2 of the size of an io submission command entry
    pub io_submission_queue_entry_size: u8,
    /// log2 of the size of an io completion command entry
    pub io_completion_queue_entry_size: u8,
    pub controller_ready_independent_of_media_enable: bool,
}

impl TryFrom<u32> for ControllerConfiguration {
    type Error = InvalidValue<u32>;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let invalid = |_| InvalidValue { value };
        Ok(Self {
            enable: value.get_bit(0),
            command_set_selected: value.get_bits(4..=6) as u8,
            memory_page_size: value.get_bits(7..=10) as u8,
            arbitration_mechanism: (value.get_bits(11..=13) as u8)
                .try_into()
                .map_err(invalid)?,
            shutdown_notification: (value.get_bits(14..=15) as u8)
                .try_into()
                .map_err(invalid)?,
            io_submission_queue_entry_size: value.get_bits(16..=19) as u8,
            io_completion_queue_entry_size: value.get_bits(20..=23) as u8,
            controller_ready_independent_of_media_enable: value.get_bit(24),
        })
    }
}

impl From<ControllerConfiguration> for u32 {
    fn from(cc: ControllerConfiguration) -> u32 {
        let mut value = 0u32;
        value.set_bit(0, cc.enable);
        value.set_bits(4..=6, cc.command_set_selected as u32);
        value.set_bits(7..=10, cc.memory_page_size as u32);
        value.set_bits(11..=13, cc.arbitration_mechanism as u8 as u32);
        value.set_bits(14..=15, cc.shutdown_notification as u8 as u32);
        value.set_bits(16..=19, cc.io_submission_queue_entry_size as u32);
        value.set_bits(20..=23, cc.io_completion_queue_entry_size as u32);
        value.set_bit(24, cc.controller_ready_independent_of_media_enable);
        value
    }
}

/// The arbitration mechanism used for command queue prioritazation
///
/// See: NVM Express Base Spec: Figure 46: Offset 14h: CC
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, U8Enum, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationMechanism {
    RoundRobbin = 0b000,
    WeightedRoundRobbin = 0b001,
    Reserved1 = 0b010,
    Reserved2 = 0b011,
    Reserved3 = 0b100,
    Reserved4 = 0b101,
    Reserved5 = 0b110,
    VendorSpecific = 0b111,
}

/// CC.SHN
///
/// See: NVM Express Base Spec: Figure 46: Offset 14h: CC
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, U8Enum, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownNotification {
    None = 0b00,
    Normal = 0b01,
    Abrupt = 0b10,
    Reserved = 0b11,
}

/// Status of the controller
///
/// See: NVM Express Base Spec: Figure 47: Offset 1CH: CSTS
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub ready: bool,
    pub fatal_error: bool,
    pub shutdown_status: ShutdownStatus,
    pub subsystem_reset_occured: bool,
    pub processing_paused: bool,
    pub shutdown_type: bool,
}

impl From<u32> for ControllerStatus {
    fn from(value: u32) -> Self {
        let shutdown_status = match value.get_bits(2..=3) {
            0b00 => ShutdownStatus::NormalOperation,
            0b01 => ShutdownStatus::Occuring,
            0b10 => ShutdownStatus::Complete,
            _ => ShutdownStatus::Reserved,
        };
        Self {
            ready: value.get_bit(0),
            fatal_error: value.get_bit(1),
            shutdown_status,
            subsystem_reset_occured: value.get_bit(4),
            processing_paused: value.get_bit(5),
            shutdown_type: value.get_bit(6),
        }
    }
}

impl From<ControllerStatus> for u32 {
    fn from(status: ControllerStatus) -> u32 {
        let mut value = 0u32;
        value.set_bit(0, status.ready);
        value.set_bit(1, status.fatal_error);
        value.set_bits(2..=3, status.shutdown_status as u8 as u32);
        value.set_bit(4, status.subsystem_reset_occured);
        value.set_bit(5, status.processing_paused);
        value.set_bit(6, status.shutdown_type);
        value
    }
}

/// The shutdown status of an NVME controller
///
/// See: NVM Express Base Spec: Figure 47: Offset 1Ch: CSTS
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// No shutdown requested
    NormalOperation = 0,
    Occuring = 0b01,
    Complete = 0b10,
    Reserved = 0b11,
}

/// AQA: Admin Queue Attributes
///
/// See: NVM Express base Spec: Figure 49: Offset 24h: AQA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminQueueAttributes {
    /// Must not be more than 4096
    pub submission_queue_size: u16,

    /// Must not be more than 4096
    pub completion_queue_size: u16,
}

impl From<u32> for AdminQueueAttributes {
    fn from(value: u32) -> Self {
        Self {
            submission_queue_size: value.get_bits(0..=11) as u16 + 1,
            completion_queue_size: value.get_bits(16..=27) as u16 + 1,
        }
    }
}

impl From<AdminQueueAttributes> for u32 {
    fn from(aqa: AdminQueueAttributes) -> u32 {
        debug_assert!((1..=4096).contains(&aqa.submission_queue_size));
        debug_assert!((1..=4096).contains(&aqa.completion_queue_size));

        // Convert into 0 based value
        let mut value = 0u32;
        value.set_bits(0..=11, aqa.submission_queue_size as u32 - 1);
        value.set_bits(16..=27, aqa.completion_queue_size as u32 - 1);
        value
    }
}

/// The mapped controller properties.
///
/// Every access is volatile. Writes are followed by a full fence so the device
/// observes them before any later memory access of the driver.
///
/// The mapping is removed when this is dropped.
#[derive_where(Debug)]
pub struct RegisterBlock<P: DmaMemory> {
    paddr: PhysAddr,
    base: VirtAddr,
    size: usize,
    #[derive_where(skip)]
    platform: Arc<P>,
}

impl<P: DmaMemory> RegisterBlock<P> {
    /// Map the controller properties at `paddr`.
    ///
    /// The mapping covers the doorbells of `queue_count` queues (including the
    /// admin queue). CAP is read through a temporary mapping of the first page to
    /// learn the doorbell stride.
    ///
    /// # Safety
    ///
    /// `paddr` must be the BAR of an nvme controller that is not mapped anywhere else.
    pub unsafe fn map(platform: Arc<P>, paddr: PhysAddr, queue_count: u16) -> Result<Self, NvmeError> {
        let header = Self {
            paddr,
            base: unsafe { platform.map_mmio(paddr, offsets::DOORBELLS as usize)? },
            size: offsets::DOORBELLS as usize,
            platform: platform.clone(),
        };
        let stride = header.capabilities().doorbell_stride;
        drop(header);

        let last_queue = QueueIdentifier(queue_count.saturating_sub(1));
        let size = (offsets::DOORBELLS + doorbell_offset(last_queue, stride, true) + 4) as usize;
        let base = unsafe { platform.map_mmio(paddr, size)? };
        trace!(
            "nvme controller properties at phys {:p} mapped to {:p}, size {:#x}",
            paddr,
            base,
            size
        );

        Ok(Self {
            paddr,
            base,
            size,
            platform,
        })
    }

    fn ptr<T>(&self, offset: u64) -> *mut T {
        debug_assert!(offset as usize + core::mem::size_of::<T>() <= self.size);
        (self.base + offset).as_mut_ptr()
    }

    /// Read a raw 32bit property
    pub fn read_32(&self, offset: u64) -> u32 {
        let reg = unsafe {
            // Safety: offset is within the mapped properties
            &*self.ptr::<u32>(offset)
        };
        Volatile::new_read_only(reg).read()
    }

    /// Write a raw 32bit property
    pub fn write_32(&self, offset: u64, value: u32) {
        let reg = unsafe {
            // Safety: offset is within the mapped properties.
            // The device memory is never accessed through references
            // other than these short lived ones.
            &mut *self.ptr::<u32>(offset)
        };
        Volatile::new_write_only(reg).write(value);
        fence(Ordering::SeqCst);
    }

    /// Read a raw 64bit property
    pub fn read_64(&self, offset: u64) -> u64 {
        let reg = unsafe {
            // Safety: offset is within the mapped properties
            &*self.ptr::<u64>(offset)
        };
        Volatile::new_read_only(reg).read()
    }

    /// Write a raw 64bit property
    pub fn write_64(&self, offset: u64, value: u64) {
        let reg = unsafe {
            // Safety: see write_32
            &mut *self.ptr::<u64>(offset)
        };
        Volatile::new_write_only(reg).write(value);
        fence(Ordering::SeqCst);
    }

    /// CAP
    pub fn capabilities(&self) -> Capabilities {
        self.read_64(offsets::CAP).into()
    }

    /// VS
    pub fn version(&self) -> Version {
        self.read_32(offsets::VS).into()
    }

    /// CC
    pub fn configuration(&self) -> Result<ControllerConfiguration, NvmeError> {
        ControllerConfiguration::try_from(self.read_32(offsets::CC))
            .map_err(|_| NvmeError::DeviceNotSupported("reserved value in CC"))
    }

    /// write CC
    pub fn write_configuration(&self, configuration: ControllerConfiguration) {
        trace!("write CC: {configuration:?}");
        self.write_32(offsets::CC, configuration.into());
    }

    /// CSTS
    pub fn status(&self) -> ControllerStatus {
        self.read_32(offsets::CSTS).into()
    }

    /// write AQA
    pub fn write_admin_queue_attributes(&self, aqa: AdminQueueAttributes) {
        self.write_32(offsets::AQA, aqa.into());
    }

    /// write ASQ and ACQ
    pub fn write_admin_queue_addresses(&self, submission: PhysAddr, completion: PhysAddr) {
        self.write_64(offsets::ASQ, submission.as_u64());
        self.write_64(offsets::ACQ, completion.as_u64());
    }

    /// The virtual address of a doorbell register
    pub fn doorbell(&self, queue: QueueIdentifier, stride: u8, completion: bool) -> VirtAddr {
        let offset = offsets::DOORBELLS + doorbell_offset(queue, stride, completion);
        assert!(
            offset as usize + 4 <= self.size,
            "doorbell for queue {queue:?} is not mapped"
        );
        self.base + offset
    }

    /// The physical address the properties are mapped from
    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }
}

impl<P: DmaMemory> Drop for RegisterBlock<P> {
    fn drop(&mut self) {
        unsafe {
            // Safety: all doorbells and queues referencing the mapping are owned by the
            // controller which drops them before us
            self.platform.unmap_mmio(self.base, self.size);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capabilities_decode() {
        // MQES 0x3ff, CQR, TO 0x14, DSTRD 2, CSS NVM
        let raw: u64 = 0x3ff | 1 << 16 | 0x14 << 24 | 2 << 32 | 1 << 37;
        let cap = Capabilities::from(raw);
        assert_eq!(cap.maximum_queue_entries, 0x3ff);
        assert_eq!(cap.max_queue_depth(), 0x400);
        assert!(cap.contiguous_queues_required);
        assert_eq!(cap.timeout, 0x14);
        assert_eq!(cap.ready_timeout(), Duration::from_millis(21 * 500));
        assert_eq!(cap.doorbell_stride, 2);
        assert_eq!(cap.doorbell_stride_bytes(), 16);
        assert!(cap.supports_nvm_command_set());
        assert_eq!(u64::from(cap), raw);
    }

    #[test]
    fn configuration_fields() {
        let cc = ControllerConfiguration {
            enable: true,
            command_set_selected: 0,
            memory_page_size: 0,
            arbitration_mechanism: ArbitrationMechanism::RoundRobbin,
            shutdown_notification: ShutdownNotification::Normal,
            io_submission_queue_entry_size: 6,
            io_completion_queue_entry_size: 4,
            controller_ready_independent_of_media_enable: false,
        };
        let raw: u32 = cc.clone().into();
        assert_eq!(raw, 1 | 0b01 << 14 | 6 << 16 | 4 << 20);
        assert_eq!(ControllerConfiguration::try_from(raw), Ok(cc));
    }

    #[test]
    fn status_decode() {
        let status = ControllerStatus::from(0b1001);
        assert!(status.ready);
        assert!(!status.fatal_error);
        assert_eq!(status.shutdown_status, ShutdownStatus::Complete);
    }

    #[test]
    fn admin_queue_attributes_are_zero_based() {
        let aqa = AdminQueueAttributes {
            submission_queue_size: 64,
            completion_queue_size: 32,
        };
        assert_eq!(u32::from(aqa), 63 | 31 << 16);
        assert_eq!(AdminQueueAttributes::from(63 | 31 << 16), aqa);
    }

    #[test]
    fn doorbell_offsets_interleave() {
        assert_eq!(doorbell_offset(QueueIdentifier(0), 0, false), 0);
        assert_eq!(doorbell_offset(QueueIdentifier(0), 0, true), 4);
        assert_eq!(doorbell_offset(QueueIdentifier(3), 0, false), 24);
        assert_eq!(doorbell_offset(QueueIdentifier(3), 2, false), 2 * 3 * 16);
        assert_eq!(doorbell_offset(QueueIdentifier(3), 2, true), 2 * 3 * 16 + 16);
    }
}
