use alloc::string::String;
use core::mem::offset_of;

use bit_field::BitField;
use static_assertions::const_assert_eq;
use x86_64::PhysAddr;

use crate::{capabilities::OptionalAdminCommands, generic_command::CommonCommand};

use super::CommandOpcode;

/// CNS Value
///
/// See: NVM Express Base Spec: Figure 274: Identify CNS Value
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyCns {
    /// Identify Namespace data structure for `nsid`
    Namespace { nsid: u32 },
    /// Identify Controller data structure
    Controller,
    /// Active namespace ids greater than `start_nsid`
    ActiveNamespaceList { start_nsid: u32 },
}

impl IdentifyCns {
    /// The raw CNS value
    pub fn cns(&self) -> u8 {
        match self {
            IdentifyCns::Namespace { .. } => 0x0,
            IdentifyCns::Controller => 0x1,
            IdentifyCns::ActiveNamespaceList { .. } => 0x2,
        }
    }
}

/// Create the [CommonCommand] data structure for an identify command
///
/// `data` must point to a page the controller writes the 4KiB result to.
///
/// See: NVM Express Base Spec: 5.17
pub fn create_identify_command(cns: IdentifyCns, data: PhysAddr) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(CommandOpcode::Identify as u8);
    let mut dword10: u32 = 0;
    dword10.set_bits(0..=7, cns.cns() as u32);
    command.dword10 = dword10;

    match cns {
        IdentifyCns::Namespace { nsid } => command.namespace_ident = nsid,
        IdentifyCns::ActiveNamespaceList { start_nsid } => command.namespace_ident = start_nsid,
        IdentifyCns::Controller => {}
    }

    command.data_ptr.prp_entry_1 = data;
    command
}

/// Controller id assigned by the NVM subsystem
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControllerId(pub u16);

/// Information about a Controller
///
/// Only the fields up to OACS are named.
///
/// See: NVM Express Base Spec: Figure 276: Identify Controller Data Structure
#[allow(missing_docs)]
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyControllerData {
    pub pci_vendor_id: u16,
    pub pci_subsystem_vendor_id: u16,
    pub serial_number: [u8; 20],
    pub model_number: [u8; 40],
    pub firmware_revison: [u8; 8],
    pub recommended_arbitration_burst: u8,
    pub ieee_oui_identifier: [u8; 3],
    pub cmic: u8,
    /// 2 ^ mdts pages, 0 means no limit
    pub maximum_data_transfer_size: u8,
    pub controller_id: ControllerId,
    pub version: u32,
    pub rtd3_resume_latency: u32,
    pub rtd3_entry_latency: u32,
    pub optional_async_events_supported: u32,
    pub controller_attributes: u32,
    pub read_recovery_levels_supported: u16,
    reserved1: [u8; 9],
    pub controller_type: u8,
    pub fru_guid: [u8; 16],
    pub command_retry_delay_times: [u16; 3],
    reserved2: [u8; 106],
    reserved3: [u8; 13],
    pub nvm_subsystem_report: u8,
    pub vpd_write_cycle_info: u8,
    pub management_endpoint_caps: u8,
    /// OACS
    pub optional_admin_commands: u16,
    reserved4: [u8; 4096 - 258],
}
const_assert_eq!(core::mem::size_of::<IdentifyControllerData>(), 4096);
const_assert_eq!(offset_of!(IdentifyControllerData, maximum_data_transfer_size), 77);
const_assert_eq!(offset_of!(IdentifyControllerData, version), 80);
const_assert_eq!(offset_of!(IdentifyControllerData, optional_admin_commands), 256);

impl IdentifyControllerData {
    /// OACS
    pub fn optional_admin_commands(&self) -> OptionalAdminCommands {
        OptionalAdminCommands::from_bits_retain(self.optional_admin_commands)
    }

    /// The maximum transfer size in bytes or `None` if there is no limit
    pub fn max_transfer_size(&self, min_page_size: u64) -> Option<u64> {
        if self.maximum_data_transfer_size == 0 {
            None
        } else {
            1u64.checked_shl(self.maximum_data_transfer_size as u32)
                .map(|pages| pages * min_page_size)
        }
    }

    /// Serial number with trailing padding removed
    pub fn serial_number(&self) -> String {
        ascii_field(&self.serial_number)
    }

    /// Model number with trailing padding removed
    pub fn model_number(&self) -> String {
        ascii_field(&self.model_number)
    }

    /// Firmware revision with trailing padding removed
    pub fn firmware_revision(&self) -> String {
        ascii_field(&self.firmware_revison)
    }

    /// Creates a zeroed structure. Used by simulated controllers
    pub fn zeroed() -> Self {
        unsafe {
            // Safety: plain integers and arrays of integers
            core::mem::zeroed()
        }
    }
}

/// Identify strings are ASCII padded with spaces
fn ascii_field(data: &[u8]) -> String {
    let end = data
        .iter()
        .rposition(|&c| c != b' ' && c != 0)
        .map_or(0, |last| last + 1);
    data[..end]
        .iter()
        .map(|&c| if c.is_ascii_graphic() || c == b' ' { c as char } else { '?' })
        .collect()
}

/// LBA Format Data Structure
///
/// See: NVM Command Set Spec: Figure 116: LBA Format Data Structure
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LbaFormat(pub u32);

impl LbaFormat {
    /// Creates a format with `2 ^ lbads` byte blocks and no metadata
    pub fn with_data_size(lbads: u8) -> Self {
        let mut value = 0u32;
        value.set_bits(16..=23, lbads as u32);
        Self(value)
    }

    /// metadata bytes per block
    pub fn metadata_size(&self) -> u16 {
        self.0.get_bits(0..=15) as u16
    }

    /// LBADS, log2 of the block size. 0 means the format is not supported
    pub fn data_size_log2(&self) -> u8 {
        self.0.get_bits(16..=23) as u8
    }

    /// relative performance, 0 is best
    pub fn relative_performance(&self) -> u8 {
        self.0.get_bits(24..=25) as u8
    }
}

/// Information about a Namespace
///
/// See: NVM Command Set Spec: Figure 114: Identify Namespace Data Structure
#[allow(missing_docs)]
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyNamespaceData {
    /// NSZE: total size in logical blocks
    pub namespace_size: u64,
    /// NCAP
    pub namespace_capacity: u64,
    /// NUSE
    pub namespace_utilization: u64,
    pub features: u8,
    /// NLBAF, 0 based
    pub number_of_lba_formats: u8,
    /// FLBAS
    pub formatted_lba_size: u8,
    pub metadata_capabilities: u8,
    pub end_to_end_protection_caps: u8,
    pub end_to_end_protection_settings: u8,
    pub multipath_caps: u8,
    pub reservation_caps: u8,
    reserved1: [u8; 96],
    /// LBAF0 - LBAF15
    pub lba_formats: [LbaFormat; 16],
    reserved2: [u8; 4096 - 192],
}
const_assert_eq!(core::mem::size_of::<IdentifyNamespaceData>(), 4096);
const_assert_eq!(offset_of!(IdentifyNamespaceData, formatted_lba_size), 26);
const_assert_eq!(offset_of!(IdentifyNamespaceData, lba_formats), 128);

impl IdentifyNamespaceData {
    /// The index of the active [LbaFormat], FLBAS bits 0..=3
    pub fn active_lba_format_index(&self) -> usize {
        self.formatted_lba_size.get_bits(0..=3) as usize
    }

    /// The active [LbaFormat]
    pub fn active_lba_format(&self) -> LbaFormat {
        self.lba_formats[self.active_lba_format_index()]
    }

    /// Creates a zeroed structure. Used by simulated controllers
    pub fn zeroed() -> Self {
        unsafe {
            // Safety: plain integers and arrays of integers
            core::mem::zeroed()
        }
    }
}

/// The number of namespace ids in an active namespace list
pub const NAMESPACE_LIST_LEN: usize = 1024;
