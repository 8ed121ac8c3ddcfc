//! NVMe Controller Capabilities
//!
//! This describes what a controller reported about itself during bring-up
//!
//! The specification documents can be found at https://nvmexpress.org/specifications/
//! specifically: NVM Express Base Specification

use alloc::string::String;

use bitflags::bitflags;

use crate::{
    admin_commands::{ControllerId, IdentifyControllerData},
    platform::PciDeviceId,
    properties::Version,
};

/// Information about a [crate::NvmeController]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    /// vendor and device of the PCI function
    pub pci_id: PciDeviceId,
    /// the implemented NVMe version
    pub version: Version,
    /// PCI vendor id reported by identify
    pub vendor_id: u16,
    #[allow(missing_docs)]
    pub serial_number: String,
    #[allow(missing_docs)]
    pub model_number: String,
    #[allow(missing_docs)]
    pub firmware_revision: String,
    /// maximum bytes per data transfer, `None` if unlimited
    pub max_transfer_size: Option<u64>,
    #[allow(missing_docs)]
    pub controller_id: ControllerId,
    /// OACS
    pub optional_admin_commands: OptionalAdminCommands,
}

impl ControllerInfo {
    pub(crate) fn from_identify(
        pci_id: PciDeviceId,
        version: Version,
        data: &IdentifyControllerData,
        min_page_size: u64,
    ) -> Self {
        Self {
            pci_id,
            version,
            vendor_id: data.pci_vendor_id,
            serial_number: data.serial_number(),
            model_number: data.model_number(),
            firmware_revision: data.firmware_revision(),
            max_transfer_size: data.max_transfer_size(min_page_size),
            controller_id: data.controller_id,
            optional_admin_commands: data.optional_admin_commands(),
        }
    }

    /// returns `true` if the controller supports shadow doorbells
    pub fn supports_shadow_doorbells(&self) -> bool {
        self.optional_admin_commands
            .contains(OptionalAdminCommands::DOORBELL_BUFFER_CONFIG)
    }
}

bitflags! {
    /// Bitflag describing the optional admin commands supported a controller
    ///
    /// See: NVM Express Base Spec: Figure 276: Identify Controller Data Structure: OACS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[allow(missing_docs)]
    pub struct OptionalAdminCommands: u16 {
        const SECURITY_SEND_RECEIVE = 1;
        const FORMAT_NVM = 1 << 1;
        const FIRMWARE_DOWNLOAD_COMMIT = 1 << 2;
        const NAMESPACE_MANAGMENT = 1 << 3;
        const DEVICE_SELF_TEST = 1 << 4;
        const DIRECTIVES = 1 << 5;
        const NVME_MI = 1 << 6;
        const VIRTUALIZATION_MANAGEMENT = 1 << 7;
        const DOORBELL_BUFFER_CONFIG = 1 << 8;
        const GET_LBA_STATUS = 1 << 9;
        const COMMAND_AND_FEATURE_LOCKDOWN = 1 << 10;

        const _ = !0;
    }
}
