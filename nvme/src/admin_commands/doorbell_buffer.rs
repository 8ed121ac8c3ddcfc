use x86_64::PhysAddr;

use crate::generic_command::CommonCommand;

use super::CommandOpcode;

/// Create the [CommonCommand] for the Doorbell Buffer Config command.
///
/// `shadow` receives the doorbell values written by the host, `event_index` the
/// values at which the controller wants an MMIO doorbell write. Both must be
/// page aligned and are used at the same offsets as the MMIO doorbell registers.
///
/// See: NVM Express Base Spec: 5.8 Doorbell Buffer Config command
pub fn create_doorbell_buffer_config_command(
    shadow: PhysAddr,
    event_index: PhysAddr,
) -> CommonCommand {
    debug_assert!(shadow.is_aligned(4096u64));
    debug_assert!(event_index.is_aligned(4096u64));

    let mut command = CommonCommand::with_opcode(CommandOpcode::DoorbellBufferConfig as u8);
    command.data_ptr.prp_entry_1 = shadow;
    command.data_ptr.prp_entry_2 = event_index;
    command
}
