use x86_64::PhysAddr;

use crate::generic_command::CommonCommand;

use super::{create_transfer_command, CommandOpcode};

/// Create the [CommonCommand] data structure for a read command
///
/// The data of `block_count` blocks starting at `slba` is written to the page at `data`.
/// The transfer must fit within that page.
///
/// See: NVM Command Set Spec: 3.2.4
pub fn create_read_command(nsid: u32, data: PhysAddr, slba: u64, block_count: u16) -> CommonCommand {
    create_transfer_command(CommandOpcode::Read, nsid, data, slba, block_count)
}
