use x86_64::PhysAddr;

use crate::generic_command::CommonCommand;

use super::{create_transfer_command, CommandOpcode};

/// Create the [CommonCommand] data structure for a write command
///
/// `block_count` blocks starting at `slba` are written with the data in the page at `data`.
///
/// See: NVM Command Set Spec: 3.2.6
pub fn create_write_command(
    nsid: u32,
    data: PhysAddr,
    slba: u64,
    block_count: u16,
) -> CommonCommand {
    create_transfer_command(CommandOpcode::Write, nsid, data, slba, block_count)
}
