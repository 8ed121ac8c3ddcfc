//! NVMe io command set
//!
//! The specification documents can be found at https://nvmexpress.org/specifications/
//! specifically: NVM Command Set

use bit_field::BitField;
use shared_derive::U8Enum;
use x86_64::PhysAddr;

use crate::generic_command::CommonCommand;

mod read;
mod write;

pub use read::*;
pub use write::*;

/// Opcode for the different commands
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum CommandOpcode {
    Flush = 0x0,
    Write = 0x1,
    Read = 0x2,
    WriteUncorrectable = 0x4,
    Compare = 0x5,
    WriteZeroes = 0x8,
    DatasetManagment = 0x9,
    Verify = 0xc,
}

/// Shared layout of the read and write commands
///
/// See: NVM Command Set Spec: 3.2.4 and 3.2.6
fn create_transfer_command(
    opcode: CommandOpcode,
    nsid: u32,
    data: PhysAddr,
    slba: u64,
    block_count: u16,
) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(opcode as u8);
    command.namespace_ident = nsid;
    command.data_ptr.prp_entry_1 = data;

    command.dword10 = slba.get_bits(0..=31) as u32;
    command.dword11 = slba.get_bits(32..=63) as u32;

    // set block count as 0 based value
    assert!(block_count > 0);
    let mut dword12 = 0u32;
    dword12.set_bits(0..=15, (block_count - 1) as u32);
    command.dword12 = dword12;

    command
}
