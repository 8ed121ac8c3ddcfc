use bit_field::BitField;
use log::trace;
use shared_derive::U8Enum;
use x86_64::PhysAddr;

use crate::{
    generic_command::{CommandStatusCode, CommonCommand},
    platform::IrqVector,
    queue::QueueIdentifier,
};

use super::CommandOpcode;

/// Create the [CommonCommand] for a Create I/O Completion Queue command.
///
/// The queue memory at `paddr` must be physically contiguous. If `interrupt` is
/// `Some` the controller raises that vector whenever it posts a completion.
///
/// See: NVM Express Base Spec: 5.4 Create I/O Completion Queue command
pub fn create_io_completion_queue(
    queue_ident: QueueIdentifier,
    queue_size: u16,
    paddr: PhysAddr,
    interrupt: Option<IrqVector>,
) -> CommonCommand {
    trace!(
        "create io completion queue command, ident: {:?}, size: {}, interrupt: {:?}",
        queue_ident,
        queue_size,
        interrupt
    );

    let mut command = CommonCommand::with_opcode(CommandOpcode::CreateIOCompletionQueue as u8);
    command.data_ptr.prp_entry_1 = paddr;

    let mut dword10: u32 = 0;
    dword10.set_bits(0..=15, queue_ident.as_u16() as u32);
    // Convert into 0 based value
    assert!(queue_size > 1);
    dword10.set_bits(16..=31, (queue_size - 1) as u32);
    command.dword10 = dword10;

    let mut dword11: u32 = 0;
    if let Some(vector) = interrupt {
        dword11.set_bits(16..=31, vector.0 as u32);
        dword11.set_bit(1, true);
    }
    dword11.set_bit(0, true); // memory is phys contiguous
    command.dword11 = dword11;

    command
}

/// Create the [CommonCommand] for a Create I/O Submission Queue command.
///
/// `completion_queue` must already exist on the controller.
///
/// See: NVM Express Base Spec: 5.5 Create I/O Submission Queue command
pub fn create_io_submission_queue(
    queue_ident: QueueIdentifier,
    queue_size: u16,
    paddr: PhysAddr,
    completion_queue: QueueIdentifier,
) -> CommonCommand {
    trace!(
        "create io submission queue command, ident: {:?}, size: {}",
        queue_ident,
        queue_size
    );

    let mut command = CommonCommand::with_opcode(CommandOpcode::CreateIOSubmissionQueue as u8);
    command.data_ptr.prp_entry_1 = paddr;

    let mut dword10: u32 = 0;
    dword10.set_bits(0..=15, queue_ident.as_u16() as u32);
    // Convert into 0 based value
    assert!(queue_size > 1);
    dword10.set_bits(16..=31, (queue_size - 1) as u32);
    command.dword10 = dword10;

    let mut dword11: u32 = 0;
    dword11.set_bits(16..=31, completion_queue.as_u16() as u32);
    dword11.set_bits(1..=2, 0b10); // queue priority, ignored, but we set a default of medium anyways
    dword11.set_bit(0, true); // memory is phys contiguous
    command.dword11 = dword11;

    command
}

/// Create the [CommonCommand] for a Delete I/O Submission Queue command.
///
/// See: NVM Express Base Spec: 5.7 Delete I/O Submission Queue command
pub fn delete_io_submission_queue(queue_ident: QueueIdentifier) -> CommonCommand {
    trace!("delete io submission queue command, ident: {:?}", queue_ident);
    let mut command = CommonCommand::with_opcode(CommandOpcode::DeleteIOSubmissionQueue as u8);
    command.dword10 = queue_ident.as_u16() as u32;
    command
}

/// Create the [CommonCommand] for a Delete I/O Completion Queue command.
///
/// All submission queues using the completion queue must be deleted first.
///
/// See: NVM Express Base Spec: 5.6 Delete I/O Completion Queue command
pub fn delete_io_completion_queue(queue_ident: QueueIdentifier) -> CommonCommand {
    trace!("delete io completion queue command, ident: {:?}", queue_ident);
    let mut command = CommonCommand::with_opcode(CommandOpcode::DeleteIOCompletionQueue as u8);
    command.dword10 = queue_ident.as_u16() as u32;
    command
}

/// Command specific status values of the create queue commands
///
/// See: NVM Express Base Spec: Figure 154 and Figure 158
#[allow(missing_docs)]
#[repr(u8)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, U8Enum)]
pub enum QueueCreationStatus {
    /// only returned when creating a submission queue
    InvalidCompletionQueue = 0x0,
    InvalidIdentifier = 0x1,
    InvalidSize = 0x2,
    /// only returned when creating a completion queue
    InvalidInterruptVector = 0x8,
}

impl QueueCreationStatus {
    /// Decode the command specific part of a failed queue creation
    pub fn from_status(status: CommandStatusCode) -> Option<Self> {
        match status {
            CommandStatusCode::CommandSpecificStatus(code) => code.try_into().ok(),
            _ => None,
        }
    }
}
