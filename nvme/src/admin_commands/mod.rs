//! NVMe admin command set
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification

use shared_derive::U8Enum;

mod doorbell_buffer;
mod identify;
mod io_queue;

pub use doorbell_buffer::*;
pub use identify::*;
pub use io_queue::*;

/// Opcode for the different commands
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum CommandOpcode {
    DeleteIOSubmissionQueue = 0x0,
    CreateIOSubmissionQueue = 0x1,
    GetLogPage = 0x2,
    DeleteIOCompletionQueue = 0x4,
    CreateIOCompletionQueue = 0x5,
    Identify = 0x6,
    Abort = 0x8,
    SetFeatures = 0x9,
    GetFeatures = 0xa,
    AsynchronousEventRequest = 0xc,
    KeepAlive = 0x18,
    DoorbellBufferConfig = 0x7c,
}
