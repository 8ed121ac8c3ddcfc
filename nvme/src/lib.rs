//! Driver for NVMe storage controllers attached over PCI
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification, NVM Command Set Specification and
//! NVMe over PCIe Transport Specification.
//!
//! The driver is split into
//!  * [properties]: the controller register block
//!  * [generic_command], [admin_commands], [io_commands]: the command wire format
//!  * [doorbell]: MMIO and shadow doorbells
//!  * [queue]: the submission/completion ring protocol
//!  * [controller]: bring-up, reset and shutdown of a controller
//!  * [namespace]: the block devices exposed by a controller
//!
//! All access to the machine goes through the collaborator traits in [platform].

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod admin_commands;
pub mod capabilities;
pub mod config;
pub mod controller;
pub mod dma;
pub mod doorbell;
pub mod generic_command;
pub mod io_commands;
pub mod namespace;
pub mod platform;
pub mod properties;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_utils;

use core::time::Duration;

use thiserror::Error;

pub use config::{ControllerConfig, QueueMode};
pub use controller::NvmeController;
pub use generic_command::{
    CommandIdentifier, CommandStatusCode, CommonCommand, CommonCompletionEntry,
    GenericCommandStatus,
};
pub use namespace::{Namespace, NamespaceHandle};
pub use platform::{Platform, PlatformError};
pub use queue::{CommandQueue, QueueIdentifier};

/// The page size used for all queues and data transfers
pub const PAGE_SIZE: usize = 4096;

/// Errors returned by the nvme driver
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NvmeError {
    #[error("CSTS.RDY did not become {expected_ready} within {waited:?}")]
    HardwareTimeout {
        expected_ready: bool,
        waited: Duration,
    },
    #[error("NVMe admin command failed: {0}")]
    AdminCommandFailed(CommandStatusCode),
    #[error("NVMe io command failed: {0}")]
    CommandFailed(CommandStatusCode),
    #[error("copy out of DMA memory failed")]
    DmaFault,
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] PlatformError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),
    #[error("Command queue is full")]
    QueueFull,
    #[error("no completion for command {0:#x} within the timeout")]
    CommandTimeout(CommandIdentifier),
    #[error("command {0:#x} was dropped by a controller reset")]
    CommandLost(CommandIdentifier),
    #[error("Queue size of {0:#x} is not valid for this queue!")]
    InvalidQueueSize(u16),
    #[error("the device is not supported: {0}")]
    DeviceNotSupported(&'static str),
    #[error("the controller is not running")]
    NotReady,
    #[error("controller did not complete the shutdown within {0:?}")]
    ShutdownIncomplete(Duration),
}

/// Device or driver misbehavior detected while draining a completion queue.
///
/// These are never recovered from, the controller needs to be reset.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("completion for unknown command identifier {cid:#x} on queue {queue:?}")]
    UnknownCommandIdentifier {
        queue: QueueIdentifier,
        cid: CommandIdentifier,
    },
    #[error("completion on queue {queue:?} reports submission queue {reported:?}")]
    SubmissionQueueMismatch {
        queue: QueueIdentifier,
        reported: QueueIdentifier,
    },
    #[error("completion on queue {queue:?} reports head {head} for a queue of depth {depth}")]
    SubmissionHeadOutOfRange {
        queue: QueueIdentifier,
        head: u16,
        depth: u16,
    },
}
