//! Data shared between all Command types
//!

use core::fmt;

use bit_field::BitField;
use shared_derive::U8Enum;
use static_assertions::const_assert_eq;
use thiserror::Error;
use x86_64::PhysAddr;

use crate::queue::QueueIdentifier;

/// Identifies a command within a queue.
///
/// The value is chosen by the driver on submission and reported back by the
/// controller in the matching [CommonCompletionEntry].
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct CommandIdentifier(pub(crate) u16);

impl CommandIdentifier {
    /// The raw identifier
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::LowerHex for CommandIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for CommandIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

/// The size of all submission command entries
pub const SUBMISSION_COMMAND_ENTRY_SIZE: usize = core::mem::size_of::<CommonCommand>();
const_assert_eq!(SUBMISSION_COMMAND_ENTRY_SIZE, 64);

/// log2 of [SUBMISSION_COMMAND_ENTRY_SIZE] as used by CC.IOSQES
pub const SUBMISSION_COMMAND_ENTRY_SIZE_LOG2: u8 = SUBMISSION_COMMAND_ENTRY_SIZE.ilog2() as u8;

/// Command layout shared by all commands
///
/// See: NVM Express Base Spec: Figure 88: Common Command Format
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommonCommand {
    pub dword0: CDW0,
    /// NSID
    pub namespace_ident: u32,
    pub dword2: u32,
    pub dword3: u32,
    pub metadata_ptr: u64,
    pub data_ptr: DataPtr,
    pub dword10: u32,
    pub dword11: u32,
    pub dword12: u32,
    pub dword13: u32,
    pub dword14: u32,
    pub dword15: u32,
}

impl CommonCommand {
    /// A command with `opcode` using PRPs for data transfer.
    ///
    /// The command identifier is assigned on submission.
    pub fn with_opcode(opcode: u8) -> Self {
        let mut dword0 = CDW0::zero();
        dword0.set_opcode(opcode);
        dword0.set_prp_or_sgl(PrpOrSgl::Prp);
        Self {
            dword0,
            ..Default::default()
        }
    }
}

/// The first command dword in a [CommonCommand]
///
/// this implementation is shared between all commands
///
/// See: NVM Express Base Spec: Figure 87: Command Dword 0
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CDW0(u32);

#[allow(missing_docs)]
impl CDW0 {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn opcode(&self) -> u8 {
        self.0.get_bits(0..=7) as u8
    }

    pub fn set_opcode(&mut self, value: u8) {
        self.0.set_bits(0..=7, value as u32);
    }

    pub fn fuse(&self) -> u8 {
        self.0.get_bits(8..=9) as u8
    }

    /// PSDT
    pub fn prp_or_sgl(&self) -> Result<PrpOrSgl, shared::primitive_enum::InvalidValue<u8>> {
        (self.0.get_bits(14..=15) as u8).try_into()
    }

    pub fn set_prp_or_sgl(&mut self, value: PrpOrSgl) {
        self.0.set_bits(14..=15, value as u8 as u32);
    }

    pub fn command_identifier(&self) -> CommandIdentifier {
        CommandIdentifier(self.0.get_bits(16..=31) as u16)
    }

    pub fn set_command_identifier(&mut self, value: CommandIdentifier) {
        self.0.set_bits(16..=31, value.0 as u32);
    }
}

/// specifies whether a command uses PRPs or SGLs for data transfer
///
/// Only PRPs are ever used by this driver. The SGL variants exist so that
/// a command read back from memory can be decoded.
///
/// See: NVM Express Base Spec: Figure 87: Command Dword 0
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, U8Enum, Clone, Copy, PartialEq, Eq)]
pub enum PrpOrSgl {
    Prp = 0,
    SglMetaContiguBuffer = 0b01,
    SglIncludingMeta = 0b10,
}

/// The PRP entries of a command
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPtr {
    pub prp_entry_1: PhysAddr,
    pub prp_entry_2: PhysAddr,
}

impl Default for DataPtr {
    fn default() -> Self {
        DataPtr {
            prp_entry_1: PhysAddr::zero(),
            prp_entry_2: PhysAddr::zero(),
        }
    }
}

/// The size of all completion command entries
pub const COMPLETION_COMMAND_ENTRY_SIZE: usize = core::mem::size_of::<CommonCompletionEntry>();
const_assert_eq!(COMPLETION_COMMAND_ENTRY_SIZE, 16);

/// log2 of [COMPLETION_COMMAND_ENTRY_SIZE] as used by CC.IOCQES
pub const COMPLETION_COMMAND_ENTRY_SIZE_LOG2: u8 = COMPLETION_COMMAND_ENTRY_SIZE.ilog2() as u8;

/// Common layout shared by all completion entries
///
/// See: NVM Express Base Spec: Figure 90: Common Completion Queue Entry Layout
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommonCompletionEntry {
    /// command specific result
    pub dword0: u32,
    pub dword1: u32,
    /// SQHD
    pub submission_queue_head: u16,
    pub submission_queue_ident: QueueIdentifier,
    pub command_ident: CommandIdentifier,
    pub status_and_phase: StatusAndPhase,
}

impl CommonCompletionEntry {
    /// Decode the status field
    pub fn status(&self) -> CommandStatusCode {
        let status = self.status_and_phase;
        match status.status_code_type() {
            0 => {
                if let Ok(status) = GenericCommandStatus::try_from(status.status_code()) {
                    CommandStatusCode::GenericStatus(status)
                } else {
                    CommandStatusCode::UnknownGenericStatus(status.status_code())
                }
            }
            1 => CommandStatusCode::CommandSpecificStatus(status.status_code()),
            2 => CommandStatusCode::MediaAndDataIntegrityError(status.status_code()),
            3 => CommandStatusCode::PathRelatedStatus(status.status_code()),
            7 => CommandStatusCode::VendorSpecific(status.status_code()),
            typ => CommandStatusCode::Reserved {
                typ,
                status: status.status_code(),
            },
        }
    }
}

/// Status and Phase of a [CommonCompletionEntry]
///
/// See: NVM Express Base Spec: Figure 93: Completion Queue Entry: Status Field
// This struct uses a u16. The NVMe base specification combines this field, with the command identifier
// into a u32. Therefor bit 16 of that dword is represented as bit 0 in this struct.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusAndPhase(u16);

#[allow(missing_docs)]
impl StatusAndPhase {
    /// Creates a status field. Only used by simulated controllers.
    pub fn new(phase: bool, status_code_type: u8, status_code: u8) -> Self {
        let mut value = 0u16;
        value.set_bit(0, phase);
        value.set_bits(1..=8, status_code as u16);
        value.set_bits(9..=11, status_code_type as u16);
        Self(value)
    }

    pub fn phase(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn status_code(&self) -> u8 {
        self.0.get_bits(1..=8) as u8
    }

    pub fn status_code_type(&self) -> u8 {
        self.0.get_bits(9..=11) as u8
    }

    pub fn common_retry_delay(&self) -> u8 {
        self.0.get_bits(12..=13) as u8
    }

    pub fn more(&self) -> bool {
        self.0.get_bit(14)
    }

    pub fn do_not_retry(&self) -> bool {
        self.0.get_bit(15)
    }
}

/// StatusCode of an [CommonCompletionEntry]
///
/// See: NVM Express Base Spec: Figure 94: Status Code Type Values
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandStatusCode {
    #[error("Generic Command Error: {0:?}")]
    GenericStatus(GenericCommandStatus),
    #[error("Unknown Generic Command Error: {0:#x}")]
    UnknownGenericStatus(u8),
    #[error("Command specific error: {0:#x}")]
    CommandSpecificStatus(u8),
    #[error("Media and Data integrity error: {0:#x}")]
    MediaAndDataIntegrityError(u8),
    #[error("Path related error: {0:#x}")]
    PathRelatedStatus(u8),
    #[error("Reserved error: type {typ:#x}, code {status:#x}")]
    Reserved { typ: u8, status: u8 },
    #[error("Vendor specific error: {0:#x}")]
    VendorSpecific(u8),
}

impl CommandStatusCode {
    /// returns `true` if the status represents any type of error
    #[inline]
    pub fn is_err(self) -> bool {
        !self.is_success()
    }

    /// returns `true` if the status does not represents any type of error
    ///
    /// This is `true` for [GenericCommandStatus::Success]
    #[inline]
    pub fn is_success(self) -> bool {
        self == CommandStatusCode::GenericStatus(GenericCommandStatus::Success)
    }

    /// Converts the status into a result, using `error` for any failure
    #[inline]
    pub fn into_result<E>(self, error: impl FnOnce(Self) -> E) -> Result<(), E> {
        if self.is_success() {
            Ok(())
        } else {
            Err(error(self))
        }
    }
}

/// Generic Error Code of an [CommonCompletionEntry]
///
/// See: NVM Express Base Spec: Figure 95: Generic Command Status Values
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum GenericCommandStatus {
    Success = 0,
    InvalidCommandOpcode = 1,
    InvalidFieldInCommand = 2,
    CommandIdConflict = 3,
    DataTransferError = 4,
    CommandAbortedPowerLoss = 5,
    InternalError = 6,
    AbortRequested = 7,
    AbortSQDeletion = 8,
    AbortFailedFuse = 9,
    AbortMissingFues = 0xa,
    InvalidNamespaceFormat = 0xb,
    SequenceError = 0xc,
    InvalidSgl = 0xd,
    InvalidSglCount = 0xe,
    InvalidSglLength = 0xf,
    InvalidMetadataSglLength = 0x10,
    InvalidSglType = 0x11,
    InvalidUseOfControllerMemBuf = 0x12,
    InvaldPrpOffset = 0x13,
    AtomicWriteExceeded = 0x14,
    OperationDenied = 0x15,
    InvalidSglOffset = 0x16,
    // reserved 0x17
    HostIdInconsistentFormat = 0x18,
    KeepAliveExpired = 0x19,
    InvalidKeepAliveTimeout = 0x1a,
    AbortDueToPreemptAbort = 0x1b,
    SanitiizeFaild = 0x1c,
    SanitizeInProgress = 0x1d,
    InvalidSglBlockGranularity = 0x1e,
    NotSupportedForQueueInCMB = 0x1f,
    NamespaceWriteProtected = 0x20,
    Interrupted = 0x21,
    TransientTransportError = 0x22,
    ProhibitedByLockdown = 0x23,
    AdminCommandMediaNotReady = 0x24,
    // reserved 0x25 .. 0x7f
    LbaOutOfRange = 0x80,
    CapacityExceeded = 0x81,
    NamespaceNotReady = 0x82,
    ReservationConflict = 0x83,
    FormatInProgress = 0x84,
    // Rserved 0x85 .. 0xbf
    // Vendor Specific 0xc0 .. 0xff
}
