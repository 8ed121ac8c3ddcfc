//! utilites for the primitive enum proc-macros in `shared-derive`

use thiserror::Error;

/// Error type used to denote that a given value does not map to any enum variant
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid value: {value:#x}")]
pub struct InvalidValue<T: core::fmt::LowerHex + core::fmt::Debug> {
    /// the invalid value
    pub value: T,
}
