//! Small `no_std` helpers shared by the driver crates.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod lockcell;
pub mod math;
pub mod primitive_enum;
pub mod types;
