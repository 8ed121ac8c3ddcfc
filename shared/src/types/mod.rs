//! common type definitions

mod coreid;

pub use coreid::CoreId;
