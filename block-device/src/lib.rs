//! Library containing Structs and Traits used to Access a BlockDevice
//!
//! A block device is a virtual or hardware device that can be read and written
//! to in blocks of a fixed size. A [StorageController] owns one or more of them.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use core::error::Error;

use log::error;

mod structs;
pub use structs::*;

#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
pub enum ReadBlockDeviceError<BDError: Error + Send + Sync + 'static> {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BDError),
    #[error("buffer of {size} bytes can not hold the {expected} bytes requested")]
    BufferTooSmall { expected: usize, size: usize },
    #[error("{group:?} is outside of the device with {block_count} blocks")]
    OutOfRange { group: BlockGroup, block_count: u64 },
}

#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
pub enum WriteBlockDeviceError<BDError: Error + Send + Sync + 'static> {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BDError),
    #[error("expected to write {expected} bytes but only got {size}")]
    NotEnoughData { expected: usize, size: usize },
    #[error("{group:?} is outside of the device with {block_count} blocks")]
    OutOfRange { group: BlockGroup, block_count: u64 },
}

/// A block device
///
/// this represents a virtual or hardware device that can be read and written to
/// in fixed size blocks. Unlike a file the block size is only known at runtime.
pub trait BlockDevice {
    /// A gerneric error returned by the block device
    type BlockDeviceError: Error + Send + Sync + 'static;

    /// The block size of the device in bytes
    fn block_size(&self) -> usize;

    /// Returns the number of blocks in the [BlockDevice]
    fn block_count(&self) -> u64;

    /// Read multiple contigious blocks from the device
    ///
    /// `buffer` must have a length of at least `block_size * group.count()`
    fn read_blocks(
        &self,
        group: BlockGroup,
        buffer: &mut [u8],
    ) -> Result<(), ReadBlockDeviceError<Self::BlockDeviceError>>;

    /// Write multiple contigious blocks to the device
    ///
    /// `data` must have a length of at least `block_size * group.count()`
    fn write_blocks(
        &self,
        group: BlockGroup,
        data: &[u8],
    ) -> Result<(), WriteBlockDeviceError<Self::BlockDeviceError>>;

    /// Read a single block from the device into `buffer`
    fn read_block(
        &self,
        lba: LBA,
        buffer: &mut [u8],
    ) -> Result<(), ReadBlockDeviceError<Self::BlockDeviceError>> {
        self.read_blocks(BlockGroup::new(lba, lba), buffer)
    }

    /// Write a single block to the device
    fn write_block(
        &self,
        lba: LBA,
        data: &[u8],
    ) -> Result<(), WriteBlockDeviceError<Self::BlockDeviceError>> {
        self.write_blocks(BlockGroup::new(lba, lba), data)
    }

    /// the address of the last valid block on the device
    fn last_lba(&self) -> Option<LBA> {
        self.block_count().checked_sub(1).and_then(LBA::new)
    }

    /// Checks that `group` is within the device, returns the size of `group` in bytes
    fn check_range(&self, group: BlockGroup) -> Option<usize> {
        let block_count = self.block_count();
        if group.end().get() >= block_count {
            error!(
                "{:?} is outside of the block device with {} blocks",
                group, block_count
            );
            return None;
        }
        usize::try_from(group.bytes(self.block_size())).ok()
    }
}

/// A storage controller exposing a number of [BlockDevice]s
///
/// The devices are indexed from `0` to `devices_count() - 1`.
pub trait StorageController {
    /// Error returned by controller wide operations
    type ControllerError: Error + Send + Sync + 'static;

    /// The device handle given out by [Self::device]
    type Device<'a>: BlockDevice
    where
        Self: 'a;

    /// The number of devices on this controller
    fn devices_count(&self) -> usize;

    /// Returns the device at `index` or `None` if `index >= devices_count()`
    fn device(&self, index: usize) -> Option<Self::Device<'_>>;

    /// Reset the controller. Commands in flight are lost.
    fn reset(&self) -> Result<(), Self::ControllerError>;

    /// Shut the controller down. No devices can be accessed afterwards.
    fn shutdown(&self) -> Result<(), Self::ControllerError>;
}
