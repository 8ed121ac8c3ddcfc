//! NVMe namespaces exposed as [BlockDevice]s
//!
//! See: NVM Command Set Spec: 4.1.5.1 Identify Namespace data structure

use block_device::{BlockDevice, BlockGroup, ReadBlockDeviceError, WriteBlockDeviceError};
use derive_where::derive_where;
use log::debug;

use crate::{
    admin_commands::IdentifyNamespaceData,
    controller::{NvmeController, Transfer},
    platform::Platform,
    NvmeError, PAGE_SIZE,
};

/// The smallest logical block size the driver supports, LBADS 9
const MIN_BLOCK_SIZE_LOG2: u8 = 9;

/// A namespace on a [NvmeController]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    nsid: u32,
    block_count: u64,
    block_size: usize,
}

impl Namespace {
    /// Decode the result of an identify namespace command for `nsid`.
    ///
    /// Fails with [NvmeError::DeviceNotSupported] if the active LBA format is
    /// not described or uses blocks smaller than 512 bytes or larger than a page.
    pub fn from_identify(nsid: u32, data: &IdentifyNamespaceData) -> Result<Self, NvmeError> {
        let format_index = data.active_lba_format_index();
        if format_index > data.number_of_lba_formats as usize {
            return Err(NvmeError::DeviceNotSupported(
                "namespace uses an undescribed LBA format",
            ));
        }
        let lbads = data.active_lba_format().data_size_log2();
        if lbads < MIN_BLOCK_SIZE_LOG2 {
            return Err(NvmeError::DeviceNotSupported(
                "logical blocks smaller than 512 bytes",
            ));
        }
        let block_size = 1usize << lbads;
        if block_size > PAGE_SIZE {
            return Err(NvmeError::DeviceNotSupported(
                "logical blocks larger than a page",
            ));
        }

        debug!(
            "namespace {nsid}: {} blocks of {block_size} bytes, lba format {format_index}",
            data.namespace_size
        );

        Ok(Self {
            nsid,
            block_count: data.namespace_size,
            block_size,
        })
    }

    /// The namespace identifier
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// NSZE, the number of logical blocks
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// bytes per logical block
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

/// A [Namespace] together with the controller it belongs to
#[derive_where(Debug)]
pub struct NamespaceHandle<'a, P: Platform> {
    #[derive_where(skip)]
    controller: &'a NvmeController<P>,
    namespace: Namespace,
}

impl<'a, P: Platform> NamespaceHandle<'a, P> {
    pub(crate) fn new(controller: &'a NvmeController<P>, namespace: Namespace) -> Self {
        Self {
            controller,
            namespace,
        }
    }

    /// The underlying [Namespace]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

impl<P: Platform> BlockDevice for NamespaceHandle<'_, P> {
    type BlockDeviceError = NvmeError;

    fn block_size(&self) -> usize {
        self.namespace.block_size
    }

    fn block_count(&self) -> u64 {
        self.namespace.block_count
    }

    fn read_blocks(
        &self,
        group: BlockGroup,
        buffer: &mut [u8],
    ) -> Result<(), ReadBlockDeviceError<NvmeError>> {
        let len = self
            .check_range(group)
            .ok_or(ReadBlockDeviceError::OutOfRange {
                group,
                block_count: self.namespace.block_count,
            })?;
        if buffer.len() < len {
            return Err(ReadBlockDeviceError::BufferTooSmall {
                expected: len,
                size: buffer.len(),
            });
        }

        self.controller
            .transfer(&self.namespace, group, Transfer::Read(&mut buffer[..len]))?;
        Ok(())
    }

    fn write_blocks(
        &self,
        group: BlockGroup,
        data: &[u8],
    ) -> Result<(), WriteBlockDeviceError<NvmeError>> {
        let len = self
            .check_range(group)
            .ok_or(WriteBlockDeviceError::OutOfRange {
                group,
                block_count: self.namespace.block_count,
            })?;
        if data.len() < len {
            return Err(WriteBlockDeviceError::NotEnoughData {
                expected: len,
                size: data.len(),
            });
        }

        self.controller
            .transfer(&self.namespace, group, Transfer::Write(&data[..len]))?;
        Ok(())
    }
}
