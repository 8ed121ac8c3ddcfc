//! Bring-up, reset and shutdown of an NVMe controller
//!
//! See: NVM Express Base Specification: 3.5.1
//!         Memory-based Transport Controller Initialization

use alloc::{sync::Arc, vec::Vec};
use core::{
    num::NonZeroU64,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use block_device::{BlockGroup, StorageController};
use derive_where::derive_where;
use log::{debug, error, info, trace, warn};
use shared::lockcell::{LockCell, SpinLock};

use crate::{
    admin_commands::{
        create_doorbell_buffer_config_command, create_identify_command,
        create_io_completion_queue, create_io_submission_queue, delete_io_completion_queue,
        delete_io_submission_queue, IdentifyCns, IdentifyControllerData, IdentifyNamespaceData,
        QueueCreationStatus, NAMESPACE_LIST_LEN,
    },
    capabilities::ControllerInfo,
    config::{ControllerConfig, QueueMode, ADMIN_POLL_INTERVAL, IO_POLL_INTERVAL, READY_POLL_INTERVAL},
    dma::DmaBuffer,
    doorbell::{Doorbell, ShadowCells},
    generic_command::{
        CommonCommand, CommonCompletionEntry, COMPLETION_COMMAND_ENTRY_SIZE_LOG2,
        SUBMISSION_COMMAND_ENTRY_SIZE_LOG2,
    },
    io_commands::{create_read_command, create_write_command},
    namespace::{Namespace, NamespaceHandle},
    platform::{IrqType, IrqVector, PciDeviceId, Platform},
    properties::{
        doorbell_offset, AdminQueueAttributes, ArbitrationMechanism, Capabilities,
        RegisterBlock, ShutdownNotification, ShutdownStatus, Version,
    },
    queue::{self, CommandQueue, QueueIdentifier, MAX_QUEUE_DEPTH},
    NvmeError, PAGE_SIZE,
};

/// An io queue together with the page used to stage its transfers
#[derive_where(Debug)]
struct IoQueue<P: Platform> {
    vector: IrqVector,
    queue: SpinLock<CommandQueue<P>>,
    bounce: SpinLock<DmaBuffer<P>>,
}

/// The pages configured with the doorbell buffer config command
#[derive_where(Debug)]
struct ShadowDoorbells<P: Platform> {
    shadow: DmaBuffer<P>,
    event_index: DmaBuffer<P>,
}

impl<P: Platform> ShadowDoorbells<P> {
    fn cells(&self, queue: QueueIdentifier, stride: u8, completion: bool) -> ShadowCells {
        let offset = doorbell_offset(queue, stride, completion);
        ShadowCells {
            shadow: self.shadow.vaddr() + offset,
            event_index: self.event_index.vaddr() + offset,
        }
    }
}

/// The direction and host buffer of an io transfer
pub(crate) enum Transfer<'b> {
    Read(&'b mut [u8]),
    Write(&'b [u8]),
}

/// Provides communication with an NVMe storage controller
#[derive_where(Debug)]
pub struct NvmeController<P: Platform> {
    #[derive_where(skip)]
    platform: Arc<P>,
    config: ControllerConfig,
    registers: RegisterBlock<P>,
    capabilities: Capabilities,
    ready_timeout: Duration,

    admin_queue: SpinLock<CommandQueue<P>>,
    admin_vector: IrqVector,
    irq_type: IrqType,
    /// admin queue plus requested io queues
    queue_count: u16,
    io_queues: Vec<IoQueue<P>>,

    /// `Some` while the controller uses shadow doorbells
    shadow_doorbells: SpinLock<Option<ShadowDoorbells<P>>>,

    info: Option<ControllerInfo>,
    namespaces: Vec<Namespace>,

    /// serializes reset and shutdown
    lifecycle: SpinLock<()>,
    shut_down: AtomicBool,
}

/// Clamp a requested queue depth to what the controller and a single ring page support
fn queue_depth(requested: u16, capabilities: &Capabilities) -> Result<u16, NvmeError> {
    let depth = (requested as u32)
        .min(capabilities.max_queue_depth())
        .min(MAX_QUEUE_DEPTH as u32) as u16;
    if depth < 2 {
        return Err(NvmeError::InvalidQueueSize(requested));
    }
    Ok(depth)
}

/// # Safety
///
/// must only be called once per queue, see [Doorbell::new]
unsafe fn queue_doorbells<P: Platform>(
    registers: &RegisterBlock<P>,
    queue: QueueIdentifier,
    stride: u8,
) -> (Doorbell, Doorbell) {
    unsafe {
        (
            Doorbell::new(registers.doorbell(queue, stride, false)),
            Doorbell::new(registers.doorbell(queue, stride, true)),
        )
    }
}

fn log_queue_creation_error(kind: &str, queue: QueueIdentifier, err: &NvmeError) {
    if let NvmeError::AdminCommandFailed(status) = err {
        if let Some(reason) = QueueCreationStatus::from_status(*status) {
            error!("failed to create io {kind} queue {queue}: {reason:?}");
            return;
        }
    }
    error!("failed to create io {kind} queue {queue}: {err}");
}

impl<P: Platform> NvmeController<P> {
    /// Initializes the NVMe controller of `platform`
    ///
    /// One io queue is created per core, unless [ControllerConfig::io_queue_count]
    /// is set. On failure everything allocated so far is released and the
    /// controller is left disabled.
    pub fn initialize(platform: Arc<P>, config: ControllerConfig) -> Result<Self, NvmeError> {
        let pci_id = platform.device_id();
        info!("initializing NVMe controller {pci_id:?}...");

        platform.enable_memory_space();
        platform.enable_bus_mastering();

        let io_queue_count = config
            .io_queue_count
            .unwrap_or_else(|| platform.core_count())
            .max(1);
        let queue_count = io_queue_count
            .checked_add(1)
            .ok_or(NvmeError::DeviceNotSupported("too many io queues requested"))?;

        let registers = unsafe {
            // Safety: bar0 is the register block of this controller and we are
            // the only driver accessing it
            RegisterBlock::map(platform.clone(), platform.bar0(), queue_count)?
        };
        let capabilities = registers.capabilities();
        let version = registers.version();
        debug!("NVMe version {version}");
        trace!("capabilities: {capabilities:#?}");

        if !capabilities.supports_nvm_command_set() {
            return Err(NvmeError::DeviceNotSupported("NVM command set not supported"));
        }
        if capabilities.mem_min_page_size != 0 {
            return Err(NvmeError::DeviceNotSupported("4KiB memory pages not supported"));
        }
        let ready_timeout = capabilities.ready_timeout();
        let stride = capabilities.doorbell_stride;

        let admin_depth = queue_depth(config.admin_queue_depth, &capabilities)?;

        let irq_type = platform.reserve_irqs(queue_count, true)?;
        let admin_vector = platform.allocate_irq(0)?;
        debug!("using {irq_type:?} interrupts, admin vector {admin_vector:?}");

        let (submission_doorbell, completion_doorbell) = unsafe {
            // Safety: the admin queue doorbells are only used by this queue
            queue_doorbells(&registers, QueueIdentifier::ADMIN, stride)
        };
        let admin_queue = CommandQueue::allocate(
            &platform,
            QueueIdentifier::ADMIN,
            admin_depth,
            config.queue_mode,
            Some(admin_vector),
            submission_doorbell,
            completion_doorbell,
        )?;

        let mut this = Self {
            platform,
            config,
            registers,
            capabilities,
            ready_timeout,
            admin_queue: SpinLock::new(admin_queue),
            admin_vector,
            irq_type,
            queue_count,
            io_queues: Vec::new(),
            shadow_doorbells: SpinLock::new(None),
            info: None,
            namespaces: Vec::new(),
            lifecycle: SpinLock::new(()),
            shut_down: AtomicBool::new(false),
        };

        // 1. The host waits for the controller to indicate that any previous reset is
        // complete by waiting for CSTS.RDY to become ‘0’;
        this.reset_controller()?;

        // 2. The host configures the Admin Queue by setting the Admin Queue Attributes (AQA),
        // Admin Submission Queue Base Address (ASQ), and Admin Completion Queue Base Address
        // (ACQ) to appropriate values;
        this.configure_admin_queue();

        // 3.-6. select the NVM command set, configure CC and enable the controller
        this.start_controller()?;

        // 7. The host determines the configuration of the controller by issuing the Identify
        // command specifying the Identify Controller data structure (i.e., CNS 01h);
        this.identify_controller(pci_id, version)?;
        this.configure_shadow_doorbells();

        // 9. create the io queues, completion queue first
        this.create_io_queues(io_queue_count)?;

        // 10. The host determines the active namespaces
        this.identify_namespaces()?;

        info!(
            "NVMe controller ready with {} io queues and {} namespaces",
            this.io_queues.len(),
            this.namespaces.len()
        );

        Ok(this)
    }

    /// If the controller is enabled, wait for it to be ready and disable it
    fn reset_controller(&self) -> Result<(), NvmeError> {
        let mut cc = self.registers.configuration()?;
        if !cc.enable {
            return Ok(());
        }
        debug!("disable NVMe controller");
        self.wait_ready(true)?;

        cc.enable = false;
        cc.shutdown_notification = ShutdownNotification::None;
        self.registers.write_configuration(cc);

        self.wait_ready(false)
    }

    fn configure_admin_queue(&self) {
        let queue = self.admin_queue.lock();
        trace!("writing admin queue properties: {:#?}", *queue);
        self.registers.write_admin_queue_attributes(AdminQueueAttributes {
            submission_queue_size: queue.depth(),
            completion_queue_size: queue.depth(),
        });
        self.registers
            .write_admin_queue_addresses(queue.submission_queue_paddr(), queue.completion_queue_paddr());
    }

    fn start_controller(&self) -> Result<(), NvmeError> {
        self.wait_ready(false)?;

        let mut cc = self.registers.configuration()?;
        cc.command_set_selected = 0b000;
        // 2 ^ (12 + 0) = 4KiB
        cc.memory_page_size = 0;
        cc.arbitration_mechanism = ArbitrationMechanism::RoundRobbin;
        cc.shutdown_notification = ShutdownNotification::None;
        cc.io_submission_queue_entry_size = SUBMISSION_COMMAND_ENTRY_SIZE_LOG2;
        cc.io_completion_queue_entry_size = COMPLETION_COMMAND_ENTRY_SIZE_LOG2;
        self.registers.write_configuration(cc.clone());

        cc.enable = true;
        self.registers.write_configuration(cc);

        self.wait_ready(true)?;
        debug!("NVMe controller enabled");
        Ok(())
    }

    /// Poll CSTS.RDY until it equals `expected` or the ready timeout elapsed
    fn wait_ready(&self, expected: bool) -> Result<(), NvmeError> {
        let mut waited = Duration::ZERO;
        loop {
            let status = self.registers.status();
            if status.ready == expected {
                return Ok(());
            }
            if waited >= self.ready_timeout {
                if status.fatal_error {
                    error!("controller reports a fatal error");
                }
                error!("CSTS.RDY did not become {expected} within {waited:?}");
                return Err(NvmeError::HardwareTimeout {
                    expected_ready: expected,
                    waited,
                });
            }
            self.platform.delay_us(READY_POLL_INTERVAL.as_micros() as u64);
            waited += READY_POLL_INTERVAL;
        }
    }

    /// Submit an admin command and wait for its completion
    fn admin_command(&self, command: CommonCommand) -> Result<CommonCompletionEntry, NvmeError> {
        let opcode = command.dword0.opcode();
        let entry = queue::submit_and_wait(
            &self.admin_queue,
            command,
            &*self.platform,
            self.ready_timeout,
            ADMIN_POLL_INTERVAL,
        )?;
        let status = entry.status();
        if status.is_err() {
            error!("admin command {opcode:#x} failed: {status}");
            return Err(NvmeError::AdminCommandFailed(status));
        }
        Ok(entry)
    }

    /// Issue an identify command and read the result
    ///
    /// # Safety
    ///
    /// `T` must be valid for any bit pattern and fit into a page
    unsafe fn identify<T: Copy>(&self, cns: IdentifyCns) -> Result<T, NvmeError> {
        let scratch = DmaBuffer::allocate(&self.platform, "nvme identify", 1)?;
        self.admin_command(create_identify_command(cns, scratch.paddr()))?;
        unsafe {
            // Safety: see function safety
            scratch.read::<T>(0)
        }
    }

    fn identify_controller(&mut self, pci_id: PciDeviceId, version: Version) -> Result<(), NvmeError> {
        let data: IdentifyControllerData = unsafe {
            // Safety: plain integers and arrays of integers
            self.identify(IdentifyCns::Controller)?
        };
        let info = ControllerInfo::from_identify(pci_id, version, &data, PAGE_SIZE as u64);
        info!(
            "NVMe controller {:?}: model {:?}, serial {:?}, firmware {:?}",
            info.controller_id, info.model_number, info.serial_number, info.firmware_revision
        );
        trace!(
            "max transfer size: {:?}, optional admin commands: {:?}",
            info.max_transfer_size,
            info.optional_admin_commands
        );
        self.info = Some(info);
        Ok(())
    }

    /// Use shadow doorbells if the controller supports them. Failure falls
    /// back to MMIO doorbells.
    fn configure_shadow_doorbells(&self) {
        let supported = self
            .info
            .as_ref()
            .is_some_and(ControllerInfo::supports_shadow_doorbells);
        if !supported || !self.config.shadow_doorbells {
            debug!("using MMIO doorbells");
            return;
        }

        if let Err(err) = self.try_configure_shadow_doorbells() {
            warn!("failed to configure shadow doorbells, falling back to MMIO doorbells: {err}");
            *self.shadow_doorbells.lock() = None;
            self.admin_queue.lock().disable_shadow_doorbells();
        }
    }

    fn try_configure_shadow_doorbells(&self) -> Result<(), NvmeError> {
        let stride = self.capabilities.doorbell_stride;
        let last_queue = QueueIdentifier(self.queue_count - 1);
        if doorbell_offset(last_queue, stride, true) + 4 > PAGE_SIZE as u64 {
            return Err(NvmeError::DeviceNotSupported(
                "doorbells do not fit into a single shadow page",
            ));
        }

        let mut shadow_doorbells = self.shadow_doorbells.lock();
        let buffers = match shadow_doorbells.take() {
            Some(mut buffers) => {
                buffers.shadow.zero();
                buffers.event_index.zero();
                buffers
            }
            None => ShadowDoorbells {
                shadow: DmaBuffer::allocate(&self.platform, "nvme shadow doorbells", 1)?,
                event_index: DmaBuffer::allocate(&self.platform, "nvme event index", 1)?,
            },
        };

        self.admin_command(create_doorbell_buffer_config_command(
            buffers.shadow.paddr(),
            buffers.event_index.paddr(),
        ))?;

        unsafe {
            // Safety: the controller was configured with these pages and they are
            // kept alive in self.shadow_doorbells
            self.admin_queue.lock().enable_shadow_doorbells(
                buffers.cells(QueueIdentifier::ADMIN, stride, false),
                buffers.cells(QueueIdentifier::ADMIN, stride, true),
            );
        }
        *shadow_doorbells = Some(buffers);
        info!("using shadow doorbells");
        Ok(())
    }

    /// Switch `queue` to shadow doorbells if they are configured
    fn enable_shadow_doorbells_for(&self, queue: &mut CommandQueue<P>) {
        let stride = self.capabilities.doorbell_stride;
        if let Some(buffers) = self.shadow_doorbells.lock().as_ref() {
            unsafe {
                // Safety: see try_configure_shadow_doorbells
                queue.enable_shadow_doorbells(
                    buffers.cells(queue.id(), stride, false),
                    buffers.cells(queue.id(), stride, true),
                );
            }
        }
    }

    fn create_io_queues(&mut self, count: u16) -> Result<(), NvmeError> {
        let depth = queue_depth(self.config.io_queue_depth, &self.capabilities)?;
        let stride = self.capabilities.doorbell_stride;

        for index in 0..count {
            let ident = QueueIdentifier(index + 1);
            let vector = self.platform.allocate_irq(ident.as_u16())?;
            let (submission_doorbell, completion_doorbell) = unsafe {
                // Safety: each io queue identifier is only used once
                queue_doorbells(&self.registers, ident, stride)
            };
            let mut queue = CommandQueue::allocate(
                &self.platform,
                ident,
                depth,
                self.config.queue_mode,
                Some(vector),
                submission_doorbell,
                completion_doorbell,
            )?;
            let bounce = DmaBuffer::allocate(&self.platform, "nvme bounce buffer", 1)?;

            self.create_io_queue_on_device(&queue)?;
            self.enable_shadow_doorbells_for(&mut queue);
            debug!("created io queue {ident} with depth {depth} and vector {vector:?}");

            self.io_queues.push(IoQueue {
                vector,
                queue: SpinLock::new(queue),
                bounce: SpinLock::new(bounce),
            });
        }
        Ok(())
    }

    /// Create the completion and then the submission queue for `queue`
    fn create_io_queue_on_device(&self, queue: &CommandQueue<P>) -> Result<(), NvmeError> {
        let interrupt = match self.config.queue_mode {
            QueueMode::Interrupt => queue.interrupt(),
            QueueMode::Polled => None,
        };

        self.admin_command(create_io_completion_queue(
            queue.id(),
            queue.depth(),
            queue.completion_queue_paddr(),
            interrupt,
        ))
        .inspect_err(|err| log_queue_creation_error("completion", queue.id(), err))?;

        self.admin_command(create_io_submission_queue(
            queue.id(),
            queue.depth(),
            queue.submission_queue_paddr(),
            queue.id(),
        ))
        .inspect_err(|err| log_queue_creation_error("submission", queue.id(), err))?;

        Ok(())
    }

    fn identify_namespaces(&mut self) -> Result<(), NvmeError> {
        let active: [u32; NAMESPACE_LIST_LEN] = unsafe {
            // Safety: array of integers
            self.identify(IdentifyCns::ActiveNamespaceList { start_nsid: 0 })?
        };

        for nsid in active.into_iter().filter(|nsid| *nsid != 0) {
            let data: IdentifyNamespaceData = unsafe {
                // Safety: plain integers and arrays of integers
                self.identify(IdentifyCns::Namespace { nsid })?
            };
            if data.namespace_size == 0 {
                debug!("namespace {nsid} is inactive");
                continue;
            }
            match Namespace::from_identify(nsid, &data) {
                Ok(namespace) => {
                    info!(
                        "namespace {nsid}: {} blocks of {} bytes",
                        namespace.block_count(),
                        namespace.block_size()
                    );
                    self.namespaces.push(namespace);
                }
                Err(NvmeError::DeviceNotSupported(reason)) => {
                    warn!("skipping namespace {nsid}: {reason}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Drain the queue bound to `vector`.
    ///
    /// Returns `false` if no queue uses `vector` or if the queue is currently
    /// locked, in which case the lock holder drains it.
    pub fn handle_interrupt(&self, vector: IrqVector) -> Result<bool, NvmeError> {
        let queue = if vector == self.admin_vector {
            &self.admin_queue
        } else if let Some(io) = self.io_queues.iter().find(|io| io.vector == vector) {
            &io.queue
        } else {
            warn!("interrupt for unknown vector {vector:?}");
            return Ok(false);
        };

        let Some(mut queue) = queue.try_lock() else {
            trace!("queue for {vector:?} is busy, skip drain");
            return Ok(false);
        };
        let drained = queue.poll_completions()?;
        trace!("drained {drained} completions on {}", queue.id());
        Ok(true)
    }

    /// The io queue of the calling core
    fn current_io_queue(&self) -> Result<&IoQueue<P>, NvmeError> {
        if self.io_queues.is_empty() {
            return Err(NvmeError::NotReady);
        }
        let core = self.platform.current_core();
        Ok(&self.io_queues[core.as_index() % self.io_queues.len()])
    }

    /// Transfer `group` of `namespace` through the bounce page of the calling
    /// core's io queue.
    ///
    /// `group` must be within the namespace and the transfer buffer must be
    /// exactly as large as `group`.
    pub(crate) fn transfer(
        &self,
        namespace: &Namespace,
        group: BlockGroup,
        mut transfer: Transfer<'_>,
    ) -> Result<(), NvmeError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(NvmeError::NotReady);
        }
        let io = self.current_io_queue()?;

        let block_size = namespace.block_size();
        let max_bytes = self
            .info
            .as_ref()
            .and_then(|info| info.max_transfer_size)
            .map_or(PAGE_SIZE as u64, |max| max.min(PAGE_SIZE as u64));
        let max_blocks = NonZeroU64::new(max_bytes / block_size as u64).ok_or(
            NvmeError::DeviceNotSupported("maximum transfer size is smaller than a block"),
        )?;

        let mut bounce = io.bounce.lock();
        let mut offset = 0;
        for chunk in group.chunks(max_blocks) {
            let len = chunk.bytes(block_size) as usize;
            let slba = chunk.start.get();
            // at most a page of blocks
            let count = chunk.count() as u16;

            let command = match &transfer {
                Transfer::Read(_) => {
                    create_read_command(namespace.nsid(), bounce.paddr(), slba, count)
                }
                Transfer::Write(data) => {
                    bounce.copy_from_slice(0, &data[offset..offset + len])?;
                    create_write_command(namespace.nsid(), bounce.paddr(), slba, count)
                }
            };

            let entry = queue::submit_and_wait(
                &io.queue,
                command,
                &*self.platform,
                self.ready_timeout,
                IO_POLL_INTERVAL,
            )?;
            entry.status().into_result(|status| {
                error!("io command on namespace {} failed: {status}", namespace.nsid());
                NvmeError::CommandFailed(status)
            })?;

            if let Transfer::Read(buffer) = &mut transfer {
                bounce.copy_to_slice(0, &mut buffer[offset..offset + len])?;
            }
            offset += len;
        }
        Ok(())
    }

    /// Delete all io queues on the device. Failures are logged and ignored.
    fn delete_io_queues(&self) {
        for io in self.io_queues.iter() {
            let ident = io.queue.lock().id();
            if let Err(err) = self.admin_command(delete_io_submission_queue(ident)) {
                warn!("failed to delete io submission queue {ident}: {err}");
            }
            if let Err(err) = self.admin_command(delete_io_completion_queue(ident)) {
                warn!("failed to delete io completion queue {ident}: {err}");
            }
        }
    }

    /// Information reported by identify controller
    pub fn info(&self) -> Option<&ControllerInfo> {
        self.info.as_ref()
    }

    /// CAP as read during initialization
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// The active namespaces of this controller
    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    /// The negotiated interrupt type
    pub fn irq_type(&self) -> IrqType {
        self.irq_type
    }

    /// The vector of the admin queue
    pub fn admin_vector(&self) -> IrqVector {
        self.admin_vector
    }

    /// The number of io queues
    pub fn io_queue_count(&self) -> usize {
        self.io_queues.len()
    }

    /// The io queue at `index`, queue identifier `index + 1`
    pub fn io_queue(&self, index: usize) -> Option<&SpinLock<CommandQueue<P>>> {
        self.io_queues.get(index).map(|io| &io.queue)
    }

    /// The interrupt vectors of all io queues
    pub fn io_queue_vectors(&self) -> Vec<IrqVector> {
        self.io_queues.iter().map(|io| io.vector).collect()
    }

    /// returns `true` if doorbell updates go through the shadow page
    pub fn uses_shadow_doorbells(&self) -> bool {
        self.shadow_doorbells.lock().is_some()
    }

    /// returns `true` after [StorageController::shutdown]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<P: Platform> StorageController for NvmeController<P> {
    type ControllerError = NvmeError;

    type Device<'a>
        = NamespaceHandle<'a, P>
    where
        Self: 'a;

    fn devices_count(&self) -> usize {
        self.namespaces.len()
    }

    fn device(&self, index: usize) -> Option<NamespaceHandle<'_, P>> {
        self.namespaces
            .get(index)
            .map(|namespace| NamespaceHandle::new(self, *namespace))
    }

    /// Disable and re-enable the controller.
    ///
    /// All queues are rewound and recreated on the device with their existing
    /// memory. Commands in flight are lost. This also recovers a controller
    /// after [Self::shutdown].
    fn reset(&self) -> Result<(), NvmeError> {
        let _lifecycle = self.lifecycle.lock();
        info!("resetting NVMe controller");

        self.reset_controller()?;

        self.admin_queue.lock().rewind();
        for io in self.io_queues.iter() {
            io.queue.lock().rewind();
        }

        self.configure_admin_queue();
        self.start_controller()?;
        self.configure_shadow_doorbells();

        for io in self.io_queues.iter() {
            let mut queue = io.queue.lock();
            self.create_io_queue_on_device(&queue)?;
            self.enable_shadow_doorbells_for(&mut queue);
        }

        self.shut_down.store(false, Ordering::Release);
        info!("NVMe controller reset complete");
        Ok(())
    }

    /// Delete the io queues and notify the controller of a normal shutdown.
    ///
    /// Afterwards all io fails with [NvmeError::NotReady].
    fn shutdown(&self) -> Result<(), NvmeError> {
        let _lifecycle = self.lifecycle.lock();
        info!("shutting down NVMe controller");

        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.delete_io_queues();
        }

        let mut cc = self.registers.configuration()?;
        cc.shutdown_notification = ShutdownNotification::Normal;
        self.registers.write_configuration(cc);

        let mut waited = Duration::ZERO;
        loop {
            if self.registers.status().shutdown_status == ShutdownStatus::Complete {
                info!("NVMe controller shutdown complete");
                return Ok(());
            }
            if waited >= self.ready_timeout {
                error!("NVMe controller shutdown did not complete within {waited:?}");
                return Err(NvmeError::ShutdownIncomplete(waited));
            }
            self.platform.delay_us(READY_POLL_INTERVAL.as_micros() as u64);
            waited += READY_POLL_INTERVAL;
        }
    }
}

impl<P: Platform> Drop for NvmeController<P> {
    fn drop(&mut self) {
        debug!("drop NVMe controller");
        match self.registers.configuration() {
            Ok(mut cc) if cc.enable => {
                cc.enable = false;
                cc.shutdown_notification = ShutdownNotification::None;
                self.registers.write_configuration(cc);
                if let Err(err) = self.wait_ready(false) {
                    error!("failed to disable NVMe controller: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => error!("failed to read CC: {err}"),
        }
    }
}
