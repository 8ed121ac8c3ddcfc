//! A simulated NVMe controller backed by host memory.
//!
//! [TestPlatform] implements [crate::Platform]. The register block and all
//! DMA pages are heap allocations, physical addresses equal virtual addresses.
//! The simulated device only advances when the driver waits through
//! [Delay::delay_us], which also advances the simulated clock.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering},
        Mutex, MutexGuard, Once,
    },
    time::Duration,
};

use bit_field::BitField;
use shared::types::CoreId;
use x86_64::{PhysAddr, VirtAddr};

use crate::{
    admin_commands::{
        ControllerId, IdentifyControllerData, IdentifyNamespaceData, LbaFormat, NAMESPACE_LIST_LEN,
    },
    generic_command::{
        CommandIdentifier, CommonCommand, CommonCompletionEntry, StatusAndPhase,
        COMPLETION_COMMAND_ENTRY_SIZE, SUBMISSION_COMMAND_ENTRY_SIZE,
    },
    platform::{
        CpuTopology, Delay, DmaMemory, DmaRegion, Interrupts, IrqType, IrqVector, PciDevice,
        PciDeviceId, PlatformError,
    },
    properties::{
        doorbell_offset, offsets, AdminQueueAttributes, Capabilities, ControllerStatus,
        ShutdownStatus,
    },
    queue::QueueIdentifier,
    PAGE_SIZE,
};

/// Initialize env_logger once for all tests
pub fn init_test_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Size of the simulated BAR0
pub const BAR_SIZE: usize = 0x4000;

/// PCI id reported by [TestPlatform]
pub const SIM_PCI_ID: PciDeviceId = PciDeviceId {
    vendor_id: 0x1b36,
    device_id: 0x0010,
};

const SUCCESS: (u8, u8) = (0, 0);
const INVALID_OPCODE: (u8, u8) = (0, 0x1);
const INVALID_FIELD: (u8, u8) = (0, 0x2);
const INTERNAL_ERROR: (u8, u8) = (0, 0x6);
const INVALID_NAMESPACE: (u8, u8) = (0, 0xb);
const LBA_OUT_OF_RANGE: (u8, u8) = (0, 0x80);
const INVALID_COMPLETION_QUEUE: (u8, u8) = (1, 0x0);
const INVALID_QUEUE_IDENTIFIER: (u8, u8) = (1, 0x1);
const INVALID_QUEUE_SIZE: (u8, u8) = (1, 0x2);
const INVALID_INTERRUPT_VECTOR: (u8, u8) = (1, 0x8);
const INVALID_QUEUE_DELETION: (u8, u8) = (1, 0xc);

/// How CSTS.RDY follows CC.EN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyBehavior {
    /// RDY follows EN on the next step
    Normal,
    /// RDY never becomes 1
    NeverReady,
    /// RDY never becomes 0 once set
    StuckReady,
}

/// A namespace of the simulated controller
#[derive(Debug, Clone)]
pub struct SimNamespace {
    pub nsid: u32,
    pub block_count: u64,
    /// log2 of the block size
    pub lbads: u8,
    /// index of the active lba format
    pub flbas: u8,
}

impl SimNamespace {
    pub fn new(nsid: u32, block_count: u64, lbads: u8) -> Self {
        Self {
            nsid,
            block_count,
            lbads,
            flbas: 0,
        }
    }
}

/// Behavior of the simulated controller
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub core_count: u16,
    /// CAP.MQES, 0 based
    pub maximum_queue_entries: u16,
    /// CAP.TO
    pub timeout: u8,
    /// CAP.DSTRD
    pub doorbell_stride: u8,
    /// report OACS bit 8 and accept the doorbell buffer config command
    pub shadow_doorbells: bool,
    pub ready: ReadyBehavior,
    /// CC.EN and CSTS.RDY are already set when the driver starts
    pub start_enabled: bool,
    pub namespaces: Vec<SimNamespace>,
    /// admin commands with these opcodes fail with an internal error
    pub failing_admin_opcodes: Vec<u8>,
    /// io commands with these opcodes fail with an internal error
    pub failing_io_opcodes: Vec<u8>,
    pub max_io_queues: u16,
    pub irq_vectors: u16,
    pub dma_page_limit: Option<usize>,
    /// CSTS.SHST reaches complete after a shutdown notification
    pub completes_shutdown: bool,
    /// MDTS
    pub mdts: u8,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            core_count: 1,
            maximum_queue_entries: 1023,
            timeout: 1,
            doorbell_stride: 0,
            shadow_doorbells: false,
            ready: ReadyBehavior::Normal,
            start_enabled: false,
            namespaces: vec![SimNamespace::new(1, 1000, 9)],
            failing_admin_opcodes: Vec::new(),
            failing_io_opcodes: Vec::new(),
            max_io_queues: 64,
            irq_vectors: 32,
            dma_page_limit: None,
            completes_shutdown: true,
            mdts: 5,
        }
    }
}

unsafe fn read_mem<T>(addr: u64) -> T {
    unsafe { (addr as *const T).read_volatile() }
}

unsafe fn write_mem<T>(addr: u64, value: T) {
    unsafe { (addr as *mut T).write_volatile(value) }
}

/// Device side of a submission ring
#[derive(Debug)]
pub struct SimSubmissionRing {
    paddr: u64,
    depth: u16,
    head: u16,
    completion_queue: u16,
}

impl SimSubmissionRing {
    pub fn new(paddr: u64, depth: u16, completion_queue: u16) -> Self {
        Self {
            paddr,
            depth,
            head: 0,
            completion_queue,
        }
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn completion_queue(&self) -> u16 {
        self.completion_queue
    }

    /// Fetch the next command if the host `tail` is ahead of the head
    pub fn fetch(&mut self, tail: u16) -> Option<CommonCommand> {
        if tail >= self.depth || tail == self.head {
            return None;
        }
        let command = unsafe {
            read_mem::<CommonCommand>(
                self.paddr + (self.head as usize * SUBMISSION_COMMAND_ENTRY_SIZE) as u64,
            )
        };
        self.head = (self.head + 1) % self.depth;
        Some(command)
    }
}

/// Device side of a completion ring
#[derive(Debug)]
pub struct SimCompletionRing {
    paddr: u64,
    depth: u16,
    tail: u16,
    phase: bool,
}

impl SimCompletionRing {
    pub fn new(paddr: u64, depth: u16) -> Self {
        Self {
            paddr,
            depth,
            tail: 0,
            phase: true,
        }
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn is_full(&self, host_head: u16) -> bool {
        (self.tail + 1) % self.depth == host_head
    }

    /// Post a completion entry, returns `false` if the ring is full
    pub fn post(
        &mut self,
        submission_queue: u16,
        submission_queue_head: u16,
        ident: CommandIdentifier,
        status_code_type: u8,
        status_code: u8,
        host_head: u16,
    ) -> bool {
        if self.is_full(host_head) {
            return false;
        }
        let entry = CommonCompletionEntry {
            dword0: 0,
            dword1: 0,
            submission_queue_head,
            submission_queue_ident: QueueIdentifier(submission_queue),
            command_ident: ident,
            status_and_phase: StatusAndPhase::new(self.phase, status_code_type, status_code),
        };
        unsafe {
            write_mem(
                self.paddr + (self.tail as usize * COMPLETION_COMMAND_ENTRY_SIZE) as u64,
                entry,
            );
        }
        self.tail += 1;
        if self.tail == self.depth {
            self.tail = 0;
            self.phase = !self.phase;
        }
        true
    }
}

#[derive(Debug)]
struct SimCompletionQueue {
    ring: SimCompletionRing,
    interrupt: Option<u16>,
}

#[derive(Debug, Clone, Copy)]
struct ShadowPages {
    shadow: u64,
    event_index: u64,
}

/// A command fetched by the simulated controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    pub queue: u16,
    pub opcode: u8,
    pub ident: CommandIdentifier,
    pub nsid: u32,
    pub dword10: u32,
    pub dword11: u32,
}

/// The simulated controller state
#[derive(Debug)]
pub struct SimDevice {
    config: SimConfig,
    bar: u64,
    enabled: bool,
    admin: Option<(SimSubmissionRing, SimCompletionRing)>,
    completion_queues: BTreeMap<u16, SimCompletionQueue>,
    submission_queues: BTreeMap<u16, SimSubmissionRing>,
    shadow: Option<ShadowPages>,
    last_mmio: BTreeMap<(u16, bool), u32>,
    storage: BTreeMap<u32, Vec<u8>>,
    log: Vec<LoggedCommand>,
    raised: Vec<IrqVector>,
    paused: bool,
}

impl SimDevice {
    fn new(config: SimConfig, bar: u64) -> Self {
        let storage = config
            .namespaces
            .iter()
            .map(|ns| {
                let size = if ns.lbads <= 16 {
                    (ns.block_count << ns.lbads) as usize
                } else {
                    0
                };
                (ns.nsid, vec![0u8; size])
            })
            .collect();

        let this = Self {
            enabled: config.start_enabled,
            config,
            bar,
            admin: None,
            completion_queues: BTreeMap::new(),
            submission_queues: BTreeMap::new(),
            shadow: None,
            last_mmio: BTreeMap::new(),
            storage,
            log: Vec::new(),
            raised: Vec::new(),
            paused: false,
        };

        let cap = Capabilities {
            maximum_queue_entries: this.config.maximum_queue_entries,
            contiguous_queues_required: true,
            arbitrations_supported: 0,
            timeout: this.config.timeout,
            doorbell_stride: this.config.doorbell_stride,
            subsystem_reset_supported: false,
            command_sets_supported: 1,
            boot_partition_support: false,
            power_scope: 0,
            mem_min_page_size: 0,
            mem_max_page_size: 0,
            persistent_memory_region_support: false,
            memory_buffer_support: false,
            subsystem_shutdown_support: false,
            ready_modes_support: 0,
        };
        this.set_reg64(offsets::CAP, cap.into());
        this.set_reg32(offsets::VS, 0x0001_0400);
        if this.config.start_enabled {
            this.set_reg32(offsets::CC, 1);
            this.set_reg32(offsets::CSTS, 1);
        }
        this
    }

    fn reg32(&self, offset: u64) -> u32 {
        unsafe { read_mem(self.bar + offset) }
    }

    fn set_reg32(&self, offset: u64, value: u32) {
        unsafe { write_mem(self.bar + offset, value) }
    }

    fn reg64(&self, offset: u64) -> u64 {
        unsafe { read_mem(self.bar + offset) }
    }

    fn set_reg64(&self, offset: u64, value: u64) {
        unsafe { write_mem(self.bar + offset, value) }
    }

    /// Advance the device by processing all visible register and doorbell changes
    pub fn step(&mut self) {
        let cc = self.reg32(offsets::CC);
        let enable = cc.get_bit(0);
        let shutdown_notification = cc.get_bits(14..=15);
        let mut status = ControllerStatus::from(self.reg32(offsets::CSTS));

        if enable && !self.enabled {
            self.enabled = true;
            self.enable();
            status.ready = self.config.ready != ReadyBehavior::NeverReady;
        } else if !enable && self.enabled {
            self.enabled = false;
            self.disable();
            if self.config.ready != ReadyBehavior::StuckReady {
                status.ready = false;
            }
            status.shutdown_status = ShutdownStatus::NormalOperation;
        }

        if shutdown_notification != 0 && status.shutdown_status == ShutdownStatus::NormalOperation {
            status.shutdown_status = if self.config.completes_shutdown {
                ShutdownStatus::Complete
            } else {
                ShutdownStatus::Occuring
            };
        }
        self.set_reg32(offsets::CSTS, status.clone().into());

        if !self.enabled || !status.ready || self.paused || shutdown_notification != 0 {
            return;
        }

        self.process_admin();
        self.process_io();
        self.update_event_indices();
    }

    fn enable(&mut self) {
        let aqa = AdminQueueAttributes::from(self.reg32(offsets::AQA));
        let asq = self.reg64(offsets::ASQ);
        let acq = self.reg64(offsets::ACQ);
        self.admin = Some((
            SimSubmissionRing::new(asq, aqa.submission_queue_size, 0),
            SimCompletionRing::new(acq, aqa.completion_queue_size),
        ));
    }

    fn disable(&mut self) {
        self.admin = None;
        self.completion_queues.clear();
        self.submission_queues.clear();
        self.shadow = None;
        self.last_mmio.clear();
        for offset in (offsets::DOORBELLS..BAR_SIZE as u64).step_by(4) {
            self.set_reg32(offset, 0);
        }
    }

    fn doorbell_offset(&self, queue: u16, completion: bool) -> u64 {
        doorbell_offset(QueueIdentifier(queue), self.config.doorbell_stride, completion)
    }

    /// The doorbell value as seen by the device.
    ///
    /// A changed MMIO register wins, otherwise the shadow cell is used if configured.
    fn doorbell(&mut self, queue: u16, completion: bool) -> u16 {
        let offset = self.doorbell_offset(queue, completion);
        let mmio = self.reg32(offsets::DOORBELLS + offset);
        let last = self.last_mmio.entry((queue, completion)).or_insert(0);
        if mmio != *last {
            *last = mmio;
            return mmio as u16;
        }
        match self.shadow {
            Some(pages) => unsafe { read_mem::<u32>(pages.shadow + offset) as u16 },
            None => mmio as u16,
        }
    }

    fn doorbell_keys(&self) -> Vec<(u16, bool)> {
        let mut keys = vec![(0, false), (0, true)];
        keys.extend(self.submission_queues.keys().map(|qid| (*qid, false)));
        keys.extend(self.completion_queues.keys().map(|qid| (*qid, true)));
        keys
    }

    /// keep the event index just behind the shadow value, so the host never
    /// needs an MMIO write
    fn update_event_indices(&mut self) {
        let Some(pages) = self.shadow else {
            return;
        };
        for (queue, completion) in self.doorbell_keys() {
            let offset = self.doorbell_offset(queue, completion);
            unsafe {
                let shadow = read_mem::<u32>(pages.shadow + offset) as u16;
                write_mem(pages.event_index + offset, shadow.wrapping_sub(1) as u32);
            }
        }
    }

    fn log_command(&mut self, queue: u16, command: &CommonCommand) {
        self.log.push(LoggedCommand {
            queue,
            opcode: command.dword0.opcode(),
            ident: command.dword0.command_identifier(),
            nsid: command.namespace_ident,
            dword10: command.dword10,
            dword11: command.dword11,
        });
    }

    fn process_admin(&mut self) {
        let Some((mut sq, mut cq)) = self.admin.take() else {
            return;
        };
        loop {
            let head = self.doorbell(0, true);
            if cq.is_full(head) {
                break;
            }
            let tail = self.doorbell(0, false);
            let Some(command) = sq.fetch(tail) else {
                break;
            };
            self.log_command(0, &command);
            let (sct, sc) = self.execute_admin(&command);
            cq.post(0, sq.head(), command.dword0.command_identifier(), sct, sc, head);
            self.raised.push(IrqVector(0));
        }
        // a reset during execution drops the rings
        if self.enabled {
            self.admin = Some((sq, cq));
        }
    }

    fn process_io(&mut self) {
        let qids: Vec<u16> = self.submission_queues.keys().copied().collect();
        for qid in qids {
            loop {
                let Some(cqid) = self.submission_queues.get(&qid).map(|sq| sq.completion_queue()) else {
                    break;
                };
                let head = self.doorbell(cqid, true);
                let tail = self.doorbell(qid, false);
                if self
                    .completion_queues
                    .get(&cqid)
                    .map_or(true, |cq| cq.ring.is_full(head))
                {
                    break;
                }
                let Some(sq) = self.submission_queues.get_mut(&qid) else {
                    break;
                };
                let Some(command) = sq.fetch(tail) else {
                    break;
                };
                let submission_head = sq.head();
                self.log_command(qid, &command);
                let (sct, sc) = self.execute_io(&command);
                let Some(cq) = self.completion_queues.get_mut(&cqid) else {
                    break;
                };
                cq.ring.post(
                    qid,
                    submission_head,
                    command.dword0.command_identifier(),
                    sct,
                    sc,
                    head,
                );
                if let Some(vector) = cq.interrupt {
                    self.raised.push(IrqVector(vector));
                }
            }
        }
    }

    fn execute_admin(&mut self, command: &CommonCommand) -> (u8, u8) {
        let opcode = command.dword0.opcode();
        if self.config.failing_admin_opcodes.contains(&opcode) {
            return INTERNAL_ERROR;
        }
        match opcode {
            0x06 => self.identify(command),
            0x05 => self.create_completion_queue(command),
            0x01 => self.create_submission_queue(command),
            0x00 => {
                let qid = command.dword10.get_bits(0..=15) as u16;
                match self.submission_queues.remove(&qid) {
                    Some(_) => SUCCESS,
                    None => INVALID_QUEUE_IDENTIFIER,
                }
            }
            0x04 => {
                let qid = command.dword10.get_bits(0..=15) as u16;
                if self
                    .submission_queues
                    .values()
                    .any(|sq| sq.completion_queue() == qid)
                {
                    INVALID_QUEUE_DELETION
                } else if self.completion_queues.remove(&qid).is_some() {
                    SUCCESS
                } else {
                    INVALID_QUEUE_IDENTIFIER
                }
            }
            0x7c if self.config.shadow_doorbells => self.configure_shadow_doorbells(command),
            _ => INVALID_OPCODE,
        }
    }

    fn identify(&mut self, command: &CommonCommand) -> (u8, u8) {
        let data = command.data_ptr.prp_entry_1.as_u64();
        match command.dword10.get_bits(0..=7) {
            0 => {
                let Some(ns) = self
                    .config
                    .namespaces
                    .iter()
                    .find(|ns| ns.nsid == command.namespace_ident)
                else {
                    return INVALID_NAMESPACE;
                };
                let mut identify = IdentifyNamespaceData::zeroed();
                identify.namespace_size = ns.block_count;
                identify.namespace_capacity = ns.block_count;
                identify.namespace_utilization = ns.block_count;
                identify.number_of_lba_formats = ns.flbas;
                identify.formatted_lba_size = ns.flbas;
                identify.lba_formats[ns.flbas as usize] = LbaFormat::with_data_size(ns.lbads);
                unsafe { write_mem(data, identify) };
                SUCCESS
            }
            1 => {
                let mut identify = IdentifyControllerData::zeroed();
                identify.pci_vendor_id = SIM_PCI_ID.vendor_id;
                identify.pci_subsystem_vendor_id = 0x1af4;
                copy_padded(&mut identify.serial_number, b"SIM-0001");
                copy_padded(&mut identify.model_number, b"Simulated NVMe Controller");
                copy_padded(&mut identify.firmware_revison, b"1.0");
                identify.maximum_data_transfer_size = self.config.mdts;
                identify.controller_id = ControllerId(1);
                identify.version = 0x0001_0400;
                if self.config.shadow_doorbells {
                    identify.optional_admin_commands = 1 << 8;
                }
                unsafe { write_mem(data, identify) };
                SUCCESS
            }
            2 => {
                let start = command.namespace_ident;
                let mut list = [0u32; NAMESPACE_LIST_LEN];
                let mut ids: Vec<u32> = self
                    .config
                    .namespaces
                    .iter()
                    .map(|ns| ns.nsid)
                    .filter(|nsid| *nsid > start)
                    .collect();
                ids.sort_unstable();
                for (slot, nsid) in list.iter_mut().zip(ids) {
                    *slot = nsid;
                }
                unsafe { write_mem(data, list) };
                SUCCESS
            }
            _ => INVALID_FIELD,
        }
    }

    fn valid_io_queue_id(&self, qid: u16) -> bool {
        qid != 0 && qid <= self.config.max_io_queues
    }

    fn valid_queue_size(&self, size: u32) -> bool {
        (2..=self.config.maximum_queue_entries as u32 + 1).contains(&size)
    }

    fn create_completion_queue(&mut self, command: &CommonCommand) -> (u8, u8) {
        let qid = command.dword10.get_bits(0..=15) as u16;
        let size = command.dword10.get_bits(16..=31) + 1;
        if !self.valid_io_queue_id(qid) || self.completion_queues.contains_key(&qid) {
            return INVALID_QUEUE_IDENTIFIER;
        }
        if !self.valid_queue_size(size) {
            return INVALID_QUEUE_SIZE;
        }
        let interrupt = command
            .dword11
            .get_bit(1)
            .then(|| command.dword11.get_bits(16..=31) as u16);
        if interrupt.is_some_and(|vector| vector >= self.config.irq_vectors) {
            return INVALID_INTERRUPT_VECTOR;
        }
        self.completion_queues.insert(
            qid,
            SimCompletionQueue {
                ring: SimCompletionRing::new(command.data_ptr.prp_entry_1.as_u64(), size as u16),
                interrupt,
            },
        );
        SUCCESS
    }

    fn create_submission_queue(&mut self, command: &CommonCommand) -> (u8, u8) {
        let qid = command.dword10.get_bits(0..=15) as u16;
        let size = command.dword10.get_bits(16..=31) + 1;
        let cqid = command.dword11.get_bits(16..=31) as u16;
        if !self.valid_io_queue_id(qid) || self.submission_queues.contains_key(&qid) {
            return INVALID_QUEUE_IDENTIFIER;
        }
        if !self.valid_queue_size(size) {
            return INVALID_QUEUE_SIZE;
        }
        if !self.completion_queues.contains_key(&cqid) {
            return INVALID_COMPLETION_QUEUE;
        }
        self.submission_queues.insert(
            qid,
            SimSubmissionRing::new(command.data_ptr.prp_entry_1.as_u64(), size as u16, cqid),
        );
        SUCCESS
    }

    fn configure_shadow_doorbells(&mut self, command: &CommonCommand) -> (u8, u8) {
        let pages = ShadowPages {
            shadow: command.data_ptr.prp_entry_1.as_u64(),
            event_index: command.data_ptr.prp_entry_2.as_u64(),
        };
        if pages.shadow == 0
            || pages.event_index == 0
            || pages.shadow % PAGE_SIZE as u64 != 0
            || pages.event_index % PAGE_SIZE as u64 != 0
        {
            return INVALID_FIELD;
        }

        let values: Vec<_> = self
            .doorbell_keys()
            .into_iter()
            .map(|(queue, completion)| (queue, completion, self.doorbell(queue, completion)))
            .collect();
        for (queue, completion, value) in values {
            let offset = self.doorbell_offset(queue, completion);
            unsafe {
                write_mem(pages.shadow + offset, value as u32);
                write_mem(pages.event_index + offset, value.wrapping_sub(1) as u32);
            }
        }
        self.shadow = Some(pages);
        SUCCESS
    }

    fn execute_io(&mut self, command: &CommonCommand) -> (u8, u8) {
        let opcode = command.dword0.opcode();
        if self.config.failing_io_opcodes.contains(&opcode) {
            return INTERNAL_ERROR;
        }
        let Some(ns) = self
            .config
            .namespaces
            .iter()
            .find(|ns| ns.nsid == command.namespace_ident)
            .cloned()
        else {
            return INVALID_NAMESPACE;
        };

        match opcode {
            0x00 => SUCCESS,
            0x01 | 0x02 => {
                let slba = command.dword10 as u64 | (command.dword11 as u64) << 32;
                let count = command.dword12.get_bits(0..=15) as u64 + 1;
                if slba.checked_add(count).map_or(true, |end| end > ns.block_count) {
                    return LBA_OUT_OF_RANGE;
                }
                let block_size = 1usize << ns.lbads;
                let len = count as usize * block_size;
                if len > PAGE_SIZE {
                    return INVALID_FIELD;
                }
                let start = slba as usize * block_size;
                let Some(storage) = self.storage.get_mut(&ns.nsid) else {
                    return INTERNAL_ERROR;
                };
                let buffer = command.data_ptr.prp_entry_1.as_u64() as *mut u8;
                let blocks = &mut storage[start..start + len];
                unsafe {
                    if opcode == 0x01 {
                        core::ptr::copy_nonoverlapping(buffer, blocks.as_mut_ptr(), len);
                    } else {
                        core::ptr::copy_nonoverlapping(blocks.as_ptr(), buffer, len);
                    }
                }
                SUCCESS
            }
            _ => INVALID_OPCODE,
        }
    }

    /// every command fetched so far
    pub fn command_log(&self) -> &[LoggedCommand] {
        &self.log
    }

    /// forget the fetched commands
    pub fn clear_command_log(&mut self) {
        self.log.clear();
    }

    /// interrupt vectors raised since the last call
    pub fn take_raised_interrupts(&mut self) -> Vec<IrqVector> {
        core::mem::take(&mut self.raised)
    }

    /// while paused no commands are fetched
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_shadow_configured(&self) -> bool {
        self.shadow.is_some()
    }

    /// the shadow cell of a doorbell, if shadow doorbells are configured
    pub fn shadow_cell(&self, queue: u16, completion: bool) -> Option<u32> {
        let pages = self.shadow?;
        let offset = self.doorbell_offset(queue, completion);
        Some(unsafe { read_mem(pages.shadow + offset) })
    }

    /// the MMIO doorbell register
    pub fn mmio_doorbell(&self, queue: u16, completion: bool) -> u32 {
        self.reg32(offsets::DOORBELLS + self.doorbell_offset(queue, completion))
    }

    /// ids of the created io submission queues
    pub fn io_submission_queues(&self) -> Vec<u16> {
        self.submission_queues.keys().copied().collect()
    }

    /// depth and interrupt vector of an io completion queue
    pub fn io_completion_queue(&self, qid: u16) -> Option<(u16, Option<u16>)> {
        self.completion_queues
            .get(&qid)
            .map(|cq| (cq.ring.depth(), cq.interrupt))
    }

    /// the backing store of a namespace
    pub fn storage(&mut self, nsid: u32) -> &mut [u8] {
        self.storage.get_mut(&nsid).map(Vec::as_mut_slice).unwrap_or_default()
    }
}

fn copy_padded(target: &mut [u8], value: &[u8]) {
    target.fill(b' ');
    target[..value.len()].copy_from_slice(value);
}

fn bar_layout() -> Layout {
    Layout::from_size_align(BAR_SIZE, PAGE_SIZE).unwrap()
}

/// A [crate::Platform] backed by host memory and a [SimDevice]
#[derive(Debug)]
pub struct TestPlatform {
    bar: u64,
    device: Mutex<SimDevice>,
    time_us: AtomicU64,
    dma_pages: AtomicUsize,
    dma_page_limit: Option<usize>,
    mmio_mappings: AtomicUsize,
    irq_vectors: u16,
    reserved_irqs: AtomicU16,
    core_count: u16,
    current_core: AtomicU16,
    memory_space: AtomicBool,
    bus_master: AtomicBool,
}

impl TestPlatform {
    pub fn new(config: SimConfig) -> Self {
        init_test_logger();
        let bar = unsafe { alloc_zeroed(bar_layout()) };
        assert!(!bar.is_null());
        let bar = bar as u64;
        Self {
            bar,
            dma_page_limit: config.dma_page_limit,
            irq_vectors: config.irq_vectors,
            core_count: config.core_count,
            device: Mutex::new(SimDevice::new(config, bar)),
            time_us: AtomicU64::new(0),
            dma_pages: AtomicUsize::new(0),
            mmio_mappings: AtomicUsize::new(0),
            reserved_irqs: AtomicU16::new(0),
            current_core: AtomicU16::new(0),
            memory_space: AtomicBool::new(false),
            bus_master: AtomicBool::new(false),
        }
    }

    /// Access the simulated device. Must not be held while calling into the driver.
    pub fn sim(&self) -> MutexGuard<'_, SimDevice> {
        self.device.lock().unwrap()
    }

    /// simulated time since creation
    pub fn now(&self) -> Duration {
        Duration::from_micros(self.time_us.load(Ordering::SeqCst))
    }

    /// pages currently allocated through [DmaMemory::allocate_dma_pages]
    pub fn allocated_dma_pages(&self) -> usize {
        self.dma_pages.load(Ordering::SeqCst)
    }

    /// mappings currently created through [DmaMemory::map_mmio]
    pub fn mmio_mappings(&self) -> usize {
        self.mmio_mappings.load(Ordering::SeqCst)
    }

    pub fn set_current_core(&self, core: u16) {
        self.current_core.store(core, Ordering::SeqCst);
    }

    pub fn read_register_32(&self, offset: u64) -> u32 {
        unsafe { read_mem(self.bar + offset) }
    }

    pub fn memory_space_enabled(&self) -> bool {
        self.memory_space.load(Ordering::SeqCst)
    }

    pub fn bus_master_enabled(&self) -> bool {
        self.bus_master.load(Ordering::SeqCst)
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl Drop for TestPlatform {
    fn drop(&mut self) {
        unsafe { dealloc(self.bar as *mut u8, bar_layout()) };
    }
}

impl PciDevice for TestPlatform {
    fn device_id(&self) -> PciDeviceId {
        SIM_PCI_ID
    }

    fn enable_memory_space(&self) {
        self.memory_space.store(true, Ordering::SeqCst);
    }

    fn enable_bus_mastering(&self) {
        self.bus_master.store(true, Ordering::SeqCst);
    }

    fn bar0(&self) -> PhysAddr {
        PhysAddr::new(self.bar)
    }
}

impl DmaMemory for TestPlatform {
    unsafe fn map_mmio(&self, paddr: PhysAddr, size: usize) -> Result<VirtAddr, PlatformError> {
        if paddr.as_u64() != self.bar || size > BAR_SIZE {
            return Err(PlatformError::MappingFailed { paddr, size });
        }
        self.mmio_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(VirtAddr::new(paddr.as_u64()))
    }

    unsafe fn unmap_mmio(&self, _vaddr: VirtAddr, _size: usize) {
        self.mmio_mappings.fetch_sub(1, Ordering::SeqCst);
    }

    fn allocate_dma_pages(
        &self,
        _tag: &'static str,
        count: usize,
    ) -> Result<DmaRegion, PlatformError> {
        if count == 0 {
            return Err(PlatformError::OutOfMemory);
        }
        if let Some(limit) = self.dma_page_limit {
            if self.allocated_dma_pages() + count > limit {
                return Err(PlatformError::OutOfMemory);
            }
        }
        let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| PlatformError::OutOfMemory)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(PlatformError::OutOfMemory);
        }
        self.dma_pages.fetch_add(count, Ordering::SeqCst);
        Ok(DmaRegion {
            paddr: PhysAddr::new(ptr as u64),
            vaddr: VirtAddr::from_ptr(ptr),
            page_count: count,
        })
    }

    unsafe fn free_dma_pages(&self, region: DmaRegion) {
        let layout = Layout::from_size_align(region.page_count * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(region.vaddr.as_mut_ptr(), layout) };
        self.dma_pages.fetch_sub(region.page_count, Ordering::SeqCst);
    }
}

impl Interrupts for TestPlatform {
    fn reserve_irqs(&self, count: u16, _msi_x_preferred: bool) -> Result<IrqType, PlatformError> {
        let reserved = count.min(self.irq_vectors);
        if reserved == 0 {
            return Err(PlatformError::NoInterruptVectors(0));
        }
        self.reserved_irqs.store(reserved, Ordering::SeqCst);
        Ok(IrqType::MsiX)
    }

    fn allocate_irq(&self, index: u16) -> Result<IrqVector, PlatformError> {
        if index < self.reserved_irqs.load(Ordering::SeqCst) {
            Ok(IrqVector(index))
        } else {
            Err(PlatformError::NoInterruptVectors(index))
        }
    }
}

impl CpuTopology for TestPlatform {
    fn core_count(&self) -> u16 {
        self.core_count
    }

    fn current_core(&self) -> CoreId {
        CoreId(self.current_core.load(Ordering::SeqCst))
    }
}

impl Delay for TestPlatform {
    fn delay_us(&self, us: u64) {
        self.time_us.fetch_add(us, Ordering::SeqCst);
        self.sim().step();
    }
}
