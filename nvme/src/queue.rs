//! Data structures and functions for using NVME Command Queues.
//!
//! The specification documents can be found at https://nvmexpress.org/specifications/
//! specifically: NVM Express Base Specification

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    fmt,
    mem,
    sync::atomic::{fence, Ordering},
    time::Duration,
};

use derive_where::derive_where;
use log::{error, trace, warn};
use shared::{
    lockcell::{LockCell, SpinLock},
    math::WrappingValue,
};

use crate::{
    config::QueueMode,
    dma::DmaBuffer,
    doorbell::{Doorbell, ShadowCells},
    generic_command::{
        CommandIdentifier, CommonCommand, CommonCompletionEntry, COMPLETION_COMMAND_ENTRY_SIZE,
        SUBMISSION_COMMAND_ENTRY_SIZE,
    },
    platform::{Delay, DmaMemory, IrqVector},
    NvmeError, ProtocolViolation, PAGE_SIZE,
};

/// Identifies a submission/completion queue pair on the controller
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct QueueIdentifier(pub(crate) u16);

impl QueueIdentifier {
    /// The admin queue
    pub const ADMIN: QueueIdentifier = QueueIdentifier(0);

    /// The raw queue id
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// returns `None` on overflow
    pub fn checked_add(self, rhs: u16) -> Option<Self> {
        self.0.checked_add(rhs).map(Self)
    }
}

impl fmt::Display for QueueIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

/// The largest depth supported for a queue. Each ring is a single page.
pub const MAX_QUEUE_DEPTH: u16 = (PAGE_SIZE / SUBMISSION_COMMAND_ENTRY_SIZE) as u16;

/// Callback invoked with the completion of a command
pub type CompletionCallback = Box<dyn FnOnce(CommonCompletionEntry) + Send>;

/// State of a command identifier
enum CommandSlot {
    Free,
    /// submitted, someone will collect the completion
    Waiting,
    /// completion arrived but was not yet collected
    Completed(CommonCompletionEntry),
    /// submitted, the callback is invoked on completion
    Callback(CompletionCallback),
    /// submitted, but nobody waits for the completion any longer
    Abandoned,
}

/// A data structure giving access to an NVME command queue pair.
///
/// This supports both admin and io command sets, although
/// a single instance will only support either and not both.
///
/// The submission and completion ring have the same depth. The
/// [CommandIdentifier] of a command is its index into the table of
/// outstanding commands, so no two outstanding commands share an identifier.
///
/// The queue on the controller must be disabled or deleted before this is
/// dropped, as dropping frees the ring memory.
#[derive_where(Debug)]
pub struct CommandQueue<P: DmaMemory> {
    id: QueueIdentifier,
    depth: u16,
    mode: QueueMode,
    interrupt: Option<IrqVector>,

    submission_queue: DmaBuffer<P>,
    completion_queue: DmaBuffer<P>,

    /// dorbell that is written to to inform the controller that
    /// new command entries have been submited
    submission_queue_tail_doorbell: Doorbell,
    /// dorbell that is written to to inform the controller that
    /// completion entries have been read, freeing the slots
    /// for the controller to fill with new completion entries
    completion_queue_head_doorbell: Doorbell,

    /// Indicates the index of the next "slot" to write a command entry
    /// in order to submit it to the controller.
    submission_queue_tail: WrappingValue<u16>,
    /// the last entry read by the controller.
    ///
    /// this value is set by the controller in each completion entry.
    submission_queue_head: u16,

    /// the next entry to read from this completion queue.
    completion_queue_head: WrappingValue<u16>,
    /// The expected phase of the next completion entry.
    ///
    /// The ring starts zeroed, so this starts out at `true` and switches every
    /// time the completion queue wraps around to the `0th` index
    completion_expected_phase: bool,

    #[derive_where(skip)]
    slots: Vec<CommandSlot>,
    next_command_identifier: WrappingValue<u16>,
    /// commands submitted for which no completion was polled yet
    outstanding: u16,
}

impl<P: DmaMemory> CommandQueue<P> {
    /// Allocates the rings for a new command queue.
    ///
    /// This queue is only useable after the nvme controller has also created
    /// the completion and submission queue on the nvme device.
    pub fn allocate(
        platform: &Arc<P>,
        id: QueueIdentifier,
        depth: u16,
        mode: QueueMode,
        interrupt: Option<IrqVector>,
        submission_queue_tail_doorbell: Doorbell,
        completion_queue_head_doorbell: Doorbell,
    ) -> Result<Self, NvmeError> {
        if !(2..=MAX_QUEUE_DEPTH).contains(&depth) {
            return Err(NvmeError::InvalidQueueSize(depth));
        }

        let submission_queue = DmaBuffer::allocate(platform, "nvme submission queue", 1)?;
        let mut completion_queue = DmaBuffer::allocate(platform, "nvme completion queue", 1)?;
        // stale phase bits would be read as new completions
        completion_queue.zero();

        trace!(
            "allocated queue {id:?} with depth {depth}: sq {:p}, cq {:p}",
            submission_queue.paddr(),
            completion_queue.paddr()
        );

        let mut slots = Vec::with_capacity(depth as usize);
        slots.resize_with(depth as usize, || CommandSlot::Free);

        Ok(Self {
            id,
            depth,
            mode,
            interrupt,
            submission_queue,
            completion_queue,
            submission_queue_tail_doorbell,
            completion_queue_head_doorbell,
            submission_queue_tail: WrappingValue::zero(depth),
            submission_queue_head: 0,
            completion_queue_head: WrappingValue::zero(depth),
            completion_expected_phase: true,
            slots,
            next_command_identifier: WrappingValue::zero(depth),
            outstanding: 0,
        })
    }

    /// The [QueueIdentifier] for this [CommandQueue]
    pub fn id(&self) -> QueueIdentifier {
        self.id
    }

    /// The number of entries in each ring
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// The interrupt vector the completion queue is bound to
    pub fn interrupt(&self) -> Option<IrqVector> {
        self.interrupt
    }

    #[allow(missing_docs)]
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// The physical address of the submission ring
    pub fn submission_queue_paddr(&self) -> x86_64::PhysAddr {
        self.submission_queue.paddr()
    }

    /// The physical address of the completion ring
    pub fn completion_queue_paddr(&self) -> x86_64::PhysAddr {
        self.completion_queue.paddr()
    }

    /// The index the next command is written to
    pub fn submission_queue_tail(&self) -> u16 {
        self.submission_queue_tail.value()
    }

    /// The last submission head reported by the controller
    pub fn submission_queue_head(&self) -> u16 {
        self.submission_queue_head
    }

    /// The index of the next completion entry
    pub fn completion_queue_head(&self) -> u16 {
        self.completion_queue_head.value()
    }

    /// The phase a new completion entry at [Self::completion_queue_head] has
    pub fn completion_expected_phase(&self) -> bool {
        self.completion_expected_phase
    }

    /// The number of commands submitted for which no completion was seen yet
    pub fn outstanding(&self) -> u16 {
        self.outstanding
    }

    /// The submission tail and completion head doorbells
    pub fn doorbells(&self) -> (&Doorbell, &Doorbell) {
        (
            &self.submission_queue_tail_doorbell,
            &self.completion_queue_head_doorbell,
        )
    }

    /// Route doorbell writes through shadow cells
    ///
    /// # Safety
    ///
    /// see [Doorbell::enable_shadow]
    pub unsafe fn enable_shadow_doorbells(&mut self, submission: ShadowCells, completion: ShadowCells) {
        unsafe {
            self.submission_queue_tail_doorbell.enable_shadow(submission);
            self.completion_queue_head_doorbell.enable_shadow(completion);
        }
    }

    /// Write doorbells directly to MMIO again
    pub fn disable_shadow_doorbells(&mut self) {
        self.submission_queue_tail_doorbell.disable_shadow();
        self.completion_queue_head_doorbell.disable_shadow();
    }

    /// Submits a new [CommonCommand] to the [CommandQueue].
    ///
    /// The command identifier is assigned by the queue. The completion is
    /// collected with [Self::poll_for].
    pub fn submit(&mut self, command: CommonCommand) -> Result<CommandIdentifier, NvmeError> {
        self.submit_slot(command, CommandSlot::Waiting)
    }

    /// Submits a new [CommonCommand] and invokes `callback` once it completes.
    ///
    /// The callback runs while the queue is drained and must not access this queue.
    pub fn submit_with_callback(
        &mut self,
        command: CommonCommand,
        callback: impl FnOnce(CommonCompletionEntry) + Send + 'static,
    ) -> Result<CommandIdentifier, NvmeError> {
        self.submit_slot(command, CommandSlot::Callback(Box::new(callback)))
    }

    fn submit_slot(
        &mut self,
        mut command: CommonCommand,
        slot: CommandSlot,
    ) -> Result<CommandIdentifier, NvmeError> {
        if self.is_full_for_submission() {
            self.poll_completions()?;
            if self.is_full_for_submission() {
                return Err(NvmeError::QueueFull);
            }
        }

        let identifier = self.allocate_identifier().ok_or(NvmeError::QueueFull)?;
        command.dword0.set_command_identifier(identifier);

        trace!(
            "submit command({identifier:?}) opcode {:#x} to queue {:?}",
            command.dword0.opcode(),
            self.id
        );

        let entry_slot_index = self.submission_queue_tail.value() as usize;
        let slot_ptr = self
            .submission_queue
            .ptr_at::<CommonCommand>(entry_slot_index * SUBMISSION_COMMAND_ENTRY_SIZE);
        unsafe {
            // Safety: submission queue is owned by us and only read by the controller
            slot_ptr.write_volatile(command);
        }

        self.slots[identifier.0 as usize] = slot;
        self.outstanding += 1;
        self.submission_queue_tail.increment();

        // the entry must be visible before the controller sees the new tail
        fence(Ordering::SeqCst);
        self.submission_queue_tail_doorbell
            .write(self.submission_queue_tail.value());

        if self.mode == QueueMode::Polled {
            self.poll_completions()?;
        }

        Ok(identifier)
    }

    fn allocate_identifier(&mut self) -> Option<CommandIdentifier> {
        for _ in 0..self.depth {
            let candidate = self.next_command_identifier.value();
            self.next_command_identifier.increment();
            if matches!(self.slots[candidate as usize], CommandSlot::Free) {
                return Some(CommandIdentifier(candidate));
            }
        }
        None
    }

    /// returns `true` if this queue is full for submissions
    ///
    /// Check completions to advance the last read submission entry
    /// of the controller
    ///
    /// See: NVMe Base Spec: 3.3.1.5: Full Queue
    pub fn is_full_for_submission(&self) -> bool {
        (self.submission_queue_tail + 1).value() == self.submission_queue_head
            || self.outstanding >= self.depth - 1
    }

    /// returns `true` if the controller read all submitted entries
    ///
    /// See: NVMe Base Spec: 3.3.1.4: Empty Queue
    pub fn is_submissions_empty(&self) -> bool {
        self.submission_queue_head == self.submission_queue_tail.value()
    }

    /// Poll the controller for new completion entries.
    ///
    /// Completions of commands submitted with a callback are handed to the
    /// callback, all other completions are stored until collected.
    /// The completion head doorbell is only written if at least 1 entry was found.
    ///
    /// Returns the number of new entries.
    pub fn poll_completions(&mut self) -> Result<usize, NvmeError> {
        let mut callbacks = Vec::new();
        let mut found = 0;
        let result = loop {
            match self.poll_single_completion(&mut callbacks) {
                Ok(true) => found += 1,
                Ok(false) => break Ok(found),
                Err(err) => {
                    error!("failed to poll completion on queue {:?}: {err}", self.id);
                    break Err(err);
                }
            }
        };

        if found > 0 {
            // inform the controller about the read entries
            self.completion_queue_head_doorbell
                .write(self.completion_queue_head.value());
        }

        for (callback, entry) in callbacks {
            callback(entry);
        }

        result
    }

    /// poll the controller for a single new completion entry.
    ///
    /// this will upate the `submission_queue_head` and `completion_queue_head`,
    /// but not trigger the completion queue head doorbell.
    /// This will also flip `completion_expected_phase` when necessary.
    ///
    /// An entry that violates the protocol is not consumed.
    fn poll_single_completion(
        &mut self,
        callbacks: &mut Vec<(CompletionCallback, CommonCompletionEntry)>,
    ) -> Result<bool, NvmeError> {
        let offset = self.completion_queue_head.value() as usize * COMPLETION_COMMAND_ENTRY_SIZE;
        let possible_completion: CommonCompletionEntry = unsafe {
            // Safety: completion entries are valid for any bit pattern
            self.completion_queue.read(offset)?
        };

        if possible_completion.status_and_phase.phase() != self.completion_expected_phase {
            // phase did not match, therefor this is the old completion entry
            return Ok(false);
        }

        // Only read the rest of the entry after the phase matched.
        fence(Ordering::Acquire);
        let completion: CommonCompletionEntry = unsafe {
            // Safety: see above
            self.completion_queue.read(offset)?
        };

        if completion.submission_queue_ident != self.id {
            return Err(ProtocolViolation::SubmissionQueueMismatch {
                queue: self.id,
                reported: completion.submission_queue_ident,
            }
            .into());
        }
        if completion.submission_queue_head >= self.depth {
            return Err(ProtocolViolation::SubmissionHeadOutOfRange {
                queue: self.id,
                head: completion.submission_queue_head,
                depth: self.depth,
            }
            .into());
        }

        let ident = completion.command_ident;
        let known = matches!(
            self.slots.get(ident.0 as usize),
            Some(CommandSlot::Waiting | CommandSlot::Callback(_) | CommandSlot::Abandoned)
        );
        if !known {
            return Err(ProtocolViolation::UnknownCommandIdentifier {
                queue: self.id,
                cid: ident,
            }
            .into());
        }

        trace!(
            "Polled Completion entry({:?}) on queue {:?}",
            ident,
            self.id
        );

        let slot = &mut self.slots[ident.0 as usize];
        match mem::replace(slot, CommandSlot::Free) {
            CommandSlot::Waiting => *slot = CommandSlot::Completed(completion),
            CommandSlot::Callback(callback) => callbacks.push((callback, completion)),
            CommandSlot::Abandoned => warn!(
                "late completion for abandoned command {:?} on queue {:?}: {}",
                ident,
                self.id,
                completion.status()
            ),
            other => *slot = other,
        }

        // the controller ensures this is wrapped around to 0 when neccessary.
        self.submission_queue_head = completion.submission_queue_head;
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.completion_queue_head.increment() {
            trace!("completion queue {:?} wrapping", self.id);
            self.completion_expected_phase = !self.completion_expected_phase;
        }

        Ok(true)
    }

    /// Take the completion of `ident` if it was already polled.
    ///
    /// Returns `Ok(None)` while the command is still running and
    /// [NvmeError::CommandLost] if the command is no longer tracked by
    /// this queue.
    pub fn take_completion(
        &mut self,
        ident: CommandIdentifier,
    ) -> Result<Option<CommonCompletionEntry>, NvmeError> {
        let Some(slot) = self.slots.get_mut(ident.0 as usize) else {
            return Err(NvmeError::CommandLost(ident));
        };
        match mem::replace(slot, CommandSlot::Free) {
            CommandSlot::Completed(entry) => Ok(Some(entry)),
            CommandSlot::Waiting => {
                *slot = CommandSlot::Waiting;
                Ok(None)
            }
            other => {
                *slot = other;
                Err(NvmeError::CommandLost(ident))
            }
        }
    }

    /// Poll the controller and take the completion of `ident` if it arrived.
    pub fn poll_for(
        &mut self,
        ident: CommandIdentifier,
    ) -> Result<Option<CommonCompletionEntry>, NvmeError> {
        if let Some(entry) = self.take_completion(ident)? {
            return Ok(Some(entry));
        }
        self.poll_completions()?;
        self.take_completion(ident)
    }

    /// Stop waiting for `ident`.
    ///
    /// The identifier is reused only after the controller posted the completion.
    pub fn abandon(&mut self, ident: CommandIdentifier) {
        let Some(slot) = self.slots.get_mut(ident.0 as usize) else {
            return;
        };
        match slot {
            CommandSlot::Waiting => *slot = CommandSlot::Abandoned,
            CommandSlot::Completed(_) => *slot = CommandSlot::Free,
            _ => {}
        }
    }

    /// Reset the ring state after the controller was reset.
    ///
    /// All outstanding commands are dropped, callbacks are not invoked.
    /// Shadow doorbells are disabled, as the controller forgets their configuration.
    pub fn rewind(&mut self) {
        let dropped = self
            .slots
            .iter_mut()
            .map(|slot| mem::replace(slot, CommandSlot::Free))
            .filter(|slot| !matches!(slot, CommandSlot::Free))
            .count();
        if dropped > 0 {
            warn!("queue {:?} dropped {dropped} commands during rewind", self.id);
        }

        self.submission_queue.zero();
        self.completion_queue.zero();
        self.submission_queue_tail = WrappingValue::zero(self.depth);
        self.submission_queue_head = 0;
        self.completion_queue_head = WrappingValue::zero(self.depth);
        self.completion_expected_phase = true;
        self.outstanding = 0;
        self.disable_shadow_doorbells();
    }
}

/// Wait until the completion for `ident` is available, draining `queue` in between.
///
/// The queue is only locked while it is polled. If `timeout` is exceeded the
/// command is abandoned and [NvmeError::CommandTimeout] is returned.
pub fn wait_for_completion<P: DmaMemory>(
    queue: &SpinLock<CommandQueue<P>>,
    ident: CommandIdentifier,
    delay: &impl Delay,
    timeout: Duration,
    interval: Duration,
) -> Result<CommonCompletionEntry, NvmeError> {
    trace!("Waiting for {ident:?}");
    let mut waited = Duration::ZERO;
    loop {
        if let Some(entry) = queue.lock().poll_for(ident)? {
            return Ok(entry);
        }
        if waited >= timeout {
            let mut queue = queue.lock();
            warn!(
                "command {:?} on queue {:?} did not complete within {:?}",
                ident,
                queue.id(),
                timeout
            );
            queue.abandon(ident);
            return Err(NvmeError::CommandTimeout(ident));
        }
        delay.delay_us(interval.as_micros() as u64);
        waited += interval;
    }
}

/// Submit `command` and wait for its completion.
///
/// The completion status is not checked.
pub fn submit_and_wait<P: DmaMemory>(
    queue: &SpinLock<CommandQueue<P>>,
    command: CommonCommand,
    delay: &impl Delay,
    timeout: Duration,
    interval: Duration,
) -> Result<CommonCompletionEntry, NvmeError> {
    let ident = queue.lock().submit(command)?;
    wait_for_completion(queue, ident, delay, timeout, interval)
}
