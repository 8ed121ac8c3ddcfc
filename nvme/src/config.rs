//! Driver configuration

use core::time::Duration;

/// How completions of a queue are drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// completions are drained right after each submission and while waiting
    Polled,
    /// the controller raises an interrupt and completions are drained by
    /// [crate::NvmeController::handle_interrupt]
    #[default]
    Interrupt,
}

/// Configuration of a [crate::NvmeController]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// requested depth of the admin queue
    pub admin_queue_depth: u16,
    /// requested depth of each io queue
    pub io_queue_depth: u16,
    /// how io queue completions are drained
    pub queue_mode: QueueMode,
    /// use shadow doorbells if the controller supports them
    pub shadow_doorbells: bool,
    /// number of io queues, defaults to one per core
    pub io_queue_count: Option<u16>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            admin_queue_depth: 64,
            io_queue_depth: 64,
            queue_mode: QueueMode::default(),
            shadow_doorbells: true,
            io_queue_count: None,
        }
    }
}

/// interval in which CSTS is polled while waiting for the controller
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// interval in which the admin queue is polled during synchronous commands
pub const ADMIN_POLL_INTERVAL: Duration = Duration::from_micros(10);

/// interval in which io queues are polled while waiting for a command
pub const IO_POLL_INTERVAL: Duration = Duration::from_micros(1);
