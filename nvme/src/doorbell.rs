//! Doorbells used to notify the controller about queue updates
//!
//! A [Doorbell] either writes the MMIO register directly or, once shadow
//! doorbells are configured, writes a shadow cell in host memory and only
//! touches the MMIO register when the controller asked for it via the event
//! index cell.
//!
//! See: NVM Express Base Spec: 5.8 Doorbell Buffer Config command

use core::sync::atomic::{fence, Ordering};

use log::trace;
use volatile::Volatile;
use x86_64::VirtAddr;

/// The shadow and event index cells of a single doorbell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowCells {
    /// the cell the host writes the new doorbell value to
    pub shadow: VirtAddr,
    /// the cell the controller writes the value it wants an MMIO write for
    pub event_index: VirtAddr,
}

/// A single submission tail or completion head doorbell
#[derive(Debug)]
pub struct Doorbell {
    mmio: VirtAddr,
    shadow: Option<ShadowCells>,
}

/// returns `true` if a doorbell update from `old` to `new` passes `event_index`.
///
/// All values wrap at `u16::MAX`. The controller requests an MMIO write once the
/// doorbell moves past `event_index`.
pub fn need_event(event_index: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_index).wrapping_sub(1) < new.wrapping_sub(old)
}

impl Doorbell {
    /// Create a doorbell writing to the MMIO register at `mmio`
    ///
    /// # Safety
    ///
    /// `mmio` must be a mapped doorbell register that is only written through
    /// this [Doorbell]
    pub unsafe fn new(mmio: VirtAddr) -> Self {
        Self { mmio, shadow: None }
    }

    /// Switch to shadow doorbell mode
    ///
    /// # Safety
    ///
    /// both cells must be valid for reads and writes of a `u32` and must stay
    /// valid until [Self::disable_shadow] is called or this is dropped.
    /// The controller must have been configured with the pages containing the cells.
    pub unsafe fn enable_shadow(&mut self, cells: ShadowCells) {
        trace!("doorbell {:p} uses shadow cell {:p}", self.mmio, cells.shadow);
        self.shadow = Some(cells);
    }

    /// Switch back to MMIO writes, e.g. after the controller was reset
    pub fn disable_shadow(&mut self) {
        self.shadow = None;
    }

    /// returns `true` if writes go through the shadow cell
    pub fn is_shadowed(&self) -> bool {
        self.shadow.is_some()
    }

    /// The address of the MMIO register
    pub fn mmio_address(&self) -> VirtAddr {
        self.mmio
    }

    /// Notify the controller about the new index `value`
    pub fn write(&mut self, value: u16) {
        let Some(cells) = self.shadow else {
            self.write_mmio(value);
            return;
        };

        let shadow = unsafe {
            // Safety: see enable_shadow
            &mut *cells.shadow.as_mut_ptr::<u32>()
        };
        let mut shadow = Volatile::new(shadow);
        let old = shadow.read() as u16;
        shadow.write(value as u32);
        // the controller must see the shadow value before we read the event index
        fence(Ordering::SeqCst);

        let event_index = unsafe {
            // Safety: see enable_shadow
            &*cells.event_index.as_ptr::<u32>()
        };
        let event_index = Volatile::new_read_only(event_index).read() as u16;

        if need_event(event_index, value, old) {
            self.write_mmio(value);
        } else {
            trace!("shadow doorbell {:p} = {value}", cells.shadow);
        }
    }

    fn write_mmio(&mut self, value: u16) {
        trace!("doorbell {:p} = {value}", self.mmio);
        let register = unsafe {
            // Safety: see new
            &mut *self.mmio.as_mut_ptr::<u32>()
        };
        Volatile::new_write_only(register).write(value as u32);
        fence(Ordering::SeqCst);
    }
}
