//! Interrupt acknowledgement and device handler hooks.
//!
//! Device drivers are external collaborators: the dispatcher only routes
//! to them and acknowledges the interrupt afterwards. The controller here
//! records every end-of-interrupt so tests can verify that each CPU
//! acknowledges, and the handler hooks model the out-of-scope driver
//! entry points as registered function pointers.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of interrupt request lines tracked by the controller.
pub const IRQ_LINES: usize = 32;

/// The interrupt controller model.
///
/// Real hardware wants an EOI write per interrupt per CPU; here each
/// acknowledgement increments a per-line counter instead.
pub struct InterruptController {
    eoi: [AtomicUsize; IRQ_LINES],
}

impl InterruptController {
    pub(crate) const fn new() -> Self {
        Self {
            eoi: [const { AtomicUsize::new(0) }; IRQ_LINES],
        }
    }

    /// Acknowledges an interrupt on the line `irq`.
    pub(crate) fn end_of_interrupt(&self, irq: u32) {
        self.eoi[irq as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns how many times line `irq` has been acknowledged.
    pub fn acknowledged(&self, irq: u32) -> usize {
        self.eoi[irq as usize].load(Ordering::Relaxed)
    }
}

/// The signature of a registered device interrupt handler.
pub type IrqHandler = fn();

fn null_handler() {}

/// Registered entry points of the out-of-scope device drivers.
///
/// Defaults to no-ops; the embedder (or a test) registers real handlers.
/// Registration is a plain atomic store, safe from any context.
pub struct DeviceHandlers {
    ide: AtomicPtr<()>,
    keyboard: AtomicPtr<()>,
    com1: AtomicPtr<()>,
}

impl DeviceHandlers {
    pub(crate) const fn new() -> Self {
        Self {
            ide: AtomicPtr::new(null_handler as *mut ()),
            keyboard: AtomicPtr::new(null_handler as *mut ()),
            com1: AtomicPtr::new(null_handler as *mut ()),
        }
    }

    /// Registers the disk interrupt handler.
    pub fn set_ide_handler(&self, handler: IrqHandler) {
        self.ide.store(handler as *mut (), Ordering::Release);
    }

    /// Registers the keyboard interrupt handler.
    pub fn set_keyboard_handler(&self, handler: IrqHandler) {
        self.keyboard.store(handler as *mut (), Ordering::Release);
    }

    /// Registers the serial port interrupt handler.
    pub fn set_com1_handler(&self, handler: IrqHandler) {
        self.com1.store(handler as *mut (), Ordering::Release);
    }

    pub(crate) fn run_ide(&self) {
        Self::run(&self.ide);
    }

    pub(crate) fn run_keyboard(&self) {
        Self::run(&self.keyboard);
    }

    pub(crate) fn run_com1(&self) {
        Self::run(&self.com1);
    }

    fn run(slot: &AtomicPtr<()>) {
        let ptr = slot.load(Ordering::Acquire);
        // SAFETY: Only valid `IrqHandler` function pointers (or the
        // initial no-op) are ever stored into these slots.
        let handler: IrqHandler = unsafe { core::mem::transmute(ptr) };
        handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn eoi_counts_per_line() {
        let intc = InterruptController::new();
        intc.end_of_interrupt(0);
        intc.end_of_interrupt(0);
        intc.end_of_interrupt(14);
        assert_eq!(intc.acknowledged(0), 2);
        assert_eq!(intc.acknowledged(14), 1);
        assert_eq!(intc.acknowledged(1), 0);
    }

    static IDE_CALLS: StdAtomicUsize = StdAtomicUsize::new(0);

    fn ide_handler() {
        IDE_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn registered_handler_runs() {
        let devices = DeviceHandlers::new();
        // The default no-op must not crash.
        devices.run_ide();
        assert_eq!(IDE_CALLS.load(Ordering::SeqCst), 0);

        devices.set_ide_handler(ide_handler);
        devices.run_ide();
        assert_eq!(IDE_CALLS.load(Ordering::SeqCst), 1);
    }
}
