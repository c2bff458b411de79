//! Collaborator interfaces.
//!
//! The schedule engine talks to the rest of the system through three narrow
//! seams: the platform (DMA-coherent memory, address translation, interrupts,
//! threads), the upstream USB stack (completion callbacks) and the root hub
//! emulation. Each is a trait object so the engine can be driven by real
//! board glue or by a test harness.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::hcd::{Transfer, UsbDevice};
use crate::UsbError;

/// Platform services required by the controller.
///
/// `dma_alloc` must hand out memory the controller can read and write
/// coherently with the CPU; `va2pa` translates any such pointer (and any
/// transfer buffer) to the 32-bit bus address the hardware descriptors carry.
pub trait UsbPlatform: Send + Sync {
    /// Allocate `size` bytes of DMA-coherent memory with the given alignment.
    fn dma_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Release memory obtained from [`UsbPlatform::dma_alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from a `dma_alloc` call with the same `size` and
    /// `align`, and the hardware must no longer reference it.
    unsafe fn dma_free(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Translate a virtual address to the 32-bit bus address seen by the
    /// controller.
    fn va2pa(&self, va: *const u8) -> u32;

    /// Sleep for at least `us` microseconds.
    fn usleep(&self, us: u32);

    /// Bind `handler` to the controller interrupt line.
    ///
    /// The platform must invoke [`IrqHandler::handle`] in hard-IRQ context
    /// and signal `cond` whenever it returns `true`.
    fn irq_attach(
        &self,
        irq: u32,
        handler: Arc<dyn IrqHandler>,
        cond: Arc<dyn UsbCond>,
    ) -> Result<(), UsbError>;

    /// Spawn a long-lived service thread.
    fn spawn(
        &self,
        name: &'static str,
        priority: u8,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<(), UsbError>;

    /// Create a condition object for IRQ-to-thread wakeups.
    fn cond_create(&self) -> Arc<dyn UsbCond>;

    /// Board-specific PHY bring-up, run before the controller is touched.
    fn phy_init(&self) -> Result<(), UsbError> {
        Ok(())
    }
}

/// A binary wakeup event connecting the hard IRQ handler to the completion
/// thread. `signal` must be callable from IRQ context.
pub trait UsbCond: Send + Sync {
    /// Block until the next [`UsbCond::signal`].
    fn wait(&self);

    /// Wake the waiter. Signals may coalesce; the waiter re-reads shared
    /// state after every wakeup.
    fn signal(&self);
}

/// Hard-IRQ entry point implemented by the controller.
pub trait IrqHandler: Send + Sync {
    /// Latch and acknowledge hardware status. Returns `true` if the
    /// interrupt was consumed.
    fn handle(&self) -> bool;
}

/// Callbacks into the upstream USB stack.
pub trait UsbStack: Send + Sync {
    /// A transfer retired with `status`: non-negative byte count, or a
    /// negative value whose magnitude counts the failed transactions.
    ///
    /// Called with the controller's transfer list locked; the callback must
    /// not re-enter the controller synchronously.
    fn transfer_finished(&self, transfer: &Arc<Transfer>, status: i32);

    /// Whether `transfer` has already been completed upstream.
    fn transfer_check(&self, transfer: &Arc<Transfer>) -> bool;

    /// Whether `device` is the emulated root hub rather than a device on
    /// the bus.
    fn is_roothub(&self, device: &Arc<UsbDevice>) -> bool;
}

/// Root hub emulation, driven from port-change interrupts and from requests
/// addressed to the hub device.
pub trait Roothub: Send + Sync {
    /// Current port status bitmap.
    fn hub_status(&self) -> u32;

    /// Handle a transfer addressed to the root hub.
    fn req(&self, transfer: &Arc<Transfer>) -> Result<(), UsbError>;

    /// The pending hub status transfer, if the upstream hub driver has one
    /// outstanding.
    fn status_transfer(&self) -> Option<Arc<Transfer>>;
}
