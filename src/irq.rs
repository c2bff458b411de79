//! Interrupt path: the hard-IRQ latch/acknowledge loop and the soft
//! completion service.
//!
//! The hard handler never clears the sticky word; bits accumulate across
//! wakeups because some platforms deliver the line edge-triggered and a
//! fresh `USBSTS` read would lose anything that fired in between. The soft
//! thread clears bits only from its sticky copy and never writes `USBSTS`.

use bitflags::bitflags;
use core::cmp;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::platform::IrqHandler;
use crate::Ehci;

use tock_registers::interfaces::{Readable, Writeable};

bitflags! {
    /// `USBSTS` bits the driver reacts to.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct IrqStatus: u32 {
        /// Transaction with IOC retired.
        const UI = 1 << 0;
        /// Transaction error.
        const UEI = 1 << 1;
        /// Port change detect.
        const PCI = 1 << 2;
        /// Frame list rollover.
        const FRI = 1 << 3;
        /// Host system error; the controller has halted.
        const SEI = 1 << 4;
    }
}

impl IrqStatus {
    /// Bits that count as "this controller interrupted".
    pub const HANDLED: IrqStatus = IrqStatus::UI
        .union(IrqStatus::UEI)
        .union(IrqStatus::PCI)
        .union(IrqStatus::SEI);
}

impl Ehci {
    /// Hard-IRQ body: latch `USBSTS`, acknowledge by writing the bits back,
    /// fold them into the sticky word and re-read until the register is
    /// quiet.
    pub(crate) fn handle_irq(&self) -> bool {
        let op = self.op();
        let ack = (IrqStatus::HANDLED | IrqStatus::FRI).bits();

        let mut current = op.usbsts.get();
        loop {
            op.usbsts.set(current & ack);
            self.status.fetch_or(current, Ordering::AcqRel);

            current = op.usbsts.get();
            if current & IrqStatus::HANDLED.bits() == 0 {
                break;
            }
        }

        self.status.load(Ordering::Acquire) & IrqStatus::HANDLED.bits() != 0
    }

    /// One soft-thread iteration: sleep until the hard handler signals,
    /// then drain the sticky status.
    pub(crate) fn irq_service(&self) {
        self.irq_cond.wait();

        let status = IrqStatus::from_bits_truncate(self.status.load(Ordering::Acquire));

        if status.contains(IrqStatus::SEI) {
            self.status
                .fetch_and(!IrqStatus::SEI.bits(), Ordering::AcqRel);
            self.dead.store(true, Ordering::Release);
            log::error!("host system error, controller halted");
            return;
        }

        if status.intersects(IrqStatus::UI | IrqStatus::UEI) {
            self.status
                .fetch_and(!(IrqStatus::UI | IrqStatus::UEI).bits(), Ordering::AcqRel);
            let mut transfers = self.transfers.lock();
            self.trans_update(&mut transfers);
        }

        if status.contains(IrqStatus::PCI) {
            self.status
                .fetch_and(!IrqStatus::PCI.bits(), Ordering::AcqRel);
            self.port_status_changed();
        }
    }

    /// Deliver the root hub's port bitmap to the pending status transfer.
    fn port_status_changed(&self) {
        let status = self.roothub.hub_status();
        if status == 0 {
            return;
        }
        let Some(transfer) = self.roothub.status_transfer() else {
            return;
        };
        if self.stack.transfer_check(&transfer) {
            return;
        }

        if let Some(buffer) = transfer.buffer() {
            let bytes = status.to_le_bytes();
            let n = cmp::min(bytes.len(), transfer.size());
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.as_ptr(), n) };
        }
        self.stack
            .transfer_finished(&transfer, transfer.size() as i32);
    }
}

impl IrqHandler for Ehci {
    fn handle(&self) -> bool {
        self.handle_irq()
    }
}
