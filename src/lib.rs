//! EHCI (USB 2.0) host controller driver core.
//!
//! This crate is the schedule engine of an EHCI host-controller driver: it
//! owns the qH/qTD graphs the controller DMA-walks, links and unlinks them
//! concurrently with the hardware consumer, fragments logical transfers
//! across descriptor buffer pages, band-allocates periodic endpoints and
//! retires completed work from the interrupt path.
//!
//! Platform services (DMA-coherent memory, interrupt binding, threads), the
//! upstream USB stack and the root hub emulation are reached through the
//! traits in [`platform`]; the stack drives the engine through
//! [`hcd::HostController`].
//!
//! # References
//! - EHCI Specification 1.0

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod desc;
pub mod hcd;
pub mod platform;
pub mod regs;

mod irq;
mod pool;
mod qh;
mod qtd;
mod sched;
mod transfer;

#[cfg(test)]
mod testutil;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use desc::{link, qh_info, Dma, Qh};
use hcd::{HcdConfig, HcdDriver, HostController, Pipe, Transfer};
use platform::{Roothub, UsbCond, UsbPlatform, UsbStack};
use regs::{EhciOpRegs, CONFIGFLAG, USBCMD, USBINTR, USBSTS};
use sched::{AsyncShared, FrameList, PeriodicShared};

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

#[cfg(not(feature = "imx"))]
use regs::{EhciCapRegs, CAPLENGTH_HCIVERSION, HCCPARAMS};
#[cfg(feature = "imx")]
use regs::USBMODE;

/// Frame-list slots. The i.MX-style controllers run a reduced 128-entry
/// list; everything else uses the architectural 1024.
pub const EHCI_PERIODIC_SIZE: usize = if cfg!(feature = "imx") { 128 } else { 1024 };

/// Required alignment of the periodic frame list.
pub const EHCI_PERIODIC_ALIGN: usize = 4096;

/// Cap on pooled qTD backing pairs.
pub const EHCI_MAX_QTD_POOL: usize = 64;

/// Cap on pooled qH backing pairs.
pub const EHCI_MAX_QH_POOL: usize = 32;

/// Priority of the soft completion thread.
pub const EHCI_PRIO: u8 = 2;

/// Hardware transaction retries encoded into each qTD.
pub(crate) const EHCI_TRANS_ERRORS: u32 = 3;

/// NAK count reload encoded into each qH.
pub(crate) const EHCI_NAK_RELOAD: u32 = 3;

/// Register poll budget: iterations of [`EHCI_SPIN_DELAY_US`] before a
/// handshake is declared wedged.
const EHCI_SPIN_BUDGET: usize = 10_000;
const EHCI_SPIN_DELAY_US: u32 = 10;

/// Driver-level errors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UsbError {
    /// DMA or record allocation failed.
    NoMemory,
    /// Bad argument (unaligned register base, control transfer without a
    /// setup packet, empty request).
    InvalidArg,
    /// A register handshake exceeded its poll budget.
    Timeout,
    /// A host system error halted the controller; it accepts no new work.
    ControllerDead,
}

/// Data memory barrier ordering descriptor writes against the DMA
/// consumer.
#[inline]
pub(crate) fn mem_dmb() {
    fence(Ordering::SeqCst);
}

/// One EHCI controller instance.
pub struct Ehci {
    pub(crate) platform: Arc<dyn UsbPlatform>,
    pub(crate) stack: Arc<dyn UsbStack>,
    pub(crate) roothub: Arc<dyn Roothub>,
    /// Register base (`USBBASE`); the capability bank on standard layouts.
    #[cfg_attr(feature = "imx", allow(dead_code))]
    base: usize,
    op: NonNull<EhciOpRegs>,
    /// Permanent head of the asynchronous ring (`H` bit set, no traffic).
    pub(crate) sentinel: Arc<Qh>,
    pub(crate) async_shared: Mutex<AsyncShared>,
    pub(crate) periodic: Mutex<PeriodicShared>,
    pub(crate) transfers: Mutex<Vec<Arc<Transfer>>>,
    /// Sticky `USBSTS` copy accumulated by the hard handler.
    pub(crate) status: AtomicU32,
    pub(crate) irq_cond: Arc<dyn UsbCond>,
    pub(crate) dead: AtomicBool,
}

// The register pointer is only used through volatile accesses and all
// shared driver state sits behind locks or atomics.
unsafe impl Send for Ehci {}
unsafe impl Sync for Ehci {}

impl Ehci {
    /// Bring a controller up: allocate the schedule skeleton, attach the
    /// interrupt path and run the hardware init sequence.
    pub fn init(cfg: HcdConfig) -> Result<Arc<Ehci>, UsbError> {
        let HcdConfig {
            base,
            irq,
            platform,
            stack,
            roothub,
        } = cfg;

        if base & 0x1f != 0 {
            log::error!("USBBASE not aligned to 32 bytes");
            return Err(UsbError::InvalidArg);
        }

        platform.phy_init()?;

        let frame_list: Dma<FrameList> = Dma::new_zeroed(&platform)?;
        for entry in frame_list.entries.iter() {
            entry.set(link::INVALID);
        }
        let mut nodes: Vec<Option<Arc<Qh>>> = Vec::new();
        nodes.resize(EHCI_PERIODIC_SIZE, None);

        // The dummy head makes ring splices free of empty-list cases and
        // must exist before the controller starts.
        let sentinel = Qh::new(&platform)?;
        sentinel.hw.info[0].set(qh_info::HEAD);
        sentinel.hw.horizontal.set(link::qh(sentinel.paddr()));

        #[cfg(feature = "imx")]
        let op_base = base;
        #[cfg(not(feature = "imx"))]
        let op_base = {
            let cap = unsafe { &*(base as *const EhciCapRegs) };
            base + cap
                .caplength_hciversion
                .read(CAPLENGTH_HCIVERSION::CAPLENGTH) as usize
        };
        let op = NonNull::new(op_base as *mut EhciOpRegs).ok_or(UsbError::InvalidArg)?;

        let irq_cond = platform.cond_create();

        let ehci = Arc::new(Ehci {
            platform,
            stack,
            roothub,
            base,
            op,
            sentinel,
            async_shared: AsyncShared::new(),
            periodic: Mutex::new(PeriodicShared {
                list: frame_list,
                nodes,
            }),
            transfers: Mutex::new(Vec::new()),
            status: AtomicU32::new(0),
            irq_cond,
            dead: AtomicBool::new(false),
        });

        log::debug!("attaching handler to irq={}", irq);
        ehci.platform
            .irq_attach(irq, ehci.clone(), ehci.irq_cond.clone())?;

        let service = ehci.clone();
        ehci.platform.spawn(
            "ehci-irq",
            EHCI_PRIO,
            Box::new(move || loop {
                service.irq_service();
            }),
        )?;

        ehci.hc_init()?;
        log::debug!("host controller initialized");
        Ok(ehci)
    }

    pub(crate) fn op(&self) -> &EhciOpRegs {
        unsafe { self.op.as_ref() }
    }

    /// Poll `cond` with a bounded budget instead of spinning forever on a
    /// possibly wedged controller.
    pub(crate) fn spin_until(&self, cond: impl Fn() -> bool) -> Result<(), UsbError> {
        for _ in 0..EHCI_SPIN_BUDGET {
            if cond() {
                return Ok(());
            }
            self.platform.usleep(EHCI_SPIN_DELAY_US);
        }
        Err(UsbError::Timeout)
    }

    /// The hardware init sequence: halt, reset, program the schedules and
    /// interrupt enables, run, route ports, start async.
    fn hc_init(&self) -> Result<(), UsbError> {
        let op = self.op();

        // Halt before reset. The i.MX variant hangs on this, so it resets
        // straight away.
        #[cfg(not(feature = "imx"))]
        {
            op.usbcmd.modify(USBCMD::RS::CLEAR + USBCMD::IAAD::CLEAR);
            self.spin_until(|| self.op().usbsts.is_set(USBSTS::HCHALTED))?;
        }

        op.usbcmd.modify(USBCMD::HCRESET::SET);
        self.spin_until(|| !self.op().usbcmd.is_set(USBCMD::HCRESET))?;

        #[cfg(feature = "imx")]
        op.usbmode.modify(USBMODE::CM::Host);

        #[cfg(not(feature = "imx"))]
        {
            let cap = unsafe { &*(self.base as *const EhciCapRegs) };
            if cap.hccparams.is_set(HCCPARAMS::AC64) {
                op.ctrldssegment.set(0);
            }
        }

        op.usbintr
            .write(USBINTR::USBIE::SET + USBINTR::USBEIE::SET + USBINTR::HSEE::SET);
        op.periodiclistbase.set(self.periodic.lock().list.paddr());

        #[cfg(feature = "imx")]
        op.usbcmd.modify(USBCMD::FLS::Size128);

        op.usbcmd
            .modify(USBCMD::LHCRESET::CLEAR + USBCMD::ASE::CLEAR);
        op.usbcmd.modify(USBCMD::PSE::SET + USBCMD::RS::SET);
        self.spin_until(|| !self.op().usbsts.is_set(USBSTS::HCHALTED))?;

        // Route ports to this controller and let the hardware catch up.
        op.configflag.write(CONFIGFLAG::CF::SET);
        self.platform.usleep(50 * 1000);

        self.start_async();
        Ok(())
    }
}

impl HostController for Ehci {
    fn controller_type(&self) -> &'static str {
        "ehci"
    }

    fn transfer_enqueue(
        &self,
        transfer: &Arc<Transfer>,
        pipe: &Arc<Pipe>,
    ) -> Result<(), UsbError> {
        Ehci::transfer_enqueue(self, transfer, pipe)
    }

    fn transfer_dequeue(&self, transfer: &Arc<Transfer>) {
        Ehci::transfer_dequeue(self, transfer)
    }

    fn pipe_destroy(&self, pipe: &Arc<Pipe>) {
        Ehci::pipe_destroy(self, pipe)
    }

    fn roothub_status(&self) -> u32 {
        self.roothub.hub_status()
    }
}

fn probe(cfg: HcdConfig) -> Result<Arc<dyn HostController>, UsbError> {
    let ehci = Ehci::init(cfg)?;
    Ok(ehci)
}

/// The registry entry for this driver.
pub static EHCI_DRIVER: HcdDriver = HcdDriver {
    type_name: "ehci",
    probe,
};

/// Make the driver visible to the HCD registry. Rust has no module-load
/// constructors; board glue calls this once at startup.
pub fn register() {
    hcd::register(&EHCI_DRIVER);
}
