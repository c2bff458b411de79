//! Upward contract: the objects the USB stack hands us and the controller
//! interface it drives, plus a small registry keyed by controller type.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use spin::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::desc::{Qh, Qtd};
use crate::platform::{Roothub, UsbPlatform, UsbStack};
use crate::UsbError;

/// Transfer direction, seen from the host.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UsbDir {
    Out,
    In,
}

/// Device speed on the bus.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UsbSpeed {
    Full,
    Low,
    High,
}

impl UsbSpeed {
    /// Encoding of the qH endpoint-speed field.
    pub(crate) fn eps_bits(self) -> u32 {
        match self {
            UsbSpeed::Full => 0,
            UsbSpeed::Low => 1,
            UsbSpeed::High => 2,
        }
    }
}

/// Transfer/pipe type. Isochronous endpoints are not scheduled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
}

/// The 8-byte packet of a control transfer's setup stage.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// The slice of device state the schedule engine needs. The address is
/// atomic because enumeration re-addresses the device between transfers.
pub struct UsbDevice {
    address: AtomicU8,
    pub speed: UsbSpeed,
}

impl UsbDevice {
    pub fn new(address: u8, speed: UsbSpeed) -> Arc<UsbDevice> {
        Arc::new(UsbDevice {
            address: AtomicU8::new(address),
            speed,
        })
    }

    pub fn address(&self) -> u8 {
        self.address.load(Ordering::Acquire)
    }

    pub fn set_address(&self, address: u8) {
        self.address.store(address, Ordering::Release);
    }
}

/// One endpoint of one device. The engine parks the endpoint's qH here
/// between transfers.
pub struct Pipe {
    pub device: Arc<UsbDevice>,
    /// Endpoint number.
    pub num: u8,
    pub kind: TransferKind,
    pub dir: UsbDir,
    max_packet: AtomicU16,
    /// `bInterval` of the endpoint descriptor (interrupt pipes).
    pub interval: u8,
    pub(crate) qh: Mutex<Option<Arc<Qh>>>,
}

impl Pipe {
    pub fn new(
        device: Arc<UsbDevice>,
        num: u8,
        kind: TransferKind,
        dir: UsbDir,
        max_packet: u16,
        interval: u8,
    ) -> Arc<Pipe> {
        Arc::new(Pipe {
            device,
            num,
            kind,
            dir,
            max_packet: AtomicU16::new(max_packet),
            interval,
            qh: Mutex::new(None),
        })
    }

    pub fn max_packet(&self) -> u16 {
        self.max_packet.load(Ordering::Acquire)
    }

    /// Enumeration learned the endpoint's real packet size.
    pub fn set_max_packet(&self, max_packet: u16) {
        self.max_packet.store(max_packet, Ordering::Release);
    }
}

/// A logical transfer. The buffer (and setup packet, for control
/// transfers) stay owned by the caller and must be DMA-coherent for the
/// transfer's lifetime.
pub struct Transfer {
    buffer: Option<NonNull<u8>>,
    size: usize,
    pub kind: TransferKind,
    pub dir: UsbDir,
    setup: Option<NonNull<SetupPacket>>,
    /// The qTD chain currently materializing this transfer.
    pub(crate) chain: Mutex<Vec<Qtd>>,
}

// The raw buffer pointers are only dereferenced by the hardware and by the
// roothub status copy; the caller keeps them alive and coherent.
unsafe impl Send for Transfer {}
unsafe impl Sync for Transfer {}

impl Transfer {
    pub fn new(
        kind: TransferKind,
        dir: UsbDir,
        buffer: Option<NonNull<u8>>,
        size: usize,
        setup: Option<NonNull<SetupPacket>>,
    ) -> Arc<Transfer> {
        Arc::new(Transfer {
            buffer,
            size,
            kind,
            dir,
            setup,
            chain: Mutex::new(Vec::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn buffer(&self) -> Option<NonNull<u8>> {
        self.buffer
    }

    pub(crate) fn buffer_ptr(&self) -> Option<*mut u8> {
        self.buffer.map(NonNull::as_ptr)
    }

    pub(crate) fn setup_ptr(&self) -> Option<*mut u8> {
        self.setup.map(|p| p.as_ptr().cast())
    }
}

/// The operations a host-controller driver exports to the USB stack.
pub trait HostController: Send + Sync {
    fn controller_type(&self) -> &'static str;
    fn transfer_enqueue(
        &self,
        transfer: &Arc<Transfer>,
        pipe: &Arc<Pipe>,
    ) -> Result<(), UsbError>;
    fn transfer_dequeue(&self, transfer: &Arc<Transfer>);
    fn pipe_destroy(&self, pipe: &Arc<Pipe>);
    fn roothub_status(&self) -> u32;
}

/// Everything a driver needs to bring a controller up.
pub struct HcdConfig {
    /// Virtual address of the register base (`USBBASE`).
    pub base: usize,
    /// Controller interrupt line.
    pub irq: u32,
    pub platform: Arc<dyn UsbPlatform>,
    pub stack: Arc<dyn UsbStack>,
    pub roothub: Arc<dyn Roothub>,
}

/// A registered host-controller driver.
pub struct HcdDriver {
    pub type_name: &'static str,
    pub probe: fn(HcdConfig) -> Result<Arc<dyn HostController>, UsbError>,
}

const MAX_HCD_DRIVERS: usize = 4;

static DRIVERS: Mutex<heapless::Vec<&'static HcdDriver, MAX_HCD_DRIVERS>> =
    Mutex::new(heapless::Vec::new());

/// Register a driver with the HCD registry. Idempotent per type name.
pub fn register(driver: &'static HcdDriver) {
    let mut drivers = DRIVERS.lock();
    if drivers.iter().any(|d| d.type_name == driver.type_name) {
        return;
    }
    let _ = drivers.push(driver);
}

/// Look a registered driver up by its type name.
pub fn lookup(type_name: &str) -> Option<&'static HcdDriver> {
    DRIVERS
        .lock()
        .iter()
        .copied()
        .find(|d| d.type_name == type_name)
}
