//! Schedule descriptors: qTD and qH hardware images plus the software
//! records wrapped around them.
//!
//! Every descriptor is two linked objects: a software record owned by the
//! driver and a 32-byte-aligned hardware image the controller DMA-walks.
//! Images live in DMA-coherent memory handed out by the platform; all field
//! access is volatile and every sequence of writes the hardware may observe
//! ends in [`crate::mem_dmb`].

use alloc::sync::Arc;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::mem;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::platform::UsbPlatform;
use crate::UsbError;

/// Buffer pointer slots per descriptor (4 KiB pages, ~20 KiB per qTD).
pub const NBUFS: usize = 5;

/// A 32-bit word shared with the DMA consumer. Reads and writes are
/// volatile; ordering against the hardware is the caller's business.
#[repr(transparent)]
pub(crate) struct HwWord(UnsafeCell<u32>);

// The controller and the driver both touch these words; the linking
// protocols in `sched`/`transfer` serialize the driver side.
unsafe impl Send for HwWord {}
unsafe impl Sync for HwWord {}

impl HwWord {
    #[inline]
    pub fn get(&self) -> u32 {
        unsafe { ptr::read_volatile(self.0.get()) }
    }

    #[inline]
    pub fn set(&self, value: u32) {
        unsafe { ptr::write_volatile(self.0.get(), value) }
    }

    #[inline]
    pub fn update(&self, f: impl FnOnce(u32) -> u32) {
        self.set(f(self.get()));
    }
}

/// Link-pointer encoding shared by frame-list entries, qH horizontal
/// pointers and qTD next pointers.
pub mod link {
    /// Terminate bit: traversal stops here.
    pub const TERMINATE: u32 = 1 << 0;
    /// Link type: Queue Head.
    pub const TYPE_QH: u32 = 1 << 1;
    /// The canonical invalid pointer.
    pub const INVALID: u32 = TERMINATE;

    /// Encode a pointer to a qH hardware image.
    pub fn qh(paddr: u32) -> u32 {
        (paddr & !0x1f) | TYPE_QH
    }

    /// Encode a pointer to a qTD hardware image.
    pub fn qtd(paddr: u32) -> u32 {
        paddr & !0x1f
    }
}

/// qTD token fields.
pub mod token {
    pub const PING: u32 = 1 << 0;
    pub const SPLIT: u32 = 1 << 1;
    pub const MISSED_UFRAME: u32 = 1 << 2;
    pub const XACT_ERR: u32 = 1 << 3;
    pub const BABBLE: u32 = 1 << 4;
    pub const BUFFER_ERR: u32 = 1 << 5;
    pub const HALTED: u32 = 1 << 6;
    pub const ACTIVE: u32 = 1 << 7;
    /// PID code shift (OUT/IN/SETUP).
    pub const PID_SHIFT: u32 = 8;
    /// Error counter shift.
    pub const CERR_SHIFT: u32 = 10;
    /// Interrupt On Complete.
    pub const IOC: u32 = 1 << 15;
    /// Total Bytes to Transfer shift.
    pub const BYTES_SHIFT: u32 = 16;
    /// Total Bytes to Transfer mask.
    pub const BYTES_MASK: u32 = 0x7fff << 16;
    /// Data toggle.
    pub const TOGGLE: u32 = 1 << 31;
    /// Status bits cleared when restarting a halted queue; PING and ACTIVE
    /// survive.
    pub const STATUS_CLEAR: u32 = 0x7e;

    /// Remaining byte count carried in a token.
    pub fn bytes(token: u32) -> usize {
        ((token & BYTES_MASK) >> BYTES_SHIFT) as usize
    }
}

bitflags! {
    /// Error states a qTD can retire with.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TdError: u32 {
        const XACT = token::XACT_ERR;
        const BABBLE = token::BABBLE;
        const BUFFER = token::BUFFER_ERR;
        const HALTED = token::HALTED;
    }
}

impl TdError {
    /// Extract the error bits of a token.
    pub fn from_token(token: u32) -> TdError {
        TdError::from_bits_truncate(token)
    }
}

/// Token PID codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

impl Pid {
    pub(crate) fn token_bits(self) -> u32 {
        (self as u32) << token::PID_SHIFT
    }
}

/// qH endpoint-characteristics (`info[0]`) and schedule-mask (`info[1]`)
/// fields.
pub mod qh_info {
    /// Device address mask.
    pub const DEVADDR_MASK: u32 = 0x7f;
    /// Endpoint number shift.
    pub const ENDPT_SHIFT: u32 = 8;
    /// Endpoint speed shift.
    pub const EPS_SHIFT: u32 = 12;
    /// Endpoint speed: high speed.
    pub const EPS_HIGH: u32 = 2 << EPS_SHIFT;
    /// Data Toggle Control: take the toggle from the qTD.
    pub const DTC: u32 = 1 << 14;
    /// Head of Reclamation List (the async sentinel).
    pub const HEAD: u32 = 1 << 15;
    /// Maximum packet length shift.
    pub const MAXPKT_SHIFT: u32 = 16;
    /// Maximum packet length mask.
    pub const MAXPKT_MASK: u32 = 0x7ff << MAXPKT_SHIFT;
    /// Control Endpoint flag (full/low-speed control pipes).
    pub const CTRL: u32 = 1 << 27;
    /// NAK count reload shift.
    pub const RL_SHIFT: u32 = 28;

    /// `info[1]` S-mask covering every microframe.
    pub const SMASK_ALL: u32 = 0xff;
    /// `info[1]` split-completion mask, nominally all ones until split
    /// transactions are scheduled for real.
    pub const CMASK_ALL: u32 = 0xff << 8;

    /// Device address carried in `info[0]`.
    pub fn devaddr(info: u32) -> u32 {
        info & DEVADDR_MASK
    }

    /// Max packet length carried in `info[0]`.
    pub fn max_packet(info: u32) -> u32 {
        (info & MAXPKT_MASK) >> MAXPKT_SHIFT
    }
}

/// qTD hardware image: next/alternate pointers, token, five buffer-pointer
/// pairs. Padded to its 32-byte alignment.
#[repr(C, align(32))]
pub(crate) struct QtdHw {
    pub next: HwWord,
    pub alt_next: HwWord,
    pub token: HwWord,
    pub buf: [HwWord; NBUFS],
    pub buf_hi: [HwWord; NBUFS],
}

const_assert_eq!(mem::size_of::<QtdHw>(), 64);
const_assert_eq!(mem::align_of::<QtdHw>(), 32);

/// qH hardware image: horizontal link, two info words, current pointer and
/// the transfer overlay.
#[repr(C, align(32))]
pub(crate) struct QhHw {
    pub horizontal: HwWord,
    pub info: [HwWord; 2],
    pub current: HwWord,
    pub next_qtd: HwWord,
    pub alt_next_qtd: HwWord,
    pub token: HwWord,
    pub buf: [HwWord; NBUFS],
    pub buf_hi: [HwWord; NBUFS],
}

const_assert_eq!(mem::size_of::<QhHw>(), 96);
const_assert_eq!(mem::align_of::<QhHw>(), 32);

/// A hardware image in DMA-coherent memory, freed back to the platform when
/// the owning record is dropped.
pub(crate) struct Dma<T> {
    ptr: NonNull<T>,
    paddr: u32,
    platform: Arc<dyn UsbPlatform>,
}

unsafe impl<T: Send + Sync> Send for Dma<T> {}
unsafe impl<T: Send + Sync> Sync for Dma<T> {}

impl<T> Dma<T> {
    /// Allocate a zeroed image.
    pub fn new_zeroed(platform: &Arc<dyn UsbPlatform>) -> Result<Dma<T>, UsbError> {
        let size = mem::size_of::<T>();
        let align = mem::align_of::<T>();
        let raw = platform.dma_alloc(size, align).ok_or(UsbError::NoMemory)?;
        unsafe { ptr::write_bytes(raw.as_ptr(), 0, size) };
        let paddr = platform.va2pa(raw.as_ptr());
        Ok(Dma {
            ptr: raw.cast(),
            paddr,
            platform: Arc::clone(platform),
        })
    }

    /// Bus address of the image.
    pub fn paddr(&self) -> u32 {
        self.paddr
    }

    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T> Deref for Dma<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe {
            self.platform.dma_free(
                self.ptr.cast(),
                mem::size_of::<T>(),
                mem::align_of::<T>(),
            );
        }
    }
}

/// Software record for one qTD.
pub struct Qtd {
    pub(crate) hw: Dma<QtdHw>,
    /// The qH this qTD is linked under while in flight.
    pub(crate) qh: Option<Arc<Qh>>,
}

impl Qtd {
    pub(crate) fn new(platform: &Arc<dyn UsbPlatform>) -> Result<Qtd, UsbError> {
        Ok(Qtd {
            hw: Dma::new_zeroed(platform)?,
            qh: None,
        })
    }

    /// Bus address of the hardware image.
    pub(crate) fn paddr(&self) -> u32 {
        self.hw.paddr()
    }

    /// Identity of the hardware image, used to recognize the queue tail.
    pub(crate) fn hw_ptr(&self) -> NonNull<QtdHw> {
        self.hw.as_non_null()
    }
}

/// Mutable qH state. Schedule-position fields are guarded by the lock of
/// the schedule the qH sits on; `last_qtd` by the async lock.
pub(crate) struct QhState {
    /// Polling period in frames (interrupt endpoints only).
    pub period: usize,
    /// First frame-list slot this qH is linked at.
    pub phase: usize,
    /// Assigned microframe, `0xff` when the transaction may fire in any.
    pub uframe: u8,
    /// Hardware image of the last qTD currently linked under this qH.
    pub last_qtd: Option<NonNull<QtdHw>>,
    /// Next qH in the periodic slot chain (descending period order).
    pub next: Option<Arc<Qh>>,
}

// `last_qtd` is only dereferenced while the chain it tails is in flight,
// which the enqueue/retire protocol guarantees.
unsafe impl Send for QhState {}

impl QhState {
    fn cleared() -> QhState {
        QhState {
            period: 0,
            phase: 0,
            uframe: 0,
            last_qtd: None,
            next: None,
        }
    }
}

/// Software record for one queue head.
pub struct Qh {
    pub(crate) hw: Dma<QhHw>,
    pub(crate) state: Mutex<QhState>,
}

impl Qh {
    pub(crate) fn new(platform: &Arc<dyn UsbPlatform>) -> Result<Arc<Qh>, UsbError> {
        let qh = Qh {
            hw: Dma::new_zeroed(platform)?,
            state: Mutex::new(QhState::cleared()),
        };
        qh.reset();
        Ok(Arc::new(qh))
    }

    /// Bus address of the hardware image.
    pub(crate) fn paddr(&self) -> u32 {
        self.hw.paddr()
    }

    /// Return the image and record to their cleared state: all pointers
    /// invalid, no endpoint encoding, no schedule position.
    pub(crate) fn reset(&self) {
        self.hw.info[0].set(0);
        self.hw.info[1].set(0);
        self.hw.token.set(0);
        self.hw.horizontal.set(link::INVALID);
        self.hw.current.set(link::INVALID);
        self.hw.next_qtd.set(link::INVALID);
        self.hw.alt_next_qtd.set(link::INVALID);
        for i in 0..NBUFS {
            self.hw.buf[i].set(0);
            self.hw.buf_hi[i].set(0);
        }
        *self.state.lock() = QhState::cleared();
    }
}
