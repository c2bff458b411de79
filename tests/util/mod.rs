//! Test bench: a fake platform with tracked DMA memory, a register file
//! whose "silicon" answers the controller handshakes, and helpers that walk
//! the schedules the way the hardware would.

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use ehci_hcd::hcd::{HcdConfig, Transfer, UsbDevice};
use ehci_hcd::platform::{IrqHandler, Roothub, UsbCond, UsbPlatform, UsbStack};
use ehci_hcd::regs::{OP_USBCMD, OP_USBSTS};
use ehci_hcd::{Ehci, UsbError};

// USBCMD bits.
pub const CMD_RS: u32 = 1 << 0;
pub const CMD_HCRESET: u32 = 1 << 1;
pub const CMD_PSE: u32 = 1 << 4;
pub const CMD_ASE: u32 = 1 << 5;

// USBSTS bits.
pub const STS_UI: u32 = 1 << 0;
pub const STS_UEI: u32 = 1 << 1;
pub const STS_PCI: u32 = 1 << 2;
pub const STS_FRI: u32 = 1 << 3;
pub const STS_SEI: u32 = 1 << 4;
pub const STS_HCH: u32 = 1 << 12;
pub const STS_PSS: u32 = 1 << 14;
pub const STS_AS: u32 = 1 << 15;

const STS_ACK_MASK: u32 = STS_UI | STS_UEI | STS_PCI | STS_FRI | STS_SEI;

// Descriptor field offsets.
pub const QH_HORIZONTAL: u32 = 0x00;
pub const QH_INFO0: u32 = 0x04;
pub const QH_INFO1: u32 = 0x08;
pub const QH_CURRENT: u32 = 0x0c;
pub const QH_NEXT_QTD: u32 = 0x10;
pub const QH_TOKEN: u32 = 0x18;
pub const QTD_NEXT: u32 = 0x00;
pub const QTD_ALT_NEXT: u32 = 0x04;
pub const QTD_TOKEN: u32 = 0x08;
pub const QTD_BUF0: u32 = 0x0c;

pub const TOK_ACTIVE: u32 = 1 << 7;
pub const TOK_HALTED: u32 = 1 << 6;
pub const TOK_XACT: u32 = 1 << 3;
pub const TOK_IOC: u32 = 1 << 15;
pub const TOK_TOGGLE: u32 = 1 << 31;
pub const TOK_BYTES_MASK: u32 = 0x7fff << 16;

pub fn tok_pid(token: u32) -> u32 {
    (token >> 8) & 3
}

pub fn tok_bytes(token: u32) -> u32 {
    (token & TOK_BYTES_MASK) >> 16
}

/// Offset of the operational bank behind the fake capability bank.
pub const CAP_LEN: usize = 0x10;

/// The register file backing both banks: capability words at 0, the
/// operational bank at +[`CAP_LEN`].
#[derive(Clone, Copy)]
pub struct RegBank {
    base: usize,
}

impl RegBank {
    fn new() -> RegBank {
        let layout = Layout::from_size_align(0x200, 4096).unwrap();
        let base = unsafe { alloc_zeroed(layout) } as usize;
        let bank = RegBank { base };
        // CAPLENGTH = 0x10, HCIVERSION = 1.00.
        bank.cap_write(0x00, 0x0100_0000 | CAP_LEN as u32);
        // HCCPARAMS: 64-bit capable.
        bank.cap_write(0x08, 1);
        bank
    }

    pub fn base(&self) -> usize {
        self.base
    }

    fn word(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }

    pub fn cap_read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.word(offset)) }
    }

    fn cap_write(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.word(offset), value) }
    }

    pub fn op_read(&self, offset: usize) -> u32 {
        self.cap_read(CAP_LEN + offset)
    }

    pub fn op_write(&self, offset: usize, value: u32) {
        self.cap_write(CAP_LEN + offset, value)
    }
}

struct AddrMap {
    va2pa: HashMap<usize, u32>,
    pa2va: HashMap<u32, usize>,
    next: u32,
}

pub struct TestPlatform {
    pub regs: RegBank,
    map: Mutex<AddrMap>,
    handler: Mutex<Option<Arc<dyn IrqHandler>>>,
    cond: Mutex<Option<Arc<dyn UsbCond>>>,
}

impl TestPlatform {
    pub fn new() -> Arc<TestPlatform> {
        Arc::new(TestPlatform {
            regs: RegBank::new(),
            map: Mutex::new(AddrMap {
                va2pa: HashMap::new(),
                pa2va: HashMap::new(),
                next: 0x0100_0000,
            }),
            handler: Mutex::new(None),
            cond: Mutex::new(None),
        })
    }

    fn map_page(&self, va_page: usize) -> u32 {
        let mut map = self.map.lock().unwrap();
        let map = &mut *map;
        *map.va2pa.entry(va_page).or_insert_with(|| {
            let pa = map.next;
            map.next += 0x1000;
            map.pa2va.insert(pa, va_page);
            pa
        })
    }

    /// Virtual address backing a bus address handed to the hardware.
    pub fn va_of(&self, pa: u32) -> usize {
        let map = self.map.lock().unwrap();
        map.pa2va[&(pa & !0xfff)] + (pa & 0xfff) as usize
    }

    pub fn read32(&self, pa: u32) -> u32 {
        unsafe { ptr::read_volatile(self.va_of(pa) as *const u32) }
    }

    pub fn write32(&self, pa: u32, value: u32) {
        unsafe { ptr::write_volatile(self.va_of(pa) as *mut u32, value) }
    }

    /// One silicon step: finish a pending reset and track the run/stop and
    /// schedule-enable handshakes. Runs on every `usleep` poll.
    fn step(&self) {
        let regs = &self.regs;
        let mut cmd = regs.op_read(OP_USBCMD);
        if cmd & CMD_HCRESET != 0 {
            cmd &= !(CMD_HCRESET | CMD_RS);
            regs.op_write(OP_USBCMD, cmd);
        }

        let mut sts = regs.op_read(OP_USBSTS);
        sts &= !(STS_HCH | STS_AS | STS_PSS);
        if cmd & CMD_RS == 0 {
            sts |= STS_HCH;
        } else {
            if cmd & CMD_ASE != 0 {
                sts |= STS_AS;
            }
            if cmd & CMD_PSE != 0 {
                sts |= STS_PSS;
            }
        }
        regs.op_write(OP_USBSTS, sts);
    }

    /// Assert the interrupt line with `bits` and run the hard handler the
    /// way platform IRQ glue would. The ack loop busy-polls until the
    /// "controller" deasserts, then the registered condition is signaled.
    pub fn raise_irq(&self, bits: u32) {
        let regs = self.regs;
        regs.op_write(OP_USBSTS, regs.op_read(OP_USBSTS) | bits);

        let clearer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            regs.op_write(OP_USBSTS, regs.op_read(OP_USBSTS) & !STS_ACK_MASK);
        });

        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .expect("irq handler not attached");
        let handled = handler.handle();
        clearer.join().unwrap();

        if handled {
            self.cond.lock().unwrap().clone().unwrap().signal();
        }
    }
}

impl UsbPlatform for TestPlatform {
    fn dma_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // Keep sub-page allocations inside one page so bus addresses stay
        // offset-linear within each descriptor.
        let align = align.max(size.max(1).next_power_of_two().min(4096));
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let raw = NonNull::new(unsafe { alloc_zeroed(layout) })?;

        let base = raw.as_ptr() as usize;
        let mut page = base & !0xfff;
        while page < base + size.max(1) {
            self.map_page(page);
            page += 0x1000;
        }
        Some(raw)
    }

    unsafe fn dma_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let align = align.max(size.max(1).next_power_of_two().min(4096));
        let layout = Layout::from_size_align(size.max(1), align).unwrap();
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }

    fn va2pa(&self, va: *const u8) -> u32 {
        let addr = va as usize;
        self.map_page(addr & !0xfff) | (addr as u32 & 0xfff)
    }

    fn usleep(&self, _us: u32) {
        self.step();
    }

    fn irq_attach(
        &self,
        _irq: u32,
        handler: Arc<dyn IrqHandler>,
        cond: Arc<dyn UsbCond>,
    ) -> Result<(), UsbError> {
        *self.handler.lock().unwrap() = Some(handler);
        *self.cond.lock().unwrap() = Some(cond);
        Ok(())
    }

    fn spawn(
        &self,
        _name: &'static str,
        _priority: u8,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<(), UsbError> {
        thread::spawn(move || body());
        Ok(())
    }

    fn cond_create(&self) -> Arc<dyn UsbCond> {
        Arc::new(TestCond {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        })
    }
}

struct TestCond {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl UsbCond for TestCond {
    fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.cv.wait(flag).unwrap();
        }
        *flag = false;
    }

    fn signal(&self) {
        *self.flag.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

/// Upstream-stack stand-in that records completions.
pub struct TestStack {
    finished: Mutex<Vec<(usize, i32)>>,
    cv: Condvar,
    roothub_dev: Mutex<Option<usize>>,
}

impl TestStack {
    pub fn new() -> Arc<TestStack> {
        Arc::new(TestStack {
            finished: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            roothub_dev: Mutex::new(None),
        })
    }

    pub fn mark_roothub(&self, device: &Arc<UsbDevice>) {
        *self.roothub_dev.lock().unwrap() = Some(Arc::as_ptr(device) as usize);
    }

    /// Block until `transfer` completes and return its status.
    pub fn wait_finished(&self, transfer: &Arc<Transfer>) -> i32 {
        let key = Arc::as_ptr(transfer) as usize;
        let mut finished = self.finished.lock().unwrap();
        loop {
            if let Some(&(_, status)) = finished.iter().find(|(k, _)| *k == key) {
                return status;
            }
            let (guard, timeout) = self
                .cv
                .wait_timeout(finished, Duration::from_secs(5))
                .unwrap();
            finished = guard;
            assert!(!timeout.timed_out(), "transfer did not complete");
        }
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().unwrap().len()
    }
}

impl UsbStack for TestStack {
    fn transfer_finished(&self, transfer: &Arc<Transfer>, status: i32) {
        self.finished
            .lock()
            .unwrap()
            .push((Arc::as_ptr(transfer) as usize, status));
        self.cv.notify_all();
    }

    fn transfer_check(&self, transfer: &Arc<Transfer>) -> bool {
        let key = Arc::as_ptr(transfer) as usize;
        self.finished.lock().unwrap().iter().any(|(k, _)| *k == key)
    }

    fn is_roothub(&self, device: &Arc<UsbDevice>) -> bool {
        self.roothub_dev
            .lock()
            .unwrap()
            .is_some_and(|k| k == Arc::as_ptr(device) as usize)
    }
}

/// Root-hub stand-in.
pub struct TestHub {
    pub status: Mutex<u32>,
    pub status_transfer: Mutex<Option<Arc<Transfer>>>,
    pub reqs: Mutex<Vec<usize>>,
}

impl TestHub {
    pub fn new() -> Arc<TestHub> {
        Arc::new(TestHub {
            status: Mutex::new(0),
            status_transfer: Mutex::new(None),
            reqs: Mutex::new(Vec::new()),
        })
    }
}

impl Roothub for TestHub {
    fn hub_status(&self) -> u32 {
        *self.status.lock().unwrap()
    }

    fn req(&self, transfer: &Arc<Transfer>) -> Result<(), UsbError> {
        self.reqs
            .lock()
            .unwrap()
            .push(Arc::as_ptr(transfer) as usize);
        Ok(())
    }

    fn status_transfer(&self) -> Option<Arc<Transfer>> {
        self.status_transfer.lock().unwrap().clone()
    }
}

/// A caller-owned buffer in fake DMA memory.
pub struct TestDmaBuf {
    ptr: NonNull<u8>,
    size: usize,
    platform: Arc<TestPlatform>,
}

impl TestDmaBuf {
    pub fn new(platform: &Arc<TestPlatform>, size: usize) -> TestDmaBuf {
        let ptr = platform.dma_alloc(size, 4096).unwrap();
        TestDmaBuf {
            ptr,
            size,
            platform: platform.clone(),
        }
    }

    pub fn nn(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.size);
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            )
        };
    }
}

impl Drop for TestDmaBuf {
    fn drop(&mut self) {
        unsafe { self.platform.dma_free(self.ptr, self.size, 4096) };
    }
}

/// A fully initialized controller plus its collaborators.
pub struct Bench {
    pub platform: Arc<TestPlatform>,
    pub stack: Arc<TestStack>,
    pub hub: Arc<TestHub>,
    pub hc: Arc<Ehci>,
}

pub fn bench() -> Bench {
    let platform = TestPlatform::new();
    let stack = TestStack::new();
    let hub = TestHub::new();
    let hc = Ehci::init(HcdConfig {
        base: platform.regs.base(),
        irq: 7,
        platform: platform.clone(),
        stack: stack.clone(),
        roothub: hub.clone(),
    })
    .expect("controller init");
    Bench {
        platform,
        stack,
        hub,
        hc,
    }
}

/// The async ring after the sentinel, in hardware traversal order.
pub fn async_ring(platform: &TestPlatform, sentinel_pa: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let sentinel = sentinel_pa & !0x1f;
    let mut p = platform.read32(sentinel + QH_HORIZONTAL) & !0x1f;
    let mut hops = 0;
    while p != sentinel {
        out.push(p);
        p = platform.read32(p + QH_HORIZONTAL) & !0x1f;
        hops += 1;
        assert!(hops < 64, "async ring does not close on the sentinel");
    }
    out
}

/// The qTD chain reachable from a qH's overlay next pointer.
pub fn qtd_chain(platform: &TestPlatform, qh_pa: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut p = platform.read32(qh_pa + QH_NEXT_QTD);
    while p & 1 == 0 {
        let qtd = p & !0x1f;
        out.push(qtd);
        p = platform.read32(qtd + QTD_NEXT);
    }
    out
}

/// Mark every qTD of a chain serviced: inactive, nothing left to transfer.
pub fn complete_chain(platform: &TestPlatform, chain: &[u32]) {
    for &qtd in chain {
        let token = platform.read32(qtd + QTD_TOKEN);
        platform.write32(qtd + QTD_TOKEN, token & !(TOK_BYTES_MASK | TOK_ACTIVE));
    }
}

/// Rewrite the remaining-bytes field of one qTD token.
pub fn set_remaining(platform: &TestPlatform, qtd: u32, remaining: u32) {
    let token = platform.read32(qtd + QTD_TOKEN);
    platform.write32(
        qtd + QTD_TOKEN,
        (token & !TOK_BYTES_MASK) | (remaining << 16),
    );
}
