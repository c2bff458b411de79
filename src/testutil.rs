//! Unit-test platform: host-heap "DMA" memory with a stable va-to-pa page
//! map, so descriptor code can run without a controller.

use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::platform::{IrqHandler, UsbCond, UsbPlatform};
use crate::UsbError;

struct PageMap {
    pages: HashMap<usize, u32>,
    next: u32,
}

pub(crate) struct TestPlatform {
    map: Mutex<PageMap>,
}

impl TestPlatform {
    fn new() -> TestPlatform {
        TestPlatform {
            map: Mutex::new(PageMap {
                pages: HashMap::new(),
                next: 0x0010_0000,
            }),
        }
    }
}

impl UsbPlatform for TestPlatform {
    fn dma_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn dma_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align(size.max(1), align).unwrap();
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }

    fn va2pa(&self, va: *const u8) -> u32 {
        let addr = va as usize;
        let mut map = self.map.lock().unwrap();
        let map = &mut *map;
        let page = addr & !0xfff;
        let pa_page = *map.pages.entry(page).or_insert_with(|| {
            let p = map.next;
            map.next += 0x1000;
            p
        });
        pa_page | (addr & 0xfff) as u32
    }

    fn usleep(&self, _us: u32) {}

    fn irq_attach(
        &self,
        _irq: u32,
        _handler: Arc<dyn IrqHandler>,
        _cond: Arc<dyn UsbCond>,
    ) -> Result<(), UsbError> {
        Ok(())
    }

    fn spawn(
        &self,
        _name: &'static str,
        _priority: u8,
        _body: Box<dyn FnOnce() + Send>,
    ) -> Result<(), UsbError> {
        // Unit tests drive the engine synchronously.
        Ok(())
    }

    fn cond_create(&self) -> Arc<dyn UsbCond> {
        Arc::new(NullCond)
    }
}

struct NullCond;

impl UsbCond for NullCond {
    fn wait(&self) {}
    fn signal(&self) {}
}

pub(crate) fn test_platform() -> Arc<dyn UsbPlatform> {
    Arc::new(TestPlatform::new())
}

/// A page-aligned buffer in test "DMA" memory.
pub(crate) struct DmaBuf {
    ptr: NonNull<u8>,
    size: usize,
    platform: Arc<dyn UsbPlatform>,
}

impl DmaBuf {
    pub fn new(platform: &Arc<dyn UsbPlatform>, size: usize) -> DmaBuf {
        let ptr = platform.dma_alloc(size, 4096).unwrap();
        DmaBuf {
            ptr,
            size,
            platform: Arc::clone(platform),
        }
    }

    pub fn at(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.size);
        unsafe { self.ptr.as_ptr().add(offset) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        unsafe { self.platform.dma_free(self.ptr, self.size, 4096) };
    }
}
