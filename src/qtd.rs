//! qTD builder.
//!
//! A logical transfer rarely fits the five buffer pages of one qTD; the
//! builder walks the host buffer, emitting descriptors until the size is
//! consumed. Page 1 keeps the buffer's page offset, pages 2-5 are
//! page-aligned, and a descriptor that cannot hold the whole remainder is
//! trimmed back to a max-packet boundary so only the final descriptor may
//! end in a short packet.

use alloc::vec::Vec;
use core::cmp;

use crate::desc::{link, token, Pid, Qtd, NBUFS};
use crate::platform::UsbPlatform;
use crate::{Ehci, UsbError, EHCI_TRANS_ERRORS};

/// Hardware buffer page size.
pub(crate) const EHCI_PAGE_SIZE: usize = 4096;

/// Encode one qTD: token plus up to five pages of `data`, consuming the
/// bytes it managed to cover from `*size`.
pub(crate) fn qtd_fill(
    qtd: &Qtd,
    platform: &dyn UsbPlatform,
    pid: Pid,
    max_packet: usize,
    data: Option<*mut u8>,
    size: &mut usize,
    toggle: bool,
) {
    let hw = &qtd.hw;
    let mut tok = pid.token_bits() | (EHCI_TRANS_ERRORS << token::CERR_SHIFT) | token::ACTIVE;
    if toggle {
        tok |= token::TOGGLE;
    }

    hw.next.set(link::INVALID);
    hw.alt_next.set(link::INVALID);

    if let Some(base) = data {
        let mut p = base;
        let mut bytes;

        hw.buf[0].set(platform.va2pa(p));
        hw.buf_hi[0].set(0);
        let page_offs = hw.buf[0].get() as usize & (EHCI_PAGE_SIZE - 1);
        bytes = cmp::min(EHCI_PAGE_SIZE - page_offs, *size);
        p = p.wrapping_add(bytes);

        let mut i = 1;
        while i < NBUFS && bytes != *size {
            hw.buf[i].set(platform.va2pa(p) & !(EHCI_PAGE_SIZE as u32 - 1));
            hw.buf_hi[i].set(0);

            let mut offs = cmp::min(*size - bytes, EHCI_PAGE_SIZE);
            // The remainder spills into the next qTD: stop on a packet
            // boundary so no intermediate descriptor short-packets.
            if i == NBUFS - 1 && bytes + offs < *size {
                offs = ((bytes + offs) / max_packet) * max_packet - bytes;
            }

            bytes += offs;
            p = p.wrapping_add(offs);
            i += 1;
        }

        while i < NBUFS {
            hw.buf[i].set(0);
            hw.buf_hi[i].set(0);
            i += 1;
        }

        tok |= (bytes as u32) << token::BYTES_SHIFT;
        *size -= bytes;
    } else {
        for i in 0..NBUFS {
            hw.buf[i].set(0);
            hw.buf_hi[i].set(0);
        }
    }

    hw.token.set(tok);
}

impl Ehci {
    /// Acquire a qTD (pooled or fresh) and encode one hop of a transfer.
    pub(crate) fn qtd_alloc(
        &self,
        pid: Pid,
        max_packet: usize,
        data: Option<*mut u8>,
        size: &mut usize,
        toggle: bool,
    ) -> Result<Qtd, UsbError> {
        let pooled = self.async_shared.lock().pools.get_qtd();
        let qtd = match pooled {
            Some(qtd) => qtd,
            None => Qtd::new(&self.platform)?,
        };
        qtd_fill(&qtd, &*self.platform, pid, max_packet, data, size, toggle);
        Ok(qtd)
    }

    /// Materialize `size` bytes of `data` as a chain of qTDs, flipping the
    /// data toggle between them.
    pub(crate) fn qtd_add(
        &self,
        list: &mut Vec<Qtd>,
        pid: Pid,
        max_packet: usize,
        data: Option<*mut u8>,
        size: usize,
        toggle: bool,
    ) -> Result<(), UsbError> {
        let mut remaining = size;
        let mut toggle = toggle;
        loop {
            let cursor = data.map(|d| d.wrapping_add(size - remaining));
            let qtd = self.qtd_alloc(pid, max_packet, cursor, &mut remaining, toggle)?;
            list.push(qtd);
            toggle = !toggle;
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }
}
