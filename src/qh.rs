//! Queue-head management: allocation, endpoint encoding, reconfiguration.

use alloc::sync::Arc;

use crate::desc::{qh_info, Qh};
use crate::hcd::{Pipe, TransferKind, UsbSpeed};
use crate::{Ehci, UsbError, EHCI_NAK_RELOAD};

/// Polling period of an interrupt endpoint, in frames.
///
/// High-speed devices express `bInterval` as a microframe exponent; a result
/// below one frame means the transaction may fire in every microframe.
/// Full/low-speed devices behind the high-speed bus poll at the largest
/// power of two below their millisecond interval.
pub(crate) fn interrupt_period(speed: UsbSpeed, interval: u8) -> usize {
    match speed {
        UsbSpeed::High => {
            let period = (1usize << (interval.max(1) - 1)) >> 3;
            if period == 0 { 1 } else { period }
        }
        _ => {
            let mut period = 1usize;
            while period * 2 < interval as usize {
                period *= 2;
            }
            period
        }
    }
}

/// Encode the pipe's endpoint parameters into `info[0]` and derive the
/// polling period for interrupt pipes. `info[1]` is filled at link time.
pub(crate) fn qh_conf(qh: &Qh, pipe: &Pipe) {
    let device = &pipe.device;

    let mut info = device.address() as u32;
    info |= (pipe.num as u32) << qh_info::ENDPT_SHIFT;
    info |= device.speed.eps_bits() << qh_info::EPS_SHIFT;
    if pipe.kind == TransferKind::Control {
        info |= qh_info::DTC;
        if device.speed != UsbSpeed::High {
            info |= qh_info::CTRL;
        }
    }
    info |= (pipe.max_packet() as u32) << qh_info::MAXPKT_SHIFT;
    info |= EHCI_NAK_RELOAD << qh_info::RL_SHIFT;

    qh.hw.info[0].set(info);
    qh.hw.info[1].set(0);

    if pipe.kind == TransferKind::Interrupt {
        qh.state.lock().period = interrupt_period(device.speed, pipe.interval);
    }
}

impl Ehci {
    /// Acquire a qH in its cleared state: no endpoint encoding, every
    /// pointer invalid.
    pub(crate) fn qh_alloc(&self) -> Result<Arc<Qh>, UsbError> {
        if let Some(qh) = self.async_shared.lock().pools.get_qh() {
            qh.reset();
            return Ok(qh);
        }
        Qh::new(&self.platform)
    }

    /// Return an unlinked qH to the pool.
    pub(crate) fn qh_put(&self, qh: Arc<Qh>) {
        self.async_shared.lock().pools.put_qh(qh);
    }
}
