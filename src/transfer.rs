//! Transfer engine: maps logical transfers onto qTD chains, hands them to
//! the hardware consumer and retires them once the controller is done.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::Ordering;

use crate::desc::{link, qh_info, token, Pid, Qh, Qtd, TdError};
use crate::hcd::{Pipe, SetupPacket, Transfer, TransferKind, UsbDir};
use crate::qh::qh_conf;
use crate::{mem_dmb, Ehci, UsbError};

/// Lazy cancellation: clear the active bit on every qTD of a chain so the
/// controller skips them on its next visit.
pub(crate) fn qtds_deactivate(chain: &[Qtd]) {
    for qtd in chain {
        qtd.hw.token.update(|t| t & !token::ACTIVE);
    }
    mem_dmb();
}

impl Ehci {
    /// Hand a stitched chain to a qH: append behind the current tail, or
    /// load the overlay's next pointer if the queue is empty.
    pub(crate) fn enqueue_chain(&self, qh: &Arc<Qh>, first: &Qtd, last: &Qtd) {
        let _shared = self.async_shared.lock();

        last.hw.next.set(link::INVALID);
        last.hw.token.update(|t| t | token::IOC);

        let mut st = qh.state.lock();
        match st.last_qtd {
            None => qh.hw.next_qtd.set(link::qtd(first.paddr())),
            Some(tail) => unsafe { tail.as_ref() }.next.set(link::qtd(first.paddr())),
        }
        mem_dmb();

        st.last_qtd = Some(last.hw_ptr());
    }

    /// Rearm a qH after the chain ending in `last` retired.
    pub(crate) fn continue_qh(&self, qh: &Qh, last: &Qtd) {
        let _shared = self.async_shared.lock();
        let mut st = qh.state.lock();

        // Queue is now empty.
        if st.last_qtd == Some(last.hw_ptr()) {
            st.last_qtd = None;
            qh.hw.next_qtd.set(link::INVALID);
        }

        // The queue stalled: the overlay latched an invalid next pointer
        // while a follow-up chain was being linked behind `last`.
        if qh.hw.next_qtd.get() == link::INVALID
            && qh.hw.current.get() == link::qtd(last.paddr())
        {
            qh.hw.next_qtd.set(last.hw.next.get());
        }

        // Clear a halted overlay and restart behind the failed chain.
        if !TdError::from_token(qh.hw.token.get()).is_empty() {
            qh.hw.next_qtd.set(last.hw.next.get());
            qh.hw.token.update(|t| t & !token::STATUS_CLEAR);
        }

        mem_dmb();
    }

    /// Decide whether a transfer is finished and with what status: a
    /// negative count of failed qTDs, or bytes transferred once the last
    /// qTD has retired.
    fn qtds_check(&self, transfer: &Transfer) -> Option<i32> {
        let chain = transfer.chain.lock();
        let last = chain.last()?;

        let mut errors = 0i32;
        for qtd in chain.iter() {
            if !TdError::from_token(qtd.hw.token.get()).is_empty() {
                errors += 1;
            }
        }
        if errors > 0 {
            return Some(-errors);
        }

        let tok = last.hw.token.get();
        if tok & token::ACTIVE == 0 || tok & token::HALTED != 0 {
            return Some(transfer.size() as i32 - token::bytes(tok) as i32);
        }

        None
    }

    /// Completion scan over the transfer list. Caller holds the transfer
    /// lock.
    pub(crate) fn trans_update(&self, transfers: &mut Vec<Arc<Transfer>>) {
        let mut i = 0;
        while i < transfers.len() {
            let transfer = transfers[i].clone();
            let Some(status) = self.qtds_check(&transfer) else {
                i += 1;
                continue;
            };

            let chain = mem::take(&mut *transfer.chain.lock());
            if let (Some(first), Some(last)) = (chain.first(), chain.last()) {
                if let Some(qh) = first.qh.clone() {
                    self.continue_qh(&qh, last);
                }
            }
            self.put_qtds(chain);
            transfers.remove(i);
            self.stack.transfer_finished(&transfer, status);
        }
    }

    pub(crate) fn put_qtds(&self, chain: Vec<Qtd>) {
        self.async_shared.lock().pools.put_qtds(chain);
    }

    fn build_stages(
        &self,
        chain: &mut Vec<Qtd>,
        transfer: &Transfer,
        pid: Pid,
        max_packet: usize,
    ) -> Result<(), UsbError> {
        // Setup stage, DT 0.
        if transfer.kind == TransferKind::Control {
            let setup = transfer.setup_ptr().ok_or(UsbError::InvalidArg)?;
            self.qtd_add(
                chain,
                Pid::Setup,
                max_packet,
                Some(setup),
                mem::size_of::<SetupPacket>(),
                false,
            )?;
        }

        // Data stage, DT 1.
        if (transfer.kind == TransferKind::Control && transfer.size() > 0)
            || transfer.kind == TransferKind::Bulk
            || transfer.kind == TransferKind::Interrupt
        {
            self.qtd_add(
                chain,
                pid,
                max_packet,
                transfer.buffer_ptr(),
                transfer.size(),
                true,
            )?;
        }

        // Status stage: reversed direction, zero length, DT 1.
        if transfer.kind == TransferKind::Control {
            let status_pid = match pid {
                Pid::In => Pid::Out,
                _ => Pid::In,
            };
            self.qtd_add(chain, status_pid, max_packet, None, 0, true)?;
        }

        Ok(())
    }

    /// Queue a transfer on a pipe.
    pub fn transfer_enqueue(
        &self,
        transfer: &Arc<Transfer>,
        pipe: &Arc<Pipe>,
    ) -> Result<(), UsbError> {
        if self.stack.is_roothub(&pipe.device) {
            return self.roothub.req(transfer);
        }
        if self.dead.load(Ordering::Acquire) {
            return Err(UsbError::ControllerDead);
        }

        let qh = {
            let mut slot = pipe.qh.lock();
            match slot.as_ref() {
                Some(qh) => {
                    // Enumeration may have moved the device or grown the
                    // endpoint; patch the encoding in place.
                    let address = pipe.device.address() as u32;
                    if qh_info::devaddr(qh.hw.info[0].get()) != address {
                        qh.hw.info[0]
                            .update(|v| (v & !qh_info::DEVADDR_MASK) | address);
                    }
                    let max_packet = pipe.max_packet() as u32;
                    if qh_info::max_packet(qh.hw.info[0].get()) != max_packet {
                        qh.hw.info[0].update(|v| {
                            (v & !qh_info::MAXPKT_MASK)
                                | (max_packet << qh_info::MAXPKT_SHIFT)
                        });
                    }
                    qh.clone()
                }
                None => {
                    let qh = self.qh_alloc()?;
                    qh_conf(&qh, pipe);
                    *slot = Some(qh.clone());
                    match pipe.kind {
                        TransferKind::Control | TransferKind::Bulk => {
                            self.qh_link_async(&qh)
                        }
                        TransferKind::Interrupt => self.qh_link_periodic(&qh),
                    }
                    qh
                }
            }
        };

        let pid = match transfer.dir {
            UsbDir::In => Pid::In,
            UsbDir::Out => Pid::Out,
        };
        let mut chain: Vec<Qtd> = Vec::new();
        if let Err(e) = self.build_stages(&mut chain, transfer, pid, pipe.max_packet() as usize)
        {
            self.put_qtds(chain);
            return Err(e);
        }
        if chain.is_empty() {
            return Err(UsbError::InvalidArg);
        }

        // Stitch: back-pointers plus forward hardware links. The tail link
        // and IOC are applied during the handoff.
        for i in 0..chain.len() {
            chain[i].qh = Some(qh.clone());
            if i + 1 < chain.len() {
                let next = link::qtd(chain[i + 1].paddr());
                chain[i].hw.next.set(next);
                mem_dmb();
            }
        }
        *transfer.chain.lock() = chain;

        let mut transfers = self.transfers.lock();
        transfers.push(transfer.clone());
        {
            let chain = transfer.chain.lock();
            self.enqueue_chain(&qh, &chain[0], &chain[chain.len() - 1]);
        }
        Ok(())
    }

    /// Cancel a transfer: deactivate its qTDs and retire whatever the
    /// controller has finished with.
    pub fn transfer_dequeue(&self, transfer: &Arc<Transfer>) {
        let mut transfers = self.transfers.lock();
        {
            let chain = transfer.chain.lock();
            if !chain.is_empty() {
                qtds_deactivate(&chain);
            }
        }
        self.trans_update(&mut transfers);
    }

    /// Tear down a pipe: unlink its qH, cancel its in-flight transfers and
    /// return the qH to the pool.
    pub fn pipe_destroy(&self, pipe: &Arc<Pipe>) {
        let Some(qh) = pipe.qh.lock().take() else {
            return;
        };

        match pipe.kind {
            TransferKind::Control | TransferKind::Bulk => self.qh_unlink_async(&qh),
            TransferKind::Interrupt => self.qh_unlink_periodic(&qh),
        }

        let mut transfers = self.transfers.lock();
        for transfer in transfers.iter() {
            let chain = transfer.chain.lock();
            let owned = chain
                .first()
                .and_then(|qtd| qtd.qh.as_ref())
                .is_some_and(|owner| Arc::ptr_eq(owner, &qh));
            if owned {
                qtds_deactivate(&chain);
            }
        }
        self.trans_update(&mut transfers);
        drop(transfers);

        self.qh_put(qh);
    }
}
