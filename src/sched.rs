//! Schedule linker.
//!
//! Control and bulk qHs ride the asynchronous ring: a circular chain of
//! horizontal pointers rooted at a permanent sentinel (the one qH with the
//! head-of-reclamation bit). Interrupt qHs go to the periodic frame list,
//! spread over `period`-spaced slots with longer-period heads nearest the
//! hardware entry. Unlinking from the ring brackets the pointer splice with
//! an async-schedule stop so the controller cannot be mid-traversal of the
//! spliced node.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::desc::{link, qh_info, Dma, HwWord, Qh};
use crate::pool::DescPools;
use crate::regs::{USBCMD, USBSTS};
use crate::{mem_dmb, Ehci, EHCI_PERIODIC_ALIGN, EHCI_PERIODIC_SIZE};

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

/// State guarded by the async lock: the software mirror of the ring plus
/// both descriptor pools.
pub(crate) struct AsyncShared {
    /// Ring members in hardware order, sentinel excluded: `ring[0]` is the
    /// sentinel's successor.
    pub ring: Vec<Arc<Qh>>,
    pub pools: DescPools,
}

impl AsyncShared {
    pub fn new() -> Mutex<AsyncShared> {
        Mutex::new(AsyncShared {
            ring: Vec::new(),
            pools: DescPools::new(),
        })
    }
}

/// The hardware frame list: one link pointer per frame slot.
#[repr(C, align(4096))]
pub(crate) struct FrameList {
    pub entries: [HwWord; EHCI_PERIODIC_SIZE],
}

const_assert_eq!(mem::align_of::<FrameList>(), EHCI_PERIODIC_ALIGN);

/// State guarded by the periodic lock.
pub(crate) struct PeriodicShared {
    pub list: Dma<FrameList>,
    /// Software head of each frame slot's chain.
    pub nodes: Vec<Option<Arc<Qh>>>,
}

fn qh_or_invalid(qh: &Option<Arc<Qh>>) -> u32 {
    match qh {
        Some(qh) => link::qh(qh.paddr()),
        None => link::INVALID,
    }
}

/// Pick the least-loaded frame slot below the qH's period, and for
/// high-speed endpoints slower than every-frame also the least-loaded
/// microframe within that slot.
pub(crate) fn band_alloc(nodes: &[Option<Arc<Qh>>], qh: &Qh) -> (usize, u8) {
    let period = qh.state.lock().period.max(1);

    let mut best = usize::MAX;
    let mut phase = 0;
    for (i, head) in nodes.iter().enumerate().take(period) {
        let mut n = 0;
        let mut cursor = head.clone();
        while let Some(q) = cursor {
            n += 1;
            cursor = q.state.lock().next.clone();
        }
        if n < best {
            best = n;
            phase = i;
        }
    }

    let mut uframe = 0xff;
    let high_speed = qh.hw.info[0].get() & qh_info::EPS_HIGH != 0;
    if high_speed && period > 1 {
        let mut ucnt = [0usize; 8];
        let mut cursor = nodes[phase].clone();
        while let Some(q) = cursor {
            let st = q.state.lock();
            if st.uframe != 0xff {
                ucnt[st.uframe as usize & 7] += 1;
            }
            cursor = st.next.clone();
        }

        let mut best = usize::MAX;
        for (i, n) in ucnt.iter().enumerate() {
            if *n < best {
                best = *n;
                uframe = i as u8;
            }
        }
    }

    (phase, uframe)
}

impl Ehci {
    /// Point the controller at the sentinel and turn the async schedule on.
    pub(crate) fn start_async(&self) {
        let op = self.op();
        op.asynclistaddr.set(self.sentinel.paddr());
        op.usbcmd.modify(USBCMD::ASE::SET);
        mem_dmb();
        if self.spin_until(|| self.op().usbsts.is_set(USBSTS::ASS)).is_err() {
            log::warn!("async schedule did not report running");
        }
    }

    /// Turn the async schedule off and wait for the controller to drain.
    pub(crate) fn stop_async(&self) {
        self.op().usbcmd.modify(USBCMD::ASE::CLEAR);
        mem_dmb();
        if self
            .spin_until(|| !self.op().usbsts.is_set(USBSTS::ASS))
            .is_err()
        {
            log::warn!("async schedule did not stop");
        }
    }

    /// Splice a qH in right behind the sentinel.
    pub(crate) fn qh_link_async(&self, qh: &Arc<Qh>) {
        let mut shared = self.async_shared.lock();
        shared.ring.insert(0, qh.clone());
        qh.hw.horizontal.set(self.sentinel.hw.horizontal.get());
        self.sentinel.hw.horizontal.set(link::qh(qh.paddr()));
        mem_dmb();
    }

    /// Remove a qH from the ring. The schedule is stopped around the splice
    /// so the hardware never dereferences the outgoing pointer.
    pub(crate) fn qh_unlink_async(&self, qh: &Arc<Qh>) {
        let mut shared = self.async_shared.lock();
        let Some(pos) = shared.ring.iter().position(|q| Arc::ptr_eq(q, qh)) else {
            return;
        };

        self.stop_async();
        let prev = if pos == 0 {
            &self.sentinel
        } else {
            &shared.ring[pos - 1]
        };
        prev.hw.horizontal.set(qh.hw.horizontal.get());
        self.start_async();
        mem_dmb();

        shared.ring.remove(pos);
    }

    /// Band-allocate and link an interrupt qH into every `period`-spaced
    /// slot starting at its phase, keeping slot chains sorted by descending
    /// period.
    pub(crate) fn qh_link_periodic(&self, qh: &Arc<Qh>) {
        let mut per = self.periodic.lock();
        let (phase, uframe) = band_alloc(&per.nodes, qh);

        let period;
        {
            let mut st = qh.state.lock();
            st.phase = phase;
            st.uframe = uframe;
            period = st.period.max(1);
        }

        let smask = if uframe != 0xff {
            1u32 << uframe
        } else {
            qh_info::SMASK_ALL
        };
        qh.hw.info[1].set(smask | qh_info::CMASK_ALL);

        match per.nodes[phase].clone() {
            // Walk to the last node that still belongs in front of us and
            // splice in behind it.
            Some(h) if h.state.lock().period >= period => {
                let mut t = h;
                loop {
                    let next = t.state.lock().next.clone();
                    match next {
                        Some(n) if n.state.lock().period >= period => t = n,
                        _ => break,
                    }
                }

                let tail = t.state.lock().next.clone();
                qh.hw.horizontal.set(qh_or_invalid(&tail));
                qh.state.lock().next = tail;
                t.state.lock().next = Some(qh.clone());
                t.hw.horizontal.set(link::qh(qh.paddr()));
            }
            // Slower than the current head, or an empty slot: become the
            // first node of every slot this qH covers.
            head => {
                qh.state.lock().next = head.clone();
                qh.hw.horizontal.set(qh_or_invalid(&head));

                let ptr = link::qh(qh.paddr());
                let mut i = phase;
                while i < per.nodes.len() {
                    per.nodes[i] = Some(qh.clone());
                    per.list.entries[i].set(ptr);
                    i += period;
                }
            }
        }

        mem_dmb();
    }

    /// Remove an interrupt qH from every slot it appears in. Mid-chain
    /// splices are single 32-bit pointer updates the hardware tolerates
    /// without stopping the periodic schedule.
    pub(crate) fn qh_unlink_periodic(&self, qh: &Arc<Qh>) {
        let mut per = self.periodic.lock();

        for i in 0..per.nodes.len() {
            let head_is_qh = per.nodes[i]
                .as_ref()
                .is_some_and(|head| Arc::ptr_eq(head, qh));

            if head_is_qh {
                let next = qh.state.lock().next.clone();
                per.list.entries[i].set(qh_or_invalid(&next));
                per.nodes[i] = next;
            } else {
                let mut cursor = per.nodes[i].clone();
                while let Some(cur) = cursor {
                    let next = cur.state.lock().next.clone();
                    if next.as_ref().is_some_and(|n| Arc::ptr_eq(n, qh)) {
                        let after = qh.state.lock().next.clone();
                        cur.hw.horizontal.set(qh_or_invalid(&after));
                        cur.state.lock().next = after;
                        break;
                    }
                    cursor = next;
                }
            }
        }

        qh.state.lock().next = None;
        mem_dmb();
    }
}
