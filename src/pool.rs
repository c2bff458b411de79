//! Bounded descriptor free-lists.
//!
//! Retiring a transfer returns its qTDs here instead of to the allocator;
//! the next enqueue reuses them. Both lists are capped so a burst of traffic
//! cannot pin DMA memory forever: once a list is full, the oldest entry is
//! dropped (its image goes back to the platform) before the new one is
//! stored. Callers hold the async lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::desc::{Qh, Qtd};
use crate::{EHCI_MAX_QH_POOL, EHCI_MAX_QTD_POOL};

pub(crate) struct DescPools {
    qtds: VecDeque<Qtd>,
    qhs: VecDeque<Arc<Qh>>,
}

impl DescPools {
    pub fn new() -> DescPools {
        DescPools {
            qtds: VecDeque::new(),
            qhs: VecDeque::new(),
        }
    }

    /// Detach a pooled qTD, or `None` if the caller has to allocate a fresh
    /// backing pair.
    pub fn get_qtd(&mut self) -> Option<Qtd> {
        self.qtds.pop_front()
    }

    /// Return a retired chain. Quiesced qTDs only: the hardware is done with
    /// them and no schedule reaches them.
    pub fn put_qtds(&mut self, chain: Vec<Qtd>) {
        for mut qtd in chain {
            if self.qtds.len() >= EHCI_MAX_QTD_POOL {
                self.qtds.pop_front();
            }
            qtd.qh = None;
            self.qtds.push_back(qtd);
        }
    }

    pub fn get_qh(&mut self) -> Option<Arc<Qh>> {
        self.qhs.pop_front()
    }

    pub fn put_qh(&mut self, qh: Arc<Qh>) {
        if self.qhs.len() >= EHCI_MAX_QH_POOL {
            self.qhs.pop_front();
        }
        self.qhs.push_back(qh);
    }

    #[cfg(test)]
    pub fn qtd_count(&self) -> usize {
        self.qtds.len()
    }

    #[cfg(test)]
    pub fn qh_count(&self) -> usize {
        self.qhs.len()
    }
}
