use crate::cache::l1::{L1Cache, L1Ports};
use crate::cache::l2::{L2Cache, L2Ports};
use crate::cache::Completion;
use crate::config::HierarchyRef;
use crate::fifo::Fifo;
use crate::pool::ReqPool;
use crate::req::ReqId;
use std::sync::Arc;

/// One simulated processor node: its L1 and L2 caches and the ports that
/// join them to each other, the processor, and the network.
#[derive(Debug)]
pub struct Node {
    pub id: usize,
    pub l1: L1Cache,
    pub l2: L2Cache,

    pub proc_to_l1: Fifo<ReqId>,
    pub l1_to_l2: Fifo<ReqId>,
    pub l2_to_l1: Fifo<ReqId>,
    pub l2_to_net: Fifo<ReqId>,
    pub net_to_l2: Fifo<ReqId>,

    /// completed accesses, drained by the processor front-end each cycle
    pub done: Vec<Completion>,
}

impl Node {
    #[must_use]
    pub fn new(id: usize, hier: HierarchyRef) -> Self {
        let l1 = L1Cache::new(id, Arc::new(hier.l1.clone()), hier.clone());
        let l2 = L2Cache::new(id, Arc::new(hier.l2.clone()), hier.clone());
        let ports = hier.port_size;
        Self {
            id,
            l1,
            l2,
            proc_to_l1: Fifo::new(Some(ports)),
            l1_to_l2: Fifo::new(Some(ports)),
            l2_to_l1: Fifo::new(Some(ports)),
            l2_to_net: Fifo::new(Some(ports)),
            net_to_l2: Fifo::new(None),
            done: Vec::new(),
        }
    }

    /// Hand a processor request to the L1. Returns false when the input
    /// port is full this cycle.
    pub fn submit(&mut self, id: ReqId) -> bool {
        if self.proc_to_l1.full() {
            return false;
        }
        self.proc_to_l1.enqueue(id);
        true
    }

    /// One simulated cycle: all intake before any output, so a message
    /// produced this cycle becomes visible to its consumer only next cycle.
    pub fn step(&mut self, pool: &mut ReqPool, now: u64) {
        self.l1
            .intake(pool, &mut self.l2_to_l1, &mut self.proc_to_l1);
        self.l2
            .intake(pool, &mut self.l1_to_l2, &mut self.net_to_l2, now);

        let mut l1_ports = L1Ports {
            below: &mut self.l1_to_l2,
            done: &mut self.done,
        };
        self.l1.output(pool, &mut l1_ports, now);

        let mut l2_ports = L2Ports {
            above: &mut self.l2_to_l1,
            below: &mut self.l2_to_net,
        };
        self.l2.output(pool, &mut l2_ports, now);
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.l1.busy()
            || self.l2.busy()
            || !self.proc_to_l1.is_empty()
            || !self.l1_to_l2.is_empty()
            || !self.l2_to_l1.is_empty()
            || !self.l2_to_net.is_empty()
            || !self.net_to_l2.is_empty()
    }

    pub fn report(&self) -> String {
        format!("{}\n{}", self.l1.base.stats.report(), self.l2.base.stats.report())
    }
}
