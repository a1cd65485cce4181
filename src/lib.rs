//! Cycle-level model of a two-level non-blocking cache hierarchy with
//! directory-style coherence: per-node L1 (write-through or write-back) and
//! write-back L2 caches, MSHRs, a write-back buffer, tag/data pipelines, and
//! the smart-MSHR queues that keep the system deadlock-free under concurrent
//! in-flight transactions.

pub mod cache;
pub mod capconf;
pub mod cohe;
pub mod config;
pub mod directory;
pub mod fifo;
pub mod mshr;
pub mod node;
pub mod pipeline;
pub mod pool;
pub mod req;
pub mod smart_mshr;
pub mod wrb_buf;

/// Physical address.
#[allow(non_camel_case_types)]
pub type address = u64;

use crate::cache::Completion;
use crate::config::HierarchyRef;
use crate::directory::Directory;
use crate::node::Node;
use crate::pool::ReqPool;
use crate::req::{Req, ReqType};
use std::sync::Arc;

static INIT_LOGGING: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

/// Initialize logging once, honoring `RUST_LOG`.
pub fn init_logging() {
    INIT_LOGGING.get_or_init(|| {
        env_logger::Builder::from_default_env()
            .format_timestamp(None)
            .init();
    });
}

/// One access of the driving workload.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct TraceOp {
    /// earliest cycle the access may issue
    pub cycle: u64,
    pub node: usize,
    pub op: ReqType,
    pub address: address,
}

/// The whole simulated machine: every node plus the directory/network
/// model, stepped one cycle at a time.
#[derive(Debug)]
pub struct Machine {
    pub hier: HierarchyRef,
    pub pool: ReqPool,
    pub nodes: Vec<Node>,
    pub directory: Directory,
    pub cycle: u64,
    pub completed: Vec<Completion>,
    next_inst_tag: u64,
}

impl Machine {
    #[must_use]
    pub fn new(hier: config::Hierarchy) -> Self {
        let hier: HierarchyRef = Arc::new(hier);
        let nodes = (0..hier.num_nodes)
            .map(|id| Node::new(id, hier.clone()))
            .collect();
        Self {
            directory: Directory::new(hier.clone()),
            hier,
            pool: ReqPool::new(),
            nodes,
            cycle: 0,
            completed: Vec::new(),
            next_inst_tag: 0,
        }
    }

    /// Issue one processor access. Returns false when the node's input
    /// port is full this cycle.
    pub fn issue(&mut self, node: usize, op: ReqType, address: address) -> bool {
        let mut req = Req::request(address, op, node, self.next_inst_tag);
        req.dest_node = self.hier.home_node(address);
        let id = self.pool.alloc(req);
        if self.nodes[node].submit(id) {
            self.next_inst_tag += 1;
            true
        } else {
            self.pool.release(id);
            false
        }
    }

    /// Advance the machine by one cycle.
    pub fn step(&mut self) {
        self.cycle += 1;
        for node in &mut self.nodes {
            node.step(&mut self.pool, self.cycle);
            self.completed.append(&mut node.done);
        }
        self.directory
            .step(&mut self.pool, &mut self.nodes, self.cycle);
    }

    /// Step until everything in flight has drained (or the cycle limit
    /// trips, which signals a stuck protocol).
    pub fn drain(&mut self, limit: u64) {
        let deadline = self.cycle + limit;
        while self.nodes.iter().any(Node::busy) || !self.directory.idle() {
            self.step();
            assert!(
                self.cycle < deadline,
                "machine failed to drain within {limit} cycles"
            );
        }
    }

    /// Run a trace to completion and return the number of performed
    /// accesses.
    pub fn run_trace(&mut self, trace: &[TraceOp], drain_limit: u64) -> usize {
        let mut pending: std::collections::VecDeque<TraceOp> =
            trace.iter().copied().collect();
        while let Some(op) = pending.front().copied() {
            if op.cycle > self.cycle || !self.issue(op.node, op.op, op.address) {
                self.step();
                continue;
            }
            let _ = pending.pop_front();
        }
        self.drain(drain_limit);
        self.completed.len()
    }

    pub fn report(&self) -> String {
        use itertools::Itertools;
        self.nodes.iter().map(Node::report).join("\n")
    }
}
