//! A minimal home-node directory and network model.
//!
//! The real directory and interconnect are external collaborators of the
//! cache hierarchy; this module provides just enough of both for the driver
//! binary and the end-to-end tests: per-line owner/sharer bookkeeping,
//! cache-to-cache forwarding, invalidations, RAR back-pressure while a
//! coherence transaction is pending, and a fixed network latency.

use crate::config::{HierarchyRef, Protocol};
use crate::node::Node;
use crate::pool::ReqPool;
use crate::req::{Dir, Kind, NackStatus, Reply, Req, ReqId, ReqType, Route, REQ_SZ};
use std::collections::{HashMap, HashSet};

/// Fixed one-way network latency, in cycles.
pub const NET_LATENCY: u64 = 4;

#[derive(Debug, Default)]
struct DirLine {
    owner: Option<usize>,
    sharers: HashSet<usize>,
    /// a coherence transaction is in flight for this line
    pending: bool,
}

/// In-flight network message.
#[derive(Debug)]
struct Message {
    deliver_at: u64,
    id: ReqId,
}

#[derive(Debug)]
pub struct Directory {
    hier: HierarchyRef,
    lines: HashMap<u64, DirLine>,
    /// (node, tag) pairs that have been requested before, for cold-miss
    /// accounting
    touched: HashSet<(usize, u64)>,
    messages: Vec<Message>,
    /// grant uncached READ_SH lines in exclusive state (MESI E-grant)
    pub exclusive_grant: bool,
}

impl Directory {
    #[must_use]
    pub fn new(hier: HierarchyRef) -> Self {
        Self {
            hier,
            lines: HashMap::new(),
            touched: HashSet::new(),
            messages: Vec::new(),
            exclusive_grant: false,
        }
    }

    fn post(&mut self, now: u64, id: ReqId) {
        self.messages.push(Message {
            deliver_at: now + NET_LATENCY,
            id,
        });
    }

    /// Move messages: drain every node's outbound port into the network,
    /// deliver due messages to the directory or the target cache.
    pub fn step(&mut self, pool: &mut ReqPool, nodes: &mut [Node], now: u64) {
        for node in nodes.iter_mut() {
            while let Some(id) = node.l2_to_net.dequeue() {
                self.post(now, id);
            }
        }

        let due: Vec<ReqId> = {
            let mut due = Vec::new();
            self.messages.retain(|m| {
                if m.deliver_at <= now {
                    due.push(m.id);
                    false
                } else {
                    true
                }
            });
            due
        };
        for id in due {
            match pool.get(id).kind {
                // requests and coherence responses terminate at the home
                Kind::REQUEST | Kind::COHE_REPLY => self.handle(pool, id, now),
                // replies and coherence demands terminate at a cache
                Kind::REPLY | Kind::COHE => {
                    let target = pool.get(id).target_node();
                    nodes[target].net_to_l2.enqueue(id);
                }
            }
        }
    }

    #[must_use]
    pub fn idle(&self) -> bool {
        self.messages.is_empty() && self.lines.values().all(|l| !l.pending)
    }

    fn handle(&mut self, pool: &mut ReqPool, id: ReqId, now: u64) {
        match pool.get(id).kind {
            Kind::REQUEST => self.handle_request(pool, id, now),
            Kind::COHE_REPLY => self.handle_cohe_reply(pool, id, now),
            other => panic!("directory got {other:?}"),
        }
    }

    fn handle_request(&mut self, pool: &mut ReqPool, id: ReqId, now: u64) {
        if pool.get(id).preprocessed {
            // a reply the L2 bounced for lack of a victim; mirror it back
            let req = pool.get_mut(id);
            req.preprocessed = false;
            req.kind = Kind::REPLY;
            req.dir = Dir::REQ_BWD;
            self.post(now, id);
            return;
        }

        let (tag, req_type, requester) = {
            let req = pool.get(id);
            (req.tag, req.req_type, req.src_node)
        };
        let line = self.lines.entry(tag).or_default();

        if line.pending {
            // one coherence transaction per line at a time; ask for a retry
            let req = pool.get_mut(id);
            req.kind = Kind::REPLY;
            req.reply = Some(Reply::RAR);
            req.dir = Dir::REQ_BWD;
            req.size_st = REQ_SZ;
            self.post(now, id);
            return;
        }

        let cold = self.touched.insert((requester, tag));

        match req_type {
            ReqType::READ_SH => {
                if let Some(owner) = line.owner.filter(|&o| o != requester) {
                    // forward to the current owner as a cache-to-cache read
                    line.pending = true;
                    let req = pool.get_mut(id);
                    req.kind = Kind::COHE;
                    req.req_type = ReqType::COPYBACK;
                    req.dir = Dir::REQ_FWD;
                    req.route = Route::BLW;
                    req.nack_st = NackStatus::NACK_NOK;
                    req.forward_to = Some(requester);
                    req.src_node = requester;
                    req.dest_node = owner;
                    req.line_cold = cold;
                    self.post(now, id);
                } else {
                    let exclusive = self.exclusive_grant
                        && line.sharers.is_empty()
                        && line.owner.is_none()
                        && self.hier.l2.protocol == Protocol::MESI;
                    if exclusive {
                        line.owner = Some(requester);
                        self.reply(pool, id, ReqType::REPLY_EXCL, cold, now);
                    } else {
                        line.sharers.insert(requester);
                        self.reply(pool, id, ReqType::REPLY_SH, cold, now);
                    }
                }
            }
            ReqType::READ_OWN => {
                if let Some(owner) = line.owner.filter(|&o| o != requester) {
                    line.pending = true;
                    let req = pool.get_mut(id);
                    req.kind = Kind::COHE;
                    req.req_type = ReqType::COPYBACK_INVL;
                    req.dir = Dir::REQ_FWD;
                    req.route = Route::BLW;
                    req.nack_st = NackStatus::NACK_NOK;
                    req.forward_to = Some(requester);
                    req.src_node = requester;
                    req.dest_node = owner;
                    req.line_cold = cold;
                    self.post(now, id);
                } else {
                    self.invalidate_sharers(pool, id, tag, requester, now);
                    let line = self.lines.get_mut(&tag).expect("line exists");
                    line.sharers.clear();
                    line.owner = Some(requester);
                    self.reply(pool, id, ReqType::REPLY_EXCL, cold, now);
                }
            }
            ReqType::UPGRADE => {
                if line.sharers.contains(&requester) {
                    self.invalidate_sharers(pool, id, tag, requester, now);
                    let line = self.lines.get_mut(&tag).expect("line exists");
                    line.sharers.clear();
                    line.owner = Some(requester);
                    self.reply(pool, id, ReqType::REPLY_UPGRADE, cold, now);
                } else {
                    // the requester lost the line since it asked: a full
                    // read-to-own is what it actually needs
                    pool.get_mut(id).req_type = ReqType::READ_OWN;
                    self.handle_request(pool, id, now);
                }
            }
            other => panic!("directory cannot serve request type {other:?}"),
        }
    }

    /// Fire invalidations at every sharer other than the requester. The
    /// acknowledgments are absorbed when they return.
    fn invalidate_sharers(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        tag: u64,
        requester: usize,
        now: u64,
    ) {
        let line = self.lines.get(&tag).expect("line exists");
        let targets: Vec<usize> = line
            .sharers
            .iter()
            .copied()
            .filter(|&s| s != requester)
            .collect();
        let address = pool.get(id).address;
        let home = pool.get(id).dest_node;
        for target in targets {
            let mut invl = Req::request(address, ReqType::INVL, home, 0);
            invl.kind = Kind::COHE;
            invl.tag = tag;
            invl.dir = Dir::REQ_FWD;
            invl.route = Route::BLW;
            invl.nack_st = NackStatus::NACK_OK;
            invl.dest_node = target;
            let invl = pool.alloc(invl);
            self.post(now, invl);
        }
    }

    /// Turn the request around as a positive data/permission reply.
    fn reply(&mut self, pool: &mut ReqPool, id: ReqId, reply_type: ReqType, cold: bool, now: u64) {
        let req = pool.get_mut(id);
        req.kind = Kind::REPLY;
        req.reply = Some(Reply::REPLY);
        req.req_type = reply_type;
        req.dir = Dir::REQ_BWD;
        req.route = Route::ABV;
        req.size_st = req.size_req;
        req.line_cold = cold;
        self.post(now, id);
    }

    fn handle_cohe_reply(&mut self, pool: &mut ReqPool, id: ReqId, now: u64) {
        let (tag, req_type, reply, src) = {
            let req = pool.get(id);
            (req.tag, req.req_type, req.reply, req.src_node)
        };
        match req_type {
            ReqType::WRB | ReqType::REPL => {
                // a victimization: the sending node no longer holds the line
                let line = self.lines.entry(tag).or_default();
                if line.owner == Some(src) {
                    line.owner = None;
                }
                line.sharers.remove(&src);
                pool.release(id);
            }
            ReqType::INVL => {
                // acknowledgment of a fire-and-forget invalidation
                pool.release(id);
            }
            ReqType::COPYBACK | ReqType::COPYBACK_INVL | ReqType::COPYBACK_SHDY => {
                // the acknowledgment half of a forwarded transaction
                let line = self.lines.entry(tag).or_default();
                line.pending = false;
                let requester = pool.get(id).forward_to.expect("forwarded COHE");
                match reply {
                    Some(Reply::REPLY) => {
                        if req_type == ReqType::COPYBACK {
                            // previous owner keeps a shared copy
                            let prev = pool.get(id).dest_node;
                            line.owner = None;
                            line.sharers.insert(prev);
                            line.sharers.insert(requester);
                        } else {
                            // ownership moved wholesale
                            line.sharers.clear();
                            line.owner = Some(requester);
                        }
                        pool.release(id);
                    }
                    Some(Reply::NACK) => {
                        // the line was not cached after all; serve from
                        // memory. The COHE was the original request, so it
                        // can be turned straight back into a reply.
                        let reply_type = if req_type == ReqType::COPYBACK {
                            line.sharers.insert(requester);
                            ReqType::REPLY_SH
                        } else {
                            line.owner = Some(requester);
                            ReqType::REPLY_EXCL
                        };
                        let home = self.hier.home_node(pool.get(id).address);
                        let cold = pool.get(id).line_cold;
                        {
                            let req = pool.get_mut(id);
                            req.kind = Kind::REPLY;
                            req.forward_to = None;
                            req.src_node = requester;
                            req.dest_node = home;
                        }
                        self.reply(pool, id, reply_type, cold, now);
                    }
                    Some(Reply::NACK_PEND) => {
                        // the owner could not decide yet; re-send the demand
                        line.pending = true;
                        let req = pool.get_mut(id);
                        req.kind = Kind::COHE;
                        req.dir = Dir::REQ_FWD;
                        req.reply = None;
                        req.size_st = REQ_SZ;
                        self.post(now, id);
                    }
                    other => panic!("unexpected ack status {other:?} at the directory"),
                }
            }
            other => panic!("directory got COHE_REPLY of type {other:?}"),
        }
    }
}
