use super::{CacheBase, Completion, Presence};
use crate::cohe::{LineState, MsgSize};
use crate::config::{CacheConfig, CacheLevel, HierarchyRef};
use crate::fifo::Fifo;
use crate::mshr::MshrResponse;
use crate::pipeline::Pipeline;
use crate::pool::ReqPool;
use crate::req::{Dir, Handled, Kind, MissType, Reply, ReqId, ReqType, REQ_SZ};
use crate::smart_mshr::Release;
use console::style;
use std::sync::Arc;

// pipe roles within the tag-array bank group
const REQ_TAG_PIPE: usize = 0;
const REPLY_TAG_PIPE: usize = 1;
const COHE_TAG_PIPE: usize = 2;

/// Output side of the L1: the port toward the L2, and completed accesses
/// handed back to the processor front-end.
pub struct L1Ports<'a> {
    pub below: &'a mut Fifo<ReqId>,
    pub done: &'a mut Vec<Completion>,
}

impl L1Ports<'_> {
    /// Everything the L1 emits as a message heads below.
    fn send_below(&mut self, id: ReqId) -> bool {
        if self.below.full() {
            return false;
        }
        self.below.enqueue(id);
        true
    }
}

/// One entry of the write-through L1's write buffer.
#[derive(Debug)]
struct WbufEntry {
    req: ReqId,
    tag: u64,
    sent: bool,
}

/// Coalescing write buffer between a write-through L1 and the L2.
///
/// Writes coalesce per line while unsent; a read matching a pending write
/// must stall until the write's reply returns. One entry issues per cycle.
#[derive(Debug, Default)]
struct WriteBuffer {
    entries: Vec<WbufEntry>,
    size: usize,
    max_coals: usize,
}

enum WbufInsert {
    New,
    Coalesced,
    Full,
    TooManyCoals,
}

impl WriteBuffer {
    fn new(size: usize, max_coals: usize) -> Self {
        Self {
            entries: Vec::new(),
            size,
            max_coals,
        }
    }

    fn insert(&mut self, pool: &mut ReqPool, id: ReqId) -> WbufInsert {
        let tag = pool.get(id).tag;
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.tag == tag && !e.sent)
        {
            if pool.get(entry.req).coalesced.len() >= self.max_coals {
                return WbufInsert::TooManyCoals;
            }
            let main = entry.req;
            pool.get_mut(id).handled = Handled::WBUF_COAL;
            pool.get_mut(main).coalesced.push(id);
            return WbufInsert::Coalesced;
        }
        if self.entries.len() >= self.size {
            return WbufInsert::Full;
        }
        self.entries.push(WbufEntry {
            req: id,
            tag,
            sent: false,
        });
        WbufInsert::New
    }

    fn pending_match(&self, tag: u64) -> bool {
        self.entries.iter().any(|e| e.tag == tag)
    }

    /// Issue at most one unsent entry into the port below.
    fn drain(&mut self, below: &mut Fifo<ReqId>) {
        if below.full() {
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| !e.sent) {
            below.enqueue(entry.req);
            entry.sent = true;
        }
    }

    /// The reply for a buffered write came back; drop the entry.
    fn complete(&mut self, tag: u64) {
        self.entries.retain(|e| !(e.tag == tag && e.sent));
    }
}

/// First-level cache engine.
pub struct L1Cache {
    pub base: CacheBase,
    pipes: Vec<Pipeline<ReqId>>,
    wbuf: Option<WriteBuffer>,
}

impl std::fmt::Debug for L1Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("L1Cache").field("base", &self.base).finish()
    }
}

impl L1Cache {
    pub fn new(node: usize, config: Arc<CacheConfig>, hier: HierarchyRef) -> Self {
        assert!(
            matches!(
                config.level,
                CacheLevel::FIRSTLEVEL_WT | CacheLevel::FIRSTLEVEL_WB
            ),
            "L1 engine needs a first-level configuration"
        );
        let name = format!("node-{node}-{}", style("L1").cyan());
        let depth = config.tag_pipes.delay;
        let pipes = config
            .tag_pipes
            .widths
            .iter()
            .map(|&w| Pipeline::new(w, depth))
            .collect::<Vec<_>>();
        assert!(pipes.len() >= 3, "L1 needs request, reply, and cohe pipes");
        let wbuf = (config.level == CacheLevel::FIRSTLEVEL_WT)
            .then(|| WriteBuffer::new(config.wbuf_size, config.max_coals));
        Self {
            base: CacheBase::new(name, node, config, hier),
            pipes,
            wbuf,
        }
    }

    /// Pull new transactions from the input ports into the tag pipes.
    /// An operation leaves its port only when pipe space opens up for it.
    pub fn intake(&mut self, pool: &mut ReqPool, from_below: &mut Fifo<ReqId>, from_proc: &mut Fifo<ReqId>) {
        while let Some(&id) = from_below.first() {
            let pipe = match pool.get(id).kind {
                Kind::REPLY => REPLY_TAG_PIPE,
                Kind::COHE => COHE_TAG_PIPE,
                Kind::COHE_REPLY => panic!("L1 cache got a COHE_REPLY at intake"),
                Kind::REQUEST => panic!("L1 cache got a REQUEST from below"),
            };
            if !self.pipes[pipe].add(id) {
                break;
            }
            pool.get_mut(id).progress = 0;
            let _ = from_below.dequeue();
            self.base.num_in_pipes += 1;
        }
        while let Some(&id) = from_proc.first() {
            debug_assert_eq!(pool.get(id).kind, Kind::REQUEST);
            if !self.pipes[REQ_TAG_PIPE].add(id) {
                break;
            }
            pool.get_mut(id).progress = 0;
            let _ = from_proc.dequeue();
            self.base.num_in_pipes += 1;
        }
    }

    /// Advance the pipes and retire what can be retired this cycle.
    pub fn output(&mut self, pool: &mut ReqPool, ports: &mut L1Ports, now: u64) {
        // held resources first: a blocked outbound message must never hold
        // up inbound reply processing
        if !self.base.smart.is_empty() {
            let below = &mut *ports.below;
            self.base.process_smart_list(
                pool,
                None,
                &mut |_pool, req| {
                    if below.full() {
                        false
                    } else {
                        below.enqueue(req);
                        true
                    }
                },
                now,
            );
        }

        for pipe_num in 0..self.pipes.len() {
            let mut posn = 0;
            while let Some(id) = self.pipes[pipe_num].head(posn) {
                if self.process_tag_req(pool, id, ports, now) {
                    self.pipes[pipe_num].clear(posn);
                    self.base.num_in_pipes -= 1;
                }
                posn += 1;
                if posn >= self.pipes[pipe_num].width() {
                    break;
                }
            }
            self.pipes[pipe_num].advance();
        }

        if let Some(wbuf) = &mut self.wbuf {
            wbuf.drain(ports.below);
        }
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.base.num_in_pipes > 0
            || self.wbuf.as_ref().is_some_and(|w| !w.entries.is_empty())
    }

    /// Complete a performed access toward the processor and release it,
    /// together with everything coalesced onto it.
    fn complete_all(pool: &mut ReqPool, done: &mut Vec<Completion>, id: ReqId) {
        let miss_type = pool.get(id).miss_type;
        let coalesced = std::mem::take(&mut pool.get_mut(id).coalesced);
        Self::complete_one(pool, done, id, miss_type);
        for c in coalesced {
            Self::complete_one(pool, done, c, miss_type);
        }
    }

    fn complete_one(pool: &mut ReqPool, done: &mut Vec<Completion>, id: ReqId, miss_type: MissType) {
        let req = pool.get(id);
        done.push(Completion {
            inst_tag: req.inst_tag,
            address: req.address,
            kind: req.prcr_req_type,
            miss_type,
            prefetched_late: req.prefetched_late,
        });
        pool.release(id);
    }

    /// Complete only the non-allocating members (writes in a write-through
    /// hierarchy, or L2 prefetches) of a reply that also carries an
    /// allocating MSHR on this line.
    fn complete_nonallocating(
        pool: &mut ReqPool,
        done: &mut Vec<Completion>,
        id: ReqId,
        include_writes: bool,
    ) {
        let eligible = |t: ReqType| {
            matches!(t, ReqType::L2WRITE_PREFETCH | ReqType::L2READ_PREFETCH)
                || (include_writes && t == ReqType::WRITE)
        };
        let miss_type = pool.get(id).miss_type;
        let coalesced = std::mem::take(&mut pool.get_mut(id).coalesced);
        for c in coalesced {
            if eligible(pool.get(c).prcr_req_type) {
                Self::complete_one(pool, done, c, miss_type);
            }
            // the rest also live in this cache's MSHR and complete there
        }
        if eligible(pool.get(id).prcr_req_type) {
            Self::complete_one(pool, done, id, miss_type);
        }
    }

    fn drop_prefetch(&mut self, pool: &mut ReqPool, id: ReqId) {
        log::debug!("{}: dropping prefetch {}", self.base.name, pool.get(id));
        self.base.stats.pref_total += 1;
        self.base.stats.dropped_pref += 1;
        pool.release(id);
    }

    /// Dispatch one transaction at the head of a tag pipe.
    /// Returns false to leave it in place for a retry next cycle.
    fn process_tag_req(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L1Ports,
        now: u64,
    ) -> bool {
        match pool.get(id).kind {
            Kind::REQUEST => self.process_request(pool, id, ports, now),
            Kind::REPLY => self.process_reply(pool, id, ports, now),
            Kind::COHE | Kind::COHE_REPLY => self.process_cohe(pool, id, ports, now),
        }
    }

    fn process_request(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L1Ports,
        now: u64,
    ) -> bool {
        if pool.get(id).progress == 0 {
            // a read matching a buffered write must wait for the write's
            // reply, or it would be performed out of order
            if let Some(wbuf) = &self.wbuf {
                let tag = self.base.config.tag_of(pool.get(id).address);
                if pool.get(id).prcr_req_type.is_read_mode() && wbuf.pending_match(tag) {
                    self.base.stats.wbuf_stall_read_match += 1;
                    return false;
                }
            }

            let response = self.base.probe(pool, id, false, now);
            log::debug!(
                "{}: REQ {} -> {:?}",
                self.base.name,
                pool.get(id),
                response
            );
            let is_pref = pool.get(id).prefetch;
            match response {
                MshrResponse::MSHR_COAL => {
                    if is_pref {
                        self.base.stats.pref_total += 1;
                        self.base.stats.pref_unnecessary += 1;
                    }
                    pool.get_mut(id).handled = Handled::L1COAL;
                    return true; // now owned by the MSHR
                }
                MshrResponse::MSHR_NEW | MshrResponse::MSHR_FWD => {
                    if is_pref {
                        if response == MshrResponse::MSHR_NEW {
                            self.base.stats.pref_total += 1;
                        } else if self.base.level() != CacheLevel::FIRSTLEVEL_WT {
                            // an upgrade prefetch in a write-back L1 buys
                            // exclusive mode the cache did not have
                            self.base.stats.pref_total += 1;
                            self.base.stats.pref_useful_upgrade += 1;
                        }
                    }
                    if response == MshrResponse::MSHR_FWD
                        && pool.get(id).miss_type == MissType::UNKNOWN
                    {
                        pool.get_mut(id).miss_type = MissType::UPGR;
                    }
                    pool.get_mut(id).progress = 1;
                }
                MshrResponse::NOMSHR_FWD => {
                    // a write in a write-through cache, or an L2 prefetch
                    if let Some(wbuf) = &mut self.wbuf {
                        if pool.get(id).prcr_req_type == ReqType::WRITE {
                            return match wbuf.insert(pool, id) {
                                WbufInsert::New => true,
                                WbufInsert::Coalesced => {
                                    self.base.stats.wbuf_coals += 1;
                                    true
                                }
                                WbufInsert::Full => {
                                    self.base.stats.wbuf_stall_full += 1;
                                    false
                                }
                                WbufInsert::TooManyCoals => {
                                    self.base.stats.wbuf_stall_coal_max += 1;
                                    false
                                }
                            };
                        }
                    }
                    pool.get_mut(id).progress = 1;
                }
                MshrResponse::MSHR_STALL_WAR
                | MshrResponse::MSHR_STALL_COHE
                | MshrResponse::MSHR_STALL_WRB
                | MshrResponse::MSHR_STALL_COAL
                | MshrResponse::NOMSHR_STALL => {
                    if is_pref && self.base.config.discriminate_prefetch {
                        self.drop_prefetch(pool, id);
                        return true;
                    }
                    return false;
                }
                MshrResponse::MSHR_USELESS_FETCH_IN_PROGRESS => {
                    assert!(is_pref, "useless-fetch on a demand access");
                    self.base.stats.pref_total += 1;
                    self.base.stats.pref_unnecessary += 1;
                    pool.release(id);
                    return true;
                }
                MshrResponse::NOMSHR => {
                    if is_pref {
                        self.base.stats.pref_total += 1;
                        self.base.stats.pref_unnecessary += 1;
                    }
                    let req = pool.get_mut(id);
                    req.handled = Handled::L1HIT;
                    req.miss_type = MissType::L1HIT;
                    Self::complete_all(pool, ports.done, id);
                    return true;
                }
                MshrResponse::NOMSHR_STALL_COHE
                | MshrResponse::NOMSHR_STALL_WRBBUF_FULL => {
                    panic!("{:?} is not a first-level response", response)
                }
            }
        }
        // send the upgrade, miss, or non-allocating access downward
        ports.send_below(id)
    }

    fn process_reply(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L1Ports,
        now: u64,
    ) -> bool {
        if pool.get(id).progress == 0 {
            let req_type = pool.get(id).req_type;
            assert!(
                req_type.is_line_reply(),
                "illegal reply type {req_type:?} at the L1 cache"
            );
            assert_eq!(
                pool.get(id).reply,
                Some(Reply::REPLY),
                "RARs and negative replies are not acceptable at the L1"
            );

            let address = pool.get(id).address;
            let lookup = self.base.lookup(address);
            log::debug!(
                "{}: REPLY {} ({:?})",
                self.base.name,
                pool.get(id),
                lookup.presence
            );

            let mut mshr_num = self.base.mshrs.find(lookup.tag);
            let prcr = pool.get(id).prcr_req_type;
            let nonalloc = (self.base.level() == CacheLevel::FIRSTLEVEL_WT
                && prcr == ReqType::WRITE)
                || matches!(prcr, ReqType::L2WRITE_PREFETCH | ReqType::L2READ_PREFETCH);
            if nonalloc && !pool.get(id).read_with_write {
                mshr_num = None;
            }
            let Some(mshr_num) = mshr_num else {
                if nonalloc {
                    // a coalesced write response or a prefetch that does not
                    // touch this cache; hand it up for fence accounting
                    if let Some(wbuf) = &mut self.wbuf {
                        if prcr == ReqType::WRITE {
                            wbuf.complete(lookup.tag);
                        }
                    }
                    Self::complete_all(pool, ports.done, id);
                    return true;
                }
                panic!("received a reply for a nonexistent MSHR");
            };

            let pend_cohe = self.base.mshrs.get(mshr_num).pend_cohe;
            let writes_present = self.base.mshrs.get(mshr_num).writes_present;
            let only_prefs = self.base.mshrs.get(mshr_num).only_prefs;

            match lookup.presence {
                Presence::Hit => {
                    // upgrade reply: the line is already here
                    let cur_state = self.base.lines[lookup.index].state;
                    let entry =
                        self.base
                            .table
                            .lookup(Kind::REPLY, cur_state, pool.get(id).req_type);
                    let next = super::adjust_for_writes(entry.next_state, writes_present);
                    {
                        let req = pool.get_mut(id);
                        req.invl_req = None;
                        req.wrb_req = None;
                    }
                    let line = &mut self.base.lines[lookup.index];
                    line.state = next;
                    line.mshr_out = false;
                    if let Some(pend) = pend_cohe {
                        let after = self.base.table.lookup(Kind::COHE, next, pend);
                        self.base.lines[lookup.index].state =
                            after.next_state.expect("coherence sets a state");
                        assert!(
                            !self.base.lines[lookup.index].mshr_out,
                            "merged coherence evicting a line with mshr_out"
                        );
                    }
                }
                Presence::PresentMiss => {
                    {
                        let req = pool.get_mut(id);
                        req.invl_req = None;
                        req.wrb_req = None;
                        if req.miss_type == MissType::UNKNOWN {
                            req.miss_type = MissType::COHE;
                        }
                    }
                    let is_pref = pool.get(id).prefetch;
                    self.base
                        .premiss_ageupdate(lookup.index, is_pref, only_prefs, now);
                    let _ = self.base.ccd.observe(lookup.tag);
                    self.base.classify(pool, id, stats::MissClass::COHE);
                    self.fill_line(pool, id, lookup.index, writes_present, pend_cohe);
                }
                Presence::TotalMiss => {
                    let is_pref = pool.get(id).prefetch;
                    let Some(victim) = self.base.victim_select(
                        lookup.tag,
                        lookup.set,
                        is_pref,
                        only_prefs,
                        now,
                    ) else {
                        // every line in the set is upgrade-locked: bounce
                        // the reply back down as a fresh REQUEST
                        assert!(
                            self.base.level() != CacheLevel::FIRSTLEVEL_WT,
                            "write-through L1 can never fail to replace"
                        );
                        let (_, _, dest) = self.base.line_attrs(&lookup, address);
                        let node = self.base.node;
                        let req = pool.get_mut(id);
                        req.l1nack = true;
                        req.src_node = node;
                        req.dest_node = dest;
                        req.req_type = req.prcr_req_type;
                        req.invl_req = None;
                        req.wrb_req = None;
                        log::debug!(
                            "{}: nacking reply for tag {} back to a request",
                            self.base.name,
                            lookup.tag
                        );
                        self.base.nack_upgrade_conflict_reply(pool, id);
                        return true; // the reply is sunk regardless
                    };

                    self.base.classify_fill(pool, id);

                    let victim_state = self.base.lines[victim].state;
                    if victim_state == LineState::INVALID {
                        assert!(
                            !self.base.lines[victim].mshr_out,
                            "victimizing a line with mshr_out"
                        );
                        pool.get_mut(id).invl_req = None;
                        pool.get_mut(id).wrb_req = None;
                        self.fill_line(pool, id, victim, writes_present, pend_cohe);
                    } else {
                        self.replace_line(pool, id, victim, writes_present, pend_cohe);
                    }
                }
            }
            pool.get_mut(id).progress = 1;
            pool.get_mut(id).mshr_num = Some(mshr_num);
        }

        // finish: perform everything coalesced, free or substitute the MSHR
        let mshr_num = pool.get(id).mshr_num.expect("reply bound to an MSHR");
        let miss_type = pool.get(id).miss_type;
        let wrb_req = pool.get(id).wrb_req;

        if pool.get(id).read_with_write {
            let prcr = pool.get(id).prcr_req_type;
            assert!(
                matches!(prcr, ReqType::L2WRITE_PREFETCH | ReqType::L2READ_PREFETCH)
                    || (self.base.level() == CacheLevel::FIRSTLEVEL_WT
                        && prcr == ReqType::WRITE),
                "read has read_with_write set"
            );
            if let Some(wbuf) = &mut self.wbuf {
                if prcr == ReqType::WRITE {
                    wbuf.complete(pool.get(id).tag);
                }
            }
            let include_writes = self.base.level() == CacheLevel::FIRSTLEVEL_WT;
            Self::complete_nonallocating(pool, ports.done, id, include_writes);
        }

        // collect before freeing: the MSHR bookkeeping must not read
        // released requests
        let mut resolved = Vec::new();
        self.base
            .mshrs
            .iterate_uncoalesce(mshr_num, pool, miss_type, |_, rid| resolved.push(rid));
        let subst = wrb_req.map(|w| (w, pool.get(w).tag));
        self.base
            .mshrs
            .remove(mshr_num, subst, &mut self.base.stats, now);
        for rid in resolved {
            Self::complete_all(pool, ports.done, rid);
        }

        if let Some(wrb) = wrb_req {
            // let the WRB issue from the held MSHR so this REPLY can sink
            self.base
                .add_to_smart_list(wrb, Some(Release::Mshr(mshr_num)));
        }
        true
    }

    fn fill_line(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        index: usize,
        writes_present: bool,
        pend_cohe: Option<ReqType>,
    ) {
        let address = pool.get(id).address;
        let lookup = self.base.lookup(address);
        let (cohe_kind, allo_type, dest_node) = self.base.line_attrs(&lookup, address);
        let entry = self
            .base
            .table
            .lookup(Kind::REPLY, LineState::INVALID, pool.get(id).req_type);
        let next = super::adjust_for_writes(entry.next_state, writes_present);

        let tag = pool.get(id).tag;
        let line = &mut self.base.lines[index];
        line.tag = tag;
        line.state = next;
        line.cohe_kind = cohe_kind;
        line.allo_type = allo_type;
        line.dest_node = dest_node;

        if let Some(pend) = pend_cohe {
            let after = self.base.table.lookup(Kind::COHE, next, pend);
            self.base.lines[index].state = after.next_state.expect("coherence sets a state");
        }
    }

    fn replace_line(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        victim: usize,
        writes_present: bool,
        pend_cohe: Option<ReqType>,
    ) {
        let victim_state = self.base.lines[victim].state;
        let victim_cohe = self.base.lines[victim].cohe_kind;
        let victim_allo = self.base.lines[victim].allo_type;
        let victim_dest = self.base.lines[victim].dest_node;
        let tag_repl = self.base.lines[victim].tag;
        self.base.count_victim(victim_state);

        let repl_entry = self
            .base
            .table
            .lookup(Kind::REQUEST, victim_state, ReqType::REPL);

        assert!(
            !self.base.lines[victim].mshr_out,
            "victimizing a line with mshr_out"
        );
        self.fill_line(pool, id, victim, writes_present, None);

        if let Some(blw) = repl_entry.next_mod_req {
            assert!(
                self.base.level() != CacheLevel::FIRSTLEVEL_WT,
                "write-through L1 never writes back"
            );
            log::debug!(
                "{}: victimizing tag {tag_repl} ({victim_state:?}) for incoming reply",
                self.base.name
            );
            let line_size = self.base.config.line_size;
            let wrb = self.base.make_repl_req(
                pool,
                id,
                tag_repl,
                blw,
                repl_entry.req_sz.bytes(line_size),
                repl_entry.rep_sz.bytes(line_size),
                victim_cohe,
                victim_allo,
                self.base.node,
                victim_dest,
                crate::req::Route::BLW,
            );
            pool.get_mut(id).wrb_req = Some(wrb);
        }
        assert!(
            repl_entry.next_req.is_none(),
            "L1 replacement never messages a module above"
        );

        if let Some(pend) = pend_cohe {
            let cur = self.base.lines[victim].state;
            let after = self.base.table.lookup(Kind::COHE, cur, pend);
            self.base.lines[victim].state = after.next_state.expect("coherence sets a state");
        }
    }

    fn process_cohe(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L1Ports,
        now: u64,
    ) -> bool {
        if pool.get(id).kind == Kind::COHE && pool.get(id).progress == 0 {
            // turn it around immediately: there is no cache above this one
            {
                let req = pool.get_mut(id);
                req.kind = Kind::COHE_REPLY;
                req.dir = Dir::REQ_BWD;
                req.size_st = REQ_SZ;
                req.size_req = REQ_SZ;
            }
            self.base.stats.cohe += 1;
            self.base.stats.cohe_reply += 1;

            let address = pool.get(id).address;
            let lookup = self.base.lookup(address);
            let response = self.base.probe(pool, id, false, now);
            let req_type = pool.get(id).req_type;
            log::debug!(
                "{}: COHE {} ({:?}, {:?})",
                self.base.name,
                pool.get(id),
                lookup.presence,
                response
            );

            match response {
                MshrResponse::MSHR_COAL => {
                    // the coherence merged with (or will be resolved by) an
                    // outstanding read MSHR
                    if self.base.level() == CacheLevel::FIRSTLEVEL_WT
                        || pool.get(id).nack_st == crate::req::NackStatus::NACK_OK
                    {
                        pool.get_mut(id).reply = Some(Reply::REPLY);
                        self.base.stats.cohe_reply_merge += 1;
                    } else {
                        // a copyback demand against a line we may be about
                        // to own: the directory must reevaluate
                        self.base.stats.cohe_reply_nack_pend += 1;
                        let req = pool.get_mut(id);
                        req.reply = Some(Reply::NACK_PEND);
                        req.size_st = REQ_SZ;
                        req.size_req = REQ_SZ;
                    }
                }
                MshrResponse::MSHR_FWD => {
                    // exclusive-mode MSHR outstanding and the COHE demands
                    // no data: act now and answer negatively
                    if req_type == ReqType::WRB {
                        // the L2 is racing a replacement against a line that
                        // hit there earlier; tell it to resend
                        let req = pool.get_mut(id);
                        req.reply = Some(Reply::NACK_PEND);
                        req.size_st = REQ_SZ;
                        req.size_req = REQ_SZ;
                    } else {
                        assert!(
                            req_type != ReqType::COPYBACK,
                            "copyback cannot merge with an exclusive MSHR at L1"
                        );
                        {
                            let req = pool.get_mut(id);
                            req.reply = Some(Reply::NACK);
                            req.size_st = REQ_SZ;
                            req.size_req = REQ_SZ;
                        }
                        if lookup.presence == Presence::Hit {
                            // unlock and invalidate; the directory converts
                            // the dangling UPGRADE to READ_OWN
                            let line = &mut self.base.lines[lookup.index];
                            line.state = LineState::INVALID;
                            line.mshr_out = false;
                            self.base.stats.cohe_reply_nack_docohe += 1;
                        } else {
                            self.base.stats.cohe_reply_nack_mergefail += 1;
                        }
                    }
                }
                MshrResponse::NOMSHR => {
                    self.cohe_no_mshr(pool, id, &lookup);
                }
                other => panic!("unexpected probe response {other:?} for an L1 COHE"),
            }
        }
        // send the COHE_REPLY (or retry next cycle)
        ports.send_below(id)
    }

    /// COHE processing when no MSHR is involved: plain hits and misses.
    fn cohe_no_mshr(&mut self, pool: &mut ReqPool, id: ReqId, lookup: &super::Lookup) {
        let req_type = pool.get(id).req_type;
        if lookup.presence != Presence::Hit {
            pool.get_mut(id).reply = Some(Reply::NACK);
            self.base.stats.cohe_reply_nack += 1;
            return;
        }
        if req_type == ReqType::WRB {
            // a replacement from L2 that also sits in this cache
            assert!(
                self.base.level() != CacheLevel::FIRSTLEVEL_WT,
                "write-through L1 should not get a WRB"
            );
            let cur_state = self.base.lines[lookup.index].state;
            if cur_state != LineState::PR_DY {
                // we have the line but never wrote it
                pool.get_mut(id).reply = Some(Reply::NACK);
                self.base.lines[lookup.index].state = LineState::INVALID;
                self.base.pref_invalidated(lookup.index);
                self.base.stats.cohe_reply_nack += 1;
            } else {
                let line_size = self.base.config.line_size;
                let req = pool.get_mut(id);
                req.reply = Some(Reply::REPLY);
                req.size_st = REQ_SZ + line_size;
                req.size_req = REQ_SZ + line_size;
                self.base.lines[lookup.index].state = LineState::INVALID;
                // count the displaced prefetch as replaced, not invalidated
                let line = &mut self.base.lines[lookup.index];
                if line.pref {
                    line.pref = false;
                    line.pref_tag_repl = None;
                    self.base.stats.pref_useless += 1;
                }
            }
            assert!(
                !self.base.lines[lookup.index].mshr_out,
                "coherence interfering with a line that has mshr_out"
            );
            return;
        }

        // a regular coherence hit
        pool.get_mut(id).reply = Some(Reply::REPLY);
        let cur_state = self.base.lines[lookup.index].state;
        let entry = self.base.table.lookup(Kind::COHE, cur_state, req_type);
        let next = entry.next_state.expect("coherence sets a state");
        self.base.lines[lookup.index].state = next;
        assert!(
            !self.base.lines[lookup.index].mshr_out,
            "coherence transaction to a line with mshr_out"
        );

        if next == LineState::INVALID {
            self.base.pref_invalidated(lookup.index);
        }
        if self.base.lines[lookup.index].pref
            && cur_state.is_private()
            && next == LineState::SH_CL
        {
            self.base.stats.pref_downgraded += 1;
        }

        if entry.req_sz == MsgSize::HdrLine {
            // a copyback: the reply grows to line size
            assert!(
                self.base.level() != CacheLevel::FIRSTLEVEL_WT,
                "write-through L1 cannot copy back"
            );
            let line_size = self.base.config.line_size;
            let req = pool.get_mut(id);
            req.reply = Some(Reply::REPLY);
            req.size_st = REQ_SZ + line_size;
            req.size_req = REQ_SZ + line_size;
        }
    }
}
