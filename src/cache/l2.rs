use super::{CacheBase, Presence};
use crate::cohe::{LineState, MsgSize};
use crate::config::{CacheConfig, CacheLevel, HierarchyRef};
use crate::fifo::Fifo;
use crate::mshr::MshrResponse;
use crate::pipeline::Pipeline;
use crate::pool::ReqPool;
use crate::req::{Dir, Handled, Kind, MissType, NackStatus, Reply, ReqId, ReqType, Route, REQ_SZ};
use crate::smart_mshr::Release;
use crate::wrb_buf::WrbBuffer;
use console::style;
use stats::StallReason;
use std::sync::Arc;

// tag pipe roles; the data bank group sits in front of them
const REPLY_TAG_PIPE: usize = 0; // shared with COHE_REPLY: both are sunk
const COHE_TAG_PIPE: usize = 1;
const REQ_TAG_PIPE: usize = 2;

/// Outcome of one tag-array dispatch attempt.
enum TagResult {
    Done,
    Retry,
    /// the processed entry is replaced in place by its companion (used to
    /// send the directory ack right behind a cache-to-cache forward)
    Replace(ReqId),
}

/// Output side of the L2: the port toward the L1 and the port toward the
/// network/directory.
pub struct L2Ports<'a> {
    pub above: &'a mut Fifo<ReqId>,
    pub below: &'a mut Fifo<ReqId>,
}

impl L2Ports<'_> {
    fn send(&mut self, pool: &ReqPool, id: ReqId) -> bool {
        let port = match pool.get(id).route {
            Route::ABV => &mut *self.above,
            Route::BLW => &mut *self.below,
        };
        if port.full() {
            return false;
        }
        port.enqueue(id);
        true
    }
}

/// Second-level cache engine: split tag and data arrays, write-back buffer
/// coordination, inclusion enforcement, cache-to-cache transfers.
pub struct L2Cache {
    pub base: CacheBase,
    data_pipes: Vec<Pipeline<ReqId>>,
    tag_pipes: Vec<Pipeline<ReqId>>,
    pub wrb_buf: WrbBuffer,
}

impl std::fmt::Debug for L2Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("L2Cache").field("base", &self.base).finish()
    }
}

impl L2Cache {
    pub fn new(node: usize, config: Arc<CacheConfig>, hier: HierarchyRef) -> Self {
        assert_eq!(
            config.level,
            CacheLevel::SECONDLEVEL,
            "L2 engine needs a second-level configuration"
        );
        let name = format!("node-{node}-{}", style("L2").blue());
        let data_pipes = config
            .data_pipes
            .widths
            .iter()
            .map(|&w| Pipeline::new(w, config.data_pipes.delay))
            .collect::<Vec<_>>();
        let tag_pipes = config
            .tag_pipes
            .widths
            .iter()
            .map(|&w| Pipeline::new(w, config.tag_pipes.delay))
            .collect::<Vec<_>>();
        assert!(tag_pipes.len() >= 3, "L2 needs reply, cohe, and request pipes");
        let wrb_buf = WrbBuffer::new(config.wrb_buf_size());
        Self {
            base: CacheBase::new(name, node, config, hier),
            data_pipes,
            tag_pipes,
            wrb_buf,
        }
    }

    /// Pull new transactions from the input ports into the pipes.
    pub fn intake(
        &mut self,
        pool: &mut ReqPool,
        from_above: &mut Fifo<ReqId>,
        from_below: &mut Fifo<ReqId>,
        now: u64,
    ) {
        while let Some(&id) = from_below.first() {
            match pool.get(id).kind {
                Kind::REPLY => {
                    // the wrb-buf slot for a possible victimization was
                    // promised at REQUEST time; claim it now
                    assert!(
                        self.wrb_buf.used < self.wrb_buf.size(),
                        "no WRB-buffer space for an incoming reply; \
                         space must be checked before sending the request"
                    );
                    if !self.tag_pipes[REPLY_TAG_PIPE].add(id) {
                        break;
                    }
                    self.wrb_buf.reserve();
                    self.sample_net_latency(pool, id, now);
                    pool.get_mut(id).progress = 0;
                    let _ = from_below.dequeue();
                    self.base.num_in_pipes += 1;
                }
                Kind::COHE => {
                    if !self.tag_pipes[COHE_TAG_PIPE].add(id) {
                        break;
                    }
                    pool.get_mut(id).progress = 0;
                    let _ = from_below.dequeue();
                    self.base.num_in_pipes += 1;
                }
                other => panic!("L2 got {other:?} from below"),
            }
        }
        while let Some(&id) = from_above.first() {
            match pool.get(id).kind {
                Kind::REQUEST => {
                    if !self.tag_pipes[REQ_TAG_PIPE].add(id) {
                        break;
                    }
                    pool.get_mut(id).progress = 0;
                    let _ = from_above.dequeue();
                    self.base.num_in_pipes += 1;
                }
                Kind::COHE_REPLY => {
                    // subset-enforcement responses carry no further action
                    if pool.get(id).absorb_at_l2 {
                        let _ = from_above.dequeue();
                        pool.release(id);
                        continue;
                    }
                    if !self.tag_pipes[REPLY_TAG_PIPE].add(id) {
                        break;
                    }
                    pool.get_mut(id).progress = 0;
                    let _ = from_above.dequeue();
                    self.base.num_in_pipes += 1;
                }
                other => panic!("L2 got {other:?} from above"),
            }
        }
    }

    fn sample_net_latency(&mut self, pool: &ReqPool, id: ReqId, now: u64) {
        let req = pool.get(id);
        let elapsed = (now - req.net_start_time) as f64;
        let rec = match req.prcr_req_type {
            ReqType::READ => &mut self.base.stats.net_demand_miss[0],
            ReqType::WRITE => &mut self.base.stats.net_demand_miss[1],
            ReqType::RMW => &mut self.base.stats.net_demand_miss[2],
            ReqType::L1WRITE_PREFETCH => &mut self.base.stats.net_pref_miss[0],
            ReqType::L1READ_PREFETCH => &mut self.base.stats.net_pref_miss[1],
            ReqType::L2WRITE_PREFETCH => &mut self.base.stats.net_pref_miss[2],
            ReqType::L2READ_PREFETCH => &mut self.base.stats.net_pref_miss[3],
            _ => return,
        };
        rec.update(elapsed, 1.0);
    }

    /// Advance both bank groups and retire what can be retired. Data banks
    /// go first: tag work may inject into them, never the other way around.
    pub fn output(&mut self, pool: &mut ReqPool, ports: &mut L2Ports, now: u64) {
        for pipe_num in 0..self.data_pipes.len() {
            let mut posn = 0;
            while let Some(id) = self.data_pipes[pipe_num].head(posn) {
                if self.process_data_req(pool, id, ports) {
                    self.data_pipes[pipe_num].clear(posn);
                    self.base.num_in_pipes -= 1;
                }
                posn += 1;
                if posn >= self.data_pipes[pipe_num].width() {
                    break;
                }
            }
            self.data_pipes[pipe_num].advance();
        }

        if !self.base.smart.is_empty() {
            let above = &mut *ports.above;
            let below = &mut *ports.below;
            self.base.process_smart_list(
                pool,
                Some(&mut self.wrb_buf),
                &mut |pool, req| {
                    let port = match pool.get(req).route {
                        Route::ABV => &mut *above,
                        Route::BLW => &mut *below,
                    };
                    if port.full() {
                        false
                    } else {
                        port.enqueue(req);
                        true
                    }
                },
                now,
            );
        }

        for pipe_num in 0..self.tag_pipes.len() {
            let mut posn = 0;
            while let Some(id) = self.tag_pipes[pipe_num].head(posn) {
                match self.process_tag_req(pool, id, ports, now) {
                    TagResult::Done => {
                        self.tag_pipes[pipe_num].clear(posn);
                        self.base.num_in_pipes -= 1;
                    }
                    TagResult::Retry => {}
                    TagResult::Replace(companion) => {
                        self.tag_pipes[pipe_num].replace(posn, companion);
                        break;
                    }
                }
                posn += 1;
                if posn >= self.tag_pipes[pipe_num].width() {
                    break;
                }
            }
            self.tag_pipes[pipe_num].advance();
        }
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.base.num_in_pipes > 0 || self.wrb_buf.used > 0
    }

    /// Data SRAM access retirement.
    fn process_data_req(&mut self, pool: &mut ReqPool, id: ReqId, ports: &mut L2Ports) -> bool {
        match pool.get(id).kind {
            Kind::REQUEST => {
                // a cache hit on its way back up as a reply
                if pool.get(id).progress == 0 {
                    // data values are not modeled: the hit is globally
                    // performed the moment it leaves the data array
                    let req = pool.get_mut(id);
                    req.dir = Dir::REQ_BWD;
                    req.kind = Kind::REPLY;
                    req.reply = Some(Reply::REPLY);
                    req.route = Route::ABV;
                    req.progress = 1;
                }
                ports.send(pool, id)
            }
            Kind::REPLY => {
                // performs were done when the MSHR was freed (or at the
                // REQUEST stage for hits); just move it along
                ports.send(pool, id)
            }
            Kind::COHE => {
                // an upward-bound WRB, the only COHE that touches the data
                // array; never blocks the pipe
                let req_type = pool.get(id).req_type;
                assert!(
                    self.base.l1_flavor == CacheLevel::FIRSTLEVEL_WB
                        && req_type == ReqType::WRB,
                    "unexpected COHE type {req_type:?} in the L2 data pipe"
                );
                self.move_wrb_to_l1(pool, id, true, ports);
                true
            }
            Kind::COHE_REPLY => {
                if pool.get(id).absorb_at_l2 {
                    // e.g. an unsolicited L1 write-back: digested here
                    log::debug!(
                        "{}: digesting absorbed {} in the data pipe",
                        self.base.name,
                        pool.get(id)
                    );
                    pool.release(id);
                    return true;
                }
                if pool.get(id).req_type == ReqType::WRB {
                    // INVL/WRB clubbing under a write-through L1: the INVL
                    // goes up, the write-back goes down, one wrb-buf slot
                    assert_eq!(
                        self.base.l1_flavor,
                        CacheLevel::FIRSTLEVEL_WT,
                        "clubbed WRB in the data pipe without a WT L1"
                    );
                    let invl = pool
                        .get_mut(id)
                        .invl_req
                        .take()
                        .expect("clubbed WRB carries its INVL");
                    self.move_invl_to_l1(pool, invl, Some(id), ports);
                    return true;
                }
                // external coherence copyback on its way to the directory
                ports.send(pool, id)
            }
        }
    }

    /// Mark the data path of a WRB complete and push it toward the L1,
    /// using the wrb-buf entry as a smart MSHR if the port is busy.
    fn move_wrb_to_l1(&mut self, pool: &mut ReqPool, id: ReqId, withdata: bool, ports: &mut L2Ports) {
        let tag = pool.get(id).tag;
        if self.wrb_buf.mark_done_data(tag, withdata) {
            // the L1 already answered with an unsolicited write-back before
            // this demand even reached it; its data wins. Send the demand
            // up anyway and let the L1 NACK it.
            log::debug!(
                "{}: WRB race with unsolicited L1 write-back on tag {tag}",
                self.base.name
            );
            self.wrb_buf.mark_undone_l1(tag);
        }
        if !ports.send(pool, id) {
            self.base.add_to_smart_list(id, None);
        }
        self.base.stats.wb_inclusions_sent += 1;
    }

    /// Send a subset-enforcement invalidation up, optionally with a
    /// write-back clubbed into the same wrb-buf slot.
    fn move_invl_to_l1(
        &mut self,
        pool: &mut ReqPool,
        invl: ReqId,
        wrb: Option<ReqId>,
        ports: &mut L2Ports,
    ) {
        let tag = pool.get(invl).tag;
        match wrb {
            Some(wrb) => {
                pool.get_mut(invl).wrb_req = Some(wrb);
                if ports.send(pool, invl) {
                    // INVL is out; the slot now carries the WRB
                    let promoted = self.wrb_buf.promote(pool, tag);
                    debug_assert_eq!(promoted, wrb);
                    let wrb_tag = pool.get(promoted).tag;
                    if ports.send(pool, promoted) {
                        self.wrb_buf.remove(wrb_tag);
                    } else {
                        self.base
                            .add_to_smart_list(promoted, Some(Release::WrbSlot(wrb_tag)));
                    }
                } else {
                    self.base
                        .add_to_smart_list(invl, Some(Release::WrbPromote(tag)));
                }
            }
            None => {
                if ports.send(pool, invl) {
                    self.wrb_buf.remove(tag);
                } else {
                    self.base
                        .add_to_smart_list(invl, Some(Release::WrbSlot(tag)));
                }
            }
        }
    }

    /// Tag SRAM access retirement.
    fn process_tag_req(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L2Ports,
        now: u64,
    ) -> TagResult {
        {
            let block_bits = self.base.config.block_bits();
            let line_size = self.base.config.line_size;
            let req = pool.get_mut(id);
            req.tag = req.address >> block_bits;
            req.line_size = line_size;
        }
        match pool.get(id).kind {
            Kind::REQUEST => self.process_request(pool, id, ports, now),
            Kind::REPLY => self.process_reply(pool, id, ports, now),
            Kind::COHE | Kind::COHE_REPLY => self.process_cohe_family(pool, id, ports, now),
        }
    }

    fn wrbbuf_would_overflow(&self) -> bool {
        self.wrb_buf.used + self.base.mshrs.mshr_count >= self.wrb_buf.size()
    }

    fn process_request(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L2Ports,
        now: u64,
    ) -> TagResult {
        if pool.get(id).progress == 0 {
            // a reply the L1 bounced for lack of a victim comes back as a
            // plain request; only statistics care
            let wasnack = pool.get(id).l1nack;
            if wasnack {
                pool.get_mut(id).l1nack = false;
            }

            // a request aliasing an in-flight victim must wait for the WRB
            // to leave, or a returning reply could find its line half-gone
            let tag = pool.get(id).tag;
            if self.wrb_buf.hit_markstall(tag) {
                log::debug!(
                    "{}: REQ {} stalled on an outstanding WRB",
                    self.base.name,
                    pool.get(id)
                );
                self.base.stats.inc_stall(StallReason::WRB_MATCH);
                return TagResult::Retry;
            }

            let lookup = self.base.lookup(pool.get(id).address);
            let block = self.wrbbuf_would_overflow();
            let response = self.base.probe(pool, id, block, now);
            log::debug!(
                "{}: REQ {} -> {:?}",
                self.base.name,
                pool.get(id),
                response
            );
            let is_pref = pool.get(id).prefetch;
            match response {
                MshrResponse::MSHR_COAL => {
                    pool.get_mut(id).handled = Handled::L2COAL;
                    if is_pref && !wasnack {
                        self.base.stats.pref_total += 1;
                        self.base.stats.pref_unnecessary += 1;
                    }
                    return TagResult::Done;
                }
                MshrResponse::MSHR_NEW | MshrResponse::MSHR_FWD => {
                    if is_pref && !wasnack {
                        self.base.stats.pref_total += 1;
                        if response == MshrResponse::MSHR_FWD {
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
                MshrResponse::MSHR_STALL_WAR
                | MshrResponse::MSHR_STALL_COHE
                | MshrResponse::MSHR_STALL_COAL
                | MshrResponse::MSHR_STALL_WRB
                | MshrResponse::NOMSHR_STALL
                | MshrResponse::NOMSHR_STALL_COHE
                | MshrResponse::NOMSHR_STALL_WRBBUF_FULL => {
                    // the L2 cannot drop prefetches: they may already carry
                    // coalesced requests waiting at the L1
                    return TagResult::Retry;
                }
                MshrResponse::NOMSHR => {
                    // a hit: it must pass through the data array before the
                    // reply can go up
                    if self.data_pipes[0].add(id) {
                        let state = self.base.lines[lookup.index].state;
                        let req = pool.get_mut(id);
                        req.req_type = if state.is_private() {
                            // the L1 treats REPLY_EXCL as REPLY_UPGRADE too:
                            // requests are not distinguished here
                            ReqType::REPLY_EXCL
                        } else {
                            ReqType::REPLY_SH
                        };
                        req.progress = 0;
                        req.handled = Handled::L2HIT;
                        req.miss_type = MissType::L2HIT;
                        if is_pref && !wasnack {
                            self.base.stats.pref_total += 1;
                            self.base.stats.pref_unnecessary += 1;
                        }
                        self.base.num_in_pipes += 1;
                        return TagResult::Done;
                    }
                    return TagResult::Retry;
                }
                MshrResponse::NOMSHR_FWD | MshrResponse::MSHR_USELESS_FETCH_IN_PROGRESS => {
                    panic!("{response:?} is not a second-level response")
                }
            }
        }
        // send the miss or upgrade toward the directory
        pool.get_mut(id).net_start_time = now;
        pool.get_mut(id).route = Route::BLW;
        if ports.send(pool, id) {
            TagResult::Done
        } else {
            TagResult::Retry
        }
    }

    fn process_reply(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L2Ports,
        now: u64,
    ) -> TagResult {
        debug_assert!(
            !self.wrb_buf.hit(pool.get(id).tag),
            "a reply must never match the WRB buffer"
        );
        if pool.get(id).progress == 0 {
            let req_type = pool.get(id).req_type;
            let reply = pool.get(id).reply;
            assert!(
                req_type.is_line_reply() || reply == Some(Reply::RAR),
                "illegal reply type {req_type:?} at the L2 cache"
            );

            if reply == Some(Reply::RAR) {
                // retry using the smart MSHR already booked for the REQUEST,
                // decoupled from reply handling
                let mshr_num = self
                    .base
                    .mshrs
                    .find(pool.get(id).tag)
                    .expect("RAR for a nonexistent MSHR");
                {
                    let node = self.base.node;
                    let req = pool.get_mut(id);
                    req.dir = Dir::REQ_FWD;
                    req.route = Route::BLW;
                    req.kind = Kind::REQUEST;
                    req.mshr_num = Some(mshr_num);
                    if req.src_node != node {
                        std::mem::swap(&mut req.src_node, &mut req.dest_node);
                    }
                }
                log::debug!(
                    "{}: RAR for tag {}; resending the request",
                    self.base.name,
                    pool.get(id).tag
                );
                self.base.stats.rars_handled += 1;
                self.base.add_to_smart_list(id, None);
                // the reservation is rebooked when the real reply arrives
                self.wrb_buf.unreserve();
                return TagResult::Done;
            }

            assert_ne!(req_type, ReqType::WRB, "WRBs do not send replies");

            let mshr_num = self
                .base
                .mshrs
                .find(pool.get(id).tag)
                .expect("reply for a nonexistent MSHR");
            let pend_cohe = self.base.mshrs.get(mshr_num).pend_cohe;
            let writes_present = self.base.mshrs.get(mshr_num).writes_present;
            let only_prefs = self.base.mshrs.get(mshr_num).only_prefs;
            let address = pool.get(id).address;
            let lookup = self.base.lookup(address);
            log::debug!(
                "{}: REPLY {} ({:?})",
                self.base.name,
                pool.get(id),
                lookup.presence
            );

            match lookup.presence {
                Presence::Hit => {
                    // the upgrade case
                    let cur_state = self.base.lines[lookup.index].state;
                    let entry = self.base.table.lookup(Kind::REPLY, cur_state, req_type);
                    let next = super::adjust_for_writes(
                        entry.next_state,
                        writes_present,
                    );
                    {
                        let req = pool.get_mut(id);
                        req.invl_req = None;
                        req.wrb_req = None;
                    }
                    // non-replacing replies do not need the held entry
                    self.wrb_buf.unreserve();
                    let line = &mut self.base.lines[lookup.index];
                    line.state = next;
                    line.mshr_out = false;
                    self.apply_pend_cohe(lookup.index, next, pend_cohe);
                }
                Presence::PresentMiss => {
                    let is_pref = pool.get(id).prefetch;
                    self.base
                        .premiss_ageupdate(lookup.index, is_pref, only_prefs, now);
                    let _ = self.base.ccd.observe(lookup.tag);
                    if pool.get(id).miss_type == MissType::UNKNOWN {
                        pool.get_mut(id).miss_type = MissType::COHE;
                    }
                    self.base.classify(pool, id, stats::MissClass::COHE);
                    {
                        let req = pool.get_mut(id);
                        req.invl_req = None;
                        req.wrb_req = None;
                    }
                    self.install_line(pool, id, lookup.index, writes_present, pend_cohe);
                    self.wrb_buf.unreserve();
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
                        // too many upgrades outstanding in the set: bounce
                        // the whole line back to the directory for a retry
                        let (_, _, dest) = self.base.line_attrs(&lookup, address);
                        let node = self.base.node;
                        {
                            let req = pool.get_mut(id);
                            req.preprocessed = true;
                            req.src_node = node;
                            req.dest_node = dest;
                            req.invl_req = None;
                            req.wrb_req = None;
                        }
                        log::debug!(
                            "{}: nacking reply for tag {} back to the directory",
                            self.base.name,
                            lookup.tag
                        );
                        self.base.nack_upgrade_conflict_reply(pool, id);
                        self.wrb_buf.unreserve();
                        return TagResult::Done;
                    };

                    self.base.classify_fill(pool, id);

                    let victim_state = self.base.lines[victim].state;
                    if victim_state == LineState::INVALID {
                        assert!(
                            !self.base.lines[victim].mshr_out,
                            "victimizing a line with mshr_out"
                        );
                        {
                            let req = pool.get_mut(id);
                            req.invl_req = None;
                            req.wrb_req = None;
                        }
                        self.install_line(pool, id, victim, writes_present, pend_cohe);
                        self.wrb_buf.unreserve();
                    } else {
                        self.replace_line(pool, id, victim, writes_present, pend_cohe);
                    }
                }
            }
            pool.get_mut(id).progress = 1;
            pool.get_mut(id).mshr_num = Some(mshr_num);
        }

        if pool.get(id).progress == 1 {
            // a lone subset invalidation can go straight up
            let invl = pool.get(id).invl_req;
            let wrb = pool.get(id).wrb_req;
            if let (Some(invl), None) = (invl, wrb) {
                self.move_invl_to_l1(pool, invl, None, ports);
            }
            pool.get_mut(id).progress = 2;
        }

        if pool.get(id).progress == 2 {
            if let Some(wrb) = pool.get(id).wrb_req {
                if pool.get(wrb).req_type == ReqType::WRB {
                    if !pool.get(wrb).prclwrb {
                        // dirty in L2: read the line out of the data array
                        // before the inclusion message goes up (or, under a
                        // WT L1, before the WRB goes down)
                        if let Some(invl) = pool.get(id).invl_req {
                            pool.get_mut(wrb).invl_req = Some(invl);
                        }
                        if !self.data_pipes[0].add(wrb) {
                            return TagResult::Retry;
                        }
                        pool.get_mut(wrb).progress = 0;
                        self.base.num_in_pipes += 1;
                    } else {
                        // L2 held it clean; only the L1 may have data
                        self.move_wrb_to_l1(pool, wrb, false, ports);
                        self.base.stats.wb_prcl_inclusions_sent += 1;
                    }
                } else {
                    // a plain REPL hint: no data array access needed, but it
                    // holds a wrb-buf slot and must be sunk
                    if let Some(invl) = pool.get(id).invl_req {
                        self.move_invl_to_l1(pool, invl, Some(wrb), ports);
                    } else {
                        let tag = pool.get(wrb).tag;
                        if ports.send(pool, wrb) {
                            self.wrb_buf.remove(tag);
                        } else {
                            self.base
                                .add_to_smart_list(wrb, Some(Release::WrbSlot(tag)));
                        }
                    }
                }
            }

            // before freeing the MSHR, club every access coalesced here onto
            // the reply (including accesses that coalesced at the write
            // buffer onto those), so the L1 sees them as one unit
            let mshr_num = pool.get(id).mshr_num.expect("reply bound to an MSHR");
            if !self.base.mshrs.get(mshr_num).coalesced.is_empty() {
                let mut flattened = std::mem::take(&mut pool.get_mut(id).coalesced);
                for coal in self.base.mshrs.get(mshr_num).coalesced.clone() {
                    flattened.push(coal);
                    flattened.extend(std::mem::take(&mut pool.get_mut(coal).coalesced));
                }
                pool.get_mut(id).coalesced = flattened;
            }
            let miss_type = pool.get(id).miss_type;
            // the reply and its riders perform now; the REQ bodies travel on
            // up and are released at the L1
            self.base
                .mshrs
                .iterate_uncoalesce(mshr_num, pool, miss_type, |_, _| {});
            self.base
                .mshrs
                .remove(mshr_num, None, &mut self.base.stats, now);
            pool.get_mut(id).progress = 4;
        }

        // ready to model the data-array read for the fill
        if self.data_pipes[0].add(id) {
            let req = pool.get_mut(id);
            req.progress = 0;
            req.route = Route::ABV;
            self.base.num_in_pipes += 1;
            TagResult::Done
        } else {
            TagResult::Retry
        }
    }

    /// Apply a merged pending coherence after a reply sets `next`.
    ///
    /// A private reply means the merged COHE was stale (sent on old
    /// directory information) and is ignored here; the L1 still honors it.
    fn apply_pend_cohe(&mut self, index: usize, next: LineState, pend_cohe: Option<ReqType>) {
        let Some(pend) = pend_cohe else { return };
        if next.is_private() {
            assert_ne!(next, LineState::PR_DY, "merged coherence on a dirty reply");
            self.base.stats.cohe_reply_merge_ignore += 1;
            return;
        }
        let entry = self.base.table.lookup(Kind::COHE, next, pend);
        self.base.lines[index].state = entry.next_state.expect("coherence sets a state");
        assert!(
            !self.base.lines[index].mshr_out,
            "merged coherence evicting a line with mshr_out"
        );
    }

    fn install_line(
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
        let entry =
            self.base
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
        line.cohe_pend = false;
        self.apply_pend_cohe(index, next, pend_cohe);
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
        log::debug!(
            "{}: REPL tag {tag_repl} in state {victim_state:?} for incoming reply",
            self.base.name
        );

        let repl_entry = self
            .base
            .table
            .lookup(Kind::REQUEST, victim_state, ReqType::REPL);
        assert!(
            !self.base.lines[victim].mshr_out,
            "victimizing a line with mshr_out"
        );
        self.install_line(pool, id, victim, writes_present, None);

        let node = self.base.node;
        let line_size = self.base.config.line_size;

        if self.base.l1_flavor == CacheLevel::FIRSTLEVEL_WB {
            if victim_state == LineState::SH_CL {
                // shared victim: a subset-enforcement invalidation goes up,
                // absorbed on its way back
                let invl = self.base.make_repl_req(
                    pool,
                    id,
                    tag_repl,
                    repl_entry.next_req.expect("shared repl messages the L1"),
                    repl_entry.next_req_sz.bytes(line_size),
                    MsgSize::Hdr.bytes(line_size),
                    victim_cohe,
                    victim_allo,
                    node,
                    victim_dest,
                    Route::ABV,
                );
                pool.get_mut(invl).absorb_at_l2 = true;
                pool.get_mut(id).invl_req = Some(invl);
                self.wrb_buf.insert(pool, invl, None);
            } else {
                // private victim: send an explicit WRB up even when the L2
                // holds it clean, since the L1 may hold it dirty
                let wrb = self.base.make_repl_req(
                    pool,
                    id,
                    tag_repl,
                    ReqType::WRB,
                    repl_entry.next_req_sz.bytes(line_size),
                    MsgSize::Hdr.bytes(line_size),
                    victim_cohe,
                    victim_allo,
                    node,
                    victim_dest,
                    Route::ABV,
                );
                if victim_state == LineState::PR_CL {
                    // skip the L2 data array on the way out
                    pool.get_mut(wrb).prclwrb = true;
                }
                pool.get_mut(id).wrb_req = Some(wrb);
                self.wrb_buf.insert(pool, wrb, None);
            }
        } else {
            // write-through L1 above
            let blw = repl_entry.next_mod_req;
            let abv = repl_entry.next_req;
            let wrb = blw.map(|blw_type| {
                self.base.make_repl_req(
                    pool,
                    id,
                    tag_repl,
                    blw_type,
                    repl_entry.req_sz.bytes(line_size),
                    repl_entry.rep_sz.bytes(line_size),
                    victim_cohe,
                    victim_allo,
                    node,
                    victim_dest,
                    Route::BLW,
                )
            });
            let invl = abv.map(|abv_type| {
                let invl = self.base.make_repl_req(
                    pool,
                    id,
                    tag_repl,
                    abv_type,
                    repl_entry.next_req_sz.bytes(line_size),
                    MsgSize::Hdr.bytes(line_size),
                    victim_cohe,
                    victim_allo,
                    node,
                    victim_dest,
                    Route::ABV,
                );
                // the invalidation terminates at this cache on its way back
                pool.get_mut(invl).absorb_at_l2 = true;
                invl
            });
            pool.get_mut(id).wrb_req = wrb;
            pool.get_mut(id).invl_req = invl;
            match (invl, wrb) {
                (Some(invl), wrb) => self.wrb_buf.insert(pool, invl, wrb),
                (None, Some(wrb)) => self.wrb_buf.insert(pool, wrb, None),
                (None, None) => {
                    panic!("L2 replacement produced neither an upward nor a downward message")
                }
            }
        }

        let installed = self.base.lines[victim].state;
        self.apply_pend_cohe(victim, installed, pend_cohe);
    }

    /// COHE and COHE_REPLY handling share their tail (sending the response),
    /// so they live in one function; a COHE turns into its reply in place.
    fn process_cohe_family(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        ports: &mut L2Ports,
        now: u64,
    ) -> TagResult {
        if pool.get(id).kind == Kind::COHE && pool.get(id).progress == 0 {
            self.base.stats.cohe += 1;
            let address = pool.get(id).address;
            let lookup = self.base.lookup(address);

            if lookup.presence == Presence::Hit {
                // no REQUEST may be serviced for this line until the action
                // completes, and a second COHE must wait too
                if self.base.lines[lookup.index].cohe_pend {
                    self.base.stats.inc_stall(StallReason::COHE_PEND_COHE);
                    return TagResult::Retry;
                }
                self.base.lines[lookup.index].cohe_pend = true;
            }

            let response = self.base.probe(pool, id, false, now);
            log::debug!(
                "{}: COHE {} ({:?}, {:?})",
                self.base.name,
                pool.get(id),
                lookup.presence,
                response
            );
            match response {
                MshrResponse::MSHR_COAL | MshrResponse::MSHR_FWD => {
                    // a possible MSHR merge; decided on the COHE_REPLY
                    pool.get_mut(id).progress = 7;
                }
                MshrResponse::NOMSHR => {
                    if lookup.presence != Presence::Hit {
                        // miss: NACK immediately (a miss here is a miss at
                        // the L1 too)
                        self.base.stats.cohe_nack += 1;
                        if pool.get(id).forward_to.is_some() {
                            self.base.stats.cohe_cache_to_cache_fail += 1;
                        }
                        let req = pool.get_mut(id);
                        req.reply = Some(Reply::NACK);
                        req.kind = Kind::COHE_REPLY;
                        req.dir = Dir::REQ_BWD;
                        req.route = Route::BLW;
                        req.progress = 8;
                    } else {
                        // hit: the line state changes only after the L1
                        // answers
                        pool.get_mut(id).progress = 7;
                    }
                }
                other => panic!("unexpected probe response {other:?} for an L2 COHE"),
            }
        }

        if pool.get(id).kind == Kind::COHE_REPLY && pool.get(id).progress == 0 {
            if pool.get(id).reply == Some(Reply::NACK_PEND)
                && pool.get(id).req_type != ReqType::WRB
            {
                // propagate the L1's NACK_PEND; the directory reevaluates
                let lookup = self.base.lookup(pool.get(id).address);
                if lookup.presence == Presence::Hit
                    && self.base.lines[lookup.index].cohe_pend
                {
                    self.base.lines[lookup.index].cohe_pend = false;
                }
                self.base.stats.cohe_reply_prop_nack_pend += 1;
                let req = pool.get_mut(id);
                req.size_st = REQ_SZ;
                req.size_req = REQ_SZ;
                req.progress = 8;
            } else if let Some(result) = self.cohe_reply_action(pool, id, now) {
                // the message was consumed (absorbed or parked) in place
                return result;
            }
        }

        self.cohe_send(pool, id, ports)
    }

    /// The heart of COHE_REPLY processing: invalidations, write-backs, and
    /// cache-to-cache transfers take effect here. Returns `Some` when the
    /// message was consumed and must not reach the send tail.
    fn cohe_reply_action(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        now: u64,
    ) -> Option<TagResult> {
        self.base.stats.cohe_reply += 1;

        let address = pool.get(id).address;
        let lookup = self.base.lookup(address);
        let response = self.base.probe(pool, id, false, now);
        log::debug!(
            "{}: COHE_REPLY {} ({:?}, {:?})",
            self.base.name,
            pool.get(id),
            lookup.presence,
            response
        );

        if lookup.presence == Presence::Hit && self.base.lines[lookup.index].cohe_pend {
            self.base.lines[lookup.index].cohe_pend = false;
        }

        match response {
            MshrResponse::MSHR_COAL => {
                match pool.get(id).nack_st {
                    NackStatus::NACK_OK => {
                        // invalidate merged with a read MSHR: positive ACK
                        // now, honored at the reply if it comes back shared
                        self.base.stats.cohe_reply_merge += 1;
                        let req = pool.get_mut(id);
                        req.reply = Some(Reply::REPLY);
                        req.size_st = REQ_SZ;
                        req.size_req = REQ_SZ;
                    }
                    NackStatus::NACK_NOK => {
                        // a copyback demand while the line may be coming
                        // back private: only NACK_PEND is safe
                        self.base.stats.cohe_reply_nack_pend += 1;
                        let req = pool.get_mut(id);
                        req.reply = Some(Reply::NACK_PEND);
                        req.size_st = REQ_SZ;
                        req.size_req = REQ_SZ;
                    }
                }
                pool.get_mut(id).progress = 8;
            }
            MshrResponse::MSHR_FWD => {
                {
                    let req = pool.get_mut(id);
                    req.reply = Some(Reply::NACK);
                    req.size_st = REQ_SZ;
                    req.size_req = REQ_SZ;
                }
                if lookup.presence != Presence::Hit {
                    self.base.stats.cohe_reply_nack_mergefail += 1;
                } else {
                    // the COHE predates our exclusive request: act now
                    assert!(
                        pool.get(id).req_type != ReqType::COPYBACK,
                        "COPYBACK cannot be resolved against an exclusive MSHR"
                    );
                    self.base.stats.cohe_reply_nack_docohe += 1;
                    let line = &mut self.base.lines[lookup.index];
                    line.state = LineState::INVALID;
                    line.mshr_out = false;
                    self.base.pref_invalidated(lookup.index);
                }
                pool.get_mut(id).progress = 8;
            }
            MshrResponse::NOMSHR => return self.cohe_reply_no_mshr(pool, id, &lookup),
            other => panic!("unexpected probe response {other:?} for an L2 COHE_REPLY"),
        }
        None
    }

    fn cohe_reply_no_mshr(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        lookup: &super::Lookup,
    ) -> Option<TagResult> {
        let req_type = pool.get(id).req_type;
        let reply = pool.get(id).reply;
        let tag = pool.get(id).tag;

        if lookup.presence != Presence::Hit {
            if req_type == ReqType::WRB {
                return self.wrb_race(pool, id, tag);
            }
            // replacements can slip between a COHE and its COHE_REPLY
            if self.wrb_buf.hit(tag) {
                if reply == Some(Reply::NACK) {
                    // the L1 had nothing either; leave the buffered line be
                } else {
                    // the answer carries the line we are writing back anyway
                    self.base.stats.wb_inclusions_race += 1;
                }
            }
            self.base.stats.cohe_reply_nack += 1;
            if pool.get(id).forward_to.is_some() {
                self.base.stats.cohe_cache_to_cache_fail += 1;
            }
            pool.get_mut(id).reply = Some(Reply::NACK);
            pool.get_mut(id).progress = 8;
            return None;
        }

        // hit in the cache
        if pool.get(id).forward_to.is_some() {
            self.base.stats.cohe_cache_to_cache_good += 1;
        }
        let mut cur_state = self.base.lines[lookup.index].state;

        if req_type != ReqType::WRB {
            // the L1 may have held the line dirty while we held it PR_CL;
            // its copyback data rides on this reply
            if cur_state == LineState::PR_CL && pool.get(id).carries_data() {
                cur_state = LineState::PR_DY;
                self.base.lines[lookup.index].state = LineState::PR_DY;
            }
            let entry = self.base.table.lookup(Kind::COHE, cur_state, req_type);
            let next = entry.next_state.expect("coherence sets a state");
            self.base.lines[lookup.index].state = next;
            if next == LineState::INVALID {
                self.base.pref_invalidated(lookup.index);
            }
            if self.base.lines[lookup.index].pref
                && cur_state.is_private()
                && next == LineState::SH_CL
            {
                self.base.stats.pref_downgraded += 1;
            }
            assert!(
                !self.base.lines[lookup.index].mshr_out,
                "coherence transaction to a line with mshr_out"
            );

            if pool.get(id).forward_to.is_some() {
                // a cache-to-cache transfer: one response to the directory,
                // one line-sized reply to the requesting cache, both timed
                // through the data array
                assert_ne!(
                    cur_state,
                    LineState::SH_CL,
                    "cache-to-cache transfer request to a non-pending shared line"
                );
                let ack = self.make_forward_ack(pool, id, cur_state);
                pool.get_mut(id).invl_req = Some(ack);
                self.make_forward(pool, id, cur_state);
                pool.get_mut(id).progress = 9;
                return None;
            }

            if entry.req_sz == MsgSize::HdrLine {
                // a copyback: goes to the directory through the data array
                let line_size = self.base.config.line_size;
                let req = pool.get_mut(id);
                req.reply = Some(Reply::REPLY);
                req.size_st = REQ_SZ + line_size;
                req.size_req = REQ_SZ + line_size;
                req.progress = 1;
            } else {
                // a plain invalidation acknowledgment
                let req = pool.get_mut(id);
                req.reply = Some(Reply::REPLY);
                req.size_st = REQ_SZ;
                req.size_req = REQ_SZ;
                req.progress = 8;
            }
        } else {
            // an unsolicited write-back from the L1 that fits here
            if cur_state == LineState::PR_CL {
                self.base.lines[lookup.index].state = LineState::PR_DY;
            } else {
                assert_eq!(cur_state, LineState::PR_DY, "L1 WRB received to a bad line");
            }
            assert_ne!(
                reply,
                Some(Reply::NACK),
                "an unsolicited WRB cannot be a NACK"
            );
            self.base.stats.cohe_reply_unsolicited_wrb += 1;
            let req = pool.get_mut(id);
            req.absorb_at_l2 = true;
            req.progress = 1; // digest it through the data pipe
        }
        None
    }

    /// A WRB COHE_REPLY that misses in the tag array: the race matrix
    /// against the write-back buffer.
    fn wrb_race(&mut self, pool: &mut ReqPool, id: ReqId, tag: u64) -> Option<TagResult> {
        let reply = pool.get(id).reply;
        if !self.wrb_buf.hit(tag) {
            // both caches replaced the same line at once; the L1's own
            // write-back already went down as the ACK, this is the NACK
            assert_ne!(
                reply,
                Some(Reply::REPLY),
                "simultaneous replacement race must answer negatively"
            );
            log::debug!(
                "{}: two-cache replacement race on WRB tag {tag}",
                self.base.name
            );
            pool.release(id);
            return Some(TagResult::Done);
        }
        if self.wrb_buf.check_done_l1(tag) {
            // an unsolicited write-back already satisfied the L1 path
            assert_ne!(
                reply,
                Some(Reply::REPLY),
                "L1 path done twice for the same write-back"
            );
            pool.release(id);
            return Some(TagResult::Done);
        }
        match reply {
            Some(Reply::NACK) => {
                // the L1 did not have it; the L2 data (if any) stands
            }
            Some(Reply::NACK_PEND) => {
                if self.wrb_buf.check_stalling(tag) {
                    // a stalled REQUEST guarantees the L1 cannot supply
                    // data; treat like a NACK and let the WRB go down
                } else {
                    // resend the demand WRB through the booked wrb-buf slot;
                    // pushing it through this same message would create a
                    // COHE_REPLY -> COHE dependence
                    let line_size = self.base.config.line_size;
                    {
                        let req = pool.get_mut(id);
                        req.kind = Kind::COHE;
                        req.dir = Dir::REQ_FWD;
                        req.route = Route::ABV;
                        req.size_st = REQ_SZ;
                        req.size_req = REQ_SZ + line_size;
                        req.progress = 0;
                    }
                    self.base.stats.wb_repeats += 1;
                    self.base.add_to_smart_list(id, None);
                    return Some(TagResult::Done);
                }
            }
            Some(Reply::REPLY) => {
                // the L1 supplies the line
                self.base.stats.wb_inclusions_real += 1;
            }
            other => panic!("unexpected WRB reply status {other:?}"),
        }
        if self.wrb_buf.mark_done_l1(pool, id) {
            // both halves done; the WRB (possibly downgraded to REPL) may
            // leave for the directory
            let req = pool.get_mut(id);
            req.dir = Dir::REQ_FWD;
            req.route = Route::BLW;
            req.progress = 8;
            None
        } else {
            // the L1 answered before the L2 demand write-back even issued;
            // the demand copy will be nacked separately
            log::debug!("{}: early L1 answer on WRB tag {tag}", self.base.name);
            pool.release(id);
            Some(TagResult::Done)
        }
    }

    /// Progress-driven send tail shared by COHE and COHE_REPLY.
    fn cohe_send(&mut self, pool: &mut ReqPool, id: ReqId, ports: &mut L2Ports) -> TagResult {
        match pool.get(id).progress {
            1 => {
                // through the data array (copybacks, absorbed WRBs)
                if self.data_pipes[0].add(id) {
                    pool.get_mut(id).progress = 0;
                    self.base.num_in_pipes += 1;
                    TagResult::Done
                } else {
                    TagResult::Retry
                }
            }
            7 => {
                // forward the COHE up to the L1
                pool.get_mut(id).route = Route::ABV;
                if ports.send(pool, id) {
                    TagResult::Done
                } else {
                    TagResult::Retry
                }
            }
            8 => {
                pool.get_mut(id).kind = Kind::COHE_REPLY;
                pool.get_mut(id).route = Route::BLW;
                let req_type = pool.get(id).req_type;
                if matches!(req_type, ReqType::WRB | ReqType::REPL) {
                    // holds a wrb-buf slot: must be sunk to avoid deadlock
                    let tag = pool.get(id).tag;
                    if ports.send(pool, id) {
                        self.wrb_buf.remove(tag);
                    } else {
                        self.base.add_to_smart_list(id, Some(Release::WrbSlot(tag)));
                    }
                    TagResult::Done
                } else if ports.send(pool, id) {
                    TagResult::Done
                } else {
                    TagResult::Retry
                }
            }
            9 => {
                // the cache-to-cache forward goes out through the data
                // array; the directory ack follows right behind it
                pool.get_mut(id).kind = Kind::REPLY;
                if !self.data_pipes[0].add(id) {
                    pool.get_mut(id).kind = Kind::COHE_REPLY;
                    return TagResult::Retry;
                }
                pool.get_mut(id).progress = 0;
                self.base.num_in_pipes += 1;
                let ack = pool
                    .get_mut(id)
                    .invl_req
                    .take()
                    .expect("forward carries its directory ack");
                pool.get_mut(ack).progress = 10;
                TagResult::Replace(ack)
            }
            10 => {
                // the directory ack: a full copyback needs data-array time
                if pool.get(id).carries_data() {
                    if self.data_pipes[0].add(id) {
                        pool.get_mut(id).progress = 0;
                        self.base.num_in_pipes += 1;
                        TagResult::Done
                    } else {
                        TagResult::Retry
                    }
                } else if ports.send(pool, id) {
                    TagResult::Done
                } else {
                    TagResult::Retry
                }
            }
            other => panic!("invalid COHE progress state {other}"),
        }
    }

    /// The acknowledgment (possibly with data) sent to the directory behind
    /// a cache-to-cache transfer.
    fn make_forward_ack(&mut self, pool: &mut ReqPool, id: ReqId, cur_state: LineState) -> ReqId {
        let mut ack = pool.get(id).clone();
        ack.coalesced = Vec::new();
        ack.invl_req = None;
        ack.wrb_req = None;
        // a shared copyback from dirty owes the directory the line too; a
        // COPYBACK_INVL leaves the line private-dirty at the requestor, and
        // a copyback from PR_CL matches what the directory already has
        if ack.req_type == ReqType::COPYBACK && cur_state != LineState::PR_CL {
            ack.size_st = REQ_SZ + ack.line_size;
            ack.size_req = REQ_SZ + ack.line_size;
        } else {
            ack.size_st = REQ_SZ;
            ack.size_req = REQ_SZ;
        }
        ack.dir = Dir::REQ_BWD;
        ack.route = Route::BLW;
        ack.reply = Some(Reply::REPLY);
        ack.kind = Kind::COHE_REPLY;
        pool.alloc(ack)
    }

    /// Turn the COHE itself into the line-sized reply headed for the
    /// requesting cache.
    fn make_forward(&mut self, pool: &mut ReqPool, id: ReqId, cur_state: LineState) {
        let node = self.base.node;
        let req = pool.get_mut(id);
        debug_assert!(matches!(
            req.req_type,
            ReqType::COPYBACK | ReqType::COPYBACK_INVL | ReqType::COPYBACK_SHDY
        ));
        req.reply = Some(Reply::REPLY);
        req.req_type = match (req.req_type, cur_state) {
            (ReqType::COPYBACK_INVL, LineState::PR_DY | LineState::SH_DY) => {
                // ownership moves with the data; the directory never saw it
                ReqType::REPLY_EXCLDY
            }
            (ReqType::COPYBACK_INVL, _) => ReqType::REPLY_EXCL,
            (ReqType::COPYBACK_SHDY, LineState::PR_DY) => ReqType::REPLY_SHDY,
            _ => ReqType::REPLY_SH,
        };
        req.dir = Dir::REQ_BWD;
        req.route = Route::BLW;
        req.size_st = REQ_SZ + req.line_size;
        req.size_req = REQ_SZ + req.line_size;
        req.src_node = req.forward_to.expect("forward target set");
        req.dest_node = node;
        req.handled = Handled::CACHE_TO_CACHE;
        req.miss_type = MissType::REM;
    }
}
