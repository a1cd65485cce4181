pub mod l1;
pub mod l2;

use crate::capconf::{CapConfDetector, MissKind};
use crate::cohe::{self, LineState};
use crate::config::{CacheConfig, CacheLevel, CoheKind, HierarchyRef};
use crate::mshr::{MshrFile, MshrResponse};
use crate::pool::ReqPool;
use crate::req::{Dir, Kind, MissType, NackStatus, Reply, Req, ReqId, ReqType, Route};
use crate::smart_mshr::{Release, SmartMshrList};
use crate::wrb_buf::WrbBuffer;
use crate::address;
use rand::{rngs::StdRng, Rng, SeedableRng};
use stats::{MissClass, StallReason};
use std::sync::Arc;

/// Growth chunk (and initial allocation) for infinite caches, in lines.
pub const INFINITE_CHUNK: usize = 2048;

/// A completed processor access, handed back to the front-end.
#[derive(Clone, Debug)]
pub struct Completion {
    pub inst_tag: u64,
    pub address: address,
    pub kind: ReqType,
    pub miss_type: MissType,
    pub prefetched_late: bool,
}

/// One cache line slot.
#[derive(Clone, Debug)]
pub struct Line {
    pub tag: u64,
    /// LRU age within the set; 1 is youngest
    pub age: u32,
    /// home node of the physical address
    pub dest_node: usize,
    pub cohe_kind: CoheKind,
    pub allo_type: bool,
    pub state: LineState,
    /// an upgrade is in flight; the line must not be victimized
    pub mshr_out: bool,
    /// a coherence message is in flight through this line; no new REQUEST
    /// may be serviced for it
    pub cohe_pend: bool,
    /// brought in by a prefetch, not yet demand-touched
    pub pref: bool,
    pub pref_time: u64,
    /// tag this prefetch evicted, for damaging-prefetch accounting
    pub pref_tag_repl: Option<u64>,
}

impl Line {
    fn invalid(age: u32) -> Self {
        Self {
            tag: u64::MAX,
            age,
            dest_node: 0,
            cohe_kind: CoheKind::WB_NREF,
            allo_type: false,
            state: LineState::INVALID,
            mshr_out: false,
            cohe_pend: false,
            pref: false,
            pref_time: 0,
            pref_tag_repl: None,
        }
    }
}

/// `writes_present` forces a filled line dirty even when the reply itself
/// brought it back private clean.
pub(crate) fn adjust_for_writes(next: Option<LineState>, writes_present: bool) -> LineState {
    let next = next.expect("reply entry sets a state");
    if writes_present && next != LineState::PR_DY {
        assert_eq!(
            next,
            LineState::PR_CL,
            "writes present but the reply state is shared"
        );
        return LineState::PR_DY;
    }
    next
}

/// Result of a tag lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Hit,
    /// tag present but INVALID (invalidated by coherence)
    PresentMiss,
    TotalMiss,
}

#[derive(Clone, Copy, Debug)]
pub struct Lookup {
    pub presence: Presence,
    pub tag: u64,
    pub set: usize,
    /// matched line on Hit/PresentMiss, first line of the set otherwise
    pub index: usize,
}

/// State shared by the L1 and L2 engines: the line array, MSHR file,
/// smart-MSHR queue, miss classifier, and statistics.
pub struct CacheBase {
    pub name: String,
    pub node: usize,
    pub config: Arc<CacheConfig>,
    pub hier: HierarchyRef,
    /// level of the first-level cache in this node (the L2's behavior on
    /// victimization depends on it)
    pub l1_flavor: CacheLevel,

    pub lines: Vec<Line>,
    num_lines: usize,
    set_size: usize,

    pub table: cohe::Table,
    pub mshrs: MshrFile,
    pub smart: SmartMshrList,
    pub ccd: CapConfDetector,
    pub stats: stats::Cache,

    /// accesses in pipes plus held smart-MSHR entries
    pub num_in_pipes: usize,
    rng: StdRng,
}

impl std::fmt::Debug for CacheBase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CacheBase")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("mshr_count", &self.mshrs.mshr_count)
            .field("num_in_pipes", &self.num_in_pipes)
            .finish()
    }
}

impl CacheBase {
    pub fn new(
        name: String,
        node: usize,
        config: Arc<CacheConfig>,
        hier: HierarchyRef,
    ) -> Self {
        let num_lines = config.num_lines();
        let set_size = config.set_size();
        let mut lines = Vec::with_capacity(num_lines);
        for _ in 0..(num_lines / set_size) {
            for way in 0..set_size {
                lines.push(Line::invalid(way as u32 + 1));
            }
        }
        let table = cohe::Table::build(
            config.cohe_kind,
            config.protocol,
            config.replacement_hints,
        );
        let mshrs = MshrFile::new(config.max_mshrs, config.max_coals);
        let stats = stats::Cache::new(name.clone(), config.max_mshrs, config.max_coals);
        Self {
            node,
            hier: hier.clone(),
            l1_flavor: hier.l1.level,
            lines,
            num_lines,
            set_size,
            table,
            mshrs,
            smart: SmartMshrList::new(),
            ccd: CapConfDetector::new(num_lines),
            stats,
            num_in_pipes: 0,
            rng: StdRng::seed_from_u64(node as u64),
            name,
            config,
        }
    }

    #[must_use]
    pub fn level(&self) -> CacheLevel {
        self.config.level
    }

    #[must_use]
    pub fn set_size(&self) -> usize {
        self.set_size
    }

    /// Tag lookup: is the line present, present-but-invalid, or absent?
    #[must_use]
    pub fn lookup(&self, address: address) -> Lookup {
        let tag = self.config.tag_of(address);
        let num_sets = self.num_lines / self.set_size;
        let set = (tag as usize) & (num_sets - 1);
        let base = set * self.set_size;
        for way in 0..self.set_size {
            let line = &self.lines[base + way];
            if line.tag == tag {
                let presence = if line.state == LineState::INVALID {
                    Presence::PresentMiss
                } else {
                    Presence::Hit
                };
                return Lookup {
                    presence,
                    tag,
                    set,
                    index: base + way,
                };
            }
        }
        Lookup {
            presence: Presence::TotalMiss,
            tag,
            set,
            index: base,
        }
    }

    /// Coherence attributes and home node for an access.
    #[must_use]
    pub fn line_attrs(&self, lookup: &Lookup, address: address) -> (CoheKind, bool, usize) {
        if lookup.presence == Presence::TotalMiss {
            (
                self.config.cohe_kind,
                false,
                self.hier.home_node(address),
            )
        } else {
            let line = &self.lines[lookup.index];
            (self.config.cohe_kind, false, line.dest_node)
        }
    }

    pub(crate) fn classify(&mut self, pool: &ReqPool, id: ReqId, class: MissClass) {
        let req = pool.get(id);
        self.stats
            .inc(req.prcr_req_type.stat_kind(), class, req.prefetch);
    }

    /// Update LRU ages for a hit on `index`; also resolves prefetch-useful
    /// accounting the first time a prefetched line is demand-touched.
    pub fn hit_update(&mut self, index: usize, set: usize, is_prefetch: bool, now: u64) {
        if self.config.replacement != crate::config::Replacement::LRU
            || self.config.is_infinite()
        {
            return;
        }
        let base = set * self.set_size;
        let hit_age = self.lines[index].age;
        for way in 0..self.set_size {
            let idx = base + way;
            if self.lines[idx].age < hit_age {
                self.lines[idx].age += 1;
            } else if idx == index {
                let line = &mut self.lines[idx];
                if line.pref && !is_prefetch {
                    // demand-fetched at last: blame for any replacement now
                    // rests on the demand access
                    line.pref = false;
                    line.pref_tag_repl = None;
                    self.stats.pref_useful += 1;
                    let early = (now - line.pref_time) as f64;
                    self.stats.pref_earlyness.update(early, 1.0);
                }
                self.lines[idx].age = 1;
            }
        }
    }

    /// Age update for a present miss (tag matched but INVALID).
    pub fn premiss_ageupdate(
        &mut self,
        index: usize,
        is_prefetch: bool,
        only_prefs: bool,
        now: u64,
    ) {
        if self.config.replacement != crate::config::Replacement::LRU
            || self.config.is_infinite()
        {
            return;
        }
        let set = index / self.set_size;
        let base = set * self.set_size;
        let inv_age = self.lines[index].age;
        for way in 0..self.set_size {
            let idx = base + way;
            if self.lines[idx].age < inv_age {
                self.lines[idx].age += 1;
            } else if idx == index {
                let line = &mut self.lines[idx];
                if is_prefetch && only_prefs {
                    line.pref = true;
                    line.pref_time = now;
                } else {
                    line.pref = false;
                }
                // nothing was replaced
                line.pref_tag_repl = None;
                line.age = 1;
            }
        }
    }

    /// Pick a victim in the set covering `lookup` and update ages.
    ///
    /// Preference order: INVALID, then SH_CL, then PR_CL (which may be dirty
    /// in caches above), then dirty; oldest within the chosen class. Lines
    /// with an outstanding upgrade are never picked unless the cache is
    /// write-through L1. Returns `None` when every line is upgrade-locked.
    pub fn victim_select(
        &mut self,
        req_tag: u64,
        set: usize,
        is_prefetch: bool,
        only_prefs: bool,
        now: u64,
    ) -> Option<usize> {
        if self.config.is_infinite() {
            return Some(self.infinite_slot(set));
        }

        let base = set * self.set_size;
        let skip_lock = self.config.level == CacheLevel::FIRSTLEVEL_WT;

        let mut best: [Option<(usize, u32)>; 4] = [None; 4];
        for way in 0..self.set_size {
            let idx = base + way;
            let line = &mut self.lines[idx];
            if line.mshr_out && !skip_lock {
                continue;
            }
            let bucket = match line.state {
                LineState::INVALID => 0,
                LineState::SH_CL => 1,
                LineState::PR_CL => 2,
                LineState::PR_DY | LineState::SH_DY => 3,
            };
            if bucket != 0 && line.pref_tag_repl == Some(req_tag) {
                // the line this prefetch displaced is wanted again
                line.pref_tag_repl = None;
                self.stats.pref_damaging += 1;
            }
            let line_age = self.lines[idx].age;
            let older = match best[bucket] {
                Some((_, age)) => line_age > age,
                None => true,
            };
            if older {
                best[bucket] = Some((idx, line_age));
            }
        }

        let (victim, victim_age) = match self.config.replacement {
            crate::config::Replacement::RANDOM => {
                let candidates: Vec<usize> = (0..self.set_size)
                    .map(|w| base + w)
                    .filter(|&idx| !self.lines[idx].mshr_out || skip_lock)
                    .collect();
                if candidates.is_empty() {
                    return None;
                }
                let pick = candidates[self.rng.gen_range(0..candidates.len())];
                (pick, self.lines[pick].age)
            }
            _ => best.iter().flatten().next().copied()?,
        };

        // found one; update the ages around it
        for way in 0..self.set_size {
            let idx = base + way;
            if self.lines[idx].age < victim_age {
                self.lines[idx].age += 1;
            } else if idx == victim {
                let line = &mut self.lines[idx];
                if line.pref {
                    // victimized before any demand access could use it
                    self.stats.pref_useless += 1;
                }
                if is_prefetch && only_prefs {
                    line.pref_tag_repl = if line.state != LineState::INVALID {
                        Some(line.tag)
                    } else {
                        None
                    };
                    line.pref = true;
                    line.pref_time = now;
                } else {
                    line.pref_tag_repl = None;
                    line.pref = false;
                }
                line.age = 1;
            }
        }
        Some(victim)
    }

    /// Infinite caches never replace: take an INVALID slot or grow.
    fn infinite_slot(&mut self, _set: usize) -> usize {
        if let Some(idx) = self
            .lines
            .iter()
            .position(|line| line.state == LineState::INVALID)
        {
            return idx;
        }
        let old = self.num_lines;
        self.num_lines += INFINITE_CHUNK;
        self.set_size = self.num_lines;
        self.lines
            .extend((0..INFINITE_CHUNK).map(|_| Line::invalid(1)));
        old
    }

    /// Build a replacement/victimization request (`GetReplReq`).
    ///
    /// Above-route replacements are COHEs; below-route ones (write-backs and
    /// replacement hints) travel as COHE_REPLYs.
    #[allow(clippy::too_many_arguments)]
    pub fn make_repl_req(
        &self,
        pool: &mut ReqPool,
        orig: ReqId,
        tag: u64,
        req_type: ReqType,
        req_sz: Option<u32>,
        rep_sz: Option<u32>,
        cohe_kind: CoheKind,
        allo_type: bool,
        src_node: usize,
        dest_node: usize,
        route: Route,
    ) -> ReqId {
        let inst_tag = pool.get(orig).inst_tag;
        let mut req = Req::request(
            tag << self.config.block_bits(),
            req_type,
            src_node,
            inst_tag,
        );
        req.tag = tag;
        req.prcr_req_type = req_type;
        if let Some(sz) = req_sz {
            req.size_st = sz;
        }
        if let Some(sz) = rep_sz {
            req.size_req = sz;
        }
        req.dir = Dir::REQ_FWD;
        match route {
            Route::ABV => {
                req.kind = Kind::COHE;
            }
            Route::BLW => {
                req.kind = Kind::COHE_REPLY;
                req.reply = Some(Reply::REPLY);
            }
        }
        req.route = route;
        req.src_node = src_node;
        req.dest_node = dest_node;
        req.cohe_type = cohe_kind;
        req.allo_type = allo_type;
        req.line_size = self.config.line_size;
        req.nack_st = NackStatus::NACK_OK;
        pool.alloc(req)
    }

    /// Classify a line fill through the capacity/conflict detector and
    /// record the resulting miss type on the request.
    pub fn classify_fill(&mut self, pool: &mut ReqPool, id: ReqId) {
        let tag = pool.get(id).tag;
        let kind = self.ccd.observe(tag);
        let class = if pool.get(id).line_cold {
            MissClass::COLD
        } else {
            match kind {
                MissKind::Capacity => MissClass::CAP,
                MissKind::Conflict => MissClass::CONF,
            }
        };
        // a cache-to-cache transfer arrives already stamped remote; keep it
        if pool.get(id).miss_type == MissType::UNKNOWN {
            pool.get_mut(id).miss_type = match class {
                MissClass::COLD => MissType::COLD,
                MissClass::CAP => MissType::CAP,
                _ => MissType::CONF,
            };
        }
        self.classify(pool, id, class);
    }

    /// The decision oracle for every transaction entering the cache
    /// (`notpres_mshr`): match the message against the MSHR file and, for
    /// REQUESTs, against the cache itself.
    ///
    /// `wrbbuf_block` is the L2's "another reservation would overflow the
    /// write-back buffer" signal; the L1 passes `false`.
    pub fn probe(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        wrbbuf_block: bool,
        now: u64,
    ) -> MshrResponse {
        {
            let block_bits = self.config.block_bits();
            let line_size = self.config.line_size;
            let req = pool.get_mut(id);
            req.tag = req.address >> block_bits;
            req.line_size = line_size;
        }
        let tag = pool.get(id).tag;
        let hit = self.mshrs.find(tag);

        match pool.get(id).kind {
            Kind::REQUEST => self.probe_request(pool, id, hit, wrbbuf_block, now),
            Kind::COHE | Kind::COHE_REPLY => self.probe_cohe(pool, id, hit),
            Kind::REPLY => panic!("REPLY probed against the MSHR file"),
        }
    }

    fn probe_request(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        hit: Option<usize>,
        wrbbuf_block: bool,
        now: u64,
    ) -> MshrResponse {
        let level = self.config.level;
        let lookup = self.lookup(pool.get(id).address);

        let Some(hit) = hit else {
            // the line is in no MSHR
            let cur_state = if lookup.presence == Presence::Hit {
                self.lines[lookup.index].state
            } else {
                LineState::INVALID
            };
            let (cohe_kind, allo_type, dest_node) =
                self.line_attrs(&lookup, pool.get(id).address);
            {
                let req = pool.get_mut(id);
                req.cohe_type = cohe_kind;
                req.allo_type = allo_type;
                req.dest_node = dest_node;
            }

            let req_type = pool.get(id).req_type;
            let entry = self.table.lookup(Kind::REQUEST, cur_state, req_type);

            if entry.next_mod_req.is_none() {
                // serviceable without the next level
                if self.lines[lookup.index].cohe_pend {
                    self.stats.inc_stall(StallReason::PEND_COHE);
                    return MshrResponse::NOMSHR_STALL_COHE;
                }
                if let Some(next) = entry.next_state {
                    if cur_state != next {
                        self.lines[lookup.index].state = next;
                    }
                }
                let is_pref = pool.get(id).prefetch;
                self.hit_update(lookup.index, lookup.set, is_pref, now);
                self.classify(pool, id, MissClass::HIT);
                return MshrResponse::NOMSHR;
            }

            let prcr = pool.get(id).prcr_req_type;
            let non_allocating_here = level == CacheLevel::FIRSTLEVEL_WT
                || (level == CacheLevel::FIRSTLEVEL_WB
                    && matches!(
                        prcr,
                        ReqType::L2WRITE_PREFETCH | ReqType::L2READ_PREFETCH
                    ));
            if non_allocating_here
                && matches!(
                    prcr,
                    ReqType::WRITE | ReqType::L2WRITE_PREFETCH | ReqType::L2READ_PREFETCH
                )
            {
                // goes to the next level without taking an MSHR here
                if lookup.presence == Presence::Hit {
                    let is_pref = pool.get(id).prefetch;
                    self.hit_update(lookup.index, lookup.set, is_pref, now);
                }
                self.apply_entry_sizes(pool, id, &entry);
                pool.get_mut(id).req_type =
                    entry.next_mod_req.expect("forwarding entry has a message");
                if lookup.presence == Presence::Hit && prcr == ReqType::L2READ_PREFETCH {
                    // hit in L1 implies hit in L2; cannot be an upgrade either
                    return MshrResponse::NOMSHR;
                }
                self.classify(pool, id, MissClass::WT);
                return MshrResponse::NOMSHR_FWD;
            }

            // needs an MSHR
            if self.mshrs.full() {
                self.stats.inc_stall(StallReason::MSHR_FULL);
                return MshrResponse::NOMSHR_STALL;
            }
            if level == CacheLevel::SECONDLEVEL && wrbbuf_block {
                // the REPLY might need a write-back buffer slot for a victim
                self.stats.inc_stall(StallReason::WRBBUF_FULL);
                return MshrResponse::NOMSHR_STALL_WRBBUF_FULL;
            }

            let free = self.mshrs.first_free().expect("file not full");
            let req_type = pool.get(id).req_type;
            let writes_present = level != CacheLevel::FIRSTLEVEL_WT
                && matches!(req_type, ReqType::WRITE | ReqType::RMW);
            let is_pref = pool.get(id).prefetch;
            self.mshrs.alloc(
                free,
                lookup.tag,
                lookup.set,
                id,
                is_pref,
                writes_present,
                &mut self.stats,
                now,
            );
            log::debug!(
                "{}: booking MSHR {free} for tag {} ({:?})",
                self.name,
                pool.get(id).tag,
                lookup.presence
            );

            let response = if lookup.presence == Presence::Hit {
                // upgrade: lock the line in so it cannot be victimized
                // before the upgrade reply returns
                self.classify(pool, id, MissClass::UPGR);
                self.hit_update(lookup.index, lookup.set, is_pref, now);
                if level != CacheLevel::FIRSTLEVEL_WT {
                    self.lines[lookup.index].mshr_out = true;
                }
                MshrResponse::MSHR_FWD
            } else {
                MshrResponse::MSHR_NEW
            };
            self.apply_entry_sizes(pool, id, &entry);
            pool.get_mut(id).req_type =
                entry.next_mod_req.expect("missing entry has a message");
            pool.get_mut(id).mshr_num = Some(free);
            return response;
        };

        // matches in an MSHR: merge, drop, forward around, or stall

        let mainreq_type = pool.get(self.mshrs.get(hit).mainreq).req_type;
        if matches!(mainreq_type, ReqType::WRB | ReqType::REPL) {
            // slot temporarily held for a write-back
            self.stats.inc_stall(StallReason::WRB_MATCH);
            return MshrResponse::MSHR_STALL_WRB;
        }

        let main_prcr = pool.get(self.mshrs.get(hit).mainreq).prcr_req_type;
        if let Some(pend) = self.mshrs.get(hit).pend_cohe {
            // an external COPYBACK only blocks exclusive-mode merges; any
            // invalidate-flavored merge blocks everything
            let blocked = if pend == ReqType::COPYBACK {
                main_prcr.is_exclusive_mode()
            } else {
                true
            };
            if blocked {
                self.stats.inc_stall(StallReason::MSHR_COHE);
                return MshrResponse::MSHR_STALL_COHE;
            }
        }

        let prcr = pool.get(id).prcr_req_type;
        if level != CacheLevel::SECONDLEVEL {
            // prefetches never coalesce at the L1: one fetch is enough
            if matches!(prcr, ReqType::L1READ_PREFETCH | ReqType::L2READ_PREFETCH) {
                return MshrResponse::MSHR_USELESS_FETCH_IN_PROGRESS;
            }
            if prcr == ReqType::L1WRITE_PREFETCH {
                if level == CacheLevel::FIRSTLEVEL_WT {
                    // forward around the cache as an L2 write prefetch
                    self.classify(pool, id, MissClass::WT);
                    let req = pool.get_mut(id);
                    req.req_type = ReqType::L2WRITE_PREFETCH;
                    req.prcr_req_type = ReqType::L2WRITE_PREFETCH;
                    return MshrResponse::NOMSHR_FWD;
                }
                if main_prcr.is_exclusive_mode() {
                    return MshrResponse::MSHR_USELESS_FETCH_IN_PROGRESS;
                }
            }
            if prcr == ReqType::L2WRITE_PREFETCH {
                // has no business with this cache
                return MshrResponse::NOMSHR_FWD;
            }
        }

        if level == CacheLevel::FIRSTLEVEL_WT
            && lookup.presence == Presence::Hit
            && prcr.is_read_mode()
        {
            // a read hit in L1WT needs no WAR consideration: earlier writes
            // already put their data in the cache
            return MshrResponse::NOMSHR;
        }

        if self.mshrs.get(hit).stall_war {
            // even a read must stall behind an established WAR, or it would
            // be performed out of order with the stalled write
            self.stats.inc_stall(StallReason::MSHR_WAR);
            return MshrResponse::MSHR_STALL_WAR;
        }

        let war = prcr.is_exclusive_mode()
            && (level == CacheLevel::FIRSTLEVEL_WT || main_prcr.is_read_mode());
        if war {
            let is_pref = pool.get(id).prefetch;
            let will_drop = is_pref
                && self.config.discriminate_prefetch
                && level != CacheLevel::SECONDLEVEL;
            if !will_drop {
                self.stats.inc_stall(StallReason::MSHR_WAR);
                self.mshrs.get_mut(hit).stall_war = true;
            }
            return MshrResponse::MSHR_STALL_WAR;
        }

        if self.mshrs.get(hit).coalesced.len() == self.mshrs.max_coals() {
            self.stats.inc_stall(StallReason::MSHR_COAL);
            return MshrResponse::MSHR_STALL_COAL;
        }

        // no obstacle: coalesce
        let req_type = pool.get(id).req_type;
        let is_write_like = level != CacheLevel::FIRSTLEVEL_WT
            && matches!(req_type, ReqType::WRITE | ReqType::RMW);
        let is_pref = pool.get(id).prefetch;
        self.mshrs
            .coalesce(hit, id, is_write_like, is_pref, &mut self.stats, now);

        // mark accesses that allocate here but coalesced below with a
        // non-allocating main request (write in a WT hierarchy, L2 prefetch)
        let main_nonalloc = (self.l1_flavor == CacheLevel::FIRSTLEVEL_WT
            && main_prcr == ReqType::WRITE)
            || matches!(
                main_prcr,
                ReqType::L2WRITE_PREFETCH | ReqType::L2READ_PREFETCH
            );
        let this_allocates = matches!(
            prcr,
            ReqType::L1WRITE_PREFETCH | ReqType::READ | ReqType::L1READ_PREFETCH | ReqType::RMW
        ) || (self.l1_flavor == CacheLevel::FIRSTLEVEL_WB && prcr == ReqType::WRITE);
        if main_nonalloc && this_allocates {
            let main = self.mshrs.get(hit).mainreq;
            pool.get_mut(main).read_with_write = true;
        }

        self.classify(pool, id, MissClass::COAL);
        MshrResponse::MSHR_COAL
    }

    fn probe_cohe(
        &mut self,
        pool: &mut ReqPool,
        id: ReqId,
        hit: Option<usize>,
    ) -> MshrResponse {
        let Some(hit) = hit else {
            return MshrResponse::NOMSHR; // rely on cache state alone
        };

        let req = pool.get(id);
        let (kind, req_type, nack_st, reply) = (req.kind, req.req_type, req.nack_st, req.reply);
        let level = self.config.level;

        if kind == Kind::COHE_REPLY && matches!(req_type, ReqType::WRB | ReqType::REPL) {
            if level == CacheLevel::SECONDLEVEL
                && req_type == ReqType::WRB
                && reply != Some(Reply::REPLY)
            {
                // an unsolicited WRB already short-circuited the demand WRB;
                // this is the demand WRB coming back negative: ignore it
                return MshrResponse::NOMSHR;
            }
            if level != CacheLevel::FIRSTLEVEL_WB {
                panic!("a WRB/REPL is trying to coalesce into an MSHR");
            }
        }

        let main_prcr = pool.get(self.mshrs.get(hit).mainreq).prcr_req_type;
        if main_prcr.is_read_mode() {
            // the MSHR awaits a shared-mode reply (which may still come back
            // exclusive)
            if kind == Kind::COHE_REPLY {
                if !matches!(req_type, ReqType::WRB | ReqType::REPL) {
                    if nack_st == NackStatus::NACK_NOK {
                        // copyback demanded: the reply may be on its way back
                        // private; only NACK_PEND is safe (decided by caller)
                        return MshrResponse::MSHR_COAL;
                    }
                    // pure invalidate: remember it, apply if the reply comes
                    // back shared, ignore if it comes back private
                    self.mshrs.get_mut(hit).pend_cohe = Some(req_type);
                    return MshrResponse::MSHR_COAL;
                }
                // an L2 replacement raced with a read MSHR: treat as an INVL
                // locally and NACK the WRB path too
                self.mshrs.get_mut(hit).pend_cohe = Some(ReqType::INVL);
                return MshrResponse::NOMSHR;
            }
            // a COHE: send it on to the L1; the interesting part happens on
            // the COHE_REPLY
            return MshrResponse::MSHR_COAL;
        }

        // the MSHR awaits a private (possibly dirty) reply
        if nack_st == NackStatus::NACK_NOK && kind == Kind::COHE_REPLY {
            if level != CacheLevel::FIRSTLEVEL_WT {
                // cannot tell whether this COHE predates our request or
                // targets it; NACK_PEND and let the directory reevaluate
                return MshrResponse::MSHR_COAL;
            }
            // a write-through L1 can never owe data
            self.mshrs.get_mut(hit).pend_cohe = Some(req_type);
            return MshrResponse::MSHR_COAL;
        }

        // NACK_OK (including WRBs): the COHE predates our exclusive request;
        // do the coherence action now and answer with a plain NACK. The
        // directory will convert a dangling UPGRADE to READ_OWN when it sees
        // the sender is no sharer.
        MshrResponse::MSHR_FWD
    }

    fn apply_entry_sizes(&self, pool: &mut ReqPool, id: ReqId, entry: &cohe::Entry) {
        let line = self.config.line_size;
        let req = pool.get_mut(id);
        if let Some(sz) = entry.req_sz.bytes(line) {
            req.size_st = sz;
        }
        if let Some(sz) = entry.rep_sz.bytes(line) {
            req.size_req = sz;
        }
    }

    /// Attempt to dispatch the head of the smart-MSHR queue, releasing or
    /// transforming the held resource on success. At most one entry per
    /// cycle; called with the cache's port-send function.
    pub fn process_smart_list(
        &mut self,
        pool: &mut ReqPool,
        mut wrb_buf: Option<&mut WrbBuffer>,
        send: &mut dyn FnMut(&mut ReqPool, ReqId) -> bool,
        now: u64,
    ) {
        let Some(head) = self.smart.head().copied() else {
            return;
        };
        if !send(pool, head.req) {
            return;
        }
        let _ = self.smart.pop_head();
        self.num_in_pipes -= 1;
        match head.release {
            None => {}
            Some(Release::Mshr(slot)) => {
                log::debug!("{}: smart list freeing MSHR {slot}", self.name);
                self.mshrs.remove(slot, None, &mut self.stats, now);
            }
            Some(Release::WrbSlot(tag)) => {
                wrb_buf
                    .as_mut()
                    .expect("WRB release at a cache without a WRB buffer")
                    .remove(tag);
            }
            Some(Release::WrbPromote(tag)) => {
                let buf = wrb_buf
                    .as_mut()
                    .expect("WRB release at a cache without a WRB buffer");
                let second = buf.promote(pool, tag);
                let second_tag = pool.get(second).tag;
                if send(pool, second) {
                    buf.remove(second_tag);
                } else {
                    self.smart
                        .push(second, Some(Release::WrbSlot(second_tag)));
                    self.num_in_pipes += 1;
                }
            }
        }
    }

    /// Park a message on the smart-MSHR queue.
    pub fn add_to_smart_list(&mut self, req: ReqId, release: Option<Release>) {
        self.smart.push(req, release);
        self.num_in_pipes += 1;
    }

    /// A reply cannot victimize because every line in the set is
    /// upgrade-locked: turn it back into a REQUEST and let the request's own
    /// resource carry it out (`NackUpgradeConflictReply`).
    pub fn nack_upgrade_conflict_reply(&mut self, pool: &mut ReqPool, id: ReqId) {
        self.stats.replies_nacked += 1;
        let req = pool.get_mut(id);
        req.kind = Kind::REQUEST;
        req.dir = Dir::REQ_FWD;
        req.route = Route::BLW;
        self.add_to_smart_list(id, None);
    }

    /// Record a victim of `state` for reporting.
    pub fn count_victim(&mut self, state: LineState) {
        match state {
            LineState::SH_CL => self.stats.shcl_victims += 1,
            LineState::PR_CL => self.stats.prcl_victims += 1,
            LineState::PR_DY => self.stats.prdy_victims += 1,
            _ => {}
        }
    }

    /// Prefetch bookkeeping when a line is invalidated by coherence.
    pub fn pref_invalidated(&mut self, index: usize) {
        let line = &mut self.lines[index];
        if line.pref {
            line.pref = false;
            line.pref_tag_repl = None;
            self.stats.pref_useless_cohe += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheBase, Presence};
    use crate::cohe::LineState;
    use crate::config::{CacheConfig, Hierarchy};
    use crate::mshr::MshrResponse;
    use crate::pool::ReqPool;
    use crate::req::{Req, ReqType};
    use std::sync::Arc;

    fn l1_base() -> CacheBase {
        let hier = Arc::new(Hierarchy::default());
        CacheBase::new("L1".to_string(), 0, Arc::new(hier.l1.clone()), hier)
    }

    fn fill(base: &mut CacheBase, addr: u64, state: LineState) -> usize {
        let lookup = base.lookup(addr);
        let idx = lookup.index;
        base.lines[idx].tag = lookup.tag;
        base.lines[idx].state = state;
        idx
    }

    #[test]
    fn lookup_distinguishes_present_miss() {
        let mut base = l1_base();
        assert_eq!(base.lookup(0x100).presence, Presence::TotalMiss);
        let idx = fill(&mut base, 0x100, LineState::SH_CL);
        assert_eq!(base.lookup(0x100).presence, Presence::Hit);
        base.lines[idx].state = LineState::INVALID;
        assert_eq!(base.lookup(0x100).presence, Presence::PresentMiss);
    }

    #[test]
    fn victim_prefers_invalid_then_clean() {
        let mut base = l1_base();
        // two-way set: fill both ways of the set of 0x100
        let a = fill(&mut base, 0x100, LineState::SH_CL);
        let set = a / base.set_size() * base.set_size();
        base.lines[set].state = LineState::SH_CL;
        base.lines[set].tag = base.lookup(0x100).tag;
        base.lines[set + 1].state = LineState::PR_DY;
        base.lines[set + 1].tag = base.lookup(0x100).tag + 0x1000;

        let victim = base
            .victim_select(0xdead, set / base.set_size(), false, false, 0)
            .expect("replaceable");
        assert_eq!(victim, set); // SH_CL over PR_DY
    }

    #[test]
    fn upgrade_locked_set_has_no_victim() {
        let mut base = l1_base();
        let lookup = base.lookup(0x100);
        let set_base = lookup.set * base.set_size();
        for way in 0..base.set_size() {
            base.lines[set_base + way].state = LineState::PR_CL;
            base.lines[set_base + way].tag = 0x5000 + way as u64;
            base.lines[set_base + way].mshr_out = true;
        }
        assert_eq!(base.victim_select(1, lookup.set, false, false, 0), None);
    }

    #[test]
    fn second_miss_with_one_mshr_stalls() {
        let hier = Arc::new(Hierarchy::default());
        let mut cfg = CacheConfig::default_l1();
        cfg.max_mshrs = 1;
        let mut base = CacheBase::new("L1".to_string(), 0, Arc::new(cfg), hier);
        let mut pool = ReqPool::new();

        let a = pool.alloc(Req::request(0x1000, ReqType::READ, 0, 0));
        assert_eq!(
            base.probe(&mut pool, a, false, 0),
            MshrResponse::MSHR_NEW
        );
        let b = pool.alloc(Req::request(0x2000, ReqType::READ, 0, 1));
        assert_eq!(
            base.probe(&mut pool, b, false, 0),
            MshrResponse::NOMSHR_STALL
        );
    }

    #[test]
    fn read_hit_is_nomshr() {
        let mut base = l1_base();
        fill(&mut base, 0x340, LineState::SH_CL);
        let mut pool = ReqPool::new();
        let req = pool.alloc(Req::request(0x340, ReqType::READ, 0, 0));
        assert_eq!(base.probe(&mut pool, req, false, 0), MshrResponse::NOMSHR);
        assert_eq!(base.stats.num_ref, 1);
        assert_eq!(base.stats.num_miss, 0);
    }

    #[test]
    fn write_to_shared_is_an_upgrade_and_locks_the_line() {
        let mut base = l1_base();
        let idx = fill(&mut base, 0x340, LineState::SH_CL);
        let mut pool = ReqPool::new();
        let req = pool.alloc(Req::request(0x340, ReqType::WRITE, 0, 0));
        assert_eq!(
            base.probe(&mut pool, req, false, 0),
            MshrResponse::MSHR_FWD
        );
        assert!(base.lines[idx].mshr_out);
        // the request was rewritten toward the next module
        assert_eq!(pool.get(req).req_type, ReqType::WRITE);
    }

    #[test]
    fn war_coalesce_stalls_and_sticks() {
        let mut base = l1_base();
        let mut pool = ReqPool::new();
        let read = pool.alloc(Req::request(0x1000, ReqType::READ, 0, 0));
        assert_eq!(base.probe(&mut pool, read, false, 0), MshrResponse::MSHR_NEW);

        let write = pool.alloc(Req::request(0x1008, ReqType::WRITE, 0, 1));
        assert_eq!(
            base.probe(&mut pool, write, false, 0),
            MshrResponse::MSHR_STALL_WAR
        );
        // and now even reads must stall behind the WAR
        let read2 = pool.alloc(Req::request(0x1010, ReqType::READ, 0, 2));
        assert_eq!(
            base.probe(&mut pool, read2, false, 0),
            MshrResponse::MSHR_STALL_WAR
        );
    }

    #[test]
    fn discriminated_write_prefetch_war_drops_instead_of_sticking() {
        let hier = Arc::new(Hierarchy::default());
        let mut cfg = CacheConfig::default_l1();
        cfg.discriminate_prefetch = true;
        let mut base = CacheBase::new("L1".to_string(), 0, Arc::new(cfg), hier);
        let mut pool = ReqPool::new();

        let read = pool.alloc(Req::request(0x1000, ReqType::READ, 0, 0));
        assert_eq!(base.probe(&mut pool, read, false, 0), MshrResponse::MSHR_NEW);
        let pref = pool.alloc(Req::request(0x1008, ReqType::L1WRITE_PREFETCH, 0, 1));
        assert_eq!(
            base.probe(&mut pool, pref, false, 0),
            MshrResponse::MSHR_STALL_WAR
        );
        // the WAR did not stick: the engine will drop the prefetch and the
        // next read still coalesces
        assert!(!base.mshrs.get(0).stall_war);
        let read2 = pool.alloc(Req::request(0x1010, ReqType::READ, 0, 2));
        assert_eq!(
            base.probe(&mut pool, read2, false, 0),
            MshrResponse::MSHR_COAL
        );
    }

    #[test]
    fn read_prefetch_to_fetched_line_is_useless() {
        let mut base = l1_base();
        let mut pool = ReqPool::new();
        let read = pool.alloc(Req::request(0x1000, ReqType::READ, 0, 0));
        assert_eq!(base.probe(&mut pool, read, false, 0), MshrResponse::MSHR_NEW);
        let pref = pool.alloc(Req::request(0x1000, ReqType::L1READ_PREFETCH, 0, 1));
        assert_eq!(
            base.probe(&mut pool, pref, false, 0),
            MshrResponse::MSHR_USELESS_FETCH_IN_PROGRESS
        );
    }
}
