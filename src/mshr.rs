use crate::pool::ReqPool;
use crate::req::{MissType, ReqId, ReqType};

/// Verdict of probing the MSHR file (and the cache) with a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum MshrResponse {
    /// match in MSHR; message can be coalesced
    MSHR_COAL,
    /// need a new MSHR for a total miss
    MSHR_NEW,
    /// need a new MSHR for an upgrade (line present, insufficient permission)
    MSHR_FWD,
    /// write/exclusive access against a read MSHR (or vice versa)
    MSHR_STALL_WAR,
    /// cannot coalesce: MSHR holds an incompatible pending coherence
    MSHR_STALL_COHE,
    /// too many accesses already coalesced
    MSHR_STALL_COAL,
    /// slot temporarily reserved for a write-back subst
    MSHR_STALL_WRB,
    /// drop this prefetch, line fetch already in progress
    MSHR_USELESS_FETCH_IN_PROGRESS,
    /// no free MSHR
    NOMSHR_STALL,
    /// hit in cache but `cohe_pend` is set; retry later (L2)
    NOMSHR_STALL_COHE,
    /// L2: no reservable write-back buffer slot for a potential victim
    NOMSHR_STALL_WRBBUF_FULL,
    /// no MSHR needed; forward as a non-allocating access
    NOMSHR_FWD,
    /// hit in cache, no further action
    NOMSHR,
}

/// One in-flight miss or upgrade.
#[derive(Debug)]
pub struct Entry {
    /// line covered by this slot (kept here so matching never needs the
    /// request body)
    pub tag: u64,
    pub set: usize,
    pub mainreq: ReqId,
    pub coalesced: Vec<ReqId>,
    /// coherence type merged while the request was outstanding
    pub pend_cohe: Option<ReqType>,
    /// a write-after-read stall is in effect
    pub stall_war: bool,
    /// cycle of the first demand access, for prefetch-lateness accounting
    pub demand: Option<u64>,
    pub only_prefs: bool,
    /// at least one write/RMW coalesced: the reply must leave the line dirty
    pub writes_present: bool,
    /// the slot currently holds a substituted write-back, not a REQUEST
    pub holds_substitute: bool,
}

/// Fixed-size table of in-flight miss/upgrade records.
///
/// The file only implements the mechanics (matching, coalescing, counters);
/// the probe decision logic lives with the cache, which also consults line
/// state and the coherence table.
#[derive(Debug)]
pub struct MshrFile {
    entries: Vec<Option<Entry>>,
    max_coals: usize,
    /// valid slots, including those temporarily holding write-backs
    pub mshr_count: usize,
    /// slots holding REQUESTs
    pub reqmshr_count: usize,
    /// REQUESTs at MSHRs, including coalesced ones
    pub reqs_at_mshr_count: usize,
}

impl MshrFile {
    #[must_use]
    pub fn new(max_mshrs: usize, max_coals: usize) -> Self {
        Self {
            entries: (0..max_mshrs).map(|_| None).collect(),
            max_coals,
            mshr_count: 0,
            reqmshr_count: 0,
            reqs_at_mshr_count: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.mshr_count == self.entries.len()
    }

    #[must_use]
    pub fn max_coals(&self) -> usize {
        self.max_coals
    }

    /// Slot covering `tag`, if any.
    #[must_use]
    pub fn find(&self, tag: u64) -> Option<usize> {
        if self.mshr_count == 0 {
            return None;
        }
        self.entries
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|e| e.tag == tag))
    }

    #[must_use]
    pub fn first_free(&self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> &Entry {
        self.entries[slot]
            .as_ref()
            .unwrap_or_else(|| panic!("MSHR {slot} expected valid"))
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Entry {
        self.entries[slot]
            .as_mut()
            .unwrap_or_else(|| panic!("MSHR {slot} expected valid"))
    }

    /// Book `slot` for a new miss or upgrade.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &mut self,
        slot: usize,
        tag: u64,
        set: usize,
        mainreq: ReqId,
        is_prefetch: bool,
        writes_present: bool,
        stats: &mut stats::Cache,
        now: u64,
    ) {
        assert!(self.entries[slot].is_none(), "allocating a valid MSHR");
        self.mshr_count += 1;
        self.reqmshr_count += 1;
        self.reqs_at_mshr_count += 1;
        stats.mshr_occ.update(self.reqmshr_count as f64, now as f64);
        stats
            .mshr_req_count
            .update(self.reqs_at_mshr_count as f64, now as f64);
        self.entries[slot] = Some(Entry {
            tag,
            set,
            mainreq,
            coalesced: Vec::new(),
            pend_cohe: None,
            stall_war: false,
            demand: None,
            only_prefs: is_prefetch,
            writes_present,
            holds_substitute: false,
        });
    }

    /// Attach a later request for the same line; the caller has already
    /// cleared every stall condition.
    pub fn coalesce(
        &mut self,
        slot: usize,
        req: ReqId,
        is_write_like: bool,
        is_prefetch: bool,
        stats: &mut stats::Cache,
        now: u64,
    ) {
        stats
            .mshr_req_count
            .update(self.reqs_at_mshr_count as f64, now as f64);
        self.reqs_at_mshr_count += 1;
        let max_coals = self.max_coals;
        let entry = self.get_mut(slot);
        debug_assert!(entry.coalesced.len() < max_coals);
        entry.coalesced.push(req);
        if is_write_like {
            entry.writes_present = true;
        }
        if entry.only_prefs && !is_prefetch {
            // prefetch just became late because a demand access coalesced
            stats.pref_late += 1;
            entry.demand = Some(now);
            entry.only_prefs = false;
        }
    }

    /// Free `slot`, or substitute `(request, tag)` (e.g. a write-back) into
    /// it without freeing. Late-prefetch lateness is sampled here.
    pub fn remove(
        &mut self,
        slot: usize,
        subst: Option<(ReqId, u64)>,
        stats: &mut stats::Cache,
        now: u64,
    ) {
        let entry = self.entries[slot]
            .as_mut()
            .unwrap_or_else(|| panic!("freeing invalid MSHR {slot}"));

        if let Some(demand) = entry.demand {
            stats.pref_lateness.update((now - demand) as f64, 1.0);
        }

        // a slot holding a substitute was only a temporary holding place;
        // its requests were accounted for when the substitution happened
        if !entry.holds_substitute {
            self.reqmshr_count -= 1;
            self.reqs_at_mshr_count -= entry.coalesced.len() + 1;
        }

        match subst {
            None => {
                self.mshr_count -= 1;
                self.entries[slot] = None;
            }
            Some((req, tag)) => {
                entry.mainreq = req;
                entry.tag = tag;
                entry.coalesced.clear();
                entry.demand = None;
                entry.holds_substitute = true;
                // slot stays valid; total count unchanged
            }
        }

        stats
            .mshr_req_count
            .update(self.reqs_at_mshr_count as f64, now as f64);
        stats.mshr_occ.update(self.reqmshr_count as f64, now as f64);
    }

    /// Stamp every request held at `slot` with `miss_type` (and the
    /// late-prefetch flag) and apply `f` to the main request and each
    /// coalesced request, in that order.
    pub fn iterate_uncoalesce(
        &self,
        slot: usize,
        pool: &mut ReqPool,
        miss_type: MissType,
        mut f: impl FnMut(&mut ReqPool, ReqId),
    ) {
        let entry = self.get(slot);
        let late = entry.demand.is_some();
        let mainreq = entry.mainreq;
        let coalesced = entry.coalesced.clone();

        pool.get_mut(mainreq).prefetched_late = late;
        f(pool, mainreq);
        for req in coalesced {
            let r = pool.get_mut(req);
            r.miss_type = miss_type;
            r.prefetched_late = late;
            f(pool, req);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MshrFile;
    use crate::pool::ReqPool;
    use crate::req::{MissType, Req, ReqType};

    fn setup() -> (MshrFile, ReqPool, stats::Cache) {
        (
            MshrFile::new(2, 4),
            ReqPool::new(),
            stats::Cache::new("t".to_string(), 2, 4),
        )
    }

    fn read(pool: &mut ReqPool, addr: u64) -> crate::req::ReqId {
        let mut req = Req::request(addr, ReqType::READ, 0, 0);
        req.tag = addr >> 6;
        pool.alloc(req)
    }

    #[test]
    fn find_matches_by_tag() {
        let (mut mshrs, mut pool, mut stats) = setup();
        let req = read(&mut pool, 0x1000);
        mshrs.alloc(0, 0x1000 >> 6, 3, req, false, false, &mut stats, 0);
        assert_eq!(mshrs.find(0x1000 >> 6), Some(0));
        assert_eq!(mshrs.find(0x2000 >> 6), None);
    }

    #[test]
    fn counters_track_coalesced_requests() {
        let (mut mshrs, mut pool, mut stats) = setup();
        let main = read(&mut pool, 0x1000);
        mshrs.alloc(0, 0x1000 >> 6, 0, main, false, false, &mut stats, 0);
        let other = read(&mut pool, 0x1008);
        mshrs.coalesce(0, other, false, false, &mut stats, 5);
        assert_eq!(mshrs.reqs_at_mshr_count, 2);
        mshrs.remove(0, None, &mut stats, 10);
        assert_eq!(mshrs.mshr_count, 0);
        assert_eq!(mshrs.reqmshr_count, 0);
        assert_eq!(mshrs.reqs_at_mshr_count, 0);
    }

    #[test]
    fn subst_keeps_the_slot_booked_and_frees_exactly_once() {
        let (mut mshrs, mut pool, mut stats) = setup();
        let main = read(&mut pool, 0x1000);
        mshrs.alloc(0, 0x1000 >> 6, 0, main, false, false, &mut stats, 0);

        let wrb = read(&mut pool, 0x2000);
        mshrs.remove(0, Some((wrb, 0x2000 >> 6)), &mut stats, 1);
        assert_eq!(mshrs.mshr_count, 1);
        assert_eq!(mshrs.reqmshr_count, 0);
        assert_eq!(mshrs.find(0x2000 >> 6), Some(0));
        assert_eq!(mshrs.find(0x1000 >> 6), None);

        mshrs.remove(0, None, &mut stats, 2);
        assert_eq!(mshrs.mshr_count, 0);
        assert_eq!(mshrs.reqmshr_count, 0);
        assert_eq!(mshrs.reqs_at_mshr_count, 0);
    }

    #[test]
    fn demand_coalesce_marks_prefetch_late() {
        let (mut mshrs, mut pool, mut stats) = setup();
        let mut pref = Req::request(0x1000, ReqType::L1READ_PREFETCH, 0, 0);
        pref.tag = 0x1000 >> 6;
        let pref = pool.alloc(pref);
        mshrs.alloc(0, 0x1000 >> 6, 0, pref, true, false, &mut stats, 0);
        assert!(mshrs.get(0).only_prefs);

        let demand = read(&mut pool, 0x1010);
        mshrs.coalesce(0, demand, false, false, &mut stats, 7);
        assert!(!mshrs.get(0).only_prefs);
        assert_eq!(mshrs.get(0).demand, Some(7));
        assert_eq!(stats.pref_late, 1);
    }

    #[test]
    fn uncoalesce_stamps_miss_type() {
        let (mut mshrs, mut pool, mut stats) = setup();
        let main = read(&mut pool, 0x1000);
        mshrs.alloc(0, 0x1000 >> 6, 0, main, false, false, &mut stats, 0);
        let other = read(&mut pool, 0x1004);
        mshrs.coalesce(0, other, false, false, &mut stats, 1);

        let mut seen = Vec::new();
        mshrs.iterate_uncoalesce(0, &mut pool, MissType::CAP, |_, id| seen.push(id));
        assert_eq!(seen, vec![main, other]);
        assert_eq!(pool.get(other).miss_type, MissType::CAP);
    }
}
