use crate::statrec::StatRec;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Processor-side request kind, as seen by the statistics tables.
#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
#[allow(non_camel_case_types)]
pub enum AccessKind {
    READ,
    WRITE,
    RMW,
    L1WRITE_PREFETCH,
    L1READ_PREFETCH,
    L2WRITE_PREFETCH,
    L2READ_PREFETCH,
}

impl AccessKind {
    #[must_use]
    pub fn is_prefetch(self) -> bool {
        matches!(
            self,
            Self::L1WRITE_PREFETCH
                | Self::L1READ_PREFETCH
                | Self::L2WRITE_PREFETCH
                | Self::L2READ_PREFETCH
        )
    }
}

/// How an access was classified once the cache resolved it.
#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
#[allow(non_camel_case_types)]
pub enum MissClass {
    HIT,
    COLD,
    CONF,
    CAP,
    COHE,
    UPGR,
    WT,
    COAL,
}

/// Back-pressure reasons counted per cache.
#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
#[allow(non_camel_case_types)]
pub enum StallReason {
    MSHR_WAR,
    MSHR_FULL,
    MSHR_COHE,
    MSHR_COAL,
    WRB_MATCH,
    WRBBUF_FULL,
    PEND_COHE,
    COHE_PEND_COHE,
}

/// Per-cache statistics.
///
/// The counter layout follows the simulator's report format: reference and
/// miss tables split by demand/prefetch and miss class, stall counters,
/// coherence message accounting, write-back and victimization counts, and
/// prefetch effectiveness counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cache {
    pub name: String,

    pub num_ref: u64,
    pub num_miss: u64,

    #[cfg(feature = "detailed-stats")]
    pub demand: IndexMap<(AccessKind, MissClass), u64>,
    #[cfg(feature = "detailed-stats")]
    pub pref: IndexMap<(AccessKind, MissClass), u64>,

    pub stalls: IndexMap<StallReason, u64>,

    pub dropped_pref: u64,

    // coherence message accounting
    pub cohe: u64,
    pub cohe_nack: u64,
    pub cohe_reply: u64,
    pub cohe_reply_merge: u64,
    pub cohe_reply_merge_ignore: u64,
    pub cohe_reply_nack: u64,
    pub cohe_reply_nack_docohe: u64,
    pub cohe_reply_nack_mergefail: u64,
    pub cohe_reply_nack_pend: u64,
    pub cohe_reply_prop_nack_pend: u64,
    pub cohe_reply_unsolicited_wrb: u64,

    // write-back / inclusion accounting
    pub wb_inclusions_sent: u64,
    pub wb_prcl_inclusions_sent: u64,
    pub wb_inclusions_race: u64,
    pub wb_inclusions_real: u64,
    pub wb_repeats: u64,

    pub shcl_victims: u64,
    pub prcl_victims: u64,
    pub prdy_victims: u64,

    pub cohe_cache_to_cache_good: u64,
    pub cohe_cache_to_cache_fail: u64,

    pub replies_nacked: u64,
    pub rars_handled: u64,

    // prefetch effectiveness
    pub pref_total: u64,
    pub pref_useless: u64,
    pub pref_useless_cohe: u64,
    pub pref_downgraded: u64,
    pub pref_useful: u64,
    pub pref_useful_upgrade: u64,
    pub pref_unnecessary: u64,
    pub pref_late: u64,
    pub pref_damaging: u64,

    // write-buffer accounting (write-through L1 only)
    pub wbuf_stall_full: u64,
    pub wbuf_stall_coal_max: u64,
    pub wbuf_stall_read_match: u64,
    pub wbuf_coals: u64,

    // sampled records
    pub net_demand_miss: Vec<StatRec>,
    pub net_pref_miss: Vec<StatRec>,
    pub mshr_occ: StatRec,
    pub mshr_req_count: StatRec,
    pub pref_lateness: StatRec,
    pub pref_earlyness: StatRec,
}

impl Cache {
    #[must_use]
    pub fn new(name: String, max_mshrs: usize, max_coals: usize) -> Self {
        Self {
            name,
            num_ref: 0,
            num_miss: 0,
            #[cfg(feature = "detailed-stats")]
            demand: IndexMap::new(),
            #[cfg(feature = "detailed-stats")]
            pref: IndexMap::new(),
            stalls: IndexMap::new(),
            dropped_pref: 0,
            cohe: 0,
            cohe_nack: 0,
            cohe_reply: 0,
            cohe_reply_merge: 0,
            cohe_reply_merge_ignore: 0,
            cohe_reply_nack: 0,
            cohe_reply_nack_docohe: 0,
            cohe_reply_nack_mergefail: 0,
            cohe_reply_nack_pend: 0,
            cohe_reply_prop_nack_pend: 0,
            cohe_reply_unsolicited_wrb: 0,
            wb_inclusions_sent: 0,
            wb_prcl_inclusions_sent: 0,
            wb_inclusions_race: 0,
            wb_inclusions_real: 0,
            wb_repeats: 0,
            shcl_victims: 0,
            prcl_victims: 0,
            prdy_victims: 0,
            cohe_cache_to_cache_good: 0,
            cohe_cache_to_cache_fail: 0,
            replies_nacked: 0,
            rars_handled: 0,
            pref_total: 0,
            pref_useless: 0,
            pref_useless_cohe: 0,
            pref_downgraded: 0,
            pref_useful: 0,
            pref_useful_upgrade: 0,
            pref_unnecessary: 0,
            pref_late: 0,
            pref_damaging: 0,
            wbuf_stall_full: 0,
            wbuf_stall_coal_max: 0,
            wbuf_stall_read_match: 0,
            wbuf_coals: 0,
            net_demand_miss: vec![
                StatRec::point("net demand READ", 0, 0.0, 1.0),
                StatRec::point("net demand WRITE", 0, 0.0, 1.0),
                StatRec::point("net demand RMW", 0, 0.0, 1.0),
            ],
            net_pref_miss: vec![
                StatRec::point("net pref L1W", 0, 0.0, 1.0),
                StatRec::point("net pref L1R", 0, 0.0, 1.0),
                StatRec::point("net pref L2W", 0, 0.0, 1.0),
                StatRec::point("net pref L2R", 0, 0.0, 1.0),
            ],
            mshr_occ: StatRec::interval("MSHR occupancy", max_mshrs, 0.0, max_mshrs as f64),
            mshr_req_count: StatRec::interval(
                "MSHR request occupancy",
                10,
                0.0,
                (max_mshrs * max_coals) as f64,
            ),
            pref_lateness: StatRec::point("prefetch lateness", 20, 0.0, 200.0),
            pref_earlyness: StatRec::point("prefetch earlyness", 20, 0.0, 200.0),
        }
    }

    /// Record one classified access.
    ///
    /// Demand accesses and prefetches are tracked in separate tables; COAL
    /// and HIT outcomes do not count as misses.
    pub fn inc(&mut self, kind: AccessKind, class: MissClass, is_prefetch: bool) {
        #[cfg(feature = "detailed-stats")]
        {
            let table = if is_prefetch {
                &mut self.pref
            } else {
                &mut self.demand
            };
            *table.entry((kind, class)).or_insert(0) += 1;
        }
        #[cfg(not(feature = "detailed-stats"))]
        let _ = (kind, is_prefetch);

        self.num_ref += 1;
        if class != MissClass::HIT && class != MissClass::COAL {
            self.num_miss += 1;
        }
    }

    pub fn inc_stall(&mut self, reason: StallReason) {
        *self.stalls.entry(reason).or_insert(0) += 1;
    }

    #[must_use]
    pub fn stall_count(&self, reason: StallReason) -> u64 {
        self.stalls.get(&reason).copied().unwrap_or(0)
    }

    /// Free-form text report, one cache per block.
    #[must_use]
    pub fn report(&self) -> String {
        use itertools::Itertools;
        use std::fmt::Write;

        let mut out = String::new();
        writeln!(out, "##### {} #####", self.name).unwrap();
        writeln!(
            out,
            "Num_hit: {}  Num_miss: {}",
            self.num_ref - self.num_miss,
            self.num_miss
        )
        .unwrap();

        #[cfg(feature = "detailed-stats")]
        for (label, table) in [("DEMAND", &self.demand), ("PREF", &self.pref)] {
            for ((kind, class), count) in table.iter().sorted() {
                if *count > 0 {
                    writeln!(out, "{label} {kind}\t{class}: {count}").unwrap();
                }
            }
        }

        for (reason, count) in self.stalls.iter().sorted() {
            writeln!(out, "STALL {reason}: {count}").unwrap();
        }
        writeln!(
            out,
            "Cohes: {}  nacked: {}  replies: {}  merged: {}  merged-ignored: {}",
            self.cohe,
            self.cohe_nack,
            self.cohe_reply,
            self.cohe_reply_merge,
            self.cohe_reply_merge_ignore
        )
        .unwrap();
        writeln!(
            out,
            "Cohe-replys nacked: {} (docohe {} mergefail {})  nack-pended: {}  propagated: {}  unsolicited WRBs: {}",
            self.cohe_reply_nack,
            self.cohe_reply_nack_docohe,
            self.cohe_reply_nack_mergefail,
            self.cohe_reply_nack_pend,
            self.cohe_reply_prop_nack_pend,
            self.cohe_reply_unsolicited_wrb
        )
        .unwrap();
        writeln!(
            out,
            "Cache-to-cache: {} good, {} failed",
            self.cohe_cache_to_cache_good, self.cohe_cache_to_cache_fail
        )
        .unwrap();
        writeln!(
            out,
            "Replies nacked: {}  RARs handled: {}",
            self.replies_nacked, self.rars_handled
        )
        .unwrap();
        writeln!(
            out,
            "WRB inclusions sent: {} (from PR_CL: {}, real: {}, race: {}, repeats: {})",
            self.wb_inclusions_sent,
            self.wb_prcl_inclusions_sent,
            self.wb_inclusions_real,
            self.wb_inclusions_race,
            self.wb_repeats
        )
        .unwrap();
        writeln!(
            out,
            "Victims: SH_CL {}  PR_CL {}  PR_DY {}",
            self.shcl_victims, self.prcl_victims, self.prdy_victims
        )
        .unwrap();
        if self.pref_total > 0 {
            writeln!(
                out,
                "Pref total: {}  dropped: {}  unnecessary: {}  late: {}  useful: {}  upgrade: {}  useless: {}  invalidated: {}  downgraded: {}  damaging: {}",
                self.pref_total,
                self.dropped_pref,
                self.pref_unnecessary,
                self.pref_late,
                self.pref_useful,
                self.pref_useful_upgrade,
                self.pref_useless,
                self.pref_useless_cohe,
                self.pref_downgraded,
                self.pref_damaging
            )
            .unwrap();
        }
        writeln!(out, "{}", self.mshr_occ).unwrap();
        writeln!(out, "{}", self.mshr_req_count).unwrap();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessKind, Cache, MissClass, StallReason};

    #[test]
    fn hit_and_coal_do_not_count_as_misses() {
        let mut stats = Cache::new("L1".to_string(), 8, 16);
        stats.inc(AccessKind::READ, MissClass::HIT, false);
        stats.inc(AccessKind::READ, MissClass::COAL, false);
        stats.inc(AccessKind::WRITE, MissClass::CAP, false);
        assert_eq!(stats.num_ref, 3);
        assert_eq!(stats.num_miss, 1);
    }

    #[test]
    fn stall_counters_accumulate() {
        let mut stats = Cache::new("L2".to_string(), 4, 16);
        stats.inc_stall(StallReason::MSHR_FULL);
        stats.inc_stall(StallReason::MSHR_FULL);
        assert_eq!(stats.stall_count(StallReason::MSHR_FULL), 2);
        assert_eq!(stats.stall_count(StallReason::MSHR_WAR), 0);
    }
}
