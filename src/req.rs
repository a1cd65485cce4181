use crate::address;
use serde::{Deserialize, Serialize};

/// Request header size in bytes: 8 for address, 2 for from, 2 for command,
/// 2 for to, 2 reserved.
pub const REQ_SZ: u32 = 16;

/// Transaction type carried in a [`Req`].
///
/// The order is observed by the statistics tables: processor-side types
/// first, then system-visible requests, replies, coherence messages, and
/// finally the victimization messages.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum ReqType {
    // processor-side request types
    READ,
    WRITE,
    RMW,
    L1WRITE_PREFETCH,
    L1READ_PREFETCH,
    L2WRITE_PREFETCH,
    L2READ_PREFETCH,
    TTS,
    SPIN,
    WRITEFLAG,

    // system-visible transaction requests
    READ_SH,
    READ_OWN,
    UPGRADE,
    READ_DISC,
    WRITE_INV,
    RWRITE,

    // reply types for lines
    REPLY_SH,
    REPLY_EXCL,
    REPLY_UPGRADE,
    REPLY_EXCLDY,
    REPLY_SHDY,
    REPLY_DISC,
    REPLY_WRITEINV,

    // COHE / COHE_REPLY types
    COPYBACK,
    COPYBACK_INVL,
    INVL,
    COPYBACK_SHDY,
    COPYBACK_DISC,
    PUSH,

    // victimization messages
    WRB,
    REPL,
}

impl ReqType {
    /// Processor request types that demand exclusive ownership.
    #[must_use]
    pub fn is_exclusive_mode(self) -> bool {
        matches!(
            self,
            Self::WRITE | Self::RMW | Self::L1WRITE_PREFETCH | Self::L2WRITE_PREFETCH
        )
    }

    /// Processor read-shared request types.
    #[must_use]
    pub fn is_read_mode(self) -> bool {
        matches!(
            self,
            Self::READ | Self::L1READ_PREFETCH | Self::L2READ_PREFETCH
        )
    }

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

    #[must_use]
    pub fn is_line_reply(self) -> bool {
        matches!(
            self,
            Self::REPLY_SH | Self::REPLY_EXCL | Self::REPLY_UPGRADE | Self::REPLY_EXCLDY
        )
    }

    #[must_use]
    pub fn stat_kind(self) -> stats::AccessKind {
        match self {
            Self::READ => stats::AccessKind::READ,
            Self::WRITE => stats::AccessKind::WRITE,
            Self::RMW => stats::AccessKind::RMW,
            Self::L1WRITE_PREFETCH => stats::AccessKind::L1WRITE_PREFETCH,
            Self::L1READ_PREFETCH => stats::AccessKind::L1READ_PREFETCH,
            Self::L2WRITE_PREFETCH => stats::AccessKind::L2WRITE_PREFETCH,
            Self::L2READ_PREFETCH => stats::AccessKind::L2READ_PREFETCH,
            other => panic!("no statistics table for request type {other:?}"),
        }
    }
}

/// Message class of a [`Req`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Kind {
    REQUEST,
    REPLY,
    COHE,
    COHE_REPLY,
}

/// Reply sub-status.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Reply {
    /// positive acknowledgment
    REPLY,
    /// request-a-retry: receiver should resend the original REQUEST
    RAR,
    /// negative acknowledgment
    NACK,
    /// cannot process; sender must reevaluate and possibly resend
    NACK_PEND,
}

/// NACK convention carried on COHE messages from the directory.
///
/// `OK`: the sender does not expect data (pure invalidation).
/// `NOK`: the sender demands a data copyback.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum NackStatus {
    NACK_OK,
    NACK_NOK,
}

/// Direction of travel: a request moving forward heads to `dest_node`, a
/// message routed backward heads to `src_node`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Dir {
    REQ_FWD,
    REQ_BWD,
}

/// Route within the node: toward higher (ABV) or lower (BLW) levels.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Route {
    ABV,
    BLW,
}

/// Final classification of an access, stamped onto the request (and all of
/// its coalesced requests) when the cache resolves it.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum MissType {
    UNKNOWN,
    L1HIT,
    L2HIT,
    COLD,
    CONF,
    CAP,
    COHE,
    UPGR,
    WT,
    COAL,
    /// satisfied remotely (cache-to-cache transfer)
    REM,
}

impl MissType {
    #[must_use]
    pub fn stat_class(self) -> stats::MissClass {
        match self {
            Self::L1HIT | Self::L2HIT => stats::MissClass::HIT,
            Self::COLD => stats::MissClass::COLD,
            Self::CONF | Self::REM => stats::MissClass::CONF,
            Self::CAP => stats::MissClass::CAP,
            Self::COHE => stats::MissClass::COHE,
            Self::UPGR => stats::MissClass::UPGR,
            Self::WT => stats::MissClass::WT,
            Self::COAL => stats::MissClass::COAL,
            Self::UNKNOWN => panic!("classifying an unresolved access"),
        }
    }
}

/// How this request was ultimately handled, for reporting.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Handled {
    UNKNOWN,
    L1HIT,
    L1COAL,
    WBUF_COAL,
    L2HIT,
    L2COAL,
    DIRECTORY,
    CACHE_TO_CACHE,
}

/// Pool index of a [`Req`]. Structures that hold requests (pipelines, MSHRs,
/// ports, the write-back buffer) own indices, never references, so that a
/// request can be substituted or re-parented without aliasing.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReqId(pub u32);

impl std::fmt::Display for ReqId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// The fundamental message flowing between processor, caches, and directory.
#[derive(Clone, Debug)]
pub struct Req {
    pub address: address,
    /// cache line number (`address >> block_bits`), set by the receiving cache
    pub tag: u64,
    pub line_size: u32,

    /// current transaction type (rewritten as the request moves down)
    pub req_type: ReqType,
    /// transaction type as issued by the processor
    pub prcr_req_type: ReqType,

    pub kind: Kind,
    pub reply: Option<Reply>,
    pub dir: Dir,
    pub route: Route,
    pub nack_st: NackStatus,

    /// size of the message being sent, in bytes
    pub size_st: u32,
    /// size of the expected response, in bytes
    pub size_req: u32,

    pub src_node: usize,
    pub dest_node: usize,
    /// cache-to-cache transfer target, set by the directory on COHEs
    pub forward_to: Option<usize>,

    pub cohe_type: crate::config::CoheKind,
    pub allo_type: bool,

    /// identifier attaching this access to the processor front-end
    pub inst_tag: u64,

    pub prefetch: bool,
    /// reply has already been processed and is only being bounced back
    pub preprocessed: bool,
    /// travelled from L1 to L2 as a nacked reply
    pub l1nack: bool,
    /// L2 victimization of a PR_CL line: skip the L2 data array access
    pub prclwrb: bool,
    /// COHE_REPLY that terminates at the L2 without further processing
    pub absorb_at_l2: bool,
    /// non-allocating access (WT write, L2 prefetch) that coalesced with an
    /// allocating one at a lower level
    pub read_with_write: bool,

    /// set when the directory reveals the line was never cached by this node
    pub line_cold: bool,
    pub miss_type: MissType,
    pub prefetched_late: bool,
    pub handled: Handled,

    /// cycle the request left the L2 toward the network
    pub net_start_time: u64,

    /// stage of progress while being processed in one of the RAM arrays
    pub progress: u8,
    /// MSHR slot used by this request
    pub mshr_num: Option<usize>,

    /// companion invalidation spawned by a reply-side victimization
    pub invl_req: Option<ReqId>,
    /// companion write-back spawned by a reply-side victimization
    pub wrb_req: Option<ReqId>,
    /// accesses coalesced onto this request at a lower level or write buffer
    pub coalesced: Vec<ReqId>,
}

impl Req {
    /// A fresh processor-side request.
    #[must_use]
    pub fn request(
        address: address,
        req_type: ReqType,
        src_node: usize,
        inst_tag: u64,
    ) -> Self {
        Self {
            address,
            tag: 0,
            line_size: 0,
            req_type,
            prcr_req_type: req_type,
            kind: Kind::REQUEST,
            reply: None,
            dir: Dir::REQ_FWD,
            route: Route::BLW,
            nack_st: NackStatus::NACK_OK,
            size_st: REQ_SZ,
            size_req: REQ_SZ,
            src_node,
            dest_node: src_node,
            forward_to: None,
            cohe_type: crate::config::CoheKind::WB_NREF,
            allo_type: false,
            inst_tag,
            prefetch: req_type.is_prefetch(),
            preprocessed: false,
            l1nack: false,
            prclwrb: false,
            absorb_at_l2: false,
            read_with_write: false,
            line_cold: false,
            miss_type: MissType::UNKNOWN,
            prefetched_late: false,
            handled: Handled::UNKNOWN,
            net_start_time: 0,
            progress: 0,
            mshr_num: None,
            invl_req: None,
            wrb_req: None,
            coalesced: Vec::new(),
        }
    }

    /// Whichever node this message is currently travelling toward.
    #[must_use]
    pub fn target_node(&self) -> usize {
        match self.dir {
            Dir::REQ_FWD => self.dest_node,
            Dir::REQ_BWD => self.src_node,
        }
    }

    /// Does the message carry line data in addition to the header?
    #[must_use]
    pub fn carries_data(&self) -> bool {
        self.size_st > REQ_SZ
    }
}

impl std::fmt::Display for Req {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?}[{:?}] addr={:#x} tag={} {}B {}->{}",
            self.req_type,
            self.kind,
            self.address,
            self.tag,
            self.size_st,
            self.src_node,
            self.dest_node
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Dir, Req, ReqType, REQ_SZ};

    #[test]
    fn request_type_order_matches_statistics_indexing() {
        assert!(ReqType::READ < ReqType::WRITE);
        assert!(ReqType::WRITEFLAG < ReqType::READ_SH);
        assert!(ReqType::RWRITE < ReqType::REPLY_SH);
        assert!(ReqType::REPLY_WRITEINV < ReqType::COPYBACK);
        assert!(ReqType::PUSH < ReqType::WRB);
        assert!(ReqType::WRB < ReqType::REPL);
    }

    #[test]
    fn target_follows_direction() {
        let mut req = Req::request(0x100, ReqType::READ, 3, 0);
        req.dest_node = 7;
        assert_eq!(req.target_node(), 7);
        req.dir = Dir::REQ_BWD;
        assert_eq!(req.target_node(), 3);
    }

    #[test]
    fn header_only_by_default() {
        let req = Req::request(0x40, ReqType::WRITE, 0, 1);
        assert_eq!(req.size_st, REQ_SZ);
        assert!(!req.carries_data());
    }
}
