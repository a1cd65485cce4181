use crate::config::{CoheKind, Protocol, ReplacementHints};
use crate::req::{Kind, ReqType, REQ_SZ};
use serde::{Deserialize, Serialize};

/// MESI/MSI line state.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
#[repr(usize)]
pub enum LineState {
    INVALID,
    /// private clean
    PR_CL,
    /// shared clean
    SH_CL,
    /// private dirty
    PR_DY,
    /// shared dirty
    SH_DY,
}

const NUM_STATES: usize = LineState::SH_DY as usize + 1;
const NUM_REQ_TYPES: usize = ReqType::REPL as usize + 1;

impl LineState {
    #[must_use]
    pub fn is_private(self) -> bool {
        matches!(self, Self::PR_CL | Self::PR_DY)
    }

    #[must_use]
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::PR_DY | Self::SH_DY)
    }
}

/// Message size prescribed by a table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgSize {
    /// leave the request's current size untouched
    NoChange,
    /// control header only
    Hdr,
    /// header plus one cache line of data
    HdrLine,
}

impl MsgSize {
    #[must_use]
    pub fn bytes(self, line_size: u32) -> Option<u32> {
        match self {
            Self::NoChange => None,
            Self::Hdr => Some(REQ_SZ),
            Self::HdrLine => Some(REQ_SZ + line_size),
        }
    }
}

/// One cell of the state-transition table.
#[derive(Clone, Copy, Debug)]
pub struct Entry {
    /// resulting line state; `None` when the outcome is decided by the reply
    pub next_state: Option<LineState>,
    /// message to send toward the next (lower) module; `None` means hit
    pub next_mod_req: Option<ReqType>,
    pub req_sz: MsgSize,
    pub rep_sz: MsgSize,
    /// message to send toward the previous (upper) module on a replacement
    pub next_req: Option<ReqType>,
    pub next_req_sz: MsgSize,
    /// entry does NOT install a line (before allo_type override)
    pub noalloc: bool,
}

impl Entry {
    /// Does this access install a line, given the line's current state and
    /// the access's allocation attribute?
    #[must_use]
    pub fn allocate(&self, cur_state: LineState, allo_type: bool) -> bool {
        cur_state != LineState::INVALID || allo_type || !self.noalloc
    }
}

/// A complete coherence table for one cache flavor.
///
/// Pure data loaded at construction: indexed by (request type, current line
/// state), each valid cell gives the next state and the messages this
/// transaction produces. A blank cell is an invalid combination and panics,
/// naming the offending pair.
pub struct Table {
    flavor: CoheKind,
    cells: Vec<Option<Entry>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("cohe::Table")
            .field("flavor", &self.flavor)
            .field("valid", &self.cells.iter().filter(|c| c.is_some()).count())
            .finish()
    }
}

use MsgSize::{Hdr, HdrLine, NoChange};

impl Table {
    /// Build the table for a cache flavor under the given protocol options.
    ///
    /// `PR_WT`/`PR_WB` are the primary flavors (selected by `cohe_pr` in the
    /// original), `WB_NREF` is the secondary write-back flavor (`cohe_sl`).
    #[must_use]
    pub fn build(flavor: CoheKind, protocol: Protocol, hints: ReplacementHints) -> Self {
        let mut table = Self {
            flavor,
            cells: vec![None; NUM_REQ_TYPES * NUM_STATES],
        };
        match flavor {
            CoheKind::PR_WT => table.fill_primary_wt(),
            CoheKind::PR_WB => table.fill_primary_wb(),
            CoheKind::WB_NREF => table.fill_secondary_wb(protocol, hints),
            CoheKind::NC => panic!("coherence table requested for non-cacheable flavor"),
        }
        table
    }

    /// Look up the transition for `req_type` on a line in `state`.
    ///
    /// `probe` names the message class being processed, only for the panic
    /// message on an invalid combination (a model bug).
    #[must_use]
    pub fn lookup(&self, probe: Kind, state: LineState, req_type: ReqType) -> Entry {
        self.cells[req_type as usize * NUM_STATES + state as usize].unwrap_or_else(|| {
            panic!(
                "invalid combination: {req_type:?} on {state:?} line ({probe:?}, {:?} table)",
                self.flavor
            )
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn add(
        &mut self,
        req: ReqType,
        st: LineState,
        next_state: Option<LineState>,
        next_mod_req: Option<ReqType>,
        req_sz: MsgSize,
        rep_sz: MsgSize,
        next_req: Option<ReqType>,
        next_req_sz: MsgSize,
        noalloc: bool,
    ) {
        self.cells[req as usize * NUM_STATES + st as usize] = Some(Entry {
            next_state,
            next_mod_req,
            req_sz,
            rep_sz,
            next_req,
            next_req_sz,
            noalloc,
        });
    }

    /// Primary write-through, no-write-allocate. Only INVALID and PR_CL
    /// exist; the cache holds no dirty lines and never considers sharing.
    fn fill_primary_wt(&mut self) {
        use LineState::{INVALID, PR_CL};
        use ReqType::*;

        self.add(READ, INVALID, None, Some(READ), Hdr, HdrLine, None, NoChange, false);
        self.add(READ, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(WRITE, INVALID, None, Some(WRITE), Hdr, Hdr, None, NoChange, true);
        self.add(WRITE, PR_CL, Some(PR_CL), Some(WRITE), Hdr, Hdr, None, NoChange, true);

        self.add(RMW, INVALID, None, Some(RMW), Hdr, HdrLine, None, NoChange, false);
        self.add(RMW, PR_CL, Some(PR_CL), Some(RMW), Hdr, Hdr, None, NoChange, false);

        self.add(L1WRITE_PREFETCH, INVALID, None, Some(L1WRITE_PREFETCH), Hdr, HdrLine, None, NoChange, false);
        self.add(L1WRITE_PREFETCH, PR_CL, Some(PR_CL), Some(L1WRITE_PREFETCH), Hdr, Hdr, None, NoChange, false);

        self.add(L1READ_PREFETCH, INVALID, None, Some(L1READ_PREFETCH), Hdr, HdrLine, None, NoChange, false);
        self.add(L1READ_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(L2WRITE_PREFETCH, INVALID, Some(INVALID), Some(L2WRITE_PREFETCH), Hdr, Hdr, None, NoChange, true);
        self.add(L2WRITE_PREFETCH, PR_CL, Some(PR_CL), Some(L2WRITE_PREFETCH), Hdr, Hdr, None, NoChange, false);

        self.add(L2READ_PREFETCH, INVALID, Some(INVALID), Some(L2READ_PREFETCH), Hdr, Hdr, None, NoChange, true);
        self.add(L2READ_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        // READ_SH / READ_OWN / UPGRADE never reach a primary cache

        self.add(REPLY_SH, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(REPLY_EXCL, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPLY_EXCL, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(REPLY_EXCLDY, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPLY_EXCLDY, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(REPLY_UPGRADE, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPLY_UPGRADE, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(COPYBACK, INVALID, Some(INVALID), Some(COPYBACK), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK, PR_CL, Some(PR_CL), Some(COPYBACK), Hdr, Hdr, None, NoChange, false);

        self.add(COPYBACK_INVL, INVALID, Some(INVALID), Some(COPYBACK_INVL), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK_INVL, PR_CL, Some(INVALID), Some(COPYBACK_INVL), Hdr, Hdr, None, NoChange, false);

        self.add(INVL, INVALID, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);
        self.add(INVL, PR_CL, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);

        self.add(REPL, INVALID, Some(INVALID), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPL, PR_CL, Some(INVALID), None, NoChange, NoChange, None, NoChange, false);
    }

    /// Primary write-back. Keeps a PR_CL state internally even when the L2
    /// runs MSI, so clean private lines need not be written back to L2; a
    /// PR_CL line here may be dirty as far as the rest of the system knows.
    fn fill_primary_wb(&mut self) {
        use LineState::{INVALID, PR_CL, PR_DY, SH_CL};
        use ReqType::*;

        self.add(READ, INVALID, None, Some(READ), Hdr, HdrLine, None, NoChange, false);
        self.add(READ, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(READ, SH_CL, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(READ, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(WRITE, INVALID, None, Some(WRITE), Hdr, HdrLine, None, NoChange, false);
        self.add(WRITE, PR_CL, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);
        self.add(WRITE, SH_CL, None, Some(WRITE), Hdr, Hdr, None, NoChange, false);
        self.add(WRITE, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(RMW, INVALID, None, Some(RMW), Hdr, HdrLine, None, NoChange, false);
        self.add(RMW, PR_CL, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);
        self.add(RMW, SH_CL, None, Some(RMW), Hdr, Hdr, None, NoChange, false);
        self.add(RMW, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L1WRITE_PREFETCH, INVALID, None, Some(L1WRITE_PREFETCH), Hdr, HdrLine, None, NoChange, false);
        self.add(L1WRITE_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L1WRITE_PREFETCH, SH_CL, None, Some(L1WRITE_PREFETCH), Hdr, Hdr, None, NoChange, false);
        self.add(L1WRITE_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L1READ_PREFETCH, INVALID, None, Some(L1READ_PREFETCH), Hdr, HdrLine, None, NoChange, false);
        self.add(L1READ_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L1READ_PREFETCH, SH_CL, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L1READ_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L2WRITE_PREFETCH, INVALID, Some(INVALID), Some(L2WRITE_PREFETCH), Hdr, Hdr, None, NoChange, true);
        self.add(L2WRITE_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L2WRITE_PREFETCH, SH_CL, Some(SH_CL), Some(L2WRITE_PREFETCH), Hdr, Hdr, None, NoChange, false);
        self.add(L2WRITE_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L2READ_PREFETCH, INVALID, Some(INVALID), Some(L2READ_PREFETCH), Hdr, Hdr, None, NoChange, true);
        self.add(L2READ_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L2READ_PREFETCH, SH_CL, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L2READ_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(REPLY_SH, INVALID, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(REPLY_EXCL, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPLY_EXCL, SH_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPLY_EXCLDY, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(REPLY_UPGRADE, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPLY_UPGRADE, SH_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);

        self.add(COPYBACK, INVALID, Some(INVALID), Some(COPYBACK), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK, PR_CL, Some(SH_CL), Some(COPYBACK), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK, SH_CL, Some(SH_CL), Some(COPYBACK), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK, PR_DY, Some(SH_CL), Some(COPYBACK), HdrLine, HdrLine, None, NoChange, false);

        self.add(COPYBACK_INVL, INVALID, Some(INVALID), Some(COPYBACK_INVL), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK_INVL, PR_CL, Some(INVALID), Some(COPYBACK_INVL), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK_INVL, SH_CL, Some(INVALID), Some(COPYBACK_INVL), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK_INVL, PR_DY, Some(INVALID), Some(COPYBACK_INVL), HdrLine, HdrLine, None, NoChange, false);

        self.add(INVL, INVALID, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);
        self.add(INVL, PR_CL, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);
        self.add(INVL, SH_CL, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);
        self.add(INVL, PR_DY, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);

        self.add(REPL, INVALID, Some(INVALID), None, NoChange, NoChange, None, NoChange, false);
        // no replacement hints from L1: the L2 checks this cache anyway
        // before sending anything to the directory
        self.add(REPL, PR_CL, Some(INVALID), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPL, SH_CL, Some(INVALID), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPL, PR_DY, Some(INVALID), Some(WRB), HdrLine, Hdr, None, NoChange, false);
    }

    /// Second-level write-back cache.
    fn fill_secondary_wb(&mut self, protocol: Protocol, hints: ReplacementHints) {
        use LineState::{INVALID, PR_CL, PR_DY, SH_CL};
        use ReqType::*;

        self.add(READ, INVALID, None, Some(READ_SH), Hdr, HdrLine, None, NoChange, false);
        self.add(READ, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(READ, SH_CL, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(READ, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(WRITE, INVALID, None, Some(READ_OWN), Hdr, HdrLine, None, NoChange, false);
        self.add(WRITE, PR_CL, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);
        self.add(WRITE, SH_CL, None, Some(UPGRADE), Hdr, Hdr, None, NoChange, false);
        self.add(WRITE, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(RMW, INVALID, None, Some(READ_OWN), Hdr, HdrLine, None, NoChange, false);
        self.add(RMW, PR_CL, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);
        self.add(RMW, SH_CL, None, Some(UPGRADE), Hdr, Hdr, None, NoChange, false);
        self.add(RMW, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L1WRITE_PREFETCH, INVALID, None, Some(READ_OWN), Hdr, HdrLine, None, NoChange, false);
        self.add(L1WRITE_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L1WRITE_PREFETCH, SH_CL, None, Some(UPGRADE), Hdr, Hdr, None, NoChange, false);
        self.add(L1WRITE_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L1READ_PREFETCH, INVALID, None, Some(READ_SH), Hdr, HdrLine, None, NoChange, false);
        self.add(L1READ_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L1READ_PREFETCH, SH_CL, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L1READ_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L2WRITE_PREFETCH, INVALID, None, Some(READ_OWN), Hdr, HdrLine, None, NoChange, false);
        self.add(L2WRITE_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L2WRITE_PREFETCH, SH_CL, None, Some(UPGRADE), Hdr, Hdr, None, NoChange, false);
        self.add(L2WRITE_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(L2READ_PREFETCH, INVALID, None, Some(READ_SH), Hdr, HdrLine, None, NoChange, false);
        self.add(L2READ_PREFETCH, PR_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L2READ_PREFETCH, SH_CL, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(L2READ_PREFETCH, PR_DY, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        self.add(REPLY_SH, INVALID, Some(SH_CL), None, NoChange, NoChange, None, NoChange, false);
        self.add(REPLY_EXCLDY, INVALID, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);

        if protocol == Protocol::MESI {
            // the protocol has a private clean state
            self.add(REPLY_EXCL, INVALID, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
            self.add(REPLY_UPGRADE, SH_CL, Some(PR_CL), None, NoChange, NoChange, None, NoChange, false);
        } else {
            self.add(REPLY_EXCL, INVALID, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);
            self.add(REPLY_UPGRADE, SH_CL, Some(PR_DY), None, NoChange, NoChange, None, NoChange, false);
        }

        self.add(COPYBACK, INVALID, Some(INVALID), Some(COPYBACK), Hdr, Hdr, None, NoChange, false);
        // in some protocols this would be a plain ACK; here the transfer
        // target gets the whole line while the directory gets only an ACK
        self.add(COPYBACK, PR_CL, Some(SH_CL), Some(COPYBACK), HdrLine, Hdr, None, NoChange, false);
        self.add(COPYBACK, SH_CL, Some(SH_CL), Some(COPYBACK), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK, PR_DY, Some(SH_CL), Some(COPYBACK), HdrLine, HdrLine, None, NoChange, false);

        self.add(COPYBACK_INVL, INVALID, Some(INVALID), Some(COPYBACK_INVL), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK_INVL, PR_CL, Some(INVALID), Some(COPYBACK_INVL), HdrLine, Hdr, None, NoChange, false);
        self.add(COPYBACK_INVL, SH_CL, Some(INVALID), Some(COPYBACK_INVL), Hdr, Hdr, None, NoChange, false);
        self.add(COPYBACK_INVL, PR_DY, Some(INVALID), Some(COPYBACK_INVL), HdrLine, HdrLine, None, NoChange, false);

        self.add(INVL, INVALID, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);
        self.add(INVL, PR_CL, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);
        self.add(INVL, SH_CL, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);
        self.add(INVL, PR_DY, Some(INVALID), Some(INVL), Hdr, Hdr, None, NoChange, false);

        self.add(REPL, INVALID, Some(INVALID), None, NoChange, NoChange, None, NoChange, false);

        if hints >= ReplacementHints::EXCL {
            self.add(REPL, PR_CL, Some(INVALID), Some(REPL), Hdr, Hdr, Some(COPYBACK_INVL), Hdr, false);
        } else {
            self.add(REPL, PR_CL, Some(INVALID), None, NoChange, NoChange, Some(COPYBACK_INVL), Hdr, false);
        }

        if hints >= ReplacementHints::ALL {
            self.add(REPL, SH_CL, Some(INVALID), Some(REPL), Hdr, Hdr, Some(INVL), Hdr, false);
        } else {
            self.add(REPL, SH_CL, Some(INVALID), None, NoChange, NoChange, Some(INVL), Hdr, false);
        }

        self.add(REPL, PR_DY, Some(INVALID), Some(WRB), HdrLine, Hdr, Some(COPYBACK_INVL), Hdr, false);
    }
}

#[cfg(test)]
mod tests {
    use super::{LineState, MsgSize, Table};
    use crate::config::{CoheKind, Protocol, ReplacementHints};
    use crate::req::{Kind, ReqType};

    fn l2(protocol: Protocol) -> Table {
        Table::build(CoheKind::WB_NREF, protocol, ReplacementHints::EXCL)
    }

    #[test]
    fn l2_read_from_invalid_emits_read_sh() {
        let entry = l2(Protocol::MESI).lookup(Kind::REQUEST, LineState::INVALID, ReqType::READ);
        assert_eq!(entry.next_mod_req, Some(ReqType::READ_SH));
        assert_eq!(entry.req_sz, MsgSize::Hdr);
        assert_eq!(entry.rep_sz, MsgSize::HdrLine);
    }

    #[test]
    fn l2_write_from_shared_emits_upgrade() {
        let entry = l2(Protocol::MESI).lookup(Kind::REQUEST, LineState::SH_CL, ReqType::WRITE);
        assert_eq!(entry.next_mod_req, Some(ReqType::UPGRADE));
    }

    #[test]
    fn reply_excl_depends_on_protocol() {
        let mesi = l2(Protocol::MESI).lookup(Kind::REPLY, LineState::INVALID, ReqType::REPLY_EXCL);
        assert_eq!(mesi.next_state, Some(LineState::PR_CL));
        let msi = l2(Protocol::MSI).lookup(Kind::REPLY, LineState::INVALID, ReqType::REPLY_EXCL);
        assert_eq!(msi.next_state, Some(LineState::PR_DY));
    }

    #[test]
    fn l2_repl_of_dirty_emits_wrb_and_copyback_invl() {
        let entry = l2(Protocol::MESI).lookup(Kind::REQUEST, LineState::PR_DY, ReqType::REPL);
        assert_eq!(entry.next_mod_req, Some(ReqType::WRB));
        assert_eq!(entry.req_sz, MsgSize::HdrLine);
        assert_eq!(entry.next_req, Some(ReqType::COPYBACK_INVL));
    }

    #[test]
    fn l2_repl_hint_follows_config() {
        let hinted = Table::build(CoheKind::WB_NREF, Protocol::MESI, ReplacementHints::EXCL)
            .lookup(Kind::REQUEST, LineState::PR_CL, ReqType::REPL);
        assert_eq!(hinted.next_mod_req, Some(ReqType::REPL));
        let silent = Table::build(CoheKind::WB_NREF, Protocol::MESI, ReplacementHints::NONE)
            .lookup(Kind::REQUEST, LineState::PR_CL, ReqType::REPL);
        assert_eq!(silent.next_mod_req, None);
        assert_eq!(silent.next_req, Some(ReqType::COPYBACK_INVL));
    }

    #[test]
    fn l1_wb_keeps_private_clean_internally() {
        let table = Table::build(CoheKind::PR_WB, Protocol::MSI, ReplacementHints::EXCL);
        let entry = table.lookup(Kind::REPLY, LineState::INVALID, ReqType::REPLY_EXCL);
        assert_eq!(entry.next_state, Some(LineState::PR_CL));
        // clean private lines need no write-back toward L2
        let repl = table.lookup(Kind::REQUEST, LineState::PR_CL, ReqType::REPL);
        assert_eq!(repl.next_mod_req, None);
        let dirty = table.lookup(Kind::REQUEST, LineState::PR_DY, ReqType::REPL);
        assert_eq!(dirty.next_mod_req, Some(ReqType::WRB));
        assert_eq!(dirty.req_sz, MsgSize::HdrLine);
    }

    #[test]
    fn l1_wt_writes_are_non_allocating() {
        let table = Table::build(CoheKind::PR_WT, Protocol::MESI, ReplacementHints::EXCL);
        let entry = table.lookup(Kind::REQUEST, LineState::INVALID, ReqType::WRITE);
        assert_eq!(entry.next_mod_req, Some(ReqType::WRITE));
        assert_eq!(entry.req_sz, MsgSize::Hdr);
        assert!(!entry.allocate(LineState::INVALID, false));
        // every reply flavor lands in PR_CL
        for reply in [
            ReqType::REPLY_SH,
            ReqType::REPLY_EXCL,
            ReqType::REPLY_EXCLDY,
            ReqType::REPLY_UPGRADE,
        ] {
            let cell = table.lookup(Kind::REPLY, LineState::INVALID, reply);
            assert_eq!(cell.next_state, Some(LineState::PR_CL));
        }
    }

    #[test]
    #[should_panic(expected = "invalid combination")]
    fn blank_cell_is_fatal() {
        let _ = l2(Protocol::MESI).lookup(Kind::REQUEST, LineState::SH_DY, ReqType::READ);
    }
}
