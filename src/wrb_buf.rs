use crate::pool::ReqPool;
use crate::req::{ReqId, ReqType, REQ_SZ};

/// One outstanding victimization/invalidation at the L2.
#[derive(Debug)]
struct Slot {
    tag: u64,
    /// secondary request clubbed with this slot (a WRB behind an INVL when
    /// the L1 is write-through); same line
    req2: Option<ReqId>,
    done_data: bool,
    done_l1: bool,
    dirty: bool,
    /// a REQUEST is stalled on this outstanding victimization
    stalling: bool,
}

/// The L2 write-back buffer.
///
/// Every REQUEST that books an L2 MSHR also reserves one slot here, because
/// the reply may force a victimization; the reservation is dropped when the
/// reply replaces nothing, or held until the spawned subset-invalidation and
/// write-back actually drain. An outbound WRB may only leave once both the
/// L2-data path and the L1 path have completed; if both levels held the line
/// clean the message is downgraded from WRB to REPL.
#[derive(Debug)]
pub struct WrbBuffer {
    slots: Vec<Option<Slot>>,
    /// reserved slots (reservations precede concrete entries)
    pub used: usize,
}

impl WrbBuffer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
            used: 0,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Book a slot for an incoming REPLY that may victimize.
    pub fn reserve(&mut self) {
        self.used += 1;
        assert!(
            self.used <= self.slots.len(),
            "WRB buffer over-reserved; space must be checked before sending a request"
        );
    }

    /// Drop a reservation that turned out not to be needed.
    pub fn unreserve(&mut self) {
        debug_assert!(self.used > 0);
        self.used -= 1;
    }

    fn position(&self, tag: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.tag == tag))
    }

    #[must_use]
    pub fn hit(&self, tag: u64) -> bool {
        self.position(tag).is_some()
    }

    /// Check for an address conflict with an incoming REQUEST; on a hit the
    /// slot is marked as having a stalled requester.
    pub fn hit_markstall(&mut self, tag: u64) -> bool {
        if let Some(idx) = self.position(tag) {
            self.slots[idx].as_mut().expect("slot occupied").stalling = true;
            return true;
        }
        false
    }

    /// Fill a (previously reserved) slot for an outstanding victimization.
    pub fn insert(&mut self, pool: &ReqPool, req: ReqId, req2: Option<ReqId>) {
        let tag = pool.get(req).tag;
        let free = self
            .slots
            .iter()
            .position(Option::is_none)
            .expect("no space left in WRB buffer; space must be booked before inserting");
        self.slots[free] = Some(Slot {
            tag,
            req2,
            done_data: false,
            done_l1: false,
            dirty: false,
            stalling: false,
        });
    }

    /// Release the slot covering `tag` together with its reservation.
    pub fn remove(&mut self, tag: u64) {
        let idx = self
            .position(tag)
            .unwrap_or_else(|| panic!("removing absent WRB-buffer entry for tag {tag}"));
        log::trace!("wrb_buf: removing tag {tag}");
        self.slots[idx] = None;
        self.unreserve();
    }

    /// Promote the clubbed secondary request into the slot (the INVL has
    /// been sent; the WRB now owns the slot). Returns the promoted request.
    pub fn promote(&mut self, pool: &ReqPool, tag: u64) -> ReqId {
        let idx = self
            .position(tag)
            .unwrap_or_else(|| panic!("promoting absent WRB-buffer entry for tag {tag}"));
        let slot = self.slots[idx].as_mut().expect("slot occupied");
        let req2 = slot
            .req2
            .take()
            .expect("promote requires a clubbed secondary request");
        slot.tag = pool.get(req2).tag;
        req2
    }

    /// The L2 data access for this WRB completed. Returns whether the L1
    /// path had already completed too.
    pub fn mark_done_data(&mut self, tag: u64, withdata: bool) -> bool {
        let idx = self
            .position(tag)
            .unwrap_or_else(|| panic!("no WRB-buffer match for tag {tag}"));
        let slot = self.slots[idx].as_mut().expect("slot occupied");
        if withdata {
            slot.dirty = true;
        }
        slot.done_data = true;
        slot.done_l1
    }

    /// The L1 path for this WRB completed. Returns whether the L2 data path
    /// had already completed; when it has, the outbound request is fixed up:
    /// dirty data forces a line-sized WRB, a fully clean line becomes REPL.
    pub fn mark_done_l1(&mut self, pool: &mut ReqPool, req: ReqId) -> bool {
        let (tag, carries_data) = {
            let r = pool.get(req);
            (r.tag, r.size_st > REQ_SZ)
        };
        let idx = self
            .position(tag)
            .unwrap_or_else(|| panic!("no WRB-buffer match for tag {tag}"));
        let slot = self.slots[idx].as_mut().expect("slot occupied");
        if carries_data {
            slot.dirty = true;
        }
        slot.done_l1 = true;
        if slot.done_data {
            let r = pool.get_mut(req);
            if slot.dirty {
                // an unsolicited WRB may have set dirty without data here
                let line_sized = REQ_SZ + r.line_size;
                if r.size_st != line_sized {
                    r.size_st = line_sized;
                }
            } else {
                r.req_type = ReqType::REPL;
            }
        }
        slot.done_data
    }

    /// Clear the L1-done flag again (race: an unsolicited L1 write-back
    /// arrived before the demand write-back even reached the L1).
    pub fn mark_undone_l1(&mut self, tag: u64) {
        let idx = self
            .position(tag)
            .unwrap_or_else(|| panic!("no WRB-buffer match for tag {tag}"));
        self.slots[idx].as_mut().expect("slot occupied").done_l1 = false;
    }

    #[must_use]
    pub fn check_done_l1(&self, tag: u64) -> bool {
        let idx = self
            .position(tag)
            .unwrap_or_else(|| panic!("no WRB-buffer match for tag {tag}"));
        self.slots[idx].as_ref().expect("slot occupied").done_l1
    }

    #[must_use]
    pub fn check_stalling(&self, tag: u64) -> bool {
        let idx = self
            .position(tag)
            .unwrap_or_else(|| panic!("no WRB-buffer match for tag {tag}"));
        self.slots[idx].as_ref().expect("slot occupied").stalling
    }
}

#[cfg(test)]
mod tests {
    use super::WrbBuffer;
    use crate::pool::ReqPool;
    use crate::req::{Req, ReqId, ReqType, REQ_SZ};

    fn wrb(pool: &mut ReqPool, tag: u64, line_size: u32) -> ReqId {
        let mut req = Req::request(tag << 6, ReqType::WRB, 0, 0);
        req.tag = tag;
        req.line_size = line_size;
        pool.alloc(req)
    }

    #[test]
    fn both_paths_must_finish_before_send() {
        let mut pool = ReqPool::new();
        let mut buf = WrbBuffer::new(2);
        buf.reserve();
        let req = wrb(&mut pool, 7, 64);
        buf.insert(&pool, req, None);

        assert!(!buf.mark_done_data(7, true));
        pool.get_mut(req).size_st = REQ_SZ; // L1 nacked, no data
        assert!(buf.mark_done_l1(&mut pool, req));
        // data path was dirty, so the message stays a line-sized WRB
        assert_eq!(pool.get(req).req_type, ReqType::WRB);
        assert_eq!(pool.get(req).size_st, REQ_SZ + 64);
    }

    #[test]
    fn clean_both_levels_downgrades_to_repl() {
        let mut pool = ReqPool::new();
        let mut buf = WrbBuffer::new(2);
        buf.reserve();
        let req = wrb(&mut pool, 9, 64);
        buf.insert(&pool, req, None);

        buf.mark_done_data(9, false);
        pool.get_mut(req).size_st = REQ_SZ;
        assert!(buf.mark_done_l1(&mut pool, req));
        assert_eq!(pool.get(req).req_type, ReqType::REPL);
    }

    #[test]
    fn markstall_records_the_waiter() {
        let mut pool = ReqPool::new();
        let mut buf = WrbBuffer::new(1);
        buf.reserve();
        let req = wrb(&mut pool, 3, 64);
        buf.insert(&pool, req, None);

        assert!(!buf.check_stalling(3));
        assert!(buf.hit_markstall(3));
        assert!(buf.check_stalling(3));
        assert!(!buf.hit_markstall(4));
    }

    #[test]
    fn promote_hands_over_the_slot() {
        let mut pool = ReqPool::new();
        let mut buf = WrbBuffer::new(1);
        buf.reserve();
        let invl = wrb(&mut pool, 5, 64);
        let second = wrb(&mut pool, 5, 64);
        buf.insert(&pool, invl, Some(second));

        let promoted = buf.promote(&pool, 5);
        assert_eq!(promoted, second);
        assert!(buf.hit(5));
        buf.remove(5);
        assert_eq!(buf.used, 0);
    }

    #[test]
    #[should_panic(expected = "over-reserved")]
    fn over_reservation_is_a_bug() {
        let mut buf = WrbBuffer::new(1);
        buf.reserve();
        buf.reserve();
    }
}
