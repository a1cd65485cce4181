/// A width×depth pipelined RAM bank (tag or data array).
///
/// The pipeline is a flat array of `width * depth` slots. Slots `0..width`
/// form the head stage, the last `width` slots form the input stage. Each
/// [`Pipeline::advance`] moves every occupied slot forward by at most one
/// stage, preserving order within a stage; an entry cannot pass a full or
/// blocked later stage, which is the only source of head-of-line blocking
/// inside a bank.
#[derive(Debug, Clone)]
pub struct Pipeline<T> {
    slots: Vec<Option<T>>,
    depth: usize,
    width: usize,
    num_in_pipe: usize,
    num_in_input_stage: usize,
    where_to_add: usize,
}

impl<T: Copy> Pipeline<T> {
    #[must_use]
    pub fn new(width: usize, depth: usize) -> Self {
        assert!(width > 0 && depth > 0, "pipeline must have width and depth");
        Self {
            slots: vec![None; width * depth],
            depth,
            width,
            num_in_pipe: 0,
            num_in_input_stage: 0,
            // add at the beginning of the input stage
            where_to_add: width * (depth - 1),
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Is the input stage full?
    #[must_use]
    pub fn input_full(&self) -> bool {
        self.num_in_input_stage == self.width
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.num_in_pipe
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_in_pipe == 0
    }

    /// Add a new entry to the input stage. Returns `false` when the input
    /// stage has no room this cycle.
    pub fn add(&mut self, entry: T) -> bool {
        if self.num_in_input_stage == self.width {
            return false;
        }
        while self.slots[self.where_to_add].is_some() {
            self.where_to_add += 1;
            if self.where_to_add == self.depth * self.width {
                return false;
            }
        }
        self.slots[self.where_to_add] = Some(entry);
        self.where_to_add += 1;
        self.num_in_pipe += 1;
        self.num_in_input_stage += 1;
        true
    }

    /// Peek at a head-stage slot. Positions at or past `width` are not in
    /// the head stage and return `None`.
    #[must_use]
    pub fn head(&self, posn: usize) -> Option<T> {
        if posn >= self.width {
            return None;
        }
        self.slots[posn]
    }

    /// Remove a dispatched entry. Normally called for a head-stage position
    /// after [`Pipeline::head`].
    pub fn clear(&mut self, posn: usize) {
        debug_assert!(self.slots[posn].is_some());
        self.slots[posn] = None;
        self.num_in_pipe -= 1;
    }

    /// Replace an entry in place (used when a processed message is
    /// substituted by its companion without re-entering the pipe).
    pub fn replace(&mut self, posn: usize, entry: T) {
        debug_assert!(self.slots[posn].is_some());
        self.slots[posn] = Some(entry);
    }

    /// Advance every entry by at most one stage. Returns the number of
    /// entries left in the input stage afterward.
    pub fn advance(&mut self) -> usize {
        let (depth, width) = (self.depth, self.width);
        self.num_in_input_stage = 0;
        let mut freespace = 0usize;
        let mut ctr = 0usize;
        for stage in 0..depth {
            for _ in 0..width {
                if self.slots[ctr].is_some() {
                    let mut progressed = false;
                    // max progress is one stage
                    let stage_floor = stage.saturating_sub(1) * width;
                    if freespace < stage_floor {
                        freespace = stage_floor;
                    }
                    while freespace < ctr {
                        if self.slots[freespace].is_none() {
                            self.slots[freespace] = self.slots[ctr].take();
                            progressed = true;
                            if freespace >= width * (depth - 1) {
                                self.num_in_input_stage += 1;
                            }
                            freespace += 1;
                            break;
                        }
                        freespace += 1;
                    }
                    if !progressed {
                        freespace += 1;
                        if ctr >= width * (depth - 1) {
                            self.num_in_input_stage += 1;
                        }
                    }
                }
                ctr += 1;
            }
        }
        self.where_to_add = if self.num_in_input_stage == 0 {
            (depth - 1) * width
        } else {
            freespace
        };
        self.num_in_input_stage
    }
}

#[cfg(test)]
mod tests {
    use super::Pipeline;

    #[test]
    fn entry_reaches_head_after_depth_cycles() {
        let mut pipe: Pipeline<u32> = Pipeline::new(1, 3);
        assert!(pipe.add(42));
        assert_eq!(pipe.head(0), None);
        pipe.advance();
        assert_eq!(pipe.head(0), None);
        pipe.advance();
        assert_eq!(pipe.head(0), Some(42));
    }

    #[test]
    fn single_stage_pipe_is_visible_after_one_advance() {
        let mut pipe: Pipeline<u32> = Pipeline::new(2, 1);
        assert!(pipe.add(1));
        assert!(pipe.add(2));
        assert!(!pipe.add(3)); // input stage full
        assert!(pipe.input_full());
        pipe.advance();
        assert_eq!(pipe.head(0), Some(1));
        assert_eq!(pipe.head(1), Some(2));
    }

    #[test]
    fn blocked_head_backs_up_the_pipe() {
        let mut pipe: Pipeline<u32> = Pipeline::new(1, 2);
        assert!(pipe.add(1));
        pipe.advance();
        assert_eq!(pipe.head(0), Some(1));
        assert!(pipe.add(2));
        // head not cleared: 2 cannot advance past it
        pipe.advance();
        assert_eq!(pipe.head(0), Some(1));
        assert!(pipe.input_full());
        assert!(!pipe.add(3));
        // dispatch the head; follower moves up next cycle
        pipe.clear(0);
        pipe.advance();
        assert_eq!(pipe.head(0), Some(2));
        assert!(!pipe.input_full());
    }

    #[test]
    fn order_is_preserved_within_a_stage() {
        let mut pipe: Pipeline<u32> = Pipeline::new(2, 2);
        assert!(pipe.add(1));
        assert!(pipe.add(2));
        pipe.advance();
        assert!(pipe.add(3));
        pipe.advance();
        assert_eq!(pipe.head(0), Some(1));
        assert_eq!(pipe.head(1), Some(2));
        pipe.clear(0);
        pipe.clear(1);
        pipe.advance();
        assert_eq!(pipe.head(0), Some(3));
    }

    #[test]
    fn replace_swaps_the_head_entry() {
        let mut pipe: Pipeline<u32> = Pipeline::new(1, 1);
        assert!(pipe.add(7));
        pipe.advance();
        assert_eq!(pipe.head(0), Some(7));
        pipe.replace(0, 8);
        assert_eq!(pipe.head(0), Some(8));
        assert_eq!(pipe.len(), 1);
    }
}
