//! Per-port reorder buffer.
//!
//! Every event dequeued by a port in independent-enqueue mode is tagged with
//! the next sequence index. Forwards and releases are parked at the index the
//! application echoes back and only leave the buffer as a contiguous run
//! starting at the oldest unfinished index, so the device sees them in the
//! order the events were dequeued.

use qe_ring::Qe;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotError {
    /// The index was never handed out, or has already drained.
    OutOfWindow,
    /// A command is already parked at the index.
    Occupied,
}

#[derive(Debug)]
pub(crate) struct ReorderBuffer {
    slots: Box<[Option<Qe>]>,
    mask: u32,
    /// Oldest index not yet drained (unmasked).
    head: u32,
    /// Next index to hand out (unmasked).
    tail: u32,
}

impl ReorderBuffer {
    pub fn new(depth: u32) -> Self {
        debug_assert!(depth.is_power_of_two());
        Self {
            slots: vec![None; depth as usize].into_boxed_slice(),
            mask: depth - 1,
            head: 0,
            tail: 0,
        }
    }

    /// Indices handed out and not yet drained.
    pub fn in_window(&self) -> u32 {
        self.tail.wrapping_sub(self.head)
    }

    /// Tags the next dequeued event.
    pub fn assign(&mut self) -> u16 {
        debug_assert!(self.in_window() <= self.mask, "reorder window overrun");
        let seq = self.tail & self.mask;
        self.tail = self.tail.wrapping_add(1);
        seq as u16
    }

    fn offset(&self, seq: u16) -> Result<u32, SlotError> {
        let offset = (u32::from(seq).wrapping_sub(self.head)) & self.mask;
        if u32::from(seq) > self.mask || offset >= self.in_window() {
            return Err(SlotError::OutOfWindow);
        }
        Ok(offset)
    }

    /// Checks that a command may be parked at `seq` without touching anything.
    pub fn check(&self, seq: u16) -> Result<(), SlotError> {
        let offset = self.offset(seq)?;
        let idx = (self.head.wrapping_add(offset) & self.mask) as usize;
        match self.slots[idx] {
            Some(_) => Err(SlotError::Occupied),
            None => Ok(()),
        }
    }

    pub fn store(&mut self, seq: u16, qe: Qe) -> Result<(), SlotError> {
        self.check(seq)?;
        self.slots[seq as usize] = Some(qe);
        Ok(())
    }

    /// Parks `make(seq)` at every handed-out index still empty; returns how many.
    pub fn fill_unready(&mut self, mut make: impl FnMut(u16) -> Qe) -> u32 {
        let mut filled = 0;
        for i in 0..self.in_window() {
            let idx = (self.head.wrapping_add(i) & self.mask) as usize;
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(make(idx as u16));
                filled += 1;
            }
        }
        filled
    }

    /// Takes the oldest command if it is ready.
    pub fn pop_ready(&mut self) -> Option<Qe> {
        if self.in_window() == 0 {
            return None;
        }
        let idx = (self.head & self.mask) as usize;
        let qe = self.slots[idx].take()?;
        self.head = self.head.wrapping_add(1);
        Some(qe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qe_ring::cmd;

    fn comp(tag: u64) -> Qe {
        Qe {
            payload: tag,
            cmd: cmd::COMP,
            ..Qe::default()
        }
    }

    fn drain(buf: &mut ReorderBuffer) -> Vec<u64> {
        std::iter::from_fn(|| buf.pop_ready()).map(|qe| qe.payload).collect()
    }

    #[test]
    fn out_of_order_completions_leave_in_dequeue_order() {
        let mut buf = ReorderBuffer::new(8);
        let seqs: Vec<u16> = (0..8).map(|_| buf.assign()).collect();
        assert_eq!(seqs, (0..8).collect::<Vec<_>>());

        buf.store(3, comp(3)).unwrap();
        buf.store(1, comp(1)).unwrap();
        assert!(drain(&mut buf).is_empty());
        buf.store(0, comp(0)).unwrap();
        assert_eq!(drain(&mut buf), vec![0, 1]);
        buf.store(2, comp(2)).unwrap();
        assert_eq!(drain(&mut buf), vec![2, 3]);
        assert_eq!(buf.in_window(), 4);
    }

    #[test]
    fn rejects_reuse_and_unissued_indices() {
        let mut buf = ReorderBuffer::new(8);
        buf.assign();
        buf.assign();
        buf.store(1, comp(1)).unwrap();
        assert_eq!(buf.store(1, comp(9)), Err(SlotError::Occupied));
        assert_eq!(buf.check(2), Err(SlotError::OutOfWindow));
        assert_eq!(buf.check(200), Err(SlotError::OutOfWindow));
        buf.store(0, comp(0)).unwrap();
        assert_eq!(drain(&mut buf), vec![0, 1]);
        assert_eq!(buf.check(0), Err(SlotError::OutOfWindow));
    }

    /// Indices keep working after the window has wrapped several times.
    #[test]
    fn window_wraps_with_the_ring() {
        let mut buf = ReorderBuffer::new(8);
        for round in 0..5u64 {
            let a = buf.assign();
            buf.assign();
            let c = buf.assign();
            buf.store(c, comp(round * 10 + 2)).unwrap();
            buf.store(a, comp(round * 10)).unwrap();
            assert_eq!(buf.fill_unready(|_| comp(round * 10 + 1)), 1);
            assert_eq!(drain(&mut buf), vec![round * 10, round * 10 + 1, round * 10 + 2]);
        }
        assert_eq!(buf.in_window(), 0);
    }
}
