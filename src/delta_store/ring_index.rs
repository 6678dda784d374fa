//! Bounded slot index for the delta frame ring.

use crate::Frame;

/// A position in a ring of fixed capacity.
///
/// All modulo arithmetic on ring slots goes through this type, so callers never
/// compute slot positions by hand.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RingIndex {
    pos: usize,
    capacity: usize,
}

impl RingIndex {
    /// The first slot of a ring with `capacity` slots. Returns `None` for an empty ring.
    #[must_use]
    pub const fn start(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            None
        } else {
            Some(Self { pos: 0, capacity })
        }
    }

    /// The slot position, always `< capacity`.
    #[inline]
    #[must_use]
    pub const fn pos(self) -> usize {
        self.pos
    }

    /// Number of slots in the ring.
    #[inline]
    #[must_use]
    pub const fn capacity(self) -> usize {
        self.capacity
    }

    /// The following slot, wrapping to 0 after the last one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        let pos = if self.pos + 1 == self.capacity {
            0
        } else {
            self.pos + 1
        };
        Self { pos, ..self }
    }

    /// The preceding slot, wrapping to the last one before 0.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        let pos = if self.pos == 0 {
            self.capacity - 1
        } else {
            self.pos - 1
        };
        Self { pos, ..self }
    }

    /// The slot `steps` positions ahead.
    #[inline]
    #[must_use]
    pub const fn advance(self, steps: usize) -> Self {
        Self {
            pos: (self.pos + steps % self.capacity) % self.capacity,
            ..self
        }
    }

    /// Number of `next` steps from `self` to `later`.
    #[inline]
    #[must_use]
    pub const fn steps_to(self, later: RingIndex) -> usize {
        (later.pos + self.capacity - self.pos) % self.capacity
    }
}

/// A ring pointer: the slot it designates and the frame that slot holds.
///
/// The two always move together, which keeps the frame-order invariant between the
/// store's pointers checkable without knowing how many times the ring wrapped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RingCursor {
    pub(crate) slot: RingIndex,
    pub(crate) frame: Frame,
}

impl RingCursor {
    pub(crate) const fn new(slot: RingIndex, frame: Frame) -> Self {
        Self { slot, frame }
    }

    pub(crate) const fn next(self) -> Self {
        Self {
            slot: self.slot.next(),
            frame: self.frame.next(),
        }
    }

    /// Cursor for `frame`, which must not lie before `self`.
    pub(crate) fn seek(self, frame: Frame) -> Self {
        let steps = frame.distance_from(self.frame) as usize;
        Self {
            slot: self.slot.advance(steps),
            frame,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_has_no_start() {
        assert!(RingIndex::start(0).is_none());
    }

    #[test]
    fn next_wraps_to_zero() {
        let last = RingIndex::start(3).unwrap().advance(2);
        assert_eq!(last.pos(), 2);
        assert_eq!(last.next().pos(), 0);
    }

    #[test]
    fn prev_wraps_to_last() {
        let first = RingIndex::start(4).unwrap();
        assert_eq!(first.prev().pos(), 3);
        assert_eq!(first.prev().next(), first);
    }

    #[test]
    fn advance_handles_multiples_of_capacity() {
        let start = RingIndex::start(5).unwrap();
        assert_eq!(start.advance(5), start);
        assert_eq!(start.advance(12).pos(), 2);
    }

    #[test]
    fn steps_to_counts_forward_distance() {
        let a = RingIndex::start(4).unwrap().advance(3);
        let b = RingIndex::start(4).unwrap().advance(1);
        assert_eq!(a.steps_to(b), 2);
        assert_eq!(b.steps_to(a), 2);
        assert_eq!(a.steps_to(a), 0);
    }

    #[test]
    fn cursor_seek_matches_repeated_next() {
        let start = RingCursor::new(RingIndex::start(3).unwrap(), Frame::new(u32::MAX - 1));
        let walked = start.next().next().next().next();
        let sought = start.seek(Frame::new(2));
        assert_eq!(walked, sought);
        assert_eq!(sought.slot.pos(), 1);
    }
}
