//! # Delta Frame Store
//!
//! Fixed-capacity ring of per-frame snapshots and input records.
//!
//! The store tracks four pointers, always in this frame order:
//!
//! ```text
//!   other ≤ replay ≤ self
//!   other ≤ read   ≤ self
//!
//!   ┌──────┬──────┬──────┬──────┬──────┬──────┐
//!   │  10  │  11  │  12  │  13  │  14  │  9   │   slots (frame numbers)
//!   └──────┴──────┴──────┴──────┴──────┴──────┘
//!              ▲             ▲      ▲
//!            other          read   self
//! ```
//!
//! - `self`: the next frame to simulate. Frames before it have been simulated.
//! - `read`: frames before it have real remote input recorded.
//! - `other`: frames before it are confirmed. The snapshot in the `other` slot was produced
//!   from confirmed input only, so it is always a safe rollback target.
//! - `replay`: re-simulation progress while a rollback is running.
//!
//! The ring holds `sync_frames + 1` slots: the frame being simulated plus `sync_frames`
//! frames of speculation. [`DeltaFrameStore::advance_self`] refuses to reuse the `other`
//! slot; the stall controller is expected to check [`DeltaFrameStore::can_advance_self`]
//! first, so the refusal only fires on a logic error.

pub(crate) mod delta_frame;
pub mod ring_index;

pub use delta_frame::DeltaFrame;

use smallvec::SmallVec;

use crate::delta_store::ring_index::{RingCursor, RingIndex};
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{debug_check_invariants, CoreOperation, Frame, InputWords, NetplayError};

/// A frame that left the speculation window with both inputs known.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfirmedFrame {
    /// The confirmed frame.
    pub frame: Frame,
    /// Local input of that frame.
    pub local: InputWords,
    /// Remote input of that frame.
    pub remote: InputWords,
}

/// Frames confirmed by one pointer update. Usually zero or one.
pub type ConfirmedFrames = SmallVec<[ConfirmedFrame; 4]>;

/// Ring buffer of [`DeltaFrame`]s with the `other`/`read`/`self`/`replay` pointers.
///
/// # Note
///
/// Re-exported at the crate root for inspection in tests. Sessions own their store;
/// use [`Session::store`](crate::Session::store) to look at it.
#[derive(Debug)]
pub struct DeltaFrameStore {
    slots: Vec<DeltaFrame>,
    state_size: usize,
    self_cursor: RingCursor,
    read_cursor: RingCursor,
    other_cursor: RingCursor,
    replay_cursor: Option<RingCursor>,
}

impl DeltaFrameStore {
    /// Creates a store that can speculate `sync_frames` frames ahead, with every slot's blob
    /// sized to `state_size` bytes. All pointers start at frame 0.
    pub fn new(sync_frames: usize, state_size: usize) -> Result<Self, NetplayError> {
        if sync_frames == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "sync_frames must be at least 1".to_owned(),
            });
        }
        // one slot for the frame being simulated plus one per speculative frame
        let capacity = sync_frames + 1;
        let start = RingIndex::start(capacity).ok_or_else(|| NetplayError::InternalError {
            context: "ring capacity is zero".to_owned(),
        })?;
        let mut slots: Vec<DeltaFrame> = (0..capacity)
            .map(|_| DeltaFrame::new(state_size))
            .collect();
        if let Some(first) = slots.first_mut() {
            first.prepare(Frame::ZERO);
        }
        let cursor = RingCursor::new(start, Frame::ZERO);
        Ok(Self {
            slots,
            state_size,
            self_cursor: cursor,
            read_cursor: cursor,
            other_cursor: cursor,
            replay_cursor: None,
        })
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// How many frames the local side may run ahead of the last confirmed frame.
    #[must_use]
    pub fn sync_frames(&self) -> usize {
        self.slots.len() - 1
    }

    /// Size of every state blob in bytes.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// The next frame to simulate.
    #[must_use]
    pub fn self_frame(&self) -> Frame {
        self.self_cursor.frame
    }

    /// The first frame without real remote input.
    #[must_use]
    pub fn read_frame(&self) -> Frame {
        self.read_cursor.frame
    }

    /// The first unconfirmed frame.
    #[must_use]
    pub fn other_frame(&self) -> Frame {
        self.other_cursor.frame
    }

    /// The frame being re-simulated, while a replay runs.
    #[must_use]
    pub fn replay_frame(&self) -> Option<Frame> {
        self.replay_cursor.map(|c| c.frame)
    }

    /// Frames between `other` and `self`, i.e. how far the local side runs ahead.
    #[must_use]
    pub fn speculation(&self) -> usize {
        self.self_cursor.frame.distance_from(self.other_cursor.frame) as usize
    }

    /// Frames `advance_self` may still be called for before the ring is full.
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.sync_frames().saturating_sub(self.speculation())
    }

    /// Whether the slot after `self` is free, i.e. not the `other` slot.
    #[must_use]
    pub fn can_advance_self(&self) -> bool {
        self.self_cursor.slot.next() != self.other_cursor.slot
    }

    /// Whether `frame` is inside the live window `[other, self]`.
    #[must_use]
    pub fn contains(&self, frame: Frame) -> bool {
        frame.is_within(self.other_cursor.frame, self.self_cursor.frame.next())
    }

    fn cursor_for(&self, frame: Frame) -> Option<RingCursor> {
        self.contains(frame).then(|| self.other_cursor.seek(frame))
    }

    fn slot_index(&self, frame: Frame) -> Result<usize, NetplayError> {
        match self.cursor_for(frame) {
            Some(cursor) => Ok(cursor.slot.pos()),
            None => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::RingBuffer,
                    "frame {} outside live window [{}, {}]",
                    frame,
                    self.other_frame(),
                    self.self_frame()
                );
                Err(NetplayError::InvalidRequest {
                    info: format!(
                        "frame {} is outside the live window [{}, {}]",
                        frame,
                        self.other_frame(),
                        self.self_frame()
                    ),
                })
            },
        }
    }

    fn slot_mut(&mut self, frame: Frame) -> Result<&mut DeltaFrame, NetplayError> {
        let index = self.slot_index(frame)?;
        self.slots
            .get_mut(index)
            .ok_or_else(|| NetplayError::InternalError {
                context: format!("slot index {} out of bounds", index),
            })
    }

    /// The slot holding `frame`, if it is inside the live window.
    #[must_use]
    pub fn frame(&self, frame: Frame) -> Option<&DeltaFrame> {
        self.cursor_for(frame)
            .and_then(|cursor| self.slots.get(cursor.slot.pos()))
    }

    /// Reports whether `frame` has local input and real or guessed remote input.
    #[must_use]
    pub fn is_ready(&self, frame: Frame) -> bool {
        self.frame(frame).is_some_and(DeltaFrame::is_ready)
    }

    /// Prepares the slot for the frame after `self` and moves `self` onto it.
    ///
    /// Fails with [`NetplayError::BufferOverrun`] if that slot still belongs to an
    /// unconfirmed frame. Returns the new `self` frame.
    pub fn advance_self(&mut self) -> Result<Frame, NetplayError> {
        if !self.can_advance_self() {
            let frame = self.self_cursor.frame.next();
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::RingBuffer,
                "advance to frame {} would overwrite unconfirmed frame {}",
                frame,
                self.other_frame()
            );
            return Err(NetplayError::BufferOverrun { frame });
        }
        let next = self.self_cursor.next();
        if let Some(slot) = self.slots.get_mut(next.slot.pos()) {
            slot.prepare(next.frame);
        }
        self.self_cursor = next;
        self.advance_read();
        debug_check_invariants!(self, "advance_self");
        Ok(next.frame)
    }

    /// Copies `blob` into the slot of `frame`.
    pub fn capture(&mut self, frame: Frame, blob: &[u8]) -> Result<(), NetplayError> {
        if blob.len() != self.state_size {
            return Err(NetplayError::InvalidStateSize {
                expected: self.state_size,
                actual: blob.len(),
            });
        }
        self.slot_mut(frame)?.state_mut().copy_from_slice(blob);
        Ok(())
    }

    /// Lets `save` serialize directly into the slot of `frame`.
    ///
    /// `save` returning `false` is reported as [`NetplayError::CoreStateFailed`].
    pub fn capture_with<F>(&mut self, frame: Frame, save: F) -> Result<(), NetplayError>
    where
        F: FnOnce(&mut [u8]) -> bool,
    {
        if save(self.slot_mut(frame)?.state_mut()) {
            Ok(())
        } else {
            Err(NetplayError::CoreStateFailed {
                operation: CoreOperation::Save,
                frame,
            })
        }
    }

    /// The snapshot stored for `frame`. The borrow ends before the slot can be reused.
    pub fn restore(&self, frame: Frame) -> Result<&[u8], NetplayError> {
        let index = self.slot_index(frame)?;
        self.slots
            .get(index)
            .map(DeltaFrame::state)
            .ok_or_else(|| NetplayError::InternalError {
                context: format!("slot index {} out of bounds", index),
            })
    }

    /// Records the local input of `frame`.
    pub fn record_local(&mut self, frame: Frame, input: InputWords) -> Result<(), NetplayError> {
        self.slot_mut(frame)?.set_local(input);
        Ok(())
    }

    /// Records the real remote input of `frame` and moves `read` over every contiguous frame
    /// that now has remote input.
    pub fn record_remote(&mut self, frame: Frame, input: InputWords) -> Result<(), NetplayError> {
        self.slot_mut(frame)?.set_remote(input);
        self.advance_read();
        debug_check_invariants!(self, "record_remote");
        Ok(())
    }

    /// Records the guess used for the remote input of `frame`.
    pub fn record_guess(&mut self, frame: Frame, input: InputWords) -> Result<(), NetplayError> {
        self.slot_mut(frame)?.set_guess(input);
        Ok(())
    }

    /// Marks whether the last simulation of `frame` used the real remote input.
    pub fn mark_used_real(&mut self, frame: Frame, used_real: bool) -> Result<(), NetplayError> {
        self.slot_mut(frame)?.set_used_real(used_real);
        Ok(())
    }

    fn advance_read(&mut self) {
        while self.read_cursor.frame != self.self_cursor.frame {
            let have_remote = self
                .slots
                .get(self.read_cursor.slot.pos())
                .is_some_and(DeltaFrame::have_remote);
            if !have_remote {
                break;
            }
            self.read_cursor = self.read_cursor.next();
        }
    }

    fn confirm_one(&mut self, confirmed: &mut ConfirmedFrames) {
        if let Some(slot) = self.slots.get_mut(self.other_cursor.slot.pos()) {
            confirmed.push(ConfirmedFrame {
                frame: slot.frame(),
                local: slot.self_input(),
                remote: slot.real_input(),
            });
            slot.release();
        }
        self.other_cursor = self.other_cursor.next();
    }

    /// Moves `other` forward over frames before `read` while `confirmable` accepts them.
    ///
    /// Returns the frames that became confirmed, oldest first. Stops at the first frame
    /// `confirmable` rejects, which is the earliest divergent frame.
    pub fn advance_other_while<F>(&mut self, mut confirmable: F) -> ConfirmedFrames
    where
        F: FnMut(&DeltaFrame) -> bool,
    {
        let mut confirmed = ConfirmedFrames::new();
        while self.other_cursor.frame != self.read_cursor.frame {
            let accept = self
                .slots
                .get(self.other_cursor.slot.pos())
                .is_some_and(&mut confirmable);
            if !accept {
                break;
            }
            self.confirm_one(&mut confirmed);
        }
        debug_check_invariants!(self, "advance_other_while");
        confirmed
    }

    /// Moves `other` up to `read`, confirming everything in between.
    ///
    /// Only valid once every frame before `read` was simulated with its real input,
    /// i.e. right after a replay.
    pub fn confirm_through_read(&mut self) -> ConfirmedFrames {
        let mut confirmed = ConfirmedFrames::new();
        while self.other_cursor.frame != self.read_cursor.frame {
            self.confirm_one(&mut confirmed);
        }
        debug_check_invariants!(self, "confirm_through_read");
        confirmed
    }

    /// Starts re-simulation at `frame`, which must lie in `[other, self)`.
    pub fn begin_replay(&mut self, frame: Frame) -> Result<(), NetplayError> {
        if self.replay_cursor.is_some() {
            return Err(NetplayError::InternalError {
                context: "replay already in progress".to_owned(),
            });
        }
        if frame == self.self_frame() {
            return Err(NetplayError::InvalidRequest {
                info: format!("frame {} has not been simulated yet", frame),
            });
        }
        let cursor = self
            .cursor_for(frame)
            .ok_or_else(|| NetplayError::InvalidRequest {
                info: format!(
                    "replay start {} is outside the live window [{}, {}]",
                    frame,
                    self.other_frame(),
                    self.self_frame()
                ),
            })?;
        self.replay_cursor = Some(cursor);
        debug_check_invariants!(self, "begin_replay");
        Ok(())
    }

    /// Moves the replay cursor one frame forward. Returns `true` once it reached `self`.
    pub fn advance_replay(&mut self) -> Result<bool, NetplayError> {
        let cursor = self
            .replay_cursor
            .ok_or_else(|| NetplayError::InternalError {
                context: "no replay in progress".to_owned(),
            })?;
        if cursor.frame == self.self_cursor.frame {
            return Ok(true);
        }
        let next = cursor.next();
        self.replay_cursor = Some(next);
        Ok(next.frame == self.self_cursor.frame)
    }

    /// Ends the replay. Fails if the cursor has not reached `self`.
    pub fn finish_replay(&mut self) -> Result<(), NetplayError> {
        match self.replay_cursor.take() {
            Some(cursor) if cursor.frame == self.self_cursor.frame => Ok(()),
            Some(cursor) => Err(NetplayError::InternalError {
                context: format!(
                    "replay stopped at {} before reaching {}",
                    cursor.frame,
                    self.self_frame()
                ),
            }),
            None => Err(NetplayError::InternalError {
                context: "no replay in progress".to_owned(),
            }),
        }
    }
}

impl InvariantChecker for DeltaFrameStore {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let span = self.speculation();
        if span >= self.slots.len() {
            return Err(
                InvariantViolation::new("DeltaFrameStore", "self ran past the ring capacity")
                    .with_details(format!(
                        "other={}, self={}, capacity={}",
                        self.other_frame(),
                        self.self_frame(),
                        self.slots.len()
                    )),
            );
        }
        let read_span = self.read_cursor.frame.distance_from(self.other_cursor.frame) as usize;
        if read_span > span {
            return Err(
                InvariantViolation::new("DeltaFrameStore", "read outside [other, self]")
                    .with_details(format!(
                        "other={}, read={}, self={}",
                        self.other_frame(),
                        self.read_frame(),
                        self.self_frame()
                    )),
            );
        }
        if let Some(replay) = self.replay_cursor {
            if !self.contains(replay.frame) {
                return Err(
                    InvariantViolation::new("DeltaFrameStore", "replay outside [other, self]")
                        .with_details(format!("replay={}", replay.frame)),
                );
            }
        }
        for cursor in [self.read_cursor, self.self_cursor] {
            if self.other_cursor.seek(cursor.frame).slot != cursor.slot {
                return Err(InvariantViolation::new(
                    "DeltaFrameStore",
                    "pointer slot does not match its frame",
                )
                .with_details(format!("frame={}, slot={}", cursor.frame, cursor.slot.pos())));
            }
        }
        for offset in 0..=span {
            let frame = self.other_cursor.frame.add(offset as u32);
            let pos = self.other_cursor.slot.advance(offset).pos();
            match self.slots.get(pos) {
                Some(slot) if slot.used() && slot.frame() == frame => {},
                _ => {
                    return Err(InvariantViolation::new(
                        "DeltaFrameStore",
                        "live slot holds the wrong frame",
                    )
                    .with_details(format!("expected frame {} in slot {}", frame, pos)));
                },
            }
        }
        for offset in 0..read_span {
            let pos = self.other_cursor.slot.advance(offset).pos();
            if !self.slots.get(pos).is_some_and(DeltaFrame::have_remote) {
                return Err(InvariantViolation::new(
                    "DeltaFrameStore",
                    "frame before read lacks remote input",
                ));
            }
        }
        Ok(())
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

    fn words(value: u32) -> InputWords {
        InputWords::new([value, 0, 0])
    }

    fn blob(store: &DeltaFrameStore, fill: u8) -> Vec<u8> {
        vec![fill; store.state_size()]
    }

    /// Simulates `frame` the way a session does: capture, inputs, advance.
    fn step(store: &mut DeltaFrameStore, local: u32, guess: u32) {
        let frame = store.self_frame();
        let state = blob(store, frame.as_u32() as u8);
        store.capture(frame, &state).unwrap();
        store.record_local(frame, words(local)).unwrap();
        store.record_guess(frame, words(guess)).unwrap();
        store.advance_self().unwrap();
    }

    #[test]
    fn new_allocates_sync_frames_plus_one_slots() {
        let store = DeltaFrameStore::new(8, 4).unwrap();
        assert_eq!(store.capacity(), 9);
        assert_eq!(store.sync_frames(), 8);
        assert_eq!(store.self_frame(), Frame::ZERO);
        assert_eq!(store.headroom(), 8);
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn zero_sync_frames_is_rejected() {
        assert!(matches!(
            DeltaFrameStore::new(0, 4),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn advance_self_stops_before_other_slot() {
        let mut store = DeltaFrameStore::new(8, 2).unwrap();
        for _ in 0..8 {
            assert!(store.can_advance_self());
            step(&mut store, 1, 0);
        }
        assert_eq!(store.self_frame(), Frame::new(8));
        assert!(!store.can_advance_self());
        assert_eq!(store.headroom(), 0);
        let err = store.advance_self().unwrap_err();
        assert_eq!(
            err,
            NetplayError::BufferOverrun {
                frame: Frame::new(9)
            }
        );
        // rejected advance leaves the ring untouched
        assert_eq!(store.self_frame(), Frame::new(8));
        assert_eq!(store.frame(Frame::ZERO).unwrap().state(), &[0, 0]);
    }

    #[test]
    fn capture_rejects_wrong_size() {
        let mut store = DeltaFrameStore::new(2, 4).unwrap();
        let err = store.capture(Frame::ZERO, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            NetplayError::InvalidStateSize {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn capture_and_restore_round_trip_in_place() {
        let mut store = DeltaFrameStore::new(2, 3).unwrap();
        store.capture(Frame::ZERO, &[1, 2, 3]).unwrap();
        assert_eq!(store.restore(Frame::ZERO).unwrap(), &[1, 2, 3]);
        store
            .capture_with(Frame::ZERO, |buf| {
                buf.copy_from_slice(&[4, 5, 6]);
                true
            })
            .unwrap();
        assert_eq!(store.restore(Frame::ZERO).unwrap(), &[4, 5, 6]);
    }

    #[test]
    fn failing_save_is_reported() {
        let mut store = DeltaFrameStore::new(2, 3).unwrap();
        let err = store.capture_with(Frame::ZERO, |_| false).unwrap_err();
        assert_eq!(
            err,
            NetplayError::CoreStateFailed {
                operation: CoreOperation::Save,
                frame: Frame::ZERO
            }
        );
    }

    #[test]
    fn restore_outside_window_fails() {
        let mut store = DeltaFrameStore::new(2, 1).unwrap();
        step(&mut store, 0, 0);
        assert!(store.restore(Frame::new(5)).is_err());
        store.record_remote(Frame::ZERO, words(0)).unwrap();
        let confirmed = store.advance_other_while(DeltaFrame::is_confirmable);
        assert_eq!(confirmed.len(), 1);
        // frame 0 left the window
        assert!(store.restore(Frame::ZERO).is_err());
        assert!(store.frame(Frame::ZERO).is_none());
    }

    #[test]
    fn read_advances_only_over_contiguous_remote_input() {
        let mut store = DeltaFrameStore::new(8, 1).unwrap();
        for _ in 0..4 {
            step(&mut store, 0, 0);
        }
        store.record_remote(Frame::new(1), words(1)).unwrap();
        assert_eq!(store.read_frame(), Frame::ZERO);
        store.record_remote(Frame::ZERO, words(0)).unwrap();
        assert_eq!(store.read_frame(), Frame::new(2));
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn read_never_passes_self() {
        let mut store = DeltaFrameStore::new(4, 1).unwrap();
        store.record_remote(Frame::ZERO, words(3)).unwrap();
        assert_eq!(store.read_frame(), Frame::ZERO);
        step(&mut store, 0, 0);
        assert_eq!(store.read_frame(), Frame::new(1));
        assert_eq!(store.self_frame(), Frame::new(1));
    }

    #[test]
    fn other_stops_at_first_divergent_frame() {
        let mut store = DeltaFrameStore::new(8, 1).unwrap();
        for _ in 0..4 {
            step(&mut store, 0, 7);
        }
        store.record_remote(Frame::new(0), words(7)).unwrap();
        store.record_remote(Frame::new(1), words(7)).unwrap();
        store.record_remote(Frame::new(2), words(3)).unwrap();
        let confirmed = store.advance_other_while(DeltaFrame::is_confirmable);
        assert_eq!(confirmed.len(), 2);
        assert_eq!(confirmed[1].frame, Frame::new(1));
        assert_eq!(confirmed[1].remote, words(7));
        assert_eq!(store.other_frame(), Frame::new(2));
    }

    #[test]
    fn replay_walks_from_start_to_self() {
        let mut store = DeltaFrameStore::new(8, 1).unwrap();
        for _ in 0..3 {
            step(&mut store, 0, 0);
        }
        store.begin_replay(Frame::new(1)).unwrap();
        assert_eq!(store.replay_frame(), Some(Frame::new(1)));
        assert!(store.finish_replay().is_err());
        store.begin_replay(Frame::new(1)).unwrap();
        assert!(!store.advance_replay().unwrap());
        assert!(store.advance_replay().unwrap());
        store.finish_replay().unwrap();
        assert_eq!(store.replay_frame(), None);
    }

    #[test]
    fn replay_cannot_start_at_unsimulated_frame() {
        let mut store = DeltaFrameStore::new(8, 1).unwrap();
        step(&mut store, 0, 0);
        assert!(store.begin_replay(Frame::new(1)).is_err());
        assert!(store.begin_replay(Frame::new(4)).is_err());
    }

    #[test]
    fn confirm_through_read_releases_slots() {
        let mut store = DeltaFrameStore::new(3, 1).unwrap();
        for _ in 0..3 {
            step(&mut store, 0, 0);
        }
        for frame in 0..3 {
            store.record_remote(Frame::new(frame), words(1)).unwrap();
        }
        let confirmed = store.confirm_through_read();
        assert_eq!(confirmed.len(), 3);
        assert_eq!(store.other_frame(), Frame::new(3));
        assert_eq!(store.headroom(), 3);
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn pointers_survive_many_ring_wraps() {
        let mut store = DeltaFrameStore::new(2, 1).unwrap();
        // walk far enough to wrap slot positions many times
        for _ in 0..50 {
            let frame = store.self_frame();
            step(&mut store, 1, 1);
            store.record_remote(frame, words(1)).unwrap();
            store.advance_other_while(DeltaFrame::is_confirmable);
        }
        assert_eq!(store.other_frame(), Frame::new(50));
        assert!(store.check_invariants().is_ok());
    }
}
