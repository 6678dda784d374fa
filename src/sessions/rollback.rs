//! Misprediction detection and re-simulation.
//!
//! Every advance starts with [`RollbackEngine::reconcile`]: frames whose remote input is
//! now known are either confirmed (the guess was right, or the frame already ran with the
//! real input) or, at the first wrong guess, the store is rewound and every frame up to
//! `self` is simulated again.

use tracing::debug;

use crate::delta_store::{ConfirmedFrames, DeltaFrame, DeltaFrameStore};
use crate::{CoreOperation, CoreState, Frame, FrameInputs, InputWords, NetplayError};

/// Rollback state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum RollbackState {
    /// Simulating new frames.
    #[default]
    Normal,
    /// Re-simulating from `from` up to `self`.
    Replaying {
        /// The first re-simulated frame.
        from: Frame,
    },
}

/// What one reconciliation did.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Frames that became confirmed, oldest first.
    pub confirmed: ConfirmedFrames,
    /// The re-simulated range `[from, to)`, if a rollback happened.
    pub replayed: Option<(Frame, Frame)>,
}

/// Drives [`RollbackState`] against a [`DeltaFrameStore`].
#[derive(Debug, Default)]
pub struct RollbackEngine {
    state: RollbackState,
    forced: Option<Frame>,
    rollbacks: u64,
    replayed_frames: u64,
}

impl RollbackEngine {
    /// A new engine in [`RollbackState::Normal`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state. Always `Normal` between calls, since a replay completes inside
    /// one [`reconcile`](Self::reconcile).
    #[must_use]
    pub fn state(&self) -> RollbackState {
        self.state
    }

    /// Rollbacks performed so far.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks
    }

    /// Frames re-simulated so far.
    #[must_use]
    pub fn replayed_frames(&self) -> u64 {
        self.replayed_frames
    }

    /// Requests a rewind to `frame` on the next reconcile even if every guess was right.
    ///
    /// Used when the port mapping of already simulated frames changed. The earliest request
    /// wins.
    pub fn force_from(&mut self, frame: Frame) {
        self.forced = Some(match self.forced {
            Some(current) if current.is_before(frame) => current,
            _ => frame,
        });
    }

    /// A rewind requested with [`force_from`](Self::force_from) that has not run yet.
    #[must_use]
    pub fn forced(&self) -> Option<Frame> {
        self.forced
    }

    /// Confirms correctly predicted frames and re-simulates from the earliest divergent one.
    ///
    /// `ports` maps a frame and its local and remote input to the per-port inputs.
    pub fn reconcile<C, M>(
        &mut self,
        store: &mut DeltaFrameStore,
        core: &mut C,
        mut ports: M,
    ) -> Result<Reconciliation, NetplayError>
    where
        C: CoreState + ?Sized,
        M: FnMut(Frame, InputWords, InputWords) -> [InputWords; 2],
    {
        let self_frame = store.self_frame();
        let forced = self.forced.filter(|frame| frame.is_before(self_frame));
        if self.forced.is_some() && forced.is_none() {
            // the requested frame has not been simulated, nothing to redo
            self.forced = None;
        }

        let mut result = Reconciliation {
            confirmed: store.advance_other_while(|slot| {
                DeltaFrame::is_confirmable(slot) && Some(slot.frame()) != forced
            }),
            replayed: None,
        };

        let divergent = if store.other_frame().is_before(store.read_frame()) {
            Some(store.other_frame())
        } else {
            forced
        };
        let Some(from) = divergent else {
            return Ok(result);
        };

        self.replay(store, core, from, &mut ports)?;
        self.forced = None;
        result.confirmed.extend(store.confirm_through_read());
        result.replayed = Some((from, self_frame));
        Ok(result)
    }

    fn replay<C, M>(
        &mut self,
        store: &mut DeltaFrameStore,
        core: &mut C,
        from: Frame,
        ports: &mut M,
    ) -> Result<(), NetplayError>
    where
        C: CoreState + ?Sized,
        M: FnMut(Frame, InputWords, InputWords) -> [InputWords; 2],
    {
        if !core.load_state(store.restore(from)?) {
            return Err(NetplayError::CoreStateFailed {
                operation: CoreOperation::Load,
                frame: from,
            });
        }
        store.begin_replay(from)?;
        self.state = RollbackState::Replaying { from };
        debug!("rolling back to frame {} (self {})", from, store.self_frame());

        let mut frame = from;
        loop {
            if frame != from {
                store.capture_with(frame, |buf| core.save_state(buf))?;
            }
            let (local, remote, have_remote) = match store.frame(frame) {
                Some(slot) => (slot.self_input(), slot.effective_remote(), slot.have_remote()),
                None => {
                    return Err(NetplayError::InternalError {
                        context: format!("replay frame {} left the live window", frame),
                    });
                },
            };
            store.mark_used_real(frame, have_remote)?;
            core.run_frame(&FrameInputs {
                frame,
                ports: ports(frame, local, remote),
                replay: true,
            });
            self.replayed_frames += 1;
            frame = frame.next();
            if store.advance_replay()? {
                break;
            }
        }

        store.finish_replay()?;
        self.state = RollbackState::Normal;
        self.rollbacks += 1;
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

    /// Order-sensitive accumulator, so any replayed frame with the wrong input shows.
    struct Fold(u64, u32);

    impl CoreState for Fold {
        fn state_size(&self) -> usize {
            12
        }
        fn save_state(&self, buf: &mut [u8]) -> bool {
            buf[..8].copy_from_slice(&self.0.to_le_bytes());
            buf[8..].copy_from_slice(&self.1.to_le_bytes());
            true
        }
        fn load_state(&mut self, buf: &[u8]) -> bool {
            self.0 = u64::from_le_bytes(buf[..8].try_into().unwrap());
            self.1 = u32::from_le_bytes(buf[8..].try_into().unwrap());
            true
        }
        fn run_frame(&mut self, inputs: &FrameInputs) {
            let a = u64::from(inputs.port(0).word(0));
            let b = u64::from(inputs.port(1).word(0));
            self.0 = self.0.wrapping_mul(1_000_003).wrapping_add(a * 31 + b);
            self.1 += 1;
        }
    }

    fn words(value: u32) -> InputWords {
        InputWords::new([value, 0, 0])
    }

    fn home_ports(_: Frame, local: InputWords, remote: InputWords) -> [InputWords; 2] {
        [local, remote]
    }

    /// Simulates one new frame the way a session does.
    fn simulate(store: &mut DeltaFrameStore, core: &mut Fold, local: u32, guess: u32) {
        let frame = store.self_frame();
        store.capture_with(frame, |buf| core.save_state(buf)).unwrap();
        store.record_local(frame, words(local)).unwrap();
        store.record_guess(frame, words(guess)).unwrap();
        store.mark_used_real(frame, false).unwrap();
        core.run_frame(&FrameInputs {
            frame,
            ports: [words(local), words(guess)],
            replay: false,
        });
        store.advance_self().unwrap();
    }

    fn direct(remote: &[u32]) -> Fold {
        let mut core = Fold(0, 0);
        for (frame, &r) in remote.iter().enumerate() {
            core.run_frame(&FrameInputs {
                frame: Frame::new(frame as u32),
                ports: [words(1), words(r)],
                replay: false,
            });
        }
        core
    }

    #[test]
    fn correct_guesses_never_replay() {
        let mut store = DeltaFrameStore::new(8, 12).unwrap();
        let mut core = Fold(0, 0);
        let mut engine = RollbackEngine::new();
        for frame in 0..10 {
            simulate(&mut store, &mut core, 1, 0);
            store.record_remote(Frame::new(frame), words(0)).unwrap();
            let result = engine.reconcile(&mut store, &mut core, home_ports).unwrap();
            assert!(result.replayed.is_none());
            assert_eq!(result.confirmed.len(), 1);
        }
        assert_eq!(engine.rollbacks(), 0);
        assert_eq!(engine.state(), RollbackState::Normal);
    }

    #[test]
    fn mismatch_at_frame_five_replays_five_through_nine() {
        let mut store = DeltaFrameStore::new(16, 12).unwrap();
        let mut core = Fold(0, 0);
        let mut engine = RollbackEngine::new();
        for _ in 0..10 {
            simulate(&mut store, &mut core, 1, 0);
        }
        assert_eq!(store.self_frame(), Frame::new(10));
        let mut remote = vec![0u32; 10];
        remote[5] = 7;
        for (frame, &r) in remote.iter().enumerate().take(6) {
            store.record_remote(Frame::new(frame as u32), words(r)).unwrap();
        }

        let result = engine.reconcile(&mut store, &mut core, home_ports).unwrap();
        assert_eq!(result.replayed, Some((Frame::new(5), Frame::new(10))));
        assert_eq!(engine.replayed_frames(), 5);
        assert_eq!(store.other_frame(), Frame::new(6));
        assert_eq!(result.confirmed.len(), 6);
        assert_eq!(core.0, direct(&remote).0);
        assert_eq!(core.1, 10);
    }

    #[test]
    fn earliest_divergence_wins() {
        let mut store = DeltaFrameStore::new(8, 12).unwrap();
        let mut core = Fold(0, 0);
        let mut engine = RollbackEngine::new();
        for _ in 0..6 {
            simulate(&mut store, &mut core, 1, 0);
        }
        let remote = [0, 3, 0, 4, 0, 0];
        for (frame, &r) in remote.iter().enumerate() {
            store.record_remote(Frame::new(frame as u32), words(r)).unwrap();
        }
        let result = engine.reconcile(&mut store, &mut core, home_ports).unwrap();
        assert_eq!(result.replayed, Some((Frame::new(1), Frame::new(6))));
        assert_eq!(engine.rollbacks(), 1);
        assert_eq!(store.other_frame(), Frame::new(6));
        assert_eq!(core.0, direct(&remote).0);
    }

    #[test]
    fn forced_rewind_replays_with_new_mapping() {
        let mut store = DeltaFrameStore::new(8, 12).unwrap();
        let mut core = Fold(0, 0);
        let mut engine = RollbackEngine::new();
        for _ in 0..4 {
            simulate(&mut store, &mut core, 1, 0);
        }
        engine.force_from(Frame::new(2));
        let swap_from_two = |frame: Frame, local: InputWords, remote: InputWords| {
            if frame.is_before(Frame::new(2)) {
                [local, remote]
            } else {
                [remote, local]
            }
        };
        let result = engine.reconcile(&mut store, &mut core, swap_from_two).unwrap();
        assert_eq!(result.replayed, Some((Frame::new(2), Frame::new(4))));
        assert!(result.confirmed.is_empty());
        assert_eq!(engine.forced(), None);

        let mut expected = Fold(0, 0);
        for frame in 0..4 {
            let ports = swap_from_two(Frame::new(frame), words(1), words(0));
            expected.run_frame(&FrameInputs {
                frame: Frame::new(frame),
                ports,
                replay: false,
            });
        }
        assert_eq!(core.0, expected.0);
    }

    #[test]
    fn forced_frame_in_future_is_dropped() {
        let mut store = DeltaFrameStore::new(8, 12).unwrap();
        let mut core = Fold(0, 0);
        let mut engine = RollbackEngine::new();
        simulate(&mut store, &mut core, 1, 0);
        engine.force_from(Frame::new(1));
        let result = engine.reconcile(&mut store, &mut core, home_ports).unwrap();
        assert!(result.replayed.is_none());
        assert_eq!(engine.forced(), None);
    }
}
