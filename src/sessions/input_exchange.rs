//! Acceptance of the remote's per-frame input.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::delta_store::DeltaFrameStore;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, InputWords, NetplayError};

/// What happened to one received input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RemoteInputOutcome {
    /// Written into the slot of a frame we already simulated.
    Recorded,
    /// Held until we simulate that frame.
    Queued,
    /// A repeat of the previous frame, dropped.
    Duplicate,
}

/// Tracks the remote's input stream.
///
/// The remote must send every frame exactly once and in order. The frame after the last
/// accepted one is taken; a repeat of the last one is tolerated and dropped; anything else
/// is a protocol violation.
///
/// Input for frames we have not simulated yet waits in a backlog bounded by the ring
/// depth: the remote cannot legitimately be further ahead than that.
pub struct InputExchange {
    next_remote: Frame,
    received_any: bool,
    backlog: VecDeque<(Frame, InputWords)>,
    max_backlog: usize,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for InputExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            next_remote,
            received_any,
            backlog,
            max_backlog,
            observer,
        } = self;

        f.debug_struct("InputExchange")
            .field("next_remote", next_remote)
            .field("received_any", received_any)
            .field("backlog", backlog)
            .field("max_backlog", max_backlog)
            .field("has_observer", &observer.is_some())
            .finish()
    }
}

impl InputExchange {
    /// Expects remote input from frame 0 on, holding at most `max_backlog` frames ahead.
    pub fn new(max_backlog: usize, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        Self {
            next_remote: Frame::ZERO,
            received_any: false,
            backlog: VecDeque::with_capacity(max_backlog),
            max_backlog,
            observer,
        }
    }

    /// The frame the next remote input must describe.
    #[must_use]
    pub fn next_expected(&self) -> Frame {
        self.next_remote
    }

    /// Inputs waiting for us to simulate their frames.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// The remote is ahead of us; the frontend should catch up without presenting.
    #[must_use]
    pub fn must_fast_forward(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Accepts the remote's input for `frame`.
    ///
    /// # Errors
    ///
    /// [`NetplayError::ProtocolViolation`] on a regression, a gap, or a backlog overflow.
    pub fn accept(
        &mut self,
        store: &mut DeltaFrameStore,
        frame: Frame,
        words: InputWords,
    ) -> Result<RemoteInputOutcome, NetplayError> {
        if frame == self.next_remote {
            let outcome = if frame.is_before(store.self_frame()) {
                store.record_remote(frame, words)?;
                RemoteInputOutcome::Recorded
            } else {
                if self.backlog.len() >= self.max_backlog {
                    return Err(NetplayError::ProtocolViolation {
                        context: format!(
                            "remote input for frame {} is more than {} frames ahead of frame {}",
                            frame,
                            self.max_backlog,
                            store.self_frame()
                        ),
                    });
                }
                self.backlog.push_back((frame, words));
                RemoteInputOutcome::Queued
            };
            trace!("remote input for frame {}: {:?}", frame, outcome);
            self.next_remote = frame.next();
            self.received_any = true;
            return Ok(outcome);
        }

        if self.received_any && frame == self.next_remote.prev() {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::InputSync,
                "dropped duplicate remote input for frame {}",
                frame
            );
            return Ok(RemoteInputOutcome::Duplicate);
        }

        let context = if frame.is_before(self.next_remote) {
            format!(
                "remote input went back to frame {} after frame {}",
                frame,
                self.next_remote.prev()
            )
        } else {
            format!(
                "remote input skipped from frame {} to frame {}",
                self.next_remote, frame
            )
        };
        report_violation_to!(
            &self.observer,
            ViolationSeverity::Error,
            ViolationKind::InputSync,
            "{}",
            context
        );
        Err(NetplayError::ProtocolViolation { context })
    }

    /// Removes the queued input for `frame`, if the remote already sent it.
    pub fn take_for(&mut self, frame: Frame) -> Option<InputWords> {
        match self.backlog.front() {
            Some(&(queued, words)) if queued == frame => {
                self.backlog.pop_front();
                Some(words)
            },
            _ => None,
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

    fn words(value: u32) -> InputWords {
        InputWords::new([value, 0, 0])
    }

    fn simulated_store(frames: u32) -> DeltaFrameStore {
        let mut store = DeltaFrameStore::new(8, 1).unwrap();
        for _ in 0..frames {
            let frame = store.self_frame();
            store.record_local(frame, words(0)).unwrap();
            store.record_guess(frame, words(0)).unwrap();
            store.advance_self().unwrap();
        }
        store
    }

    #[test]
    fn input_for_simulated_frame_is_recorded() {
        let mut store = simulated_store(3);
        let mut exchange = InputExchange::new(8, None);
        assert_eq!(
            exchange.accept(&mut store, Frame::ZERO, words(4)).unwrap(),
            RemoteInputOutcome::Recorded
        );
        assert_eq!(store.read_frame(), Frame::new(1));
        assert_eq!(store.frame(Frame::ZERO).unwrap().real_input(), words(4));
        assert!(!exchange.must_fast_forward());
    }

    #[test]
    fn input_ahead_of_self_is_queued() {
        let mut store = simulated_store(1);
        let mut exchange = InputExchange::new(8, None);
        exchange.accept(&mut store, Frame::ZERO, words(1)).unwrap();
        assert_eq!(
            exchange.accept(&mut store, Frame::new(1), words(2)).unwrap(),
            RemoteInputOutcome::Queued
        );
        assert!(exchange.must_fast_forward());
        assert_eq!(exchange.take_for(Frame::new(2)), None);
        assert_eq!(exchange.take_for(Frame::new(1)), Some(words(2)));
        assert!(!exchange.must_fast_forward());
    }

    #[test]
    fn duplicate_is_dropped() {
        let mut store = simulated_store(2);
        let mut exchange = InputExchange::new(8, None);
        exchange.accept(&mut store, Frame::ZERO, words(1)).unwrap();
        assert_eq!(
            exchange.accept(&mut store, Frame::ZERO, words(1)).unwrap(),
            RemoteInputOutcome::Duplicate
        );
        assert_eq!(exchange.next_expected(), Frame::new(1));
    }

    #[test]
    fn regression_is_a_violation() {
        let mut store = simulated_store(4);
        let mut exchange = InputExchange::new(8, None);
        for frame in 0..3 {
            exchange
                .accept(&mut store, Frame::new(frame), words(0))
                .unwrap();
        }
        assert!(matches!(
            exchange.accept(&mut store, Frame::ZERO, words(0)),
            Err(NetplayError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn gap_is_a_violation() {
        let mut store = simulated_store(4);
        let mut exchange = InputExchange::new(8, None);
        assert!(matches!(
            exchange.accept(&mut store, Frame::new(2), words(0)),
            Err(NetplayError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn backlog_is_bounded() {
        let mut store = simulated_store(0);
        let mut exchange = InputExchange::new(2, None);
        exchange.accept(&mut store, Frame::new(0), words(0)).unwrap();
        exchange.accept(&mut store, Frame::new(1), words(0)).unwrap();
        assert!(exchange.accept(&mut store, Frame::new(2), words(0)).is_err());
    }
}
