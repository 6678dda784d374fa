//! Backpressure: holds the local side back when the ring has no free slot.

use tracing::{debug, warn};
use web_time::Instant;

use crate::{Duration, Frame, NetplayError};

/// Why the session is not allowed to advance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum StallReason {
    /// Not stalled.
    #[default]
    None,
    /// The local side is `sync_frames` ahead of the last confirmed frame; advancing would
    /// overwrite an unconfirmed snapshot.
    RunningFast,
}

/// What one stall poll decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StallUpdate {
    /// The session may advance and was not stalled.
    Clear,
    /// The session just stalled.
    Entered(StallReason),
    /// The session is still stalled.
    Stalled(StallReason),
    /// The stall cleared on this poll; the session may advance.
    Exited {
        /// Polls counted while stalled.
        polls: u32,
        /// Wall time spent stalled.
        duration: Duration,
    },
}

/// Stall state machine.
///
/// Polled once per [`Session::advance_frame`](crate::Session::advance_frame) with the
/// store's headroom. Every poll that finds the ring still full counts towards the timeout,
/// unless the caller says the session is halted at a pause.
#[derive(Debug, Clone)]
pub struct StallController {
    reason: StallReason,
    polls: u32,
    since: Option<Instant>,
    stalled_at: Frame,
    max_polls: u32,
}

impl StallController {
    /// A controller that times out after `max_polls` counted polls.
    #[must_use]
    pub fn new(max_polls: u32) -> Self {
        Self {
            reason: StallReason::None,
            polls: 0,
            since: None,
            stalled_at: Frame::ZERO,
            max_polls,
        }
    }

    /// The current reason, [`StallReason::None`] when running.
    #[must_use]
    pub fn reason(&self) -> StallReason {
        self.reason
    }

    /// Whether the session is stalled.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.reason != StallReason::None
    }

    /// Counted polls of the current stall.
    #[must_use]
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Feeds one poll.
    ///
    /// `can_advance` is the store's headroom check, `frame` the frame the session wants to
    /// simulate. When `counting` is false the poll does not count towards the timeout.
    ///
    /// # Errors
    ///
    /// [`NetplayError::RemoteTimeout`] once more than `max_polls` polls were counted.
    pub fn poll(
        &mut self,
        can_advance: bool,
        frame: Frame,
        counting: bool,
    ) -> Result<StallUpdate, NetplayError> {
        if can_advance {
            if self.reason == StallReason::None {
                return Ok(StallUpdate::Clear);
            }
            let duration = self.since.map(|since| since.elapsed()).unwrap_or_default();
            let polls = self.polls;
            debug!(
                "stall at frame {} cleared after {} polls ({:?})",
                self.stalled_at, polls, duration
            );
            self.reason = StallReason::None;
            self.polls = 0;
            self.since = None;
            return Ok(StallUpdate::Exited { polls, duration });
        }

        if self.reason == StallReason::None {
            self.reason = StallReason::RunningFast;
            self.polls = 0;
            self.since = Some(Instant::now());
            self.stalled_at = frame;
            debug!("stalled before frame {}: running fast", frame);
            return Ok(StallUpdate::Entered(self.reason));
        }

        if counting {
            self.polls += 1;
        }
        if self.polls > self.max_polls {
            warn!(
                "remote confirmed nothing for {} polls, giving up at frame {}",
                self.polls, frame
            );
            return Err(NetplayError::RemoteTimeout {
                stalled_polls: self.polls,
            });
        }
        Ok(StallUpdate::Stalled(self.reason))
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
    fn headroom_keeps_controller_clear() {
        let mut stall = StallController::new(10);
        for frame in 0..5 {
            assert_eq!(
                stall.poll(true, Frame::new(frame), true).unwrap(),
                StallUpdate::Clear
            );
        }
        assert!(!stall.is_stalled());
    }

    #[test]
    fn full_ring_enters_running_fast_once() {
        let mut stall = StallController::new(10);
        assert_eq!(
            stall.poll(false, Frame::new(8), true).unwrap(),
            StallUpdate::Entered(StallReason::RunningFast)
        );
        assert_eq!(
            stall.poll(false, Frame::new(8), true).unwrap(),
            StallUpdate::Stalled(StallReason::RunningFast)
        );
        assert_eq!(stall.reason(), StallReason::RunningFast);
        assert_eq!(stall.polls(), 1);
    }

    #[test]
    fn exit_reports_counted_polls() {
        let mut stall = StallController::new(10);
        stall.poll(false, Frame::new(8), true).unwrap();
        for _ in 0..3 {
            stall.poll(false, Frame::new(8), true).unwrap();
        }
        match stall.poll(true, Frame::new(8), true).unwrap() {
            StallUpdate::Exited { polls, .. } => assert_eq!(polls, 3),
            other => panic!("expected exit, got {:?}", other),
        }
        assert_eq!(stall.reason(), StallReason::None);
        assert_eq!(stall.polls(), 0);
    }

    #[test]
    fn timeout_after_max_polls() {
        let mut stall = StallController::new(3);
        stall.poll(false, Frame::new(8), true).unwrap();
        for _ in 0..3 {
            stall.poll(false, Frame::new(8), true).unwrap();
        }
        assert_eq!(
            stall.poll(false, Frame::new(8), true).unwrap_err(),
            NetplayError::RemoteTimeout { stalled_polls: 4 }
        );
    }

    #[test]
    fn uncounted_polls_never_time_out() {
        let mut stall = StallController::new(2);
        stall.poll(false, Frame::new(8), true).unwrap();
        for _ in 0..100 {
            stall.poll(false, Frame::new(8), false).unwrap();
        }
        assert_eq!(stall.polls(), 0);
    }
}
