//! Frame-indexed agreements between the two players: port flips and pauses.
//!
//! Both are scheduled for a frame both sides have not simulated yet, so each side applies
//! them at the same logical frame regardless of how far apart their clocks are.

use smallvec::SmallVec;
use tracing::debug;

use crate::{Frame, NetplayError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct FlipPoint {
    frame: Frame,
    flipped: bool,
    announced: bool,
}

/// Which player drives which port, per frame.
///
/// Flips that the confirmed frame has not passed yet are kept, so a rollback into frames
/// before a flip re-simulates them with the mapping they originally had.
#[derive(Debug, Clone, Default)]
pub struct FlipSchedule {
    base: bool,
    points: SmallVec<[FlipPoint; 2]>,
}

impl FlipSchedule {
    /// No flips, ports in their home positions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether ports are swapped while simulating `frame`.
    #[must_use]
    pub fn flipped_at(&self, frame: Frame) -> bool {
        self.points
            .iter()
            .rev()
            .find(|point| !frame.is_before(point.frame))
            .map_or(self.base, |point| point.flipped)
    }

    /// The most recent flip frame not yet passed by the confirmed frame.
    #[must_use]
    pub fn pending_frame(&self) -> Option<Frame> {
        self.points.last().map(|point| point.frame)
    }

    /// Drops flips strictly before `other`; frames before it are never simulated again.
    pub fn settle(&mut self, other: Frame) {
        while let Some(first) = self.points.first().copied() {
            if !first.frame.is_before(other) {
                break;
            }
            self.base = first.flipped;
            self.points.remove(0);
        }
    }

    /// Schedules a local flip at `frame`, the first frame whose input is unsent.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] while an earlier flip is not confirmed yet.
    pub fn request(&mut self, frame: Frame, other: Frame) -> Result<bool, NetplayError> {
        self.settle(other);
        if let Some(pending) = self.pending_frame() {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "flip at frame {} is not confirmed yet (confirmed up to {})",
                    pending, other
                ),
            });
        }
        Ok(self.push(frame))
    }

    /// Records a flip the remote scheduled at `frame`.
    ///
    /// # Errors
    ///
    /// [`NetplayError::ProtocolViolation`] if `frame` is before `other` or before a
    /// flip already scheduled.
    pub fn apply_remote(&mut self, frame: Frame, other: Frame) -> Result<bool, NetplayError> {
        self.settle(other);
        let stale = frame.is_before(other)
            || self
                .pending_frame()
                .is_some_and(|pending| !pending.is_before(frame));
        if stale {
            return Err(NetplayError::ProtocolViolation {
                context: format!(
                    "flip for frame {} arrived after confirmed frame {}",
                    frame, other
                ),
            });
        }
        Ok(self.push(frame))
    }

    fn push(&mut self, frame: Frame) -> bool {
        let flipped = !self.flipped_at(frame);
        self.points.push(FlipPoint {
            frame,
            flipped,
            announced: false,
        });
        debug!("flip scheduled at frame {} (flipped: {})", frame, flipped);
        flipped
    }

    /// Marks flips in `[from, to)` as applied and returns the ones applied for the first time.
    pub fn announce(&mut self, from: Frame, to: Frame) -> SmallVec<[(Frame, bool); 1]> {
        let mut applied = SmallVec::new();
        for point in &mut self.points {
            if !point.announced && point.frame.is_within(from, to) {
                point.announced = true;
                applied.push((point.frame, point.flipped));
            }
        }
        applied
    }
}

/// Pause agreement between both players.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum PauseSchedule {
    /// No pause requested.
    #[default]
    Running,
    /// Both sides halt before simulating this frame.
    Scheduled(Frame),
    /// Halted before this frame.
    Paused(Frame),
}

impl PauseSchedule {
    /// The first frame a local pause request may target when the local side is at `self_frame`.
    ///
    /// The remote can be at most `sync_frames` frames ahead of anything we have sent, so
    /// this frame is in the future for both sides.
    #[must_use]
    pub fn earliest_frame(self_frame: Frame, sync_frames: usize) -> Frame {
        self_frame.add(sync_frames as u32 + 1)
    }

    /// Records a pause request for `frame`. Concurrent requests resolve to the earlier frame.
    ///
    /// Returns the frame the pause is now scheduled for.
    pub fn schedule(&mut self, frame: Frame) -> Frame {
        match *self {
            PauseSchedule::Running => {
                *self = PauseSchedule::Scheduled(frame);
                frame
            },
            PauseSchedule::Scheduled(current) => {
                let target = if frame.is_before(current) {
                    frame
                } else {
                    current
                };
                *self = PauseSchedule::Scheduled(target);
                target
            },
            // already halted, the frame can no longer move
            PauseSchedule::Paused(current) => current,
        }
    }

    /// Enters [`PauseSchedule::Paused`] if `self_frame` is the scheduled frame.
    ///
    /// Returns `true` on the transition only.
    pub fn reach(&mut self, self_frame: Frame) -> bool {
        match *self {
            PauseSchedule::Scheduled(frame) if frame == self_frame => {
                *self = PauseSchedule::Paused(frame);
                true
            },
            _ => false,
        }
    }

    /// Clears any pause. Returns `true` if a pause was scheduled or active.
    pub fn resume(&mut self) -> bool {
        let was_set = *self != PauseSchedule::Running;
        *self = PauseSchedule::Running;
        was_set
    }

    /// Halted right now.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self, PauseSchedule::Paused(_))
    }

    /// The frame of a scheduled or active pause.
    #[must_use]
    pub fn frame(&self) -> Option<Frame> {
        match *self {
            PauseSchedule::Running => None,
            PauseSchedule::Scheduled(frame) | PauseSchedule::Paused(frame) => Some(frame),
        }
    }
}

/// The [`PauseSchedule`] plus the number of pauses the two players have ended.
///
/// `Pause` and `Resume` messages carry the epoch they belong to. A resume closes its epoch
/// on both sides, so a pause request that crossed a resume on the wire was already merged
/// into the pause that ended and is ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PauseAgreement {
    schedule: PauseSchedule,
    epoch: u32,
}

impl PauseAgreement {
    /// Running, no pause ended yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the current pause stands.
    #[must_use]
    pub fn schedule(&self) -> PauseSchedule {
        self.schedule
    }

    /// Pauses ended so far. Requests are tagged with it.
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Records a local request for `frame`; returns the agreed frame.
    pub fn request(&mut self, frame: Frame) -> Frame {
        self.schedule.schedule(frame)
    }

    /// Records the remote's request for `frame` made in `epoch`, with the local side at
    /// `self_frame`.
    ///
    /// Returns the agreed frame, or `None` for a request whose pause already ended here.
    ///
    /// # Errors
    ///
    /// [`NetplayError::ProtocolViolation`] for a request from an epoch not started yet, or
    /// one targeting a frame already simulated.
    pub fn apply_remote(
        &mut self,
        frame: Frame,
        epoch: u32,
        self_frame: Frame,
    ) -> Result<Option<Frame>, NetplayError> {
        if epoch < self.epoch {
            debug!(
                "ignoring pause for frame {}, epoch {} already resumed",
                frame, epoch
            );
            return Ok(None);
        }
        if epoch > self.epoch {
            return Err(NetplayError::ProtocolViolation {
                context: format!("pause from epoch {} while at epoch {}", epoch, self.epoch),
            });
        }
        if frame.is_before(self_frame) && self.schedule.frame() != Some(frame) {
            return Err(NetplayError::ProtocolViolation {
                context: format!(
                    "pause for frame {} arrived after frame {} was simulated",
                    frame, self_frame
                ),
            });
        }
        Ok(Some(self.schedule.schedule(frame)))
    }

    /// Enters the pause if `self_frame` is its frame. `true` on the transition only.
    pub fn reach(&mut self, self_frame: Frame) -> bool {
        self.schedule.reach(self_frame)
    }

    /// Halted right now.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.schedule.is_paused()
    }

    /// Ends the current pause locally. Returns the epoch it belonged to, `None` if nothing
    /// was scheduled.
    pub fn resume(&mut self) -> Option<u32> {
        if !self.schedule.resume() {
            return None;
        }
        let ended = self.epoch;
        self.epoch = self.epoch.wrapping_add(1);
        Some(ended)
    }

    /// Applies the remote's resume of `epoch`. Returns `true` if a pause ended here.
    ///
    /// A resume of an epoch this side already closed is the two sides resuming at once.
    ///
    /// # Errors
    ///
    /// [`NetplayError::ProtocolViolation`] for an epoch not started yet.
    pub fn apply_resume(&mut self, epoch: u32) -> Result<bool, NetplayError> {
        if epoch < self.epoch {
            return Ok(false);
        }
        if epoch > self.epoch {
            return Err(NetplayError::ProtocolViolation {
                context: format!("resume of epoch {} while at epoch {}", epoch, self.epoch),
            });
        }
        self.epoch = self.epoch.wrapping_add(1);
        Ok(self.schedule.resume())
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
    fn flip_changes_mapping_from_its_frame_on() {
        let mut flip = FlipSchedule::new();
        assert!(flip.request(Frame::new(10), Frame::new(4)).unwrap());
        assert!(!flip.flipped_at(Frame::new(9)));
        assert!(flip.flipped_at(Frame::new(10)));
        assert!(flip.flipped_at(Frame::new(500)));
    }

    #[test]
    fn second_flip_waits_for_confirmation() {
        let mut flip = FlipSchedule::new();
        flip.request(Frame::new(10), Frame::new(4)).unwrap();
        assert!(matches!(
            flip.request(Frame::new(12), Frame::new(10)),
            Err(NetplayError::InvalidRequest { .. })
        ));
        // once frame 10 is confirmed the next flip swaps back
        assert!(!flip.request(Frame::new(20), Frame::new(11)).unwrap());
        assert!(flip.flipped_at(Frame::new(19)));
        assert!(!flip.flipped_at(Frame::new(20)));
    }

    #[test]
    fn settled_flips_keep_their_mapping() {
        let mut flip = FlipSchedule::new();
        flip.request(Frame::new(3), Frame::ZERO).unwrap();
        flip.settle(Frame::new(50));
        assert_eq!(flip.pending_frame(), None);
        assert!(flip.flipped_at(Frame::new(50)));
    }

    #[test]
    fn announce_fires_once() {
        let mut flip = FlipSchedule::new();
        flip.request(Frame::new(5), Frame::ZERO).unwrap();
        assert!(flip.announce(Frame::new(0), Frame::new(5)).is_empty());
        assert_eq!(
            flip.announce(Frame::new(5), Frame::new(6)).as_slice(),
            &[(Frame::new(5), true)]
        );
        assert!(flip.announce(Frame::new(3), Frame::new(9)).is_empty());
    }

    #[test]
    fn remote_flip_before_confirmed_frame_is_rejected() {
        let mut flip = FlipSchedule::new();
        assert!(matches!(
            flip.apply_remote(Frame::new(3), Frame::new(4)),
            Err(NetplayError::ProtocolViolation { .. })
        ));
        assert!(flip.apply_remote(Frame::new(4), Frame::new(4)).unwrap());
    }

    #[test]
    fn pause_targets_frame_out_of_remote_reach() {
        assert_eq!(
            PauseSchedule::earliest_frame(Frame::new(10), 8),
            Frame::new(19)
        );
    }

    #[test]
    fn concurrent_pauses_resolve_to_earlier_frame() {
        let mut pause = PauseSchedule::default();
        assert_eq!(pause.schedule(Frame::new(20)), Frame::new(20));
        assert_eq!(pause.schedule(Frame::new(25)), Frame::new(20));
        assert_eq!(pause.schedule(Frame::new(18)), Frame::new(18));
        assert_eq!(pause, PauseSchedule::Scheduled(Frame::new(18)));
    }

    #[test]
    fn pause_is_reached_once_and_resumed() {
        let mut pause = PauseSchedule::default();
        pause.schedule(Frame::new(5));
        assert!(!pause.reach(Frame::new(4)));
        assert!(pause.reach(Frame::new(5)));
        assert!(!pause.reach(Frame::new(5)));
        assert!(pause.is_paused());
        assert!(pause.resume());
        assert_eq!(pause, PauseSchedule::Running);
        assert!(!pause.resume());
    }

    #[test]
    fn repeated_request_keeps_active_pause() {
        let mut pause = PauseSchedule::default();
        pause.schedule(Frame::new(5));
        pause.reach(Frame::new(5));
        assert_eq!(pause.schedule(Frame::new(9)), Frame::new(5));
        assert!(pause.is_paused());
    }

    #[test]
    fn pause_crossing_a_resume_is_ignored() {
        let mut host = PauseAgreement::new();
        let mut client = PauseAgreement::new();
        assert_eq!(host.request(Frame::new(10)), Frame::new(10));
        assert!(host.reach(Frame::new(10)));
        assert_eq!(host.resume(), Some(0));

        // the client asked before it heard of either message
        assert_eq!(client.request(Frame::new(14)), Frame::new(14));
        assert_eq!(
            client.apply_remote(Frame::new(10), 0, Frame::new(5)).unwrap(),
            Some(Frame::new(10))
        );
        assert!(client.apply_resume(0).unwrap());
        assert_eq!(host.apply_remote(Frame::new(14), 0, Frame::new(10)).unwrap(), None);

        assert_eq!(host.schedule(), PauseSchedule::Running);
        assert_eq!(client.schedule(), PauseSchedule::Running);
        assert_eq!((host.epoch(), client.epoch()), (1, 1));
    }

    #[test]
    fn simultaneous_resumes_close_one_epoch() {
        let mut a = PauseAgreement::new();
        let mut b = PauseAgreement::new();
        a.request(Frame::new(4));
        b.apply_remote(Frame::new(4), 0, Frame::new(2)).unwrap();
        assert_eq!(a.resume(), Some(0));
        assert_eq!(b.resume(), Some(0));
        assert!(!a.apply_resume(0).unwrap());
        assert!(!b.apply_resume(0).unwrap());
        assert_eq!((a.epoch(), b.epoch()), (1, 1));
    }

    #[test]
    fn messages_from_future_epochs_are_violations() {
        let mut pause = PauseAgreement::new();
        assert!(matches!(
            pause.apply_remote(Frame::new(9), 1, Frame::ZERO),
            Err(NetplayError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            pause.apply_resume(1),
            Err(NetplayError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            pause.apply_remote(Frame::new(3), 0, Frame::new(5)),
            Err(NetplayError::ProtocolViolation { .. })
        ));
    }
}
