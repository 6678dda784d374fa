//! One slot of the delta frame ring.

use crate::{Frame, InputWords};

/// Snapshot and input records for one frame.
///
/// The state blob is allocated when the store is created and overwritten in place
/// whenever the slot is reused.
#[derive(Debug, Clone)]
pub struct DeltaFrame {
    used: bool,
    frame: Frame,
    state: Vec<u8>,
    real_input: InputWords,
    simulated_input: InputWords,
    self_input: InputWords,
    have_local: bool,
    have_remote: bool,
    have_simulated: bool,
    used_real: bool,
}

impl DeltaFrame {
    pub(crate) fn new(state_size: usize) -> Self {
        Self {
            used: false,
            frame: Frame::ZERO,
            state: vec![0; state_size],
            real_input: InputWords::ZERO,
            simulated_input: InputWords::ZERO,
            self_input: InputWords::ZERO,
            have_local: false,
            have_remote: false,
            have_simulated: false,
            used_real: false,
        }
    }

    /// Reuses the slot for `frame`. Input records are cleared, the blob keeps its storage.
    pub(crate) fn prepare(&mut self, frame: Frame) {
        self.used = true;
        self.frame = frame;
        self.real_input = InputWords::ZERO;
        self.simulated_input = InputWords::ZERO;
        self.self_input = InputWords::ZERO;
        self.have_local = false;
        self.have_remote = false;
        self.have_simulated = false;
        self.used_real = false;
    }

    pub(crate) fn release(&mut self) {
        self.used = false;
    }

    /// Whether the slot belongs to the live window of the ring.
    #[must_use]
    pub fn used(&self) -> bool {
        self.used
    }

    /// The frame this slot describes.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// The snapshot taken at the start of [`frame`](Self::frame).
    #[must_use]
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut [u8] {
        &mut self.state
    }

    /// Confirmed remote input. Only meaningful when [`have_remote`](Self::have_remote) is set.
    #[must_use]
    pub fn real_input(&self) -> InputWords {
        self.real_input
    }

    /// The guess used for the remote input while the real one was unknown.
    #[must_use]
    pub fn simulated_input(&self) -> InputWords {
        self.simulated_input
    }

    /// Local input for this frame.
    #[must_use]
    pub fn self_input(&self) -> InputWords {
        self.self_input
    }

    /// Local input was recorded.
    #[must_use]
    pub fn have_local(&self) -> bool {
        self.have_local
    }

    /// Real remote input was recorded.
    #[must_use]
    pub fn have_remote(&self) -> bool {
        self.have_remote
    }

    /// A guess for the remote input was recorded.
    #[must_use]
    pub fn have_simulated(&self) -> bool {
        self.have_simulated
    }

    /// The frame was last simulated with the real remote input.
    #[must_use]
    pub fn used_real(&self) -> bool {
        self.used_real
    }

    /// Local input is known and the remote input is known or guessed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.used && self.have_local && (self.have_remote || self.have_simulated)
    }

    /// The remote input the next simulation of this frame should use: the real input when
    /// known, the earlier guess otherwise.
    #[must_use]
    pub fn effective_remote(&self) -> InputWords {
        if self.have_remote {
            self.real_input
        } else {
            self.simulated_input
        }
    }

    /// The last simulation of this frame used input that is now known to be correct.
    #[must_use]
    pub fn is_confirmable(&self) -> bool {
        self.have_remote && (self.used_real || self.simulated_input == self.real_input)
    }

    pub(crate) fn set_local(&mut self, input: InputWords) {
        self.self_input = input;
        self.have_local = true;
    }

    pub(crate) fn set_remote(&mut self, input: InputWords) {
        self.real_input = input;
        self.have_remote = true;
    }

    pub(crate) fn set_guess(&mut self, input: InputWords) {
        self.simulated_input = input;
        self.have_simulated = true;
    }

    pub(crate) fn set_used_real(&mut self, used_real: bool) {
        self.used_real = used_real;
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

    #[test]
    fn prepare_keeps_blob_storage() {
        let mut slot = DeltaFrame::new(16);
        slot.state_mut()[0] = 7;
        let ptr = slot.state().as_ptr();
        slot.prepare(Frame::new(3));
        assert_eq!(slot.state().as_ptr(), ptr);
        assert_eq!(slot.state().len(), 16);
        assert_eq!(slot.frame(), Frame::new(3));
        assert!(slot.used());
    }

    #[test]
    fn prepare_clears_input_flags() {
        let mut slot = DeltaFrame::new(1);
        slot.prepare(Frame::new(0));
        slot.set_local(words(1));
        slot.set_remote(words(2));
        slot.set_used_real(true);
        slot.prepare(Frame::new(1));
        assert!(!slot.have_local());
        assert!(!slot.have_remote());
        assert!(!slot.used_real());
        assert_eq!(slot.self_input(), InputWords::ZERO);
    }

    #[test]
    fn ready_requires_local_and_some_remote() {
        let mut slot = DeltaFrame::new(1);
        slot.prepare(Frame::new(0));
        assert!(!slot.is_ready());
        slot.set_local(words(1));
        assert!(!slot.is_ready());
        slot.set_guess(words(0));
        assert!(slot.is_ready());
    }

    #[test]
    fn released_slot_is_not_ready() {
        let mut slot = DeltaFrame::new(1);
        slot.prepare(Frame::new(0));
        slot.set_local(words(1));
        slot.set_remote(words(1));
        slot.release();
        assert!(!slot.is_ready());
    }

    #[test]
    fn matching_guess_is_confirmable() {
        let mut slot = DeltaFrame::new(1);
        slot.prepare(Frame::new(5));
        slot.set_guess(words(4));
        assert!(!slot.is_confirmable());
        slot.set_remote(words(4));
        assert!(slot.is_confirmable());
    }

    #[test]
    fn wrong_guess_is_not_confirmable_until_resimulated() {
        let mut slot = DeltaFrame::new(1);
        slot.prepare(Frame::new(5));
        slot.set_guess(words(4));
        slot.set_remote(words(9));
        assert!(!slot.is_confirmable());
        assert_eq!(slot.effective_remote(), words(9));
        slot.set_used_real(true);
        assert!(slot.is_confirmable());
    }
}
