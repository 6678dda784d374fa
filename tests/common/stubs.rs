//! Core stub implementations for testing.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::needless_pass_by_ref_mut,
    clippy::use_self
)]

use std::collections::BTreeMap;

use deltaplay::hash::fnv1a_bytes;
use deltaplay::{CoreState, FrameInputs, InputWords};

/// Serialized size of [`CoreStub`]: frame counter plus accumulator.
pub const STUB_STATE_SIZE: usize = 12;

/// A deterministic core: every frame folds both ports into a running hash.
///
/// The state that goes into snapshots is only `frame` and `acc`. Everything else is
/// bookkeeping for assertions and survives loads.
#[derive(Debug, Default)]
pub struct CoreStub {
    pub frame: u32,
    pub acc: u64,
    /// State after each frame, overwritten when a frame is re-simulated.
    pub checksums: BTreeMap<u32, u64>,
    pub frames_run: u32,
    pub frames_replayed: u32,
    pub loads: u32,
}

impl CoreStub {
    #[must_use]
    pub fn new() -> CoreStub {
        CoreStub::default()
    }

    /// The checksum recorded for `frame`, which is final once `frame` is confirmed.
    #[must_use]
    pub fn checksum(&self, frame: u32) -> Option<u64> {
        self.checksums.get(&frame).copied()
    }
}

impl CoreState for CoreStub {
    fn state_size(&self) -> usize {
        STUB_STATE_SIZE
    }

    fn save_state(&self, buf: &mut [u8]) -> bool {
        buf[..4].copy_from_slice(&self.frame.to_le_bytes());
        buf[4..].copy_from_slice(&self.acc.to_le_bytes());
        true
    }

    fn load_state(&mut self, buf: &[u8]) -> bool {
        if buf.len() != STUB_STATE_SIZE {
            return false;
        }
        self.frame = u32::from_le_bytes(buf[..4].try_into().unwrap());
        self.acc = u64::from_le_bytes(buf[4..].try_into().unwrap());
        self.loads += 1;
        true
    }

    fn run_frame(&mut self, inputs: &FrameInputs) {
        assert_eq!(
            inputs.frame.as_u32(),
            self.frame,
            "core asked to run frame {} while at frame {}",
            inputs.frame,
            self.frame
        );
        let mut bytes = Vec::with_capacity(8 + 2 * 12);
        bytes.extend_from_slice(&self.acc.to_le_bytes());
        for port in &inputs.ports {
            for word in port.words() {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        self.acc = fnv1a_bytes(&bytes);
        self.checksums.insert(self.frame, self.acc);
        self.frame += 1;
        self.frames_run += 1;
        if inputs.replay {
            self.frames_replayed += 1;
        }
    }
}

/// A core whose snapshots cannot be restored.
#[derive(Debug, Default)]
pub struct BrokenLoadStub {
    pub inner: CoreStub,
}

impl CoreState for BrokenLoadStub {
    fn state_size(&self) -> usize {
        self.inner.state_size()
    }

    fn save_state(&self, buf: &mut [u8]) -> bool {
        self.inner.save_state(buf)
    }

    fn load_state(&mut self, _buf: &[u8]) -> bool {
        false
    }

    fn run_frame(&mut self, inputs: &FrameInputs) {
        self.inner.run_frame(inputs);
    }
}

/// Deterministic pseudo-random input for a player and frame.
#[must_use]
pub fn scripted_input(seed: u32, frame: u32) -> InputWords {
    let mixed = fnv1a_bytes(&[seed.to_le_bytes(), frame.to_le_bytes()].concat());
    InputWords::new([(mixed & 0xff) as u32, (mixed >> 32) as u32 & 0x3, 0])
}
