//! Direct fuzz target for the delta frame ring.
//!
//! Sessions only call the store in a fixed order. This target calls it in any order, with
//! any frame number, and checks that misuse is refused with an error instead of corrupting
//! the pointers.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary operations or frames
//! - `InvariantChecker` passes after every operation
//! - A failed `advance_self` leaves the pointers unchanged

#![no_main]

use arbitrary::Arbitrary;
use deltaplay::telemetry::InvariantChecker;
use deltaplay::{DeltaFrameStore, Frame, InputWords};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum StoreOp {
    AdvanceSelf,
    /// Frames are relative to `other` so most of them land near the live window.
    RecordLocal { offset: i8, word: u32 },
    RecordRemote { offset: i8, word: u32 },
    RecordGuess { offset: i8, word: u32 },
    Capture { offset: i8, fill: u8 },
    Restore { offset: i8 },
    ConfirmWhile { limit: u8 },
    Replay { offset: i8 },
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    /// Speculation window (1-32)
    sync_frames: u8,
    /// State size (0-63)
    state_size: u8,
    operations: Vec<StoreOp>,
}

fn near(store: &DeltaFrameStore, offset: i8) -> Frame {
    Frame::new(store.other_frame().as_u32().wrapping_add_signed(i32::from(offset)))
}

fuzz_target!(|input: FuzzInput| {
    let sync_frames = usize::from(input.sync_frames % 32) + 1;
    let state_size = usize::from(input.state_size % 64);
    let Ok(mut store) = DeltaFrameStore::new(sync_frames, state_size) else {
        return;
    };

    for op in input.operations.iter().take(1_000) {
        match *op {
            StoreOp::AdvanceSelf => {
                let before = (store.other_frame(), store.read_frame(), store.self_frame());
                if store.advance_self().is_err() {
                    assert_eq!(
                        before,
                        (store.other_frame(), store.read_frame(), store.self_frame())
                    );
                }
            },
            StoreOp::RecordLocal { offset, word } => {
                let _ = store.record_local(near(&store, offset), InputWords::new([word, 0, 0]));
            },
            StoreOp::RecordRemote { offset, word } => {
                let _ = store.record_remote(near(&store, offset), InputWords::new([word, 0, 0]));
            },
            StoreOp::RecordGuess { offset, word } => {
                let _ = store.record_guess(near(&store, offset), InputWords::new([word, 0, 0]));
            },
            StoreOp::Capture { offset, fill } => {
                let blob = vec![fill; state_size];
                let _ = store.capture(near(&store, offset), &blob);
            },
            StoreOp::Restore { offset } => {
                if let Ok(blob) = store.restore(near(&store, offset)) {
                    assert_eq!(blob.len(), state_size);
                }
            },
            StoreOp::ConfirmWhile { limit } => {
                let mut budget = limit;
                let _ = store.advance_other_while(|_| {
                    budget = budget.saturating_sub(1);
                    budget > 0
                });
            },
            StoreOp::Replay { offset } => {
                if store.begin_replay(near(&store, offset)).is_ok() {
                    while let Ok(false) = store.advance_replay() {}
                    let _ = store.finish_replay();
                }
            },
        }
        assert!(store.check_invariants().is_ok(), "{:?}", store);
    }
});
