//! Property-based tests for the snapshot ring and for sessions under random scheduling.
//!
//! Two sessions are driven in an arbitrary interleaving of ticks, then in lockstep until
//! enough frames are confirmed. Whatever the interleaving:
//! - both sides agree on every confirmed frame
//! - the recorded inputs are exactly what each player submitted
//! - replaying the recording on a fresh core reproduces the host's states
//! - the ring invariants hold after every tick

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::BTreeMap;

use crate::common::stubs::{scripted_input, CoreStub};
use crate::common::test_utils::Pair;
use deltaplay::__internal::RingIndex;
use deltaplay::telemetry::InvariantChecker;
use deltaplay::{DeltaFrameStore, Frame, InputWords, SessionConfig};
use proptest::prelude::*;

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Who ticks at one step of the schedule.
#[derive(Debug, Clone, Copy)]
enum Step {
    Host,
    Client,
    Both,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![Just(Step::Host), Just(Step::Client), Just(Step::Both)]
}

fn schedule_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(step_strategy(), 1..120)
}

fn sync_frames_strategy() -> impl Strategy<Value = usize> {
    1usize..=12
}

// ============================================================================
// Helpers
// ============================================================================

struct Seeds {
    host: u32,
    client: u32,
}

fn host_step(pair: &mut Pair, seeds: &Seeds) {
    let frame = pair.host.current_frame().as_u32();
    pair.host_tick(scripted_input(seeds.host, frame));
}

fn client_step(pair: &mut Pair, seeds: &Seeds) {
    let frame = pair.client.current_frame().as_u32();
    pair.client_tick(scripted_input(seeds.client, frame));
}

fn ring_is_sound(pair: &Pair) -> Result<(), String> {
    for session in [&pair.host, &pair.client] {
        if let Some(store) = session.store() {
            store.check_invariants().map_err(|violation| violation.to_string())?;
        }
    }
    Ok(())
}

// ============================================================================
// Session Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Confirmed frames agree and the recordings hold the submitted inputs.
    #[test]
    fn prop_any_schedule_converges(
        schedule in schedule_strategy(),
        sync_frames in sync_frames_strategy(),
        host_seed in any::<u32>(),
        client_seed in any::<u32>(),
    ) {
        let config = SessionConfig {
            sync_frames,
            ..SessionConfig::default()
        };
        let seeds = Seeds { host: host_seed, client: client_seed };
        let mut pair = Pair::new(&config);

        for step in schedule {
            match step {
                Step::Host => host_step(&mut pair, &seeds),
                Step::Client => client_step(&mut pair, &seeds),
                Step::Both => {
                    host_step(&mut pair, &seeds);
                    client_step(&mut pair, &seeds);
                },
            }
            prop_assert_eq!(ring_is_sound(&pair), Ok(()));
        }
        for _ in 0..(3 * sync_frames + 10) {
            host_step(&mut pair, &seeds);
            client_step(&mut pair, &seeds);
            prop_assert_eq!(ring_is_sound(&pair), Ok(()));
        }

        pair.assert_confirmed_frames_agree();

        let host_replay = pair.host.replay().unwrap();
        let client_replay = pair.client.replay().unwrap();
        let host_inputs: BTreeMap<u32, _> = host_replay
            .inputs()
            .iter()
            .map(|input| (input.frame.as_u32(), input.ports))
            .collect();
        for input in client_replay.inputs() {
            if let Some(ports) = host_inputs.get(&input.frame.as_u32()) {
                prop_assert_eq!(*ports, input.ports);
            }
        }
        for (frame, ports) in &host_inputs {
            prop_assert_eq!(ports[0], scripted_input(seeds.host, *frame));
            prop_assert_eq!(ports[1], scripted_input(seeds.client, *frame));
        }

        let mut fresh = CoreStub::new();
        host_replay.play(&mut fresh).unwrap();
        for input in host_replay.inputs() {
            let frame = input.frame.as_u32();
            prop_assert_eq!(fresh.checksum(frame), pair.host_core.checksum(frame));
        }
    }

    /// A side that runs alone never gets more than `sync_frames` ahead of what it confirmed.
    #[test]
    fn prop_speculation_is_bounded(
        sync_frames in sync_frames_strategy(),
        solo_ticks in 1usize..60,
    ) {
        let config = SessionConfig {
            sync_frames,
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(&config);
        pair.connect();

        for _ in 0..solo_ticks {
            pair.host_tick(InputWords::ZERO);
            let store = pair.host.store().unwrap();
            prop_assert!(store.speculation() <= sync_frames);
            prop_assert!(
                pair.host.current_frame().as_u32()
                    <= pair.host.confirmed_frame().as_u32() + sync_frames as u32
            );
        }
    }
}

// ============================================================================
// Ring Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_ring_index_wraps(
        capacity in 1usize..200,
        start_steps in 0usize..1_000,
        steps in 0usize..1_000,
    ) {
        let start = RingIndex::start(capacity).unwrap().advance(start_steps);
        prop_assert_eq!(start.pos(), start_steps % capacity);

        let later = start.advance(steps);
        prop_assert!(later.pos() < capacity);
        prop_assert_eq!(start.steps_to(later), steps % capacity);
        prop_assert_eq!(later.next().prev(), later);
    }

    /// Running the store the way a session does keeps it sound at every step.
    #[test]
    fn prop_store_cursors_stay_ordered(
        sync_frames in sync_frames_strategy(),
        ops in prop::collection::vec(0u8..3, 1..300),
    ) {
        let mut store = DeltaFrameStore::new(sync_frames, 8).unwrap();
        let mut next_remote = Frame::ZERO;

        for op in ops {
            match op {
                0 => {
                    if store.can_advance_self() {
                        let frame = store.self_frame();
                        store.record_local(frame, InputWords::new([frame.as_u32(), 0, 0])).unwrap();
                        store.capture(frame, &[0; 8]).unwrap();
                        store.advance_self().unwrap();
                    } else {
                        prop_assert!(store.advance_self().is_err());
                    }
                },
                1 => {
                    if next_remote.is_before(store.self_frame()) {
                        store.record_remote(next_remote, InputWords::ZERO).unwrap();
                        next_remote = next_remote.next();
                    }
                },
                _ => {
                    store.advance_other_while(|_| true);
                },
            }
            prop_assert_eq!(store.check_invariants().map_err(|v| v.to_string()), Ok(()));
            prop_assert!(!store.read_frame().is_before(store.other_frame()));
            prop_assert!(!store.self_frame().is_before(store.read_frame()));
            prop_assert!(store.speculation() <= sync_frames);
        }
    }
}
