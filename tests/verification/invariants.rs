//! Snapshot ring invariants observed through running sessions.
//!
//! The store checks itself in debug builds; these tests check it from the outside after
//! every tick, across stalls, rollbacks, flips and pauses.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::scripted_input;
use crate::common::test_utils::Pair;
use deltaplay::telemetry::InvariantChecker;
use deltaplay::{InputWords, Session, SessionConfig};

#[track_caller]
fn assert_store_sound(session: &Session) {
    let store = session.store().unwrap();
    if let Err(violation) = store.check_invariants() {
        panic!("{}", violation);
    }
    assert!(!store.self_frame().is_before(store.read_frame()));
    assert!(!store.read_frame().is_before(store.other_frame()));
    assert!(store.speculation() <= store.sync_frames());
    assert_eq!(store.speculation() + store.headroom(), store.sync_frames());
}

fn check_both(pair: &Pair) {
    assert_store_sound(&pair.host);
    assert_store_sound(&pair.client);
}

#[test]
fn test_invariants_hold_in_lockstep() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..100 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
        check_both(&pair);
    }
}

#[test]
fn test_invariants_hold_through_stall_and_catch_up() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..20 {
        pair.host_tick(scripted_input(1, frame));
        assert_store_sound(&pair.host);
    }
    assert_eq!(pair.host.store().unwrap().headroom(), 0);

    for frame in 0..20 {
        pair.client_tick(scripted_input(2, frame));
        assert_store_sound(&pair.client);
        pair.host_tick(InputWords::ZERO);
        assert_store_sound(&pair.host);
    }
    pair.assert_confirmed_frames_agree();
}

#[test]
fn test_invariants_hold_across_flip_and_pause() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    for frame in 1..6 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
    }
    pair.host.request_flip().unwrap();
    pair.client.request_pause().unwrap();
    for frame in 6..30 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
        check_both(&pair);
    }
    assert!(pair.host.pause_state().is_paused());
    pair.host.resume().unwrap();
    for frame in 30..50 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
        check_both(&pair);
    }
    pair.assert_confirmed_frames_agree();
}
