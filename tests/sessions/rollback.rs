//! Misprediction and re-simulation tests.

use crate::common::stubs::{scripted_input, BrokenLoadStub, CoreStub, STUB_STATE_SIZE};
use crate::common::test_utils::{assert_disconnected_with, drain_events, Pair};
use deltaplay::{
    CoreOperation, Frame, InputWords, MemoryStream, NetplayError, Replay, ReplayHeader, Role,
    RollbackState, SessionBuilder, SessionConfig, SessionEvent,
};

fn deep_config() -> SessionConfig {
    SessionConfig {
        sync_frames: 16,
        ..SessionConfig::default()
    }
}

#[test]
fn test_late_input_rolls_back_to_first_wrong_guess() {
    let mut pair = Pair::new(&deep_config());
    for _ in 0..9 {
        pair.host_tick(InputWords::ZERO);
    }
    for frame in 0..6 {
        let input = if frame == 5 {
            InputWords::new([7, 0, 0])
        } else {
            InputWords::ZERO
        };
        pair.client_tick(input);
    }
    drain_events(&mut pair.host);

    pair.host_tick(InputWords::ZERO);

    assert!(drain_events(&mut pair.host).contains(&SessionEvent::RollbackOccurred {
        from: Frame::new(5),
        to: Frame::new(9)
    }));
    assert_eq!(pair.host.rollbacks(), 1);
    assert_eq!(pair.host_core.frames_replayed, 4);
    assert_eq!(pair.host_core.loads, 1);
    assert_eq!(pair.host.rollback_state(), RollbackState::Normal);
    assert_eq!(pair.host.confirmed_frame(), Frame::new(6));

    for _ in 0..20 {
        pair.tick(InputWords::ZERO, InputWords::ZERO);
    }
    assert_eq!(pair.host.rollbacks(), 1);
    pair.assert_confirmed_frames_agree();
}

#[test]
fn test_replay_reproduces_confirmed_state() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..50 {
        pair.tick(scripted_input(5, frame), scripted_input(6, frame));
    }

    let replay = pair.host.replay().unwrap();
    assert_eq!(replay.start_frame(), Frame::ZERO);
    let last = replay.next_frame().prev().as_u32();
    assert!(last > 40);

    let mut fresh = CoreStub::new();
    replay.play(&mut fresh).unwrap();
    assert_eq!(fresh.frame, last + 1);
    assert_eq!(Some(fresh.acc), pair.host_core.checksum(last));

    let header = ReplayHeader::new(0, 0, STUB_STATE_SIZE as u32);
    let bytes = replay.to_bytes().unwrap();
    let restored = Replay::from_bytes(&bytes, &header).unwrap();
    assert_eq!(&restored, replay);

    let foreign = ReplayHeader::new(0, 1, STUB_STATE_SIZE as u32);
    assert!(matches!(
        Replay::from_bytes(&bytes, &foreign),
        Err(NetplayError::MalformedPacket { .. })
    ));
}

#[test]
fn test_core_that_cannot_load_ends_session() {
    let (host_link, client_link) = MemoryStream::pair();
    let mut host_core = BrokenLoadStub::default();
    let mut client_core = CoreStub::new();
    let mut host = SessionBuilder::new()
        .with_role(Role::Server)
        .start_session(host_link, &host_core)
        .unwrap();
    let mut client = SessionBuilder::new()
        .with_role(Role::Client)
        .start_session(client_link, &client_core)
        .unwrap();

    for _ in 0..3 {
        host.advance_frame(&mut host_core, InputWords::ZERO).unwrap();
    }
    client
        .advance_frame(&mut client_core, InputWords::new([1, 0, 0]))
        .unwrap();

    assert_eq!(
        host.advance_frame(&mut host_core, InputWords::ZERO),
        Err(NetplayError::CoreStateFailed {
            operation: CoreOperation::Load,
            frame: Frame::ZERO
        })
    );
    assert_disconnected_with(&mut host, |err| {
        matches!(err, NetplayError::CoreStateFailed { .. })
    });
}
