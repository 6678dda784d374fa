//! Player session integration tests.

use crate::common::stubs::scripted_input;
use crate::common::test_utils::{assert_disconnected_with, drain_events, Pair};
use deltaplay::{
    AdvanceOutcome, DisconnectReason, Frame, InputWords, NetplayError, SessionConfig,
    SessionEvent, SessionState, StallConfig, StallReason, WaitReason,
};

#[test]
fn test_players_connect_on_first_tick() {
    let mut pair = Pair::new(&SessionConfig::default());
    assert_eq!(pair.host.current_state(), SessionState::Handshaking);

    pair.connect();

    assert_eq!(pair.host.remote_nickname(), Some("client"));
    assert_eq!(pair.client.remote_nickname(), Some("host"));
    assert!(drain_events(&mut pair.host).contains(&SessionEvent::Connected {
        remote_nickname: "client".to_owned()
    }));
    assert!(drain_events(&mut pair.client).contains(&SessionEvent::Connected {
        remote_nickname: "host".to_owned()
    }));
}

#[test]
fn test_steady_remote_input_never_rolls_back() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..60 {
        pair.tick(scripted_input(1, frame), InputWords::ZERO);
    }

    assert_eq!(pair.host.rollbacks(), 0);
    assert_eq!(pair.client.rollbacks(), 0);
    assert_eq!(pair.host_core.frames_replayed, 0);
    pair.assert_confirmed_frames_agree();
}

#[test]
fn test_changing_remote_input_rolls_back_only_the_guessing_side() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..60 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
    }

    // the client always has the host's input in time, the host always guesses
    assert!(pair.host.rollbacks() > 0);
    assert_eq!(pair.client.rollbacks(), 0);
    pair.assert_confirmed_frames_agree();

    let host_inputs = pair.host.replay().unwrap().inputs();
    let client_inputs = pair.client.replay().unwrap().inputs();
    let common = host_inputs.len().min(client_inputs.len());
    assert!(common > 50);
    assert_eq!(host_inputs[..common], client_inputs[..common]);
    assert_eq!(host_inputs[10].ports[0], scripted_input(1, 10));
    assert_eq!(host_inputs[10].ports[1], scripted_input(2, 10));
}

#[test]
fn test_host_stalls_after_sync_frames_without_remote_input() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..8 {
        assert_eq!(
            pair.host_tick(InputWords::ZERO),
            AdvanceOutcome::Advanced {
                frame: Frame::new(frame),
                fast_forward: false
            }
        );
    }

    assert_eq!(
        pair.host_tick(InputWords::ZERO),
        AdvanceOutcome::Waiting(WaitReason::Stalled(StallReason::RunningFast))
    );
    assert_eq!(pair.host.stall_reason(), StallReason::RunningFast);
    assert!(drain_events(&mut pair.host).contains(&SessionEvent::StallEntered {
        reason: StallReason::RunningFast,
        frame: Frame::new(8)
    }));
    assert_eq!(pair.host.current_frame(), Frame::new(8));

    // one confirmed frame frees one slot
    pair.client_tick(InputWords::ZERO);
    assert_eq!(
        pair.host_tick(InputWords::ZERO),
        AdvanceOutcome::Advanced {
            frame: Frame::new(8),
            fast_forward: false
        }
    );
    assert!(drain_events(&mut pair.host)
        .iter()
        .any(|event| matches!(event, SessionEvent::StallExited { polls: 0, .. })));
    assert_eq!(pair.host.stall_reason(), StallReason::None);
}

#[test]
fn test_stall_times_out_when_remote_goes_silent() {
    let config = SessionConfig {
        stall: StallConfig { max_stall_polls: 5 },
        ..SessionConfig::default()
    };
    let mut pair = Pair::new(&config);
    for _ in 0..8 {
        pair.host_tick(InputWords::ZERO);
    }
    // entering the stall plus five counted polls
    for _ in 0..6 {
        assert!(matches!(
            pair.host_tick(InputWords::ZERO),
            AdvanceOutcome::Waiting(WaitReason::Stalled(_))
        ));
    }

    let result = pair.host.advance_frame(&mut pair.host_core, InputWords::ZERO);
    assert_eq!(
        result,
        Err(NetplayError::RemoteTimeout { stalled_polls: 6 })
    );
    assert!(pair.host.store().is_none());
    assert_disconnected_with(&mut pair.host, |err| {
        matches!(err, NetplayError::RemoteTimeout { .. })
    });
    assert_eq!(
        pair.host.advance_frame(&mut pair.host_core, InputWords::ZERO),
        Err(NetplayError::Disconnected)
    );
}

#[test]
fn test_lagging_side_is_told_to_fast_forward() {
    let mut pair = Pair::new(&SessionConfig::default());
    for _ in 0..5 {
        pair.host_tick(InputWords::ZERO);
    }

    assert_eq!(
        pair.client_tick(InputWords::ZERO),
        AdvanceOutcome::Advanced {
            frame: Frame::ZERO,
            fast_forward: true
        }
    );
    assert!(pair.client.should_fast_forward());
    for _ in 1..4 {
        pair.client_tick(InputWords::ZERO);
    }
    assert_eq!(
        pair.client_tick(InputWords::ZERO),
        AdvanceOutcome::Advanced {
            frame: Frame::new(4),
            fast_forward: false
        }
    );
    assert!(!pair.client.should_fast_forward());
}

#[test]
fn test_graceful_disconnect_reaches_remote() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    pair.client.disconnect().unwrap();

    assert_eq!(
        pair.host.advance_frame(&mut pair.host_core, InputWords::ZERO),
        Err(NetplayError::Disconnected)
    );
    assert!(drain_events(&mut pair.host).contains(&SessionEvent::Disconnected {
        reason: DisconnectReason::RemoteHangup
    }));
    assert!(drain_events(&mut pair.client).contains(&SessionEvent::Disconnected {
        reason: DisconnectReason::LocalHangup
    }));
    assert_eq!(pair.client.current_state(), SessionState::Disconnected);
}

#[test]
fn test_closed_link_is_a_remote_hangup() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    drop(pair.client);

    assert_eq!(
        pair.host.poll_remote(),
        Ok(()),
        "a hangup is not an error of the poll itself"
    );
    assert_eq!(pair.host.current_state(), SessionState::Disconnected);
    assert!(drain_events(&mut pair.host).contains(&SessionEvent::Disconnected {
        reason: DisconnectReason::RemoteHangup
    }));
}
