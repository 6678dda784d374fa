//! Port flips and pauses, both agreed on a frame index.

use crate::common::stubs::scripted_input;
use crate::common::test_utils::{assert_disconnected_with, drain_events, Pair};
use deltaplay::{
    AdvanceOutcome, Frame, InputWords, NetplayError, PauseSchedule, SessionConfig, SessionEvent,
    StallConfig, WaitReason,
};

fn flips(events: &[SessionEvent]) -> Vec<(Frame, bool)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::FlipApplied { frame, flipped } => Some((*frame, *flipped)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_flip_applies_on_both_sides_at_same_frame() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..5 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
    }

    assert_eq!(pair.host.request_flip(), Ok(Frame::new(5)));
    assert!(matches!(
        pair.host.request_flip(),
        Err(NetplayError::InvalidRequest { .. })
    ));

    let mut host_events = Vec::new();
    let mut client_events = Vec::new();
    for frame in 5..40 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
        host_events.extend(drain_events(&mut pair.host));
        client_events.extend(drain_events(&mut pair.client));
    }

    assert_eq!(flips(&host_events), vec![(Frame::new(5), true)]);
    assert_eq!(flips(&client_events), vec![(Frame::new(5), true)]);
    assert!(pair.host.flipped_at(Frame::new(5)));

    let inputs = pair.host.replay().unwrap().inputs();
    assert_eq!(inputs[4].ports[0], scripted_input(1, 4));
    assert_eq!(inputs[5].ports[1], scripted_input(1, 5));
    assert_eq!(inputs[20].ports[0], scripted_input(2, 20));
    pair.assert_confirmed_frames_agree();

    // the first flip is confirmed by now, so flipping back is allowed
    let back = pair.host.request_flip().unwrap();
    pair.tick(InputWords::ZERO, InputWords::ZERO);
    assert_eq!(flips(&drain_events(&mut pair.host)), vec![(back, false)]);
}

#[test]
fn test_flip_for_frame_client_already_simulated_forces_rollback() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.host_tick(InputWords::new([3, 0, 0]));
    for _ in 0..4 {
        pair.client_tick(InputWords::new([4, 0, 0]));
    }
    drain_events(&mut pair.client);

    assert_eq!(pair.host.request_flip(), Ok(Frame::new(1)));
    pair.client_tick(InputWords::new([4, 0, 0]));

    let events = drain_events(&mut pair.client);
    assert!(events.contains(&SessionEvent::RollbackOccurred {
        from: Frame::new(1),
        to: Frame::new(4)
    }));
    assert_eq!(flips(&events), vec![(Frame::new(1), true)]);
    assert!(pair.client.flipped_at(Frame::new(1)));

    for _ in 0..20 {
        pair.tick(InputWords::new([3, 0, 0]), InputWords::new([4, 0, 0]));
    }
    pair.assert_confirmed_frames_agree();
}

#[test]
fn test_only_server_flips() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    assert!(matches!(
        pair.client.request_flip(),
        Err(NetplayError::InvalidRequest { .. })
    ));
}

#[test]
fn test_pause_halts_both_sides_at_same_frame() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();

    assert_eq!(pair.host.request_pause(), Ok(Frame::new(10)));
    for frame in 1..10 {
        assert_eq!(
            pair.host_tick(InputWords::ZERO),
            AdvanceOutcome::Advanced {
                frame: Frame::new(frame),
                fast_forward: false
            }
        );
        pair.client_tick(InputWords::ZERO);
    }
    drain_events(&mut pair.host);
    drain_events(&mut pair.client);

    assert_eq!(
        pair.host_tick(InputWords::ZERO),
        AdvanceOutcome::Waiting(WaitReason::Paused)
    );
    assert_eq!(
        pair.client_tick(InputWords::ZERO),
        AdvanceOutcome::Waiting(WaitReason::Paused)
    );
    let paused = SessionEvent::PauseApplied {
        frame: Frame::new(10),
    };
    assert_eq!(drain_events(&mut pair.host), vec![paused.clone()]);
    assert_eq!(drain_events(&mut pair.client), vec![paused]);
    assert_eq!(pair.host.pause_state(), PauseSchedule::Paused(Frame::new(10)));

    // still paused on the next tick, without a second event
    assert_eq!(
        pair.host_tick(InputWords::ZERO),
        AdvanceOutcome::Waiting(WaitReason::Paused)
    );
    assert!(drain_events(&mut pair.host).is_empty());

    pair.client.resume().unwrap();
    let resumed = SessionEvent::Resumed {
        frame: Frame::new(10),
    };
    assert_eq!(drain_events(&mut pair.client), vec![resumed.clone()]);
    assert_eq!(
        pair.host_tick(InputWords::ZERO),
        AdvanceOutcome::Advanced {
            frame: Frame::new(10),
            fast_forward: false
        }
    );
    assert!(drain_events(&mut pair.host).contains(&resumed));
    assert_eq!(
        pair.client_tick(InputWords::ZERO),
        AdvanceOutcome::Advanced {
            frame: Frame::new(10),
            fast_forward: false
        }
    );
}

#[test]
fn test_concurrent_pause_requests_agree_on_earlier_frame() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    pair.host_tick(InputWords::ZERO);

    assert_eq!(pair.host.request_pause(), Ok(Frame::new(11)));
    assert_eq!(pair.client.request_pause(), Ok(Frame::new(10)));
    pair.settle();

    assert_eq!(pair.host.pause_state(), PauseSchedule::Scheduled(Frame::new(10)));
    assert_eq!(pair.client.pause_state(), PauseSchedule::Scheduled(Frame::new(10)));
}

#[test]
fn test_scheduled_pause_does_not_stop_stall_timeout() {
    let config = SessionConfig {
        stall: StallConfig { max_stall_polls: 2 },
        ..SessionConfig::default()
    };
    let mut pair = Pair::new(&config);
    pair.connect();
    assert_eq!(pair.host.request_pause(), Ok(Frame::new(10)));

    // the client goes silent before either side reaches the pause frame
    let err = (0..30)
        .find_map(|_| {
            pair.host
                .advance_frame(&mut pair.host_core, InputWords::ZERO)
                .err()
        })
        .expect("stall never timed out");
    assert!(matches!(err, NetplayError::RemoteTimeout { .. }));
    assert_eq!(pair.host.pause_state(), PauseSchedule::Scheduled(Frame::new(10)));
    assert_disconnected_with(&mut pair.host, |err| {
        matches!(err, NetplayError::RemoteTimeout { .. })
    });
}

#[test]
fn test_pause_request_crossing_a_resume_is_dropped() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    for _ in 0..4 {
        pair.client_tick(InputWords::ZERO);
    }

    assert_eq!(pair.host.request_pause(), Ok(Frame::new(10)));
    for _ in 0..20 {
        if pair.host.pause_state() == PauseSchedule::Paused(Frame::new(10)) {
            break;
        }
        pair.host_tick(InputWords::ZERO);
    }
    assert_eq!(pair.host.pause_state(), PauseSchedule::Paused(Frame::new(10)));
    pair.host.resume().unwrap();

    // the client has not seen the pause or the resume yet
    assert_eq!(pair.client.request_pause(), Ok(Frame::new(14)));

    for _ in 0..30 {
        pair.tick(InputWords::ZERO, InputWords::ZERO);
    }
    assert_eq!(pair.host.pause_state(), PauseSchedule::Running);
    assert_eq!(pair.client.pause_state(), PauseSchedule::Running);
    assert!(pair.host.current_frame().as_u32() > 30);
    assert!(pair.client.current_frame().as_u32() > 30);
    pair.assert_confirmed_frames_agree();
}

#[test]
fn test_resume_without_pause_is_rejected() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    assert!(matches!(
        pair.host.resume(),
        Err(NetplayError::InvalidRequest { .. })
    ));
}
