//! Spectators attached to a host.

use crate::common::stubs::{scripted_input, CoreStub, STUB_STATE_SIZE};
use crate::common::test_utils::{drain_events, write_message, Pair};
use deltaplay::network::messages::{Hello, MessageBody, Nickname};
use deltaplay::{
    AdvanceOutcome, DisconnectReason, Frame, InputWords, MemoryStream, Message, NetplayError,
    PauseSchedule, Role, Session, SessionBuilder, SessionConfig, SessionEvent, SessionState,
    SpectatorId, WaitReason, PROTOCOL_VERSION,
};

struct Viewer {
    session: Session,
    core: CoreStub,
}

impl Viewer {
    fn attach(pair: &mut Pair) -> (SpectatorId, Viewer) {
        let (host_end, viewer_end) = MemoryStream::pair();
        let id = pair.host.add_spectator(host_end).unwrap();
        let core = CoreStub::new();
        let session = SessionBuilder::new()
            .with_role(Role::Spectator)
            .with_nickname("viewer")
            .start_session(viewer_end, &core)
            .unwrap();
        (id, Viewer { session, core })
    }

    fn tick(&mut self) -> AdvanceOutcome {
        self.session
            .advance_frame(&mut self.core, InputWords::ZERO)
            .unwrap()
    }
}

fn play(pair: &mut Pair, viewer: &mut Viewer, from: u32, to: u32) {
    for frame in from..to {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
        viewer.tick();
    }
}

#[track_caller]
fn assert_viewer_matches_host(pair: &Pair, viewer: &Viewer) {
    assert!(!viewer.core.checksums.is_empty());
    for (frame, checksum) in &viewer.core.checksums {
        assert_eq!(
            pair.host_core.checksum(*frame),
            Some(*checksum),
            "spectator diverged at frame {}",
            frame
        );
    }
}

/// Completes a spectator handshake on `raw` and then never reads from it.
fn attach_silent_viewer(
    pair: &mut Pair,
    raw: &mut MemoryStream,
    host_end: MemoryStream,
) -> SpectatorId {
    let id = pair.host.add_spectator(host_end).unwrap();
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        role: Role::Spectator,
        core_magic: 0,
        content_crc: 0,
        state_size: STUB_STATE_SIZE as u32,
    };
    write_message(raw, &Message::new(MessageBody::Hello(hello)));
    write_message(
        raw,
        &Message::new(MessageBody::Nickname(Nickname::encode("sleepy"))),
    );
    id
}

#[test]
fn test_spectator_follows_confirmed_frames() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    let (id, mut viewer) = Viewer::attach(&mut pair);
    assert_eq!(viewer.session.current_state(), SessionState::Handshaking);

    play(&mut pair, &mut viewer, 1, 40);

    assert_eq!(viewer.session.role(), Role::Spectator);
    assert!(viewer.session.is_ready());
    assert_eq!(viewer.session.remote_nickname(), Some("host"));
    assert_eq!(viewer.core.loads, 1);
    assert!(viewer.core.frames_run > 20);
    assert_viewer_matches_host(&pair, &viewer);
    assert_eq!(pair.host.num_spectators(), 1);
    assert!(drain_events(&mut pair.host).contains(&SessionEvent::SpectatorJoined {
        id,
        nickname: "viewer".to_owned()
    }));
    assert!(drain_events(&mut viewer.session).contains(&SessionEvent::Connected {
        remote_nickname: "host".to_owned()
    }));
}

#[test]
fn test_late_spectator_starts_from_snapshot() {
    let mut pair = Pair::new(&SessionConfig::default());
    for frame in 0..20 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
    }
    let (_, mut viewer) = Viewer::attach(&mut pair);
    play(&mut pair, &mut viewer, 20, 40);

    let replay = viewer.session.replay().unwrap();
    assert!(replay.start_frame().as_u32() >= 18);
    assert_eq!(viewer.core.frames_run as usize, replay.inputs().len());
    assert!(viewer.core.checksum(replay.start_frame().as_u32() - 1).is_none());

    // the host records from frame 0
    let host_inputs = pair.host.replay().unwrap().inputs();
    for input in replay.inputs() {
        assert_eq!(host_inputs[input.frame.as_u32() as usize], *input);
    }
}

#[test]
fn test_spectator_waits_for_host() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    let (_, mut viewer) = Viewer::attach(&mut pair);
    assert_eq!(viewer.tick(), AdvanceOutcome::Waiting(WaitReason::Handshaking));

    // frame 0 has a snapshot, so polling is enough to start the viewer
    pair.host.poll_remote().unwrap();
    assert_eq!(
        viewer.tick(),
        AdvanceOutcome::Waiting(WaitReason::WaitingForHost)
    );
    assert!(viewer.session.is_ready());
    assert_eq!(viewer.core.loads, 1);

    pair.tick(InputWords::ZERO, InputWords::ZERO);
    assert!(matches!(viewer.tick(), AdvanceOutcome::Advanced { .. }));
}

#[test]
fn test_spectator_joining_during_pause_starts_at_once() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    assert_eq!(pair.host.request_pause(), Ok(Frame::new(10)));
    for frame in 1..12 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
    }
    assert_eq!(pair.host.pause_state(), PauseSchedule::Paused(Frame::new(10)));

    let (_, mut viewer) = Viewer::attach(&mut pair);
    for _ in 0..3 {
        pair.tick(InputWords::ZERO, InputWords::ZERO);
        viewer.tick();
    }
    assert_eq!(pair.host.current_frame(), Frame::new(10));
    assert!(viewer.session.is_ready());
    assert_eq!(viewer.core.loads, 1);
    assert_eq!(viewer.session.replay().unwrap().start_frame(), Frame::new(10));

    pair.host.resume().unwrap();
    play(&mut pair, &mut viewer, 12, 40);
    assert!(viewer.core.frames_run > 10);
    assert_viewer_matches_host(&pair, &viewer);
}

#[test]
fn test_spectator_that_stops_reading_is_dropped() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    let (host_end, mut raw) = MemoryStream::pair_with_capacity(512);
    let id = attach_silent_viewer(&mut pair, &mut raw, host_end);

    let mut reason = None;
    for frame in 1..1000 {
        pair.tick(scripted_input(1, frame), scripted_input(2, frame));
        reason = drain_events(&mut pair.host)
            .into_iter()
            .find_map(|event| match event {
                SessionEvent::SpectatorLeft { id: left, reason } if left == id => Some(reason),
                _ => None,
            });
        if reason.is_some() {
            break;
        }
    }

    assert!(matches!(
        reason,
        Some(DisconnectReason::Error(NetplayError::TransportError { .. }))
    ));
    assert_eq!(pair.host.num_spectators(), 0);
    assert!(pair.host.is_ready());
    assert!(raw.pending_inbound() <= 512);
    pair.tick(InputWords::ZERO, InputWords::ZERO);
    pair.assert_confirmed_frames_agree();
}

#[test]
fn test_leaving_spectator_does_not_affect_players() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    let (id, mut viewer) = Viewer::attach(&mut pair);
    play(&mut pair, &mut viewer, 1, 10);
    drain_events(&mut pair.host);

    viewer.session.disconnect().unwrap();
    pair.tick(InputWords::ZERO, InputWords::ZERO);

    assert!(drain_events(&mut pair.host).contains(&SessionEvent::SpectatorLeft {
        id,
        reason: DisconnectReason::RemoteHangup
    }));
    assert_eq!(pair.host.num_spectators(), 0);
    assert!(pair.host.is_ready());
    for _ in 0..10 {
        pair.tick(InputWords::ZERO, InputWords::ZERO);
    }
    pair.assert_confirmed_frames_agree();
}

#[test]
fn test_dropped_spectator_is_a_hangup() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    let (id, viewer) = Viewer::attach(&mut pair);
    drop(viewer);

    pair.host.poll_remote().unwrap();
    assert!(drain_events(&mut pair.host).contains(&SessionEvent::SpectatorLeft {
        id,
        reason: DisconnectReason::RemoteHangup
    }));
}

#[test]
fn test_spectator_sending_input_is_dropped() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    let (host_end, mut raw) = MemoryStream::pair();
    let id = pair.host.add_spectator(host_end).unwrap();
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        role: Role::Spectator,
        core_magic: 0,
        content_crc: 0,
        state_size: STUB_STATE_SIZE as u32,
    };
    write_message(&mut raw, &Message::new(MessageBody::Hello(hello)));
    write_message(
        &mut raw,
        &Message::new(MessageBody::Nickname(Nickname::encode("rogue"))),
    );
    write_message(
        &mut raw,
        &Message::new(MessageBody::Input {
            frame: Frame::ZERO,
            words: InputWords::ZERO,
        }),
    );

    pair.host.poll_remote().unwrap();

    let events = drain_events(&mut pair.host);
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::SpectatorLeft {
            id: left,
            reason: DisconnectReason::Error(NetplayError::ProtocolViolation { .. })
        } if *left == id
    )));
    assert_eq!(pair.host.num_spectators(), 0);
    assert!(pair.host.is_ready());
}

#[test]
fn test_host_hangup_reaches_spectator() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    let (_, mut viewer) = Viewer::attach(&mut pair);
    play(&mut pair, &mut viewer, 1, 5);

    pair.host.disconnect().unwrap();

    assert_eq!(
        viewer.session.advance_frame(&mut viewer.core, InputWords::ZERO),
        Err(NetplayError::Disconnected)
    );
    assert!(drain_events(&mut viewer.session).contains(&SessionEvent::Disconnected {
        reason: DisconnectReason::RemoteHangup
    }));
}

#[test]
fn test_only_server_hosts_spectators() {
    let mut pair = Pair::new(&SessionConfig::default());
    let (stream, _other) = MemoryStream::pair();
    assert!(matches!(
        pair.client.add_spectator(stream),
        Err(NetplayError::InvalidRequest { .. })
    ));
}
