//! Handshake tests against a hand-driven remote.

use std::sync::Arc;

use crate::common::stubs::{CoreStub, STUB_STATE_SIZE};
use crate::common::test_utils::{
    assert_disconnected_with, drain_events, write_garbage, write_message, Pair,
};
use deltaplay::network::messages::{Hello, MessageBody, MessageHeader, Nickname};
use deltaplay::telemetry::{CollectingObserver, ViolationKind};
use deltaplay::{
    AdvanceOutcome, Frame, HandshakeField, InputWords, MemoryStream, Message, NetplayError, Role,
    Session, SessionBuilder, SessionConfig, SessionEvent, SessionState, WaitReason,
    NETPLAY_MAGIC, PROTOCOL_VERSION,
};

fn client_hello() -> Hello {
    Hello {
        protocol_version: PROTOCOL_VERSION,
        role: Role::Client,
        core_magic: 0,
        content_crc: 0,
        state_size: STUB_STATE_SIZE as u32,
    }
}

fn host_over(link: MemoryStream, builder: SessionBuilder) -> (Session, CoreStub) {
    let core = CoreStub::new();
    let session = builder
        .with_role(Role::Server)
        .start_session(link, &core)
        .unwrap();
    (session, core)
}

#[test]
fn test_protocol_version_mismatch_rejected_before_any_frame() {
    let (link, mut remote) = MemoryStream::pair();
    let (mut host, mut core) = host_over(link, SessionBuilder::new());
    write_message(
        &mut remote,
        &Message::new(MessageBody::Hello(Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            ..client_hello()
        })),
    );

    assert_eq!(
        host.advance_frame(&mut core, InputWords::ZERO),
        Err(NetplayError::ProtocolVersionMismatch {
            local_magic: NETPLAY_MAGIC,
            local_version: PROTOCOL_VERSION,
            remote_magic: NETPLAY_MAGIC,
            remote_version: PROTOCOL_VERSION + 1,
        })
    );
    assert_eq!(core.frames_run, 0);
    assert!(host.replay().is_none());
    assert_disconnected_with(&mut host, |err| {
        matches!(err, NetplayError::ProtocolVersionMismatch { .. })
    });
}

#[test]
fn test_foreign_magic_is_a_version_mismatch() {
    let (link, mut remote) = MemoryStream::pair();
    let (mut host, mut core) = host_over(link, SessionBuilder::new());
    write_message(
        &mut remote,
        &Message {
            header: MessageHeader { magic: 0xDEAD_BEEF },
            body: MessageBody::Hello(client_hello()),
        },
    );

    assert!(matches!(
        host.advance_frame(&mut core, InputWords::ZERO),
        Err(NetplayError::ProtocolVersionMismatch {
            remote_magic: 0xDEAD_BEEF,
            ..
        })
    ));
    assert_eq!(host.current_state(), SessionState::Disconnected);
}

#[test]
fn test_identity_mismatches_name_the_field() {
    let cases = [
        (
            Hello {
                content_crc: 2,
                ..client_hello()
            },
            HandshakeField::ContentCrc,
            0,
            2,
        ),
        (
            Hello {
                state_size: STUB_STATE_SIZE as u32 + 1,
                ..client_hello()
            },
            HandshakeField::StateSize,
            STUB_STATE_SIZE as u32,
            STUB_STATE_SIZE as u32 + 1,
        ),
        (
            Hello {
                core_magic: 9,
                ..client_hello()
            },
            HandshakeField::CoreImplementation,
            0,
            9,
        ),
        (
            Hello {
                role: Role::Server,
                ..client_hello()
            },
            HandshakeField::Role,
            Role::Server.as_u32(),
            Role::Server.as_u32(),
        ),
    ];

    for (hello, field, local, remote) in cases {
        let (link, mut peer) = MemoryStream::pair();
        let (mut host, mut core) = host_over(link, SessionBuilder::new());
        write_message(&mut peer, &Message::new(MessageBody::Hello(hello)));

        assert_eq!(
            host.advance_frame(&mut core, InputWords::ZERO),
            Err(NetplayError::HandshakeMismatch {
                field,
                local,
                remote
            }),
            "case {:?}",
            field
        );
        assert_eq!(core.frames_run, 0);
    }
}

#[test]
fn test_two_sessions_with_different_cores_refuse_each_other() {
    let (a, b) = MemoryStream::pair();
    let mut host_core = CoreStub::new();
    let mut client_core = CoreStub::new();
    let mut host = SessionBuilder::new()
        .with_role(Role::Server)
        .with_core("stub", "1.0")
        .start_session(a, &host_core)
        .unwrap();
    let mut client = SessionBuilder::new()
        .with_role(Role::Client)
        .with_core("stub", "1.1")
        .start_session(b, &client_core)
        .unwrap();

    assert!(matches!(
        host.advance_frame(&mut host_core, InputWords::ZERO),
        Err(NetplayError::HandshakeMismatch {
            field: HandshakeField::CoreImplementation,
            ..
        })
    ));
    assert!(matches!(
        client.advance_frame(&mut client_core, InputWords::ZERO),
        Err(NetplayError::HandshakeMismatch {
            field: HandshakeField::CoreImplementation,
            ..
        })
    ));
}

#[test]
fn test_long_nickname_is_truncated_with_warning() {
    let observer = Arc::new(CollectingObserver::new());
    let long = "n".repeat(40);
    let config = SessionConfig {
        nickname: long,
        ..SessionConfig::default()
    };
    let (a, b) = MemoryStream::pair();
    let mut host_core = CoreStub::new();
    let mut client_core = CoreStub::new();
    let mut host = SessionBuilder::new()
        .with_config(config)
        .with_role(Role::Server)
        .with_violation_observer(observer.clone())
        .start_session(a, &host_core)
        .unwrap();
    let mut client = SessionBuilder::new()
        .with_role(Role::Client)
        .start_session(b, &client_core)
        .unwrap();

    assert_eq!(host.local_nickname(), "n".repeat(31));
    assert!(observer.has_violation(ViolationKind::Handshake));

    host.advance_frame(&mut host_core, InputWords::ZERO).unwrap();
    client
        .advance_frame(&mut client_core, InputWords::ZERO)
        .unwrap();
    assert!(client.is_ready());
    assert_eq!(client.remote_nickname(), Some("n".repeat(31).as_str()));
}

#[test]
fn test_input_before_handshake_is_a_violation() {
    let (link, mut remote) = MemoryStream::pair();
    let (mut host, mut core) = host_over(link, SessionBuilder::new());
    write_message(
        &mut remote,
        &Message::new(MessageBody::Input {
            frame: Frame::ZERO,
            words: InputWords::ZERO,
        }),
    );

    assert!(matches!(
        host.advance_frame(&mut core, InputWords::ZERO),
        Err(NetplayError::ProtocolViolation { .. })
    ));
    assert!(host.store().is_none());
}

#[test]
fn test_isolated_garbage_is_dropped() {
    let observer = Arc::new(CollectingObserver::new());
    let (link, mut remote) = MemoryStream::pair();
    let (mut host, mut core) = host_over(
        link,
        SessionBuilder::new().with_violation_observer(observer.clone()),
    );
    write_garbage(&mut remote);
    write_message(&mut remote, &Message::new(MessageBody::Hello(client_hello())));
    write_message(
        &mut remote,
        &Message::new(MessageBody::Nickname(Nickname::encode("raw"))),
    );

    assert!(matches!(
        host.advance_frame(&mut core, InputWords::ZERO),
        Ok(AdvanceOutcome::Advanced { .. })
    ));
    assert!(host.is_ready());
    assert_eq!(host.remote_nickname(), Some("raw"));
    assert!(observer.has_violation(ViolationKind::NetworkProtocol));

    write_garbage(&mut remote);
    write_message(
        &mut remote,
        &Message::new(MessageBody::Input {
            frame: Frame::ZERO,
            words: InputWords::ZERO,
        }),
    );
    assert!(host.advance_frame(&mut core, InputWords::ZERO).is_ok());
    assert_eq!(host.confirmed_frame(), Frame::new(1));
}

#[test]
fn test_repeated_garbage_breaks_the_link() {
    let (link, mut remote) = MemoryStream::pair();
    let (mut host, mut core) = host_over(link, SessionBuilder::new());
    for _ in 0..4 {
        write_garbage(&mut remote);
    }

    assert!(matches!(
        host.advance_frame(&mut core, InputWords::ZERO),
        Err(NetplayError::ProtocolViolation { .. })
    ));
    assert_eq!(host.current_state(), SessionState::Disconnected);
}

#[test]
fn test_session_waits_while_remote_is_silent() {
    let (link, _remote) = MemoryStream::pair();
    let (mut host, mut core) = host_over(link, SessionBuilder::new());
    for _ in 0..3 {
        assert_eq!(
            host.advance_frame(&mut core, InputWords::ZERO),
            Ok(AdvanceOutcome::Waiting(WaitReason::Handshaking))
        );
    }
    assert!(drain_events(&mut host).is_empty());
}

#[test]
fn test_connected_event_names_remote() {
    let mut pair = Pair::new(&SessionConfig::default());
    pair.connect();
    assert!(drain_events(&mut pair.client).contains(&SessionEvent::Connected {
        remote_nickname: "host".to_owned()
    }));
}
