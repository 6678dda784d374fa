//! Sessions over loopback TCP.
//!
//! These tests bind to an ephemeral port on 127.0.0.1, so they never collide with each
//! other, but they are still serialized to keep timing noise low on busy CI machines.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::TcpListener;
use std::thread;

use crate::common::stubs::{scripted_input, CoreStub};
use deltaplay::{
    DisconnectReason, Duration, InputWords, NetplayError, Role, Session, SessionBuilder,
    SessionEvent, SessionState, TcpNonBlockingStream,
};
use serial_test::serial;

/// Upper bound on polling iterations before a test gives up.
const MAX_ITERATIONS: usize = 5_000;

fn tcp_pair() -> (TcpNonBlockingStream, TcpNonBlockingStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpNonBlockingStream::connect_timeout(addr, Duration::from_secs(5)).unwrap();
    let host = TcpNonBlockingStream::accept(&listener).unwrap();
    (host, client)
}

fn sessions(host_link: TcpNonBlockingStream, client_link: TcpNonBlockingStream) -> (Session, Session) {
    let core = CoreStub::new();
    let host = SessionBuilder::new()
        .with_role(Role::Server)
        .with_nickname("tcp-host")
        .start_session(host_link, &core)
        .unwrap();
    let client = SessionBuilder::new()
        .with_role(Role::Client)
        .with_nickname("tcp-client")
        .start_session(client_link, &core)
        .unwrap();
    (host, client)
}

#[test]
#[serial]
#[cfg_attr(miri, ignore)]
fn test_players_agree_over_tcp() {
    let (host_link, client_link) = tcp_pair();
    let (mut host, mut client) = sessions(host_link, client_link);
    assert!(host.remote_addr().is_some());
    assert!(client.remote_addr().is_some());

    let mut host_core = CoreStub::new();
    let mut client_core = CoreStub::new();
    let mut iterations = 0;
    while host.confirmed_frame().as_u32() < 60 || client.confirmed_frame().as_u32() < 60 {
        iterations += 1;
        assert!(
            iterations < MAX_ITERATIONS,
            "confirmed only {} / {} frames",
            host.confirmed_frame(),
            client.confirmed_frame()
        );
        let host_frame = host.current_frame().as_u32();
        let client_frame = client.current_frame().as_u32();
        host.advance_frame(&mut host_core, scripted_input(1, host_frame))
            .unwrap();
        client
            .advance_frame(&mut client_core, scripted_input(2, client_frame))
            .unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(host.remote_nickname(), Some("tcp-client"));
    assert_eq!(client.remote_nickname(), Some("tcp-host"));
    for frame in 0..60 {
        assert_eq!(host_core.checksum(frame), client_core.checksum(frame));
    }
}

#[test]
#[serial]
#[cfg_attr(miri, ignore)]
fn test_closed_socket_is_a_remote_hangup() {
    let (host_link, client_link) = tcp_pair();
    let (mut host, mut client) = sessions(host_link, client_link);
    // read the host's greeting first, closing with unread data would reset the connection
    let mut iterations = 0;
    while !client.is_ready() {
        iterations += 1;
        assert!(iterations < MAX_ITERATIONS, "client never identified the host");
        client.poll_remote().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    drop(client);
    thread::sleep(Duration::from_millis(10));

    let mut core = CoreStub::new();
    iterations = 0;
    while host.current_state() != SessionState::Disconnected {
        iterations += 1;
        assert!(iterations < MAX_ITERATIONS, "hangup never noticed");
        match host.advance_frame(&mut core, InputWords::ZERO) {
            Ok(_) | Err(NetplayError::Disconnected) => {},
            Err(err) => panic!("unexpected error {}", err),
        }
        thread::sleep(Duration::from_millis(1));
    }

    let events: Vec<_> = host.events().collect();
    assert!(events.contains(&SessionEvent::Disconnected {
        reason: DisconnectReason::RemoteHangup
    }));
}
