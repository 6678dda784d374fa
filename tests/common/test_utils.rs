//! Shared test utilities for integration tests.
//!
//! Sessions in these tests talk over [`MemoryStream`] pairs and are driven from a single
//! thread, one `advance_frame` per side per tick, so every run is reproducible.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use deltaplay::network::codec::encode_frame;
use deltaplay::{
    AdvanceOutcome, InputWords, MemoryStream, Message, NetplayError, Role, Session,
    SessionBuilder, SessionConfig, SessionEvent, SessionState,
};

use super::stubs::CoreStub;

/// Maximum ticks to wait for a handshake before giving up.
pub const MAX_SYNC_ITERATIONS: usize = 20;

/// Both players and their cores.
pub struct Pair {
    pub host: Session,
    pub client: Session,
    pub host_core: CoreStub,
    pub client_core: CoreStub,
}

impl Pair {
    /// Host and client over an in-memory link, both built from `config` with their role set.
    pub fn new(config: &SessionConfig) -> Pair {
        let (host_link, client_link) = MemoryStream::pair();
        let host_core = CoreStub::new();
        let client_core = CoreStub::new();
        let host = SessionBuilder::new()
            .with_config(config.clone())
            .with_role(Role::Server)
            .with_nickname("host")
            .start_session(host_link, &host_core)
            .unwrap();
        let client = SessionBuilder::new()
            .with_config(config.clone())
            .with_role(Role::Client)
            .with_nickname("client")
            .start_session(client_link, &client_core)
            .unwrap();
        Pair {
            host,
            client,
            host_core,
            client_core,
        }
    }

    /// Advances the host once with `input`.
    pub fn host_tick(&mut self, input: InputWords) -> AdvanceOutcome {
        self.host.advance_frame(&mut self.host_core, input).unwrap()
    }

    /// Advances the client once with `input`.
    pub fn client_tick(&mut self, input: InputWords) -> AdvanceOutcome {
        self.client
            .advance_frame(&mut self.client_core, input)
            .unwrap()
    }

    /// One tick on each side, host first.
    pub fn tick(&mut self, host_input: InputWords, client_input: InputWords) {
        self.host_tick(host_input);
        self.client_tick(client_input);
    }

    /// Ticks until both sides are ready, with zero input.
    pub fn connect(&mut self) {
        for _ in 0..MAX_SYNC_ITERATIONS {
            if self.host.is_ready() && self.client.is_ready() {
                return;
            }
            self.tick(InputWords::ZERO, InputWords::ZERO);
        }
        panic!(
            "handshake timed out: host {:?}, client {:?}",
            self.host.current_state(),
            self.client.current_state()
        );
    }

    /// Polls both sides without advancing, until nothing changes.
    pub fn settle(&mut self) {
        for _ in 0..4 {
            self.host.poll_remote().unwrap();
            self.client.poll_remote().unwrap();
        }
    }

    /// Asserts both cores computed the same state for every frame both have confirmed.
    #[track_caller]
    pub fn assert_confirmed_frames_agree(&self) {
        let confirmed = self
            .host
            .confirmed_frame()
            .as_u32()
            .min(self.client.confirmed_frame().as_u32());
        assert!(confirmed > 0, "no frame confirmed yet");
        for frame in 0..confirmed {
            assert_eq!(
                self.host_core.checksum(frame),
                self.client_core.checksum(frame),
                "cores diverged at confirmed frame {}",
                frame
            );
        }
    }
}

/// Collects the pending events of `session`.
pub fn drain_events(session: &mut Session) -> Vec<SessionEvent> {
    session.events().collect()
}

/// Writes `msg` to a raw stream the way a peer would.
pub fn write_message(stream: &mut MemoryStream, msg: &Message) {
    use deltaplay::NonBlockingStream;

    let mut wire = Vec::new();
    encode_frame(msg, &mut wire).unwrap();
    assert_eq!(stream.write(&wire).unwrap(), wire.len());
}

/// Writes one length-prefixed frame whose payload is not a message.
pub fn write_garbage(stream: &mut MemoryStream) {
    use deltaplay::NonBlockingStream;

    let payload = [0xff_u8; 8];
    let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
    wire.extend_from_slice(&payload);
    assert_eq!(stream.write(&wire).unwrap(), wire.len());
}

/// Asserts the session ended with `expected` as the error behind its disconnect.
#[track_caller]
pub fn assert_disconnected_with(session: &mut Session, expected: fn(&NetplayError) -> bool) {
    assert_eq!(session.current_state(), SessionState::Disconnected);
    let events = drain_events(session);
    let found = events.iter().any(|event| {
        matches!(
            event,
            SessionEvent::Disconnected {
                reason: deltaplay::DisconnectReason::Error(err)
            } if expected(err)
        )
    });
    assert!(found, "no matching disconnect in {:?}", events);
}
