//! Send buffering when a transport accepts only part of a write.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::BTreeMap;

use crate::common::stubs::{scripted_input, CoreStub};
use deltaplay::hash::fnv1a_bytes;
use deltaplay::{
    CoreState, FrameInputs, InputWords, MemoryStream, Role, Session, SessionBuilder,
};

/// A core with a large state, so snapshots take many writes to cross a pipe.
struct BigCore {
    bytes: Vec<u8>,
    checksums: BTreeMap<u32, u64>,
}

impl BigCore {
    const SIZE: usize = 200 * 1024;

    fn new() -> BigCore {
        BigCore {
            bytes: vec![0; Self::SIZE],
            checksums: BTreeMap::new(),
        }
    }

    fn frame(&self) -> u32 {
        u32::from_le_bytes(self.bytes[..4].try_into().unwrap())
    }
}

impl CoreState for BigCore {
    fn state_size(&self) -> usize {
        Self::SIZE
    }

    fn save_state(&self, buf: &mut [u8]) -> bool {
        buf.copy_from_slice(&self.bytes);
        true
    }

    fn load_state(&mut self, buf: &[u8]) -> bool {
        self.bytes.copy_from_slice(buf);
        true
    }

    fn run_frame(&mut self, inputs: &FrameInputs) {
        let frame = self.frame();
        assert_eq!(inputs.frame.as_u32(), frame);
        let at = 4 + (frame as usize * 7919) % (Self::SIZE - 4);
        let mixed = inputs.port(0).word(0).wrapping_add(inputs.port(1).word(0).wrapping_mul(3));
        self.bytes[at] ^= mixed as u8;
        self.bytes[..4].copy_from_slice(&(frame + 1).to_le_bytes());
        self.checksums.insert(frame, fnv1a_bytes(&self.bytes));
    }
}

fn start<C: CoreState>(role: Role, link: MemoryStream, core: &C) -> Session {
    SessionBuilder::new()
        .with_role(role)
        .start_session(link, core)
        .unwrap()
}

#[test]
fn test_tiny_pipes_deliver_every_message() {
    let (host_link, client_link) = MemoryStream::pair_with_capacity(16);
    let mut host_core = CoreStub::new();
    let mut client_core = CoreStub::new();
    let mut host = start(Role::Server, host_link, &host_core);
    let mut client = start(Role::Client, client_link, &client_core);

    for _ in 0..200 {
        let host_frame = host.current_frame().as_u32();
        let client_frame = client.current_frame().as_u32();
        host.advance_frame(&mut host_core, scripted_input(1, host_frame))
            .unwrap();
        client
            .advance_frame(&mut client_core, scripted_input(2, client_frame))
            .unwrap();
    }

    let confirmed = host.confirmed_frame().as_u32().min(client.confirmed_frame().as_u32());
    assert!(confirmed > 20, "only {} frames confirmed", confirmed);
    for frame in 0..confirmed {
        assert_eq!(host_core.checksum(frame), client_core.checksum(frame));
    }
}

#[test]
fn test_large_snapshot_reaches_spectator() {
    let (host_link, client_link) = MemoryStream::pair();
    let (spectator_link, viewer_link) = MemoryStream::pair();
    let mut host_core = BigCore::new();
    let mut client_core = BigCore::new();
    let mut viewer_core = BigCore::new();
    let mut host = start(Role::Server, host_link, &host_core);
    let mut client = start(Role::Client, client_link, &client_core);
    let mut viewer = start(Role::Spectator, viewer_link, &viewer_core);
    host.add_spectator(spectator_link).unwrap();

    for frame in 0..40 {
        host.advance_frame(&mut host_core, InputWords::new([frame, 0, 0]))
            .unwrap();
        client
            .advance_frame(&mut client_core, InputWords::new([frame * 2, 0, 0]))
            .unwrap();
        viewer
            .advance_frame(&mut viewer_core, InputWords::ZERO)
            .unwrap();
    }

    assert!(viewer.is_ready());
    assert!(viewer_core.checksums.len() > 10);
    for (frame, checksum) in &viewer_core.checksums {
        assert_eq!(host_core.checksums.get(frame), Some(checksum));
    }
}
