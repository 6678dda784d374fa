//! Fuzz target for session configuration.
//!
//! This target tests that arbitrary configuration values are handled gracefully
//! by [`SessionConfig::validate`], the [`SessionBuilder`] setters and session start.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary configuration values
//! - A config that fails validation never starts a session

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use deltaplay::{
    CoreState, FrameInputs, MemoryStream, Role, SessionBuilder, SessionConfig, StallConfig,
};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Arbitrary)]
struct FuzzConfig {
    role: u8,
    sync_frames: u16,
    nickname: String,
    server: Option<[u8; 4]>,
    port: u16,
    core_magic: u32,
    content_crc: u32,
    max_stall_polls: u32,
    max_malformed_packets: u32,
    event_queue_size: u16,
    state_size: u8,
}

/// A core that never runs; only its state size matters here.
struct StubCore {
    state_size: usize,
}

impl CoreState for StubCore {
    fn state_size(&self) -> usize {
        self.state_size
    }

    fn save_state(&self, buf: &mut [u8]) -> bool {
        buf.fill(0);
        true
    }

    fn load_state(&mut self, _buf: &[u8]) -> bool {
        true
    }

    fn run_frame(&mut self, _inputs: &FrameInputs) {}
}

fuzz_target!(|fuzz: FuzzConfig| {
    let role = match fuzz.role % 3 {
        0 => Role::Server,
        1 => Role::Client,
        _ => Role::Spectator,
    };
    let config = SessionConfig {
        role,
        sync_frames: usize::from(fuzz.sync_frames),
        nickname: fuzz.nickname,
        server_addr: fuzz
            .server
            .map(|[a, b, c, d]| IpAddr::V4(Ipv4Addr::new(a, b, c, d))),
        port: fuzz.port,
        core_magic: fuzz.core_magic,
        content_crc: fuzz.content_crc,
        stall: StallConfig {
            max_stall_polls: fuzz.max_stall_polls,
        },
        max_malformed_packets: fuzz.max_malformed_packets,
        event_queue_size: usize::from(fuzz.event_queue_size),
    };
    let valid = config.validate().is_ok();

    let _ = SessionBuilder::new().with_sync_frames(config.sync_frames);
    let _ = SessionBuilder::new().with_event_queue_size(config.event_queue_size);

    let core = StubCore {
        state_size: usize::from(fuzz.state_size),
    };
    let (link, _peer) = MemoryStream::pair();
    let started = SessionBuilder::new()
        .with_config(config)
        .start_session(link, &core);
    if !valid {
        assert!(started.is_err(), "invalid config started a session");
    }
});
