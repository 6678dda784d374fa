//! Integration tests for configuration structs.
//!
//! These tests verify that:
//! 1. Config structs have sensible defaults and presets
//! 2. Out-of-range values are rejected before a session starts
//! 3. Configs are properly applied to sessions

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::ip_constant
)]

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

use common::stubs::CoreStub;
use common::test_utils::Pair;
use deltaplay::{
    AdvanceOutcome, Frame, InputWords, MemoryStream, NetplayError, Role, SessionBuilder,
    SessionConfig, StallConfig, StallReason, WaitReason, DEFAULT_PORT,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

// ============================================================================
// StallConfig Tests
// ============================================================================

#[test]
fn test_stall_config_default() {
    assert_eq!(StallConfig::default().max_stall_polls, 600);
}

#[test]
fn test_stall_config_presets() {
    let lan = StallConfig::lan();
    let slow = StallConfig::high_latency();
    assert!(lan.max_stall_polls < StallConfig::default().max_stall_polls);
    assert!(slow.max_stall_polls > StallConfig::default().max_stall_polls);
}

// ============================================================================
// SessionConfig Tests
// ============================================================================

#[test]
fn test_session_config_default() {
    let config = SessionConfig::default();

    assert_eq!(config.role, Role::Server);
    assert_eq!(config.sync_frames, 8);
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.server_addr, None);
    assert_eq!(config.max_malformed_packets, 3);
    assert_eq!(config.event_queue_size, 100);
    assert_eq!(config, SessionConfig::new());
    assert!(config.validate().is_ok());
}

#[test]
fn test_session_config_presets_are_valid() {
    let lan = SessionConfig::lan();
    let slow = SessionConfig::high_latency();

    assert!(lan.sync_frames < slow.sync_frames);
    assert_eq!(lan.stall, StallConfig::lan());
    assert_eq!(slow.stall, StallConfig::high_latency());
    assert!(lan.validate().is_ok());
    assert!(slow.validate().is_ok());
}

#[test]
fn test_server_socket_addr() {
    let config = SessionConfig {
        server_addr: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
        port: 4000,
        ..SessionConfig::default()
    };
    assert_eq!(
        config.server_socket_addr(),
        Some(SocketAddr::from(([10, 0, 0, 7], 4000)))
    );
    assert_eq!(SessionConfig::default().server_socket_addr(), None);
}

// ============================================================================
// Validation Tests
// ============================================================================

#[test]
fn test_out_of_range_values_are_rejected() {
    let invalid = [
        SessionConfig {
            sync_frames: 0,
            ..SessionConfig::default()
        },
        SessionConfig {
            sync_frames: 129,
            ..SessionConfig::default()
        },
        SessionConfig {
            event_queue_size: 0,
            ..SessionConfig::default()
        },
        SessionConfig {
            stall: StallConfig { max_stall_polls: 0 },
            ..SessionConfig::default()
        },
        SessionConfig {
            server_addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 0,
            ..SessionConfig::default()
        },
    ];

    for config in invalid {
        assert!(
            matches!(config.validate(), Err(NetplayError::InvalidRequest { .. })),
            "{:?} should be invalid",
            config
        );
        let (link, _peer) = MemoryStream::pair();
        let result = SessionBuilder::new()
            .with_config(config)
            .start_session(link, &CoreStub::new());
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }
}

#[test]
fn test_builder_setters_check_ranges() {
    assert!(SessionBuilder::new().with_sync_frames(0).is_err());
    assert!(SessionBuilder::new().with_sync_frames(128).is_ok());
    assert!(SessionBuilder::new().with_event_queue_size(0).is_err());
    assert!(SessionBuilder::new().with_event_queue_size(10).is_ok());
}

// ============================================================================
// Applied Config Tests
// ============================================================================

#[test]
fn test_sync_frames_sizes_the_ring() {
    let config = SessionConfig {
        sync_frames: 3,
        ..SessionConfig::default()
    };
    let mut pair = Pair::new(&config);
    pair.connect();

    let store = pair.host.store().unwrap();
    assert_eq!(store.sync_frames(), 3);
    assert_eq!(store.capacity(), 4);
    assert_eq!(pair.host.config().sync_frames, 3);

    // the client confirmed frame 0 only, so the host may run frames 1..=3
    for _ in 0..3 {
        pair.host_tick(InputWords::ZERO);
    }
    assert_eq!(pair.host.current_frame(), Frame::new(4));
    assert_eq!(
        pair.host_tick(InputWords::ZERO),
        AdvanceOutcome::Waiting(WaitReason::Stalled(StallReason::RunningFast))
    );
}

#[test]
fn test_presets_connect_and_play() {
    for config in [SessionConfig::lan(), SessionConfig::high_latency()] {
        let mut pair = Pair::new(&config);
        for _ in 0..30 {
            pair.tick(InputWords::new([1, 0, 0]), InputWords::new([2, 0, 0]));
        }
        pair.assert_confirmed_frames_agree();
    }
}
