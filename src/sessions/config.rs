//! Configuration types for Deltaplay sessions.
//!
//! The session only reads resolved values; loading them from files or the command line is
//! up to the frontend.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `SessionConfig` | Role, identity, ring depth, tolerances | `lan()`, `high_latency()` |
//! | `StallConfig` | When a stalled session gives up | `lan()`, `high_latency()` |
//!
//! # Example
//!
//! ```
//! use deltaplay::{Role, SessionBuilder, SessionConfig};
//!
//! let config = SessionConfig {
//!     role: Role::Client,
//!     nickname: "guest".to_owned(),
//!     ..SessionConfig::high_latency()
//! };
//! assert!(config.validate().is_ok());
//! let builder = SessionBuilder::new().with_config(config);
//! # let _ = builder;
//! ```

use std::net::{IpAddr, SocketAddr};

use crate::{NetplayError, Role, DEFAULT_PORT};

/// Deepest supported speculation window.
pub const MAX_SYNC_FRAMES: usize = 128;

/// Largest accepted event queue.
pub const MAX_EVENT_QUEUE_SIZE: usize = 10_000;

/// Configuration for the stall controller.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Use the
/// `..StallConfig::default()` pattern when constructing instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "StallConfig has no effect unless stored in a SessionConfig"]
pub struct StallConfig {
    /// Polls a stalled session waits for the remote to confirm a frame before it
    /// disconnects with [`NetplayError::RemoteTimeout`]. Polls while paused do not count.
    ///
    /// Default: 600 (10 seconds at 60 polls per second)
    pub max_stall_polls: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            max_stall_polls: 600,
        }
    }
}

impl StallConfig {
    /// Gives up quickly; a LAN peer that stops confirming is gone.
    pub fn lan() -> Self {
        Self {
            max_stall_polls: 180,
        }
    }

    /// Tolerates long hiccups on slow links.
    pub fn high_latency() -> Self {
        Self {
            max_stall_polls: 1800,
        }
    }
}

/// Resolved settings for one session.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Use the
/// `..SessionConfig::default()` pattern when constructing instances.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "SessionConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct SessionConfig {
    /// Which end of the link this process is.
    ///
    /// Default: [`Role::Server`]
    pub role: Role,

    /// How many frames the local side may simulate ahead of the last confirmed frame.
    /// The ring holds `sync_frames + 1` snapshots.
    ///
    /// Default: 8
    pub sync_frames: usize,

    /// Nickname announced to the remote. Truncated to 31 bytes.
    ///
    /// Default: `"player"`
    pub nickname: String,

    /// Address of the server, for clients and spectators. Informational for servers.
    ///
    /// Default: `None`
    pub server_addr: Option<IpAddr>,

    /// Netplay port.
    ///
    /// Default: [`DEFAULT_PORT`]
    pub port: u16,

    /// Hash identifying the core implementation; see [`core_magic`](crate::hash::core_magic).
    /// Both peers must agree.
    ///
    /// Default: 0
    pub core_magic: u32,

    /// CRC of the loaded content as computed by the frontend. Both peers must agree.
    ///
    /// Default: 0
    pub content_crc: u32,

    /// Stall controller settings.
    pub stall: StallConfig,

    /// Malformed packets in a row that are dropped before the link is considered broken.
    ///
    /// Default: 3
    pub max_malformed_packets: u32,

    /// Events kept for [`Session::events`](crate::Session::events). The oldest are dropped
    /// when the queue is full.
    ///
    /// Default: 100
    pub event_queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            sync_frames: 8,
            nickname: "player".to_owned(),
            server_addr: None,
            port: DEFAULT_PORT,
            core_magic: 0,
            content_crc: 0,
            stall: StallConfig::default(),
            max_malformed_packets: 3,
            event_queue_size: 100,
        }
    }
}

impl SessionConfig {
    /// Creates a new `SessionConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: a short speculation window and a quick stall timeout.
    pub fn lan() -> Self {
        Self {
            sync_frames: 4,
            stall: StallConfig::lan(),
            ..Self::default()
        }
    }

    /// Preset for links with 100-200ms RTT: a deeper window so the local side rarely
    /// stalls, and a patient stall timeout.
    pub fn high_latency() -> Self {
        Self {
            sync_frames: 16,
            stall: StallConfig::high_latency(),
            max_malformed_packets: 5,
            ..Self::default()
        }
    }

    /// The server's socket address, when one is configured.
    #[must_use]
    pub fn server_socket_addr(&self) -> Option<SocketAddr> {
        self.server_addr.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if any value is out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.sync_frames < 1 || self.sync_frames > MAX_SYNC_FRAMES {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "sync_frames must be between 1 and {}, got {}",
                    MAX_SYNC_FRAMES, self.sync_frames
                ),
            });
        }
        if self.stall.max_stall_polls < 1 {
            return Err(NetplayError::InvalidRequest {
                info: "stall.max_stall_polls must be at least 1".to_owned(),
            });
        }
        if self.event_queue_size < 1 || self.event_queue_size > MAX_EVENT_QUEUE_SIZE {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "event_queue_size must be between 1 and {}, got {}",
                    MAX_EVENT_QUEUE_SIZE, self.event_queue_size
                ),
            });
        }
        if self.port == 0 && self.server_addr.is_some() {
            return Err(NetplayError::InvalidRequest {
                info: "a server address needs a non-zero port".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        assert_eq!(config.sync_frames, 8);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.stall.max_stall_polls, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn presets_are_valid() {
        assert!(SessionConfig::lan().validate().is_ok());
        assert!(SessionConfig::high_latency().validate().is_ok());
        assert!(SessionConfig::lan().sync_frames < SessionConfig::high_latency().sync_frames);
    }

    #[test]
    fn zero_sync_frames_is_rejected() {
        let config = SessionConfig {
            sync_frames: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn oversized_sync_frames_is_rejected() {
        let config = SessionConfig {
            sync_frames: MAX_SYNC_FRAMES + 1,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_stall_polls_is_rejected() {
        let config = SessionConfig {
            stall: StallConfig { max_stall_polls: 0 },
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_event_queue_is_rejected() {
        let config = SessionConfig {
            event_queue_size: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_socket_addr_uses_port() {
        let config = SessionConfig {
            server_addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..SessionConfig::default()
        };
        assert_eq!(
            config.server_socket_addr(),
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT))
        );
        let no_port = SessionConfig { port: 0, ..config };
        assert!(no_port.validate().is_err());
    }
}
