use std::net::IpAddr;
use std::sync::Arc;

use crate::hash::core_magic;
use crate::sessions::config::{SessionConfig, StallConfig, MAX_EVENT_QUEUE_SIZE, MAX_SYNC_FRAMES};
use crate::telemetry::ViolationObserver;
use crate::{CoreState, NetplayError, NonBlockingStream, Role, Session};

/// The [`SessionBuilder`] builds every Deltaplay [`Session`].
///
/// After setting all appropriate values, use [`SessionBuilder::start_session`] to consume
/// the builder and open the session over a connected stream.
#[must_use = "SessionBuilder must be consumed by calling start_session"]
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("config", config)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration, e.g. with one of the [`SessionConfig`] presets.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets which end of the session this process is. Default is [`Role::Server`].
    pub fn with_role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    /// Sets the nickname sent to the remote. Longer than 31 bytes is truncated with a warning.
    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.config.nickname = nickname.into();
        self
    }

    /// Sets the speculation window: how many frames this side may run ahead of the last
    /// frame both players confirmed. Default is 8.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if `sync_frames` is 0 or larger than 128.
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn with_sync_frames(mut self, sync_frames: usize) -> Result<Self, NetplayError> {
        if sync_frames == 0 || sync_frames > MAX_SYNC_FRAMES {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "sync_frames must be between 1 and {}, got {}",
                    MAX_SYNC_FRAMES, sync_frames
                ),
            });
        }
        self.config.sync_frames = sync_frames;
        Ok(self)
    }

    /// Identifies the core by name and version. Both peers must report the same pair.
    pub fn with_core(mut self, name: &str, version: &str) -> Self {
        self.config.core_magic = core_magic(name, version);
        self
    }

    /// Sets a precomputed core identity instead of [`with_core`](Self::with_core).
    pub fn with_core_magic(mut self, magic: u32) -> Self {
        self.config.core_magic = magic;
        self
    }

    /// Sets the CRC of the loaded content. Both peers must report the same value.
    pub fn with_content_crc(mut self, content_crc: u32) -> Self {
        self.config.content_crc = content_crc;
        self
    }

    /// Sets the server address and port, for frontends that connect from the config.
    pub fn with_server(mut self, addr: IpAddr, port: u16) -> Self {
        self.config.server_addr = Some(addr);
        self.config.port = port;
        self
    }

    /// Sets the stall timeout.
    pub fn with_stall_config(mut self, stall: StallConfig) -> Self {
        self.config.stall = stall;
        self
    }

    /// Sets how many consecutive malformed messages end the session. Default is 3.
    pub fn with_max_malformed_packets(mut self, max: u32) -> Self {
        self.config.max_malformed_packets = max;
        self
    }

    /// Sets the maximum number of queued events before the oldest are dropped. Default is 100.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if `size` is 0 or above the supported maximum.
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn with_event_queue_size(mut self, size: usize) -> Result<Self, NetplayError> {
        if size == 0 || size > MAX_EVENT_QUEUE_SIZE {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "event queue size must be between 1 and {}, got {}",
                    MAX_EVENT_QUEUE_SIZE, size
                ),
            });
        }
        self.config.event_queue_size = size;
        Ok(self)
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// Malformed messages, dropped duplicates, and truncated nicknames are reported to it.
    /// If no observer is set, violations are logged via the `tracing` crate.
    ///
    /// # Example
    ///
    /// ```
    /// use deltaplay::{telemetry::CollectingObserver, SessionBuilder};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new().with_violation_observer(observer.clone());
    /// # let _ = builder;
    /// assert!(observer.violations().is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// The configuration built so far.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Consumes the builder and opens a [`Session`] over `stream`, sending our half of the
    /// handshake. The snapshot size is taken from `core`.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if the configuration is invalid.
    /// - Returns the transport error if the handshake cannot be written.
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn start_session<C>(
        self,
        stream: impl NonBlockingStream + 'static,
        core: &C,
    ) -> Result<Session, NetplayError>
    where
        C: CoreState + ?Sized,
    {
        self.config.validate()?;
        Session::new(
            self.config,
            self.violation_observer,
            Box::new(stream),
            core.state_size(),
        )
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
    use crate::{FrameInputs, MemoryStream, SessionState};

    struct Blank;

    impl CoreState for Blank {
        fn state_size(&self) -> usize {
            16
        }
        fn save_state(&self, _buf: &mut [u8]) -> bool {
            true
        }
        fn load_state(&mut self, _buf: &[u8]) -> bool {
            true
        }
        fn run_frame(&mut self, _inputs: &FrameInputs) {}
    }

    #[test]
    fn test_builder_defaults() {
        let builder = SessionBuilder::new();
        assert_eq!(builder.config(), &SessionConfig::default());
    }

    #[test]
    fn test_with_sync_frames_bounds() {
        assert!(SessionBuilder::new().with_sync_frames(0).is_err());
        assert!(SessionBuilder::new()
            .with_sync_frames(MAX_SYNC_FRAMES + 1)
            .is_err());
        let builder = SessionBuilder::new().with_sync_frames(16).unwrap();
        assert_eq!(builder.config().sync_frames, 16);
    }

    #[test]
    fn test_with_event_queue_size_bounds() {
        assert!(SessionBuilder::new().with_event_queue_size(0).is_err());
        assert!(SessionBuilder::new().with_event_queue_size(50).is_ok());
    }

    #[test]
    fn test_with_core_matches_hash() {
        let builder = SessionBuilder::new().with_core("snes9x", "1.62");
        assert_eq!(builder.config().core_magic, core_magic("snes9x", "1.62"));
        assert_ne!(
            builder.config().core_magic,
            core_magic("snes9x", "1.63")
        );
    }

    #[test]
    fn test_start_session_uses_core_state_size() {
        let (a, _b) = MemoryStream::pair();
        let session = SessionBuilder::new().start_session(a, &Blank).unwrap();
        assert_eq!(session.store().unwrap().state_size(), 16);
        assert_eq!(session.current_state(), SessionState::Handshaking);
    }

    #[test]
    fn test_start_session_rejects_invalid_config() {
        let (a, _b) = MemoryStream::pair();
        let config = SessionConfig {
            sync_frames: 0,
            ..SessionConfig::default()
        };
        let result = SessionBuilder::new().with_config(config).start_session(a, &Blank);
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }

    #[test]
    fn test_start_session_fails_on_closed_stream() {
        let (a, b) = MemoryStream::pair();
        drop(b);
        let result = SessionBuilder::new().start_session(a, &Blank);
        assert!(matches!(result, Err(NetplayError::TransportError { .. })));
    }
}
