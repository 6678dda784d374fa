use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::Frame;

/// Which handshake field two peers disagreed on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HandshakeField {
    /// The emulation core implementation (name, version and protocol) differs.
    CoreImplementation,
    /// The loaded content differs.
    ContentCrc,
    /// The serialized state size differs, so snapshots cannot be exchanged.
    StateSize,
    /// Both ends claim roles that cannot talk to each other (e.g. two servers).
    Role,
}

impl Display for HandshakeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeField::CoreImplementation => write!(f, "core implementation"),
            HandshakeField::ContentCrc => write!(f, "content crc"),
            HandshakeField::StateSize => write!(f, "state size"),
            HandshakeField::Role => write!(f, "role"),
        }
    }
}

/// Core state operation that failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CoreOperation {
    /// Serializing the core into a snapshot buffer.
    Save,
    /// Restoring the core from a snapshot buffer.
    Load,
}

impl Display for CoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreOperation::Save => write!(f, "save"),
            CoreOperation::Load => write!(f, "load"),
        }
    }
}

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// Use [`NetplayError::is_fatal`] to find out whether the session survived the error. Fatal
/// errors leave the session in [`SessionState::Disconnected`], with its buffers and link released.
///
/// [`Result<(), NetplayError>`]: std::result::Result
/// [`SessionState::Disconnected`]: crate::SessionState::Disconnected
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// The remote peer speaks a different protocol (wrong magic or protocol version).
    /// Rejected during the handshake, before any frame data is exchanged.
    ProtocolVersionMismatch {
        /// Our magic value.
        local_magic: u32,
        /// Our protocol version.
        local_version: u32,
        /// The magic value the remote sent.
        remote_magic: u32,
        /// The protocol version the remote sent.
        remote_version: u32,
    },
    /// The remote peer runs a different core, different content, or an incompatible role.
    HandshakeMismatch {
        /// The field the peers disagreed on.
        field: HandshakeField,
        /// Our value.
        local: u32,
        /// The remote's value.
        remote: u32,
    },
    /// A received packet or blob failed validation and was dropped.
    MalformedPacket {
        /// What was wrong with it.
        context: String,
    },
    /// The remote broke the protocol in a way that cannot be recovered from,
    /// e.g. input frames going backwards or too many malformed packets in a row.
    ProtocolViolation {
        /// A description of the violation.
        context: String,
    },
    /// Advancing would have overwritten a snapshot that is not yet confirmed.
    BufferOverrun {
        /// The frame that would have been written.
        frame: Frame,
    },
    /// The remote stopped confirming frames for longer than the configured stall limit.
    RemoteTimeout {
        /// How many polls the session waited without progress.
        stalled_polls: u32,
    },
    /// A nickname exceeded the maximum length. It was truncated and the session continued.
    IdentityTooLong {
        /// The length of the nickname in bytes.
        len: usize,
        /// The maximum length in bytes.
        max: usize,
    },
    /// Reading from or writing to the link failed.
    TransportError {
        /// A description of the transport error.
        context: String,
    },
    /// A state blob did not have the negotiated size.
    InvalidStateSize {
        /// The negotiated state size.
        expected: usize,
        /// The size that was supplied.
        actual: usize,
    },
    /// The emulation core refused to save or load a snapshot.
    CoreStateFailed {
        /// The failing operation.
        operation: CoreOperation,
        /// The frame the snapshot belongs to.
        frame: Frame,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls
    /// or by calling an operation in the wrong session state.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The session is disconnected. No further frames can be processed.
    Disconnected,
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl NetplayError {
    /// Returns `true` if this error ends the session.
    ///
    /// ```
    /// use deltaplay::NetplayError;
    ///
    /// assert!(NetplayError::RemoteTimeout { stalled_polls: 600 }.is_fatal());
    /// assert!(!NetplayError::IdentityTooLong { len: 40, max: 31 }.is_fatal());
    /// ```
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            NetplayError::MalformedPacket { .. }
            | NetplayError::IdentityTooLong { .. }
            | NetplayError::InvalidRequest { .. } => false,
            NetplayError::ProtocolVersionMismatch { .. }
            | NetplayError::HandshakeMismatch { .. }
            | NetplayError::ProtocolViolation { .. }
            | NetplayError::BufferOverrun { .. }
            | NetplayError::RemoteTimeout { .. }
            | NetplayError::TransportError { .. }
            | NetplayError::InvalidStateSize { .. }
            | NetplayError::CoreStateFailed { .. }
            | NetplayError::Disconnected
            | NetplayError::InternalError { .. } => true,
        }
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::ProtocolVersionMismatch {
                local_magic,
                local_version,
                remote_magic,
                remote_version,
            } => {
                write!(
                    f,
                    "Protocol mismatch: local magic {:#010x} v{}, remote magic {:#010x} v{}",
                    local_magic, local_version, remote_magic, remote_version
                )
            }
            NetplayError::HandshakeMismatch {
                field,
                local,
                remote,
            } => {
                write!(
                    f,
                    "Handshake rejected, {} differs: local {:#010x}, remote {:#010x}",
                    field, local, remote
                )
            }
            NetplayError::MalformedPacket { context } => {
                write!(f, "Malformed packet: {}", context)
            }
            NetplayError::ProtocolViolation { context } => {
                write!(f, "Protocol violation: {}", context)
            }
            NetplayError::BufferOverrun { frame } => {
                write!(
                    f,
                    "Delta frame buffer overrun while preparing frame {}",
                    frame
                )
            }
            NetplayError::RemoteTimeout { stalled_polls } => {
                write!(
                    f,
                    "Remote peer unresponsive after {} stalled polls",
                    stalled_polls
                )
            }
            NetplayError::IdentityTooLong { len, max } => {
                write!(
                    f,
                    "Nickname of {} bytes exceeds the maximum of {} bytes and was truncated",
                    len, max
                )
            }
            NetplayError::TransportError { context } => {
                write!(f, "Transport error: {}", context)
            }
            NetplayError::InvalidStateSize { expected, actual } => {
                write!(
                    f,
                    "State blob has {} bytes, expected {} bytes",
                    actual, expected
                )
            }
            NetplayError::CoreStateFailed { operation, frame } => {
                write!(f, "Core failed to {} state for frame {}", operation, frame)
            }
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            NetplayError::Disconnected => {
                write!(f, "The session is disconnected.")
            }
            NetplayError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            }
        }
    }
}

impl Error for NetplayError {}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_taxonomy() {
        assert!(NetplayError::TransportError {
            context: "reset".to_owned()
        }
        .is_fatal());
        assert!(NetplayError::BufferOverrun {
            frame: Frame::new(9)
        }
        .is_fatal());
        assert!(!NetplayError::MalformedPacket {
            context: "short".to_owned()
        }
        .is_fatal());
        assert!(!NetplayError::InvalidRequest {
            info: "flip pending".to_owned()
        }
        .is_fatal());
    }

    #[test]
    fn display_mentions_mismatched_field() {
        let err = NetplayError::HandshakeMismatch {
            field: HandshakeField::ContentCrc,
            local: 1,
            remote: 2,
        };
        let text = err.to_string();
        assert!(text.contains("content crc"), "{text}");
    }

    #[test]
    fn display_version_mismatch_shows_both_versions() {
        let err = NetplayError::ProtocolVersionMismatch {
            local_magic: 0x1,
            local_version: 1,
            remote_magic: 0x1,
            remote_version: 2,
        };
        let text = err.to_string();
        assert!(text.contains("v1"));
        assert!(text.contains("v2"));
    }

    #[test]
    fn errors_are_std_errors() {
        fn assert_error<E: Error>(_: &E) {}
        assert_error(&NetplayError::Disconnected);
    }
}
