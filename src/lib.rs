//! # Deltaplay
//!
//! Deltaplay is a rollback netplay engine for deterministic emulation cores, written in 100% safe Rust.
//! Two peers run the same core; each side simulates ahead with a guess of the remote input, keeps
//! a snapshot of every unconfirmed frame in a fixed ring, and re-simulates from the earliest
//! wrong guess once the real input arrives. Spectators receive the confirmed input stream.
//!
//! The core is driven through the [`CoreState`] trait and the link through [`NonBlockingStream`].
//! A session is created with a [`SessionBuilder`] and driven once per frame:
//!
//! ```
//! use deltaplay::{
//!     AdvanceOutcome, CoreState, FrameInputs, InputWords, MemoryStream, Role, SessionBuilder,
//! };
//!
//! struct Counter(u32);
//!
//! impl CoreState for Counter {
//!     fn state_size(&self) -> usize {
//!         4
//!     }
//!     fn save_state(&self, buf: &mut [u8]) -> bool {
//!         buf.copy_from_slice(&self.0.to_le_bytes());
//!         true
//!     }
//!     fn load_state(&mut self, buf: &[u8]) -> bool {
//!         let mut bytes = [0; 4];
//!         bytes.copy_from_slice(buf);
//!         self.0 = u32::from_le_bytes(bytes);
//!         true
//!     }
//!     fn run_frame(&mut self, inputs: &FrameInputs) {
//!         self.0 = self.0.wrapping_add(inputs.port(0).word(0) + inputs.port(1).word(0));
//!     }
//! }
//!
//! # fn main() -> Result<(), deltaplay::NetplayError> {
//! let (host_link, client_link) = MemoryStream::pair();
//! let mut host_core = Counter(0);
//! let mut client_core = Counter(0);
//! let mut host = SessionBuilder::new()
//!     .with_role(Role::Server)
//!     .with_nickname("host")
//!     .start_session(host_link, &host_core)?;
//! let mut client = SessionBuilder::new()
//!     .with_role(Role::Client)
//!     .with_nickname("guest")
//!     .start_session(client_link, &client_core)?;
//!
//! for _ in 0..10 {
//!     let a = host.advance_frame(&mut host_core, InputWords::new([1, 0, 0]))?;
//!     let b = client.advance_frame(&mut client_core, InputWords::new([2, 0, 0]))?;
//!     let _ = (a, b);
//! }
//! assert!(host.is_ready());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::fmt;
use std::net::SocketAddr;

pub use delta_store::{DeltaFrame, DeltaFrameStore};
pub use error::{CoreOperation, HandshakeField, NetplayError};
pub use network::handshake::HandshakeState;
pub use network::memory_stream::MemoryStream;
pub use network::messages::Message;
pub use network::tcp_stream::TcpNonBlockingStream;
pub use replay::{FinalizedInput, Replay, ReplayHeader};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{SessionConfig, StallConfig};
pub use sessions::rollback::RollbackState;
pub use sessions::schedule::PauseSchedule;
pub use sessions::session::{Session, SessionState};
pub use sessions::spectator::SpectatorId;
pub use sessions::stall::StallReason;
pub use web_time::Duration;

pub mod delta_store;
#[doc(hidden)]
pub mod error;
pub mod hash;
pub mod prelude;
pub mod replay;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod input_exchange;
    #[doc(hidden)]
    pub mod rollback;
    #[doc(hidden)]
    pub mod schedule;
    #[doc(hidden)]
    pub mod session;
    #[doc(hidden)]
    pub mod spectator;
    #[doc(hidden)]
    pub mod stall;
}
#[doc(hidden)]
pub mod network {
    #[doc(hidden)]
    pub mod channel;
    /// Binary codec for network message serialization.
    ///
    /// Provides centralized encoding and decoding of network messages using bincode.
    pub mod codec;
    #[doc(hidden)]
    pub mod handshake;
    #[doc(hidden)]
    pub mod memory_stream;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod tcp_stream;
}

/// Internal module exposing implementation details for testing and benchmarking.
///
/// **This module is NOT part of the public API.** Everything here may change without notice.
#[doc(hidden)]
pub mod __internal {
    pub use crate::delta_store::ring_index::RingIndex;
    pub use crate::network::channel::MessageChannel;
    pub use crate::network::codec::{decode, encode, CodecError};
    pub use crate::network::handshake::{Handshake, HandshakeProgress, LocalIdentity};
    pub use crate::network::messages::{MessageBody, MessageHeader};
    pub use crate::sessions::input_exchange::{InputExchange, RemoteInputOutcome};
    pub use crate::sessions::rollback::{Reconciliation, RollbackEngine};
    pub use crate::sessions::schedule::{FlipSchedule, PauseAgreement};
    pub use crate::sessions::spectator::{SpectatorFeed, SpectatorSet};
    pub use crate::sessions::stall::{StallController, StallUpdate};
}

// #############
// # CONSTANTS #
// #############

/// Words budgeted per frame on the wire. One word is reserved for framing.
pub const WORDS_PER_FRAME: usize = 4;

/// Input words carried for each peer and frame.
pub const INPUT_WORDS: usize = WORDS_PER_FRAME - 1;

/// Maximum number of spectators a host feeds at the same time.
pub const MAX_SPECTATORS: usize = 16;

/// Well-known netplay port.
pub const DEFAULT_PORT: u16 = 55435;

/// Wire protocol version. Peers with a different version are rejected at the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic value at the head of every message and replay header.
pub const NETPLAY_MAGIC: u32 = 0x444C_5054;

/// Nickname buffer size in bytes, including the terminating NUL of the wire format.
/// Nicknames longer than `MAX_NICK_LEN - 1` bytes are truncated.
pub const MAX_NICK_LEN: usize = 32;

/// A frame is a single step of core execution.
///
/// Frame numbers start at 0 and increment by one per simulated frame. They wrap only at
/// `u32` overflow, never at ring buffer wrap. Because of that, `Frame` deliberately does not
/// implement `Ord`: use [`Frame::is_before`] and [`Frame::distance_from`], which compare by
/// wrapping distance and therefore keep working across the overflow boundary.
///
/// # Examples
///
/// ```
/// use deltaplay::Frame;
///
/// let frame = Frame::new(u32::MAX);
/// let next = frame.next();
/// assert_eq!(next.as_u32(), 0);
/// assert!(frame.is_before(next));
/// assert_eq!(next.distance_from(frame), 1);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// The first frame of a session.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame` from a `u32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The frame after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Frame(self.0.wrapping_add(1))
    }

    /// The frame before this one.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Frame(self.0.wrapping_sub(1))
    }

    /// This frame advanced by `count` frames.
    #[inline]
    #[must_use]
    pub const fn add(self, count: u32) -> Self {
        Frame(self.0.wrapping_add(count))
    }

    /// Number of frames from `earlier` up to `self`.
    ///
    /// Only meaningful when `earlier` is not after `self`.
    #[inline]
    #[must_use]
    pub const fn distance_from(self, earlier: Frame) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Returns `true` if `self` comes strictly before `other`, comparing by wrapping distance.
    #[inline]
    #[must_use]
    pub const fn is_before(self, other: Frame) -> bool {
        (other.0.wrapping_sub(self.0) as i32) > 0
    }

    /// Returns `true` if `self` lies in `[start, end)` (in wrapping frame order).
    #[inline]
    #[must_use]
    pub const fn is_within(self, start: Frame, end: Frame) -> bool {
        self.distance_from(start) < end.distance_from(start)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// The input words one peer contributes for one frame.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct InputWords([u32; INPUT_WORDS]);

impl InputWords {
    /// No buttons pressed.
    pub const ZERO: InputWords = InputWords([0; INPUT_WORDS]);

    /// Wraps raw input words.
    #[inline]
    #[must_use]
    pub const fn new(words: [u32; INPUT_WORDS]) -> Self {
        InputWords(words)
    }

    /// The raw words.
    #[inline]
    #[must_use]
    pub const fn words(&self) -> [u32; INPUT_WORDS] {
        self.0
    }

    /// A single word, or 0 for an out-of-range index.
    #[inline]
    #[must_use]
    pub fn word(&self, index: usize) -> u32 {
        self.0.get(index).copied().unwrap_or(0)
    }
}

/// Which end of the session this process is.
///
/// Server and client are both players; the server additionally owns the flip decision and
/// feeds spectators. A spectator only receives confirmed input from a server.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum Role {
    /// Hosting player. Controls port 0 until a flip.
    #[default]
    Server,
    /// Connecting player. Controls port 1 until a flip.
    Client,
    /// Read-only observer of a server.
    Spectator,
}

impl Role {
    /// Returns `true` for the two roles that contribute input.
    #[inline]
    #[must_use]
    pub const fn is_player(self) -> bool {
        matches!(self, Role::Server | Role::Client)
    }

    /// The port this role controls before any flip.
    #[inline]
    #[must_use]
    pub const fn home_port(self) -> usize {
        match self {
            Role::Server | Role::Spectator => 0,
            Role::Client => 1,
        }
    }

    /// Compact wire representation, used where the handshake reports role mismatches.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Role::Server => 0,
            Role::Client => 1,
            Role::Spectator => 2,
        }
    }

    /// Whether a peer in `remote` role may sit on the other end of a link we hold in `self` role.
    #[must_use]
    pub const fn accepts(self, remote: Role) -> bool {
        matches!(
            (self, remote),
            (Role::Server, Role::Client | Role::Spectator)
                | (Role::Client | Role::Spectator, Role::Server)
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
            Role::Spectator => write!(f, "spectator"),
        }
    }
}

/// The inputs handed to the core for one frame, already mapped to controller ports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameInputs {
    /// The frame being simulated.
    pub frame: Frame,
    /// Input per controller port.
    pub ports: [InputWords; 2],
    /// `true` when this frame is being re-simulated after a rollback. Cores typically skip
    /// audio and video output for replayed frames.
    pub replay: bool,
}

impl FrameInputs {
    /// Input of one port, or [`InputWords::ZERO`] for ports that do not exist.
    #[inline]
    #[must_use]
    pub fn port(&self, port: usize) -> InputWords {
        self.ports.get(port).copied().unwrap_or(InputWords::ZERO)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`Session::disconnect`] was called locally.
    LocalHangup,
    /// The remote announced a graceful hangup or closed the link.
    RemoteHangup,
    /// A fatal error ended the session.
    Error(NetplayError),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalHangup => write!(f, "local hangup"),
            DisconnectReason::RemoteHangup => write!(f, "remote hangup"),
            DisconnectReason::Error(err) => write!(f, "{}", err),
        }
    }
}

/// Notifications that you can receive from the session. Handling them is up to the user.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new event types may be
/// added in future versions. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The handshake completed and frames can be exchanged.
    Connected {
        /// The remote peer's nickname.
        remote_nickname: String,
    },
    /// The session ended.
    Disconnected {
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// Local progress is suspended until the remote confirms more frames.
    StallEntered {
        /// Why the session stalled.
        reason: StallReason,
        /// The frame the session is waiting to simulate.
        frame: Frame,
    },
    /// The stall cleared.
    StallExited {
        /// Polls spent stalled.
        polls: u32,
        /// Wall time spent stalled.
        duration: Duration,
    },
    /// A misprediction was corrected by re-simulating frames `from..to`.
    RollbackOccurred {
        /// First re-simulated frame.
        from: Frame,
        /// The frame the session resumed at (exclusive).
        to: Frame,
    },
    /// A player flip took effect.
    FlipApplied {
        /// The frame the flip applies from.
        frame: Frame,
        /// Whether ports are swapped from this frame on.
        flipped: bool,
    },
    /// Both peers halted input consumption at `frame`.
    PauseApplied {
        /// The frame that will be simulated after resuming.
        frame: Frame,
    },
    /// The session resumed after a pause, or a pending pause was cancelled.
    Resumed {
        /// The frame the session resumes at.
        frame: Frame,
    },
    /// A spectator finished its handshake and started receiving the input stream.
    SpectatorJoined {
        /// The spectator's id.
        id: SpectatorId,
        /// The spectator's nickname.
        nickname: String,
    },
    /// A spectator was dropped. The primary session is unaffected.
    SpectatorLeft {
        /// The spectator's id.
        id: SpectatorId,
        /// Why it was dropped.
        reason: DisconnectReason,
    },
}

/// Result of [`Session::advance_frame`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// One new frame was simulated.
    Advanced {
        /// The frame that was simulated.
        frame: Frame,
        /// The remote is ahead of us; the frontend should run the next frames
        /// without presenting them until this clears.
        fast_forward: bool,
    },
    /// No frame was simulated. Call again on the next tick.
    Waiting(WaitReason),
}

/// Why [`Session::advance_frame`] did not simulate a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitReason {
    /// The handshake has not completed.
    Handshaking,
    /// The stall controller is holding the session back.
    Stalled(StallReason),
    /// Both peers are paused.
    Paused,
    /// A spectator has no confirmed frame to show yet.
    WaitingForHost,
}

// #############
// #  TRAITS   #
// #############

/// The emulation core, seen as a black box that can be snapshotted and stepped.
///
/// Every call to [`run_frame`](CoreState::run_frame) must be deterministic: the same state and
/// the same inputs always produce the same next state. Snapshots must capture all of it.
pub trait CoreState {
    /// Size in bytes of a serialized snapshot. Must not change during a session.
    fn state_size(&self) -> usize;

    /// Serializes the current state into `buf` (exactly [`state_size`](CoreState::state_size) bytes).
    /// Returns `false` if the core cannot serialize right now.
    fn save_state(&self, buf: &mut [u8]) -> bool;

    /// Restores the state from `buf`. Returns `false` if the blob was rejected.
    fn load_state(&mut self, buf: &[u8]) -> bool;

    /// Simulates exactly one frame with the given inputs.
    fn run_frame(&mut self, inputs: &FrameInputs);
}

/// This [`NonBlockingStream`] trait is used when you want to use Deltaplay with your own transport.
///
/// The stream must be reliable and ordered (TCP-like). Both methods must return immediately:
/// when no data can be moved, return an error of kind [`std::io::ErrorKind::WouldBlock`].
/// `read` returning `Ok(0)` means the remote closed the stream.
pub trait NonBlockingStream {
    /// Reads available bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Writes as many bytes of `buf` as the transport accepts right now.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// The remote address, if the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl<T: NonBlockingStream + ?Sized> NonBlockingStream for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (**self).write(buf)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

// ###################
// # UNIT TESTS      #
// ###################

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
    fn frame_next_wraps_at_overflow() {
        assert_eq!(Frame::new(u32::MAX).next(), Frame::ZERO);
        assert_eq!(Frame::ZERO.prev(), Frame::new(u32::MAX));
    }

    #[test]
    fn frame_ordering_survives_overflow() {
        let late = Frame::new(u32::MAX - 2);
        let wrapped = late.add(5);
        assert_eq!(wrapped, Frame::new(2));
        assert!(late.is_before(wrapped));
        assert!(!wrapped.is_before(late));
        assert_eq!(wrapped.distance_from(late), 5);
    }

    #[test]
    fn frame_is_not_before_itself() {
        let frame = Frame::new(7);
        assert!(!frame.is_before(frame));
    }

    #[test]
    fn frame_is_within_half_open_range() {
        let start = Frame::new(3);
        let end = Frame::new(6);
        assert!(Frame::new(3).is_within(start, end));
        assert!(Frame::new(5).is_within(start, end));
        assert!(!Frame::new(6).is_within(start, end));
        assert!(!Frame::new(2).is_within(start, end));
    }

    #[test]
    fn input_words_out_of_range_is_zero() {
        let words = InputWords::new([1, 2, 3]);
        assert_eq!(words.word(2), 3);
        assert_eq!(words.word(INPUT_WORDS), 0);
    }

    #[test]
    fn roles_pair_up() {
        assert!(Role::Server.accepts(Role::Client));
        assert!(Role::Server.accepts(Role::Spectator));
        assert!(Role::Client.accepts(Role::Server));
        assert!(Role::Spectator.accepts(Role::Server));
        assert!(!Role::Server.accepts(Role::Server));
        assert!(!Role::Client.accepts(Role::Client));
        assert!(!Role::Client.accepts(Role::Spectator));
    }

    #[test]
    fn home_ports_differ_between_players() {
        assert_ne!(Role::Server.home_port(), Role::Client.home_port());
    }

    #[test]
    fn frame_inputs_missing_port_is_zero() {
        let inputs = FrameInputs {
            frame: Frame::ZERO,
            ports: [InputWords::new([1, 0, 0]), InputWords::new([2, 0, 0])],
            replay: false,
        };
        assert_eq!(inputs.port(1).word(0), 2);
        assert_eq!(inputs.port(5), InputWords::ZERO);
    }

    #[test]
    fn input_words_budget_reserves_one_word() {
        assert_eq!(INPUT_WORDS + 1, WORDS_PER_FRAME);
    }
}
