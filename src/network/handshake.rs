//! Version and identity agreement at the start of every link.
//!
//! Both ends send [`Hello`] followed by [`Nickname`] as soon as the link exists, then
//! validate what the other side sent:
//!
//! ```text
//! Connecting --Hello ok--> VersionExchanged --Nickname--> IdentityExchanged --> Ready
//!     |                          |
//!     +--- any mismatch or out-of-order message: fatal error
//! ```
//!
//! Players go from `IdentityExchanged` to `Ready` right away. A spectator waits in
//! `IdentityExchanged` until it has loaded the host's starting snapshot.

use std::sync::Arc;

use tracing::debug;

use crate::network::messages::{Hello, Message, MessageBody, Nickname};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    HandshakeField, NetplayError, Role, MAX_NICK_LEN, NETPLAY_MAGIC, PROTOCOL_VERSION,
};

/// Progress of the handshake on one link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Our `Hello` is sent, the remote's has not arrived.
    Connecting,
    /// The remote's `Hello` was accepted; waiting for its nickname.
    VersionExchanged,
    /// Both identities are known.
    IdentityExchanged,
    /// Frame data may flow.
    Ready,
}

/// What a handshake message changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// The message was accepted, more are needed.
    Pending,
    /// The remote's identity is now known.
    Identified {
        /// The remote's nickname.
        nickname: String,
    },
}

/// Longest nickname that fits the wire buffer with its terminating NUL.
pub const MAX_NICK_BYTES: usize = MAX_NICK_LEN - 1;

/// Cuts `name` to at most [`MAX_NICK_BYTES`] bytes without splitting a character.
///
/// Returns the kept prefix and whether anything was cut.
#[must_use]
pub fn truncate_nickname(name: &str) -> (&str, bool) {
    if name.len() <= MAX_NICK_BYTES {
        return (name, false);
    }
    let mut end = MAX_NICK_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    (name.get(..end).unwrap_or_default(), true)
}

impl Nickname {
    /// Encodes `name`, truncated to [`MAX_NICK_BYTES`] bytes.
    #[must_use]
    pub fn encode(name: &str) -> Self {
        let (kept, _) = truncate_nickname(name);
        let mut bytes = [0u8; MAX_NICK_LEN];
        for (dst, src) in bytes.iter_mut().zip(kept.bytes()) {
            *dst = src;
        }
        Self { bytes }
    }

    /// The nickname up to the first NUL (or the buffer's last usable byte).
    ///
    /// Invalid UTF-8 from the remote is replaced, never rejected.
    #[must_use]
    pub fn decode(&self) -> String {
        let usable = self.bytes.get(..MAX_NICK_BYTES).unwrap_or(&self.bytes);
        let end = usable.iter().position(|&b| b == 0).unwrap_or(usable.len());
        String::from_utf8_lossy(usable.get(..end).unwrap_or_default()).into_owned()
    }
}

/// What this side announces in its `Hello` and `Nickname`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Our role on the link.
    pub role: Role,
    /// Hash of our core implementation.
    pub core_magic: u32,
    /// CRC of the loaded content.
    pub content_crc: u32,
    /// Our snapshot size in bytes.
    pub state_size: u32,
    /// Our nickname, already truncated.
    pub nickname: String,
}

impl LocalIdentity {
    /// Builds an identity, truncating `nickname` with an
    /// [`IdentityTooLong`](NetplayError::IdentityTooLong) warning if needed.
    pub fn new(
        role: Role,
        core_magic: u32,
        content_crc: u32,
        state_size: u32,
        nickname: &str,
        observer: &Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let (kept, truncated) = truncate_nickname(nickname);
        if truncated {
            let warning = NetplayError::IdentityTooLong {
                len: nickname.len(),
                max: MAX_NICK_BYTES,
            };
            report_violation_to!(
                observer,
                ViolationSeverity::Warning,
                ViolationKind::Handshake,
                "{}, truncated to {:?}",
                warning,
                kept
            );
        }
        Self {
            role,
            core_magic,
            content_crc,
            state_size,
            nickname: kept.to_owned(),
        }
    }

    /// The `Hello` for this identity.
    #[must_use]
    pub fn hello(&self) -> Hello {
        Hello {
            protocol_version: PROTOCOL_VERSION,
            role: self.role,
            core_magic: self.core_magic,
            content_crc: self.content_crc,
            state_size: self.state_size,
        }
    }
}

/// Handshake state machine for one link.
#[derive(Debug, Clone)]
pub struct Handshake {
    local: LocalIdentity,
    state: HandshakeState,
    remote_role: Option<Role>,
    remote_nickname: Option<String>,
}

impl Handshake {
    /// Starts a handshake in [`HandshakeState::Connecting`].
    #[must_use]
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            state: HandshakeState::Connecting,
            remote_role: None,
            remote_nickname: None,
        }
    }

    /// The two messages to send when the link opens.
    #[must_use]
    pub fn opening_messages(&self) -> [Message; 2] {
        [
            Message::new(MessageBody::Hello(self.local.hello())),
            Message::new(MessageBody::Nickname(Nickname::encode(&self.local.nickname))),
        ]
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Our identity.
    #[must_use]
    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    /// The remote's role, once its `Hello` was accepted.
    #[must_use]
    pub fn remote_role(&self) -> Option<Role> {
        self.remote_role
    }

    /// The remote's nickname, once received.
    #[must_use]
    pub fn remote_nickname(&self) -> Option<&str> {
        self.remote_nickname.as_deref()
    }

    /// Whether `msg` is one of the messages the handshake consumes.
    #[must_use]
    pub fn handles(msg: &Message) -> bool {
        matches!(msg.body, MessageBody::Hello(_) | MessageBody::Nickname(_))
    }

    /// Feeds one handshake message.
    ///
    /// Any mismatch or a message arriving in the wrong state is fatal.
    pub fn on_message(&mut self, msg: &Message) -> Result<HandshakeProgress, NetplayError> {
        match (&msg.body, self.state) {
            (MessageBody::Hello(hello), HandshakeState::Connecting) => {
                self.check_hello(msg.header.magic, hello)?;
                self.remote_role = Some(hello.role);
                self.state = HandshakeState::VersionExchanged;
                debug!(
                    "accepted hello from {} (protocol {})",
                    hello.role, hello.protocol_version
                );
                Ok(HandshakeProgress::Pending)
            },
            (MessageBody::Nickname(nick), HandshakeState::VersionExchanged) => {
                let nickname = nick.decode();
                self.remote_nickname = Some(nickname.clone());
                self.state = HandshakeState::IdentityExchanged;
                Ok(HandshakeProgress::Identified { nickname })
            },
            (body, state) => Err(NetplayError::ProtocolViolation {
                context: format!("unexpected {} message during handshake ({:?})", body.kind(), state),
            }),
        }
    }

    /// Moves from `IdentityExchanged` to `Ready`.
    pub fn mark_ready(&mut self) -> Result<(), NetplayError> {
        if self.state != HandshakeState::IdentityExchanged {
            return Err(NetplayError::InternalError {
                context: format!("cannot become ready from {:?}", self.state),
            });
        }
        self.state = HandshakeState::Ready;
        Ok(())
    }

    fn check_hello(&self, magic: u32, hello: &Hello) -> Result<(), NetplayError> {
        if magic != NETPLAY_MAGIC || hello.protocol_version != PROTOCOL_VERSION {
            return Err(NetplayError::ProtocolVersionMismatch {
                local_magic: NETPLAY_MAGIC,
                local_version: PROTOCOL_VERSION,
                remote_magic: magic,
                remote_version: hello.protocol_version,
            });
        }
        let local = &self.local;
        let checks = [
            (
                HandshakeField::Role,
                local.role.as_u32(),
                hello.role.as_u32(),
                local.role.accepts(hello.role),
            ),
            (
                HandshakeField::CoreImplementation,
                local.core_magic,
                hello.core_magic,
                local.core_magic == hello.core_magic,
            ),
            (
                HandshakeField::ContentCrc,
                local.content_crc,
                hello.content_crc,
                local.content_crc == hello.content_crc,
            ),
            (
                HandshakeField::StateSize,
                local.state_size,
                hello.state_size,
                local.state_size == hello.state_size,
            ),
        ];
        match checks.into_iter().find(|(_, _, _, ok)| !ok) {
            Some((field, local, remote, _)) => Err(NetplayError::HandshakeMismatch {
                field,
                local,
                remote,
            }),
            None => Ok(()),
        }
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
    use crate::telemetry::CollectingObserver;

    fn identity(role: Role) -> LocalIdentity {
        LocalIdentity::new(role, 0xC0DE, 0xF00D, 64, "player", &None)
    }

    fn exchange(a: &mut Handshake, b: &mut Handshake) -> Result<(), NetplayError> {
        let from_a = a.opening_messages();
        let from_b = b.opening_messages();
        for msg in &from_b {
            a.on_message(msg)?;
        }
        for msg in &from_a {
            b.on_message(msg)?;
        }
        Ok(())
    }

    #[test]
    fn matching_peers_identify_each_other() {
        let mut server = Handshake::new(identity(Role::Server));
        let mut client = Handshake::new(LocalIdentity::new(
            Role::Client,
            0xC0DE,
            0xF00D,
            64,
            "guest",
            &None,
        ));
        exchange(&mut server, &mut client).unwrap();
        assert_eq!(server.state(), HandshakeState::IdentityExchanged);
        assert_eq!(server.remote_nickname(), Some("guest"));
        assert_eq!(server.remote_role(), Some(Role::Client));
        server.mark_ready().unwrap();
        assert_eq!(server.state(), HandshakeState::Ready);
    }

    #[test]
    fn protocol_version_mismatch_is_rejected() {
        let mut server = Handshake::new(identity(Role::Server));
        let mut hello = identity(Role::Client).hello();
        hello.protocol_version = PROTOCOL_VERSION + 1;
        let err = server
            .on_message(&Message::new(MessageBody::Hello(hello)))
            .unwrap_err();
        assert!(matches!(err, NetplayError::ProtocolVersionMismatch { .. }));
        assert_eq!(server.state(), HandshakeState::Connecting);
    }

    #[test]
    fn foreign_magic_is_a_version_mismatch() {
        let mut server = Handshake::new(identity(Role::Server));
        let mut msg = Message::new(MessageBody::Hello(identity(Role::Client).hello()));
        msg.header.magic = 0x1234_5678;
        assert_eq!(
            server.on_message(&msg).unwrap_err(),
            NetplayError::ProtocolVersionMismatch {
                local_magic: NETPLAY_MAGIC,
                local_version: PROTOCOL_VERSION,
                remote_magic: 0x1234_5678,
                remote_version: PROTOCOL_VERSION,
            }
        );
    }

    #[test]
    fn content_mismatch_is_rejected() {
        let mut server = Handshake::new(identity(Role::Server));
        let mut client = Handshake::new(LocalIdentity::new(
            Role::Client,
            0xC0DE,
            0xBAD,
            64,
            "guest",
            &None,
        ));
        assert_eq!(
            exchange(&mut server, &mut client).unwrap_err(),
            NetplayError::HandshakeMismatch {
                field: HandshakeField::ContentCrc,
                local: 0xF00D,
                remote: 0xBAD,
            }
        );
    }

    #[test]
    fn state_size_mismatch_is_rejected() {
        let mut server = Handshake::new(identity(Role::Server));
        let mut hello = identity(Role::Client).hello();
        hello.state_size = 65;
        assert!(matches!(
            server.on_message(&Message::new(MessageBody::Hello(hello))),
            Err(NetplayError::HandshakeMismatch {
                field: HandshakeField::StateSize,
                ..
            })
        ));
    }

    #[test]
    fn two_servers_are_rejected() {
        let mut a = Handshake::new(identity(Role::Server));
        let mut b = Handshake::new(identity(Role::Server));
        assert!(matches!(
            exchange(&mut a, &mut b),
            Err(NetplayError::HandshakeMismatch {
                field: HandshakeField::Role,
                ..
            })
        ));
    }

    #[test]
    fn nickname_before_hello_is_a_violation() {
        let mut server = Handshake::new(identity(Role::Server));
        let msg = Message::new(MessageBody::Nickname(Nickname::encode("early")));
        assert!(matches!(
            server.on_message(&msg),
            Err(NetplayError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn long_nickname_is_truncated_on_char_boundary() {
        let name = format!("{}é", "a".repeat(30));
        assert_eq!(name.len(), 32);
        let (kept, truncated) = truncate_nickname(&name);
        assert!(truncated);
        assert_eq!(kept, "a".repeat(30));
        assert_eq!(Nickname::encode(&name).decode(), "a".repeat(30));
    }

    #[test]
    fn truncation_reports_identity_warning() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        let id = LocalIdentity::new(Role::Client, 0, 0, 0, &"x".repeat(40), &observer);
        assert_eq!(id.nickname.len(), MAX_NICK_BYTES);
        let reports = collector.violations_of_kind(ViolationKind::Handshake);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].severity, ViolationSeverity::Warning);
    }

    #[test]
    fn unterminated_remote_nickname_is_bounded() {
        let nick = Nickname {
            bytes: [b'z'; MAX_NICK_LEN],
        };
        assert_eq!(nick.decode().len(), MAX_NICK_BYTES);
    }
}
