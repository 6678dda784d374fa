use serde::{Deserialize, Serialize};

use crate::replay::ReplayHeader;
use crate::{Frame, InputWords, Role, MAX_NICK_LEN, NETPLAY_MAGIC};

/// First message on every link: what the sender speaks and what it runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Wire protocol version of the sender.
    pub protocol_version: u32,
    /// Role the sender plays on this link.
    pub role: Role,
    /// Hash of the sender's core implementation.
    pub core_magic: u32,
    /// CRC of the loaded content, as computed by the frontend.
    pub content_crc: u32,
    /// Serialized core state size in bytes.
    pub state_size: u32,
}

/// NUL-terminated nickname in a fixed buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nickname {
    /// Nickname bytes, NUL padded. At least the last byte is always NUL.
    pub bytes: [u8; MAX_NICK_LEN],
}

/// Confirmed snapshot a host sends to a spectator before the input stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectateStart {
    /// Validates that `state` belongs to the negotiated core and content.
    pub header: ReplayHeader,
    /// The frame `state` was captured at.
    pub frame: Frame,
    /// The snapshot.
    pub state: Vec<u8>,
}

impl std::fmt::Debug for SpectateStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            header,
            frame,
            state,
        } = self;

        f.debug_struct("SpectateStart")
            .field("header", header)
            .field("frame", frame)
            .field("state_len", &state.len())
            .finish()
    }
}

/// Every command that travels between peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Protocol and content identification.
    Hello(Hello),
    /// The sender's nickname.
    Nickname(Nickname),
    /// The sender's local input for one frame.
    Input {
        /// Frame the input belongs to.
        frame: Frame,
        /// The input words.
        words: InputWords,
    },
    /// Ports swap from `frame` on. Only sent by the server.
    Flip {
        /// The first frame simulated with the new mapping.
        frame: Frame,
    },
    /// Both peers halt before simulating `frame`.
    Pause {
        /// The frame to halt at.
        frame: Frame,
        /// Pauses the sender had seen end when it asked.
        epoch: u32,
    },
    /// Cancel or end the pause of `epoch`.
    Resume {
        /// The epoch this resume closes.
        epoch: u32,
    },
    /// Graceful hangup.
    Disconnect,
    /// Host to spectator: the snapshot to start from.
    SpectateStart(SpectateStart),
    /// Host to spectator: inputs of a confirmed frame, already mapped to ports.
    Finalized {
        /// The confirmed frame.
        frame: Frame,
        /// Input per port.
        ports: [InputWords; 2],
    },
}

impl MessageBody {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            MessageBody::Hello(_) => "hello",
            MessageBody::Nickname(_) => "nickname",
            MessageBody::Input { .. } => "input",
            MessageBody::Flip { .. } => "flip",
            MessageBody::Pause { .. } => "pause",
            MessageBody::Resume { .. } => "resume",
            MessageBody::Disconnect => "disconnect",
            MessageBody::SpectateStart(_) => "spectate_start",
            MessageBody::Finalized { .. } => "finalized",
        }
    }
}

/// Fields common to every message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Always [`NETPLAY_MAGIC`] for messages from a compatible peer.
    pub magic: u32,
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            magic: NETPLAY_MAGIC,
        }
    }
}

/// A message that [`MessageChannel`] frames onto a [`NonBlockingStream`].
///
/// [`MessageChannel`]: crate::network::channel::MessageChannel
/// [`NonBlockingStream`]: crate::NonBlockingStream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The header.
    pub header: MessageHeader,
    /// The command.
    pub body: MessageBody,
}

impl Message {
    /// Wraps `body` with the default header.
    #[must_use]
    pub fn new(body: MessageBody) -> Self {
        Self {
            header: MessageHeader::default(),
            body,
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
    use crate::PROTOCOL_VERSION;

    #[test]
    fn new_message_carries_magic() {
        let msg = Message::new(MessageBody::Resume { epoch: 0 });
        assert_eq!(msg.header.magic, NETPLAY_MAGIC);
    }

    #[test]
    fn spectate_start_debug_hides_blob() {
        let start = SpectateStart {
            header: ReplayHeader::new(1, 2, 3),
            frame: Frame::new(4),
            state: vec![0xAB; 3],
        };
        let debug = format!("{:?}", start);
        assert!(debug.contains("state_len: 3"));
    }

    #[test]
    fn kinds_are_distinct() {
        let bodies = [
            MessageBody::Hello(Hello {
                protocol_version: PROTOCOL_VERSION,
                role: Role::Server,
                core_magic: 0,
                content_crc: 0,
                state_size: 0,
            }),
            MessageBody::Nickname(Nickname {
                bytes: [0; MAX_NICK_LEN],
            }),
            MessageBody::Input {
                frame: Frame::ZERO,
                words: InputWords::ZERO,
            },
            MessageBody::Flip { frame: Frame::ZERO },
            MessageBody::Pause {
                frame: Frame::ZERO,
                epoch: 0,
            },
            MessageBody::Resume { epoch: 0 },
            MessageBody::Disconnect,
            MessageBody::Finalized {
                frame: Frame::ZERO,
                ports: [InputWords::ZERO; 2],
            },
        ];
        let mut kinds: Vec<_> = bodies.iter().map(MessageBody::kind).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), bodies.len());
    }
}
