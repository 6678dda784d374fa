//! Read-only observers of a session.
//!
//! A host keeps a [`SpectatorSet`]: every link handshakes like a player, receives the
//! confirmed snapshot once, then every finalized frame. A link that fails, or that stops
//! reading and falls more than [`MAX_SPECTATOR_LAG_FRAMES`] behind, is dropped on its own;
//! the players never notice.
//!
//! A session in [`Role::Spectator`](crate::Role::Spectator) uses a [`SpectatorFeed`] to
//! collect what its host sends.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, info};

use crate::network::channel::MessageChannel;
use crate::network::handshake::{Handshake, HandshakeProgress, LocalIdentity};
use crate::network::messages::{Message, MessageBody, SpectateStart};
use crate::replay::{FinalizedInput, ReplayHeader};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    DisconnectReason, Frame, NetplayError, NonBlockingStream, SessionEvent, MAX_SPECTATORS,
};

/// Finalized frames a spectator may have queued on the host before it is dropped.
pub const MAX_SPECTATOR_LAG_FRAMES: usize = 300;

/// Upper bound of one encoded `Finalized` message, length prefix included.
const FINALIZED_WIRE_BOUND: usize = 64;

/// Bytes a spectator link may have pending on the host: the starting snapshot plus
/// [`MAX_SPECTATOR_LAG_FRAMES`] finalized frames.
#[must_use]
pub fn backlog_limit(state_size: usize) -> usize {
    state_size.saturating_add(MAX_SPECTATOR_LAG_FRAMES * FINALIZED_WIRE_BOUND)
}

/// Identifies one spectator link of a host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpectatorId(u32);

impl SpectatorId {
    /// The raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpectatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spectator #{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Handshaking,
    AwaitingStart,
    Streaming,
}

#[derive(Debug)]
struct SpectatorLink {
    id: SpectatorId,
    channel: MessageChannel,
    handshake: Handshake,
    phase: Phase,
}

impl SpectatorLink {
    /// Queues `msg`. Fails once more than `max_pending` bytes wait for the spectator to read.
    fn send(&mut self, msg: &Message, max_pending: usize) -> Result<(), NetplayError> {
        self.channel.send(msg)?;
        let pending = self.channel.pending_send();
        if pending > max_pending {
            return Err(NetplayError::TransportError {
                context: format!(
                    "{} is not reading, {} bytes pending (limit {})",
                    self.id, pending, max_pending
                ),
            });
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<SessionEvent>, NetplayError> {
        let mut joined = None;
        for msg in self.channel.receive()? {
            match msg.body {
                MessageBody::Hello(_) | MessageBody::Nickname(_) => {
                    if let HandshakeProgress::Identified { nickname } =
                        self.handshake.on_message(&msg)?
                    {
                        self.handshake.mark_ready()?;
                        self.phase = Phase::AwaitingStart;
                        info!("{} joined as {:?}", self.id, nickname);
                        joined = Some(SessionEvent::SpectatorJoined {
                            id: self.id,
                            nickname,
                        });
                    }
                },
                MessageBody::Disconnect => return Err(NetplayError::Disconnected),
                other => {
                    return Err(NetplayError::ProtocolViolation {
                        context: format!("spectator sent a {} message", other.kind()),
                    });
                },
            }
        }
        if self.channel.remote_closed() {
            return Err(NetplayError::Disconnected);
        }
        self.channel.flush()?;
        Ok(joined)
    }
}

fn left(
    id: SpectatorId,
    err: NetplayError,
    observer: &Option<Arc<dyn ViolationObserver>>,
) -> SessionEvent {
    let reason = match err {
        NetplayError::Disconnected => DisconnectReason::RemoteHangup,
        other => {
            report_violation_to!(
                observer,
                ViolationSeverity::Warning,
                ViolationKind::Spectator,
                "dropped {}: {}",
                id,
                other
            );
            DisconnectReason::Error(other)
        },
    };
    info!("{} left: {}", id, reason);
    SessionEvent::SpectatorLeft { id, reason }
}

/// Events produced by one fan-out pass. Usually empty.
pub type SpectatorEvents = SmallVec<[SessionEvent; 2]>;

/// The spectator links of a host.
pub struct SpectatorSet {
    links: Vec<SpectatorLink>,
    next_id: u32,
    max_malformed: u32,
    max_pending: usize,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl fmt::Debug for SpectatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            links,
            next_id,
            max_malformed,
            max_pending,
            observer,
        } = self;

        f.debug_struct("SpectatorSet")
            .field("links", links)
            .field("next_id", next_id)
            .field("max_malformed", max_malformed)
            .field("max_pending", max_pending)
            .field("has_observer", &observer.is_some())
            .finish()
    }
}

impl SpectatorSet {
    /// An empty set. A link with more than `max_pending` unsent bytes is dropped, see
    /// [`backlog_limit`].
    pub fn new(
        max_malformed: u32,
        max_pending: usize,
        observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            links: Vec::new(),
            next_id: 0,
            max_malformed,
            max_pending,
            observer,
        }
    }

    /// Number of attached links, in any phase.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// No links attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Attaches `stream` and sends the host's half of the handshake.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] when [`MAX_SPECTATORS`] links are attached, or the
    /// transport error if the opening messages cannot be written.
    pub fn add(
        &mut self,
        stream: Box<dyn NonBlockingStream>,
        identity: LocalIdentity,
    ) -> Result<SpectatorId, NetplayError> {
        if self.links.len() >= MAX_SPECTATORS {
            return Err(NetplayError::InvalidRequest {
                info: format!("at most {} spectators can be attached", MAX_SPECTATORS),
            });
        }
        let id = SpectatorId(self.next_id);
        let mut channel = MessageChannel::new(stream, self.max_malformed, self.observer.clone());
        let handshake = Handshake::new(identity);
        for msg in &handshake.opening_messages() {
            channel.send(msg)?;
        }
        self.next_id += 1;
        debug!("{} attached", id);
        self.links.push(SpectatorLink {
            id,
            channel,
            handshake,
            phase: Phase::Handshaking,
        });
        Ok(id)
    }

    /// Services every link: handshakes, hangups, and protocol checks.
    pub fn poll(&mut self) -> SpectatorEvents {
        let mut events = SpectatorEvents::new();
        let observer = &self.observer;
        self.links.retain_mut(|link| match link.poll() {
            Ok(joined) => {
                events.extend(joined);
                true
            },
            Err(err) => {
                events.push(left(link.id, err, observer));
                false
            },
        });
        events
    }

    /// Whether a link finished its handshake and waits for its starting snapshot.
    #[must_use]
    pub fn needs_start(&self) -> bool {
        self.links
            .iter()
            .any(|link| link.phase == Phase::AwaitingStart)
    }

    /// Sends the starting snapshot to every link waiting for one.
    pub fn send_starts(
        &mut self,
        header: ReplayHeader,
        frame: Frame,
        state: &[u8],
    ) -> SpectatorEvents {
        let mut events = SpectatorEvents::new();
        let (observer, max_pending) = (&self.observer, self.max_pending);
        self.links.retain_mut(|link| {
            if link.phase != Phase::AwaitingStart {
                return true;
            }
            let start = Message::new(MessageBody::SpectateStart(SpectateStart {
                header,
                frame,
                state: state.to_vec(),
            }));
            match link.send(&start, max_pending) {
                Ok(()) => {
                    debug!("{} starts at frame {}", link.id, frame);
                    link.phase = Phase::Streaming;
                    true
                },
                Err(err) => {
                    events.push(left(link.id, err, observer));
                    false
                },
            }
        });
        events
    }

    /// Sends one finalized frame to every streaming link.
    pub fn broadcast(&mut self, input: &FinalizedInput) -> SpectatorEvents {
        let mut events = SpectatorEvents::new();
        let msg = Message::new(MessageBody::Finalized {
            frame: input.frame,
            ports: input.ports,
        });
        let (observer, max_pending) = (&self.observer, self.max_pending);
        self.links.retain_mut(|link| {
            if link.phase != Phase::Streaming {
                return true;
            }
            match link.send(&msg, max_pending) {
                Ok(()) => true,
                Err(err) => {
                    events.push(left(link.id, err, observer));
                    false
                },
            }
        });
        events
    }

    /// Says goodbye to every link and drops them.
    pub fn hang_up_all(&mut self) {
        for link in &mut self.links {
            // best effort, the links are dropped either way
            let _ = link.channel.send(&Message::new(MessageBody::Disconnect));
        }
        self.links.clear();
    }
}

/// What a spectator-role session has received from its host.
#[derive(Debug, Default)]
pub struct SpectatorFeed {
    start: Option<SpectateStart>,
    started: bool,
    expected: Option<Frame>,
    queue: VecDeque<FinalizedInput>,
}

impl SpectatorFeed {
    /// An empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the host's starting snapshot. Only one is allowed.
    pub fn on_start(&mut self, start: SpectateStart) -> Result<(), NetplayError> {
        if self.started || self.start.is_some() {
            return Err(NetplayError::ProtocolViolation {
                context: "host sent a second starting snapshot".to_owned(),
            });
        }
        self.expected = Some(start.frame);
        self.start = Some(start);
        Ok(())
    }

    /// Takes the starting snapshot for loading into the core.
    pub fn take_start(&mut self) -> Option<SpectateStart> {
        let start = self.start.take();
        if start.is_some() {
            self.started = true;
        }
        start
    }

    /// Queues one finalized frame. Frames must follow the snapshot without gaps.
    pub fn on_finalized(&mut self, input: FinalizedInput) -> Result<(), NetplayError> {
        match self.expected {
            Some(expected) if expected == input.frame => {
                self.expected = Some(expected.next());
                self.queue.push_back(input);
                Ok(())
            },
            Some(expected) => Err(NetplayError::ProtocolViolation {
                context: format!(
                    "host sent finalized frame {}, expected {}",
                    input.frame, expected
                ),
            }),
            None => Err(NetplayError::ProtocolViolation {
                context: "host sent finalized input before the starting snapshot".to_owned(),
            }),
        }
    }

    /// The next frame to run, once the snapshot is loaded.
    pub fn pop(&mut self) -> Option<FinalizedInput> {
        if !self.started {
            return None;
        }
        self.queue.pop_front()
    }

    /// Finalized frames waiting to be run.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
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
    use crate::network::memory_stream::MemoryStream;
    use crate::{InputWords, Role};

    fn identity(role: Role, name: &str) -> LocalIdentity {
        LocalIdentity::new(role, 1, 2, 4, name, &None)
    }

    fn finalized(frame: u32) -> FinalizedInput {
        FinalizedInput {
            frame: Frame::new(frame),
            ports: [InputWords::new([frame, 0, 0]), InputWords::ZERO],
        }
    }

    /// The spectator's end of a link, driven by hand.
    fn spectator_end(stream: MemoryStream, name: &str) -> MessageChannel {
        let mut channel = MessageChannel::new(Box::new(stream), 3, None);
        for msg in &Handshake::new(identity(Role::Spectator, name)).opening_messages() {
            channel.send(msg).unwrap();
        }
        channel
    }

    #[test]
    fn handshake_then_start_then_stream() {
        let (host_end, viewer_end) = MemoryStream::pair();
        let mut set = SpectatorSet::new(3, backlog_limit(4), None);
        let id = set.add(Box::new(host_end), identity(Role::Server, "host")).unwrap();
        let mut viewer = spectator_end(viewer_end, "viewer");

        let events = set.poll();
        assert_eq!(
            events.as_slice(),
            &[SessionEvent::SpectatorJoined {
                id,
                nickname: "viewer".to_owned()
            }]
        );
        assert!(set.needs_start());

        // frames finalized before the start are not sent
        assert!(set.broadcast(&finalized(0)).is_empty());
        let header = ReplayHeader::new(1, 2, 4);
        assert!(set.send_starts(header, Frame::new(1), &[9; 4]).is_empty());
        assert!(!set.needs_start());
        set.broadcast(&finalized(1));

        let kinds: Vec<_> = viewer
            .receive()
            .unwrap()
            .into_iter()
            .map(|msg| msg.body.kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["hello", "nickname", "spectate_start", "finalized"]
        );
    }

    #[test]
    fn input_from_spectator_drops_only_that_link() {
        let (a_host, a_view) = MemoryStream::pair();
        let (b_host, b_view) = MemoryStream::pair();
        let mut set = SpectatorSet::new(3, backlog_limit(4), None);
        let bad = set.add(Box::new(a_host), identity(Role::Server, "host")).unwrap();
        set.add(Box::new(b_host), identity(Role::Server, "host")).unwrap();
        let mut a = spectator_end(a_view, "a");
        let _b = spectator_end(b_view, "b");
        a.send(&Message::new(MessageBody::Input {
            frame: Frame::ZERO,
            words: InputWords::ZERO,
        }))
        .unwrap();

        let events = set.poll();
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::SpectatorLeft {
                id,
                reason: DisconnectReason::Error(NetplayError::ProtocolViolation { .. })
            } if *id == bad
        )));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn spectator_that_stops_reading_is_dropped() {
        let (host_end, viewer_end) = MemoryStream::pair_with_capacity(128);
        let mut set = SpectatorSet::new(3, 256, None);
        let id = set.add(Box::new(host_end), identity(Role::Server, "host")).unwrap();
        let _viewer = spectator_end(viewer_end, "viewer");
        assert_eq!(set.poll().len(), 1);
        assert!(set
            .send_starts(ReplayHeader::new(1, 2, 4), Frame::ZERO, &[0; 4])
            .is_empty());

        let events = (0..64)
            .map(|frame| set.broadcast(&finalized(frame)))
            .find(|events| !events.is_empty())
            .unwrap();
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::SpectatorLeft {
                id: gone,
                reason: DisconnectReason::Error(NetplayError::TransportError { .. })
            }] if *gone == id
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn backlog_limit_covers_snapshot_and_lag() {
        assert_eq!(backlog_limit(0), MAX_SPECTATOR_LAG_FRAMES * FINALIZED_WIRE_BOUND);
        assert_eq!(backlog_limit(usize::MAX), usize::MAX);
    }

    #[test]
    fn closed_spectator_is_a_hangup() {
        let (host_end, viewer_end) = MemoryStream::pair();
        let mut set = SpectatorSet::new(3, backlog_limit(4), None);
        let id = set.add(Box::new(host_end), identity(Role::Server, "host")).unwrap();
        drop(viewer_end);
        let events = set.poll();
        assert_eq!(
            events.as_slice(),
            &[SessionEvent::SpectatorLeft {
                id,
                reason: DisconnectReason::RemoteHangup
            }]
        );
        assert!(set.is_empty());
    }

    #[test]
    fn set_is_capped() {
        let mut set = SpectatorSet::new(3, backlog_limit(4), None);
        let mut viewers = Vec::new();
        for _ in 0..MAX_SPECTATORS {
            let (host_end, viewer_end) = MemoryStream::pair();
            set.add(Box::new(host_end), identity(Role::Server, "host")).unwrap();
            viewers.push(viewer_end);
        }
        let (host_end, _viewer_end) = MemoryStream::pair();
        assert!(matches!(
            set.add(Box::new(host_end), identity(Role::Server, "host")),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn feed_requires_contiguous_frames_after_start() {
        let mut feed = SpectatorFeed::new();
        assert!(feed.on_finalized(finalized(0)).is_err());
        feed.on_start(SpectateStart {
            header: ReplayHeader::new(1, 2, 4),
            frame: Frame::new(3),
            state: vec![0; 4],
        })
        .unwrap();
        feed.on_finalized(finalized(3)).unwrap();
        assert!(feed.on_finalized(finalized(5)).is_err());
        // nothing runs before the snapshot is loaded
        assert!(feed.pop().is_none());
        assert!(feed.take_start().is_some());
        assert_eq!(feed.pop(), Some(finalized(3)));
        assert_eq!(feed.queued(), 0);
    }
}
