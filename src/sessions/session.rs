use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::delta_store::{ConfirmedFrame, DeltaFrameStore};
use crate::network::channel::MessageChannel;
use crate::network::handshake::{Handshake, HandshakeProgress, HandshakeState, LocalIdentity};
use crate::network::messages::{Message, MessageBody, SpectateStart};
use crate::replay::{FinalizedInput, Replay, ReplayHeader};
use crate::sessions::config::SessionConfig;
use crate::sessions::input_exchange::InputExchange;
use crate::sessions::rollback::{RollbackEngine, RollbackState};
use crate::sessions::schedule::{FlipSchedule, PauseAgreement, PauseSchedule};
use crate::sessions::spectator::{
    backlog_limit, SpectatorEvents, SpectatorFeed, SpectatorId, SpectatorSet,
};
use crate::sessions::stall::{StallController, StallReason, StallUpdate};
use crate::telemetry::ViolationObserver;
use crate::{
    AdvanceOutcome, CoreOperation, CoreState, DisconnectReason, Frame, FrameInputs,
    HandshakeField, InputWords, NetplayError, NonBlockingStream, Role, SessionEvent, WaitReason,
};

/// Lifecycle of a [`Session`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The handshake has not completed. A spectator stays here until the host's snapshot is loaded.
    Handshaking,
    /// Frames are being exchanged.
    Ready,
    /// The session ended. Buffers and the link have been released.
    Disconnected,
}

/// Maps one frame's local and remote input onto the two controller ports.
fn map_ports(home_port: usize, flipped: bool, local: InputWords, remote: InputWords) -> [InputWords; 2] {
    if (home_port == 0) != flipped {
        [local, remote]
    } else {
        [remote, local]
    }
}

/// A [`Session`] connects this process to one remote peer over a reliable stream and keeps
/// a deterministic core in lockstep with it, guessing remote input ahead of time and rolling
/// back when a guess was wrong.
///
/// Create one with [`SessionBuilder`](crate::SessionBuilder) and call
/// [`advance_frame`](Session::advance_frame) once per tick.
pub struct Session {
    config: SessionConfig,
    observer: Option<Arc<dyn ViolationObserver>>,
    state: SessionState,
    link: Option<MessageChannel>,
    handshake: Handshake,
    header: ReplayHeader,
    /// Snapshot ring; players only, released on disconnect.
    store: Option<DeltaFrameStore>,
    exchange: InputExchange,
    rollback: RollbackEngine,
    stall: StallController,
    flip: FlipSchedule,
    pause: PauseAgreement,
    spectators: SpectatorSet,
    /// Input of a spectator-role session's host.
    feed: SpectatorFeed,
    history: Option<Replay>,
    remote_nickname: Option<String>,
    /// Remote input of the most recently confirmed frame, the guess base once its slot is gone.
    last_confirmed_remote: InputWords,
    event_queue: VecDeque<SessionEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            observer,
            state,
            link,
            handshake,
            header,
            store,
            exchange,
            rollback,
            stall,
            flip,
            pause,
            spectators,
            feed,
            history,
            remote_nickname,
            last_confirmed_remote,
            event_queue,
        } = self;

        f.debug_struct("Session")
            .field("config", config)
            .field("has_observer", &observer.is_some())
            .field("state", state)
            .field("link", link)
            .field("handshake", handshake)
            .field("header", header)
            .field("store", store)
            .field("exchange", exchange)
            .field("rollback", rollback)
            .field("stall", stall)
            .field("flip", flip)
            .field("pause", pause)
            .field("spectators", spectators)
            .field("feed", feed)
            .field("history_frames", &history.as_ref().map(|h| h.inputs().len()))
            .field("remote_nickname", remote_nickname)
            .field("last_confirmed_remote", last_confirmed_remote)
            .field("event_queue", event_queue)
            .finish()
    }
}

impl Session {
    /// Opens the link and sends our half of the handshake.
    ///
    /// Note: This is an internal constructor called via SessionBuilder.
    pub(crate) fn new(
        config: SessionConfig,
        observer: Option<Arc<dyn ViolationObserver>>,
        stream: Box<dyn NonBlockingStream>,
        state_size: usize,
    ) -> Result<Self, NetplayError> {
        let wire_state_size = u32::try_from(state_size).map_err(|_| NetplayError::InvalidRequest {
            info: format!("state size {} does not fit the handshake", state_size),
        })?;
        let header = ReplayHeader::new(config.core_magic, config.content_crc, wire_state_size);
        let identity = LocalIdentity::new(
            config.role,
            config.core_magic,
            config.content_crc,
            wire_state_size,
            &config.nickname,
            &observer,
        );
        let store = if config.role.is_player() {
            Some(DeltaFrameStore::new(config.sync_frames, state_size)?)
        } else {
            None
        };

        let mut link = MessageChannel::new(stream, config.max_malformed_packets, observer.clone());
        let handshake = Handshake::new(identity);
        for msg in &handshake.opening_messages() {
            link.send(msg)?;
        }
        debug!(
            "{} session started as {:?}, {} sync frames",
            config.role,
            handshake.local().nickname,
            config.sync_frames
        );

        Ok(Self {
            exchange: InputExchange::new(config.sync_frames, observer.clone()),
            rollback: RollbackEngine::new(),
            stall: StallController::new(config.stall.max_stall_polls),
            flip: FlipSchedule::new(),
            pause: PauseAgreement::new(),
            spectators: SpectatorSet::new(
                config.max_malformed_packets,
                backlog_limit(state_size),
                observer.clone(),
            ),
            feed: SpectatorFeed::new(),
            history: None,
            remote_nickname: None,
            last_confirmed_remote: InputWords::ZERO,
            event_queue: VecDeque::new(),
            state: SessionState::Handshaking,
            link: Some(link),
            handshake,
            header,
            store,
            observer,
            config,
        })
    }

    /// Runs one tick: services the link, corrects mispredictions, and simulates the next frame
    /// with `local` as this player's input if the session may advance.
    ///
    /// Spectators ignore `local` and run the next frame their host finalized.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::Disconnected`] once the session has ended.
    /// - Any fatal error that ended the session on this tick; the session is then
    ///   [`SessionState::Disconnected`] and a [`SessionEvent::Disconnected`] is queued.
    pub fn advance_frame<C>(
        &mut self,
        core: &mut C,
        local: InputWords,
    ) -> Result<AdvanceOutcome, NetplayError>
    where
        C: CoreState + ?Sized,
    {
        self.poll_remote()?;
        if self.state == SessionState::Disconnected {
            return Err(NetplayError::Disconnected);
        }
        let result = if self.config.role.is_player() {
            if self.state == SessionState::Handshaking {
                return Ok(AdvanceOutcome::Waiting(WaitReason::Handshaking));
            }
            self.advance_player(core, local)
        } else {
            self.advance_spectator(core)
        };
        result.map_err(|err| self.fail(err))
    }

    /// Receives and handles everything the remote and any spectators sent, and flushes
    /// pending output. [`advance_frame`](Session::advance_frame) calls this itself; call it
    /// directly to keep the link serviced while not advancing.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Disconnected`] once the session has ended, or the fatal error that
    /// ended it.
    pub fn poll_remote(&mut self) -> Result<(), NetplayError> {
        if self.state == SessionState::Disconnected {
            return Err(NetplayError::Disconnected);
        }
        if let Err(err) = self.poll_link() {
            return Err(self.fail(err));
        }
        let events = self.spectators.poll();
        self.push_events(events);
        // the slot at `self` has no snapshot until that frame is simulated
        let captured = self
            .store
            .as_ref()
            .is_some_and(|store| store.other_frame().is_before(store.self_frame()));
        if captured && self.spectators.needs_start() {
            if let Err(err) = self.start_spectators() {
                return Err(self.fail(err));
            }
        }
        Ok(())
    }

    /// Swaps which player drives which port, starting at the first frame whose input this
    /// side has not sent yet. Only the server may flip, and only once the previous flip is
    /// confirmed.
    ///
    /// Returns the frame the flip applies from.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] when not the server, not ready, or while an earlier flip
    /// is unconfirmed. Transport errors end the session.
    pub fn request_flip(&mut self) -> Result<Frame, NetplayError> {
        if self.config.role != Role::Server {
            return Err(NetplayError::InvalidRequest {
                info: "only the server decides flips".to_owned(),
            });
        }
        let store = self.ready_store()?;
        let (frame, other) = (store.self_frame(), store.other_frame());
        let flipped = self.flip.request(frame, other)?;
        self.send(&Message::new(MessageBody::Flip { frame }))?;
        info!("flip requested at frame {} (flipped: {})", frame, flipped);
        Ok(frame)
    }

    /// Asks both players to halt before the same frame. The frame is far enough ahead that
    /// neither side has simulated it; if the remote asked for an earlier one, that one wins.
    ///
    /// Returns the frame the pause is scheduled for.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] for spectators or before the session is ready.
    pub fn request_pause(&mut self) -> Result<Frame, NetplayError> {
        let store = self.player_store()?;
        let earliest = PauseSchedule::earliest_frame(store.self_frame(), store.sync_frames());
        let frame = self.pause.request(earliest);
        let epoch = self.pause.epoch();
        self.send(&Message::new(MessageBody::Pause { frame, epoch }))?;
        debug!("pause requested for frame {}", frame);
        Ok(frame)
    }

    /// Resumes after a pause, or cancels one that has not been reached yet.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if no pause is scheduled or active.
    pub fn resume(&mut self) -> Result<(), NetplayError> {
        let frame = self.player_store()?.self_frame();
        let Some(epoch) = self.pause.resume() else {
            return Err(NetplayError::InvalidRequest {
                info: "no pause to resume".to_owned(),
            });
        };
        self.send(&Message::new(MessageBody::Resume { epoch }))?;
        self.push_event(SessionEvent::Resumed { frame });
        Ok(())
    }

    /// Attaches a spectator link. The spectator receives the confirmed snapshot once its
    /// handshake completes and every finalized frame after that.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] when not the server or when the spectator limit is reached.
    pub fn add_spectator(
        &mut self,
        stream: impl NonBlockingStream + 'static,
    ) -> Result<SpectatorId, NetplayError> {
        if self.config.role != Role::Server {
            return Err(NetplayError::InvalidRequest {
                info: "only the server feeds spectators".to_owned(),
            });
        }
        if self.state == SessionState::Disconnected {
            return Err(NetplayError::Disconnected);
        }
        let identity = self.handshake.local().clone();
        self.spectators.add(Box::new(stream), identity)
    }

    /// Hangs up gracefully: the remote and every spectator are told, then the session ends.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Disconnected`] if the session already ended.
    pub fn disconnect(&mut self) -> Result<(), NetplayError> {
        if self.state == SessionState::Disconnected {
            return Err(NetplayError::Disconnected);
        }
        if let Some(link) = self.link.as_mut() {
            // the link is dropped either way
            let _ = link.send(&Message::new(MessageBody::Disconnect));
        }
        self.end(DisconnectReason::LocalHangup);
        Ok(())
    }

    /// Returns all events that happened since last queried for events. If the number of
    /// stored events exceeds the configured queue size, the oldest events are discarded.
    #[must_use]
    pub fn events(&mut self) -> Drain<'_, SessionEvent> {
        self.event_queue.drain(..)
    }

    /// Returns the current [`SessionState`].
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// Returns the state of the handshake with the remote.
    #[must_use]
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Whether frames are being exchanged.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// This end's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// The configuration the session was started with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The remote's nickname, once the handshake identified it.
    #[must_use]
    pub fn remote_nickname(&self) -> Option<&str> {
        self.remote_nickname.as_deref()
    }

    /// Our nickname as sent to the remote, after truncation.
    #[must_use]
    pub fn local_nickname(&self) -> &str {
        &self.handshake.local().nickname
    }

    /// The remote's address, if the transport knows it.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().and_then(MessageChannel::peer_addr)
    }

    /// The snapshot ring, for players that have not disconnected.
    #[must_use]
    pub fn store(&self) -> Option<&DeltaFrameStore> {
        self.store.as_ref()
    }

    /// The next frame this side will simulate.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        match (&self.store, &self.history) {
            (Some(store), _) => store.self_frame(),
            (None, Some(history)) => history.next_frame(),
            (None, None) => Frame::ZERO,
        }
    }

    /// The first frame not yet confirmed by both players.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        match (&self.store, &self.history) {
            (Some(store), _) => store.other_frame(),
            (None, Some(history)) => history.next_frame(),
            (None, None) => Frame::ZERO,
        }
    }

    /// The remote is ahead; run frames without presenting them until this clears.
    #[must_use]
    pub fn should_fast_forward(&self) -> bool {
        if self.config.role.is_player() {
            self.exchange.must_fast_forward()
        } else {
            self.feed.queued() > 0
        }
    }

    /// Why the session is held back, [`StallReason::None`] when it is not.
    #[must_use]
    pub fn stall_reason(&self) -> StallReason {
        self.stall.reason()
    }

    /// The rollback state machine's state.
    #[must_use]
    pub fn rollback_state(&self) -> RollbackState {
        self.rollback.state()
    }

    /// Rollbacks performed so far.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.rollback.rollbacks()
    }

    /// Whether the ports are swapped while simulating `frame`.
    #[must_use]
    pub fn flipped_at(&self, frame: Frame) -> bool {
        self.flip.flipped_at(frame)
    }

    /// The pause agreement with the remote.
    #[must_use]
    pub fn pause_state(&self) -> PauseSchedule {
        self.pause.schedule()
    }

    /// Confirmed input recorded so far, from the first snapshot on.
    #[must_use]
    pub fn replay(&self) -> Option<&Replay> {
        self.history.as_ref()
    }

    /// Attached spectator links.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.spectators.len()
    }

    /// The violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.observer.as_ref()
    }

    fn poll_link(&mut self) -> Result<(), NetplayError> {
        let link = self.link.as_mut().ok_or(NetplayError::Disconnected)?;
        let messages = link.receive()?;
        let closed = link.remote_closed();
        for msg in messages {
            self.dispatch(msg)?;
            if self.state == SessionState::Disconnected {
                return Ok(());
            }
        }
        if closed {
            info!("remote closed the link");
            self.end(DisconnectReason::RemoteHangup);
            return Ok(());
        }
        match self.link.as_mut() {
            Some(link) => link.flush(),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, msg: Message) -> Result<(), NetplayError> {
        trace!("received {}", msg.body.kind());
        if Handshake::handles(&msg) {
            return match self.handshake.on_message(&msg)? {
                HandshakeProgress::Pending => self.check_remote_role(),
                HandshakeProgress::Identified { nickname } => {
                    self.on_identified(nickname);
                    Ok(())
                },
            };
        }
        if matches!(msg.body, MessageBody::Disconnect) {
            info!("remote hung up");
            self.end(DisconnectReason::RemoteHangup);
            return Ok(());
        }
        if matches!(
            self.handshake.state(),
            HandshakeState::Connecting | HandshakeState::VersionExchanged
        ) {
            return Err(NetplayError::ProtocolViolation {
                context: format!("{} message before the handshake", msg.body.kind()),
            });
        }

        let role = self.config.role;
        match msg.body {
            MessageBody::Input { frame, words } if role.is_player() => {
                let store = self.store.as_mut().ok_or(NetplayError::Disconnected)?;
                self.exchange.accept(store, frame, words)?;
            },
            MessageBody::Flip { frame } if role == Role::Client => {
                let store = self.store.as_ref().ok_or(NetplayError::Disconnected)?;
                let (self_frame, other) = (store.self_frame(), store.other_frame());
                let flipped = self.flip.apply_remote(frame, other)?;
                if frame.is_before(self_frame) {
                    self.rollback.force_from(frame);
                }
                debug!("remote flips at frame {} (flipped: {})", frame, flipped);
            },
            MessageBody::Pause { frame, epoch } if role.is_player() => {
                let store = self.store.as_ref().ok_or(NetplayError::Disconnected)?;
                let self_frame = store.self_frame();
                if let Some(scheduled) = self.pause.apply_remote(frame, epoch, self_frame)? {
                    debug!("remote asked to pause at {}, pausing at {}", frame, scheduled);
                }
            },
            MessageBody::Resume { epoch } if role.is_player() => {
                if self.pause.apply_resume(epoch)? {
                    let frame = self.current_frame();
                    self.push_event(SessionEvent::Resumed { frame });
                }
            },
            MessageBody::SpectateStart(start) if role == Role::Spectator => {
                self.feed.on_start(start)?;
            },
            MessageBody::Finalized { frame, ports } if role == Role::Spectator => {
                self.feed.on_finalized(FinalizedInput { frame, ports })?;
            },
            other => {
                return Err(NetplayError::ProtocolViolation {
                    context: format!("{} message is not valid for a {}", other.kind(), role),
                });
            },
        }
        Ok(())
    }

    /// The two players must be a server and a client; spectators attach through
    /// [`add_spectator`](Session::add_spectator), never as the primary link.
    fn check_remote_role(&self) -> Result<(), NetplayError> {
        match self.handshake.remote_role() {
            Some(remote) if self.config.role.is_player() && !remote.is_player() => {
                Err(NetplayError::HandshakeMismatch {
                    field: HandshakeField::Role,
                    local: self.config.role.as_u32(),
                    remote: remote.as_u32(),
                })
            },
            _ => Ok(()),
        }
    }

    fn on_identified(&mut self, nickname: String) {
        info!("remote identified as {:?}", nickname);
        self.remote_nickname = Some(nickname.clone());
        if self.config.role.is_player() && self.handshake.mark_ready().is_ok() {
            self.state = SessionState::Ready;
            self.push_event(SessionEvent::Connected {
                remote_nickname: nickname,
            });
        }
    }

    fn advance_player<C>(
        &mut self,
        core: &mut C,
        local: InputWords,
    ) -> Result<AdvanceOutcome, NetplayError>
    where
        C: CoreState + ?Sized,
    {
        let home_port = self.config.role.home_port();
        let reconciliation = {
            let Self {
                store,
                rollback,
                flip,
                ..
            } = self;
            let store = store.as_mut().ok_or(NetplayError::Disconnected)?;
            rollback.reconcile(store, core, |frame, local, remote| {
                map_ports(home_port, flip.flipped_at(frame), local, remote)
            })?
        };
        if let Some((from, to)) = reconciliation.replayed {
            debug!("rolled back from {} to {}", to, from);
            self.push_event(SessionEvent::RollbackOccurred { from, to });
            for (frame, flipped) in self.flip.announce(from, to) {
                self.push_event(SessionEvent::FlipApplied { frame, flipped });
            }
        }
        for confirmed in &reconciliation.confirmed {
            self.finalize(confirmed)?;
        }

        let store = self.store.as_ref().ok_or(NetplayError::Disconnected)?;
        let (frame, other) = (store.self_frame(), store.other_frame());
        self.flip.settle(other);
        let stalled = match self
            .stall
            .poll(store.can_advance_self(), frame, !self.pause.is_paused())?
        {
            StallUpdate::Clear => None,
            StallUpdate::Entered(reason) => {
                self.push_event(SessionEvent::StallEntered { reason, frame });
                Some(reason)
            },
            StallUpdate::Stalled(reason) => Some(reason),
            StallUpdate::Exited { polls, duration } => {
                self.push_event(SessionEvent::StallExited { polls, duration });
                None
            },
        };

        let wait = match stalled {
            Some(reason) => WaitReason::Stalled(reason),
            None => {
                if self.pause.reach(frame) {
                    info!("paused before frame {}", frame);
                    self.push_event(SessionEvent::PauseApplied { frame });
                }
                if !self.pause.is_paused() {
                    return self.simulate(core, local);
                }
                WaitReason::Paused
            },
        };

        // spectators joining while nothing is simulated still get their snapshot
        if self.spectators.needs_start() {
            let store = self.store.as_mut().ok_or(NetplayError::Disconnected)?;
            store.capture_with(frame, |buf| core.save_state(buf))?;
            self.start_spectators()?;
        }
        Ok(AdvanceOutcome::Waiting(wait))
    }

    /// Sends the snapshot of the confirmed frame to spectators that finished their handshake.
    fn start_spectators(&mut self) -> Result<(), NetplayError> {
        let store = self.store.as_ref().ok_or(NetplayError::Disconnected)?;
        let other = store.other_frame();
        let events = self
            .spectators
            .send_starts(self.header, other, store.restore(other)?);
        self.push_events(events);
        Ok(())
    }

    /// Simulates `self` with the local input and either the remote's real input or a guess.
    fn simulate<C>(&mut self, core: &mut C, local: InputWords) -> Result<AdvanceOutcome, NetplayError>
    where
        C: CoreState + ?Sized,
    {
        let home_port = self.config.role.home_port();
        let store = self.store.as_mut().ok_or(NetplayError::Disconnected)?;
        let frame = store.self_frame();
        store.capture_with(frame, |buf| core.save_state(buf))?;
        if self.history.is_none() {
            self.history = Some(Replay::new(self.header, frame, store.restore(frame)?.to_vec())?);
        }
        if self.spectators.needs_start() {
            self.start_spectators()?;
        }

        let store = self.store.as_mut().ok_or(NetplayError::Disconnected)?;
        store.record_local(frame, local)?;
        let guess_base = store
            .frame(frame.prev())
            .filter(|_| frame != Frame::ZERO)
            .map_or(self.last_confirmed_remote, |slot| slot.effective_remote());
        let (remote, used_real) = match self.exchange.take_for(frame) {
            Some(words) => {
                store.record_remote(frame, words)?;
                (words, true)
            },
            None => {
                store.record_guess(frame, guess_base)?;
                (guess_base, false)
            },
        };
        store.mark_used_real(frame, used_real)?;
        if !store.is_ready(frame) {
            return Err(NetplayError::InternalError {
                context: format!("frame {} is missing an input", frame),
            });
        }

        core.run_frame(&FrameInputs {
            frame,
            ports: map_ports(home_port, self.flip.flipped_at(frame), local, remote),
            replay: false,
        });
        store.advance_self()?;
        trace!("simulated frame {} (real remote: {})", frame, used_real);

        self.send(&Message::new(MessageBody::Input {
            frame,
            words: local,
        }))?;
        for (applied, flipped) in self.flip.announce(frame, frame.next()) {
            info!("flip applied at frame {} (flipped: {})", applied, flipped);
            self.push_event(SessionEvent::FlipApplied {
                frame: applied,
                flipped,
            });
        }
        Ok(AdvanceOutcome::Advanced {
            frame,
            fast_forward: self.exchange.must_fast_forward(),
        })
    }

    /// Records a confirmed frame and forwards it to spectators.
    fn finalize(&mut self, confirmed: &ConfirmedFrame) -> Result<(), NetplayError> {
        let input = FinalizedInput {
            frame: confirmed.frame,
            ports: map_ports(
                self.config.role.home_port(),
                self.flip.flipped_at(confirmed.frame),
                confirmed.local,
                confirmed.remote,
            ),
        };
        self.last_confirmed_remote = confirmed.remote;
        if let Some(history) = self.history.as_mut() {
            history.push(input).map_err(|err| NetplayError::InternalError {
                context: format!("confirmed frames out of order: {}", err),
            })?;
        }
        let events = self.spectators.broadcast(&input);
        self.push_events(events);
        Ok(())
    }

    fn advance_spectator<C>(&mut self, core: &mut C) -> Result<AdvanceOutcome, NetplayError>
    where
        C: CoreState + ?Sized,
    {
        if let Some(start) = self.feed.take_start() {
            self.load_start(core, start)?;
        }
        if self.state != SessionState::Ready {
            return Ok(AdvanceOutcome::Waiting(WaitReason::Handshaking));
        }
        let Some(input) = self.feed.pop() else {
            return Ok(AdvanceOutcome::Waiting(WaitReason::WaitingForHost));
        };
        core.run_frame(&input.as_frame_inputs());
        if let Some(history) = self.history.as_mut() {
            history.push(input)?;
        }
        Ok(AdvanceOutcome::Advanced {
            frame: input.frame,
            fast_forward: self.feed.queued() > 0,
        })
    }

    fn load_start<C>(&mut self, core: &mut C, start: SpectateStart) -> Result<(), NetplayError>
    where
        C: CoreState + ?Sized,
    {
        // a snapshot we cannot use leaves nothing to watch
        let unusable = |err: NetplayError| {
            if err.is_fatal() {
                err
            } else {
                NetplayError::ProtocolViolation {
                    context: format!("unusable starting snapshot: {}", err),
                }
            }
        };
        start.header.validate(&self.header).map_err(unusable)?;
        start.header.validate_blob(&start.state).map_err(unusable)?;
        if !core.load_state(&start.state) {
            return Err(NetplayError::CoreStateFailed {
                operation: CoreOperation::Load,
                frame: start.frame,
            });
        }
        self.history = Some(Replay::new(self.header, start.frame, start.state)?);
        self.handshake.mark_ready()?;
        self.state = SessionState::Ready;
        info!("watching from frame {}", start.frame);
        let remote_nickname = self.remote_nickname.clone().unwrap_or_default();
        self.push_event(SessionEvent::Connected { remote_nickname });
        Ok(())
    }

    fn player_store(&self) -> Result<&DeltaFrameStore, NetplayError> {
        if !self.config.role.is_player() {
            return Err(NetplayError::InvalidRequest {
                info: "spectators cannot pause or resume".to_owned(),
            });
        }
        self.ready_store()
    }

    fn ready_store(&self) -> Result<&DeltaFrameStore, NetplayError> {
        match (self.state, self.store.as_ref()) {
            (SessionState::Disconnected, _) | (_, None) => Err(NetplayError::Disconnected),
            (SessionState::Handshaking, _) => Err(NetplayError::InvalidRequest {
                info: "the handshake has not completed".to_owned(),
            }),
            (SessionState::Ready, Some(store)) => Ok(store),
        }
    }

    fn send(&mut self, msg: &Message) -> Result<(), NetplayError> {
        let link = self.link.as_mut().ok_or(NetplayError::Disconnected)?;
        let sent = link.send(msg);
        sent.map_err(|err| self.fail(err))
    }

    /// Ends the session on a fatal error and hands the error back.
    fn fail(&mut self, err: NetplayError) -> NetplayError {
        if err.is_fatal() && self.state != SessionState::Disconnected {
            warn!("session failed: {}", err);
            self.end(DisconnectReason::Error(err.clone()));
        }
        err
    }

    fn end(&mut self, reason: DisconnectReason) {
        if self.state == SessionState::Disconnected {
            return;
        }
        info!("session ended: {}", reason);
        self.state = SessionState::Disconnected;
        self.link = None;
        self.store = None;
        self.spectators.hang_up_all();
        self.push_event(SessionEvent::Disconnected { reason });
    }

    fn push_events(&mut self, events: SpectatorEvents) {
        for event in events {
            self.push_event(event);
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > self.config.event_queue_size {
            self.event_queue.pop_front();
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
    use crate::network::memory_stream::MemoryStream;

    struct Sum(u64);

    impl CoreState for Sum {
        fn state_size(&self) -> usize {
            8
        }
        fn save_state(&self, buf: &mut [u8]) -> bool {
            buf.copy_from_slice(&self.0.to_le_bytes());
            true
        }
        fn load_state(&mut self, buf: &[u8]) -> bool {
            self.0 = u64::from_le_bytes(buf.try_into().unwrap());
            true
        }
        fn run_frame(&mut self, inputs: &FrameInputs) {
            let a = u64::from(inputs.port(0).word(0));
            let b = u64::from(inputs.port(1).word(0));
            self.0 = self.0.wrapping_mul(31).wrapping_add(a * 7 + b);
        }
    }

    fn config(role: Role) -> SessionConfig {
        SessionConfig {
            role,
            ..SessionConfig::default()
        }
    }

    fn session(role: Role, stream: MemoryStream) -> Session {
        Session::new(config(role), None, Box::new(stream), 8).unwrap()
    }

    #[test]
    fn port_mapping_follows_home_port_and_flip() {
        let (a, b) = (InputWords::new([1, 0, 0]), InputWords::new([2, 0, 0]));
        assert_eq!(map_ports(0, false, a, b), [a, b]);
        assert_eq!(map_ports(1, false, a, b), [b, a]);
        assert_eq!(map_ports(0, true, a, b), [b, a]);
        assert_eq!(map_ports(1, true, a, b), [a, b]);
    }

    #[test]
    fn waits_for_handshake() {
        let (ours, _theirs) = MemoryStream::pair();
        let mut host = session(Role::Server, ours);
        let mut core = Sum(0);
        assert_eq!(
            host.advance_frame(&mut core, InputWords::ZERO).unwrap(),
            AdvanceOutcome::Waiting(WaitReason::Handshaking)
        );
        assert_eq!(host.handshake_state(), HandshakeState::Connecting);
    }

    #[test]
    fn players_connect_and_advance() {
        let (a, b) = MemoryStream::pair();
        let mut host = session(Role::Server, a);
        let mut client = session(Role::Client, b);
        let (mut host_core, mut client_core) = (Sum(0), Sum(0));
        host.advance_frame(&mut host_core, InputWords::ZERO).unwrap();
        client
            .advance_frame(&mut client_core, InputWords::ZERO)
            .unwrap();
        assert!(host.is_ready());
        assert!(client.is_ready());
        assert_eq!(client.remote_nickname(), Some("player"));
        assert!(host
            .events()
            .any(|event| matches!(event, SessionEvent::Connected { .. })));
    }

    #[test]
    fn spectator_as_primary_link_is_rejected() {
        let (a, b) = MemoryStream::pair();
        let mut host = session(Role::Server, a);
        let _viewer = session(Role::Spectator, b);
        let mut core = Sum(0);
        assert!(matches!(
            host.advance_frame(&mut core, InputWords::ZERO),
            Err(NetplayError::HandshakeMismatch {
                field: HandshakeField::Role,
                ..
            })
        ));
        assert_eq!(host.current_state(), SessionState::Disconnected);
        assert!(host.store().is_none());
    }

    #[test]
    fn client_cannot_flip_or_host_spectators() {
        let (a, _b) = MemoryStream::pair();
        let mut client = session(Role::Client, a);
        assert!(matches!(
            client.request_flip(),
            Err(NetplayError::InvalidRequest { .. })
        ));
        let (c, _d) = MemoryStream::pair();
        assert!(matches!(
            client.add_spectator(c),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn pause_before_ready_is_rejected() {
        let (a, _b) = MemoryStream::pair();
        let mut host = session(Role::Server, a);
        assert!(matches!(
            host.request_pause(),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn disconnect_twice_fails() {
        let (a, _b) = MemoryStream::pair();
        let mut host = session(Role::Server, a);
        host.disconnect().unwrap();
        assert_eq!(host.disconnect(), Err(NetplayError::Disconnected));
        let events: Vec<_> = host.events().collect();
        assert_eq!(
            events,
            vec![SessionEvent::Disconnected {
                reason: DisconnectReason::LocalHangup
            }]
        );
    }

    #[test]
    fn event_queue_is_bounded() {
        let (a, _b) = MemoryStream::pair();
        let mut host = Session::new(
            SessionConfig {
                event_queue_size: 2,
                ..config(Role::Server)
            },
            None,
            Box::new(a),
            8,
        )
        .unwrap();
        for frame in 0..5 {
            host.push_event(SessionEvent::Resumed {
                frame: Frame::new(frame),
            });
        }
        let events: Vec<_> = host.events().collect();
        assert_eq!(
            events,
            vec![
                SessionEvent::Resumed {
                    frame: Frame::new(3)
                },
                SessionEvent::Resumed {
                    frame: Frame::new(4)
                },
            ]
        );
    }
}
