//! The signaling state machine.
//!
//! A [`Session`] owns every piece of mutable state (room cache, peer links,
//! key material, timers) and mutates it from a single event loop. Inbound
//! transport frames, peer-connection callbacks, timer firings and
//! [`SessionHandle`] commands are all funnelled into that loop, so handlers
//! never race each other even though the sources are unordered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityMonitor;
use crate::config::SessionConfig;
use crate::connection::{
    ConnectionHealth, ConnectionMonitor, ConnectionState, ReconnectController, ReconnectDecision,
    TimerEvent,
};
use crate::crypto::{JsonWebKey, KeyStore};
use crate::error::SessionError;
use crate::media::LocalMedia;
use crate::peer::{
    AnswerOutcome, NegotiationOutcome, NegotiationPhase, NegotiationStep, OfferOutcome,
    PeerConnectionFactory, PeerConnectionManager, PeerConnectionState, PeerEvent, PeerEventKind,
    SignalingState,
};
use crate::room::Room;
use crate::signaling::{
    self, is_normal_close, IceCandidate, ParticipantInfo, SessionDescription, SignalingMessage,
    ABNORMAL_CLOSURE,
};
use crate::transport::{SignalingTransport, TransportEvent};

/// Whether local capture can feed outgoing tracks yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Pending,
    Ready,
    /// No capture device; peers still receive us without audio.
    Unavailable,
    /// Local media was stopped by leaving.
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMuted(bool),
    ToggleMute,
    /// One analysis window of mono capture samples.
    ReportAudio(Vec<f32>),
    MediaReady,
    MediaUnavailable(String),
    RefreshParticipants,
    Rejoin,
    Leave,
}

/// What the session reports outward, for whatever renders the room.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    Joined { room_id: String },
    ParticipantJoined { id: String, display_name: String },
    ParticipantLeft { id: String },
    SpeakingChanged { id: String, speaking: bool },
    MuteChanged { id: String, muted: bool },
    RemoteTrack { peer_id: String },
    PeerConnectionChanged { peer_id: String, state: PeerConnectionState },
    LocalSpeaking(bool),
    MediaUnavailable { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    TransportClosed { code: u16, reason: String },
    /// Reconnection gave up. Only a manual rejoin or a restart recovers.
    Fatal { message: String },
    Left,
}

/// Cloneable control surface for a running [`Session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.send(Command::SetMuted(muted))
    }

    pub fn toggle_mute(&self) -> Result<(), SessionError> {
        self.send(Command::ToggleMute)
    }

    pub fn report_audio(&self, samples: Vec<f32>) -> Result<(), SessionError> {
        self.send(Command::ReportAudio(samples))
    }

    pub fn media_ready(&self) -> Result<(), SessionError> {
        self.send(Command::MediaReady)
    }

    pub fn media_unavailable(&self, reason: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::MediaUnavailable(reason.into()))
    }

    /// Asks the server for the roster right away instead of waiting for the next sync.
    pub fn refresh_participants(&self) -> Result<(), SessionError> {
        self.send(Command::RefreshParticipants)
    }

    /// Reconnects with a fresh retry budget.
    pub fn rejoin(&self) -> Result<(), SessionError> {
        self.send(Command::Rejoin)
    }

    pub fn leave(&self) -> Result<(), SessionError> {
        self.send(Command::Leave)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

pub struct Session<T: SignalingTransport> {
    config: SessionConfig,
    transport: T,
    room: Room,
    peers: PeerConnectionManager,
    keys: KeyStore,
    activity: ActivityMonitor,
    reconnect: ReconnectController,
    monitor: ConnectionMonitor,
    media: MediaState,
    local_media: Vec<Arc<dyn LocalMedia>>,
    closed: bool,
    notifications: mpsc::UnboundedSender<SessionNotification>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    command_rx: mpsc::UnboundedReceiver<Command>,
}

impl<T: SignalingTransport> Session<T> {
    pub fn new(
        config: SessionConfig,
        mut transport: T,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> (
        Self,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionNotification>,
    ) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        transport.subscribe(transport_tx);

        let identity = &config.identity;
        let room = Room::new(
            identity.room_id.clone(),
            identity.user_id.clone(),
            identity.username.clone(),
        );

        let session = Self {
            room,
            transport,
            peers: PeerConnectionManager::new(factory, peer_tx),
            keys: KeyStore::new(),
            activity: ActivityMonitor::new(config.activity),
            reconnect: ReconnectController::new(config.backoff, config.roster_sync_interval, timer_tx),
            monitor: ConnectionMonitor::new(),
            media: MediaState::Pending,
            local_media: Vec::new(),
            closed: false,
            notifications: notify_tx,
            transport_rx,
            peer_rx,
            timer_rx,
            command_rx,
            config,
        };
        let handle = SessionHandle {
            commands: command_tx,
        };
        (session, handle, notify_rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_id(&self) -> &str {
        self.room.local_id()
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn activity(&self) -> &ActivityMonitor {
        &self.activity
    }

    pub fn health(&self) -> &ConnectionHealth {
        self.reconnect.health()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.reconnect_pending()
    }

    pub fn roster_sync_running(&self) -> bool {
        self.reconnect.roster_sync_running()
    }

    /// Watchable signaling-channel status.
    pub fn monitor(&self) -> ConnectionMonitor {
        self.monitor.clone()
    }

    pub fn media_state(&self) -> MediaState {
        self.media
    }

    /// Registers local media to stop when the session is left.
    pub fn add_local_media(&mut self, media: Arc<dyn LocalMedia>) {
        self.local_media.push(media);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Connects, joins and processes events until the session is left.
    ///
    /// Returns `ReconnectExhausted` when the session ended after reconnection gave up.
    pub async fn run(mut self) -> Result<(), SessionError> {
        self.start().await;
        while self.step().await {}

        if self.reconnect.health().is_exhausted() {
            return Err(SessionError::ReconnectExhausted {
                attempts: self.reconnect.health().retry_count(),
            });
        }
        Ok(())
    }

    pub async fn start(&mut self) {
        if let Err(e) = self.keys.generate_local_key() {
            warn!(target: "crypto", "could not generate local key, continuing without encryption: {}", e);
        }
        self.monitor.update_state(ConnectionState::Connecting);
        self.connect_and_join().await;
    }

    /// Waits for the next event from any source and handles it.
    /// Returns `false` once the session is closed.
    pub async fn step(&mut self) -> bool {
        if self.closed {
            return false;
        }
        tokio::select! {
            Some(event) = self.transport_rx.recv() => self.handle_transport_event(event).await,
            Some(event) = self.peer_rx.recv() => self.handle_peer_event(event).await,
            Some(timer) = self.timer_rx.recv() => self.handle_timer(timer).await,
            command = self.command_rx.recv() => match command {
                Some(command) => self.handle_command(command).await,
                None => {
                    debug!("all session handles dropped, leaving");
                    self.leave().await;
                }
            },
        }
        !self.closed
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.handle_text(&text).await,
            TransportEvent::Closed { code, reason } => self.on_transport_closed(code, reason).await,
            TransportEvent::Error(e) => {
                warn!("signaling channel error: {}", e);
                self.monitor.set_error(e);
            }
        }
    }

    /// Decodes and dispatches one inbound frame.
    pub async fn handle_text(&mut self, text: &str) {
        if self.closed {
            return;
        }
        let inbound = match signaling::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("dropping undecodable signaling frame: {}", e);
                return;
            }
        };
        if !inbound.is_for(self.room.local_id()) {
            debug!(kind = %inbound.kind, target = ?inbound.target, "message not addressed to us, dropped");
            return;
        }
        match inbound.message {
            Some(message) => self.handle_message(message).await,
            None => warn!(kind = %inbound.kind, "unknown message type"),
        }
    }

    pub async fn handle_message(&mut self, message: SignalingMessage) {
        if let Some(target) = message.target() {
            if target != self.room.local_id() {
                return;
            }
        }
        if message.sender() == Some(self.room.local_id()) {
            debug!(kind = message.kind(), "ignoring our own message echoed back");
            return;
        }
        debug!(kind = message.kind(), from = ?message.sender(), "[RECV]");

        match message {
            SignalingMessage::ParticipantsList { participants } => {
                self.on_participants_list(participants).await
            }
            SignalingMessage::UserJoined { from, username } => {
                self.on_user_joined(&from, username).await
            }
            SignalingMessage::Offer { from, offer, .. } => self.on_offer(&from, offer).await,
            SignalingMessage::Answer { from, answer, .. } => self.on_answer(&from, answer),
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => self.on_remote_candidate(&from, candidate),
            SignalingMessage::UserLeft { from } => {
                info!(peer = %from, "user left");
                self.teardown_peer(&from);
            }
            SignalingMessage::EncryptionKey { from, key_data, .. } => {
                self.on_encryption_key(&from, &key_data)
            }
            SignalingMessage::SpeakingStatusChanged { from, speaking } => {
                if self.room.set_speaking(&from, speaking) {
                    self.notify(SessionNotification::SpeakingChanged { id: from, speaking });
                } else {
                    debug!(peer = %from, "speaking status for unknown participant");
                }
            }
            SignalingMessage::MuteStatusChanged { from, muted } => {
                if self.room.set_muted(&from, muted) {
                    self.notify(SessionNotification::MuteChanged { id: from, muted });
                } else {
                    debug!(peer = %from, "mute status for unknown participant");
                }
            }
            other => debug!(kind = other.kind(), "outbound-only message received, ignored"),
        }
    }

    async fn on_participants_list(&mut self, participants: Vec<ParticipantInfo>) {
        info!(count = participants.len(), "reconciling roster");

        for id in self.room.stale_ids(&participants) {
            info!(peer = %id, "removing stale participant");
            self.teardown_peer(&id);
        }

        for participant in participants {
            if participant.id == self.room.local_id() {
                continue;
            }
            let id = participant.id;
            let discovered = self.room.upsert_remote(&id, participant.username);
            if discovered {
                self.notify_joined(&id);
            }
            self.room.set_speaking(&id, participant.is_speaking);
            self.room.set_muted(&id, participant.is_muted);

            // Unlinked peers get our key and an offer. Double offers settle by rollback.
            if !self.peers.contains(&id) {
                self.connect_peer(&id).await;
            }
        }
    }

    async fn on_user_joined(&mut self, from: &str, username: Option<String>) {
        info!(peer = from, "user joined");
        if self.peers.contains(from) {
            // The peer restarted its session; the old link cannot be renegotiated.
            info!(peer = from, "replacing existing link");
            self.discard_link(from);
        }
        if self.room.upsert_remote(from, username) {
            self.notify_joined(from);
        }
        self.connect_peer(from).await;
    }

    async fn on_offer(&mut self, from: &str, offer: SessionDescription) {
        debug!(
            peer = from,
            state = %self.peers.get(from).map_or("no connection".to_string(), |l| l.signaling_state().to_string()),
            "received offer"
        );
        if self.room.upsert_remote(from, None) {
            self.notify_joined(from);
        }

        if let Err(e) = self.peers.ensure_link(from, self.media == MediaState::Ready).await {
            error!(peer = from, "failed to create peer connection: {}", e);
            return;
        }

        if let Err(e) = self.peers.start_answer(from, offer) {
            error!(peer = from, "error handling offer: {}", e);
        }
    }

    fn on_answer(&mut self, from: &str, answer: SessionDescription) {
        match self.peers.apply_answer(from, answer) {
            AnswerOutcome::Queued => debug!(peer = from, "applying answer"),
            AnswerOutcome::NoPendingOffer => {
                warn!(peer = from, "received answer but no offer is pending, dropped")
            }
            AnswerOutcome::UnknownPeer => warn!(peer = from, "received answer from unknown peer"),
        }
    }

    fn on_remote_candidate(&mut self, from: &str, candidate: IceCandidate) {
        if self.peers.add_ice_candidate(from, candidate).is_err() {
            warn!(peer = from, "ICE candidate for unknown peer, dropped");
        }
    }

    /// Applies a finished negotiation step and sends what it produced.
    fn on_negotiation(&mut self, remote_id: &str, link: u64, outcome: NegotiationOutcome) {
        let Some(outcome) = self.peers.complete(remote_id, link, outcome) else {
            debug!(peer = remote_id, link, "negotiation result no longer applies, dropped");
            return;
        };
        let local_id = self.room.local_id().to_string();
        match outcome {
            NegotiationOutcome::OfferCreated(offer) => {
                self.transport.send(&SignalingMessage::Offer {
                    from: local_id,
                    target: Some(remote_id.to_string()),
                    offer,
                });
            }
            NegotiationOutcome::AnswerCreated(answer) => {
                self.transport.send(&SignalingMessage::Answer {
                    from: local_id,
                    target: Some(remote_id.to_string()),
                    answer,
                });
                if self.peers.get(remote_id).map_or(false, |link| !link.key_shared()) {
                    self.share_key(remote_id);
                }
            }
            NegotiationOutcome::AnswerApplied => info!(peer = remote_id, "negotiation complete"),
            NegotiationOutcome::AnswerRedundant => {
                info!(peer = remote_id, "connection already established, ignoring redundant answer")
            }
            NegotiationOutcome::AnswerRejected(state) => {
                warn!(peer = remote_id, %state, "cannot apply answer in current state")
            }
            NegotiationOutcome::AudioAttached => debug!(peer = remote_id, "local audio attached"),
            NegotiationOutcome::Failed {
                step: NegotiationStep::AttachAudio,
                error,
            } => warn!(peer = remote_id, "continuing without local audio: {}", error),
            NegotiationOutcome::Failed { step, error } => {
                error!(peer = remote_id, %step, "negotiation failed: {}", error)
            }
        }
    }

    fn on_encryption_key(&mut self, from: &str, key_data: &JsonWebKey) {
        match self.keys.import_remote(from, key_data) {
            Ok(()) => info!(target: "crypto", peer = from, "imported peer key"),
            Err(e) => warn!(target: "crypto", peer = from, "failed to import peer key: {}", e),
        }
    }

    /// Links a newly discovered peer, shares our key and offers.
    async fn connect_peer(&mut self, remote_id: &str) {
        match self.peers.ensure_link(remote_id, self.media == MediaState::Ready).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(peer = remote_id, "failed to create peer connection: {}", e);
                return;
            }
        }

        self.share_key(remote_id);

        if self.media == MediaState::Pending {
            debug!(peer = remote_id, "deferring offer until local media is ready");
            self.peers.defer_offer(remote_id);
        } else {
            self.send_offer(remote_id);
        }
    }

    /// The offer itself goes out when the link reports it created.
    fn send_offer(&mut self, remote_id: &str) {
        match self.peers.start_offer(remote_id) {
            OfferOutcome::Started => debug!(peer = remote_id, "creating offer"),
            OfferOutcome::AlreadyPending => {}
            OfferOutcome::UnknownPeer => warn!(peer = remote_id, "cannot offer to unknown peer"),
        }
    }

    fn share_key(&mut self, remote_id: &str) {
        if let Err(e) = self.keys.generate_local_key() {
            warn!(target: "crypto", peer = remote_id, "no local key to share: {}", e);
            return;
        }
        let Some(key_data) = self.keys.export_local() else {
            return;
        };
        self.transport.send(&SignalingMessage::EncryptionKey {
            from: self.room.local_id().to_string(),
            target: Some(remote_id.to_string()),
            key_data,
        });
        self.peers.mark_key_shared(remote_id);
    }

    /// Closes the link and forgets the peer's key. The participant stays.
    fn discard_link(&mut self, remote_id: &str) -> bool {
        let had_link = self.peers.remove(remote_id);
        let had_key = self.keys.discard_remote(remote_id);
        had_link || had_key
    }

    /// The single place a remote participant is removed.
    fn teardown_peer(&mut self, remote_id: &str) {
        let had_link = self.discard_link(remote_id);
        let had_participant = self.room.remove(remote_id).is_some();
        if had_link || had_participant {
            self.notify(SessionNotification::ParticipantLeft {
                id: remote_id.to_string(),
            });
        } else {
            debug!(peer = remote_id, "teardown for unknown peer");
        }
    }

    fn evict_remote_peers(&mut self) {
        let mut ids = self.room.remote_ids();
        for id in self.peers.ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for id in ids {
            self.teardown_peer(&id);
        }
    }

    /// Handles every peer event already queued, without waiting for more.
    pub async fn drain_peer_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.peer_rx.try_recv() {
            self.handle_peer_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.closed {
            return;
        }
        let PeerEvent { remote_id, kind } = event;
        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if !self.peers.contains(&remote_id) {
                    return;
                }
                self.transport.send(&SignalingMessage::IceCandidate {
                    from: self.room.local_id().to_string(),
                    target: Some(remote_id),
                    candidate,
                });
            }
            PeerEventKind::SignalingStateChanged(state) => {
                debug!(peer = %remote_id, %state, "signaling state changed");
            }
            PeerEventKind::ConnectionStateChanged(state) => {
                self.on_peer_connection_state(&remote_id, state).await
            }
            PeerEventKind::RemoteTrack => {
                if self.peers.contains(&remote_id) {
                    self.notify(SessionNotification::RemoteTrack { peer_id: remote_id });
                }
            }
            PeerEventKind::Negotiation { link, outcome } => {
                self.on_negotiation(&remote_id, link, outcome)
            }
        }
    }

    async fn on_peer_connection_state(&mut self, remote_id: &str, state: PeerConnectionState) {
        let Some(link) = self.peers.get(remote_id) else {
            return;
        };
        // A replaced link still reports its close; only the current one counts.
        let current_closed = link.signaling_state() == SignalingState::Closed;

        self.notify(SessionNotification::PeerConnectionChanged {
            peer_id: remote_id.to_string(),
            state,
        });
        match state {
            PeerConnectionState::Failed => {
                warn!(peer = remote_id, "peer connection failed, discarding link");
                self.discard_link(remote_id);
            }
            PeerConnectionState::Closed if current_closed => {
                info!(peer = remote_id, "peer connection closed, discarding link");
                self.discard_link(remote_id);
            }
            _ => {}
        }
    }

    pub async fn handle_timer(&mut self, timer: TimerEvent) {
        if self.closed {
            return;
        }
        match timer {
            TimerEvent::Reconnect => {
                self.reconnect.reconnect_fired();
                info!(attempt = self.reconnect.health().retry_count(), "reconnecting signaling channel");
                self.connect_and_join().await;
            }
            TimerEvent::RosterSync => {
                if self.transport.is_open() {
                    debug!("periodic roster sync");
                    self.request_participants();
                }
            }
        }
    }

    pub async fn handle_command(&mut self, command: Command) {
        if self.closed {
            return;
        }
        match command {
            Command::SetMuted(muted) => self.apply_mute(muted),
            Command::ToggleMute => {
                let muted = !self.activity.is_muted();
                self.apply_mute(muted);
            }
            Command::ReportAudio(samples) => self.on_audio_window(&samples),
            Command::MediaReady => self.on_media_ready(),
            Command::MediaUnavailable(reason) => self.on_media_unavailable(reason),
            Command::RefreshParticipants => self.request_participants(),
            Command::Rejoin => self.rejoin().await,
            Command::Leave => self.leave().await,
        }
    }

    fn apply_mute(&mut self, muted: bool) {
        let local_id = self.room.local_id().to_string();
        if muted && self.activity.is_speaking() {
            self.room.set_speaking(&local_id, false);
            self.transport.send(&SignalingMessage::SpeakingStatus { speaking: false });
            self.notify(SessionNotification::LocalSpeaking(false));
        }
        self.activity.set_muted(muted);
        self.room.set_muted(&local_id, muted);
        info!(muted, "local mute changed");
        self.transport.send(&SignalingMessage::MuteStatus { muted });
        self.notify(SessionNotification::MuteChanged { id: local_id, muted });
    }

    fn on_audio_window(&mut self, samples: &[f32]) {
        let Some(speaking) = self.activity.observe(samples) else {
            return;
        };
        let local_id = self.room.local_id().to_string();
        self.room.set_speaking(&local_id, speaking);
        self.transport.send(&SignalingMessage::SpeakingStatus { speaking });
        self.notify(SessionNotification::LocalSpeaking(speaking));
    }

    fn on_media_ready(&mut self) {
        if self.media == MediaState::Ready {
            return;
        }
        info!("local media ready");
        self.media = MediaState::Ready;

        let mut to_offer = self.peers.take_deferred_offers();
        for id in self.peers.ids_without_audio() {
            self.peers.request_local_audio(&id);
            // Links that already negotiated without audio need a new offer.
            let negotiated = self
                .peers
                .get(&id)
                .map_or(false, |link| link.phase() != NegotiationPhase::Idle);
            if negotiated && !to_offer.contains(&id) {
                to_offer.push(id);
            }
        }
        for id in to_offer {
            self.send_offer(&id);
        }
    }

    fn on_media_unavailable(&mut self, reason: String) {
        warn!(%reason, "local media unavailable, continuing receive-only");
        self.media = MediaState::Unavailable;
        self.notify(SessionNotification::MediaUnavailable { reason });
        for id in self.peers.take_deferred_offers() {
            self.send_offer(&id);
        }
    }

    fn request_participants(&self) {
        self.transport.send(&SignalingMessage::GetParticipants {
            room_id: self.room.id().to_string(),
        });
    }

    async fn rejoin(&mut self) {
        info!("manual rejoin requested");
        self.reconnect.reset_for_rejoin();
        self.monitor.update_retry_count(0);
        if self.transport.is_open() {
            self.send_join();
        } else {
            self.monitor.update_state(ConnectionState::Connecting);
            self.connect_and_join().await;
        }
    }

    async fn connect_and_join(&mut self) {
        match self.transport.connect().await {
            Ok(()) => self.on_open(),
            Err(e) => {
                warn!("failed to connect signaling channel: {}", e);
                self.monitor.set_error(e.to_string());
                self.on_transport_closed(ABNORMAL_CLOSURE, e.to_string()).await;
            }
        }
    }

    fn on_open(&mut self) {
        info!(room = self.room.id(), "signaling channel open, joining room");
        self.reconnect.on_open();
        self.monitor.update_state(ConnectionState::Connected);
        self.monitor.update_retry_count(0);
        self.send_join();
        self.reconnect.start_roster_sync();
        self.notify(SessionNotification::Joined {
            room_id: self.room.id().to_string(),
        });
    }

    fn send_join(&self) {
        let identity = &self.config.identity;
        self.transport.send(&SignalingMessage::Join {
            user_id: identity.user_id.clone(),
            room_id: identity.room_id.clone(),
            username: identity.username.clone(),
        });
    }

    async fn on_transport_closed(&mut self, code: u16, reason: String) {
        if self.closed {
            return;
        }
        self.reconnect.stop_roster_sync();

        if is_normal_close(code) {
            info!(code, %reason, "signaling channel closed normally");
            self.monitor.update_state(ConnectionState::Disconnected);
            self.notify(SessionNotification::TransportClosed { code, reason });
            return;
        }

        warn!(code, %reason, "signaling channel closed abnormally");
        // The roster is unknown until we are back; drop everyone rather than trust it.
        self.evict_remote_peers();

        match self.reconnect.on_abnormal_close() {
            ReconnectDecision::Retry { attempt, delay } => {
                self.monitor.update_state(ConnectionState::Reconnecting);
                self.monitor.update_retry_count(attempt);
                self.notify(SessionNotification::Reconnecting { attempt, delay });
            }
            ReconnectDecision::GiveUp { attempts } => {
                error!(attempts, "maximum reconnection attempts reached");
                self.monitor.update_state(ConnectionState::Failed);
                self.monitor
                    .set_error(format!("gave up after {attempts} reconnection attempts"));
                self.notify(SessionNotification::Fatal {
                    message: format!(
                        "Connection lost after {attempts} reconnection attempts. Please restart the session."
                    ),
                });
            }
            ReconnectDecision::AlreadyExhausted => {
                debug!("reconnection already exhausted, ignoring close");
            }
        }
    }

    /// Tears everything down in one pass: local media, timers, links, keys, roster, transport.
    pub async fn leave(&mut self) {
        if self.closed {
            return;
        }
        info!(room = self.room.id(), "leaving room");
        self.closed = true;

        for media in self.local_media.drain(..) {
            media.stop();
        }
        self.media = MediaState::Stopped;
        self.reconnect.cancel_all();
        let closed = self.peers.close_all().await;
        debug!(count = closed.len(), "closed peer connections");
        self.keys.clear_remote();
        for id in self.room.remote_ids() {
            self.room.remove(&id);
        }
        self.transport.close().await;

        self.monitor.update_state(ConnectionState::Closed);
        self.notify(SessionNotification::Left);
    }

    fn notify_joined(&self, id: &str) {
        let display_name = self
            .room
            .get(id)
            .map(|p| p.display_name())
            .unwrap_or_else(|| id.to_string());
        self.notify(SessionNotification::ParticipantJoined {
            id: id.to_string(),
            display_name,
        });
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self.notifications.send(notification);
    }
}
