#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use meshvoice::config::{LocalIdentity, SessionConfig};
use meshvoice::connection::BackoffPolicy;
use meshvoice::error::{NegotiationError, TransportError};
use meshvoice::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, SignalingState};
use meshvoice::session::{Command, Session, SessionHandle, SessionNotification};
use meshvoice::signaling::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
use meshvoice::transport::{SignalingTransport, TransportEvent};

/// In-memory transport that records everything sent while open.
#[derive(Default)]
pub struct FakeTransport {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    sent: Mutex<Vec<SignalingMessage>>,
    open: bool,
    /// Upcoming `connect` calls that fail before one succeeds.
    pub fail_connects: u32,
    pub connects: u32,
    pub closed: bool,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|m| m.kind()).collect()
    }

    pub fn drop_connection(&mut self) {
        self.open = false;
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    fn subscribe(&mut self, events: mpsc::UnboundedSender<TransportEvent>) {
        self.events = Some(events);
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(TransportError::NotOpen);
        }
        self.open = true;
        self.connects += 1;
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) {
        if self.open {
            self.sent.lock().unwrap().push(message.clone());
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        self.open = false;
        self.closed = true;
    }
}

#[derive(Debug)]
struct FakePeerState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    tracks: usize,
    rollbacks: usize,
    offers: usize,
}

/// Models the JSEP signaling-state transitions, rollback included.
pub struct FakePeer {
    pub local_id: String,
    pub remote_id: String,
    fail_offers: Arc<AtomicBool>,
    stall_offers: Arc<AtomicBool>,
    state: Mutex<FakePeerState>,
}

fn invalid(what: &str, state: SignalingState) -> NegotiationError {
    NegotiationError::InvalidState(format!("{what} in {state}"))
}

impl FakePeer {
    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn tracks(&self) -> usize {
        self.state.lock().unwrap().tracks
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().signaling == SignalingState::Closed
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.stall_offers.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.signaling == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(NegotiationError::InvalidState("offer creation failed".into()));
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 offer {} -> {} #{}",
            self.local_id, self.remote_id, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock().unwrap();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(invalid("create answer", state.signaling));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 answer {} -> {}",
            self.local_id, self.remote_id
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().unwrap();
        state.signaling = match (state.signaling, desc.kind) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
            (SignalingState::HaveLocalOffer, SdpType::Offer) => SignalingState::HaveLocalOffer,
            (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
            (current, _) => return Err(invalid("set local description", current)),
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().unwrap();
        state.signaling = match (state.signaling, desc.kind) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (current, _) => return Err(invalid("set remote description", current)),
        };
        state.remote = Some(desc);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().unwrap();
        match state.signaling {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                state.signaling = SignalingState::Stable;
                state.rollbacks += 1;
                Ok(())
            }
            current => Err(invalid("rollback", current)),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidState(
                "remote description not set".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn attach_local_audio(&self) -> Result<(), NegotiationError> {
        self.state.lock().unwrap().tracks += 1;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.state.lock().unwrap().signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and keeps them for inspection.
pub struct FakeFactory {
    local_id: String,
    fail_offers: Arc<AtomicBool>,
    stall_offers: Arc<AtomicBool>,
    created: Mutex<Vec<Arc<FakePeer>>>,
    events: Mutex<HashMap<String, mpsc::UnboundedSender<PeerEvent>>>,
}

impl FakeFactory {
    pub fn new(local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_string(),
            fail_offers: Arc::new(AtomicBool::new(false)),
            stall_offers: Arc::new(AtomicBool::new(false)),
            created: Mutex::new(Vec::new()),
            events: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Offers created while set never complete.
    pub fn stall_offers(&self, stall: bool) {
        self.stall_offers.store(stall, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent connection built for `remote_id`.
    pub fn peer(&self, remote_id: &str) -> Option<Arc<FakePeer>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|peer| peer.remote_id == remote_id)
            .cloned()
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(events) = self.events.lock().unwrap().get(&event.remote_id) {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer = Arc::new(FakePeer {
            local_id: self.local_id.clone(),
            remote_id: remote_id.to_string(),
            fail_offers: self.fail_offers.clone(),
            stall_offers: self.stall_offers.clone(),
            state: Mutex::new(FakePeerState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                candidates: Vec::new(),
                tracks: 0,
                rollbacks: 0,
                offers: 0,
            }),
        });
        self.created.lock().unwrap().push(peer.clone());
        self.events
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), events);
        Ok(peer)
    }
}

pub struct TestSession {
    pub session: Session<FakeTransport>,
    pub handle: SessionHandle,
    pub notifications: mpsc::UnboundedReceiver<SessionNotification>,
    pub factory: Arc<FakeFactory>,
}

impl TestSession {
    pub fn new(user_id: &str) -> Self {
        Self::with_config(test_config(user_id))
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let factory = FakeFactory::new(&config.identity.user_id);
        let (session, handle, notifications) =
            Session::new(config, FakeTransport::default(), factory.clone());
        Self {
            session,
            handle,
            notifications,
            factory,
        }
    }

    /// Connected, joined, media ready, with the join already drained.
    pub async fn joined(user_id: &str) -> Self {
        let mut test = Self::new(user_id);
        test.session.start().await;
        test.command(Command::MediaReady).await;
        test.session.transport().take_sent();
        test.drain_notifications();
        test
    }

    /// Lets the per-link negotiation tasks run and applies what they report,
    /// until nothing more arrives.
    pub async fn settle(&mut self) {
        loop {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            if self.session.drain_peer_events().await == 0 {
                break;
            }
        }
    }

    pub async fn deliver(&mut self, message: &SignalingMessage) {
        let json = message.encode().unwrap();
        self.session.handle_text(&json).await;
        self.settle().await;
    }

    pub async fn deliver_json(&mut self, json: serde_json::Value) {
        self.session.handle_text(&json.to_string()).await;
        self.settle().await;
    }

    pub async fn command(&mut self, command: Command) {
        self.session.handle_command(command).await;
        self.settle().await;
    }

    pub fn take_sent(&self) -> Vec<SignalingMessage> {
        self.session.transport().take_sent()
    }

    pub fn drain_notifications(&mut self) -> Vec<SessionNotification> {
        let mut out = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            out.push(notification);
        }
        out
    }
}

pub fn test_config(user_id: &str) -> SessionConfig {
    let mut config = SessionConfig::new(LocalIdentity::new(user_id, "r1").with_username(user_id));
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(1000),
        cap: Duration::from_millis(10_000),
        max_retries: 5,
    };
    config
}

/// What a room server forwards to other participants for `message` sent by `from`.
pub fn relay(from: &str, message: SignalingMessage) -> Option<SignalingMessage> {
    match message {
        SignalingMessage::MuteStatus { muted } => Some(SignalingMessage::MuteStatusChanged {
            from: from.to_string(),
            muted,
        }),
        SignalingMessage::SpeakingStatus { speaking } => {
            Some(SignalingMessage::SpeakingStatusChanged {
                from: from.to_string(),
                speaking,
            })
        }
        SignalingMessage::Join { .. } | SignalingMessage::GetParticipants { .. } => None,
        other => Some(other),
    }
}

/// Relays traffic both ways until neither side has anything left to say.
pub async fn exchange(a: &mut TestSession, b: &mut TestSession) {
    for _ in 0..10 {
        let delivered = pump(a, b).await + pump(b, a).await;
        if delivered == 0 {
            return;
        }
    }
    panic!("signaling between the two sessions never went quiet");
}

/// Forwards everything `from` has sent so far to `to`.
pub async fn pump(from: &TestSession, to: &mut TestSession) -> usize {
    let from_id = from.session.local_id().to_string();
    let sent = from.take_sent();
    let mut delivered = 0;
    for message in sent {
        if let Some(forwarded) = relay(&from_id, message) {
            to.deliver(&forwarded).await;
            delivered += 1;
        }
    }
    delivered
}

pub fn user_joined(from: &str) -> SignalingMessage {
    SignalingMessage::UserJoined {
        from: from.to_string(),
        username: Some(from.to_string()),
    }
}

pub fn user_left(from: &str) -> SignalingMessage {
    SignalingMessage::UserLeft {
        from: from.to_string(),
    }
}

pub fn offer_from(from: &str, to: &str) -> SignalingMessage {
    SignalingMessage::Offer {
        from: from.to_string(),
        target: Some(to.to_string()),
        offer: SessionDescription::offer(format!("v=0 offer {from} -> {to}")),
    }
}

pub fn answer_from(from: &str, to: &str) -> SignalingMessage {
    SignalingMessage::Answer {
        from: from.to_string(),
        target: Some(to.to_string()),
        answer: SessionDescription::answer(format!("v=0 answer {from} -> {to}")),
    }
}

pub fn candidate_from(from: &str, to: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        from: from.to_string(),
        target: Some(to.to_string()),
        candidate: IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    }
}
