//! Per-peer connection ownership and offer/answer/ICE negotiation.
//!
//! Each remote participant gets one [`PeerLink`]: the underlying connection
//! plus an explicit [`NegotiationPhase`]. Phases only change through
//! [`PeerConnectionManager`], which is driven by the session loop, so every
//! race (glare, late answers, candidates before descriptions) is resolved in
//! one place. The JSEP calls themselves run on one task per link, so a slow
//! peer never holds up the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::signaling::{IceCandidate, SessionDescription};

/// JSEP signaling state of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// A local ICE candidate that must be relayed to the peer.
    LocalCandidate(IceCandidate),
    SignalingStateChanged(SignalingState),
    ConnectionStateChanged(PeerConnectionState),
    /// The peer started sending audio.
    RemoteTrack,
    /// A negotiation step finished on link `link` of this peer.
    Negotiation { link: u64, outcome: NegotiationOutcome },
}

/// Callback traffic from a connection, tagged with the peer it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub remote_id: String,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    Offer,
    Answer,
    ApplyAnswer,
    AttachAudio,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStep::Offer => "create offer",
            NegotiationStep::Answer => "answer offer",
            NegotiationStep::ApplyAnswer => "apply answer",
            NegotiationStep::AttachAudio => "attach local audio",
        };
        f.write_str(name)
    }
}

/// Result of one step run by a link's negotiation task.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationOutcome {
    /// Local offer created and set; ready to send.
    OfferCreated(SessionDescription),
    /// Remote offer applied (after a rollback if needed) and answered.
    AnswerCreated(SessionDescription),
    AnswerApplied,
    /// The connection was already `stable` when the answer got its turn.
    AnswerRedundant,
    AnswerRejected(SignalingState),
    AudioAttached,
    Failed { step: NegotiationStep, error: String },
}

/// The RTCPeerConnection-equivalent this core negotiates over.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;
    /// Discards an uncommitted local offer.
    async fn rollback(&self) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn attach_local_audio(&self) -> Result<(), NegotiationError>;
    fn signaling_state(&self) -> SignalingState;
    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Builds a connection whose callbacks are reported on `events`.
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Linked, nothing negotiated yet (or the last attempt failed).
    Idle,
    /// Local offer sent, waiting for the answer.
    OfferSent,
    /// Remote offer applied, answer being produced.
    OfferReceived,
    /// We answered the peer's offer.
    Answered,
    /// Our offer was answered.
    Stable,
}

enum NegotiationJob {
    AttachAudio,
    Offer,
    Answer(SessionDescription),
    ApplyAnswer(SessionDescription),
    Candidate(IceCandidate),
}

pub struct PeerLink {
    id: u64,
    remote_id: String,
    connection: Arc<dyn PeerConnection>,
    jobs: mpsc::UnboundedSender<NegotiationJob>,
    phase: NegotiationPhase,
    audio_requested: bool,
    tracks_attached: bool,
    key_shared: bool,
    offer_deferred: bool,
}

impl PeerLink {
    /// Identifies this link among every link ever made to the same peer.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn has_pending_offer(&self) -> bool {
        self.phase == NegotiationPhase::OfferSent
    }

    pub fn has_answered_offer(&self) -> bool {
        self.phase == NegotiationPhase::Answered
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    pub fn tracks_attached(&self) -> bool {
        self.tracks_attached
    }

    pub fn key_shared(&self) -> bool {
        self.key_shared
    }

    pub fn offer_deferred(&self) -> bool {
        self.offer_deferred
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    fn queue(&self, job: NegotiationJob) {
        if self.jobs.send(job).is_err() {
            warn!(peer = %self.remote_id, "negotiation task stopped, step dropped");
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("phase", &self.phase)
            .field("signaling_state", &self.signaling_state())
            .field("tracks_attached", &self.tracks_attached)
            .field("key_shared", &self.key_shared)
            .finish()
    }
}

/// Runs one link's JSEP steps in order, off the session loop.
///
/// Steps for different links never wait on each other. Every finished step
/// is reported back as [`PeerEventKind::Negotiation`]; the task ends when the
/// link is dropped.
fn spawn_negotiator(
    link: u64,
    remote_id: String,
    connection: Arc<dyn PeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> mpsc::UnboundedSender<NegotiationJob> {
    let (jobs_tx, mut jobs) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let Some(outcome) = run_step(&remote_id, connection.as_ref(), job).await else {
                continue;
            };
            let event = PeerEvent {
                remote_id: remote_id.clone(),
                kind: PeerEventKind::Negotiation { link, outcome },
            };
            if events.send(event).is_err() {
                break;
            }
        }
        debug!(peer = %remote_id, link, "negotiation task finished");
    });
    jobs_tx
}

async fn run_step(
    remote_id: &str,
    connection: &dyn PeerConnection,
    job: NegotiationJob,
) -> Option<NegotiationOutcome> {
    let failed = |step, e: NegotiationError| NegotiationOutcome::Failed {
        step,
        error: e.to_string(),
    };
    let outcome = match job {
        NegotiationJob::AttachAudio => match connection.attach_local_audio().await {
            Ok(()) => NegotiationOutcome::AudioAttached,
            Err(e) => failed(NegotiationStep::AttachAudio, e),
        },
        NegotiationJob::Offer => match make_offer(connection).await {
            Ok(offer) => NegotiationOutcome::OfferCreated(offer),
            Err(e) => failed(NegotiationStep::Offer, e),
        },
        NegotiationJob::Answer(offer) => match answer_offer(remote_id, connection, offer).await {
            Ok(answer) => NegotiationOutcome::AnswerCreated(answer),
            Err(e) => failed(NegotiationStep::Answer, e),
        },
        NegotiationJob::ApplyAnswer(answer) => match connection.signaling_state() {
            SignalingState::HaveLocalOffer => match connection.set_remote_description(answer).await {
                Ok(()) => NegotiationOutcome::AnswerApplied,
                Err(e) => failed(NegotiationStep::ApplyAnswer, e),
            },
            SignalingState::Stable => NegotiationOutcome::AnswerRedundant,
            other => NegotiationOutcome::AnswerRejected(other),
        },
        NegotiationJob::Candidate(candidate) => {
            // Usually the remote description is not set yet; the candidate is lost, not the link.
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(peer = remote_id, "failed to add ICE candidate: {}", e);
            }
            return None;
        }
    };
    Some(outcome)
}

async fn make_offer(connection: &dyn PeerConnection) -> Result<SessionDescription, NegotiationError> {
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}

/// A remote offer always wins over an uncommitted local one: if the
/// connection is not `stable`, the local description is rolled back first.
async fn answer_offer(
    remote_id: &str,
    connection: &dyn PeerConnection,
    offer: SessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let state = connection.signaling_state();
    if state == SignalingState::Closed {
        return Err(NegotiationError::Closed);
    }
    if state != SignalingState::Stable {
        warn!(peer = remote_id, %state, "remote offer collides with local negotiation, rolling back");
        connection.rollback().await?;
    }
    connection.set_remote_description(offer).await?;
    let answer = connection.create_answer().await?;
    connection.set_local_description(answer.clone()).await?;
    debug!(peer = remote_id, state = %connection.signaling_state(), "answered remote offer");
    Ok(answer)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The offer is being created; it is reported as [`NegotiationOutcome::OfferCreated`].
    Started,
    /// An offer to this peer is still waiting for its answer.
    AlreadyPending,
    UnknownPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Handed to the link; the result arrives as a [`NegotiationOutcome`].
    Queued,
    /// We never offered, so the answer is spoofed or duplicated.
    NoPendingOffer,
    UnknownPeer,
}

pub struct PeerConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    links: HashMap<String, PeerLink>,
    next_link: u64,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            events,
            links: HashMap::new(),
            next_link: 1,
        }
    }

    pub fn get(&self, remote_id: &str) -> Option<&PeerLink> {
        self.links.get(remote_id)
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.links.contains_key(remote_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Creates the link for `remote_id` unless one exists. Returns `true` when created.
    ///
    /// Local audio is attached first thing when `media_ready`; otherwise the
    /// link waits for [`Self::request_local_audio`].
    pub async fn ensure_link(
        &mut self,
        remote_id: &str,
        media_ready: bool,
    ) -> Result<bool, NegotiationError> {
        if self.links.contains_key(remote_id) {
            return Ok(false);
        }

        info!(peer = remote_id, "creating peer connection");
        let connection = self.factory.create(remote_id, self.events.clone()).await?;
        let id = self.next_link;
        self.next_link += 1;
        let jobs = spawn_negotiator(
            id,
            remote_id.to_string(),
            connection.clone(),
            self.events.clone(),
        );
        self.links.insert(
            remote_id.to_string(),
            PeerLink {
                id,
                remote_id: remote_id.to_string(),
                connection,
                jobs,
                phase: NegotiationPhase::Idle,
                audio_requested: false,
                tracks_attached: false,
                key_shared: false,
                offer_deferred: false,
            },
        );
        if media_ready {
            self.request_local_audio(remote_id);
        } else {
            debug!(peer = remote_id, "local audio not ready, deferring track attachment");
        }
        Ok(true)
    }

    /// Queues track attachment ahead of any later offer. Returns `false` if already requested.
    pub fn request_local_audio(&mut self, remote_id: &str) -> bool {
        let Some(link) = self.links.get_mut(remote_id) else {
            return false;
        };
        if link.audio_requested {
            return false;
        }
        link.audio_requested = true;
        link.queue(NegotiationJob::AttachAudio);
        true
    }

    pub fn ids_without_audio(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .links
            .values()
            .filter(|link| !link.audio_requested)
            .map(|link| link.remote_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn mark_key_shared(&mut self, remote_id: &str) {
        if let Some(link) = self.links.get_mut(remote_id) {
            link.key_shared = true;
        }
    }

    pub fn defer_offer(&mut self, remote_id: &str) {
        if let Some(link) = self.links.get_mut(remote_id) {
            link.offer_deferred = true;
        }
    }

    pub fn take_deferred_offers(&mut self) -> Vec<String> {
        let mut ids = Vec::new();
        for link in self.links.values_mut() {
            if link.offer_deferred {
                link.offer_deferred = false;
                ids.push(link.remote_id.clone());
            }
        }
        ids.sort();
        ids
    }

    /// Starts a local offer unless one is already outstanding.
    pub fn start_offer(&mut self, remote_id: &str) -> OfferOutcome {
        let Some(link) = self.links.get_mut(remote_id) else {
            return OfferOutcome::UnknownPeer;
        };
        if link.has_pending_offer() {
            debug!(peer = remote_id, "offer already pending, not sending another");
            return OfferOutcome::AlreadyPending;
        }
        link.phase = NegotiationPhase::OfferSent;
        link.offer_deferred = false;
        link.queue(NegotiationJob::Offer);
        OfferOutcome::Started
    }

    /// Hands a remote offer to the link; the answer comes back as [`NegotiationOutcome::AnswerCreated`].
    pub fn start_answer(
        &mut self,
        remote_id: &str,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let link = self
            .links
            .get_mut(remote_id)
            .ok_or_else(|| NegotiationError::UnknownPeer(remote_id.to_string()))?;
        if link.signaling_state() == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        link.phase = NegotiationPhase::OfferReceived;
        link.queue(NegotiationJob::Answer(offer));
        Ok(())
    }

    /// Accepted only while our offer is pending; the signaling state is checked when it is applied.
    pub fn apply_answer(&mut self, remote_id: &str, answer: SessionDescription) -> AnswerOutcome {
        let Some(link) = self.links.get(remote_id) else {
            return AnswerOutcome::UnknownPeer;
        };
        if !link.has_pending_offer() {
            return AnswerOutcome::NoPendingOffer;
        }
        link.queue(NegotiationJob::ApplyAnswer(answer));
        AnswerOutcome::Queued
    }

    pub fn add_ice_candidate(
        &mut self,
        remote_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let link = self
            .links
            .get(remote_id)
            .ok_or_else(|| NegotiationError::UnknownPeer(remote_id.to_string()))?;
        link.queue(NegotiationJob::Candidate(candidate));
        Ok(())
    }

    /// Folds a finished step into the link's phase.
    ///
    /// Returns `None` when the result no longer applies: the link was
    /// replaced, or a remote offer superseded our offer.
    pub fn complete(
        &mut self,
        remote_id: &str,
        link_id: u64,
        outcome: NegotiationOutcome,
    ) -> Option<NegotiationOutcome> {
        let link = self.links.get_mut(remote_id).filter(|link| link.id == link_id)?;
        let phase = link.phase;
        match &outcome {
            NegotiationOutcome::OfferCreated(_) if phase != NegotiationPhase::OfferSent => return None,
            NegotiationOutcome::OfferCreated(_) => {}
            NegotiationOutcome::AnswerCreated(_) => {
                if phase == NegotiationPhase::OfferReceived {
                    link.phase = NegotiationPhase::Answered;
                }
            }
            NegotiationOutcome::AnswerApplied | NegotiationOutcome::AnswerRedundant => {
                if phase != NegotiationPhase::OfferSent {
                    return None;
                }
                link.phase = NegotiationPhase::Stable;
            }
            NegotiationOutcome::AnswerRejected(_) => {}
            NegotiationOutcome::AudioAttached => link.tracks_attached = true,
            NegotiationOutcome::Failed { step, .. } => {
                let in_flight = match step {
                    NegotiationStep::Offer | NegotiationStep::ApplyAnswer => {
                        phase == NegotiationPhase::OfferSent
                    }
                    NegotiationStep::Answer => phase == NegotiationPhase::OfferReceived,
                    NegotiationStep::AttachAudio => false,
                };
                // No automatic retry: the link waits for the next offer from either side.
                if in_flight {
                    link.phase = NegotiationPhase::Idle;
                }
            }
        }
        Some(outcome)
    }

    /// Forgets the link and closes its connection in the background. Returns `false` if there was none.
    pub fn remove(&mut self, remote_id: &str) -> bool {
        let Some(link) = self.links.remove(remote_id) else {
            return false;
        };
        let connection = link.connection.clone();
        let remote_id = remote_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.close().await {
                debug!(peer = %remote_id, "error closing peer connection: {}", e);
            }
        });
        true
    }

    pub async fn close_all(&mut self) -> Vec<String> {
        let links: Vec<PeerLink> = self.links.drain().map(|(_, link)| link).collect();
        let ids: Vec<String> = links.iter().map(|link| link.remote_id.clone()).collect();
        let results = join_all(links.iter().map(|link| link.connection.close())).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                debug!(peer = %id, "error closing peer connection: {}", e);
            }
        }
        ids
    }
}
