use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::NegotiationError;
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind,
    SignalingState,
};
use crate::signaling::{IceCandidate, SessionDescription};

/// Builds `webrtc` peer connections that all share one local audio track.
pub struct WebRtcPeerFactory {
    api: API,
    config: RTCConfiguration,
    audio_track: Arc<TrackLocalStaticSample>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "meshvoice".to_owned(),
        ));

        Ok(Self {
            api,
            config,
            audio_track,
        })
    }

    /// The Opus track every link sends.
    ///
    /// Nothing in this crate encodes audio: an external Opus encoder writes
    /// its frames here. Until one does, peers receive a silent track. Closing
    /// the peer connections on leave stops sending it.
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio_track.clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let tx = events.clone();
        let peer = remote_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent {
                            remote_id: peer,
                            kind: PeerEventKind::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                        });
                    }
                    Err(e) => warn!(peer = %peer, "failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        let peer = remote_id.to_string();
        peer_connection.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            debug!(peer = %peer, "Signaling State has changed: {}", s);
            let _ = tx.send(PeerEvent {
                remote_id: peer.clone(),
                kind: PeerEventKind::SignalingStateChanged(map_signaling_state(s)),
            });
            Box::pin(async {})
        }));

        let tx = events.clone();
        let peer = remote_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                info!(peer = %peer, "Peer Connection State has changed: {}", s);
                let _ = tx.send(PeerEvent {
                    remote_id: peer.clone(),
                    kind: PeerEventKind::ConnectionStateChanged(map_connection_state(s)),
                });
                Box::pin(async {})
            },
        ));

        let tx = events;
        let peer = remote_id.to_string();
        peer_connection.on_track(Box::new(move |track, _, _| {
            if track.kind() == RTPCodecType::Audio {
                info!(peer = %peer, "received remote audio track");
                let _ = tx.send(PeerEvent {
                    remote_id: peer.clone(),
                    kind: PeerEventKind::RemoteTrack,
                });
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer {
            peer_connection,
            audio_track: self.audio_track.clone(),
        }))
    }
}

pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    Ok(serde_json::from_value(serde_json::to_value(desc)?)?)
}

fn from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    Ok(serde_json::from_value(serde_json::to_value(desc)?)?)
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.peer_connection.create_offer(None).await?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.peer_connection.create_answer(None).await?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.peer_connection
            .set_local_description(to_rtc(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.peer_connection
            .set_remote_description(to_rtc(desc)?)
            .await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.peer_connection.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn attach_local_audio(&self) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_track(Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.peer_connection.signaling_state())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}
