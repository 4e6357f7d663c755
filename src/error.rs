use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Failure to turn an inbound frame into a [`crate::signaling::SignalingMessage`].
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed signaling message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("signaling message has no type field")]
    MissingType,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),
    #[error("signaling channel is not open")]
    NotOpen,
    #[error("no event handler registered on the signaling transport")]
    NoSubscriber,
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling writer stopped")]
    WriterStopped,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed (wrong key or corrupted payload)")]
    Decryption,
    #[error("no key available for {0}")]
    MissingKey(String),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] WebRTCError),
    #[error("operation not allowed in signaling state {0}")]
    InvalidState(String),
    #[error("description conversion failed: {0}")]
    Description(#[from] serde_json::Error),
    #[error("no peer link for {0}")]
    UnknownPeer(String),
    #[error("peer connection is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unable to reach the signaling server after {attempts} attempts; restart the session to try again")]
    ReconnectExhausted { attempts: u32 },
    #[error("session already closed")]
    Closed,
}

/// Crate-wide error, for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, Error>;
