//! Signaling and connection-lifecycle core for full-mesh voice rooms.

pub mod activity;
#[cfg(feature = "capture")]
pub mod audio;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod media;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod webrtc;

pub use config::{LocalIdentity, SessionConfig};
pub use error::{Error, Result};
pub use media::{CaptureSwitch, LocalMedia};
pub use session::{Command, Session, SessionHandle, SessionNotification};
pub use transport::{SignalingTransport, WebSocketTransport};
pub use webrtc::WebRtcPeerFactory;
