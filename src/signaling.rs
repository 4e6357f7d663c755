use serde::{Deserialize, Deserializer, Serialize};

use crate::crypto::JsonWebKey;
use crate::error::SignalingError;

/// Close codes that end the session without a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
/// Reported when the channel dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub fn is_normal_close(code: u16) -> bool {
    code == NORMAL_CLOSURE || code == GOING_AWAY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// SDP blob in the `{type, sdp}` shape browsers exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// One roster entry as reported by the room server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_speaking: bool,
    #[serde(default)]
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "userId", deserialize_with = "id_string")]
        user_id: String,
        #[serde(rename = "roomId", deserialize_with = "id_string")]
        room_id: String,
        #[serde(default)]
        username: Option<String>,
    },
    #[serde(rename = "participants_list")]
    ParticipantsList {
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
    },
    #[serde(rename = "user_joined")]
    UserJoined {
        #[serde(deserialize_with = "id_string")]
        from: String,
        #[serde(default)]
        username: Option<String>,
    },
    #[serde(rename = "offer")]
    Offer {
        #[serde(deserialize_with = "id_string")]
        from: String,
        #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        offer: SessionDescription,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(deserialize_with = "id_string")]
        from: String,
        #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        answer: SessionDescription,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(deserialize_with = "id_string")]
        from: String,
        #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        candidate: IceCandidate,
    },
    #[serde(rename = "user_left")]
    UserLeft {
        #[serde(deserialize_with = "id_string")]
        from: String,
    },
    #[serde(rename = "encryption-key")]
    EncryptionKey {
        #[serde(deserialize_with = "id_string")]
        from: String,
        #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(rename = "keyData")]
        key_data: JsonWebKey,
    },
    #[serde(rename = "speaking_status")]
    SpeakingStatus { speaking: bool },
    #[serde(rename = "speaking_status_changed")]
    SpeakingStatusChanged {
        #[serde(deserialize_with = "id_string")]
        from: String,
        speaking: bool,
    },
    #[serde(rename = "mute_status")]
    MuteStatus { muted: bool },
    #[serde(rename = "mute_status_changed")]
    MuteStatusChanged {
        #[serde(deserialize_with = "id_string")]
        from: String,
        muted: bool,
    },
    #[serde(rename = "get_participants")]
    GetParticipants {
        #[serde(rename = "roomId", deserialize_with = "id_string")]
        room_id: String,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "join",
    "participants_list",
    "user_joined",
    "offer",
    "answer",
    "ice-candidate",
    "user_left",
    "encryption-key",
    "speaking_status",
    "speaking_status_changed",
    "mute_status",
    "mute_status_changed",
    "get_participants",
];

impl SignalingMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::ParticipantsList { .. } => "participants_list",
            SignalingMessage::UserJoined { .. } => "user_joined",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::UserLeft { .. } => "user_left",
            SignalingMessage::EncryptionKey { .. } => "encryption-key",
            SignalingMessage::SpeakingStatus { .. } => "speaking_status",
            SignalingMessage::SpeakingStatusChanged { .. } => "speaking_status_changed",
            SignalingMessage::MuteStatus { .. } => "mute_status",
            SignalingMessage::MuteStatusChanged { .. } => "mute_status_changed",
            SignalingMessage::GetParticipants { .. } => "get_participants",
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalingMessage::UserJoined { from, .. }
            | SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::UserLeft { from }
            | SignalingMessage::EncryptionKey { from, .. }
            | SignalingMessage::SpeakingStatusChanged { from, .. }
            | SignalingMessage::MuteStatusChanged { from, .. } => Some(from),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { target, .. }
            | SignalingMessage::Answer { target, .. }
            | SignalingMessage::IceCandidate { target, .. }
            | SignalingMessage::EncryptionKey { target, .. } => target.as_deref(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An inbound frame after the envelope has been read.
///
/// `message` is `None` when `kind` is not a type this client understands.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub kind: String,
    pub target: Option<String>,
    pub message: Option<SignalingMessage>,
}

impl Inbound {
    /// Whether the frame is addressed to `local_id` (or broadcast).
    pub fn is_for(&self, local_id: &str) -> bool {
        self.target.as_deref().map_or(true, |target| target == local_id)
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    target: Option<String>,
}

pub fn decode(text: &str) -> Result<Inbound, SignalingError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let envelope = Envelope::deserialize(&value)?;
    let kind = envelope.kind.ok_or(SignalingError::MissingType)?;

    let message = if KNOWN_TYPES.contains(&kind.as_str()) {
        Some(serde_json::from_value(value)?)
    } else {
        None
    };

    Ok(Inbound {
        kind,
        target: envelope.target,
        message,
    })
}

// Room servers backed by integer user ids send numbers where browsers send strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}
