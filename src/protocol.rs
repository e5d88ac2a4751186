use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PEER_ID_PREFIX: &str = "peer_";
const PEER_ID_HEX_LEN: usize = 8;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Message types carried on the wire.
///
/// `offer`/`answer`/`ice-candidate` payloads are opaque to this layer;
/// they are relayed, never inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    JoinRoom,
    LeaveRoom,
    JoinGroup,
    LeaveGroup,
    UserJoined,
    UserLeft,
    ParticipantUpdate,
    GroupMessage,
    Error,
}

/// Flat wire envelope shared by every message type.
///
/// `to` absent means broadcast. `from` is stamped by the sending side
/// and overwritten by the relay authority, never trusted from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, rename = "roomId", skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    #[serde(default, rename = "groupId", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    #[serde(
        default,
        rename = "participantId",
        skip_serializing_if = "Option::is_none"
    )]
    pub participant_id: Option<String>,

    #[serde(
        default,
        rename = "participantData",
        skip_serializing_if = "Option::is_none"
    )]
    pub participant_data: Option<ParticipantUpdate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl SignalMessage {
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            data: None,
            from: None,
            to: None,
            room_id: None,
            group_id: None,
            participant_id: None,
            participant_data: None,
            timestamp: None,
        }
    }

    /// Targeted session-negotiation envelope (offer/answer/ice-candidate)
    pub fn negotiation(kind: SignalKind, payload: Value, to: &str) -> Self {
        Self {
            data: Some(payload),
            to: Some(to.to_string()),
            ..Self::new(kind)
        }
    }

    pub fn join_room(room_id: &str) -> Self {
        Self {
            room_id: Some(room_id.to_string()),
            ..Self::new(SignalKind::JoinRoom)
        }
    }

    pub fn leave_room(room_id: &str) -> Self {
        Self {
            room_id: Some(room_id.to_string()),
            ..Self::new(SignalKind::LeaveRoom)
        }
    }

    pub fn join_group(group_id: &str, participant: &Participant) -> Self {
        Self {
            group_id: Some(group_id.to_string()),
            participant_data: Some(participant.to_update()),
            ..Self::new(SignalKind::JoinGroup)
        }
    }

    pub fn leave_group(group_id: &str) -> Self {
        Self {
            group_id: Some(group_id.to_string()),
            ..Self::new(SignalKind::LeaveGroup)
        }
    }

    pub fn user_joined(participant_id: &str) -> Self {
        Self {
            participant_id: Some(participant_id.to_string()),
            ..Self::new(SignalKind::UserJoined)
        }
    }

    pub fn user_left(participant_id: &str) -> Self {
        Self {
            participant_id: Some(participant_id.to_string()),
            ..Self::new(SignalKind::UserLeft)
        }
    }

    pub fn participant_update(update: ParticipantUpdate) -> Self {
        Self {
            participant_data: Some(update),
            ..Self::new(SignalKind::ParticipantUpdate)
        }
    }

    pub fn group_message(payload: Value) -> Self {
        Self {
            data: Some(payload),
            ..Self::new(SignalKind::GroupMessage)
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            data: Some(Value::String(message.to_string())),
            ..Self::new(SignalKind::Error)
        }
    }

    /// true if `to` is unset (fan out to every other member)
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// Display metadata for one group member.
///
/// Owned by the participant directory of the group that contains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,

    #[serde(default = "enabled")]
    pub audio: bool,

    #[serde(default = "enabled")]
    pub video: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

fn enabled() -> bool {
    true
}

impl Default for Participant {
    fn default() -> Self {
        Self {
            name: None,
            avatar: None,
            audio: true,
            video: true,
            role: None,
        }
    }
}

impl Participant {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Shallow merge: keys present in the update overwrite, keys absent
    /// from it persist.
    pub fn apply(&mut self, update: &ParticipantUpdate) {
        if let Some(name) = &update.name {
            self.name = Some(name.clone());
        }
        if let Some(avatar) = &update.avatar {
            self.avatar = Some(avatar.clone());
        }
        if let Some(audio) = update.audio {
            self.audio = audio;
        }
        if let Some(video) = update.video {
            self.video = video;
        }
        if let Some(role) = &update.role {
            self.role = Some(role.clone());
        }
    }

    /// Full metadata as a partial, for `join-group` announcements.
    pub fn to_update(&self) -> ParticipantUpdate {
        ParticipantUpdate {
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            audio: Some(self.audio),
            video: Some(self.video),
            role: self.role.clone(),
        }
    }

    pub fn from_update(update: &ParticipantUpdate) -> Self {
        let mut participant = Self::default();
        participant.apply(update);
        participant
    }
}

/// Partial participant metadata; only the specified keys travel on the
/// wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl ParticipantUpdate {
    pub fn audio(enabled: bool) -> Self {
        Self {
            audio: Some(enabled),
            ..Self::default()
        }
    }

    pub fn video(enabled: bool) -> Self {
        Self {
            video: Some(enabled),
            ..Self::default()
        }
    }
}

/// Generate a local peer id: "peer_" + 8 hex chars
pub fn local_peer_id() -> String {
    let mut rng = rand::rng();
    let mut id = String::with_capacity(PEER_ID_PREFIX.len() + PEER_ID_HEX_LEN);
    id.push_str(PEER_ID_PREFIX);
    let value: u32 = rng.random();
    for i in 0..PEER_ID_HEX_LEN {
        let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
        id.push(HEX_CHARS[nibble] as char);
    }
    id
}

/// Milliseconds since the epoch, for the outbound `timestamp` field
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
