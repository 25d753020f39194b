//! Session data model: participants, messages, status and events

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::core_rendezvous::PeerMetadata;

/// Sender id used for locally generated notices
pub const SYSTEM_SENDER: &str = "system";

/// The local user for one session lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub local_id: String,
    pub display_name: String,
    pub interests: Vec<String>,
}

impl Participant {
    pub fn new(
        local_id: impl Into<String>,
        display_name: impl Into<String>,
        interests: Vec<String>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            display_name: display_name.into(),
            interests: normalize_interests(interests),
        }
    }

    /// Fresh random identity with an `Anon-NNNN` display name
    pub fn anonymous(interests: Vec<String>) -> Self {
        let tag: u16 = rand::rng().random_range(1000..=9999);
        Self::new(Uuid::new_v4().to_string(), format!("Anon-{}", tag), interests)
    }

    /// What the other side sees when a session opens
    pub fn metadata(&self) -> PeerMetadata {
        PeerMetadata {
            peer_id: self.local_id.clone(),
            display_name: self.display_name.clone(),
            interests: self.interests.clone(),
        }
    }
}

fn normalize_interests(interests: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    interests
        .into_iter()
        .map(|interest| interest.trim().to_string())
        .filter(|interest| !interest.is_empty())
        .filter(|interest| seen.insert(interest.to_lowercase()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub text: String,
    /// Unix time in milliseconds
    pub timestamp: u64,
    pub kind: MessageKind,
}

impl Message {
    pub fn text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            text: text.into(),
            timestamp: now_millis(),
            kind: MessageKind::Text,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            ..Self::text(SYSTEM_SENDER, text)
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == MessageKind::System
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Searching,
    Connected,
    Disconnected,
}

impl SessionStatus {
    /// Whether the presentation layer should enable the composer
    pub fn can_compose(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}

/// Payload exchanged over an established channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireFrame {
    Chat {
        id: String,
        sender_id: String,
        text: String,
        timestamp: u64,
        kind: MessageKind,
    },
    /// Graceful close notice
    Bye,
}

impl WireFrame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<&Message> for WireFrame {
    fn from(message: &Message) -> Self {
        WireFrame::Chat {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
            kind: message.kind,
        }
    }
}

/// Events delivered to the presentation layer, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged {
        status: SessionStatus,
        peer: Option<PeerMetadata>,
    },
    MessageAppended(Message),
    HistoryCleared,
    IceBreakers(Vec<String>),
    VideoBlurred,
    /// Starting the session failed and will not be retried
    StartFailed(String),
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub peer: Option<PeerMetadata>,
    pub history: Vec<Message>,
    pub muted: bool,
    pub video_enabled: bool,
}
