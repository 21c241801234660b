use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_VOICE_MIME;

/// Opaque user identifier issued by the auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl UserId {
    /// Last four characters of the id, used for placeholder display names.
    /// Counts characters, not bytes; ids are not guaranteed to be ASCII.
    pub fn short(&self) -> &str {
        let start = self
            .0
            .char_indices()
            .rev()
            .take(4)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        &self.0[start..]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Placeholder display name for users that did not provide one.
pub fn fallback_name(user_id: &UserId) -> String {
    format!("User {}", user_id.short())
}

/// Identity supplied by the auth collaborator. Immutable for the session's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            display_name: display_name.into(),
        }
    }

    /// The display name, or a placeholder derived from the user id.
    pub fn name(&self) -> String {
        if self.display_name.trim().is_empty() {
            fallback_name(&self.user_id)
        } else {
            self.display_name.clone()
        }
    }
}

/// Device coordinates supplied by the location collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Lifecycle status of the chat session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Joining,
    Connected,
    Reconnecting,
    Closed,
}

impl SessionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}

/// A user within the chat radius, as reported by the nearby snapshot fetch.
/// Snapshots are replaced wholesale on refresh, never mutated per item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NearbyUser {
    pub user_id: UserId,
    pub name: String,
    pub location: Coordinates,
}

/// Where the audio of a voice message lives. Exactly one source per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioRef {
    /// Server-hosted file, path relative to the service base URL.
    RemoteUrl(String),
    /// Base64 payload carried inline in the frame.
    InlinePayload {
        data: String,
        mime: Option<String>,
    },
}

impl AudioRef {
    /// Declared MIME type, falling back to the protocol default.
    pub fn mime(&self) -> &str {
        match self {
            AudioRef::RemoteUrl(_) => DEFAULT_VOICE_MIME,
            AudioRef::InlinePayload { mime, .. } => mime.as_deref().unwrap_or(DEFAULT_VOICE_MIME),
        }
    }
}

/// A rendered text message in the session log.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    pub user_id: UserId,
    pub name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A rendered voice message in the session log.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceMessage {
    pub user_id: UserId,
    pub name: String,
    pub audio: AudioRef,
    pub duration_secs: u32,
    pub timestamp: DateTime<Utc>,
}

impl VoiceMessage {
    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity {
            timestamp: self.timestamp,
            user_id: self.user_id.clone(),
        }
    }
}

/// An entry in the ordered message log. Only chat and voice frames are
/// rendered; administrative frames never become log entries.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatItem {
    Text(TextMessage),
    Voice(VoiceMessage),
}

impl ChatItem {
    pub fn sender(&self) -> &UserId {
        match self {
            ChatItem::Text(m) => &m.user_id,
            ChatItem::Voice(m) => &m.user_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChatItem::Text(m) => m.timestamp,
            ChatItem::Voice(m) => m.timestamp,
        }
    }
}

/// Identity of a message for playback tracking, keyed by timestamp + sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageIdentity {
    pub timestamp: DateTime<Utc>,
    pub user_id: UserId,
}

impl std::fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.timestamp.to_rfc3339(), self.user_id)
    }
}
