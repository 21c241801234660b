//! JSON wire protocol for the proximity chat WebSocket.
//!
//! Every frame is a flat JSON object with a mandatory `type` discriminator.
//! Outbound and inbound frames are modelled as separate enums because the
//! schemas differ: the server may answer a voice message with either an
//! inline payload or a hosted URL, while the client only ever sends inline
//! payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{fallback_name, AudioRef, ChatItem, TextMessage, UserId, VoiceMessage};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Voice frame carries no audio source")]
    MissingAudioSource,
}

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Join handshake, sent once per socket open.
    #[serde(rename_all = "camelCase")]
    Join {
        user_id: String,
        name: String,
        latitude: f64,
        longitude: f64,
        radius: u32,
        reconnect: bool,
    },

    #[serde(rename_all = "camelCase")]
    Chat {
        user_id: String,
        name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Voice {
        user_id: String,
        name: String,
        audio_data: String,
        duration: u32,
        timestamp: DateTime<Utc>,
        mime_type: String,
    },

    /// Liveness probe; keeps intermediaries from reclaiming an idle socket.
    Ping,
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Discriminator for logging; voice payloads are too large to log whole.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Join { .. } => "join",
            ClientFrame::Chat { .. } => "chat",
            ClientFrame::Voice { .. } => "voice",
            ClientFrame::Ping => "ping",
        }
    }
}

/// Frames received from the server.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Chat {
        user_id: String,
        name: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Voice {
        user_id: String,
        name: Option<String>,
        voice_url: Option<String>,
        audio_data: Option<String>,
        duration: Option<u32>,
        timestamp: DateTime<Utc>,
        mime_type: Option<String>,
    },

    /// Server-originated notice; logged, never rendered.
    System { message: String },

    /// Acknowledgement of a ping; administratively ignored.
    Pong,

    /// Server-reported error; logged, never rendered.
    Error { message: String },
}

impl ServerFrame {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(Into::into)
    }

    /// Converts a renderable frame into a message-log entry.
    ///
    /// Returns `Ok(None)` for administrative frames (`system`, `pong`,
    /// `error`) and `Err` for a voice frame with neither a URL nor an inline
    /// payload. Callers drop both cases without failing the session.
    pub fn into_item(self) -> Result<Option<ChatItem>, ProtocolError> {
        match self {
            ServerFrame::Chat {
                user_id,
                name,
                message,
                timestamp,
            } => {
                let user_id = UserId(user_id);
                let name = name.unwrap_or_else(|| fallback_name(&user_id));
                Ok(Some(ChatItem::Text(TextMessage {
                    user_id,
                    name,
                    text: message,
                    timestamp,
                })))
            }

            ServerFrame::Voice {
                user_id,
                name,
                voice_url,
                audio_data,
                duration,
                timestamp,
                mime_type,
            } => {
                let audio = audio_ref_from_wire(voice_url, audio_data, mime_type)?;
                let user_id = UserId(user_id);
                let name = name.unwrap_or_else(|| fallback_name(&user_id));
                Ok(Some(ChatItem::Voice(VoiceMessage {
                    user_id,
                    name,
                    audio,
                    duration_secs: duration.unwrap_or(0),
                    timestamp,
                })))
            }

            ServerFrame::System { .. } | ServerFrame::Pong | ServerFrame::Error { .. } => Ok(None),
        }
    }
}

/// A hosted URL wins over an inline payload when the server sends both,
/// matching the server's own resolution order.
fn audio_ref_from_wire(
    voice_url: Option<String>,
    audio_data: Option<String>,
    mime_type: Option<String>,
) -> Result<AudioRef, ProtocolError> {
    if let Some(url) = voice_url {
        return Ok(AudioRef::RemoteUrl(url));
    }
    if let Some(data) = audio_data {
        return Ok(AudioRef::InlinePayload {
            data,
            mime: mime_type,
        });
    }
    Err(ProtocolError::MissingAudioSource)
}
