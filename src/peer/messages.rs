//! Typed messages carried over the session data channel.
//!
//! Each frame on the wire is one JSON envelope:
//!
//! ```json
//! {"type": "CHAT", "payload": {"text": "hi", "sender": "patient"}, "timestamp": 1718000000000}
//! ```
//!
//! The payload shape depends on `type`. The envelope is decoded first and the payload
//! second, so an unknown payload field never hides the message type from the logs.

use crate::media::MediaStateKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed vocabulary of data channel message types
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SkeletonUpdate,
    Chat,
    Reaction,
    MediaState,
    Alert,
}

/// Wire envelope; `timestamp` is Unix milliseconds at the sender
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    pub timestamp: i64,
}

impl DataEnvelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Decode the payload according to the envelope type
    pub fn decode(&self) -> serde_json::Result<DataMessage> {
        let payload = self.payload.clone();
        Ok(match self.kind {
            MessageType::SkeletonUpdate => DataMessage::Skeleton(serde_json::from_value(payload)?),
            MessageType::Chat => DataMessage::Chat(serde_json::from_value(payload)?),
            MessageType::Reaction => DataMessage::Reaction(serde_json::from_value(payload)?),
            MessageType::MediaState => DataMessage::MediaState(serde_json::from_value(payload)?),
            MessageType::Alert => DataMessage::Alert(serde_json::from_value(payload)?),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Pose {
    pub landmarks: Vec<Landmark>,
}

/// One pose-estimation snapshot. `analysis` is opaque to the session layer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SkeletonUpdate {
    pub poses: Vec<Pose>,
    #[serde(default)]
    pub analysis: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub sender: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: String,
}

/// Announces a change of the sender's local media flags
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaStateNotice {
    pub kind: MediaStateKind,
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub message: String,
}

/// Decoded payload of a [`DataEnvelope`]
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    Skeleton(SkeletonUpdate),
    Chat(ChatMessage),
    Reaction(Reaction),
    MediaState(MediaStateNotice),
    Alert(Alert),
}

impl DataMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            DataMessage::Skeleton(_) => MessageType::SkeletonUpdate,
            DataMessage::Chat(_) => MessageType::Chat,
            DataMessage::Reaction(_) => MessageType::Reaction,
            DataMessage::MediaState(_) => MessageType::MediaState,
            DataMessage::Alert(_) => MessageType::Alert,
        }
    }

    pub fn into_envelope(self, timestamp: i64) -> serde_json::Result<DataEnvelope> {
        let kind = self.message_type();
        let payload = match self {
            DataMessage::Skeleton(m) => serde_json::to_value(m)?,
            DataMessage::Chat(m) => serde_json::to_value(m)?,
            DataMessage::Reaction(m) => serde_json::to_value(m)?,
            DataMessage::MediaState(m) => serde_json::to_value(m)?,
            DataMessage::Alert(m) => serde_json::to_value(m)?,
        };
        Ok(DataEnvelope {
            kind,
            payload,
            timestamp,
        })
    }
}

/// A message received from the remote peer
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message: DataMessage,
    pub timestamp: i64,
}

impl ReceivedMessage {
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}
