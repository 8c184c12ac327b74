//! WebSocket envelopes exchanged between clients and the gateway.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Message, MessageParent};

/// The only client frame type the gateway accepts.
pub const CLIENT_MESSAGE_TYPE: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: Uuid,
    pub status: PresenceStatus,
}

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message { data: Message },
    Presence { data: PresenceUpdate },
    PresenceList { data: Vec<Uuid> },
    Error { message: String },
}

impl ServerEvent {
    pub fn presence(user_id: Uuid, status: PresenceStatus) -> Self {
        ServerEvent::Presence {
            data: PresenceUpdate { user_id, status },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid message format")]
    InvalidFormat(#[source] serde_json::Error),
    #[error("unsupported message type")]
    UnsupportedType(String),
    #[error("content must not be empty")]
    EmptyContent,
    #[error("exactly one of conversation_id or group_id must be set")]
    AmbiguousTarget,
}

/// Client → server envelope as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub content: String,
}

/// A validated send request decoded from a client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub target: MessageParent,
    pub content: String,
}

impl ClientEnvelope {
    pub fn parse(frame: &str) -> Result<SendRequest, EnvelopeError> {
        let envelope: ClientEnvelope =
            serde_json::from_str(frame).map_err(EnvelopeError::InvalidFormat)?;
        envelope.into_send_request()
    }

    pub fn into_send_request(self) -> Result<SendRequest, EnvelopeError> {
        if self.kind != CLIENT_MESSAGE_TYPE {
            return Err(EnvelopeError::UnsupportedType(self.kind));
        }

        if self.content.trim().is_empty() {
            return Err(EnvelopeError::EmptyContent);
        }

        let target = match (self.conversation_id, self.group_id) {
            (Some(conversation_id), None) => MessageParent::conversation(conversation_id),
            (None, Some(group_id)) => MessageParent::group(group_id),
            _ => return Err(EnvelopeError::AmbiguousTarget),
        };

        Ok(SendRequest {
            target,
            content: self.content,
        })
    }
}
