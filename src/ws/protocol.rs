//! JSON wire format for hub events.
//!
//! Every frame in either direction is one `Event`:
//! `{"type", "sender_id", "timestamp", "payload", "message"}`.
//! Inbound frames are decoded into the `InboundEvent` sum type so the router
//! matches exhaustively on what a client may ask for.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::chat::presence::UserStatus;
use crate::db::models::{Message, MessageId, MessageStatus, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    SendMessage,
    BroadcastMessage,
    /// Delivery of a message to its receiver.
    ReceiveMessage,
    MarkRead,
    GetOnlineUsers,
    StatusChange,
    UserStatus,
    Typing,
    Error,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SendMessage => "send_message",
            Self::BroadcastMessage => "broadcast_message",
            Self::ReceiveMessage => "receive_message",
            Self::MarkRead => "mark_read",
            Self::GetOnlineUsers => "get_online_users",
            Self::StatusChange => "status_change",
            Self::UserStatus => "user_status",
            Self::Typing => "typing",
            Self::Error => "error",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "send_message" => Self::SendMessage,
            "broadcast_message" => Self::BroadcastMessage,
            "receive_message" => Self::ReceiveMessage,
            // older clients name the read receipt after the event they expect back
            "mark_read" | "message_read" => Self::MarkRead,
            "get_online_users" => Self::GetOnlineUsers,
            "status_change" => Self::StatusChange,
            "user_status" => Self::UserStatus,
            "typing" => Self::Typing,
            "error" => Self::Error,
            _ => Self::Unknown(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope. Immutable once built; constructed through the helpers below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadPayload {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangePayload {
    pub message_id: MessageId,
    pub status: MessageStatus,
    /// The receiver whose action caused the transition.
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatusPayload {
    pub user_id: UserId,
    pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default)]
    pub user_id: UserId,
    pub receiver_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimited,
    InvalidRequest,
    Forbidden,
    InvalidTransition,
    NotFound,
    StoreFailure,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// What a client asks to send. Accepts both the embedded-message shape
/// (`receiver_id`, `content`) and the payload shape (`to`, `message`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageDraft {
    #[serde(default, alias = "to")]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub receiver_ids: Vec<UserId>,
    #[serde(default, alias = "message")]
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
}

impl MessageDraft {
    /// Media URL with empty strings treated as absent.
    pub fn media(&self) -> Option<&str> {
        self.media_url.as_deref().filter(|url| !url.is_empty())
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SendMessage(MessageDraft),
    BroadcastMessage(MessageDraft),
    MarkRead(MarkReadPayload),
    GetOnlineUsers,
    Typing(TypingPayload),
    /// Types the server emits but never accepts (status_change, user_status, ...).
    ServerOnly(EventType),
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: EventType,
        source: serde_json::Error,
    },
}

impl InboundEvent {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let event: Event = serde_json::from_str(frame)?;
        Self::try_from(event)
    }

    pub fn kind(&self) -> EventType {
        match self {
            Self::SendMessage(_) => EventType::SendMessage,
            Self::BroadcastMessage(_) => EventType::BroadcastMessage,
            Self::MarkRead(_) => EventType::MarkRead,
            Self::GetOnlineUsers => EventType::GetOnlineUsers,
            Self::Typing(_) => EventType::Typing,
            Self::ServerOnly(kind) => kind.clone(),
            Self::Unknown(name) => EventType::Unknown(name.clone()),
        }
    }
}

fn payload_as<T: DeserializeOwned>(kind: &EventType, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.clone(),
        source,
    })
}

/// Drafts come from the embedded message when present, else from the payload.
fn draft_from(kind: &EventType, event: Event) -> Result<MessageDraft, ProtocolError> {
    match event.message {
        Some(msg) => Ok(MessageDraft {
            receiver_id: (msg.receiver_id != 0).then_some(msg.receiver_id),
            receiver_ids: msg.receiver_ids,
            content: msg.content,
            media_url: msg.media_url,
        }),
        None => payload_as(kind, event.payload),
    }
}

impl TryFrom<Event> for InboundEvent {
    type Error = ProtocolError;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        let kind = event.kind.clone();
        match kind {
            EventType::SendMessage => Ok(Self::SendMessage(draft_from(&kind, event)?)),
            EventType::BroadcastMessage => Ok(Self::BroadcastMessage(draft_from(&kind, event)?)),
            EventType::MarkRead => Ok(Self::MarkRead(payload_as(&kind, event.payload)?)),
            EventType::GetOnlineUsers => Ok(Self::GetOnlineUsers),
            EventType::Typing => Ok(Self::Typing(payload_as(&kind, event.payload)?)),
            EventType::ReceiveMessage
            | EventType::StatusChange
            | EventType::UserStatus
            | EventType::Error => Ok(Self::ServerOnly(kind)),
            EventType::Unknown(name) => Ok(Self::Unknown(name)),
        }
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Value {
    // Payload types are plain structs of numbers and strings
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

impl Event {
    pub fn new(kind: EventType, sender_id: UserId) -> Self {
        Self {
            kind,
            sender_id,
            timestamp: Utc::now(),
            payload: Value::Null,
            message: None,
        }
    }

    fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = to_payload(payload);
        self
    }

    fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    /// A message as seen by its receiver.
    pub fn receive_message(message: &Message) -> Self {
        Self::new(EventType::ReceiveMessage, message.sender_id).with_message(message.clone())
    }

    /// Confirmation to the sender that `message` was persisted.
    pub fn message_saved(kind: EventType, message: &Message) -> Self {
        Self::new(kind, message.sender_id).with_message(message.clone())
    }

    pub fn status_change(message_id: MessageId, status: MessageStatus, receiver_id: UserId) -> Self {
        Self::new(EventType::StatusChange, receiver_id).with_payload(&StatusChangePayload {
            message_id,
            status,
            user_id: receiver_id,
        })
    }

    pub fn user_status(user_id: UserId, status: UserStatus) -> Self {
        Self::new(EventType::UserStatus, user_id).with_payload(&UserStatusPayload { user_id, status })
    }

    pub fn typing(sender_id: UserId, receiver_id: UserId, is_typing: bool) -> Self {
        Self::new(EventType::Typing, sender_id).with_payload(&TypingPayload {
            user_id: sender_id,
            receiver_id,
            is_typing,
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(EventType::Error, 0).with_payload(&ErrorPayload {
            code,
            message: message.into(),
        })
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
