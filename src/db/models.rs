/// Row and wire types for chat messages.
/// These correspond 1:1 to the `messages` table defined in migrations.rs
/// and to the `message` field of the WebSocket event envelope.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type UserId = i64;
pub type MessageId = i64;

/// Delivery status of a message. Only ever moves forward:
/// sent -> delivered -> read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// The single status that may follow this one, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Sent => Some(Self::Delivered),
            Self::Delivered => Some(Self::Read),
            Self::Read => None,
        }
    }

    /// Whether `to` is the next step after `self`. Skips and regressions are rejected.
    pub fn can_advance_to(&self, to: MessageStatus) -> bool {
        self.next() == Some(to)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: MessageId,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: UserId,
    /// Only set on broadcast requests/confirmations; each stored message has one receiver.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receiver_ids: Vec<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

/// Input to `MessageStore::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub media_url: Option<String>,
}

impl NewMessage {
    /// A message needs text or media, and a real receiver.
    pub fn validate(&self) -> Result<(), String> {
        if self.receiver_id <= 0 {
            return Err(format!("invalid receiver id {}", self.receiver_id));
        }
        if self.content.trim().is_empty() && self.media_url.is_none() {
            return Err("message must have either content or media".to_string());
        }
        Ok(())
    }
}
