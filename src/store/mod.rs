//! Message persistence contract consumed by the hub.
//!
//! The hub only needs four operations from the system of record: create a
//! message, create one message per receiver for a broadcast, fetch a message by
//! id, and advance its status. Implementations are synchronous; async callers
//! run them on the blocking pool.

pub mod memory;
pub mod sqlite;

use crate::db::models::{Message, MessageId, MessageStatus, NewMessage, UserId};

pub use memory::MemoryMessageStore;
pub use sqlite::SqliteMessageStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("invalid status transition for message {id}: {from} -> {to}")]
    InvalidTransition {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("message store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub trait MessageStore: Send + Sync {
    /// Persist a new message with status `sent` and return it with its id.
    fn create(&self, message: NewMessage) -> Result<Message, StoreError>;

    fn get_by_id(&self, id: MessageId) -> Result<Message, StoreError>;

    /// Advance a message's status. Fails with `InvalidTransition` unless `status`
    /// is the next step after the stored status.
    fn update_status(&self, id: MessageId, status: MessageStatus) -> Result<Message, StoreError>;

    /// Persist one message per receiver, in receiver order.
    fn create_broadcast(
        &self,
        sender_id: UserId,
        receiver_ids: &[UserId],
        content: &str,
        media_url: Option<&str>,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Shared validation for broadcast requests.
pub(crate) fn validate_broadcast(
    sender_id: UserId,
    receiver_ids: &[UserId],
    content: &str,
    media_url: Option<&str>,
) -> Result<Vec<NewMessage>, StoreError> {
    if receiver_ids.is_empty() {
        return Err(StoreError::Validation("receiver ids cannot be empty".to_string()));
    }
    receiver_ids
        .iter()
        .map(|&receiver_id| {
            let msg = NewMessage {
                sender_id,
                receiver_id,
                content: content.to_string(),
                media_url: media_url.map(str::to_string),
            };
            msg.validate().map_err(StoreError::Validation)?;
            Ok(msg)
        })
        .collect()
}
