use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{validate_broadcast, MessageStore, StoreError};
use crate::db::models::{Message, MessageId, MessageStatus, NewMessage, UserId};

/// In-process message store. Used by tests and by `message_store = "memory"`.
///
/// `set_available(false)` makes every call fail with `StoreError::Unavailable`,
/// which is how the persistence-failure paths of the router are exercised.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Inner {
    next_id: MessageId,
    messages: HashMap<MessageId, Message>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Every stored message, ordered by id.
    pub fn all(&self) -> Vec<Message> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut all: Vec<Message> = inner.messages.values().cloned().collect();
        all.sort_by_key(|m| m.id);
        all
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("store lock error: {}", e)))
    }
}

impl Inner {
    fn insert(&mut self, draft: NewMessage) -> Message {
        self.next_id += 1;
        let now = Utc::now();
        let msg = Message {
            id: self.next_id,
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            receiver_ids: Vec::new(),
            content: draft.content,
            media_url: draft.media_url,
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
        };
        self.messages.insert(msg.id, msg.clone());
        msg
    }
}

impl MessageStore for MemoryMessageStore {
    fn create(&self, message: NewMessage) -> Result<Message, StoreError> {
        message.validate().map_err(StoreError::Validation)?;
        Ok(self.lock()?.insert(message))
    }

    fn get_by_id(&self, id: MessageId) -> Result<Message, StoreError> {
        self.lock()?
            .messages
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn update_status(&self, id: MessageId, status: MessageStatus) -> Result<Message, StoreError> {
        let mut inner = self.lock()?;
        let msg = inner.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !msg.status.can_advance_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: msg.status,
                to: status,
            });
        }
        msg.status = status;
        msg.updated_at = Utc::now();
        Ok(msg.clone())
    }

    fn create_broadcast(
        &self,
        sender_id: UserId,
        receiver_ids: &[UserId],
        content: &str,
        media_url: Option<&str>,
    ) -> Result<Vec<Message>, StoreError> {
        let drafts = validate_broadcast(sender_id, receiver_ids, content, media_url)?;
        let mut inner = self.lock()?;
        Ok(drafts.into_iter().map(|d| inner.insert(d)).collect())
    }
}
