//! Per-user buffer of messages created while the receiver had no connection.
//!
//! Messages are already persisted by the time they get here, so this is a
//! delivery hint rather than the system of record: it lives in memory only and
//! a client can always fall back to history.

use dashmap::DashMap;
use std::collections::VecDeque;

use crate::db::models::{Message, MessageId, UserId};

#[derive(Default)]
pub struct PendingQueue {
    queues: DashMap<UserId, VecDeque<Message>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` for its receiver.
    pub fn enqueue(&self, message: Message) {
        let receiver_id = message.receiver_id;
        let mut queue = self.queues.entry(receiver_id).or_default();
        queue.push_back(message);
        tracing::debug!(
            user_id = receiver_id,
            queued = queue.len(),
            "Message queued for offline user"
        );
    }

    /// Atomically remove and return everything queued for `user_id`, oldest first.
    pub fn take(&self, user_id: UserId) -> Vec<Message> {
        self.queues
            .remove(&user_id)
            .map(|(_, queue)| queue.into())
            .unwrap_or_default()
    }

    /// Put undelivered messages back ahead of anything queued since they were taken.
    pub fn requeue_front(&self, user_id: UserId, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut queue = self.queues.entry(user_id).or_default();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }
    }

    pub fn len(&self, user_id: UserId) -> usize {
        self.queues.get(&user_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, user_id: UserId) -> bool {
        self.len(user_id) == 0
    }

    pub fn contains(&self, user_id: UserId, message_id: MessageId) -> bool {
        self.queues
            .get(&user_id)
            .map(|q| q.iter().any(|m| m.id == message_id))
            .unwrap_or(false)
    }

    /// Total queued messages across all users.
    pub fn total(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }
}
