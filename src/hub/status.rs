//! Forward-only delivery status transitions: sent -> delivered -> read.
//!
//! Each successful transition is persisted first and then reported once to the
//! message's sender. The receiver who caused it is never notified.

use std::sync::Arc;

use super::Hub;
use crate::db::models::{Message, MessageId, MessageStatus, UserId};
use crate::error::StatusError;
use crate::store::{MessageStore, StoreError};
use crate::ws::protocol::Event;

pub struct StatusMachine {
    store: Arc<dyn MessageStore>,
}

impl StatusMachine {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// `sent -> delivered`, after a live delivery or a pending-queue flush.
    pub fn mark_delivered(&self, hub: &Hub, message: &Message) -> Result<Message, StatusError> {
        self.advance(hub, message.id, message.receiver_id, MessageStatus::Delivered)
    }

    /// `delivered -> read`, only on an explicit read receipt from the receiver.
    pub fn mark_read(
        &self,
        hub: &Hub,
        message_id: MessageId,
        caller: UserId,
    ) -> Result<Message, StatusError> {
        self.advance(hub, message_id, caller, MessageStatus::Read)
    }

    fn advance(
        &self,
        hub: &Hub,
        message_id: MessageId,
        actor: UserId,
        next: MessageStatus,
    ) -> Result<Message, StatusError> {
        let current = self.store.get_by_id(message_id)?;
        if current.receiver_id != actor {
            return Err(StatusError::NotReceiver {
                message_id,
                user_id: actor,
            });
        }
        if !current.status.can_advance_to(next) {
            return Err(StoreError::InvalidTransition {
                id: message_id,
                from: current.status,
                to: next,
            }
            .into());
        }

        let updated = self.store.update_status(message_id, next)?;

        let notice = Event::status_change(message_id, next, actor);
        match hub.send(updated.sender_id, notice) {
            Ok(_) => {}
            Err(e) => tracing::debug!(
                message_id,
                sender_id = updated.sender_id,
                error = %e,
                "Status notification not delivered"
            ),
        }

        tracing::debug!(message_id, status = %next, "Message status advanced");
        Ok(updated)
    }
}
