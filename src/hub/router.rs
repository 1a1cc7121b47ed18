//! Inbound event dispatch.
//!
//! One call per inbound text frame, on the blocking pool: the handlers talk to
//! the message store synchronously and only ever touch the hub through its
//! non-blocking send path.

use std::sync::Arc;

use super::{Delivery, Hub, ThrottleGuard};
use crate::db::models::{Message, NewMessage, UserId};
use crate::error::StatusError;
use crate::store::{MessageStore, StoreError};
use crate::ws::protocol::{
    ErrorCode, Event, EventType, InboundEvent, MarkReadPayload, MessageDraft, TypingPayload,
};

pub const THROTTLED_MESSAGE: &str = "You are sending messages too quickly. Please slow down.";

/// Which inbound events count against the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottlePolicy {
    /// Only `send_message` and `broadcast_message`.
    #[default]
    MessagesOnly,
    AllEvents,
}

impl ThrottlePolicy {
    pub fn from_flag(all_events: bool) -> Self {
        if all_events {
            Self::AllEvents
        } else {
            Self::MessagesOnly
        }
    }

    fn counts(self, event: &InboundEvent) -> bool {
        match self {
            Self::AllEvents => true,
            Self::MessagesOnly => matches!(
                event,
                InboundEvent::SendMessage(_) | InboundEvent::BroadcastMessage(_)
            ),
        }
    }
}

/// Outcome of one dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Handled,
    /// Dropped by the throttle; the sender got an error event.
    Throttled,
    /// Valid frame that needs no action.
    Ignored,
    /// Handler refused the request; the sender got an error event.
    Rejected,
    /// Undecodable frame; logged and skipped.
    Malformed,
}

pub struct EventRouter {
    hub: Arc<Hub>,
    store: Arc<dyn MessageStore>,
    throttle: ThrottleGuard,
    policy: ThrottlePolicy,
}

impl EventRouter {
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn MessageStore>,
        throttle: ThrottleGuard,
        policy: ThrottlePolicy,
    ) -> Self {
        Self {
            hub,
            store,
            throttle,
            policy,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn throttle(&self) -> &ThrottleGuard {
        &self.throttle
    }

    pub fn dispatch(&self, user_id: UserId, frame: &str) -> Routed {
        let event = match InboundEvent::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Discarding undecodable frame");
                return Routed::Malformed;
            }
        };

        if self.policy.counts(&event) && !self.throttle.allow(user_id) {
            tracing::info!(user_id, kind = %event.kind(), "Throttled inbound event");
            self.reply(user_id, Event::error(ErrorCode::RateLimited, THROTTLED_MESSAGE));
            return Routed::Throttled;
        }

        match event {
            InboundEvent::SendMessage(draft) => self.handle_send(user_id, draft),
            InboundEvent::BroadcastMessage(draft) => self.handle_broadcast(user_id, draft),
            InboundEvent::MarkRead(payload) => self.handle_mark_read(user_id, payload),
            InboundEvent::GetOnlineUsers => self.handle_online_users(user_id),
            InboundEvent::Typing(payload) => self.handle_typing(user_id, payload),
            InboundEvent::ServerOnly(kind) => {
                tracing::debug!(user_id, %kind, "Ignoring server-only event from client");
                Routed::Ignored
            }
            InboundEvent::Unknown(kind) => {
                tracing::warn!(user_id, %kind, "Unknown event type");
                Routed::Ignored
            }
        }
    }

    fn reply(&self, user_id: UserId, event: Event) {
        if let Err(e) = self.hub.send(user_id, event) {
            tracing::debug!(user_id, error = %e, "Reply not delivered");
        }
    }

    fn reject(&self, user_id: UserId, code: ErrorCode, message: impl Into<String>) -> Routed {
        self.reply(user_id, Event::error(code, message));
        Routed::Rejected
    }

    fn store_failure(&self, user_id: UserId, error: StoreError) -> Routed {
        match error {
            StoreError::Validation(reason) => self.reject(user_id, ErrorCode::InvalidRequest, reason),
            other => {
                tracing::error!(user_id, error = %other, "Failed to persist message");
                self.reject(user_id, ErrorCode::StoreFailure, "Failed to save message")
            }
        }
    }

    /// Live delivery, falling back to the receiver's pending queue.
    fn deliver(&self, message: Message) {
        if !self.hub.deliver(&message) {
            self.hub.queue_for_redelivery(message);
        }
    }

    fn handle_send(&self, user_id: UserId, draft: MessageDraft) -> Routed {
        let Some(receiver_id) = draft.receiver_id else {
            return self.reject(user_id, ErrorCode::InvalidRequest, "receiver_id is required");
        };
        let media_url = draft.media().map(str::to_string);
        let new_message = NewMessage {
            sender_id: user_id,
            receiver_id,
            content: draft.content,
            media_url,
        };
        if let Err(reason) = new_message.validate() {
            return self.reject(user_id, ErrorCode::InvalidRequest, reason);
        }

        let message = match self.store.create(new_message) {
            Ok(message) => message,
            Err(e) => return self.store_failure(user_id, e),
        };
        tracing::debug!(user_id, message_id = message.id, receiver_id, "Message saved");

        self.reply(user_id, Event::message_saved(EventType::SendMessage, &message));
        self.deliver(message);
        Routed::Handled
    }

    fn handle_broadcast(&self, user_id: UserId, draft: MessageDraft) -> Routed {
        let mut receivers: Vec<UserId> = Vec::with_capacity(draft.receiver_ids.len());
        for id in draft.receiver_ids.iter().copied().chain(draft.receiver_id) {
            if !receivers.contains(&id) {
                receivers.push(id);
            }
        }
        if receivers.is_empty() {
            return self.reject(user_id, ErrorCode::InvalidRequest, "receiver_ids cannot be empty");
        }

        let messages =
            match self
                .store
                .create_broadcast(user_id, &receivers, &draft.content, draft.media())
            {
                Ok(messages) => messages,
                Err(e) => return self.store_failure(user_id, e),
            };
        tracing::debug!(user_id, receivers = messages.len(), "Broadcast saved");

        // Each receiver is independent: one slow peer only affects itself
        for message in messages {
            self.reply(user_id, Event::message_saved(EventType::BroadcastMessage, &message));
            self.deliver(message);
        }
        Routed::Handled
    }

    fn handle_mark_read(&self, user_id: UserId, payload: MarkReadPayload) -> Routed {
        let message_id = payload.message_id;
        match self.hub.status_machine().mark_read(&self.hub, message_id, user_id) {
            Ok(_) => Routed::Handled,
            Err(StatusError::NotReceiver { .. }) => {
                tracing::warn!(user_id, message_id, "Read receipt from non-receiver");
                self.reject(
                    user_id,
                    ErrorCode::Forbidden,
                    "Only the receiver can mark a message as read",
                )
            }
            Err(StatusError::Store(StoreError::InvalidTransition { from, to, .. })) => self.reject(
                user_id,
                ErrorCode::InvalidTransition,
                format!("Cannot change message status from {from} to {to}"),
            ),
            Err(StatusError::Store(StoreError::NotFound(_))) => {
                self.reject(user_id, ErrorCode::NotFound, "Message not found")
            }
            Err(StatusError::Store(e)) => self.store_failure(user_id, e),
        }
    }

    fn handle_online_users(&self, user_id: UserId) -> Routed {
        for online in self.hub.online_user_ids() {
            let status = self.hub.user_status(online);
            match self.hub.send(user_id, Event::user_status(online, status)) {
                Ok(Delivery::Delivered) => {}
                // The caller went away mid-listing
                Ok(Delivery::RecipientOffline) | Err(_) => break,
            }
        }
        Routed::Handled
    }

    fn handle_typing(&self, user_id: UserId, payload: TypingPayload) -> Routed {
        if !self.hub.is_online(payload.receiver_id) {
            return Routed::Ignored;
        }
        self.reply(
            payload.receiver_id,
            Event::typing(user_id, payload.receiver_id, payload.is_typing),
        );
        Routed::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::presence::UserStatus;
    use crate::db::models::MessageStatus;
    use crate::hub::{Connection, Outbound};
    use crate::store::MemoryMessageStore;
    use crate::ws::protocol::{ErrorPayload, StatusChangePayload, TypingPayload};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<MemoryMessageStore>,
        router: EventRouter,
    }

    fn fixture(limit: i64, policy: ThrottlePolicy) -> Fixture {
        let store = Arc::new(MemoryMessageStore::new());
        let hub = Arc::new(Hub::new(store.clone()));
        let router = EventRouter::new(
            Arc::clone(&hub),
            store.clone(),
            ThrottleGuard::new(limit, Duration::from_secs(60)),
            policy,
        );
        Fixture { hub, store, router }
    }

    fn connect(hub: &Arc<Hub>, user_id: UserId) -> Outbound {
        let (conn, mut outbound) = Connection::new(user_id, 64);
        hub.register(conn);
        outbound.drain();
        outbound
    }

    fn of_kind(events: Vec<Event>, kind: EventType) -> Vec<Event> {
        events.into_iter().filter(|e| e.kind == kind).collect()
    }

    fn error_codes(events: Vec<Event>) -> Vec<ErrorCode> {
        of_kind(events, EventType::Error)
            .iter()
            .filter_map(|e| e.payload_as::<ErrorPayload>())
            .map(|p| p.code)
            .collect()
    }

    fn send_frame(to: UserId, content: &str) -> String {
        json!({"type": "send_message", "payload": {"to": to, "message": content}}).to_string()
    }

    #[test]
    fn test_send_to_online_receiver() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);
        let mut bob = connect(&f.hub, 2);
        alice.drain();

        assert_eq!(f.router.dispatch(1, &send_frame(2, "hello")), Routed::Handled);

        let received = of_kind(bob.drain(), EventType::ReceiveMessage);
        assert_eq!(received.len(), 1);
        let msg = received[0].message.clone().unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.sender_id, 1);

        let to_alice = alice.drain();
        assert_eq!(of_kind(to_alice.clone(), EventType::SendMessage).len(), 1);
        let changes = of_kind(to_alice, EventType::StatusChange);
        assert_eq!(changes.len(), 1);
        let change: StatusChangePayload = changes[0].payload_as().unwrap();
        assert_eq!(change.status, MessageStatus::Delivered);
        assert_eq!(change.user_id, 2);

        assert_eq!(f.store.get_by_id(msg.id).unwrap().status, MessageStatus::Delivered);
        assert!(
            of_kind(bob.drain(), EventType::StatusChange).is_empty(),
            "receiver is never notified of its own transition"
        );
    }

    #[test]
    fn test_send_to_offline_receiver_is_queued() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);

        assert_eq!(f.router.dispatch(1, &send_frame(2, "later")), Routed::Handled);

        assert_eq!(f.hub.pending().len(2), 1);
        let saved = of_kind(alice.drain(), EventType::SendMessage);
        assert_eq!(saved.len(), 1);
        let id = saved[0].message.as_ref().unwrap().id;
        assert_eq!(f.store.get_by_id(id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn test_invalid_drafts_are_rejected() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);

        let no_receiver = json!({"type": "send_message", "payload": {"message": "hi"}}).to_string();
        assert_eq!(f.router.dispatch(1, &no_receiver), Routed::Rejected);
        assert_eq!(f.router.dispatch(1, &send_frame(2, "   ")), Routed::Rejected);

        assert_eq!(
            error_codes(alice.drain()),
            vec![ErrorCode::InvalidRequest, ErrorCode::InvalidRequest]
        );
        assert!(f.store.all().is_empty());
    }

    #[test]
    fn test_store_failure_reports_to_sender_only() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);
        let mut bob = connect(&f.hub, 2);
        alice.drain();
        f.store.set_available(false);

        assert_eq!(f.router.dispatch(1, &send_frame(2, "lost")), Routed::Rejected);

        assert_eq!(error_codes(alice.drain()), vec![ErrorCode::StoreFailure]);
        assert!(bob.drain().is_empty());
        assert!(f.hub.pending().is_empty(2));
        assert!(f.hub.is_online(1), "sender connection survives a store failure");
    }

    #[test]
    fn test_throttle_rejects_past_limit() {
        let f = fixture(3, ThrottlePolicy::MessagesOnly);
        let mut alice = connect(&f.hub, 1);

        for i in 0..3 {
            assert_eq!(f.router.dispatch(1, &send_frame(2, &format!("m{i}"))), Routed::Handled);
        }
        assert_eq!(f.router.dispatch(1, &send_frame(2, "m3")), Routed::Throttled);

        let errors: Vec<ErrorPayload> = of_kind(alice.drain(), EventType::Error)
            .iter()
            .filter_map(|e| e.payload_as())
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::RateLimited);
        assert_eq!(errors[0].message, THROTTLED_MESSAGE);
        assert_eq!(f.store.all().len(), 3, "throttled event is not persisted");

        // Presence queries don't count by default
        let query = json!({"type": "get_online_users"}).to_string();
        assert_eq!(f.router.dispatch(1, &query), Routed::Handled);
    }

    #[test]
    fn test_throttle_all_events_policy() {
        let f = fixture(1, ThrottlePolicy::AllEvents);
        let _alice = connect(&f.hub, 1);
        let query = json!({"type": "get_online_users"}).to_string();

        assert_eq!(f.router.dispatch(1, &query), Routed::Handled);
        assert_eq!(f.router.dispatch(1, &query), Routed::Throttled);
    }

    #[test]
    fn test_broadcast_dedupes_and_confirms_each() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);
        let mut bob = connect(&f.hub, 2);
        alice.drain();

        let frame = json!({
            "type": "broadcast_message",
            "payload": {"message": "all hands", "receiver_ids": [2, 3, 2]}
        })
        .to_string();
        assert_eq!(f.router.dispatch(1, &frame), Routed::Handled);

        assert_eq!(f.store.all().len(), 2);
        assert_eq!(of_kind(bob.drain(), EventType::ReceiveMessage).len(), 1);
        assert_eq!(f.hub.pending().len(3), 1);
        assert_eq!(of_kind(alice.drain(), EventType::BroadcastMessage).len(), 2);
    }

    #[test]
    fn test_mark_read_rules() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);
        let mut bob = connect(&f.hub, 2);
        let mut carol = connect(&f.hub, 3);

        f.router.dispatch(1, &send_frame(2, "read me"));
        let id = f.store.all()[0].id;
        alice.drain();
        bob.drain();
        carol.drain();

        let read = json!({"type": "mark_read", "payload": {"message_id": id}}).to_string();

        assert_eq!(f.router.dispatch(3, &read), Routed::Rejected);
        assert_eq!(error_codes(carol.drain()), vec![ErrorCode::Forbidden]);

        assert_eq!(f.router.dispatch(2, &read), Routed::Handled);
        assert_eq!(f.store.get_by_id(id).unwrap().status, MessageStatus::Read);
        let changes = of_kind(alice.drain(), EventType::StatusChange);
        assert_eq!(changes.len(), 1);
        let change: StatusChangePayload = changes[0].payload_as().unwrap();
        assert_eq!(change.status, MessageStatus::Read);

        // Already read: no second notification
        assert_eq!(f.router.dispatch(2, &read), Routed::Rejected);
        assert_eq!(error_codes(bob.drain()), vec![ErrorCode::InvalidTransition]);
        assert!(alice.drain().is_empty());

        let missing = json!({"type": "message_read", "payload": {"message_id": 999}}).to_string();
        assert_eq!(f.router.dispatch(2, &missing), Routed::Rejected);
        assert_eq!(error_codes(bob.drain()), vec![ErrorCode::NotFound]);
    }

    #[test]
    fn test_get_online_users_replies_to_caller_only() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);
        let mut bob = connect(&f.hub, 2);
        alice.drain();
        f.hub.set_status(2, UserStatus::Away);
        alice.drain();

        let query = json!({"type": "get_online_users"}).to_string();
        assert_eq!(f.router.dispatch(1, &query), Routed::Handled);

        let listed: Vec<(UserId, UserStatus)> = of_kind(alice.drain(), EventType::UserStatus)
            .iter()
            .filter_map(|e| e.payload_as::<crate::ws::protocol::UserStatusPayload>())
            .map(|p| (p.user_id, p.status))
            .collect();
        assert_eq!(listed, vec![(1, UserStatus::Online), (2, UserStatus::Away)]);
        assert!(bob.drain().is_empty());
    }

    #[test]
    fn test_typing_forwarded_when_online() {
        let f = fixture(0, ThrottlePolicy::default());
        let _alice = connect(&f.hub, 1);
        let mut bob = connect(&f.hub, 2);

        let frame = json!({"type": "typing", "payload": {"receiver_id": 2, "is_typing": true}});
        assert_eq!(f.router.dispatch(1, &frame.to_string()), Routed::Handled);

        let typing = of_kind(bob.drain(), EventType::Typing);
        assert_eq!(typing.len(), 1);
        let payload: TypingPayload = typing[0].payload_as().unwrap();
        assert_eq!(payload.user_id, 1);
        assert!(payload.is_typing);

        let frame = json!({"type": "typing", "payload": {"receiver_id": 7, "is_typing": true}});
        assert_eq!(f.router.dispatch(1, &frame.to_string()), Routed::Ignored);
        assert!(f.hub.pending().is_empty(7));
    }

    #[test]
    fn test_malformed_and_server_only_frames() {
        let f = fixture(0, ThrottlePolicy::default());
        let mut alice = connect(&f.hub, 1);

        assert_eq!(f.router.dispatch(1, "not json"), Routed::Malformed);
        let spoof = json!({"type": "status_change", "payload": {"message_id": 1}}).to_string();
        assert_eq!(f.router.dispatch(1, &spoof), Routed::Ignored);
        let unknown = json!({"type": "dance"}).to_string();
        assert_eq!(f.router.dispatch(1, &unknown), Routed::Ignored);

        assert!(alice.drain().is_empty(), "nothing is sent back for these");
    }
}
