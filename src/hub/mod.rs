//! Connection registry and delivery hub.
//!
//! The hub owns the map of user id -> live connection, the pending-delivery
//! queue and the status state machine. The registry lock only guards pointer
//! bookkeeping: every send happens after the guard is dropped, so a slow peer
//! can never hold up registration or other users' deliveries.

pub mod connection;
pub mod pending;
pub mod router;
pub mod status;
pub mod throttle;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::chat::presence::UserStatus;
use crate::db::models::{Message, UserId};
use crate::error::HubError;
use crate::store::MessageStore;
use crate::ws::protocol::Event;

pub use connection::{Connection, ConnectionId, Outbound, OUTBOUND_CAPACITY};
pub use pending::PendingQueue;
pub use router::{EventRouter, Routed, ThrottlePolicy};
pub use status::StatusMachine;
pub use throttle::ThrottleGuard;

/// Result of a unicast that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No connection registered for the user. Not an error.
    RecipientOffline,
}

struct Entry {
    conn: Arc<Connection>,
    status: UserStatus,
}

pub struct Hub {
    connections: RwLock<HashMap<UserId, Entry>>,
    pending: PendingQueue,
    status: StatusMachine,
}

impl Hub {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            pending: PendingQueue::new(),
            status: StatusMachine::new(store),
        }
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn status_machine(&self) -> &StatusMachine {
        &self.status
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<UserId, Entry>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<UserId, Entry>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `conn` as the user's only connection.
    ///
    /// An existing connection for the same user is closed and replaced; its
    /// own teardown later finds the entry gone and stays silent. Everyone else
    /// learns the user is online, the new connection gets a presence snapshot,
    /// and the user's pending queue is flushed in the background.
    pub fn register(self: &Arc<Self>, conn: Arc<Connection>) {
        let user_id = conn.user_id();

        let (previous, snapshot) = {
            let mut map = self.write_map();
            let previous = map.insert(
                user_id,
                Entry {
                    conn: Arc::clone(&conn),
                    status: UserStatus::Online,
                },
            );
            let snapshot: Vec<(UserId, UserStatus)> = map
                .iter()
                .filter(|(id, _)| **id != user_id)
                .map(|(id, entry)| (*id, entry.status))
                .collect();
            (previous, snapshot)
        };

        if let Some(old) = previous {
            if old.conn.id() != conn.id() {
                old.conn.close();
                tracing::info!(
                    user_id,
                    old_connection = old.conn.id(),
                    new_connection = conn.id(),
                    "Replaced existing connection"
                );
            }
        }

        tracing::info!(user_id, connection = conn.id(), "Connection registered");

        self.broadcast(Event::user_status(user_id, UserStatus::Online), Some(user_id));

        for (other, status) in snapshot {
            if let Err(e) = conn.try_send(Event::user_status(other, status)) {
                tracing::warn!(user_id, error = %e, "Failed to seed presence snapshot");
                self.teardown(&conn);
                return;
            }
        }

        self.schedule_flush(user_id);
    }

    fn schedule_flush(self: &Arc<Self>, user_id: UserId) {
        if self.pending.is_empty(user_id) {
            return;
        }
        let hub = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    hub.flush_pending(user_id);
                });
            }
            Err(_) => {
                hub.flush_pending(user_id);
            }
        }
    }

    /// Remove the user's connection, if any, and announce them offline.
    pub fn unregister(&self, user_id: UserId) -> bool {
        let conn = self.read_map().get(&user_id).map(|e| Arc::clone(&e.conn));
        match conn {
            Some(conn) => {
                self.teardown(&conn);
                true
            }
            None => false,
        }
    }

    /// Close `conn` and drop its registry entry. Idempotent.
    ///
    /// The offline broadcast only fires when the entry still belonged to this
    /// connection, so a replaced connection never reports its user offline.
    pub fn teardown(&self, conn: &Connection) {
        let user_id = conn.user_id();
        let newly_closed = conn.close();

        let removed = {
            let mut map = self.write_map();
            match map.get(&user_id) {
                Some(entry) if entry.conn.id() == conn.id() => {
                    map.remove(&user_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            tracing::info!(user_id, connection = conn.id(), "Connection unregistered");
            self.broadcast(Event::user_status(user_id, UserStatus::Offline), Some(user_id));
        } else if newly_closed {
            tracing::debug!(user_id, connection = conn.id(), "Closed superseded connection");
        }
    }

    /// Non-blocking unicast. A full queue tears the recipient down and is
    /// reported as an error; an absent recipient is not an error.
    pub fn send(&self, user_id: UserId, event: Event) -> Result<Delivery, HubError> {
        let conn = self.read_map().get(&user_id).map(|e| Arc::clone(&e.conn));
        let Some(conn) = conn else {
            return Ok(Delivery::RecipientOffline);
        };

        match conn.try_send(event) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Dropping unresponsive connection");
                self.teardown(&conn);
                Err(e)
            }
        }
    }

    /// Send to every registered connection except `exclude`.
    /// Returns how many connections accepted the event.
    pub fn broadcast(&self, event: Event, exclude: Option<UserId>) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .read_map()
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, entry)| Arc::clone(&entry.conn))
            .collect();

        let mut accepted = 0;
        for conn in targets {
            match conn.try_send(event.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(user_id = conn.user_id(), error = %e, "Broadcast target unresponsive");
                    self.teardown(&conn);
                }
            }
        }
        accepted
    }

    pub fn online_user_ids(&self) -> BTreeSet<UserId> {
        self.read_map().keys().copied().collect()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.read_map().contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.read_map().len()
    }

    /// Presence of `user_id`; anyone without a connection is offline.
    pub fn user_status(&self, user_id: UserId) -> UserStatus {
        self.read_map()
            .get(&user_id)
            .map(|e| e.status)
            .unwrap_or(UserStatus::Offline)
    }

    /// Switch a connected user between online and away and tell everyone else.
    /// Offline is only reachable by disconnecting.
    pub fn set_status(&self, user_id: UserId, status: UserStatus) -> bool {
        if status == UserStatus::Offline {
            return false;
        }
        let changed = {
            let mut map = self.write_map();
            match map.get_mut(&user_id) {
                Some(entry) if entry.status != status => {
                    entry.status = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.broadcast(Event::user_status(user_id, status), Some(user_id));
        }
        changed
    }

    /// Deliver a stored message to its receiver and mark it delivered.
    /// Returns `false` when the receiver could not be reached; the caller
    /// decides what to queue.
    pub fn deliver(&self, message: &Message) -> bool {
        match self.send(message.receiver_id, Event::receive_message(message)) {
            Ok(Delivery::Delivered) => {
                if let Err(e) = self.status.mark_delivered(self, message) {
                    tracing::warn!(message_id = message.id, error = %e, "Failed to mark message delivered");
                }
                true
            }
            Ok(Delivery::RecipientOffline) => false,
            Err(e) => {
                tracing::debug!(message_id = message.id, error = %e, "Live delivery failed");
                false
            }
        }
    }

    /// Park a message that could not be delivered live.
    ///
    /// The receiver may have registered between the failed send and the
    /// enqueue, after its registration flush already found the queue empty.
    /// Enqueue first, then look at the registry: either this check sees the
    /// connection or the registration flush sees the message.
    pub fn queue_for_redelivery(&self, message: Message) {
        let user_id = message.receiver_id;
        self.pending.enqueue(message);
        if self.is_online(user_id) {
            self.flush_pending(user_id);
        }
    }

    /// Redeliver everything queued for `user_id`, oldest first. Stops at the
    /// first failure and puts the remainder back in front of the queue.
    pub fn flush_pending(&self, user_id: UserId) -> usize {
        let mut delivered = 0;

        // Each failed pass tore down or missed a connection, so another pass
        // only happens when a newer connection registered meanwhile
        loop {
            let mut queued = self.pending.take(user_id).into_iter();
            let mut interrupted = false;

            while let Some(message) = queued.next() {
                if self.deliver(&message) {
                    delivered += 1;
                    continue;
                }
                let remainder: Vec<Message> = std::iter::once(message).chain(queued).collect();
                tracing::info!(
                    user_id,
                    requeued = remainder.len(),
                    "User went away during flush, requeueing"
                );
                self.pending.requeue_front(user_id, remainder);
                interrupted = true;
                break;
            }

            if !interrupted || !self.is_online(user_id) {
                break;
            }
        }

        if delivered > 0 {
            tracing::info!(user_id, delivered, "Flushed pending messages");
        }
        delivered
    }
}
