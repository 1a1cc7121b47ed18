//! One live duplex channel bound to one authenticated user.
//!
//! The hub only ever sees the `Connection` handle: a bounded outbound queue
//! plus a shutdown signal. The socket itself lives in the two pumps spawned by
//! `ws::actor`, which own the `Outbound` half.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::db::models::UserId;
use crate::error::HubError;
use crate::ws::protocol::Event;

/// Default capacity of a connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Event>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Receiving half of a connection, owned by its write pump.
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<Event>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            outbound: tx,
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });
        (
            conn,
            Outbound {
                rx,
                shutdown: shutdown_rx,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking enqueue. Never waits for the peer.
    pub fn try_send(&self, event: Event) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed(self.user_id));
        }
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::Backpressure(self.user_id),
            mpsc::error::TrySendError::Closed(_) => HubError::Closed(self.user_id),
        })
    }

    /// Mark closed and signal both pumps. Returns `true` only for the first caller.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        true
    }

    /// Shutdown signal for the read pump.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl Outbound {
    /// Next queued event, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        if *self.shutdown.borrow() {
            self.rx.close();
        }
        tokio::select! {
            biased;
            event = self.rx.recv() => event,
            _ = self.shutdown.wait_for(|closed| *closed) => {
                self.rx.close();
                None
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}
