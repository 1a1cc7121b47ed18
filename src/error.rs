use crate::db::models::UserId;
use crate::store::StoreError;

/// Failures when pushing an event onto a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The outbound queue was full; the connection has been torn down.
    #[error("outbound queue full for user {0}, connection closed")]
    Backpressure(UserId),

    /// The connection was already closed when the send was attempted.
    #[error("connection for user {0} is closed")]
    Closed(UserId),
}

/// Failures of a status transition request.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("user {user_id} is not the receiver of message {message_id}")]
    NotReceiver {
        message_id: crate::db::models::MessageId,
        user_id: UserId,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
