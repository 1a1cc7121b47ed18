use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use std::sync::MutexGuard;

use super::{validate_broadcast, MessageStore, StoreError};
use crate::db::models::{Message, MessageId, MessageStatus, NewMessage, UserId};
use crate::db::DbPool;

const SELECT_MESSAGE: &str = "SELECT id, sender_id, receiver_id, content, media_url, status, created_at, updated_at
     FROM messages WHERE id = ?1";

/// SQLite-backed message store sharing the server's `DbPool`.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: DbPool,
}

impl SqliteMessageStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("DB lock error: {}", e)))
    }
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let status: String = row.get(5)?;
    let status = status
        .parse::<MessageStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    Ok(Message {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        receiver_ids: Vec::new(),
        content: row.get(3)?,
        media_url: row.get(4)?,
        status,
        created_at: parse_time(6, row.get(6)?)?,
        updated_at: parse_time(7, row.get(7)?)?,
    })
}

fn insert_message(conn: &Connection, msg: &NewMessage, now: DateTime<Utc>) -> rusqlite::Result<Message> {
    let stamp = now.to_rfc3339();
    conn.execute(
        "INSERT INTO messages (sender_id, receiver_id, content, media_url, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'sent', ?5, ?5)",
        rusqlite::params![msg.sender_id, msg.receiver_id, msg.content, msg.media_url, stamp],
    )?;

    Ok(Message {
        id: conn.last_insert_rowid(),
        sender_id: msg.sender_id,
        receiver_id: msg.receiver_id,
        receiver_ids: Vec::new(),
        content: msg.content.clone(),
        media_url: msg.media_url.clone(),
        status: MessageStatus::Sent,
        created_at: now,
        updated_at: now,
    })
}

impl MessageStore for SqliteMessageStore {
    fn create(&self, message: NewMessage) -> Result<Message, StoreError> {
        message.validate().map_err(StoreError::Validation)?;
        let conn = self.conn()?;
        Ok(insert_message(&conn, &message, Utc::now())?)
    }

    fn get_by_id(&self, id: MessageId) -> Result<Message, StoreError> {
        let conn = self.conn()?;
        conn.query_row(SELECT_MESSAGE, [id], message_from_row)
            .optional()?
            .ok_or(StoreError::NotFound(id))
    }

    fn update_status(&self, id: MessageId, status: MessageStatus) -> Result<Message, StoreError> {
        let conn = self.conn()?;
        let current = conn
            .query_row(SELECT_MESSAGE, [id], message_from_row)
            .optional()?
            .ok_or(StoreError::NotFound(id))?;

        if !current.status.can_advance_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        let now = Utc::now();
        // Compare-and-set on the previous status so concurrent writers can't regress it
        let changed = conn.execute(
            "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            rusqlite::params![status.as_str(), now.to_rfc3339(), id, current.status.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        Ok(Message {
            status,
            updated_at: now,
            ..current
        })
    }

    fn create_broadcast(
        &self,
        sender_id: UserId,
        receiver_ids: &[UserId],
        content: &str,
        media_url: Option<&str>,
    ) -> Result<Vec<Message>, StoreError> {
        let drafts = validate_broadcast(sender_id, receiver_ids, content, media_url)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut messages = Vec::with_capacity(drafts.len());
        for draft in &drafts {
            messages.push(insert_message(&tx, draft, now)?);
        }
        tx.commit()?;

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    fn store() -> SqliteMessageStore {
        SqliteMessageStore::new(init_memory_db().unwrap())
    }

    fn hello(sender_id: UserId, receiver_id: UserId) -> NewMessage {
        NewMessage {
            sender_id,
            receiver_id,
            content: "hello".to_string(),
            media_url: None,
        }
    }

    #[test]
    fn test_create_assigns_id_and_sent_status() {
        let store = store();
        let first = store.create(hello(1, 2)).unwrap();
        let second = store.create(hello(1, 2)).unwrap();

        assert!(first.id > 0);
        assert!(second.id > first.id);
        assert_eq!(first.status, MessageStatus::Sent);

        let fetched = store.get_by_id(first.id).unwrap();
        assert_eq!(fetched.content, "hello");
        assert_eq!(fetched.receiver_id, 2);
    }

    #[test]
    fn test_status_moves_forward_only() {
        let store = store();
        let msg = store.create(hello(1, 2)).unwrap();

        assert!(matches!(
            store.update_status(msg.id, MessageStatus::Read),
            Err(StoreError::InvalidTransition { .. })
        ));

        let delivered = store.update_status(msg.id, MessageStatus::Delivered).unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);

        let read = store.update_status(msg.id, MessageStatus::Read).unwrap();
        assert_eq!(read.status, MessageStatus::Read);

        assert!(matches!(
            store.update_status(msg.id, MessageStatus::Delivered),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(store.get_by_id(msg.id).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_missing_message() {
        let store = store();
        assert!(matches!(store.get_by_id(99), Err(StoreError::NotFound(99))));
        assert!(matches!(
            store.update_status(99, MessageStatus::Delivered),
            Err(StoreError::NotFound(99))
        ));
    }

    #[test]
    fn test_broadcast_creates_one_message_per_receiver() {
        let store = store();
        let msgs = store
            .create_broadcast(1, &[2, 3, 4], "all hands", Some("/uploads/a.png"))
            .unwrap();

        assert_eq!(msgs.len(), 3);
        let receivers: Vec<UserId> = msgs.iter().map(|m| m.receiver_id).collect();
        assert_eq!(receivers, vec![2, 3, 4]);
        for msg in &msgs {
            let stored = store.get_by_id(msg.id).unwrap();
            assert_eq!(stored.media_url.as_deref(), Some("/uploads/a.png"));
            assert_eq!(stored.status, MessageStatus::Sent);
        }
    }

    #[test]
    fn test_broadcast_validation_is_all_or_nothing() {
        let store = store();
        assert!(matches!(
            store.create_broadcast(1, &[], "hi", None),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store.create_broadcast(1, &[2, -1], "hi", None),
            Err(StoreError::Validation(_))
        ));
        // Nothing from the rejected broadcast was persisted
        assert!(matches!(store.get_by_id(1), Err(StoreError::NotFound(1))));
    }
}
