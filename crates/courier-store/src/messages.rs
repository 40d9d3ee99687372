use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use courier_core::{Message, MessageStore, PersistenceError, Principal};

use crate::database::Database;
use crate::error::StoreError;

/// A stored message as returned by history queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub message_type: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(message_id = %message.id, sender = %message.sender, recipient = %message.recipient))]
    pub fn insert(&self, message: &Message) -> Result<(), StoreError> {
        let wire = message.to_wire();
        let metadata = if wire.metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&wire.metadata)?)
        };
        let created_at = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, recipient_id, content, message_type, timestamp, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.id.as_str(),
                    message.sender.as_str(),
                    message.recipient.as_str(),
                    message.content,
                    message.kind.tag(),
                    message.timestamp,
                    metadata,
                    created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent `limit` messages exchanged between `a` and `b` in either
    /// direction, oldest first.
    pub fn conversation(
        &self,
        a: &Principal,
        b: &Principal,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, recipient_id, content, message_type, timestamp, metadata, created_at
                 FROM (
                     SELECT rowid AS seq, * FROM messages
                     WHERE (sender_id = ?1 AND recipient_id = ?2)
                        OR (sender_id = ?2 AND recipient_id = ?1)
                     ORDER BY seq DESC
                     LIMIT ?3
                 )
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![a.as_str(), b.as_str(), limit], |row| {
                Ok((
                    MessageRow {
                        id: row.get(0)?,
                        sender_id: row.get(1)?,
                        recipient_id: row.get(2)?,
                        content: row.get(3)?,
                        message_type: row.get(4)?,
                        timestamp: row.get(5)?,
                        metadata: None,
                        created_at: row.get(7)?,
                    },
                    row.get::<_, Option<String>>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (mut message, metadata) = row?;
                message.metadata = metadata.map(|m| serde_json::from_str(&m)).transpose()?;
                out.push(message);
            }
            Ok(out)
        })
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("message {id}")));
            }
            Ok(())
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?))
    }
}

/// [`MessageStore`] backed by the SQLite repo.
pub struct SqliteMessageStore {
    db: Database,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn repo(&self) -> MessageRepo {
        MessageRepo::new(self.db.clone())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn persist(&self, message: &Message) -> Result<(), PersistenceError> {
        let repo = self.repo();
        let message = message.clone();
        tokio::task::spawn_blocking(move || repo.insert(&message))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))??;
        debug!("message persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MessageKind;

    fn repo() -> MessageRepo {
        MessageRepo::new(Database::in_memory().unwrap())
    }

    fn msg(from: &str, to: &str, content: &str) -> Message {
        Message::new(from, to, content, MessageKind::Text)
    }

    #[test]
    fn insert_and_count() {
        let repo = repo();
        repo.insert(&msg("u1", "u2", "hi")).unwrap();
        repo.insert(&msg("u2", "u1", "hey")).unwrap();
        assert_eq!(repo.count().unwrap(), 2);
    }

    #[test]
    fn conversation_includes_both_directions_oldest_first() {
        let repo = repo();
        repo.insert(&msg("u1", "u2", "one")).unwrap();
        repo.insert(&msg("u3", "u2", "other pair")).unwrap();
        repo.insert(&msg("u2", "u1", "two")).unwrap();
        repo.insert(&msg("u1", "u2", "three")).unwrap();

        let rows = repo
            .conversation(&Principal::new("u1"), &Principal::new("u2"), 50)
            .unwrap();
        let contents: Vec<&str> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn conversation_limit_keeps_most_recent() {
        let repo = repo();
        for i in 0..5 {
            repo.insert(&msg("u1", "u2", &format!("m{i}"))).unwrap();
        }
        let rows = repo
            .conversation(&Principal::new("u2"), &Principal::new("u1"), 2)
            .unwrap();
        let contents: Vec<&str> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[test]
    fn kind_and_metadata_are_stored() {
        let repo = repo();
        let mut m = Message::new(
            "u1",
            "u2",
            "fixed typo",
            MessageKind::Edit { edited_at: Some("2026-03-01T00:00:00Z".into()) },
        );
        m.metadata.insert("reply_to_id".into(), serde_json::json!("m0"));
        repo.insert(&m).unwrap();

        let rows = repo
            .conversation(&Principal::new("u1"), &Principal::new("u2"), 10)
            .unwrap();
        assert_eq!(rows[0].message_type, "edit");
        let meta = rows[0].metadata.as_ref().unwrap();
        assert_eq!(meta["reply_to_id"], "m0");
        assert_eq!(meta["edit_timestamp"], "2026-03-01T00:00:00Z");
    }

    #[test]
    fn duplicate_id_is_an_error() {
        let repo = repo();
        let m = msg("u1", "u2", "once");
        repo.insert(&m).unwrap();
        assert!(matches!(repo.insert(&m), Err(StoreError::Database(_))));
    }

    #[test]
    fn delete_missing_is_not_found() {
        let repo = repo();
        let m = msg("u1", "u2", "bye");
        repo.insert(&m).unwrap();
        repo.delete(m.id.as_str()).unwrap();
        assert!(matches!(repo.delete(m.id.as_str()), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn store_persists_through_trait() {
        let store = SqliteMessageStore::new(Database::in_memory().unwrap());
        store.persist(&msg("u1", "u2", "hi")).await.unwrap();
        assert_eq!(store.repo().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn store_reports_failure_to_caller() {
        let store = SqliteMessageStore::new(Database::in_memory().unwrap());
        let m = msg("u1", "u2", "hi");
        store.persist(&m).await.unwrap();
        let err = store.persist(&m).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Storage(_)));
    }
}
