//! Bounded, append-only conversation logs.
//!
//! One ordered log per [`ConversationId`]. Every append is followed by a trim
//! to the newest `max_entries` rows inside the same transaction, so callers
//! never observe an untrimmed log or a half-written message.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use tracing::{debug, instrument};

use parley_core::{ConversationId, Message};

use crate::database::Database;
use crate::error::StoreError;

/// Size bounds applied to every conversation log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryLimits {
    /// Entries kept after every append.
    pub max_entries: usize,
    /// Entries returned by [`ConversationStore::recent`].
    pub recent_window: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_entries: 100,
            recent_window: 50,
        }
    }
}

/// Durable ordered storage for private conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append `message` and trim the log, as one unit.
    async fn append(&self, conversation_id: &ConversationId, message: &Message) -> Result<(), StoreError>;

    /// The newest `recent_window` messages, oldest first. Unknown ids yield an empty list.
    async fn recent(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError>;

    /// Number of messages currently retained for the conversation.
    async fn count(&self, conversation_id: &ConversationId) -> Result<usize, StoreError>;

    fn limits(&self) -> HistoryLimits;
}

/// [`ConversationStore`] backed by the SQLite [`Database`].
///
/// SQLite calls block, so each operation runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteConversationStore {
    db: Database,
    limits: HistoryLimits,
}

impl SqliteConversationStore {
    pub fn new(db: Database, limits: HistoryLimits) -> Self {
        Self { db, limits }
    }

    /// The full retained log (at most `max_entries`), oldest first.
    pub async fn log(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        let db = self.db.clone();
        let id = conversation_id.clone();
        let max = self.limits.max_entries;
        tokio::task::spawn_blocking(move || newest_first_reversed(&db, &id, max)).await?
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    #[instrument(skip(self, message), fields(conversation_id = %conversation_id, message_id = %message.id))]
    async fn append(&self, conversation_id: &ConversationId, message: &Message) -> Result<(), StoreError> {
        let db = self.db.clone();
        let id = conversation_id.clone();
        let message = message.clone();
        let max = self.limits.max_entries;
        let trimmed = tokio::task::spawn_blocking(move || append_and_trim(&db, &id, &message, max)).await??;
        if trimmed > 0 {
            debug!(trimmed, "conversation log trimmed");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    async fn recent(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        let db = self.db.clone();
        let id = conversation_id.clone();
        let window = self.limits.recent_window;
        tokio::task::spawn_blocking(move || newest_first_reversed(&db, &id, window)).await?
    }

    async fn count(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        let db = self.db.clone();
        let id = conversation_id.clone();
        tokio::task::spawn_blocking(move || {
            db.with_conn(|conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
        })
        .await?
    }

    fn limits(&self) -> HistoryLimits {
        self.limits
    }
}

/// Returns the number of rows dropped by the trim.
fn append_and_trim(
    db: &Database,
    conversation_id: &ConversationId,
    message: &Message,
    max_entries: usize,
) -> Result<usize, StoreError> {
    let payload = serde_json::to_string(message)?;
    db.with_transaction(|tx| {
        tx.execute(
            "INSERT INTO conversation_messages
                 (conversation_id, message_id, sender, target_user, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id.as_str(),
                message.id.as_str(),
                message.sender,
                message.target_user,
                payload,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let trimmed = tx.execute(
            "DELETE FROM conversation_messages
             WHERE conversation_id = ?1
               AND seq NOT IN (
                   SELECT seq FROM conversation_messages
                   WHERE conversation_id = ?1
                   ORDER BY seq DESC
                   LIMIT ?2
               )",
            params![conversation_id.as_str(), max_entries as i64],
        )?;
        Ok(trimmed)
    })
}

/// Select the newest `limit` rows, then return them in append order.
fn newest_first_reversed(
    db: &Database,
    conversation_id: &ConversationId,
    limit: usize,
) -> Result<Vec<Message>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT payload FROM (
                 SELECT seq, payload FROM conversation_messages
                 WHERE conversation_id = ?1
                 ORDER BY seq DESC
                 LIMIT ?2
             ) ORDER BY seq ASC",
        )?;
        let payloads = stmt
            .query_map(params![conversation_id.as_str(), limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
                    table: "conversation_messages",
                    column: "payload",
                    detail: format!("invalid message JSON: {e}"),
                })
            })
            .collect()
    })
}
