use parley_core::ConversationHistory;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use crate::columns::{json_column, to_ms};
use crate::store::Database;
use crate::error::{Error, Result};

/// Conversation trees, stored whole as JSON documents.
pub struct Histories<'db> {
    pub(crate) db: &'db mut Database,
}

impl Histories<'_> {
    pub fn get(&self, conversation_id: Uuid) -> Result<Option<ConversationHistory>> {
        let history: Option<ConversationHistory> = self
            .db
            .conn
            .query_row(
                "SELECT history_json FROM conversation_histories WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| json_column(row, 0),
            )
            .optional()?;

        match history {
            Some(history) if history.id != conversation_id => Err(Error::Corrupt {
                table: "conversation_histories",
                detail: format!("document for {conversation_id} holds {}", history.id),
            }),
            other => Ok(other),
        }
    }

    pub fn save(&mut self, history: &ConversationHistory) -> Result<()> {
        let json = serde_json::to_string(history)?;
        self.db.conn.execute(
            "INSERT INTO conversation_histories (conversation_id, source, history_json, update_time_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id) DO UPDATE SET
                source = excluded.source,
                history_json = excluded.history_json,
                update_time_ms = excluded.update_time_ms",
            params![
                history.id.to_string(),
                history.source.as_str(),
                json,
                to_ms(history.update_time),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a document was removed.
    pub fn delete(&mut self, conversation_id: Uuid) -> Result<bool> {
        let changed = self.db.conn.execute(
            "DELETE FROM conversation_histories WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
        )?;
        Ok(changed > 0)
    }
}
