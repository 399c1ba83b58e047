use parley_core::{ConversationRecord, Source, UserId};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use crate::columns::{source_column, time_column, to_ms, uuid_column};
use crate::store::Database;
use crate::error::{Error, Result};

const COLUMNS: &str = "id, source, conversation_id, title, user_id, is_valid, current_model,
                       create_time_ms, update_time_ms";

/// Conversation index rows.
pub struct Conversations<'db> {
    pub(crate) db: &'db mut Database,
}

impl Conversations<'_> {
    pub fn get(&self, conversation_id: Uuid) -> Result<Option<ConversationRecord>> {
        self.db
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM conversations WHERE conversation_id = ?1"),
                params![conversation_id.to_string()],
                row_to_record,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Insert or update by `conversation_id`. The owner and creation time of
    /// an existing row never change. Returns the stored row.
    pub fn upsert(&mut self, record: &ConversationRecord) -> Result<ConversationRecord> {
        let tx = self.db.conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (
                source, conversation_id, title, user_id, is_valid, current_model,
                create_time_ms, update_time_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(conversation_id) DO UPDATE SET
                title = excluded.title,
                is_valid = excluded.is_valid,
                current_model = excluded.current_model,
                update_time_ms = excluded.update_time_ms",
            params![
                record.source.as_str(),
                record.conversation_id.to_string(),
                record.title,
                record.user_id,
                record.is_valid,
                record.current_model,
                to_ms(record.create_time),
                to_ms(record.update_time),
            ],
        )?;
        let stored = tx.query_row(
            &format!("SELECT {COLUMNS} FROM conversations WHERE conversation_id = ?1"),
            params![record.conversation_id.to_string()],
            row_to_record,
        )?;
        tx.commit()?;
        Ok(stored)
    }

    /// A user's conversations, most recently updated first.
    pub fn list_for_user(
        &self,
        user_id: UserId,
        include_invalid: bool,
    ) -> Result<Vec<ConversationRecord>> {
        let mut stmt = self.db.conn.prepare(&format!(
            "SELECT {COLUMNS}
             FROM conversations
             WHERE user_id = ?1
               AND (?2 OR is_valid)
             ORDER BY update_time_ms DESC"
        ))?;
        let rows = stmt.query_map(params![user_id, include_invalid], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    pub fn count_valid(&self, user_id: UserId, source: Source) -> Result<u64> {
        let count: i64 = self.db.conn.query_row(
            "SELECT count(*) FROM conversations
             WHERE user_id = ?1 AND source = ?2 AND is_valid",
            params![user_id, source.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Returns whether a row was removed.
    pub fn delete(&mut self, conversation_id: Uuid) -> Result<bool> {
        let changed = self.db.conn.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        source: source_column(row, 1)?,
        conversation_id: uuid_column(row, 2)?,
        title: row.get(3)?,
        user_id: row.get(4)?,
        is_valid: row.get(5)?,
        current_model: row.get(6)?,
        create_time: time_column(row, 7)?,
        update_time: time_column(row, 8)?,
    })
}
