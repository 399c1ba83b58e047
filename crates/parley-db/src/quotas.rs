use parley_core::{QuotaState, Source, UserId};
use rusqlite::{OptionalExtension, params};

use crate::columns::{json_column, now_ms};
use crate::store::Database;
use crate::error::{Error, Result};

/// Per-user, per-source quota documents.
pub struct Quotas<'db> {
    pub(crate) db: &'db mut Database,
}

impl Quotas<'_> {
    pub fn get(&self, user_id: UserId, source: Source) -> Result<Option<QuotaState>> {
        self.db
            .conn
            .query_row(
                "SELECT quota_json FROM user_quotas WHERE user_id = ?1 AND source = ?2",
                params![user_id, source.as_str()],
                |row| json_column(row, 0),
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn put(&mut self, user_id: UserId, source: Source, quota: &QuotaState) -> Result<()> {
        let now = now_ms();
        self.db.conn.execute(
            "INSERT INTO user_quotas (user_id, source, quota_json, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, source) DO UPDATE SET
                quota_json = excluded.quota_json,
                updated_at_ms = excluded.updated_at_ms",
            params![user_id, source.as_str(), serde_json::to_string(quota)?, now, now],
        )?;
        Ok(())
    }

    /// Count one ask against the stored quota. Returns `false` when the user
    /// has no quota on record.
    pub fn decrement(&mut self, user_id: UserId, source: Source, model: &str) -> Result<bool> {
        let tx = self.db.conn.transaction()?;
        let quota: Option<QuotaState> = tx
            .query_row(
                "SELECT quota_json FROM user_quotas WHERE user_id = ?1 AND source = ?2",
                params![user_id, source.as_str()],
                |row| json_column(row, 0),
            )
            .optional()?;
        let Some(mut quota) = quota else {
            return Ok(false);
        };

        quota.consume(model);
        tx.execute(
            "UPDATE user_quotas SET quota_json = ?3, updated_at_ms = ?4
             WHERE user_id = ?1 AND source = ?2",
            params![user_id, source.as_str(), serde_json::to_string(&quota)?, now_ms()],
        )?;
        tx.commit()?;
        Ok(true)
    }
}
