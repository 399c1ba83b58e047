//! Persistence interfaces. The core only calls these; engines live in other
//! crates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UserId;
use crate::error::Result;
use crate::models::Source;
use crate::quota::QuotaState;
use crate::tree::ConversationHistory;

/// The relational index row over a [`ConversationHistory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Row id, assigned by the store.
    pub id: Option<i64>,
    pub source: Source,
    pub conversation_id: Uuid,
    pub title: String,
    pub user_id: UserId,
    pub is_valid: bool,
    pub current_model: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(
        source: Source,
        conversation_id: Uuid,
        title: impl Into<String>,
        user_id: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            source,
            conversation_id,
            title: title.into(),
            user_id,
            is_valid: true,
            current_model: None,
            create_time: now,
            update_time: now,
        }
    }
}

/// Document store for conversation trees.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn get_history(&self, id: Uuid) -> Result<Option<ConversationHistory>>;
    async fn save_history(&self, history: &ConversationHistory) -> Result<()>;
    async fn delete_history(&self, id: Uuid) -> Result<()>;
}

/// Relational store for [`ConversationRecord`] rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, conversation_id: Uuid) -> Result<Option<ConversationRecord>>;
    /// Insert, or update the row with the same `conversation_id`.
    async fn upsert_record(&self, record: &ConversationRecord) -> Result<()>;
    async fn list_records(&self, user: UserId, include_invalid: bool)
    -> Result<Vec<ConversationRecord>>;
    async fn count_valid(&self, user: UserId, source: Source) -> Result<u64>;
    async fn delete_record(&self, conversation_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_user_quota(&self, user: UserId, source: Source) -> Result<Option<QuotaState>>;
    async fn put_user_quota(&self, user: UserId, source: Source, quota: &QuotaState)
    -> Result<()>;
    /// Count one ask against the total and the per-model allowance. Unlimited
    /// counts stay unlimited.
    async fn decrement_quota(&self, user: UserId, source: Source, model: &str) -> Result<()>;
}
