//! Listing, reading, titling and deleting a user's conversations.

use std::sync::Arc;

use chrono::Utc;
use parley_llm::RemoteConversations;
use uuid::Uuid;

use crate::UserId;
use crate::error::{Error, Result};
use crate::models::{ModelCatalog, Source};
use crate::store::{ConversationRecord, HistoryStore, RecordStore};
use crate::tree::ConversationHistory;

pub struct ConversationService {
    histories: Arc<dyn HistoryStore>,
    records: Arc<dyn RecordStore>,
    remote: Option<Arc<dyn RemoteConversations>>,
    catalog: ModelCatalog,
}

impl ConversationService {
    pub fn new(
        histories: Arc<dyn HistoryStore>,
        records: Arc<dyn RecordStore>,
        remote: Option<Arc<dyn RemoteConversations>>,
        catalog: ModelCatalog,
    ) -> Self {
        Self {
            histories,
            records,
            remote,
            catalog,
        }
    }

    pub async fn list(&self, user: UserId) -> Result<Vec<ConversationRecord>> {
        self.records.list_records(user, false).await
    }

    /// Read a history. Browser-session histories are refreshed from the
    /// upstream and merged with the local copy; if the upstream is
    /// unreachable the local copy is served.
    pub async fn get(&self, user: UserId, id: Uuid) -> Result<ConversationHistory> {
        let mut record = self.owned(user, id).await?;
        if !record.is_valid {
            return Err(Error::NotFound(format!("conversation {id}")));
        }
        let local = self.histories.get_history(id).await?;

        let history = match (record.source, &self.remote) {
            (Source::BrowserSession, Some(remote)) => {
                match remote.fetch_conversation(&id.to_string()).await {
                    Ok(raw) => {
                        let upstream = ConversationHistory::from_upstream(id, &raw, &self.catalog)?;
                        let merged = ConversationHistory::reconcile(upstream, local);
                        self.histories.save_history(&merged).await?;
                        merged
                    }
                    Err(e) => match local {
                        Some(local) => {
                            tracing::warn!(conversation = %id, error = %e, "serving cached history");
                            local
                        }
                        None => return Err(e.into()),
                    },
                }
            }
            _ => local.ok_or_else(|| Error::NotFound(format!("history of {id}")))?,
        };

        if record.current_model.is_none() && history.current_model.is_some() {
            record.current_model = history.current_model.clone();
            self.records.upsert_record(&record).await?;
        }
        Ok(history)
    }

    pub async fn rename(&self, user: UserId, id: Uuid, title: &str) -> Result<ConversationRecord> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::InvalidRequest("title is blank".into()));
        }
        let mut record = self.owned(user, id).await?;

        if record.source == Source::BrowserSession
            && let Some(remote) = &self.remote
            && let Err(e) = remote.set_conversation_title(&id.to_string(), title).await
        {
            tracing::warn!(conversation = %id, error = %e, "could not rename upstream");
        }

        record.title = title.to_string();
        record.update_time = Utc::now();
        self.records.upsert_record(&record).await?;

        if let Some(mut history) = self.histories.get_history(id).await? {
            history.title = title.to_string();
            self.histories.save_history(&history).await?;
        }
        Ok(record)
    }

    /// Let the upstream title a browser-session conversation from
    /// `message_id`, then store the title locally.
    pub async fn generate_title(
        &self,
        user: UserId,
        id: Uuid,
        message_id: Uuid,
    ) -> Result<ConversationRecord> {
        let mut record = self.owned(user, id).await?;
        if !record.is_valid {
            return Err(Error::NotFound(format!("conversation {id}")));
        }
        let remote = match (record.source, &self.remote) {
            (Source::BrowserSession, Some(remote)) => remote,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "conversation {id} cannot be titled upstream"
                )));
            }
        };

        let title = remote
            .generate_title(&id.to_string(), &message_id.to_string())
            .await?;
        tracing::debug!(conversation = %id, %title, "title generated");

        record.title = title.clone();
        record.update_time = Utc::now();
        self.records.upsert_record(&record).await?;

        if let Some(mut history) = self.histories.get_history(id).await? {
            history.title = title;
            self.histories.save_history(&history).await?;
        }
        Ok(record)
    }

    /// Soft delete: the record is marked invalid and the upstream copy hidden.
    pub async fn delete(&self, user: UserId, id: Uuid) -> Result<()> {
        let mut record = self.owned(user, id).await?;
        if record.source == Source::BrowserSession {
            self.hide_upstream(id).await;
        }
        record.is_valid = false;
        self.records.upsert_record(&record).await
    }

    /// Soft delete every valid conversation of `user`. Returns how many
    /// were deleted.
    pub async fn delete_all(&self, user: UserId) -> Result<usize> {
        let records = self.records.list_records(user, false).await?;
        let deleted = records.len();
        for mut record in records {
            if record.source == Source::BrowserSession {
                self.hide_upstream(record.conversation_id).await;
            }
            record.is_valid = false;
            self.records.upsert_record(&record).await?;
        }
        tracing::info!(user, deleted, "cleared conversations");
        Ok(deleted)
    }

    /// Hard delete of the record and the local history.
    pub async fn vanish(&self, user: UserId, id: Uuid) -> Result<()> {
        let record = self.owned(user, id).await?;
        if record.source == Source::BrowserSession && record.is_valid {
            self.hide_upstream(id).await;
        }
        self.records.delete_record(id).await?;
        self.histories.delete_history(id).await
    }

    async fn owned(&self, user: UserId, id: Uuid) -> Result<ConversationRecord> {
        let record = self
            .records
            .get_record(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
        if record.user_id != user {
            return Err(Error::Forbidden(format!("conversation {id}")));
        }
        Ok(record)
    }

    async fn hide_upstream(&self, id: Uuid) {
        let Some(remote) = &self.remote else {
            return;
        };
        match remote.delete_conversation(&id.to_string()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(conversation = %id, "already gone upstream");
            }
            Err(e) => tracing::warn!(conversation = %id, error = %e, "could not hide upstream"),
        }
    }
}
