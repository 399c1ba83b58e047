use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use parley_core::{
    ConversationHistory, ConversationRecord, HistoryStore, QuotaState, QuotaStore, RecordStore,
    Source, Stores, UserId,
};
use uuid::Uuid;

use crate::conversations::Conversations;
use crate::error::Result;
use crate::histories::Histories;
use crate::migration;
use crate::quotas::Quotas;

/// How long a writer waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The migrated connection the table accessors borrow.
pub(crate) struct Database {
    pub(crate) conn: Connection,
}

pub struct Store {
    db: Database,
}

impl Store {
    /// Open (creating parent directories) and migrate a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::from_connection(Connection::open(path)?)?;
        tracing::debug!(path = %path.display(), "store ready");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        migration::apply(&mut conn)?;
        Ok(Self {
            db: Database { conn },
        })
    }

    pub fn conversations(&mut self) -> Conversations<'_> {
        Conversations { db: &mut self.db }
    }

    pub fn histories(&mut self) -> Histories<'_> {
        Histories { db: &mut self.db }
    }

    pub fn quotas(&mut self) -> Quotas<'_> {
        Quotas { db: &mut self.db }
    }
}

/// A [`Store`] behind a lock, serving the core persistence traits.
///
/// Every call holds the lock for one short synchronous statement or
/// transaction and never across an await.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Store>>,
}

impl SharedStore {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Store> {
        self.inner.lock()
    }

    /// The same store behind all three persistence interfaces.
    pub fn stores(&self) -> Stores {
        Stores {
            histories: Arc::new(self.clone()),
            records: Arc::new(self.clone()),
            quotas: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl HistoryStore for SharedStore {
    async fn get_history(&self, id: Uuid) -> parley_core::Result<Option<ConversationHistory>> {
        Ok(self.lock().histories().get(id)?)
    }

    async fn save_history(&self, history: &ConversationHistory) -> parley_core::Result<()> {
        Ok(self.lock().histories().save(history)?)
    }

    async fn delete_history(&self, id: Uuid) -> parley_core::Result<()> {
        self.lock().histories().delete(id)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SharedStore {
    async fn get_record(
        &self,
        conversation_id: Uuid,
    ) -> parley_core::Result<Option<ConversationRecord>> {
        Ok(self.lock().conversations().get(conversation_id)?)
    }

    async fn upsert_record(&self, record: &ConversationRecord) -> parley_core::Result<()> {
        self.lock().conversations().upsert(record)?;
        Ok(())
    }

    async fn list_records(
        &self,
        user: UserId,
        include_invalid: bool,
    ) -> parley_core::Result<Vec<ConversationRecord>> {
        Ok(self
            .lock()
            .conversations()
            .list_for_user(user, include_invalid)?)
    }

    async fn count_valid(&self, user: UserId, source: Source) -> parley_core::Result<u64> {
        Ok(self.lock().conversations().count_valid(user, source)?)
    }

    async fn delete_record(&self, conversation_id: Uuid) -> parley_core::Result<()> {
        self.lock().conversations().delete(conversation_id)?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for SharedStore {
    async fn get_user_quota(
        &self,
        user: UserId,
        source: Source,
    ) -> parley_core::Result<Option<QuotaState>> {
        Ok(self.lock().quotas().get(user, source)?)
    }

    async fn put_user_quota(
        &self,
        user: UserId,
        source: Source,
        quota: &QuotaState,
    ) -> parley_core::Result<()> {
        Ok(self.lock().quotas().put(user, source, quota)?)
    }

    async fn decrement_quota(
        &self,
        user: UserId,
        source: Source,
        model: &str,
    ) -> parley_core::Result<()> {
        if !self.lock().quotas().decrement(user, source, model)? {
            tracing::debug!(user, %source, "no stored quota to decrement");
        }
        Ok(())
    }
}
