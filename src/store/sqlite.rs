//! SQLite-backed store adapter

use super::traits::{BackendError, StoreBackend};
use crate::db::{
    Attribution, AuditEntry, Conversation, ConversationDetail, ConversationFilter, ConversationId,
    ConversationWrite, Database, DbError, DbResult, FarmerId, NewMessage,
    ScanSnapshot,
};
use crate::state_machine::ApprovalStatus;
use async_trait::async_trait;

impl From<DbError> for BackendError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ConversationNotFound(id) => BackendError::NotFound(id),
            DbError::StatusMismatch { id, actual, .. } => BackendError::Stale { id, actual },
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

/// Adapter to use Database as a store backend
///
/// rusqlite is blocking, so every call runs on tokio's blocking pool and the
/// caller's timeout can fire while SQLite is busy.
#[derive(Clone)]
pub struct DatabaseBackend {
    db: Database,
}

impl DatabaseBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| BackendError::Unavailable(format!("store task failed: {e}")))?
            .map_err(BackendError::from)
    }
}

#[async_trait]
impl StoreBackend for DatabaseBackend {
    async fn create_conversation(
        &self,
        farmer_id: FarmerId,
        status: ApprovalStatus,
        first: &NewMessage,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError> {
        let first = first.clone();
        let attribution = attribution.clone();
        self.run(move |db| db.create_conversation(farmer_id, status, &first, &attribution))
            .await
    }

    async fn load(&self, id: ConversationId) -> Result<ConversationDetail, BackendError> {
        self.run(move |db| db.get_detail(id)).await
    }

    async fn commit(
        &self,
        id: ConversationId,
        expected: ApprovalStatus,
        write: &ConversationWrite,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError> {
        let write = write.clone();
        let attribution = attribution.clone();
        self.run(move |db| db.commit_write(id, expected, &write, &attribution))
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError> {
        self.run(Database::list_conversations).await
    }

    async fn page_ids(
        &self,
        filter: ConversationFilter,
        after: Option<ConversationId>,
        snapshot: ScanSnapshot,
        limit: usize,
    ) -> Result<Vec<ConversationId>, BackendError> {
        self.run(move |db| db.page_ids(filter, after, snapshot, limit))
            .await
    }

    async fn high_water_mark(&self) -> Result<Option<ScanSnapshot>, BackendError> {
        self.run(Database::scan_snapshot).await
    }

    async fn find_open_conversation(
        &self,
        farmer_id: FarmerId,
    ) -> Result<Option<ConversationId>, BackendError> {
        self.run(move |db| db.find_open_conversation(farmer_id))
            .await
    }

    async fn audit_trail(&self, id: ConversationId) -> Result<Vec<AuditEntry>, BackendError> {
        self.run(move |db| db.audit_trail(id)).await
    }
}
