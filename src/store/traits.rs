//! Trait abstraction for the durable store
//!
//! The store's locking, timeouts and change feed sit on top of this trait so
//! they can be exercised against an in-memory backend in tests.

use crate::db::{
    Attribution, AuditEntry, Conversation, ConversationDetail, ConversationFilter, ConversationId,
    ConversationWrite, FarmerId, NewMessage, ScanSnapshot,
};
use crate::state_machine::ApprovalStatus;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    /// The status observed before the write no longer matches
    #[error("conversation {id} is now {actual}")]
    Stale {
        id: ConversationId,
        actual: ApprovalStatus,
    },
    #[error("{0}")]
    Unavailable(String),
}

/// Durable conversation storage
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Insert a conversation with its first message
    async fn create_conversation(
        &self,
        farmer_id: FarmerId,
        status: ApprovalStatus,
        first: &NewMessage,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError>;

    /// Load a conversation with its full history
    async fn load(&self, id: ConversationId) -> Result<ConversationDetail, BackendError>;

    /// Apply `write` atomically if the status is still `expected`
    async fn commit(
        &self,
        id: ConversationId,
        expected: ApprovalStatus,
        write: &ConversationWrite,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError>;

    /// All conversation summaries
    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError>;

    /// Ascending ids in `(after, snapshot.up_to]` matching `filter` as of
    /// the snapshot, at most `limit`
    async fn page_ids(
        &self,
        filter: ConversationFilter,
        after: Option<ConversationId>,
        snapshot: ScanSnapshot,
        limit: usize,
    ) -> Result<Vec<ConversationId>, BackendError>;

    /// Current scan bounds, `None` if no conversation exists
    async fn high_water_mark(&self) -> Result<Option<ScanSnapshot>, BackendError>;

    /// An unapproved conversation for the farmer, most recently touched first
    async fn find_open_conversation(
        &self,
        farmer_id: FarmerId,
    ) -> Result<Option<ConversationId>, BackendError>;

    async fn audit_trail(&self, id: ConversationId) -> Result<Vec<AuditEntry>, BackendError>;
}

// ============================================================================
// Arc implementation for shared backends
// ============================================================================

#[async_trait]
impl<T: StoreBackend + ?Sized> StoreBackend for Arc<T> {
    async fn create_conversation(
        &self,
        farmer_id: FarmerId,
        status: ApprovalStatus,
        first: &NewMessage,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError> {
        (**self)
            .create_conversation(farmer_id, status, first, attribution)
            .await
    }

    async fn load(&self, id: ConversationId) -> Result<ConversationDetail, BackendError> {
        (**self).load(id).await
    }

    async fn commit(
        &self,
        id: ConversationId,
        expected: ApprovalStatus,
        write: &ConversationWrite,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError> {
        (**self).commit(id, expected, write, attribution).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError> {
        (**self).list_conversations().await
    }

    async fn page_ids(
        &self,
        filter: ConversationFilter,
        after: Option<ConversationId>,
        snapshot: ScanSnapshot,
        limit: usize,
    ) -> Result<Vec<ConversationId>, BackendError> {
        (**self).page_ids(filter, after, snapshot, limit).await
    }

    async fn high_water_mark(&self) -> Result<Option<ScanSnapshot>, BackendError> {
        (**self).high_water_mark().await
    }

    async fn find_open_conversation(
        &self,
        farmer_id: FarmerId,
    ) -> Result<Option<ConversationId>, BackendError> {
        (**self).find_open_conversation(farmer_id).await
    }

    async fn audit_trail(&self, id: ConversationId) -> Result<Vec<AuditEntry>, BackendError> {
        (**self).audit_trail(id).await
    }
}
