//! Conversation store
//!
//! Wraps a durable backend with per-conversation write serialization, call
//! timeouts, a write generation counter for cache invalidation, and the
//! change feed consumed by delivery.

mod locks;
mod sqlite;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use locks::{KeyedLocks, LockPolicy};
pub use sqlite::DatabaseBackend;
pub use traits::{BackendError, StoreBackend};

use crate::db::{
    Attribution, AuditEntry, Conversation, ConversationDetail, ConversationFilter, ConversationId,
    ConversationWrite, FarmerId, NewMessage, ScanSnapshot,
};
use crate::error::ApprovalError;
use crate::state_machine::{transition, ActionKind, ApprovalStatus, Verb};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Store tuning
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub lock_policy: LockPolicy,
    /// How long a writer queues behind another write on the same conversation
    pub lock_wait: Duration,
    /// Upper bound on any single backend call
    pub store_timeout: Duration,
    pub change_feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_policy: LockPolicy::Wait,
            lock_wait: Duration::from_secs(2),
            store_timeout: Duration::from_secs(5),
            change_feed_capacity: 256,
        }
    }
}

/// What an update decided to do after seeing the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Already in the requested state
    Noop,
    Write(ConversationWrite),
}

/// Result of an update
#[derive(Debug, Clone)]
pub struct Committed {
    pub detail: ConversationDetail,
    /// False when the update was a no-op
    pub changed: bool,
}

/// A requested status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWrite {
    pub target: ApprovalStatus,
    /// Permit leaving a decided status
    pub reopen: bool,
}

impl StatusWrite {
    pub fn to(target: ApprovalStatus) -> Self {
        Self {
            target,
            reopen: false,
        }
    }

    pub fn reopen() -> Self {
        Self {
            target: ApprovalStatus::Unapproved,
            reopen: true,
        }
    }

    fn verb(self) -> Result<Verb, ApprovalError> {
        match (self.target, self.reopen) {
            (ApprovalStatus::Approved, _) => Ok(Verb::Approve),
            (ApprovalStatus::Rejected, _) => Ok(Verb::Reject),
            (ApprovalStatus::Unapproved, true) => Ok(Verb::Reopen),
            (ApprovalStatus::Unapproved, false) => Err(ApprovalError::InvalidTransition(
                "moving back to unapproved requires an explicit reopen".into(),
            )),
        }
    }
}

/// Published after every committed mutation
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub conversation_id: ConversationId,
    pub farmer_id: FarmerId,
    pub action: ActionKind,
    pub actor: String,
    pub from: Option<ApprovalStatus>,
    pub to: ApprovalStatus,
    pub message_appended: bool,
    pub at: DateTime<Utc>,
}

/// Conversation summaries grouped by status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusPartitions {
    /// Oldest activity first so nothing waits forever
    pub unapproved: Vec<Conversation>,
    /// Most recent decision first
    pub approved: Vec<Conversation>,
    /// Most recent decision first
    pub rejected: Vec<Conversation>,
}

impl StatusPartitions {
    pub fn from_summaries(summaries: Vec<Conversation>) -> Self {
        let mut partitions = Self::default();
        for conversation in summaries {
            match conversation.status {
                ApprovalStatus::Unapproved => partitions.unapproved.push(conversation),
                ApprovalStatus::Approved => partitions.approved.push(conversation),
                ApprovalStatus::Rejected => partitions.rejected.push(conversation),
            }
        }
        partitions
            .unapproved
            .sort_by(|a, b| (a.updated_at, a.id).cmp(&(b.updated_at, b.id)));
        for decided in [&mut partitions.approved, &mut partitions.rejected] {
            decided.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)));
        }
        partitions
    }

    pub fn get(&self, status: ApprovalStatus) -> &[Conversation] {
        match status {
            ApprovalStatus::Unapproved => &self.unapproved,
            ApprovalStatus::Approved => &self.approved,
            ApprovalStatus::Rejected => &self.rejected,
        }
    }

    #[cfg(test)]
    pub fn status_of(&self, id: ConversationId) -> Option<ApprovalStatus> {
        ApprovalStatus::ALL
            .into_iter()
            .find(|status| self.get(*status).iter().any(|c| c.id == id))
    }
}

fn map_backend_error(err: BackendError) -> ApprovalError {
    match err {
        BackendError::NotFound(id) => ApprovalError::conversation_not_found(id),
        BackendError::Stale { id, actual } => ApprovalError::Conflict(format!(
            "conversation {id} changed concurrently and is now {actual}"
        )),
        BackendError::Unavailable(message) => ApprovalError::StoreUnavailable(message),
    }
}

pub struct ConversationStore<B> {
    backend: B,
    locks: KeyedLocks,
    generation: AtomicU64,
    changes: broadcast::Sender<ChangeEvent>,
    config: StoreConfig,
}

impl<B: StoreBackend> ConversationStore<B> {
    pub fn new(backend: B, config: StoreConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_feed_capacity.max(1));
        Self {
            backend,
            locks: KeyedLocks::new(),
            generation: AtomicU64::new(0),
            changes,
            config,
        }
    }

    /// Bumped after every write attempt; readers cache against it
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Subscribe to committed mutations
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, ApprovalError> {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result.map_err(map_backend_error),
            Err(_) => Err(ApprovalError::StoreUnavailable(format!(
                "store call timed out after {:?}",
                self.config.store_timeout
            ))),
        }
    }

    fn publish(
        &self,
        detail: &ConversationDetail,
        attribution: &Attribution,
        from: Option<ApprovalStatus>,
        appended: bool,
    ) {
        let event = ChangeEvent {
            conversation_id: detail.id(),
            farmer_id: detail.conversation.farmer_id,
            action: attribution.action,
            actor: attribution.actor.clone(),
            from,
            to: detail.status(),
            message_appended: appended,
            at: detail.conversation.updated_at,
        };
        // No subscribers is fine
        let _ = self.changes.send(event);
    }

    // ==================== Reads ====================

    pub async fn get(&self, id: ConversationId) -> Result<ConversationDetail, ApprovalError> {
        self.timed(self.backend.load(id)).await
    }

    pub async fn list_by_status(&self) -> Result<StatusPartitions, ApprovalError> {
        let summaries = self.timed(self.backend.list_conversations()).await?;
        Ok(StatusPartitions::from_summaries(summaries))
    }

    pub async fn page_ids(
        &self,
        filter: ConversationFilter,
        after: Option<ConversationId>,
        snapshot: ScanSnapshot,
        limit: usize,
    ) -> Result<Vec<ConversationId>, ApprovalError> {
        self.timed(self.backend.page_ids(filter, after, snapshot, limit))
            .await
    }

    pub async fn high_water_mark(&self) -> Result<Option<ScanSnapshot>, ApprovalError> {
        self.timed(self.backend.high_water_mark()).await
    }

    pub async fn find_open_conversation(
        &self,
        farmer_id: FarmerId,
    ) -> Result<Option<ConversationId>, ApprovalError> {
        self.timed(self.backend.find_open_conversation(farmer_id))
            .await
    }

    pub async fn audit_trail(&self, id: ConversationId) -> Result<Vec<AuditEntry>, ApprovalError> {
        self.timed(self.backend.audit_trail(id)).await
    }

    // ==================== Writes ====================

    /// Create a conversation with its first message
    pub async fn create_conversation(
        &self,
        farmer_id: FarmerId,
        status: ApprovalStatus,
        first: NewMessage,
        attribution: Attribution,
    ) -> Result<ConversationDetail, ApprovalError> {
        let result = self
            .timed(
                self.backend
                    .create_conversation(farmer_id, status, &first, &attribution),
            )
            .await;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let detail = result?;
        tracing::info!(
            conversation_id = detail.id(),
            farmer_id,
            status = %status,
            action = %attribution.action,
            actor = %attribution.actor,
            "Conversation created"
        );
        self.publish(&detail, &attribution, None, true);
        Ok(detail)
    }

    /// Serialized read-plan-commit on one conversation.
    ///
    /// Holds the conversation's write lock while loading, planning and
    /// committing, so no other write on the same id can interleave. The plan
    /// sees the state it will be applied to.
    pub async fn update<F>(
        &self,
        id: ConversationId,
        attribution: Attribution,
        plan: F,
    ) -> Result<Committed, ApprovalError>
    where
        F: FnOnce(&ConversationDetail) -> Result<Plan, ApprovalError> + Send,
    {
        let _guard = self
            .locks
            .acquire(id, self.config.lock_policy, self.config.lock_wait)
            .await
            .map_err(|e| ApprovalError::Conflict(e.to_string()))?;

        let current = self.timed(self.backend.load(id)).await?;
        let write = match plan(&current)? {
            Plan::Write(write) if !write.is_empty() => write,
            _ => {
                tracing::debug!(
                    conversation_id = id,
                    action = %attribution.action,
                    actor = %attribution.actor,
                    "No-op update"
                );
                return Ok(Committed {
                    detail: current,
                    changed: false,
                });
            }
        };

        let from = current.status();
        let result = self
            .timed(self.backend.commit(id, from, &write, &attribution))
            .await;
        // A timed-out commit may still land, so invalidate either way
        self.generation.fetch_add(1, Ordering::SeqCst);

        let detail = match result {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(
                    conversation_id = id,
                    action = %attribution.action,
                    actor = %attribution.actor,
                    error = %e,
                    "Write failed"
                );
                return Err(e);
            }
        };

        tracing::info!(
            conversation_id = id,
            from = %from,
            to = %detail.status(),
            appended = write.append.is_some(),
            action = %attribution.action,
            actor = %attribution.actor,
            "Conversation updated"
        );
        self.publish(&detail, &attribution, Some(from), write.append.is_some());
        Ok(Committed {
            detail,
            changed: true,
        })
    }

    /// Append a message without touching the status
    #[allow(dead_code)] // Used in tests
    pub async fn append_message(
        &self,
        id: ConversationId,
        message: NewMessage,
        attribution: Attribution,
    ) -> Result<ConversationDetail, ApprovalError> {
        self.update(id, attribution, move |_| {
            Ok(Plan::Write(ConversationWrite {
                append: Some(message),
                status: None,
            }))
        })
        .await
        .map(|c| c.detail)
    }

    /// Move a conversation's status, enforcing the transition rules.
    ///
    /// Re-applying the current status succeeds without writing.
    pub async fn set_status(
        &self,
        id: ConversationId,
        status: StatusWrite,
        attribution: Attribution,
    ) -> Result<Committed, ApprovalError> {
        let verb = status.verb()?;
        self.update(id, attribution, move |current| {
            let planned = transition(current.status(), verb)?;
            if !planned.is_change() {
                return Ok(Plan::Noop);
            }
            Ok(Plan::Write(ConversationWrite {
                append: None,
                status: Some(planned.status()),
            }))
        })
        .await
    }
}
