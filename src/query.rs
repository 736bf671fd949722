//! Read-side views over the store
//!
//! Listings are cached against the store's write generation, so a listing
//! taken after a successful write always reflects it.

use crate::db::{AuditEntry, ConversationDetail, ConversationFilter, ConversationId, ScanSnapshot};
use crate::error::ApprovalError;
use crate::store::{ChangeEvent, ConversationStore, StatusPartitions, StoreBackend};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

struct CachedPartitions {
    generation: u64,
    partitions: Arc<StatusPartitions>,
}

pub struct QueryService<B> {
    store: Arc<ConversationStore<B>>,
    cache: RwLock<Option<CachedPartitions>>,
}

impl<B: StoreBackend> QueryService<B> {
    pub fn new(store: Arc<ConversationStore<B>>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    fn cached(&self, generation: u64) -> Option<Arc<StatusPartitions>> {
        let guard = self.cache.read().ok()?;
        let hit = guard
            .as_ref()
            .filter(|c| c.generation == generation)
            .map(|c| Arc::clone(&c.partitions));
        hit
    }

    fn remember(&self, generation: u64, partitions: &Arc<StatusPartitions>) {
        let Ok(mut guard) = self.cache.write() else {
            return;
        };
        // Never replace a listing taken at a later generation
        if guard.as_ref().is_some_and(|c| c.generation > generation) {
            return;
        }
        *guard = Some(CachedPartitions {
            generation,
            partitions: Arc::clone(partitions),
        });
    }

    /// All conversations grouped by status.
    ///
    /// Unapproved is oldest activity first; approved and rejected are most
    /// recent first.
    pub async fn list_partitioned(&self) -> Result<Arc<StatusPartitions>, ApprovalError> {
        // Read the generation before loading: a write landing mid-load bumps
        // it past what we store, so the next call reloads
        let generation = self.store.generation();
        if let Some(hit) = self.cached(generation) {
            tracing::debug!(generation, "Partition cache hit");
            return Ok(hit);
        }

        let partitions = Arc::new(self.store.list_by_status().await?);
        self.remember(generation, &partitions);
        Ok(partitions)
    }

    /// Full detail, never served from cache
    pub async fn get_detail(&self, id: ConversationId) -> Result<ConversationDetail, ApprovalError> {
        self.store.get(id).await
    }

    pub async fn audit_trail(&self, id: ConversationId) -> Result<Vec<AuditEntry>, ApprovalError> {
        self.store.audit_trail(id).await
    }

    /// Keyset page of ids in `(after, snapshot.up_to]` matching `filter` as of
    /// the snapshot
    pub async fn page_ids(
        &self,
        filter: ConversationFilter,
        after: Option<ConversationId>,
        snapshot: ScanSnapshot,
        limit: usize,
    ) -> Result<Vec<ConversationId>, ApprovalError> {
        self.store.page_ids(filter, after, snapshot, limit).await
    }

    /// Bounds for a scan that should only see what exists now
    pub async fn high_water_mark(&self) -> Result<Option<ScanSnapshot>, ApprovalError> {
        self.store.high_water_mark().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.subscribe()
    }
}
