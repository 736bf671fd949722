//! Bulk approval
//!
//! Applies one action across every conversation a filter selects at the time
//! of invocation. Items are independent: each is routed through the engine
//! and reported on its own, and one failing never stops the rest.

use crate::db::{Attribution, ConversationFilter, ConversationId, FarmerId};
use crate::engine::{require_text, ApprovalEngine};
use crate::error::{ApprovalError, ErrorKind};
use crate::query::QueryService;
use crate::state_machine::{ActionKind, ApprovalStatus, Verb};
use crate::store::StoreBackend;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bulk actions never reopen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Approve,
    Reject,
}

impl BulkAction {
    fn verb(self) -> Verb {
        match self {
            Self::Approve => Verb::Approve,
            Self::Reject => Verb::Reject,
        }
    }

    fn audit_action(self) -> ActionKind {
        match self {
            Self::Approve => ActionKind::BulkApprove,
            Self::Reject => ActionKind::BulkReject,
        }
    }
}

impl FromStr for BulkAction {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(ApprovalError::InvalidInput(format!(
                "unknown bulk action: {other}"
            ))),
        }
    }
}

/// Filter as it arrives over the wire, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterSpec {
    pub kind: String,
    #[serde(default)]
    pub farmer_id: Option<FarmerId>,
    #[serde(default)]
    pub status: Option<String>,
}

impl FilterSpec {
    pub fn parse(&self) -> Result<ConversationFilter, ApprovalError> {
        match self.kind.as_str() {
            "all" => Ok(ConversationFilter::All),
            "by_farmer" => match self.farmer_id {
                Some(farmer_id) if farmer_id > 0 => Ok(ConversationFilter::ByFarmer { farmer_id }),
                Some(farmer_id) => Err(ApprovalError::InvalidFilter(format!(
                    "by_farmer needs a positive farmer_id, got {farmer_id}"
                ))),
                None => Err(ApprovalError::InvalidFilter(
                    "by_farmer requires farmer_id".into(),
                )),
            },
            "by_status" => {
                let raw = self.status.as_deref().ok_or_else(|| {
                    ApprovalError::InvalidFilter("by_status requires status".into())
                })?;
                let status = raw
                    .parse::<ApprovalStatus>()
                    .map_err(ApprovalError::InvalidFilter)?;
                Ok(ConversationFilter::ByStatus { status })
            }
            other => Err(ApprovalError::InvalidFilter(format!(
                "unknown filter kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BulkConfig {
    /// Items in flight at once
    pub concurrency: usize,
    /// Ids fetched per page
    pub page_size: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            page_size: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ItemStatus {
    /// `changed` is false when the conversation was already in the target
    Succeeded { changed: bool },
    /// The transition is not allowed from the item's current status
    Skipped { kind: ErrorKind, error: String },
    Failed { kind: ErrorKind, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub outcome: ItemStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    pub operation_id: Uuid,
    pub action: BulkAction,
    pub filter: ConversationFilter,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Set when fetching the next page of ids failed and the scan stopped early
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_error: Option<String>,
    /// One entry per processed conversation, ascending by id
    pub outcomes: Vec<ItemOutcome>,
}

impl BulkResult {
    fn new(action: BulkAction, filter: ConversationFilter) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            action,
            filter,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            cancelled: false,
            scan_error: None,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, item: ItemOutcome) {
        match item.outcome {
            ItemStatus::Succeeded { .. } => self.succeeded += 1,
            ItemStatus::Skipped { .. } => self.skipped += 1,
            ItemStatus::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(item);
    }
}

pub struct BulkApprovalCoordinator<B> {
    engine: Arc<ApprovalEngine<B>>,
    query: Arc<QueryService<B>>,
    config: BulkConfig,
}

impl<B: StoreBackend> BulkApprovalCoordinator<B> {
    pub fn new(
        engine: Arc<ApprovalEngine<B>>,
        query: Arc<QueryService<B>>,
        config: BulkConfig,
    ) -> Self {
        Self {
            engine,
            query,
            config,
        }
    }

    /// Apply `action` to every conversation matching `filter` that existed
    /// when the call started.
    ///
    /// Returns an error only if the target set cannot be resolved at all.
    /// Firing `cancel` stops new items from starting; items already in flight
    /// finish and are reported.
    pub async fn bulk_apply(
        &self,
        action: BulkAction,
        filter: ConversationFilter,
        actor: &str,
        cancel: CancellationToken,
    ) -> Result<BulkResult, ApprovalError> {
        require_text("actor", actor)?;

        let mut result = BulkResult::new(action, filter);
        let operation_id = result.operation_id;
        let attribution = Attribution::new(action.audit_action(), actor)
            .with_reason(format!("bulk operation {operation_id}"));
        let page_size = self.config.page_size.max(1);
        let concurrency = self.config.concurrency.max(1);

        let Some(snapshot) = self.query.high_water_mark().await? else {
            tracing::info!(%operation_id, ?filter, "Bulk operation found nothing to do");
            return Ok(result);
        };
        tracing::info!(
            %operation_id,
            action = ?action,
            ?filter,
            actor,
            high_water = snapshot.up_to,
            audit_mark = snapshot.audit_mark,
            "Bulk operation started"
        );

        let mut after = None;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let page = match self.query.page_ids(filter, after, snapshot, page_size).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(%operation_id, error = %e, "Bulk scan stopped");
                    result.scan_error = Some(e.to_string());
                    break;
                }
            };
            let Some(&last) = page.last() else {
                break;
            };
            after = Some(last);
            let exhausted = page.len() < page_size;

            let outcomes: Vec<ItemOutcome> = stream::iter(page)
                .take_until(cancel.cancelled())
                .map(|id| self.apply_one(id, action, &attribution))
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for outcome in outcomes {
                result.record(outcome);
            }

            if exhausted {
                break;
            }
        }

        result.cancelled = cancel.is_cancelled();
        result.outcomes.sort_by_key(|o| o.conversation_id);
        tracing::info!(
            %operation_id,
            succeeded = result.succeeded,
            skipped = result.skipped,
            failed = result.failed,
            cancelled = result.cancelled,
            "Bulk operation finished"
        );
        Ok(result)
    }

    async fn apply_one(
        &self,
        id: ConversationId,
        action: BulkAction,
        attribution: &Attribution,
    ) -> ItemOutcome {
        let outcome = match self.engine.apply(id, action.verb(), attribution.clone()).await {
            Ok(committed) => ItemStatus::Succeeded {
                changed: committed.changed,
            },
            Err(e @ ApprovalError::InvalidTransition(_)) => ItemStatus::Skipped {
                kind: e.kind(),
                error: e.to_string(),
            },
            Err(e) => {
                tracing::warn!(conversation_id = id, error = %e, "Bulk item failed");
                ItemStatus::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                }
            }
        };
        ItemOutcome {
            conversation_id: id,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryBackend;
    use crate::store::{ConversationStore, StoreConfig};
    use std::time::Duration;

    struct Harness {
        backend: Arc<MemoryBackend>,
        engine: Arc<ApprovalEngine<Arc<MemoryBackend>>>,
        coordinator: BulkApprovalCoordinator<Arc<MemoryBackend>>,
    }

    fn harness(config: BulkConfig) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(ConversationStore::new(
            Arc::clone(&backend),
            StoreConfig::default(),
        ));
        let engine = Arc::new(ApprovalEngine::new(Arc::clone(&store)));
        let query = Arc::new(QueryService::new(store));
        let coordinator = BulkApprovalCoordinator::new(Arc::clone(&engine), query, config);
        Harness {
            backend,
            engine,
            coordinator,
        }
    }

    #[tokio::test]
    async fn approve_by_farmer_skips_rejected() {
        let h = harness(BulkConfig::default());
        let farmer = 11;
        for _ in 0..5 {
            h.backend.seed(farmer, ApprovalStatus::Unapproved, "advice");
        }
        for _ in 0..2 {
            h.backend.seed(farmer, ApprovalStatus::Rejected, "advice");
        }
        let other = h.backend.seed(12, ApprovalStatus::Unapproved, "advice");

        let result = h
            .coordinator
            .bulk_apply(
                BulkAction::Approve,
                ConversationFilter::ByFarmer { farmer_id: farmer },
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.succeeded, 5);
        assert_eq!(result.skipped, 2);
        assert_eq!(result.failed, 0);
        assert_eq!(result.outcomes.len(), 7);
        assert!(!result.cancelled);
        assert!(result
            .outcomes
            .windows(2)
            .all(|w| w[0].conversation_id < w[1].conversation_id));

        let untouched = h.backend.load(other).await.unwrap();
        assert_eq!(untouched.status(), ApprovalStatus::Unapproved);
    }

    #[tokio::test]
    async fn operation_id_is_recorded_in_audit() {
        let h = harness(BulkConfig::default());
        let id = h.backend.seed(3, ApprovalStatus::Unapproved, "advice");

        let result = h
            .coordinator
            .bulk_apply(
                BulkAction::Reject,
                ConversationFilter::All,
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let trail = h.backend.audit_trail(id).await.unwrap();
        let last = trail.last().unwrap();
        assert_eq!(last.action, ActionKind::BulkReject);
        assert_eq!(last.actor, "ana");
        assert!(last
            .reason
            .as_deref()
            .unwrap()
            .contains(&result.operation_id.to_string()));
    }

    #[tokio::test]
    async fn pages_are_bounded_and_cover_everything() {
        let h = harness(BulkConfig {
            concurrency: 3,
            page_size: 4,
        });
        for farmer in 1..=10 {
            h.backend.seed(farmer, ApprovalStatus::Unapproved, "advice");
        }

        let result = h
            .coordinator
            .bulk_apply(
                BulkAction::Approve,
                ConversationFilter::ByStatus {
                    status: ApprovalStatus::Unapproved,
                },
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.succeeded, 10);
        let sizes = h.backend.page_sizes.lock().unwrap().clone();
        assert!(sizes.iter().all(|&n| n <= 4));
        assert_eq!(sizes.iter().sum::<usize>(), 10);
    }

    #[tokio::test]
    async fn conversations_created_during_the_run_are_excluded() {
        let h = harness(BulkConfig {
            concurrency: 1,
            page_size: 1,
        });
        let farmer = 4;
        let seeded: Vec<_> = (0..3)
            .map(|_| h.backend.seed(farmer, ApprovalStatus::Unapproved, "advice"))
            .collect();
        h.backend.set_commit_delay(Some(Duration::from_millis(10)));

        let late = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                // Farmer 4 has open conversations, so use a fresh farmer to force a new id
                engine.ingest(99, "generator", "late advice").await
            })
        };

        let result = h
            .coordinator
            .bulk_apply(
                BulkAction::Approve,
                ConversationFilter::All,
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let late = late.await.unwrap().unwrap();

        let processed: Vec<_> = result.outcomes.iter().map(|o| o.conversation_id).collect();
        assert_eq!(processed, seeded);
        assert_eq!(late.status(), ApprovalStatus::Unapproved);
    }

    #[tokio::test]
    async fn status_filter_uses_status_at_invocation() {
        let h = harness(BulkConfig {
            concurrency: 1,
            page_size: 1,
        });
        let open: Vec<_> = (0..2)
            .map(|_| h.backend.seed(6, ApprovalStatus::Unapproved, "advice"))
            .collect();
        let sent_back = h.backend.seed(6, ApprovalStatus::Rejected, "advice");
        h.backend.set_commit_delay(Some(Duration::from_millis(30)));

        // A reviewer reopens the rejected conversation while the run is going
        let reopen = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                engine
                    .reopen(sent_back, "bea", Some("needs another look".into()))
                    .await
            })
        };

        let result = h
            .coordinator
            .bulk_apply(
                BulkAction::Approve,
                ConversationFilter::ByStatus {
                    status: ApprovalStatus::Unapproved,
                },
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap();
        reopen.await.unwrap().unwrap();

        let processed: Vec<_> = result.outcomes.iter().map(|o| o.conversation_id).collect();
        assert_eq!(processed, open);
        assert_eq!(result.succeeded, 2);
        let reopened = h.backend.load(sent_back).await.unwrap();
        assert_eq!(reopened.status(), ApprovalStatus::Unapproved);
    }

    #[tokio::test]
    async fn item_failures_are_reported_not_fatal() {
        let h = harness(BulkConfig {
            concurrency: 1,
            page_size: 10,
        });
        for _ in 0..3 {
            h.backend.seed(2, ApprovalStatus::Unapproved, "advice");
        }
        h.backend.fail_next_commit();

        let result = h
            .coordinator
            .bulk_apply(
                BulkAction::Approve,
                ConversationFilter::All,
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 2);
        let failed = result
            .outcomes
            .iter()
            .find(|o| matches!(o.outcome, ItemStatus::Failed { .. }))
            .unwrap();
        assert_eq!(
            failed.outcome,
            ItemStatus::Failed {
                kind: ErrorKind::StoreUnavailable,
                error: "Store unavailable: injected commit failure".into(),
            }
        );
    }

    #[tokio::test]
    async fn cancellation_stops_new_items() {
        let h = harness(BulkConfig {
            concurrency: 1,
            page_size: 100,
        });
        for farmer in 1..=20 {
            h.backend.seed(farmer, ApprovalStatus::Unapproved, "advice");
        }
        h.backend.set_commit_delay(Some(Duration::from_millis(20)));

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }

        let result = h
            .coordinator
            .bulk_apply(BulkAction::Approve, ConversationFilter::All, "ana", cancel)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(result.outcomes.len() < 20);
        assert!(!result.outcomes.is_empty());
        // Everything reported was applied
        assert_eq!(result.succeeded, result.outcomes.len());
        assert_eq!(h.backend.applied_commits(), result.succeeded);
    }

    #[tokio::test]
    async fn empty_store_is_an_empty_result() {
        let h = harness(BulkConfig::default());
        let result = h
            .coordinator
            .bulk_apply(
                BulkAction::Approve,
                ConversationFilter::All,
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcomes.len(), 0);
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn unresolvable_target_set_is_an_error() {
        let h = harness(BulkConfig::default());
        h.backend.seed(1, ApprovalStatus::Unapproved, "advice");
        h.backend.set_unavailable(true);
        let err = h
            .coordinator
            .bulk_apply(
                BulkAction::Approve,
                ConversationFilter::All,
                "ana",
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[test]
    fn filter_specs_validate() {
        let spec = |kind: &str, farmer_id, status: Option<&str>| FilterSpec {
            kind: kind.into(),
            farmer_id,
            status: status.map(String::from),
        };

        assert_eq!(spec("all", None, None).parse().unwrap(), ConversationFilter::All);
        assert_eq!(
            spec("by_farmer", Some(3), None).parse().unwrap(),
            ConversationFilter::ByFarmer { farmer_id: 3 }
        );
        assert_eq!(
            spec("by_status", None, Some("rejected")).parse().unwrap(),
            ConversationFilter::ByStatus {
                status: ApprovalStatus::Rejected
            }
        );

        for bad in [
            spec("by_farmer", None, None),
            spec("by_farmer", Some(0), None),
            spec("by_status", None, None),
            spec("by_status", None, Some("pending")),
            spec("by_region", None, None),
        ] {
            assert_eq!(bad.parse().unwrap_err().kind(), ErrorKind::InvalidFilter);
        }
    }

    #[test]
    fn bulk_action_parses() {
        assert_eq!("approve".parse::<BulkAction>().unwrap(), BulkAction::Approve);
        assert_eq!(
            "reopen".parse::<BulkAction>().unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
