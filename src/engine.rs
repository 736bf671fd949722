//! Approval engine
//!
//! Single-conversation reviewer actions and upstream ingestion. Every
//! operation goes through the store's serialized update, so the decision is
//! made against the state it is committed on top of.

use crate::db::{
    Attribution, ConversationDetail, ConversationId, ConversationWrite, FarmerId, NewMessage,
};
use crate::error::ApprovalError;
use crate::state_machine::{ActionKind, ApprovalStatus, MessageOrigin, Verb};
use crate::store::{Committed, ConversationStore, Plan, StatusWrite, StoreBackend};
use std::sync::Arc;

/// Reject blank actors and message bodies
pub(crate) fn require_text(field: &str, value: &str) -> Result<(), ApprovalError> {
    if value.trim().is_empty() {
        return Err(ApprovalError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Append to `id` only if it is still unapproved.
///
/// Returns `None` when the conversation was decided between lookup and lock,
/// so the caller can open a fresh conversation instead.
pub(crate) async fn append_while_open<B: StoreBackend>(
    store: &ConversationStore<B>,
    id: ConversationId,
    message: NewMessage,
    attribution: Attribution,
) -> Result<Option<ConversationDetail>, ApprovalError> {
    let result = store
        .update(id, attribution, move |current| {
            if current.status() == ApprovalStatus::Unapproved {
                Ok(Plan::Write(ConversationWrite {
                    append: Some(message),
                    status: None,
                }))
            } else {
                Err(ApprovalError::InvalidTransition(format!(
                    "conversation {id} is {}",
                    current.status()
                )))
            }
        })
        .await;

    match result {
        Ok(committed) => Ok(Some(committed.detail)),
        Err(ApprovalError::InvalidTransition(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn status_write(verb: Verb) -> StatusWrite {
    match verb {
        Verb::Approve => StatusWrite::to(ApprovalStatus::Approved),
        Verb::Reject => StatusWrite::to(ApprovalStatus::Rejected),
        Verb::Reopen => StatusWrite::reopen(),
    }
}

pub struct ApprovalEngine<B> {
    store: Arc<ConversationStore<B>>,
}

impl<B: StoreBackend> ApprovalEngine<B> {
    pub fn new(store: Arc<ConversationStore<B>>) -> Self {
        Self { store }
    }

    /// `Unapproved -> Approved`; already approved is a no-op success
    pub async fn approve(
        &self,
        id: ConversationId,
        actor: &str,
    ) -> Result<ConversationDetail, ApprovalError> {
        self.apply(id, Verb::Approve, Attribution::new(ActionKind::Approve, actor))
            .await
            .map(|c| c.detail)
    }

    /// `Unapproved -> Rejected`; already rejected is a no-op success
    pub async fn reject(
        &self,
        id: ConversationId,
        actor: &str,
    ) -> Result<ConversationDetail, ApprovalError> {
        self.apply(id, Verb::Reject, Attribution::new(ActionKind::Reject, actor))
            .await
            .map(|c| c.detail)
    }

    /// Send a decided conversation back to review
    pub async fn reopen(
        &self,
        id: ConversationId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ConversationDetail, ApprovalError> {
        let mut attribution = Attribution::new(ActionKind::Reopen, actor);
        attribution.reason = reason;
        self.apply(id, Verb::Reopen, attribution)
            .await
            .map(|c| c.detail)
    }

    /// Apply a verb under an arbitrary attribution (bulk actions use this)
    pub async fn apply(
        &self,
        id: ConversationId,
        verb: Verb,
        attribution: Attribution,
    ) -> Result<Committed, ApprovalError> {
        require_text("actor", &attribution.actor)?;
        self.store
            .set_status(id, status_write(verb), attribution)
            .await
    }

    /// Record the reviewer's rewrite as a manual message and approve, atomically.
    ///
    /// A retry after the first attempt committed finds the identical manual
    /// message on an approved conversation and succeeds without appending.
    pub async fn edit_and_approve(
        &self,
        id: ConversationId,
        actor: &str,
        new_content: &str,
    ) -> Result<ConversationDetail, ApprovalError> {
        require_text("actor", actor)?;
        require_text("content", new_content)?;

        let content = new_content.to_string();
        self.store
            .update(
                id,
                Attribution::new(ActionKind::EditAndApprove, actor),
                move |current| match current.status() {
                    ApprovalStatus::Unapproved => Ok(Plan::Write(ConversationWrite {
                        append: Some(NewMessage::manual(content.clone())),
                        status: Some(ApprovalStatus::Approved),
                    })),
                    ApprovalStatus::Approved
                        if current.last_message().is_some_and(|m| {
                            m.origin == MessageOrigin::Manual && m.content == content
                        }) =>
                    {
                        Ok(Plan::Noop)
                    }
                    status => Err(ApprovalError::InvalidTransition(format!(
                        "cannot edit and approve a conversation that is {status}"
                    ))),
                },
            )
            .await
            .map(|c| c.detail)
    }

    /// Upstream appends another candidate to a conversation under review
    pub async fn append_generated(
        &self,
        id: ConversationId,
        source: &str,
        content: &str,
    ) -> Result<ConversationDetail, ApprovalError> {
        require_text("source", source)?;
        require_text("content", content)?;

        append_while_open(
            &self.store,
            id,
            NewMessage::generated(content),
            Attribution::new(ActionKind::Append, source),
        )
        .await?
        .ok_or_else(|| {
            ApprovalError::InvalidTransition(format!(
                "conversation {id} is already decided; reopen it before adding candidates"
            ))
        })
    }

    /// Upstream produced a candidate for a farmer: join the open conversation
    /// or start a new one under review
    pub async fn ingest(
        &self,
        farmer_id: FarmerId,
        source: &str,
        content: &str,
    ) -> Result<ConversationDetail, ApprovalError> {
        require_text("source", source)?;
        require_text("content", content)?;
        if farmer_id <= 0 {
            return Err(ApprovalError::NotFound(format!("farmer {farmer_id}")));
        }

        if let Some(open) = self.store.find_open_conversation(farmer_id).await? {
            let appended = append_while_open(
                &self.store,
                open,
                NewMessage::generated(content),
                Attribution::new(ActionKind::Append, source),
            )
            .await?;
            if let Some(detail) = appended {
                return Ok(detail);
            }
        }

        self.store
            .create_conversation(
                farmer_id,
                ApprovalStatus::Unapproved,
                NewMessage::generated(content),
                Attribution::new(ActionKind::Ingest, source),
            )
            .await
    }
}
