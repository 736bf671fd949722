//! Manual message injection
//!
//! Reviewer-authored messages skip review: they land approved.

use crate::db::{Attribution, ConversationDetail, FarmerId, NewMessage};
use crate::engine::{append_while_open, require_text};
use crate::error::ApprovalError;
use crate::state_machine::{ActionKind, ApprovalStatus};
use crate::store::{ConversationStore, StoreBackend};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Where a manual message goes when the farmer has a conversation under review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPolicy {
    /// Start a new approved conversation and leave the open one alone
    #[default]
    SeparateConversation,
    /// Add to the open conversation without changing its status
    AppendToOpen,
}

impl fmt::Display for InjectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SeparateConversation => "separate_conversation",
            Self::AppendToOpen => "append_to_open",
        })
    }
}

impl FromStr for InjectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "separate_conversation" => Ok(Self::SeparateConversation),
            "append_to_open" => Ok(Self::AppendToOpen),
            other => Err(format!("unknown injection policy: {other}")),
        }
    }
}

pub struct ManualMessageInjector<B> {
    store: Arc<ConversationStore<B>>,
    policy: InjectionPolicy,
}

impl<B: StoreBackend> ManualMessageInjector<B> {
    pub fn new(store: Arc<ConversationStore<B>>, policy: InjectionPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn inject(
        &self,
        farmer_id: FarmerId,
        content: &str,
        actor: &str,
    ) -> Result<ConversationDetail, ApprovalError> {
        require_text("actor", actor)?;
        require_text("content", content)?;
        if farmer_id <= 0 {
            return Err(ApprovalError::NotFound(format!("farmer {farmer_id}")));
        }

        if self.policy == InjectionPolicy::AppendToOpen {
            if let Some(open) = self.store.find_open_conversation(farmer_id).await? {
                let appended = append_while_open(
                    &self.store,
                    open,
                    NewMessage::manual(content),
                    Attribution::new(ActionKind::ManualInject, actor),
                )
                .await?;
                if let Some(detail) = appended {
                    return Ok(detail);
                }
                tracing::debug!(
                    conversation_id = open,
                    farmer_id,
                    "Open conversation was decided; injecting separately"
                );
            }
        }

        self.store
            .create_conversation(
                farmer_id,
                ApprovalStatus::Approved,
                NewMessage::manual(content),
                Attribution::new(ActionKind::ManualInject, actor),
            )
            .await
    }
}
