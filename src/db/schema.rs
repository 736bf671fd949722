//! Database schema and types

use crate::state_machine::{ActionKind, ApprovalStatus, MessageOrigin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ConversationId = i64;
pub type FarmerId = i64;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    farmer_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'unapproved',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_conversations_farmer ON conversations(farmer_id, status);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    sequence_id INTEGER NOT NULL,
    origin TEXT NOT NULL,
    content TEXT NOT NULL,
    sent_at TEXT NOT NULL,

    UNIQUE (conversation_id, sequence_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    reason TEXT,
    at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE INDEX IF NOT EXISTS idx_audit_conversation ON audit_events(conversation_id, id);
";

/// Conversation summary record (no message bodies)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub farmer_id: FarmerId,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
    /// Content of the most recent message, for listings
    pub latest_message: Option<String>,
}

/// Message record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: ConversationId,
    pub sequence_id: i64,
    pub origin: MessageOrigin,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// A conversation with its full message history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

impl ConversationDetail {
    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    pub fn status(&self) -> ApprovalStatus {
        self.conversation.status
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Message to be appended; sequence and timestamp are assigned on commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub origin: MessageOrigin,
    pub content: String,
}

impl NewMessage {
    pub fn generated(content: impl Into<String>) -> Self {
        Self {
            origin: MessageOrigin::Generated,
            content: content.into(),
        }
    }

    pub fn manual(content: impl Into<String>) -> Self {
        Self {
            origin: MessageOrigin::Manual,
            content: content.into(),
        }
    }
}

/// Who did what, recorded with every mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub action: ActionKind,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Attribution {
    pub fn new(action: ActionKind, actor: impl Into<String>) -> Self {
        Self {
            action,
            actor: actor.into(),
            reason: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Changes committed atomically to one conversation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationWrite {
    pub append: Option<NewMessage>,
    pub status: Option<ApprovalStatus>,
}

impl ConversationWrite {
    pub fn is_empty(&self) -> bool {
        self.append.is_none() && self.status.is_none()
    }
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub conversation_id: ConversationId,
    pub action: ActionKind,
    pub actor: String,
    pub from_status: Option<ApprovalStatus>,
    pub to_status: ApprovalStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Which conversations an id scan selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationFilter {
    All,
    ByFarmer { farmer_id: FarmerId },
    ByStatus { status: ApprovalStatus },
}

impl ConversationFilter {
    pub fn matches(&self, conversation: &Conversation) -> bool {
        match self {
            Self::All => true,
            Self::ByFarmer { farmer_id } => conversation.farmer_id == *farmer_id,
            Self::ByStatus { status } => conversation.status == *status,
        }
    }
}

/// Bounds of a bulk scan, read once when the scan starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSnapshot {
    /// Highest conversation id at the snapshot
    pub up_to: ConversationId,
    /// Highest audit event id at the snapshot
    pub audit_mark: i64,
}
