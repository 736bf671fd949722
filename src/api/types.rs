//! API request and response types

use crate::bulk::FilterSpec;
use crate::db::{Conversation, ConversationId, FarmerId};
use crate::error::ErrorKind;
use crate::store::StatusPartitions;
use serde::{Deserialize, Serialize};

/// Attributed to requests that do not name a reviewer
pub const DEFAULT_ACTOR: &str = "dashboard";
/// Attributed to generated messages that do not name their source
pub const DEFAULT_SOURCE: &str = "generator";

/// Upstream delivered a generated message for a farmer
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub farmer_id: FarmerId,
    pub message: String,
    pub source: Option<String>,
}

/// Upstream appended a candidate to a known conversation
#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub message: String,
    pub source: Option<String>,
}

/// Single-conversation decision
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub conversation_id: ConversationId,
    /// `approve`, `reject` or `reopen`
    pub action: String,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub message: String,
    pub actor: Option<String>,
}

/// Bulk decision; `filter` wins over `farmer_id`, and neither means all
#[derive(Debug, Deserialize)]
pub struct BulkApproveRequest {
    pub action: String,
    pub farmer_id: Option<FarmerId>,
    pub filter: Option<FilterSpec>,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualMessageRequest {
    pub farmer_id: FarmerId,
    pub message: String,
    pub actor: Option<String>,
}

/// Conversations grouped for the review screen
#[derive(Debug, Serialize)]
pub struct ApprovalListResponse {
    pub unapproved: Vec<Conversation>,
    pub approved: Vec<Conversation>,
    pub rejected: Vec<Conversation>,
    pub counts: PartitionCounts,
}

#[derive(Debug, Serialize)]
pub struct PartitionCounts {
    pub unapproved: usize,
    pub approved: usize,
    pub rejected: usize,
}

impl From<&StatusPartitions> for ApprovalListResponse {
    fn from(partitions: &StatusPartitions) -> Self {
        Self {
            counts: PartitionCounts {
                unapproved: partitions.unapproved.len(),
                approved: partitions.approved.len(),
                rejected: partitions.rejected.len(),
            },
            unapproved: partitions.unapproved.clone(),
            approved: partitions.approved.clone(),
            rejected: partitions.rejected.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            kind,
            retryable: kind.is_retryable(),
        }
    }
}
