//! Status, origin and action vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Approval status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Unapproved,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    #[allow(dead_code)] // Used in tests
    pub const ALL: [ApprovalStatus; 3] = [Self::Unapproved, Self::Approved, Self::Rejected];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unapproved => "unapproved",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Approved and rejected conversations only leave their status via reopen
    pub fn is_decided(self) -> bool {
        !matches!(self, Self::Unapproved)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unapproved" => Ok(Self::Unapproved),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// Candidate produced by the advice generator
    Generated,
    /// Written by a reviewer
    Manual,
}

impl MessageOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(Self::Generated),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown message origin: {other}")),
        }
    }
}

/// The action a mutation is attributed to in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Upstream generator created the conversation
    Ingest,
    /// Upstream generator appended a candidate
    Append,
    Approve,
    Reject,
    Reopen,
    EditAndApprove,
    BulkApprove,
    BulkReject,
    ManualInject,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Append => "append",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Reopen => "reopen",
            Self::EditAndApprove => "edit_and_approve",
            Self::BulkApprove => "bulk_approve",
            Self::BulkReject => "bulk_reject",
            Self::ManualInject => "manual_inject",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "append" => Ok(Self::Append),
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "reopen" => Ok(Self::Reopen),
            "edit_and_approve" => Ok(Self::EditAndApprove),
            "bulk_approve" => Ok(Self::BulkApprove),
            "bulk_reject" => Ok(Self::BulkReject),
            "manual_inject" => Ok(Self::ManualInject),
            other => Err(format!("unknown action: {other}")),
        }
    }
}
