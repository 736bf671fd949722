//! Pure status transition function

use super::ApprovalStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A reviewer's requested status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Approve,
    Reject,
    /// Explicitly move a decided conversation back to review
    Reopen,
}

impl Verb {
    /// Status the verb drives a conversation towards
    pub fn target(self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Reject => ApprovalStatus::Rejected,
            Self::Reopen => ApprovalStatus::Unapproved,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Reopen => "reopen",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "reopen" => Ok(Self::Reopen),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Outcome of applying a verb to a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status moves and must be committed
    Changed {
        from: ApprovalStatus,
        to: ApprovalStatus,
    },
    /// Already at the target; nothing to write
    Unchanged(ApprovalStatus),
}

impl Transition {
    pub fn status(self) -> ApprovalStatus {
        match self {
            Self::Changed { to, .. } => to,
            Self::Unchanged(status) => status,
        }
    }

    pub fn is_change(self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {verb} a conversation that is {current}")]
    Forbidden {
        verb: Verb,
        current: ApprovalStatus,
    },
}

/// Decide what `verb` does to a conversation currently in `current`.
///
/// Forward moves only go `Unapproved -> {Approved, Rejected}`. Re-applying the
/// status a conversation already has is a no-op, which is what makes retries
/// after a timeout safe. Leaving a decided status requires `Verb::Reopen`.
pub fn transition(current: ApprovalStatus, verb: Verb) -> Result<Transition, TransitionError> {
    let target = verb.target();
    if current == target {
        return Ok(Transition::Unchanged(current));
    }

    let allowed = match verb {
        Verb::Approve | Verb::Reject => !current.is_decided(),
        Verb::Reopen => current.is_decided(),
    };
    if !allowed {
        return Err(TransitionError::Forbidden { verb, current });
    }
    Ok(Transition::Changed {
        from: current,
        to: target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_from_unapproved_changes() {
        let t = transition(ApprovalStatus::Unapproved, Verb::Approve).unwrap();
        assert_eq!(
            t,
            Transition::Changed {
                from: ApprovalStatus::Unapproved,
                to: ApprovalStatus::Approved
            }
        );
    }

    #[test]
    fn approve_is_idempotent() {
        let t = transition(ApprovalStatus::Approved, Verb::Approve).unwrap();
        assert_eq!(t, Transition::Unchanged(ApprovalStatus::Approved));
    }

    #[test]
    fn approve_after_reject_is_forbidden() {
        let err = transition(ApprovalStatus::Rejected, Verb::Approve).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Forbidden {
                verb: Verb::Approve,
                current: ApprovalStatus::Rejected
            }
        );
        assert_eq!(err.to_string(), "cannot approve a conversation that is rejected");
    }

    #[test]
    fn reject_after_approve_is_forbidden() {
        assert!(transition(ApprovalStatus::Approved, Verb::Reject).is_err());
    }

    #[test]
    fn reopen_moves_decided_back_to_review() {
        for from in [ApprovalStatus::Approved, ApprovalStatus::Rejected] {
            let t = transition(from, Verb::Reopen).unwrap();
            assert_eq!(t.status(), ApprovalStatus::Unapproved);
            assert!(t.is_change());
        }
        let t = transition(ApprovalStatus::Unapproved, Verb::Reopen).unwrap();
        assert!(!t.is_change());
    }
}
