//! Typed failures returned by every engine operation

use crate::state_machine::TransitionError;
use serde::Serialize;
use thiserror::Error;

/// Error returned by the store, engine, coordinator and injector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::InvalidFilter(_) => ErrorKind::InvalidFilter,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Conflict(_) => ErrorKind::Conflict,
        }
    }

    pub fn conversation_not_found(id: i64) -> Self {
        Self::NotFound(format!("conversation {id}"))
    }
}

impl From<TransitionError> for ApprovalError {
    fn from(err: TransitionError) -> Self {
        Self::InvalidTransition(err.to_string())
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown conversation or farmer - not retryable
    NotFound,
    /// Status change not allowed from the current status - not retryable
    InvalidTransition,
    /// Bulk filter kind or parameters not recognized - not retryable
    InvalidFilter,
    /// Malformed request content - not retryable
    InvalidInput,
    /// Durable store unreachable or timed out - retryable
    StoreUnavailable,
    /// Competing write on the same conversation - retryable
    Conflict,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::Conflict)
    }
}
