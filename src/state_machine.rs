//! Approval state machine
//!
//! Pure transition rules for a conversation's approval status. Nothing in
//! here touches storage; the store runs these rules under the per-conversation
//! write lock and commits whatever they decide.

pub mod status;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use status::{ActionKind, ApprovalStatus, MessageOrigin};
pub use transition::{transition, Transition, TransitionError, Verb};
