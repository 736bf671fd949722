//! Per-conversation write locks
//!
//! One async mutex per conversation id, created on first use and dropped
//! again once nobody holds or waits for it.

use crate::db::ConversationId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What a writer does when another write on the same conversation is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Queue behind the in-flight write, up to the configured wait
    #[default]
    Wait,
    /// Give up immediately
    FailFast,
}

impl std::str::FromStr for LockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(Self::Wait),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(format!("unknown lock policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("conversation {0} has a write in flight")]
    Busy(ConversationId),
    #[error("timed out after {waited:?} waiting for conversation {id}")]
    TimedOut { id: ConversationId, waited: Duration },
}

#[derive(Default)]
pub struct KeyedLocks {
    slots: DashMap<ConversationId, Arc<Mutex<()>>>,
}

/// Held for the duration of one conversation write
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        id: ConversationId,
        policy: LockPolicy,
        wait: Duration,
    ) -> Result<KeyGuard<'_>, LockError> {
        let slot = Arc::clone(self.slots.entry(id).or_default().value());

        let acquired = match policy {
            LockPolicy::FailFast => slot.try_lock_owned().map_err(|_| LockError::Busy(id)),
            LockPolicy::Wait => tokio::time::timeout(wait, slot.lock_owned())
                .await
                .map_err(|_| LockError::TimedOut { id, waited: wait }),
        };

        match acquired {
            Ok(guard) => Ok(KeyGuard {
                locks: self,
                id,
                guard: Some(guard),
            }),
            Err(e) => {
                self.release(id);
                Err(e)
            }
        }
    }

    /// Drop the slot if only the map still references it
    fn release(&self, id: ConversationId) {
        self.slots.remove_if(&id, |_, slot| Arc::strong_count(slot) == 1);
    }

    /// Number of conversations with a live slot
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.id);
    }
}
