//! In-memory backend for testing
//!
//! Applies writes atomically by building the new record before swapping it in,
//! and supports fault injection (failing or slow commits, outages).

use super::traits::{BackendError, StoreBackend};
use crate::db::{
    Attribution, AuditEntry, Conversation, ConversationDetail, ConversationFilter, ConversationId,
    ConversationWrite, FarmerId, Message, NewMessage, ScanSnapshot,
};
use crate::state_machine::ApprovalStatus;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    next_id: ConversationId,
    conversations: BTreeMap<ConversationId, ConversationDetail>,
    audit: Vec<AuditEntry>,
    /// Logical clock so `updated_at` strictly increases per write
    ticks: i64,
}

impl MemoryState {
    fn tick(&mut self) -> chrono::DateTime<Utc> {
        self.ticks += 1;
        Utc.timestamp_millis_opt(self.ticks)
            .single()
            .unwrap_or_default()
    }

    /// Status as of the audit entry numbered `mark` (1-based, like SQLite ids)
    fn status_at(&self, detail: &ConversationDetail, mark: i64) -> ApprovalStatus {
        let mark = usize::try_from(mark).unwrap();
        self.audit[mark..]
            .iter()
            .find(|e| e.conversation_id == detail.id())
            .and_then(|e| e.from_status)
            .unwrap_or(detail.status())
    }
}

/// Mock backend with predefined faults
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    fail_next_commit: AtomicBool,
    unavailable: AtomicBool,
    commit_delay: Mutex<Option<Duration>>,
    /// Commits that actually changed stored state
    pub applied_commits: AtomicUsize,
    /// Sizes of every id page handed out
    pub page_sizes: Mutex<Vec<usize>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next commit fails with `Unavailable` without applying anything
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Every call fails until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every commit sleeps this long before applying
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self.commit_delay.lock().unwrap() = delay;
    }

    pub fn applied_commits(&self) -> usize {
        self.applied_commits.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend offline".into()));
        }
        Ok(())
    }

    /// Insert directly with a chosen status, bypassing attribution rules
    pub fn seed(&self, farmer_id: FarmerId, status: ApprovalStatus, text: &str) -> ConversationId {
        let mut state = self.state.lock().unwrap();
        insert(
            &mut state,
            farmer_id,
            status,
            &NewMessage::generated(text),
            &Attribution::new(crate::state_machine::ActionKind::Ingest, "seed"),
        )
        .id()
    }
}

fn insert(
    state: &mut MemoryState,
    farmer_id: FarmerId,
    status: ApprovalStatus,
    first: &NewMessage,
    attribution: &Attribution,
) -> ConversationDetail {
    state.next_id += 1;
    let id = state.next_id;
    let now = state.tick();

    let detail = ConversationDetail {
        conversation: Conversation {
            id,
            farmer_id,
            status,
            created_at: now,
            updated_at: now,
            message_count: 1,
            latest_message: Some(first.content.clone()),
        },
        messages: vec![Message {
            conversation_id: id,
            sequence_id: 1,
            origin: first.origin,
            content: first.content.clone(),
            sent_at: now,
        }],
    };
    state.audit.push(AuditEntry {
        conversation_id: id,
        action: attribution.action,
        actor: attribution.actor.clone(),
        from_status: None,
        to_status: status,
        reason: attribution.reason.clone(),
        at: now,
    });
    state.conversations.insert(id, detail.clone());
    detail
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn create_conversation(
        &self,
        farmer_id: FarmerId,
        status: ApprovalStatus,
        first: &NewMessage,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        Ok(insert(&mut state, farmer_id, status, first, attribution))
    }

    async fn load(&self, id: ConversationId) -> Result<ConversationDetail, BackendError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        state
            .conversations
            .get(&id)
            .cloned()
            .ok_or(BackendError::NotFound(id))
    }

    async fn commit(
        &self,
        id: ConversationId,
        expected: ApprovalStatus,
        write: &ConversationWrite,
        attribution: &Attribution,
    ) -> Result<ConversationDetail, BackendError> {
        self.check_available()?;
        let delay = *self.commit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected commit failure".into()));
        }

        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        let current = state
            .conversations
            .get(&id)
            .cloned()
            .ok_or(BackendError::NotFound(id))?;
        if current.status() != expected {
            return Err(BackendError::Stale {
                id,
                actual: current.status(),
            });
        }

        let mut next = current;
        if let Some(message) = &write.append {
            let sequence_id = next.messages.last().map_or(1, |m| m.sequence_id + 1);
            next.messages.push(Message {
                conversation_id: id,
                sequence_id,
                origin: message.origin,
                content: message.content.clone(),
                sent_at: now,
            });
            next.conversation.message_count += 1;
            next.conversation.latest_message = Some(message.content.clone());
        }
        let new_status = write.status.unwrap_or(expected);
        next.conversation.status = new_status;
        next.conversation.updated_at = now;

        state.audit.push(AuditEntry {
            conversation_id: id,
            action: attribution.action,
            actor: attribution.actor.clone(),
            from_status: Some(expected),
            to_status: new_status,
            reason: attribution.reason.clone(),
            at: now,
        });
        state.conversations.insert(id, next.clone());
        self.applied_commits.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .conversations
            .values()
            .map(|d| d.conversation.clone())
            .collect())
    }

    async fn page_ids(
        &self,
        filter: ConversationFilter,
        after: Option<ConversationId>,
        snapshot: ScanSnapshot,
        limit: usize,
    ) -> Result<Vec<ConversationId>, BackendError> {
        self.check_available()?;
        let start = after.unwrap_or(0) + 1;
        let up_to = snapshot.up_to;
        if start > up_to {
            self.page_sizes.lock().unwrap().push(0);
            return Ok(Vec::new());
        }
        let ids: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .conversations
                .range(start..=up_to)
                .filter(|(_, d)| {
                    let mut as_of = d.conversation.clone();
                    as_of.status = state.status_at(d, snapshot.audit_mark);
                    filter.matches(&as_of)
                })
                .map(|(id, _)| *id)
                .take(limit)
                .collect()
        };
        self.page_sizes.lock().unwrap().push(ids.len());
        Ok(ids)
    }

    async fn high_water_mark(&self) -> Result<Option<ScanSnapshot>, BackendError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        let audit_mark = i64::try_from(state.audit.len()).unwrap();
        Ok(state
            .conversations
            .keys()
            .next_back()
            .map(|&up_to| ScanSnapshot { up_to, audit_mark }))
    }

    async fn find_open_conversation(
        &self,
        farmer_id: FarmerId,
    ) -> Result<Option<ConversationId>, BackendError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .conversations
            .values()
            .filter(|d| {
                d.conversation.farmer_id == farmer_id
                    && d.conversation.status == ApprovalStatus::Unapproved
            })
            .max_by_key(|d| (d.conversation.updated_at, d.id()))
            .map(ConversationDetail::id))
    }

    async fn audit_trail(&self, id: ConversationId) -> Result<Vec<AuditEntry>, BackendError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        if !state.conversations.contains_key(&id) {
            return Err(BackendError::NotFound(id));
        }
        Ok(state
            .audit
            .iter()
            .filter(|e| e.conversation_id == id)
            .cloned()
            .collect())
    }
}
