//! Database module for the approval engine
//!
//! Provides persistence for conversations, messages and the audit trail.

mod schema;

pub use schema::*;

use crate::state_machine::ApprovalStatus;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("Conversation {id} is {actual}, expected {expected}")]
    StatusMismatch {
        id: ConversationId,
        expected: ApprovalStatus,
        actual: ApprovalStatus,
    },
    #[error("Database connection lock poisoned")]
    Poisoned,
    #[cfg(test)]
    #[error("Injected fault")]
    InjectedFault,
}

pub type DbResult<T> = Result<T, DbError>;

const SUMMARY_COLUMNS: &str = "c.id, c.farmer_id, c.status, c.created_at, c.updated_at,
    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count,
    (SELECT m.content FROM messages m WHERE m.conversation_id = c.id
        ORDER BY m.sequence_id DESC LIMIT 1) AS latest_message";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    /// Makes the next status update inside a commit fail, after the message
    /// insert has already run in the same transaction
    #[cfg(test)]
    fail_status_update: Arc<std::sync::atomic::AtomicBool>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> DbResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            #[cfg(test)]
            fail_status_update: Arc::default(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    #[cfg(test)]
    pub fn fail_next_status_update(&self) {
        self.fail_status_update
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_injected_fault(&self) -> DbResult<()> {
        if self
            .fail_status_update
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(DbError::InjectedFault);
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[allow(clippy::unused_self)]
    fn check_injected_fault(&self) -> DbResult<()> {
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a conversation together with its first message
    pub fn create_conversation(
        &self,
        farmer_id: FarmerId,
        status: ApprovalStatus,
        first: &NewMessage,
        attribution: &Attribution,
    ) -> DbResult<ConversationDetail> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = format_datetime(&Utc::now());

        tx.execute(
            "INSERT INTO conversations (farmer_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![farmer_id, status.as_str(), now],
        )?;
        let id = tx.last_insert_rowid();

        insert_message(&tx, id, first, &now)?;
        insert_audit(&tx, id, attribution, None, status, &now)?;

        let detail = load_detail(&tx, id)?;
        tx.commit()?;
        Ok(detail)
    }

    /// Get conversation summary by ID
    #[allow(dead_code)] // Used in tests
    pub fn get_conversation(&self, id: ConversationId) -> DbResult<Conversation> {
        let conn = self.conn()?;
        load_summary(&conn, id)
    }

    /// Get conversation with its full message history
    pub fn get_detail(&self, id: ConversationId) -> DbResult<ConversationDetail> {
        let conn = self.conn()?;
        load_detail(&conn, id)
    }

    /// Apply a write to one conversation in a single transaction.
    ///
    /// The status column is compared against `expected` first; if another
    /// writer moved it, nothing is written and `StatusMismatch` is returned.
    pub fn commit_write(
        &self,
        id: ConversationId,
        expected: ApprovalStatus,
        write: &ConversationWrite,
        attribution: &Attribution,
    ) -> DbResult<ConversationDetail> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = format_datetime(&Utc::now());

        let actual = current_status(&tx, id)?;
        if actual != expected {
            return Err(DbError::StatusMismatch {
                id,
                expected,
                actual,
            });
        }

        if let Some(message) = &write.append {
            insert_message(&tx, id, message, &now)?;
        }

        self.check_injected_fault()?;

        let new_status = write.status.unwrap_or(expected);
        tx.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![new_status.as_str(), now, id, expected.as_str()],
        )?;
        insert_audit(&tx, id, attribution, Some(expected), new_status, &now)?;

        let detail = load_detail(&tx, id)?;
        tx.commit()?;
        Ok(detail)
    }

    /// List every conversation summary, least recently modified first
    pub fn list_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM conversations c ORDER BY c.updated_at ASC, c.id ASC"
        ))?;
        let rows = stmt.query_map([], parse_conversation_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Keyset page of ids in `(after, snapshot.up_to]` matching `filter`, ascending.
    ///
    /// Status filters judge each conversation by its status at the snapshot:
    /// the `from_status` of its first audit event past `audit_mark`, or its
    /// current status if it has none.
    pub fn page_ids(
        &self,
        filter: ConversationFilter,
        after: Option<ConversationId>,
        snapshot: ScanSnapshot,
        limit: usize,
    ) -> DbResult<Vec<ConversationId>> {
        let conn = self.conn()?;
        let after = after.unwrap_or(0);
        let up_to = snapshot.up_to;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let ids = match filter {
            ConversationFilter::All => {
                let mut stmt = conn.prepare(
                    "SELECT id FROM conversations WHERE id > ?1 AND id <= ?2
                     ORDER BY id ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![after, up_to, limit], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            ConversationFilter::ByFarmer { farmer_id } => {
                let mut stmt = conn.prepare(
                    "SELECT id FROM conversations WHERE id > ?1 AND id <= ?2 AND farmer_id = ?4
                     ORDER BY id ASC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![after, up_to, limit, farmer_id], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            ConversationFilter::ByStatus { status } => {
                let mut stmt = conn.prepare(
                    "SELECT c.id FROM conversations c
                     WHERE c.id > ?1 AND c.id <= ?2
                       AND COALESCE(
                           (SELECT a.from_status FROM audit_events a
                            WHERE a.conversation_id = c.id AND a.id > ?5
                            ORDER BY a.id ASC LIMIT 1),
                           c.status) = ?4
                     ORDER BY c.id ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![after, up_to, limit, status.as_str(), snapshot.audit_mark],
                    |row| row.get(0),
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(ids)
    }

    /// Highest conversation and audit event ids, read together.
    /// `None` when there are no conversations.
    pub fn scan_snapshot(&self) -> DbResult<Option<ScanSnapshot>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let up_to: Option<ConversationId> =
            tx.query_row("SELECT MAX(id) FROM conversations", [], |row| row.get(0))?;
        let audit_mark: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM audit_events",
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(up_to.map(|up_to| ScanSnapshot { up_to, audit_mark }))
    }

    /// Most recently touched unapproved conversation for a farmer
    pub fn find_open_conversation(&self, farmer_id: FarmerId) -> DbResult<Option<ConversationId>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id FROM conversations WHERE farmer_id = ?1 AND status = ?2
             ORDER BY updated_at DESC, id DESC LIMIT 1",
            params![farmer_id, ApprovalStatus::Unapproved.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(DbError::from)
    }

    // ==================== Audit Operations ====================

    /// Every recorded mutation of a conversation, oldest first
    pub fn audit_trail(&self, id: ConversationId) -> DbResult<Vec<AuditEntry>> {
        let conn = self.conn()?;
        // Distinguish "no events" from "no conversation"
        current_status(&conn, id)?;

        let mut stmt = conn.prepare(
            "SELECT conversation_id, action, actor, from_status, to_status, reason, at
             FROM audit_events WHERE conversation_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id], parse_audit_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn current_status(conn: &Connection, id: ConversationId) -> DbResult<ApprovalStatus> {
    conn.query_row(
        "SELECT status FROM conversations WHERE id = ?1",
        params![id],
        |row| parse_enum(row, 0),
    )
    .optional()?
    .ok_or(DbError::ConversationNotFound(id))
}

fn insert_message(
    tx: &Transaction<'_>,
    id: ConversationId,
    message: &NewMessage,
    now: &str,
) -> DbResult<()> {
    let sequence_id: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
        params![id],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO messages (conversation_id, sequence_id, origin, content, sent_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, sequence_id, message.origin.as_str(), message.content, now],
    )?;

    tx.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

fn insert_audit(
    tx: &Transaction<'_>,
    id: ConversationId,
    attribution: &Attribution,
    from: Option<ApprovalStatus>,
    to: ApprovalStatus,
    now: &str,
) -> DbResult<()> {
    tx.execute(
        "INSERT INTO audit_events (conversation_id, action, actor, from_status, to_status, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            attribution.action.as_str(),
            attribution.actor,
            from.map(ApprovalStatus::as_str),
            to.as_str(),
            attribution.reason,
            now,
        ],
    )?;
    Ok(())
}

fn load_summary(conn: &Connection, id: ConversationId) -> DbResult<Conversation> {
    conn.query_row(
        &format!("SELECT {SUMMARY_COLUMNS} FROM conversations c WHERE c.id = ?1"),
        params![id],
        parse_conversation_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id),
        other => DbError::Sqlite(other),
    })
}

fn load_messages(conn: &Connection, id: ConversationId) -> DbResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT conversation_id, sequence_id, origin, content, sent_at
         FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
    )?;
    let rows = stmt.query_map(params![id], parse_message_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
}

fn load_detail(conn: &Connection, id: ConversationId) -> DbResult<ConversationDetail> {
    let conversation = load_summary(conn, id)?;
    let messages = load_messages(conn, id)?;
    Ok(ConversationDetail {
        conversation,
        messages,
    })
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        farmer_id: row.get(1)?,
        status: parse_enum(row, 2)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
        updated_at: parse_datetime(&row.get::<_, String>(4)?),
        message_count: row.get(5)?,
        latest_message: row.get(6)?,
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        conversation_id: row.get(0)?,
        sequence_id: row.get(1)?,
        origin: parse_enum(row, 2)?,
        content: row.get(3)?,
        sent_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let from_status = row
        .get::<_, Option<String>>(3)?
        .map(|s| {
            s.parse::<ApprovalStatus>()
                .map_err(|e| conversion_error(3, e))
        })
        .transpose()?;

    Ok(AuditEntry {
        conversation_id: row.get(0)?,
        action: parse_enum(row, 1)?,
        actor: row.get(2)?,
        from_status,
        to_status: parse_enum(row, 4)?,
        reason: row.get(5)?,
        at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

/// Parse a text column through the type's `FromStr`
fn parse_enum<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
