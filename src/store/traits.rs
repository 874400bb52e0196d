//! `MessageStore` trait — the persistence boundary for the threading engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Inbound mail from a correspondent.
    User,
    /// Outbound auto-reply sent by the daemon.
    Host,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Host => "host",
        }
    }
}

/// A persisted email row.
#[derive(Debug, Clone)]
pub struct EmailRecord {
    pub id: i64,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    /// Raw sender as received, e.g. `"Alice <alice@example.com>"`.
    pub sender_email: String,
    pub session_id: String,
    pub subject: String,
    pub body: String,
    pub role: Role,
    pub received_at: DateTime<Utc>,
}

/// A message to be inserted. Normalized sender/subject columns are derived
/// by the backend at insert time so every stored row is merge-indexable.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub sender_email: String,
    pub session_id: String,
    pub subject: String,
    pub body: String,
    pub role: Role,
    pub received_at: DateTime<Utc>,
}

/// Result of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with this `message_id` already exists — nothing was written.
    Conflict,
}

/// Predicate for the retroactive merge: rows in a *different* session whose
/// canonical sender OR canonical subject matches the new message's.
#[derive(Debug, Clone)]
pub struct MergeFilter {
    pub sender_norm: String,
    pub subject_norm: String,
}

/// Backend-agnostic message store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Run all pending schema migrations. Idempotent.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Look up a message by its unique `message_id`.
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError>;

    /// Look up any message whose `message_id` OR `in_reply_to` equals `id`.
    ///
    /// Used by the poll loop's "already processed" check: a stored reply
    /// referencing `id` proves the original was handled even if the
    /// original's \Seen flag was lost.
    async fn find_by_message_or_reply_id(
        &self,
        id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError>;

    /// Insert a message. Returns `Conflict` (without writing) when a row
    /// with the same `message_id` already exists.
    async fn insert(&self, email: &NewEmail) -> Result<InsertOutcome, DatabaseError>;

    /// Rewrite `session_id` on every row matching `filter` that is not
    /// already in `new_session_id`, up to `limit` rows. Atomic: either all
    /// selected rows move or none do. Returns the number of rows moved.
    async fn reassign_sessions(
        &self,
        filter: &MergeFilter,
        new_session_id: &str,
        limit: u32,
    ) -> Result<u64, DatabaseError>;

    /// All stored messages, newest first.
    async fn list_all(&self) -> Result<Vec<EmailRecord>, DatabaseError>;
}
