//! libSQL backend — async `MessageStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    EmailRecord, InsertOutcome, MergeFilter, MessageStore, NewEmail, Role,
};
use crate::threading::address::{normalize_address, normalize_subject};

/// libSQL message store.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Parse a role string from the DB.
fn str_to_role(s: &str) -> Role {
    match s {
        "host" => Role::Host,
        _ => Role::User,
    }
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to an EmailRecord.
///
/// Column order matches EMAIL_COLUMNS:
/// 0:id, 1:message_id, 2:in_reply_to, 3:sender_email, 4:session_id,
/// 5:subject, 6:body, 7:role, 8:received_at
fn row_to_email(row: &libsql::Row) -> Result<EmailRecord, libsql::Error> {
    let role_str: String = row.get(7)?;
    let received_str: String = row.get(8)?;

    Ok(EmailRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        in_reply_to: row.get::<String>(2).ok(),
        sender_email: row.get(3)?,
        session_id: row.get(4)?,
        subject: row.get(5)?,
        body: row.get(6)?,
        role: str_to_role(&role_str),
        received_at: parse_datetime(&received_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const EMAIL_COLUMNS: &str =
    "id, message_id, in_reply_to, sender_email, session_id, subject, body, role, received_at";

#[async_trait]
impl MessageStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let email = row_to_email(&row)
                    .map_err(|e| DatabaseError::Query(format!("find_by_message_id row parse: {e}")))?;
                Ok(Some(email))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_message_id: {e}"))),
        }
    }

    async fn find_by_message_or_reply_id(
        &self,
        id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails WHERE message_id = ?1 OR in_reply_to = ?1 LIMIT 1"
                ),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_message_or_reply_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let email = row_to_email(&row).map_err(|e| {
                    DatabaseError::Query(format!("find_by_message_or_reply_id row parse: {e}"))
                })?;
                Ok(Some(email))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_by_message_or_reply_id: {e}"
            ))),
        }
    }

    async fn insert(&self, email: &NewEmail) -> Result<InsertOutcome, DatabaseError> {
        let conn = self.conn();

        // INSERT OR IGNORE + affected-row count turns the UNIQUE constraint
        // on message_id into a conflict signal instead of an error. Two
        // concurrent inserts of the same message_id leave exactly one row;
        // the loser sees Conflict.
        let affected = conn
            .execute(
                "INSERT OR IGNORE INTO emails
                    (message_id, in_reply_to, sender_email, sender_norm, session_id,
                     subject, subject_norm, body, role, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    email.message_id.as_str(),
                    opt_text(email.in_reply_to.as_deref()),
                    email.sender_email.as_str(),
                    normalize_address(&email.sender_email),
                    email.session_id.as_str(),
                    email.subject.as_str(),
                    normalize_subject(&email.subject),
                    email.body.as_str(),
                    email.role.as_str(),
                    email.received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert: {e}")))?;

        if affected == 0 {
            debug!(message_id = %email.message_id, "Insert skipped — message already stored");
            return Ok(InsertOutcome::Conflict);
        }

        debug!(
            message_id = %email.message_id,
            session_id = %email.session_id,
            "Email inserted"
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn reassign_sessions(
        &self,
        filter: &MergeFilter,
        new_session_id: &str,
        limit: u32,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn();

        // Single UPDATE statement, atomic in SQLite. The rowid subselect
        // caps the number of rows rewritten per call (see INBOXD_MERGE_LIMIT).
        let moved = conn
            .execute(
                "UPDATE emails SET session_id = ?1
                  WHERE id IN (
                      SELECT id FROM emails
                       WHERE session_id != ?1
                         AND (sender_norm = ?2 OR subject_norm = ?3)
                       LIMIT ?4
                  )",
                params![
                    new_session_id,
                    filter.sender_norm.as_str(),
                    filter.subject_norm.as_str(),
                    limit as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reassign_sessions: {e}")))?;

        Ok(moved)
    }

    async fn list_all(&self) -> Result<Vec<EmailRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails ORDER BY received_at DESC, id DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_all: {e}")))?;

        let mut emails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_email(&row) {
                Ok(email) => emails.push(email),
                Err(e) => {
                    tracing::warn!("Skipping email row: {e}");
                }
            }
        }
        Ok(emails)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_email(message_id: &str, sender: &str, subject: &str, session: &str) -> NewEmail {
        NewEmail {
            message_id: message_id.to_string(),
            in_reply_to: None,
            sender_email: sender.to_string(),
            session_id: session.to_string(),
            subject: subject.to_string(),
            body: "body".to_string(),
            role: Role::User,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_then_find() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let outcome = store
            .insert(&new_email("m1", "Alice <alice@x.com>", "Hi", "m1"))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let found = store.find_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(found.message_id, "m1");
        assert_eq!(found.sender_email, "Alice <alice@x.com>");
        assert_eq!(found.session_id, "m1");
        assert_eq!(found.role, Role::User);
    }

    #[tokio::test]
    async fn duplicate_insert_is_conflict() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store
            .insert(&new_email("m1", "a@x.com", "Hi", "m1"))
            .await
            .unwrap();

        let outcome = store
            .insert(&new_email("m1", "b@y.com", "Other", "other"))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Conflict);

        // The original row is untouched.
        let found = store.find_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(found.sender_email, "a@x.com");
        assert_eq!(found.session_id, "m1");
    }

    #[tokio::test]
    async fn find_by_message_or_reply_id_matches_replies() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut reply = new_email("m2", "bot@x.com", "Re: Hi", "m1");
        reply.in_reply_to = Some("m1".to_string());
        reply.role = Role::Host;
        store.insert(&reply).await.unwrap();

        // "m1" itself was never stored, but a reply referencing it was.
        let found = store.find_by_message_or_reply_id("m1").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().message_id, "m2");

        assert!(
            store
                .find_by_message_or_reply_id("m9")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn reassign_by_normalized_sender() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store
            .insert(&new_email("m1", "Alice <alice@X.com>", "First", "m1"))
            .await
            .unwrap();
        store
            .insert(&new_email("m2", "bob@y.com", "Other", "m2"))
            .await
            .unwrap();

        let filter = MergeFilter {
            sender_norm: "alice@x.com".to_string(),
            subject_norm: "unrelated".to_string(),
        };
        let moved = store.reassign_sessions(&filter, "m3", 500).await.unwrap();
        assert_eq!(moved, 1);

        assert_eq!(
            store.find_by_message_id("m1").await.unwrap().unwrap().session_id,
            "m3"
        );
        assert_eq!(
            store.find_by_message_id("m2").await.unwrap().unwrap().session_id,
            "m2"
        );
    }

    #[tokio::test]
    async fn reassign_by_normalized_subject() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store
            .insert(&new_email("m1", "a@x.com", "Order issue", "m1"))
            .await
            .unwrap();

        let filter = MergeFilter {
            sender_norm: "someone-else@z.com".to_string(),
            subject_norm: "order issue".to_string(),
        };
        let moved = store.reassign_sessions(&filter, "m2", 500).await.unwrap();
        assert_eq!(moved, 1);
    }

    #[tokio::test]
    async fn reassign_respects_row_cap() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        for i in 0..5 {
            store
                .insert(&new_email(
                    &format!("m{i}"),
                    "alice@x.com",
                    &format!("Subject {i}"),
                    &format!("m{i}"),
                ))
                .await
                .unwrap();
        }

        let filter = MergeFilter {
            sender_norm: "alice@x.com".to_string(),
            subject_norm: "nope".to_string(),
        };
        let moved = store.reassign_sessions(&filter, "target", 3).await.unwrap();
        assert_eq!(moved, 3);

        let in_target = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.session_id == "target")
            .count();
        assert_eq!(in_target, 3);
    }

    #[tokio::test]
    async fn reassign_skips_rows_already_in_session() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store
            .insert(&new_email("m1", "alice@x.com", "Hi", "s1"))
            .await
            .unwrap();

        let filter = MergeFilter {
            sender_norm: "alice@x.com".to_string(),
            subject_norm: "hi".to_string(),
        };
        let moved = store.reassign_sessions(&filter, "s1", 500).await.unwrap();
        assert_eq!(moved, 0);
    }

    #[tokio::test]
    async fn list_all_is_newest_first() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut first = new_email("m1", "a@x.com", "One", "m1");
        first.received_at = Utc::now() - chrono::Duration::minutes(5);
        store.insert(&first).await.unwrap();
        store
            .insert(&new_email("m2", "b@y.com", "Two", "m2"))
            .await
            .unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message_id, "m2");
        assert_eq!(all[1].message_id, "m1");
    }
}
