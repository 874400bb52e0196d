//! Read-only HTTP API — a projection over the store, no threading logic.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::store::{EmailRecord, MessageStore, Role};

/// Number of log lines returned by `GET /logs`.
const LOG_TAIL_LINES: usize = 100;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn MessageStore>,
    pub log_path: PathBuf,
}

/// Wire representation of a stored email.
#[derive(Debug, Serialize)]
struct EmailView {
    sender_email: String,
    session_id: String,
    message_id: String,
    in_reply_to: Option<String>,
    subject: String,
    message: String,
    role: Role,
    received_at: String,
}

impl From<EmailRecord> for EmailView {
    fn from(record: EmailRecord) -> Self {
        Self {
            sender_email: record.sender_email,
            session_id: record.session_id,
            message_id: record.message_id,
            in_reply_to: record.in_reply_to,
            subject: record.subject,
            message: record.body,
            role: record.role,
            received_at: record.received_at.to_rfc3339(),
        }
    }
}

/// GET /emails
///
/// All stored messages, newest first.
async fn list_emails(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_all().await {
        Ok(records) => {
            let emails: Vec<EmailView> = records.into_iter().map(EmailView::from).collect();
            Json(emails).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to list emails");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": format!("Failed to fetch emails: {e}")})),
            )
                .into_response()
        }
    }
}

/// GET /logs
///
/// The most recent log lines from the daemon's log file.
async fn tail_logs(State(state): State<ApiState>) -> impl IntoResponse {
    match read_log_tail(&state.log_path, LOG_TAIL_LINES) {
        Ok(lines) => Json(serde_json::json!({"logs": lines})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Error retrieving logs: {e}")})),
        )
            .into_response(),
    }
}

/// Read the last `n` lines of a log file.
pub fn read_log_tail(path: &std::path::Path, n: usize) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].to_vec())
}

/// Build the API router.
pub fn api_routes(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/emails", get(list_emails))
        .route("/logs", get(tail_logs))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use chrono::Utc;

    #[test]
    fn email_view_serializes_expected_fields() {
        let view = EmailView::from(EmailRecord {
            id: 1,
            message_id: "m1".to_string(),
            in_reply_to: None,
            sender_email: "Alice <alice@x.com>".to_string(),
            session_id: "m1".to_string(),
            subject: "Hi".to_string(),
            body: "hello".to_string(),
            role: Role::User,
            received_at: Utc::now(),
        });

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["message_id"], "m1");
        assert_eq!(json["role"], "user");
        assert_eq!(json["message"], "hello");
        assert!(json["in_reply_to"].is_null());
    }

    #[test]
    fn log_tail_returns_last_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..150 {
            writeln!(file, "line {i}").unwrap();
        }

        let lines = read_log_tail(file.path(), 100).unwrap();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[0], "line 50");
        assert_eq!(lines[99], "line 149");
    }

    #[test]
    fn log_tail_short_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "only line").unwrap();

        let lines = read_log_tail(file.path(), 100).unwrap();
        assert_eq!(lines, vec!["only line"]);
    }

    #[test]
    fn log_tail_missing_file_is_error() {
        assert!(read_log_tail(std::path::Path::new("/nonexistent.log"), 100).is_err());
    }
}
