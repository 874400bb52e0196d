//! Ingestion pipeline — dedupe, session assignment, retroactive merge.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::IngestError;
use crate::store::{InsertOutcome, MergeFilter, MessageStore, NewEmail, Role};
use crate::threading::address::{normalize_address, normalize_subject};
use crate::threading::resolver::ConversationResolver;

/// An email handed to the pipeline, already decoded to plain strings by the
/// transport. `message_id` and `sender_email` are required; everything else
/// is best-effort.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    pub sender_email: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    pub role: Role,
}

/// Orchestrates ingestion of a single message.
///
/// Ingestion is a short, non-interruptible unit of work: no internal
/// retries, no cancellation. Storage failures propagate so the polling
/// loop can decide whether to retry the message on a later cycle.
pub struct IngestionPipeline {
    store: Arc<dyn MessageStore>,
    merge_limit: u32,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn MessageStore>, merge_limit: u32) -> Self {
        Self { store, merge_limit }
    }

    /// Ingest one message and return the session it was filed under.
    ///
    /// Idempotent: re-delivering a message with a known `message_id`
    /// changes nothing and returns the previously assigned session. A
    /// message with no resolvable parent seeds a new conversation whose
    /// session id is the message's own `message_id`.
    pub async fn ingest(&self, mail: InboundEmail) -> Result<String, IngestError> {
        if mail.message_id.is_empty() {
            return Err(IngestError::MalformedInput("message_id"));
        }
        if mail.sender_email.is_empty() {
            return Err(IngestError::MalformedInput("sender_email"));
        }

        // Dedup: a re-delivered message (IMAP re-sync, delivery retry) is a
        // no-op and keeps its original session.
        if let Some(existing) = self.store.find_by_message_id(&mail.message_id).await? {
            debug!(
                message_id = %mail.message_id,
                session_id = %existing.session_id,
                "Message already stored — skipping"
            );
            return Ok(existing.session_id);
        }

        let resolver = ConversationResolver::new(self.store.as_ref());
        let resolved = resolver
            .resolve(&mail.sender_email, &mail.subject, mail.in_reply_to.as_deref())
            .await?;

        let session_id = match resolved {
            Some(session) => session,
            None => {
                info!(session_id = %mail.message_id, "Seeding new conversation");
                mail.message_id.clone()
            }
        };

        let outcome = self
            .store
            .insert(&NewEmail {
                message_id: mail.message_id.clone(),
                in_reply_to: mail.in_reply_to.clone(),
                sender_email: mail.sender_email.clone(),
                session_id: session_id.clone(),
                subject: mail.subject.clone(),
                body: mail.body,
                role: mail.role,
                received_at: Utc::now(),
            })
            .await?;

        if outcome == InsertOutcome::Conflict {
            // Lost a race against a concurrent ingestion of the same
            // message_id. The winner's row is authoritative; report its
            // session, same as the dedup path.
            let winner = self
                .store
                .find_by_message_id(&mail.message_id)
                .await?
                .ok_or_else(|| {
                    crate::error::DatabaseError::NotFound {
                        entity: "email".to_string(),
                        id: mail.message_id.clone(),
                    }
                })?;
            debug!(
                message_id = %mail.message_id,
                session_id = %winner.session_id,
                "Concurrent insert — treating as duplicate"
            );
            return Ok(winner.session_id);
        }

        // Retroactive merge, inbound mail only. Outbound replies never
        // trigger it, otherwise every auto-reply from our own address would
        // drag unrelated conversations together.
        if mail.role == Role::User {
            let filter = MergeFilter {
                sender_norm: normalize_address(&mail.sender_email),
                subject_norm: normalize_subject(&mail.subject),
            };
            let moved = self
                .store
                .reassign_sessions(&filter, &session_id, self.merge_limit)
                .await?;
            if moved > 0 {
                info!(
                    moved,
                    session_id = %session_id,
                    "Merged prior messages into session"
                );
            }
        }

        Ok(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::LibSqlBackend;

    async fn pipeline() -> (IngestionPipeline, Arc<dyn MessageStore>) {
        let store: Arc<dyn MessageStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (IngestionPipeline::new(Arc::clone(&store), 500), store)
    }

    fn mail(
        sender: &str,
        message_id: &str,
        in_reply_to: Option<&str>,
        subject: &str,
        role: Role,
    ) -> InboundEmail {
        InboundEmail {
            sender_email: sender.to_string(),
            message_id: message_id.to_string(),
            in_reply_to: in_reply_to.map(str::to_string),
            subject: subject.to_string(),
            body: "body".to_string(),
            role,
        }
    }

    #[tokio::test]
    async fn new_message_seeds_its_own_session() {
        let (pipeline, _) = pipeline().await;
        let session = pipeline
            .ingest(mail("a@x.com", "M1", None, "Hi", Role::User))
            .await
            .unwrap();
        assert_eq!(session, "M1");
    }

    #[tokio::test]
    async fn ingest_is_idempotent() {
        let (pipeline, store) = pipeline().await;

        let first = pipeline
            .ingest(mail("a@x.com", "M1", None, "Hi", Role::User))
            .await
            .unwrap();
        let second = pipeline
            .ingest(mail("a@x.com", "M1", None, "Hi", Role::User))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reply_joins_parent_session() {
        let (pipeline, _) = pipeline().await;

        pipeline
            .ingest(mail("a@x.com", "M1", None, "Hi", Role::User))
            .await
            .unwrap();
        let session = pipeline
            .ingest(mail("b@x.com", "M2", Some("M1"), "Re: Hi", Role::Host))
            .await
            .unwrap();

        assert_eq!(session, "M1");
    }

    #[tokio::test]
    async fn sender_match_merges_earlier_conversation() {
        let (pipeline, store) = pipeline().await;

        pipeline
            .ingest(mail("alice@x.com", "M1", None, "First question", Role::User))
            .await
            .unwrap();

        // Same sender, dangling reply reference, unrelated subject: a new
        // session is seeded, then M1 is pulled into it.
        let session = pipeline
            .ingest(mail(
                "alice@x.com",
                "M3",
                Some("not-in-store"),
                "Something else",
                Role::User,
            ))
            .await
            .unwrap();
        assert_eq!(session, "M3");

        let m1 = store.find_by_message_id("M1").await.unwrap().unwrap();
        let m3 = store.find_by_message_id("M3").await.unwrap().unwrap();
        assert_eq!(m1.session_id, "M3");
        assert_eq!(m3.session_id, "M3");
    }

    #[tokio::test]
    async fn subject_match_merges_across_senders() {
        let (pipeline, store) = pipeline().await;

        pipeline
            .ingest(mail("a@x.com", "M1", None, "Order issue", Role::User))
            .await
            .unwrap();
        let session = pipeline
            .ingest(mail("b@y.com", "M2", None, "Re: Order issue", Role::User))
            .await
            .unwrap();
        assert_eq!(session, "M2");

        let m1 = store.find_by_message_id("M1").await.unwrap().unwrap();
        assert_eq!(m1.session_id, "M2");
    }

    #[tokio::test]
    async fn host_messages_never_trigger_merge() {
        let (pipeline, store) = pipeline().await;

        pipeline
            .ingest(mail("alice@x.com", "M1", None, "Hi", Role::User))
            .await
            .unwrap();

        // Host-authored message with a matching sender and subject but no
        // reply link: seeds its own session and leaves M1 alone.
        let session = pipeline
            .ingest(mail("alice@x.com", "M2", None, "Hi", Role::Host))
            .await
            .unwrap();
        assert_eq!(session, "M2");

        let m1 = store.find_by_message_id("M1").await.unwrap().unwrap();
        assert_eq!(m1.session_id, "M1");
    }

    #[tokio::test]
    async fn display_name_senders_still_merge() {
        let (pipeline, store) = pipeline().await;

        pipeline
            .ingest(mail(
                "Alice <alice@X.com>",
                "M1",
                None,
                "Invoice",
                Role::User,
            ))
            .await
            .unwrap();
        pipeline
            .ingest(mail("alice@x.com", "M2", None, "Totally new", Role::User))
            .await
            .unwrap();

        let m1 = store.find_by_message_id("M1").await.unwrap().unwrap();
        assert_eq!(m1.session_id, "M2");
    }

    #[tokio::test]
    async fn missing_message_id_is_rejected() {
        let (pipeline, store) = pipeline().await;
        let err = pipeline
            .ingest(mail("a@x.com", "", None, "Hi", Role::User))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MalformedInput("message_id")));
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_sender_is_rejected() {
        let (pipeline, _) = pipeline().await;
        let err = pipeline
            .ingest(mail("", "M1", None, "Hi", Role::User))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MalformedInput("sender_email")));
    }

    #[tokio::test]
    async fn redelivery_keeps_merged_session() {
        let (pipeline, _) = pipeline().await;

        pipeline
            .ingest(mail("alice@x.com", "M1", None, "Hi", Role::User))
            .await
            .unwrap();
        pipeline
            .ingest(mail("alice@x.com", "M2", None, "Other", Role::User))
            .await
            .unwrap();

        // M1 was merged into M2's session; a re-delivery of M1 must report
        // the merged session, not the original seed.
        let session = pipeline
            .ingest(mail("alice@x.com", "M1", None, "Hi", Role::User))
            .await
            .unwrap();
        assert_eq!(session, "M2");
    }
}
