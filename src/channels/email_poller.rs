//! Background mail poller — fetches unseen emails, runs them through the
//! ingestion pipeline, sends an auto-reply, and records the reply.
//!
//! Per poll cycle:
//! 1. Fetch unseen emails via IMAP (BODY.PEEK — nothing is flagged yet)
//! 2. Skip self-sent mail and senders outside the allowlist
//! 3. Skip messages the store has already processed
//! 4. Ingest the message, generate a reply, send it, ingest the reply
//! 5. Mark handled messages \Seen
//!
//! A failure on one message is logged and never halts the rest of the
//! batch; unflagged messages are retried on the next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::email::{
    self, EmailConfig, FetchedEmail, is_sender_allowed, make_reply_message_id,
};
use crate::error::{ChannelError, Error};
use crate::llm::OllamaClient;
use crate::store::{MessageStore, Role};
use crate::templates::Templates;
use crate::threading::address::normalize_address;
use crate::threading::{InboundEmail, IngestionPipeline};

/// Dependencies shared by the poll loop.
pub struct PollerDeps {
    pub store: Arc<dyn MessageStore>,
    pub pipeline: Arc<IngestionPipeline>,
    pub llm: Arc<OllamaClient>,
    pub templates: Arc<Templates>,
}

/// Spawn the background poll task.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_email_poller(
    config: EmailConfig,
    deps: PollerDeps,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Email poller started — polling every {}s on {}",
            config.poll_interval_secs, config.imap_host
        );

        let mut tick = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Email poller shutting down");
                return;
            }

            poll_once(&config, &deps).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run a single poll cycle.
async fn poll_once(config: &EmailConfig, deps: &PollerDeps) {
    let cfg = config.clone();
    let fetch_result = tokio::task::spawn_blocking(move || email::fetch_unseen_imap(&cfg)).await;

    let messages = match fetch_result {
        Ok(Ok(msgs)) => msgs,
        Ok(Err(e)) => {
            error!("Email poll failed: {e}");
            return;
        }
        Err(e) => {
            error!("Email poll task panicked: {e}");
            return;
        }
    };

    if messages.is_empty() {
        return;
    }

    debug!("Fetched {} unseen email(s)", messages.len());

    let mut uids_to_mark: Vec<String> = Vec::new();

    for mail in &messages {
        let sender_addr = normalize_address(&mail.sender);

        // Self-loop prevention
        if sender_addr.eq_ignore_ascii_case(&config.from_address) {
            debug!(sender = %mail.sender, "Skipping self-sent email");
            uids_to_mark.push(mail.uid.clone());
            continue;
        }

        // Allowlist check
        if !is_sender_allowed(&config.allowed_senders, &sender_addr) {
            warn!("Blocked email from {sender_addr}");
            uids_to_mark.push(mail.uid.clone());
            continue;
        }

        // Already processed: either this message_id is stored, or a stored
        // reply references it.
        match deps.store.find_by_message_or_reply_id(&mail.message_id).await {
            Ok(Some(_)) => {
                debug!(message_id = %mail.message_id, "Email already processed");
                uids_to_mark.push(mail.uid.clone());
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                // Leave unseen; the store may be back on the next cycle.
                error!(message_id = %mail.message_id, error = %e, "Processed-check failed");
                continue;
            }
        }

        match process_message(config, deps, mail).await {
            Ok(session_id) => {
                info!(
                    message_id = %mail.message_id,
                    session_id = %session_id,
                    "Email processed and replied"
                );
                uids_to_mark.push(mail.uid.clone());
            }
            Err(e) => {
                // One bad message must not halt the batch.
                error!(message_id = %mail.message_id, error = %e, "Failed to process email");
            }
        }
    }

    if !uids_to_mark.is_empty() {
        let cfg = config.clone();
        let uids = uids_to_mark;
        match tokio::task::spawn_blocking(move || email::mark_seen_imap(&cfg, &uids)).await {
            Ok(Err(e)) => warn!("Failed to mark emails as seen: {e}"),
            Err(e) => warn!("Mark-seen task panicked: {e}"),
            Ok(Ok(())) => {}
        }
    }
}

/// Ingest one inbound email, send the auto-reply, and record the reply.
///
/// Returns the session the inbound message was filed under.
async fn process_message(
    config: &EmailConfig,
    deps: &PollerDeps,
    mail: &FetchedEmail,
) -> Result<String, Error> {
    let session_id = deps
        .pipeline
        .ingest(InboundEmail {
            sender_email: mail.sender.clone(),
            message_id: mail.message_id.clone(),
            in_reply_to: mail.in_reply_to.clone(),
            subject: mail.subject.clone(),
            body: mail.body.clone(),
            role: Role::User,
        })
        .await?;

    let reply_body = deps
        .llm
        .generate_reply(&deps.templates, &mail.sender, &mail.subject, &mail.body)
        .await;

    let reply_subject = if mail.subject.starts_with("Re:") {
        mail.subject.clone()
    } else {
        format!("Re: {}", mail.subject)
    };

    let reply_message_id = make_reply_message_id(&config.from_address);

    // Thread the reply under the same reference the sender used, so clients
    // that already grouped the thread keep it together.
    let thread_target = mail
        .in_reply_to
        .clone()
        .unwrap_or_else(|| mail.message_id.clone());

    let cfg = config.clone();
    let to = normalize_address(&mail.sender);
    let subject = reply_subject.clone();
    let body = reply_body.clone();
    let msg_id = reply_message_id.clone();
    let target = thread_target.clone();
    tokio::task::spawn_blocking(move || {
        email::send_reply(&cfg, &to, &subject, &body, &msg_id, &target)
    })
    .await
    .map_err(|e| ChannelError::SendFailed {
        name: "smtp".into(),
        reason: format!("send task panicked: {e}"),
    })??;

    // Record the outbound reply in the same conversation. Host role keeps
    // it out of the retroactive merge.
    let clean_reply_id = reply_message_id
        .trim_matches(|c| c == '<' || c == '>')
        .to_string();
    deps.pipeline
        .ingest(InboundEmail {
            sender_email: config.from_address.clone(),
            message_id: clean_reply_id,
            in_reply_to: Some(mail.message_id.clone()),
            subject: reply_subject,
            body: reply_body,
            role: Role::Host,
        })
        .await?;

    Ok(session_id)
}
