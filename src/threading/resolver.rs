//! Conversation resolver — decides which session an incoming message joins.

use tracing::debug;

use crate::error::DatabaseError;
use crate::store::MessageStore;

/// Resolves an incoming message to an existing session, or `None` when the
/// caller must mint a new one.
pub struct ConversationResolver<'a> {
    store: &'a dyn MessageStore,
}

impl<'a> ConversationResolver<'a> {
    pub fn new(store: &'a dyn MessageStore) -> Self {
        Self { store }
    }

    /// Find the session an incoming message belongs to.
    ///
    /// Only an explicit, resolvable `in_reply_to` link joins an existing
    /// conversation here. Same-sender / same-subject heuristics are
    /// deliberately NOT applied at resolve time — they run in the
    /// retroactive merge after the message itself is stored, where they can
    /// be applied once over the whole table instead of twice (forward and
    /// backward) per message.
    pub async fn resolve(
        &self,
        sender_email: &str,
        subject: &str,
        in_reply_to: Option<&str>,
    ) -> Result<Option<String>, DatabaseError> {
        if let Some(reply_to) = in_reply_to
            && !reply_to.is_empty()
            && let Some(parent) = self.store.find_by_message_id(reply_to).await?
            && !parent.session_id.is_empty()
        {
            debug!(
                session_id = %parent.session_id,
                in_reply_to = %reply_to,
                "Resolved session from In-Reply-To"
            );
            return Ok(Some(parent.session_id));
        }

        debug!(
            sender = %sender_email,
            subject = %subject,
            "No resolvable thread reference — new conversation"
        );
        Ok(None)
    }
}
