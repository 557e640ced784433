//! Move a classified email, then stamp it with the idempotency tag.
//!
//! The two steps fail independently. A failed tag never undoes the move; it
//! is reported so the caller can surface it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::pipeline::types::{Email, OutcomeError};
use crate::retry::RetryPolicy;
use crate::store::MailboxStore;

/// Result of [`Mover::move_and_tag`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub moved: bool,
    pub tagged: bool,
    /// Id of the message after the move. Some stores re-key moved messages.
    pub new_id: Option<String>,
    /// Why the move failed.
    pub error: Option<OutcomeError>,
    /// Why tagging failed after a successful move.
    pub tag_error: Option<OutcomeError>,
}

pub struct Mover {
    store: Arc<dyn MailboxStore>,
    retry: RetryPolicy,
    tag: String,
}

impl Mover {
    pub fn new(store: Arc<dyn MailboxStore>, retry: RetryPolicy, tag: impl Into<String>) -> Self {
        Self {
            store,
            retry,
            tag: tag.into(),
        }
    }

    pub fn tag_name(&self) -> &str {
        &self.tag
    }

    pub async fn move_and_tag(&self, email: &Email, target_folder_id: &str) -> MoveReport {
        let new_id = match self.move_email(email, target_folder_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(id = %email.id, target = %target_folder_id, error = %e, "Move failed");
                return MoveReport {
                    error: Some(OutcomeError::new(e.code(), e.to_string())),
                    ..MoveReport::default()
                };
            }
        };

        if new_id != email.id {
            debug!(old_id = %email.id, new_id = %new_id, "Message re-keyed by move");
        }

        let mut report = MoveReport {
            moved: true,
            new_id: Some(new_id.clone()),
            ..MoveReport::default()
        };

        match self.tag(&new_id).await {
            Ok(()) => report.tagged = true,
            Err(e) => {
                warn!(
                    id = %new_id,
                    tag = %self.tag,
                    error = %e,
                    "Moved but could not tag; message may be picked up again"
                );
                report.tag_error = Some(OutcomeError::new(e.code(), e.to_string()));
            }
        }
        report
    }

    /// Move with retries. A `NotFound` on the direct path gets one more
    /// attempt addressed through the source folder.
    async fn move_email(&self, email: &Email, target: &str) -> Result<String, StoreError> {
        let store = &self.store;
        let direct = self
            .retry
            .run("move_message", || store.move_message(&email.id, target, None))
            .await;

        match direct {
            Err(StoreError::NotFound(reason)) if !email.folder_id.is_empty() => {
                info!(
                    id = %email.id,
                    via = %email.folder_id,
                    reason = %reason,
                    "Message not found by id, retrying through source folder"
                );
                let via = email.folder_id.as_str();
                self.retry
                    .run("move_message_via_folder", || {
                        store.move_message(&email.id, target, Some(via))
                    })
                    .await
            }
            other => other,
        }
    }

    /// Add the idempotency tag to one message, with retries.
    pub async fn tag(&self, message_id: &str) -> Result<(), StoreError> {
        let store = &self.store;
        let tag = self.tag.as_str();
        self.retry
            .run("tag_message", || store.tag_message(message_id, tag))
            .await
    }
}
