//! `MailboxStore` trait — the async interface to a remote mailbox.
//!
//! Every method reports failures through [`StoreError`], whose variants follow
//! the HTTP status taxonomy of the remote API. Retrying is the caller's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pipeline::types::Email;

/// A folder as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub id: String,
    pub name: String,
    /// `None` for top-level folders.
    pub parent: Option<String>,
}

/// Parameters for fetching candidate messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub folder_id: String,
    /// Also fetch from every descendant folder.
    pub include_subfolders: bool,
    /// Maximum number of messages returned.
    pub limit: usize,
    /// Skip messages already carrying this tag, when the store can filter server-side.
    pub exclude_tag: Option<String>,
    /// Leave out messages flagged for follow-up.
    pub skip_flagged: bool,
}

impl MessageQuery {
    pub fn new(folder_id: impl Into<String>, limit: usize) -> Self {
        Self {
            folder_id: folder_id.into(),
            include_subfolders: false,
            limit,
            exclude_tag: None,
            skip_flagged: false,
        }
    }

    pub fn with_subfolders(mut self, include: bool) -> Self {
        self.include_subfolders = include;
        self
    }

    pub fn excluding_tag(mut self, tag: impl Into<String>) -> Self {
        self.exclude_tag = Some(tag.into());
        self
    }

    pub fn skipping_flagged(mut self, skip: bool) -> Self {
        self.skip_flagged = skip;
        self
    }
}

/// Backend-agnostic mailbox store.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Fetch messages, newest first.
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Email>, StoreError>;

    /// List the direct children of `parent`, or the top-level folders for `None`.
    async fn list_folders(&self, parent: Option<&str>) -> Result<Vec<FolderEntry>, StoreError>;

    /// Create a folder. Returns `StoreError::Conflict` when a sibling already has that name.
    async fn create_folder(&self, parent: Option<&str>, name: &str) -> Result<FolderEntry, StoreError>;

    /// Move a message and return its id after the move.
    ///
    /// `via_folder` addresses the message through its source folder, for
    /// stores that cannot find it by id alone.
    async fn move_message(
        &self,
        message_id: &str,
        target_folder_id: &str,
        via_folder: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Add `tag` to a message, keeping the tags it already has.
    async fn tag_message(&self, message_id: &str, tag: &str) -> Result<(), StoreError>;
}
