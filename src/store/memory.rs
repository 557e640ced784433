//! In-memory mailbox used by tests and local dry runs.
//!
//! Supports scripted failures per operation and keeps call counters so tests
//! can assert on exactly which remote calls happened.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::Email;
use crate::store::traits::{FolderEntry, MailboxStore, MessageQuery};

/// Id of the folder every new mailbox starts with.
pub const INBOX_ID: &str = "inbox";

/// Store operations, for failure injection and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListMessages,
    ListFolders,
    CreateFolder,
    Move,
    Tag,
}

/// Number of calls made per operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list_messages: usize,
    pub list_folders: usize,
    pub create_folder: usize,
    pub moves: usize,
    pub tags: usize,
}

#[derive(Default)]
struct State {
    folders: Vec<FolderEntry>,
    messages: Vec<Email>,
    /// One-shot failures, consumed in order.
    scripted: HashMap<StoreOp, VecDeque<StoreError>>,
    /// Messages whose moves always fail.
    poisoned_moves: HashMap<String, StoreError>,
    /// Messages whose tags always fail.
    poisoned_tags: HashMap<String, StoreError>,
    /// Messages only reachable through their source folder.
    folder_scoped: HashSet<String>,
    rekey_on_move: bool,
    /// Ignore `exclude_tag` and `skip_flagged` when listing.
    unfiltered_listing: bool,
    calls: CallCounts,
}

impl State {
    fn take_scripted(&mut self, op: StoreOp) -> Option<StoreError> {
        self.scripted.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn folder(&self, id: &str) -> Option<&FolderEntry> {
        self.folders.iter().find(|f| f.id == id)
    }

    fn descendants(&self, root: &str) -> Vec<String> {
        let mut out = vec![root.to_string()];
        let mut i = 0;
        while i < out.len() {
            let parent = out[i].clone();
            out.extend(
                self.folders
                    .iter()
                    .filter(|f| f.parent.as_deref() == Some(parent.as_str()))
                    .map(|f| f.id.clone()),
            );
            i += 1;
        }
        out
    }
}

/// Mailbox held entirely in memory.
pub struct InMemoryMailbox {
    state: Mutex<State>,
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMailbox {
    /// New mailbox containing only a top-level `Inbox` with id [`INBOX_ID`].
    pub fn new() -> Self {
        let state = State {
            folders: vec![FolderEntry {
                id: INBOX_ID.to_string(),
                name: "Inbox".to_string(),
                parent: None,
            }],
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Seeding ─────────────────────────────────────────────────────

    /// Add a folder directly, bypassing conflict checks. Returns its id.
    pub fn add_folder(&self, parent: Option<&str>, name: &str) -> String {
        let id = format!("folder-{}", Uuid::new_v4());
        self.lock().folders.push(FolderEntry {
            id: id.clone(),
            name: name.to_string(),
            parent: parent.map(str::to_string),
        });
        id
    }

    /// Add a message. Its `folder_id` decides where it lives.
    pub fn add_email(&self, email: Email) {
        self.lock().messages.push(email);
    }

    /// Give moved messages a fresh id, as some stores do.
    pub fn set_rekey_on_move(&self, rekey: bool) {
        self.lock().rekey_on_move = rekey;
    }

    /// Return every message in scope regardless of the query's tag and flag
    /// filters, like stores that cannot filter server-side.
    pub fn set_unfiltered_listing(&self, unfiltered: bool) {
        self.lock().unfiltered_listing = unfiltered;
    }

    // ── Failure injection ───────────────────────────────────────────

    /// Fail the next call of `op` with `error`. Calls queue up in order.
    pub fn inject_failure(&self, op: StoreOp, error: StoreError) {
        self.lock().scripted.entry(op).or_default().push_back(error);
    }

    /// Fail every move of `message_id`.
    pub fn fail_moves_for(&self, message_id: &str, error: StoreError) {
        self.lock()
            .poisoned_moves
            .insert(message_id.to_string(), error);
    }

    /// Fail every tag of `message_id` (the id after any move).
    pub fn fail_tags_for(&self, message_id: &str, error: StoreError) {
        self.lock().poisoned_tags.insert(message_id.to_string(), error);
    }

    /// Make direct moves of `message_id` return `NotFound`; only moves through
    /// the source folder succeed.
    pub fn require_source_folder(&self, message_id: &str) {
        self.lock().folder_scoped.insert(message_id.to_string());
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn calls(&self) -> CallCounts {
        self.lock().calls.clone()
    }

    pub fn folders(&self) -> Vec<FolderEntry> {
        self.lock().folders.clone()
    }

    pub fn email(&self, id: &str) -> Option<Email> {
        self.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// Messages directly inside `folder_id`.
    pub fn emails_in(&self, folder_id: &str) -> Vec<Email> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.folder_id == folder_id)
            .cloned()
            .collect()
    }

    /// Resolve a `/`-separated path of display names from the root (case-insensitive).
    pub fn folder_id_by_path(&self, path: &str) -> Option<String> {
        let state = self.lock();
        let mut parent: Option<String> = None;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let next = state.folders.iter().find(|f| {
                f.parent == parent && f.name.eq_ignore_ascii_case(segment)
            })?;
            parent = Some(next.id.clone());
        }
        parent
    }
}

#[async_trait]
impl MailboxStore for InMemoryMailbox {
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Email>, StoreError> {
        let mut state = self.lock();
        state.calls.list_messages += 1;
        if let Some(e) = state.take_scripted(StoreOp::ListMessages) {
            return Err(e);
        }
        if state.folder(&query.folder_id).is_none() {
            return Err(StoreError::NotFound(format!("folder {}", query.folder_id)));
        }

        let scope: HashSet<String> = if query.include_subfolders {
            state.descendants(&query.folder_id).into_iter().collect()
        } else {
            HashSet::from([query.folder_id.clone()])
        };

        let filtered = !state.unfiltered_listing;
        let mut messages: Vec<Email> = state
            .messages
            .iter()
            .filter(|m| scope.contains(&m.folder_id))
            .filter(|m| !filtered || query.exclude_tag.as_deref().is_none_or(|t| !m.has_tag(t)))
            .filter(|m| !(filtered && query.skip_flagged && m.flagged))
            .cloned()
            .collect();
        messages.sort_by_key(|m| std::cmp::Reverse(m.received_at.unwrap_or(DateTime::<Utc>::MIN_UTC)));
        messages.truncate(query.limit);
        Ok(messages)
    }

    async fn list_folders(&self, parent: Option<&str>) -> Result<Vec<FolderEntry>, StoreError> {
        let mut state = self.lock();
        state.calls.list_folders += 1;
        if let Some(e) = state.take_scripted(StoreOp::ListFolders) {
            return Err(e);
        }
        if let Some(p) = parent
            && state.folder(p).is_none()
        {
            return Err(StoreError::NotFound(format!("folder {p}")));
        }
        Ok(state
            .folders
            .iter()
            .filter(|f| f.parent.as_deref() == parent)
            .cloned()
            .collect())
    }

    async fn create_folder(&self, parent: Option<&str>, name: &str) -> Result<FolderEntry, StoreError> {
        let mut state = self.lock();
        state.calls.create_folder += 1;
        if let Some(e) = state.take_scripted(StoreOp::CreateFolder) {
            return Err(e);
        }
        if let Some(p) = parent
            && state.folder(p).is_none()
        {
            return Err(StoreError::NotFound(format!("folder {p}")));
        }
        if state
            .folders
            .iter()
            .any(|f| f.parent.as_deref() == parent && f.name.eq_ignore_ascii_case(name))
        {
            return Err(StoreError::Conflict(format!("folder {name} already exists")));
        }

        let entry = FolderEntry {
            id: format!("folder-{}", Uuid::new_v4()),
            name: name.to_string(),
            parent: parent.map(str::to_string),
        };
        state.folders.push(entry.clone());
        Ok(entry)
    }

    async fn move_message(
        &self,
        message_id: &str,
        target_folder_id: &str,
        via_folder: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut state = self.lock();
        state.calls.moves += 1;
        if let Some(e) = state.take_scripted(StoreOp::Move) {
            return Err(e);
        }
        if let Some(e) = state.poisoned_moves.get(message_id) {
            return Err(e.clone());
        }
        if via_folder.is_none() && state.folder_scoped.contains(message_id) {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        if state.folder(target_folder_id).is_none() {
            return Err(StoreError::NotFound(format!("folder {target_folder_id}")));
        }

        let rekey = state.rekey_on_move;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && via_folder.is_none_or(|f| m.folder_id == f))
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

        message.folder_id = target_folder_id.to_string();
        if rekey {
            message.id = format!("{message_id}-{}", Uuid::new_v4().simple());
        }
        Ok(message.id.clone())
    }

    async fn tag_message(&self, message_id: &str, tag: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.tags += 1;
        if let Some(e) = state.take_scripted(StoreOp::Tag) {
            return Err(e);
        }
        if let Some(e) = state.poisoned_tags.get(message_id) {
            return Err(e.clone());
        }
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if !message.has_tag(tag) {
            message.tags.push(tag.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::EmailBody;
    use chrono::TimeZone;

    fn email(id: &str, folder: &str, minute: u32) -> Email {
        Email {
            id: id.into(),
            subject: format!("Subject {id}"),
            sender: "a@example.com".into(),
            from: "a@example.com".into(),
            body: EmailBody::text("hi"),
            received_at: Utc.with_ymd_and_hms(2026, 1, 1, 9, minute, 0).single(),
            importance: "normal".into(),
            tags: vec![],
            flagged: false,
            folder_id: folder.into(),
        }
    }

    #[tokio::test]
    async fn lists_newest_first_with_limit() {
        let store = InMemoryMailbox::new();
        store.add_email(email("old", INBOX_ID, 1));
        store.add_email(email("new", INBOX_ID, 30));
        store.add_email(email("mid", INBOX_ID, 10));

        let got = store.list_messages(&MessageQuery::new(INBOX_ID, 2)).await.unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid"]);
    }

    #[tokio::test]
    async fn exclude_tag_and_subfolders() {
        let store = InMemoryMailbox::new();
        let child = store.add_folder(Some(INBOX_ID), "Child");
        let mut tagged = email("tagged", INBOX_ID, 1);
        tagged.tags.push("Categorized".into());
        store.add_email(tagged);
        store.add_email(email("nested", &child, 2));

        let query = MessageQuery::new(INBOX_ID, 10).excluding_tag("categorized");
        assert!(store.list_messages(&query).await.unwrap().is_empty());

        let query = query.with_subfolders(true);
        let got = store.list_messages(&query).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "nested");
    }

    #[tokio::test]
    async fn skip_flagged_leaves_out_flagged_mail() {
        let store = InMemoryMailbox::new();
        let mut flagged = email("flagged", INBOX_ID, 5);
        flagged.flagged = true;
        store.add_email(flagged);
        store.add_email(email("plain", INBOX_ID, 1));

        let query = MessageQuery::new(INBOX_ID, 10);
        assert_eq!(store.list_messages(&query).await.unwrap().len(), 2);

        let got = store.list_messages(&query.skipping_flagged(true)).await.unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["plain"]);
    }

    #[tokio::test]
    async fn create_folder_conflicts_on_sibling_name() {
        let store = InMemoryMailbox::new();
        store.create_folder(None, "Boss").await.unwrap();
        let err = store.create_folder(None, "boss").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // Same name under a different parent is fine.
        store.create_folder(Some(INBOX_ID), "Boss").await.unwrap();
    }

    #[tokio::test]
    async fn move_and_tag() {
        let store = InMemoryMailbox::new();
        let target = store.add_folder(None, "Boss");
        store.add_email(email("m1", INBOX_ID, 1));

        let new_id = store.move_message("m1", &target, None).await.unwrap();
        assert_eq!(new_id, "m1");
        store.tag_message(&new_id, "Categorized").await.unwrap();
        store.tag_message(&new_id, "Categorized").await.unwrap();

        let moved = store.email("m1").unwrap();
        assert_eq!(moved.folder_id, target);
        assert_eq!(moved.tags, ["Categorized"]);
        assert_eq!(store.calls().moves, 1);
        assert_eq!(store.calls().tags, 2);
    }

    #[tokio::test]
    async fn rekey_on_move_changes_id() {
        let store = InMemoryMailbox::new();
        let target = store.add_folder(None, "Junk");
        store.add_email(email("m1", INBOX_ID, 1));
        store.set_rekey_on_move(true);

        let new_id = store.move_message("m1", &target, None).await.unwrap();
        assert_ne!(new_id, "m1");
        assert!(store.email("m1").is_none());
        assert_eq!(store.email(&new_id).unwrap().folder_id, target);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let store = InMemoryMailbox::new();
        store.inject_failure(StoreOp::ListFolders, StoreError::Unavailable("1".into()));
        store.inject_failure(StoreOp::ListFolders, StoreError::Timeout("2".into()));

        assert!(matches!(store.list_folders(None).await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.list_folders(None).await, Err(StoreError::Timeout(_))));
        assert_eq!(store.list_folders(None).await.unwrap().len(), 1);
        assert_eq!(store.calls().list_folders, 3);
    }

    #[tokio::test]
    async fn source_scoped_message_needs_via_folder() {
        let store = InMemoryMailbox::new();
        let target = store.add_folder(None, "Other");
        store.add_email(email("m1", INBOX_ID, 1));
        store.require_source_folder("m1");

        let err = store.move_message("m1", &target, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        store.move_message("m1", &target, Some(INBOX_ID)).await.unwrap();
    }

    #[test]
    fn folder_id_by_path_walks_names() {
        let store = InMemoryMailbox::new();
        let junk = store.add_folder(Some(INBOX_ID), "Junk");
        let promo = store.add_folder(Some(&junk), "Promo");
        assert_eq!(store.folder_id_by_path("Inbox/Junk/Promo"), Some(promo));
        assert_eq!(store.folder_id_by_path("Junk"), None);
    }
}
