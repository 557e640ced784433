//! Folder resolution on top of [`FolderCache`].
//!
//! Paths are resolved one segment at a time, strictly under the previous
//! segment. Labels typed by a user may name a folder anywhere in the tree;
//! [`FolderResolver::resolve_label`] finds it and applies the configured
//! tie-break when several folders share that name.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::LabelTieBreak;
use crate::error::{ResolveError, StoreError};
use crate::folders::cache::FolderCache;
use crate::pipeline::types::{ClassificationResult, FolderPath};
use crate::retry::RetryPolicy;
use crate::store::{FolderEntry, MailboxStore};

/// Where a classified email should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Display path from the mailbox root, destination root included.
    pub path: FolderPath,
    /// `None` only when creation was disabled and the folder does not exist yet.
    pub folder: Option<FolderEntry>,
    /// The subcategory folder failed and the category folder was used instead.
    pub fell_back: bool,
}

/// Resolves and creates folders for one run. Not shared between runs.
pub struct FolderResolver {
    store: Arc<dyn MailboxStore>,
    cache: FolderCache,
    retry: RetryPolicy,
    tie_break: LabelTieBreak,
    destination_root: Option<String>,
    root_entry: Option<FolderEntry>,
    tree_loaded: bool,
}

impl FolderResolver {
    pub fn new(store: Arc<dyn MailboxStore>, retry: RetryPolicy, tie_break: LabelTieBreak) -> Self {
        Self {
            store,
            cache: FolderCache::new(),
            retry,
            tie_break,
            destination_root: None,
            root_entry: None,
            tree_loaded: false,
        }
    }

    /// Create category folders under this label instead of at the mailbox root.
    pub fn with_destination_root(mut self, label: Option<String>) -> Self {
        self.destination_root = label.filter(|l| !FolderPath::parse(l).is_empty());
        self
    }

    pub fn cache(&self) -> &FolderCache {
        &self.cache
    }

    // ── Path resolution ─────────────────────────────────────────────

    /// Resolve `path` from the mailbox root, creating missing segments when
    /// `create` is set.
    ///
    /// Returns `Ok(None)` only when `create` is false and a segment is missing.
    pub async fn resolve_path(
        &mut self,
        path: &FolderPath,
        create: bool,
    ) -> Result<Option<FolderEntry>, ResolveError> {
        self.resolve_under(None, path, create).await
    }

    async fn resolve_under(
        &mut self,
        parent: Option<FolderEntry>,
        path: &FolderPath,
        create: bool,
    ) -> Result<Option<FolderEntry>, ResolveError> {
        if path.is_empty() {
            return Err(ResolveError::EmptyPath);
        }
        let mut current = parent;
        for segment in path.segments() {
            let parent_id = current.as_ref().map(|f| f.id.clone());
            match self.ensure_child(parent_id.as_deref(), segment, create).await? {
                Some(entry) => current = Some(entry),
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// Find a child by name, listing the scope once per run on a miss.
    async fn find_child(
        &mut self,
        parent: Option<&str>,
        name: &str,
    ) -> Result<Option<FolderEntry>, ResolveError> {
        if let Some(entry) = self.cache.get(parent, name) {
            return Ok(Some(entry.clone()));
        }
        if self.cache.is_listed(parent) {
            return Ok(None);
        }
        self.list_scope(parent).await?;
        Ok(self.cache.get(parent, name).cloned())
    }

    async fn ensure_child(
        &mut self,
        parent: Option<&str>,
        name: &str,
        create: bool,
    ) -> Result<Option<FolderEntry>, ResolveError> {
        if let Some(entry) = self.find_child(parent, name).await? {
            return Ok(Some(entry));
        }
        if !create {
            return Ok(None);
        }

        let store = &self.store;
        let created = self
            .retry
            .run("create_folder", || store.create_folder(parent, name))
            .await;

        match created {
            Ok(mut entry) => {
                entry.parent = parent.map(str::to_string);
                info!(
                    folder = %name,
                    id = %entry.id,
                    parent = parent.unwrap_or("<root>"),
                    "Created folder"
                );
                self.cache.insert(entry.clone());
                Ok(Some(entry))
            }
            Err(StoreError::Conflict(reason)) => {
                // Created by someone else since we listed; pick theirs up.
                debug!(folder = %name, "Folder already exists, re-listing scope");
                self.cache.invalidate_scope(parent);
                self.list_scope(parent).await?;
                self.cache
                    .get(parent, name)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| ResolveError::CreateFailed {
                        name: name.to_string(),
                        parent: parent.unwrap_or("<root>").to_string(),
                        reason,
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_scope(&mut self, parent: Option<&str>) -> Result<(), ResolveError> {
        let store = &self.store;
        let children = self
            .retry
            .run("list_folders", || store.list_folders(parent))
            .await?;
        debug!(parent = parent.unwrap_or("<root>"), count = children.len(), "Listed folders");
        self.cache.insert_listing(parent, children);
        Ok(())
    }

    // ── Destination resolution ──────────────────────────────────────

    /// Resolve the folder for a classification, under the destination root
    /// when one is configured.
    ///
    /// A subcategory folder that fails permanently falls back to the category
    /// folder. Transient failures are returned so the email fails.
    pub async fn resolve_destination(
        &mut self,
        classification: &ClassificationResult,
        create: bool,
    ) -> Result<Destination, ResolveError> {
        let root = self.destination_root_entry().await?;
        let root_path = match &root {
            Some(entry) => {
                let label = self.cache.path_of(&entry.id).unwrap_or_else(|| entry.name.clone());
                FolderPath::parse(&label)
            }
            None => FolderPath::default(),
        };

        let category_path = FolderPath::new(vec![classification.category.clone()]);
        let category = self.resolve_under(root.clone(), &category_path, create).await?;

        let Some(sub) = &classification.sub_category else {
            return Ok(Destination {
                path: category_path.under(&root_path),
                folder: category,
                fell_back: false,
            });
        };

        let full_path = classification.folder_path().under(&root_path);
        let Some(category_entry) = category else {
            // Dry run with no category folder yet: nothing below it exists either.
            return Ok(Destination {
                path: full_path,
                folder: None,
                fell_back: false,
            });
        };

        let sub_path = FolderPath::new(vec![sub.clone()]);
        match self.resolve_under(Some(category_entry.clone()), &sub_path, create).await {
            Ok(folder) => Ok(Destination {
                path: full_path,
                folder,
                fell_back: false,
            }),
            Err(e) if !e.is_transient() => {
                warn!(
                    category = %classification.category,
                    sub_category = %sub,
                    error = %e,
                    "Subcategory folder unavailable, using category folder"
                );
                Ok(Destination {
                    path: category_path.under(&root_path),
                    folder: Some(category_entry),
                    fell_back: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn destination_root_entry(&mut self) -> Result<Option<FolderEntry>, ResolveError> {
        if self.root_entry.is_some() {
            return Ok(self.root_entry.clone());
        }
        let Some(label) = self.destination_root.clone() else {
            return Ok(None);
        };
        let entry = self.resolve_label(&label).await?;
        self.root_entry = Some(entry.clone());
        Ok(Some(entry))
    }

    // ── Label resolution ────────────────────────────────────────────

    /// Resolve a user-supplied label such as `Business` or `Inbox/Boss`.
    ///
    /// The first segment may match anywhere in the tree; the rest are looked
    /// up strictly under it. Never creates folders.
    pub async fn resolve_label(&mut self, label: &str) -> Result<FolderEntry, ResolveError> {
        let path = FolderPath::parse(label);
        let Some((first, rest)) = path.segments().split_first() else {
            return Err(ResolveError::EmptyPath);
        };

        self.load_tree().await?;

        let mut candidates: Vec<(usize, FolderEntry)> = self
            .cache
            .find_by_name(first)
            .into_iter()
            .map(|f| (self.cache.depth(&f.id).unwrap_or(usize::MAX), f.clone()))
            .collect();
        if candidates.is_empty() {
            return Err(ResolveError::NotFound {
                path: path.to_string(),
            });
        }
        candidates.sort_by_key(|(depth, _)| *depth);

        let mut current = self.pick_candidate(first, &candidates)?;

        for segment in rest {
            current = self
                .find_child(Some(&current.id), segment)
                .await?
                .ok_or_else(|| ResolveError::NotFound {
                    path: path.to_string(),
                })?;
        }
        Ok(current)
    }

    fn pick_candidate(
        &self,
        name: &str,
        candidates: &[(usize, FolderEntry)],
    ) -> Result<FolderEntry, ResolveError> {
        let (shallowest, chosen) = &candidates[0];
        if candidates.len() == 1 {
            return Ok(chosen.clone());
        }

        let tied = candidates.iter().filter(|(d, _)| d == shallowest).count();
        let paths: Vec<String> = candidates
            .iter()
            .filter_map(|(_, f)| self.cache.path_of(&f.id))
            .collect();
        info!(label = %name, candidates = ?paths, "Label matches several folders");

        let ambiguous = match self.tie_break {
            LabelTieBreak::RequireUnique => true,
            LabelTieBreak::PreferShallowest => tied > 1 && *shallowest > 0,
        };
        if ambiguous {
            return Err(ResolveError::Ambiguous {
                name: name.to_string(),
                candidates: if self.tie_break == LabelTieBreak::RequireUnique {
                    candidates.len()
                } else {
                    tied
                },
                depth: *shallowest,
            });
        }

        info!(
            label = %name,
            chosen = %self.cache.path_of(&chosen.id).unwrap_or_else(|| chosen.name.clone()),
            "Using folder closest to the mailbox root"
        );
        Ok(chosen.clone())
    }

    /// Load the whole folder tree breadth-first. Scopes already listed are skipped.
    async fn load_tree(&mut self) -> Result<(), ResolveError> {
        if self.tree_loaded {
            return Ok(());
        }
        let mut queue: VecDeque<Option<String>> = VecDeque::from([None]);
        while let Some(scope) = queue.pop_front() {
            if !self.cache.is_listed(scope.as_deref()) {
                self.list_scope(scope.as_deref()).await?;
            }
            let children = self.children_of(scope.as_deref());
            queue.extend(children.into_iter().map(Some));
        }
        self.tree_loaded = true;
        Ok(())
    }

    fn children_of(&self, parent: Option<&str>) -> Vec<String> {
        self.cache
            .entries()
            .filter(|f| f.parent.as_deref() == parent)
            .map(|f| f.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::pipeline::types::{ClassificationSource, Priority};
    use crate::store::InMemoryMailbox;
    use crate::store::memory::{INBOX_ID, StoreOp};

    fn resolver(store: &Arc<InMemoryMailbox>) -> FolderResolver {
        FolderResolver::new(store.clone(), RetryPolicy::none(), LabelTieBreak::PreferShallowest)
    }

    fn classification(category: &str, sub: Option<&str>) -> ClassificationResult {
        ClassificationResult {
            category: category.into(),
            sub_category: sub.map(String::from),
            priority: Priority::Low,
            analysis: String::new(),
            sender_goal: String::new(),
            source: ClassificationSource::Model,
        }
    }

    #[tokio::test]
    async fn creates_missing_path_once() {
        let store = Arc::new(InMemoryMailbox::new());
        let mut r = resolver(&store);

        let path = FolderPath::parse("Junk/Promo");
        let first = r.resolve_path(&path, true).await.unwrap().unwrap();
        let second = r.resolve_path(&path, true).await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.calls().create_folder, 2);
        assert_eq!(store.folder_id_by_path("Junk/Promo"), Some(first.id));
    }

    #[tokio::test]
    async fn scope_listed_once_per_run() {
        let store = Arc::new(InMemoryMailbox::new());
        store.add_folder(None, "Boss");
        let mut r = resolver(&store);

        r.resolve_path(&FolderPath::parse("Boss"), true).await.unwrap();
        r.resolve_path(&FolderPath::parse("boss"), true).await.unwrap();
        assert_eq!(store.calls().list_folders, 1);
        assert_eq!(store.calls().create_folder, 0);
    }

    #[tokio::test]
    async fn same_name_under_different_parents_resolves_separately() {
        let store = Arc::new(InMemoryMailbox::new());
        let top = store.add_folder(None, "Business");
        let nested = store.add_folder(Some(INBOX_ID), "Business");
        let mut r = resolver(&store);

        let a = r.resolve_path(&FolderPath::parse("Business"), true).await.unwrap().unwrap();
        let b = r.resolve_path(&FolderPath::parse("Inbox/Business"), true).await.unwrap().unwrap();
        assert_eq!(a.id, top);
        assert_eq!(b.id, nested);
    }

    #[tokio::test]
    async fn conflict_on_create_relists_and_uses_existing() {
        let store = Arc::new(InMemoryMailbox::new());
        let mut r = resolver(&store);
        // Prime the root listing, then another client creates the folder.
        r.resolve_path(&FolderPath::parse("Inbox"), false).await.unwrap();
        let theirs = store.add_folder(None, "Receipt");

        let got = r.resolve_path(&FolderPath::parse("Receipt"), true).await.unwrap().unwrap();
        assert_eq!(got.id, theirs);
        assert_eq!(store.calls().list_folders, 2);
        assert_eq!(store.folders().iter().filter(|f| f.name == "Receipt").count(), 1);
    }

    #[tokio::test]
    async fn dry_run_never_creates() {
        let store = Arc::new(InMemoryMailbox::new());
        let mut r = resolver(&store);
        let got = r.resolve_path(&FolderPath::parse("Spam"), false).await.unwrap();
        assert!(got.is_none());
        assert_eq!(store.calls().create_folder, 0);
    }

    #[tokio::test]
    async fn empty_path_is_an_error() {
        let store = Arc::new(InMemoryMailbox::new());
        let mut r = resolver(&store);
        let err = r.resolve_path(&FolderPath::parse("/"), true).await.unwrap_err();
        assert!(matches!(err, ResolveError::EmptyPath));
    }

    #[tokio::test]
    async fn transient_list_failure_is_retried() {
        let store = Arc::new(InMemoryMailbox::new());
        store.inject_failure(StoreOp::ListFolders, StoreError::Unavailable("503".into()));
        let policy = RetryPolicy {
            base_delay: std::time::Duration::from_millis(1),
            jitter: false,
            ..RetryPolicy::default()
        };
        let mut r = FolderResolver::new(store.clone(), policy, LabelTieBreak::PreferShallowest);

        let got = r.resolve_path(&FolderPath::parse("Inbox"), false).await.unwrap();
        assert_eq!(got.map(|f| f.id), Some(INBOX_ID.to_string()));
        assert_eq!(store.calls().list_folders, 2);
    }

    #[tokio::test]
    async fn destination_with_subcategory() {
        let store = Arc::new(InMemoryMailbox::new());
        let mut r = resolver(&store);

        let dest = r
            .resolve_destination(&classification("Business", Some("Delhaize")), true)
            .await
            .unwrap();
        assert_eq!(dest.path.to_string(), "Business/Delhaize");
        assert!(!dest.fell_back);
        assert_eq!(
            dest.folder.map(|f| f.id),
            store.folder_id_by_path("Business/Delhaize")
        );
    }

    #[tokio::test]
    async fn destination_under_root_label() {
        let store = Arc::new(InMemoryMailbox::new());
        let mut r = resolver(&store).with_destination_root(Some("Inbox".into()));

        let dest = r
            .resolve_destination(&classification("Junk", Some("Promo")), true)
            .await
            .unwrap();
        assert_eq!(dest.path.to_string(), "Inbox/Junk/Promo");
        assert_eq!(
            dest.folder.map(|f| f.id),
            store.folder_id_by_path("Inbox/Junk/Promo")
        );
    }

    #[tokio::test]
    async fn subcategory_failure_falls_back_to_category() {
        let store = Arc::new(InMemoryMailbox::new());
        let category = store.add_folder(None, "Business");
        let mut r = resolver(&store);
        // Prime both scopes so the only create call is the subcategory.
        r.resolve_path(&FolderPath::parse("Business"), false).await.unwrap();
        r.resolve_path(&FolderPath::parse("Business/Known"), false).await.unwrap();
        store.inject_failure(
            StoreOp::CreateFolder,
            StoreError::Rejected {
                status: 400,
                message: "invalid name".into(),
            },
        );

        let dest = r
            .resolve_destination(&classification("Business", Some("Bad")), true)
            .await
            .unwrap();
        assert!(dest.fell_back);
        assert_eq!(dest.path.to_string(), "Business");
        assert_eq!(dest.folder.map(|f| f.id), Some(category));
    }

    #[tokio::test]
    async fn transient_subcategory_failure_is_not_masked() {
        let store = Arc::new(InMemoryMailbox::new());
        store.add_folder(None, "Business");
        let mut r = resolver(&store);
        r.resolve_path(&FolderPath::parse("Business"), false).await.unwrap();
        store.inject_failure(StoreOp::ListFolders, StoreError::Timeout("list timed out".into()));

        let err = r
            .resolve_destination(&classification("Business", Some("Delhaize")), true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn label_prefers_shallowest() {
        let store = Arc::new(InMemoryMailbox::new());
        let top = store.add_folder(None, "Business");
        store.add_folder(Some(INBOX_ID), "Business");
        let mut r = resolver(&store);

        let got = r.resolve_label("business").await.unwrap();
        assert_eq!(got.id, top);
    }

    #[tokio::test]
    async fn label_prefers_root_over_junk_subfolder() {
        let store = Arc::new(InMemoryMailbox::new());
        let top = store.add_folder(None, "Business");
        let junk = store.add_folder(None, "Junk");
        let nested = store.add_folder(Some(&junk), "Business");
        let mut r = resolver(&store);

        assert_eq!(r.resolve_label("Business").await.unwrap().id, top);
        assert_eq!(r.resolve_label("Junk/Business").await.unwrap().id, nested);
    }

    #[tokio::test]
    async fn label_finds_nested_folder() {
        let store = Arc::new(InMemoryMailbox::new());
        let junk = store.add_folder(Some(INBOX_ID), "Junk");
        let promo = store.add_folder(Some(&junk), "Promo");
        let mut r = resolver(&store);

        assert_eq!(r.resolve_label("Promo").await.unwrap().id, promo);
        assert_eq!(r.resolve_label("Junk/Promo").await.unwrap().id, promo);
        assert_eq!(r.resolve_label("Inbox\\Junk").await.unwrap().id, junk);
    }

    #[tokio::test]
    async fn label_tie_below_root_is_ambiguous() {
        let store = Arc::new(InMemoryMailbox::new());
        let a = store.add_folder(None, "Clients");
        let b = store.add_folder(None, "Vendors");
        store.add_folder(Some(&a), "Acme");
        store.add_folder(Some(&b), "Acme");
        let mut r = resolver(&store);

        let err = r.resolve_label("Acme").await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Ambiguous { candidates: 2, depth: 1, .. }
        ));
        assert_eq!(err.code(), ErrorCode::Ambiguous);

        // A qualified path is unambiguous.
        assert!(r.resolve_label("Clients/Acme").await.is_ok());
    }

    #[tokio::test]
    async fn require_unique_rejects_any_duplicate() {
        let store = Arc::new(InMemoryMailbox::new());
        store.add_folder(None, "Business");
        store.add_folder(Some(INBOX_ID), "Business");
        let mut r = FolderResolver::new(store.clone(), RetryPolicy::none(), LabelTieBreak::RequireUnique);

        let err = r.resolve_label("Business").await.unwrap_err();
        assert!(matches!(err, ResolveError::Ambiguous { candidates: 2, depth: 0, .. }));
    }

    #[tokio::test]
    async fn label_not_found() {
        let store = Arc::new(InMemoryMailbox::new());
        let mut r = resolver(&store);
        let err = r.resolve_label("Nowhere").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));

        let err = r.resolve_label("Inbox/Nowhere").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }
}
