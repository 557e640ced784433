//! Per-run folder cache keyed by `(parent scope, lower-cased name)`.
//!
//! Display names are only unique among siblings, so a name is never used as
//! a key on its own. A scope is "listed" once all of its children have been
//! loaded; lookups that miss in a listed scope are real misses.

use std::collections::{HashMap, HashSet};

use crate::store::FolderEntry;

type ScopeKey = Option<String>;

#[derive(Debug, Default)]
pub struct FolderCache {
    by_key: HashMap<(ScopeKey, String), FolderEntry>,
    by_id: HashMap<String, FolderEntry>,
    /// Insertion order, for stable iteration.
    order: Vec<String>,
    listed: HashSet<ScopeKey>,
}

impl FolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(parent: Option<&str>, name: &str) -> (ScopeKey, String) {
        (parent.map(str::to_string), name.trim().to_lowercase())
    }

    /// Look up a child of `parent` by name (case-insensitive).
    pub fn get(&self, parent: Option<&str>, name: &str) -> Option<&FolderEntry> {
        self.by_key.get(&Self::key(parent, name))
    }

    /// Insert or replace one folder. Last writer wins.
    ///
    /// A folder re-inserted under a new name or parent drops its old key.
    pub fn insert(&mut self, entry: FolderEntry) {
        let key = Self::key(entry.parent.as_deref(), &entry.name);
        match self.by_id.get(&entry.id) {
            Some(previous) => {
                let old_key = Self::key(previous.parent.as_deref(), &previous.name);
                if old_key != key
                    && self.by_key.get(&old_key).is_some_and(|f| f.id == entry.id)
                {
                    self.by_key.remove(&old_key);
                }
            }
            None => self.order.push(entry.id.clone()),
        }
        self.by_id.insert(entry.id.clone(), entry.clone());
        self.by_key.insert(key, entry);
    }

    /// Record a full listing of `parent`'s children and mark the scope listed.
    pub fn insert_listing(&mut self, parent: Option<&str>, children: Vec<FolderEntry>) {
        for mut child in children {
            child.parent = parent.map(str::to_string);
            self.insert(child);
        }
        self.listed.insert(parent.map(str::to_string));
    }

    pub fn is_listed(&self, parent: Option<&str>) -> bool {
        self.listed.contains(&parent.map(str::to_string))
    }

    /// Forget that `parent` was listed, so the next miss re-lists it.
    pub fn invalidate_scope(&mut self, parent: Option<&str>) {
        self.listed.remove(&parent.map(str::to_string));
    }

    /// Distance from the mailbox root: top-level folders are depth 0.
    ///
    /// `None` when an ancestor is not cached.
    pub fn depth(&self, id: &str) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.by_id.get(id)?;
        while let Some(parent) = &current.parent {
            current = self.by_id.get(parent)?;
            depth += 1;
            if depth > self.by_id.len() {
                // Parent cycle; treat as unknown.
                return None;
            }
        }
        Some(depth)
    }

    /// Every cached folder with this display name, in insertion order.
    pub fn find_by_name(&self, name: &str) -> Vec<&FolderEntry> {
        let lowered = name.trim().to_lowercase();
        self.entries()
            .filter(|f| f.name.to_lowercase() == lowered)
            .collect()
    }

    /// Display-name path from the root, e.g. `Inbox/Boss`.
    pub fn path_of(&self, id: &str) -> Option<String> {
        let mut names = Vec::new();
        let mut current = self.by_id.get(id)?;
        loop {
            names.push(current.name.as_str());
            match &current.parent {
                Some(parent) if names.len() <= self.by_id.len() => {
                    current = self.by_id.get(parent)?;
                }
                Some(_) => return None,
                None => break,
            }
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Every cached folder, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &FolderEntry> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }
}
