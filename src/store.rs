// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision store integration trait.
//!
//! Defines what the replication core needs from a document storage backend.
//! The durability mechanism is the backend's business; the core only relies
//! on keyed revision trees, an explicit current pointer, and a gap-free
//! sequence feed of changed keys.
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_mesh::store::{MemoryRevisionStore, RevisionStore};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryRevisionStore::new();
//! let mut body = serde_json::Map::new();
//! body.insert("name".into(), json!("tiger"));
//!
//! let rev = store.put("doc1", Some(body), None).await?;
//! assert_eq!(store.current_revision("doc1").await?, Some(rev));
//! # Ok(())
//! # }
//! ```

use crate::revision::{Body, Document, Revision, RevisionBundle, RevisionId};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (keeps trait signatures readable).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Errors reported by a revision store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Key or revision is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local edit against a revision that is no longer current.
    #[error("revision conflict on {key}: parent {expected:?} is not current {actual:?}")]
    Conflict {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Tree invariant violated (dangling parent, malformed bundle).
    #[error("store corruption: {0}")]
    Corrupt(String),
}

/// One entry of a sequence feed: the latest state of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub sequence: u64,
    pub key: String,
    /// Current revision at the time the feed was read.
    pub rev: RevisionId,
    pub deleted: bool,
    /// More than one leaf in the tree.
    pub conflicted: bool,
}

/// A page of the sequence feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    /// Highest sequence covered by this page, filtered entries included.
    /// Checkpoints advance to this value.
    pub last_sequence: u64,
}

/// Trait defining what we need from the storage backend.
///
/// All mutations for one key are serialized by the
/// [`ResolutionCoordinator`](crate::coordinator::ResolutionCoordinator), so an
/// implementation only has to keep each call atomic on its own.
pub trait RevisionStore: Send + Sync + 'static {
    /// Current document (tombstones included, with `deleted = true`).
    fn get(&self, key: &str) -> StoreFuture<'_, Option<Document>>;

    /// Local edit. `parent` must be the current revision (`None` for a new key).
    /// A `None` body writes a tombstone.
    fn put(&self, key: &str, body: Option<Body>, parent: Option<RevisionId>) -> StoreFuture<'_, RevisionId>;

    /// Current revision id.
    fn current_revision(&self, key: &str) -> StoreFuture<'_, Option<RevisionId>>;

    /// Whether `candidate` is reachable from `of` through parent links.
    fn is_ancestor(&self, key: &str, candidate: &RevisionId, of: &RevisionId) -> StoreFuture<'_, bool>;

    /// Whether the tree for `key` holds `rev`.
    fn contains(&self, key: &str, rev: &RevisionId) -> StoreFuture<'_, bool>;

    /// Fetch one stored revision.
    fn revision(&self, key: &str, rev: &RevisionId) -> StoreFuture<'_, Option<Revision>>;

    /// Revision plus all of its ancestors.
    fn history(&self, key: &str, rev: &RevisionId) -> StoreFuture<'_, Option<RevisionBundle>>;

    /// Insert the missing part of a foreign branch. With `make_current` the
    /// bundled revision becomes current; otherwise it is kept as an extra leaf.
    fn graft(&self, bundle: RevisionBundle, make_current: bool) -> StoreFuture<'_, ()>;

    /// Commit a merge of two leaves and make it current.
    fn merge(&self, key: &str, a: &RevisionId, b: &RevisionId, body: Option<Body>) -> StoreFuture<'_, RevisionId>;

    /// Leaf revisions, ascending.
    fn leaves(&self, key: &str) -> StoreFuture<'_, Vec<RevisionId>>;

    /// Keys changed after `since`, at most `limit` entries.
    fn changes_since(&self, since: u64, limit: usize) -> StoreFuture<'_, ChangeBatch>;

    /// Highest assigned sequence.
    fn last_sequence(&self) -> StoreFuture<'_, u64>;

    /// Move an existing key to the head of the feed under a fresh sequence,
    /// leaving its tree alone. Returns the key's sequence afterwards (0 for
    /// an unknown key).
    fn touch(&self, key: &str) -> StoreFuture<'_, u64>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Revision tree of one key.
#[derive(Debug, Clone)]
struct RevisionTree {
    revisions: HashMap<RevisionId, Revision>,
    leaves: BTreeSet<RevisionId>,
    current: RevisionId,
}

impl RevisionTree {
    fn new(current: RevisionId) -> Self {
        Self {
            revisions: HashMap::new(),
            leaves: BTreeSet::new(),
            current,
        }
    }

    fn current_revision(&self) -> Option<&Revision> {
        self.revisions.get(&self.current)
    }

    /// Insert revisions not yet present. Returns how many were new.
    fn insert_all<'a>(&mut self, revisions: impl IntoIterator<Item = &'a Revision>) -> usize {
        let mut inserted = 0;
        for rev in revisions {
            if !self.revisions.contains_key(&rev.id) {
                self.revisions.insert(rev.id.clone(), rev.clone());
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.recompute_leaves();
        }
        inserted
    }

    fn recompute_leaves(&mut self) {
        let parents: HashSet<&RevisionId> = self
            .revisions
            .values()
            .flat_map(|r| r.parents.iter())
            .collect();
        self.leaves = self
            .revisions
            .keys()
            .filter(|id| !parents.contains(id))
            .cloned()
            .collect();
    }

    fn ancestors(&self, of: &RevisionId) -> Vec<&Revision> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&RevisionId> = VecDeque::new();
        let mut out = Vec::new();

        if let Some(rev) = self.revisions.get(of) {
            queue.extend(rev.parents.iter());
        }
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(rev) = self.revisions.get(id) {
                out.push(rev);
                queue.extend(rev.parents.iter());
            }
        }
        out
    }
}

/// First parent link in `bundle` that resolves neither inside the bundle
/// nor through `known`, or that does not sit below its child's generation.
fn unresolved_parent(bundle: &RevisionBundle, known: impl Fn(&RevisionId) -> bool) -> Option<RevisionId> {
    let revisions = bundle.revisions_ascending();
    let ids: HashSet<&RevisionId> = revisions.iter().map(|r| &r.id).collect();
    revisions.iter().find_map(|rev| {
        rev.parents
            .iter()
            .find(|p| p.generation() >= rev.generation() || !(ids.contains(p) || known(*p)))
            .cloned()
    })
}

/// Sequence feed state. One entry per key, at its latest sequence.
#[derive(Debug, Default)]
struct SequenceLog {
    last: u64,
    by_seq: BTreeMap<u64, String>,
    seq_of: HashMap<String, u64>,
}

impl SequenceLog {
    fn bump(&mut self, key: &str) -> u64 {
        self.last += 1;
        if let Some(old) = self.seq_of.insert(key.to_string(), self.last) {
            self.by_seq.remove(&old);
        }
        self.by_seq.insert(self.last, key.to_string());
        self.last
    }
}

/// In-memory [`RevisionStore`] used for tests, demos and embedded peers.
///
/// Trees live in a `DashMap`; the sequence log sits behind one short std
/// mutex taken for the duration of each mutation so the feed never exposes
/// a gap. No await point is ever reached while it is held.
#[derive(Debug, Default)]
pub struct MemoryRevisionStore {
    trees: DashMap<String, RevisionTree>,
    log: Mutex<SequenceLog>,
}

impl MemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with at least one revision.
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }


    fn put_sync(&self, key: &str, body: Option<Body>, parent: Option<RevisionId>) -> StoreResult<RevisionId> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);

        let id = match self.trees.get_mut(key) {
            None => {
                if let Some(parent) = parent {
                    return Err(StoreError::NotFound(format!("{}@{}", key, parent)));
                }
                let root = Revision::root(body);
                let id = root.id.clone();
                let mut tree = RevisionTree::new(id.clone());
                tree.insert_all(std::iter::once(&root));
                self.trees.insert(key.to_string(), tree);
                id
            }
            Some(mut tree) => {
                let current = tree.current.clone();
                let recreating = parent.is_none()
                    && tree.current_revision().map_or(false, |r| r.deleted);
                if parent.as_ref() != Some(&current) && !recreating {
                    return Err(StoreError::Conflict {
                        key: key.to_string(),
                        expected: parent.map(|p| p.to_string()),
                        actual: Some(current.to_string()),
                    });
                }
                let rev = Revision::child(&current, body);
                let id = rev.id.clone();
                tree.insert_all(std::iter::once(&rev));
                tree.current = id.clone();
                id
            }
        };

        log.bump(key);
        Ok(id)
    }

    fn graft_sync(&self, bundle: RevisionBundle, make_current: bool) -> StoreResult<()> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let key = bundle.key.clone();
        let id = bundle.id().clone();

        // Validate against the existing tree before touching it.
        let missing = {
            let tree = self.trees.get(&key);
            let known = |p: &RevisionId| tree.as_ref().map_or(false, |t| t.revisions.contains_key(p));
            unresolved_parent(&bundle, known)
        };
        if let Some(parent) = missing {
            return Err(StoreError::Corrupt(format!(
                "bundle for {}@{} has unresolved parent {}",
                key, id, parent
            )));
        }

        let mut tree = self
            .trees
            .entry(key.clone())
            .or_insert_with(|| RevisionTree::new(id.clone()));
        let inserted = tree.insert_all(bundle.revisions_ascending());
        let moved = make_current && tree.current != id;
        if make_current {
            tree.current = id;
        }
        drop(tree);

        if inserted > 0 || moved {
            log.bump(&key);
        }
        Ok(())
    }

    fn merge_sync(&self, key: &str, a: &RevisionId, b: &RevisionId, body: Option<Body>) -> StoreResult<RevisionId> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);

        let mut tree = self
            .trees
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        for parent in [a, b] {
            if !tree.revisions.contains_key(parent) {
                return Err(StoreError::NotFound(format!("{}@{}", key, parent)));
            }
        }

        let merged = Revision::merge(a, b, body);
        let id = merged.id.clone();
        tree.insert_all(std::iter::once(&merged));
        tree.current = id.clone();
        drop(tree);

        log.bump(key);
        Ok(id)
    }

    fn changes_since_sync(&self, since: u64, limit: usize) -> ChangeBatch {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = ChangeBatch {
            changes: Vec::new(),
            last_sequence: since,
        };

        for (&seq, key) in log.by_seq.range(since.saturating_add(1)..).take(limit) {
            batch.last_sequence = seq;
            let Some(tree) = self.trees.get(key) else { continue };
            let Some(current) = tree.current_revision() else { continue };
            batch.changes.push(Change {
                sequence: seq,
                key: key.clone(),
                rev: current.id.clone(),
                deleted: current.deleted,
                conflicted: tree.leaves.len() > 1,
            });
        }
        batch
    }
}

impl RevisionStore for MemoryRevisionStore {
    fn get(&self, key: &str) -> StoreFuture<'_, Option<Document>> {
        let doc = self
            .trees
            .get(key)
            .and_then(|t| t.current_revision().map(|r| Document::from_revision(key, r)));
        Box::pin(async move { Ok(doc) })
    }

    fn put(&self, key: &str, body: Option<Body>, parent: Option<RevisionId>) -> StoreFuture<'_, RevisionId> {
        let result = self.put_sync(key, body, parent);
        Box::pin(async move { result })
    }

    fn current_revision(&self, key: &str) -> StoreFuture<'_, Option<RevisionId>> {
        let current = self.trees.get(key).map(|t| t.current.clone());
        Box::pin(async move { Ok(current) })
    }

    fn is_ancestor(&self, key: &str, candidate: &RevisionId, of: &RevisionId) -> StoreFuture<'_, bool> {
        let found = self
            .trees
            .get(key)
            .map_or(false, |t| t.ancestors(of).iter().any(|r| &r.id == candidate));
        Box::pin(async move { Ok(found) })
    }

    fn contains(&self, key: &str, rev: &RevisionId) -> StoreFuture<'_, bool> {
        let found = self.trees.get(key).map_or(false, |t| t.revisions.contains_key(rev));
        Box::pin(async move { Ok(found) })
    }

    fn revision(&self, key: &str, rev: &RevisionId) -> StoreFuture<'_, Option<Revision>> {
        let found = self.trees.get(key).and_then(|t| t.revisions.get(rev).cloned());
        Box::pin(async move { Ok(found) })
    }

    fn history(&self, key: &str, rev: &RevisionId) -> StoreFuture<'_, Option<RevisionBundle>> {
        let bundle = self.trees.get(key).and_then(|t| {
            t.revisions.get(rev).map(|revision| RevisionBundle {
                key: key.to_string(),
                revision: revision.clone(),
                history: t.ancestors(rev).into_iter().cloned().collect(),
            })
        });
        Box::pin(async move { Ok(bundle) })
    }

    fn graft(&self, bundle: RevisionBundle, make_current: bool) -> StoreFuture<'_, ()> {
        let result = self.graft_sync(bundle, make_current);
        Box::pin(async move { result })
    }

    fn merge(&self, key: &str, a: &RevisionId, b: &RevisionId, body: Option<Body>) -> StoreFuture<'_, RevisionId> {
        let result = self.merge_sync(key, a, b, body);
        Box::pin(async move { result })
    }

    fn leaves(&self, key: &str) -> StoreFuture<'_, Vec<RevisionId>> {
        let leaves = self
            .trees
            .get(key)
            .map(|t| t.leaves.iter().cloned().collect())
            .unwrap_or_default();
        Box::pin(async move { Ok(leaves) })
    }

    fn changes_since(&self, since: u64, limit: usize) -> StoreFuture<'_, ChangeBatch> {
        let batch = self.changes_since_sync(since, limit);
        Box::pin(async move { Ok(batch) })
    }

    fn last_sequence(&self) -> StoreFuture<'_, u64> {
        let last = self.log.lock().unwrap_or_else(PoisonError::into_inner).last;
        Box::pin(async move { Ok(last) })
    }

    fn touch(&self, key: &str) -> StoreFuture<'_, u64> {
        let seq = {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            if self.trees.contains_key(key) {
                log.bump(key)
            } else {
                0
            }
        };
        Box::pin(async move { Ok(seq) })
    }
}
