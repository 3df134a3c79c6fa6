// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision tree primitives.
//!
//! Every document key owns a tree of immutable [`Revision`]s. A revision is
//! identified by a [`RevisionId`] of the form `{generation}-{digest}`:
//!
//! ```text
//! 1-9f3c…        root (no parents)
//!   └── 2-41aa…  edit (one parent)
//!         └──┐
//! 2-c07e… ───┴── 3-5d12…  merge (two parents, generation = max + 1)
//! ```
//!
//! The digest is a SHA-256 over the canonical JSON of the generation, the
//! sorted parent ids, the tombstone flag and the body. Identical content with
//! identical lineage therefore always yields the same id on every peer, which
//! is what makes re-delivery idempotent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Opaque document body.
///
/// `serde_json::Map` is ordered by key, so serializing a body is canonical.
pub type Body = serde_json::Map<String, Value>;

/// Hex characters of the SHA-256 kept in a digest.
const DIGEST_LEN: usize = 40;

/// Error parsing a `gen-digest` revision string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevisionIdError {
    #[error("revision id is missing the '-' separator: {0:?}")]
    MissingSeparator(String),
    #[error("invalid generation in revision id: {0:?}")]
    InvalidGeneration(String),
    #[error("empty digest in revision id: {0:?}")]
    EmptyDigest(String),
}

/// Identifier of one revision: generation plus content digest.
///
/// Ordering compares the generation first and the digest lexicographically on
/// ties, which is also the default winner rule between two leaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Build an id from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }

    /// Depth of the revision in its tree (root = 1).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Content digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = RevisionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| RevisionIdError::MissingSeparator(s.to_string()))?;

        let generation: u64 = generation
            .parse()
            .map_err(|_| RevisionIdError::InvalidGeneration(s.to_string()))?;
        if generation == 0 {
            return Err(RevisionIdError::InvalidGeneration(s.to_string()));
        }
        if digest.is_empty() {
            return Err(RevisionIdError::EmptyDigest(s.to_string()));
        }

        Ok(Self::new(generation, digest))
    }
}

impl TryFrom<String> for RevisionId {
    type Error = RevisionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

/// Immutable snapshot of a document at one point in its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    /// Empty for a root, one entry for an edit, two for a merge.
    pub parents: Vec<RevisionId>,
    /// Tombstone flag.
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: Body,
}

impl Revision {
    /// First revision of a new document.
    pub fn root(body: Option<Body>) -> Self {
        Self::build(1, Vec::new(), body)
    }

    /// Edit on top of `parent`. A `None` body writes a tombstone.
    pub fn child(parent: &RevisionId, body: Option<Body>) -> Self {
        Self::build(parent.generation() + 1, vec![parent.clone()], body)
    }

    /// Merge node joining two conflicting leaves.
    ///
    /// The generation is one past the deeper leaf; parents are stored sorted
    /// so both sides of a conflict compute the same id.
    pub fn merge(a: &RevisionId, b: &RevisionId, body: Option<Body>) -> Self {
        let generation = a.generation().max(b.generation()) + 1;
        Self::build(generation, vec![a.clone(), b.clone()], body)
    }

    fn build(generation: u64, mut parents: Vec<RevisionId>, body: Option<Body>) -> Self {
        parents.sort();
        let deleted = body.is_none();
        let body = body.unwrap_or_default();
        let digest = compute_digest(generation, &parents, deleted, &body);

        Self {
            id: RevisionId::new(generation, digest),
            parents,
            deleted,
            body,
        }
    }

    pub fn generation(&self) -> u64 {
        self.id.generation()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// Recompute the digest and compare it with the id.
    pub fn has_valid_digest(&self) -> bool {
        let mut parents = self.parents.clone();
        parents.sort();
        parents == self.parents
            && compute_digest(self.generation(), &self.parents, self.deleted, &self.body) == self.id.digest()
    }

    /// Body as seen by a resolver: `None` for a tombstone.
    pub fn live_body(&self) -> Option<&Body> {
        (!self.deleted).then_some(&self.body)
    }
}

/// Compute the digest for a revision's content and lineage.
pub fn compute_digest(generation: u64, parents: &[RevisionId], deleted: bool, body: &Body) -> String {
    let canonical = serde_json::json!({
        "generation": generation,
        "parents": parents.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "deleted": deleted,
        "body": body,
    });
    // Serializing a `Value` built from owned maps and strings cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut digest = hex::encode(Sha256::digest(&bytes));
    digest.truncate(DIGEST_LEN);
    digest
}

/// A document as read from (or handed to) a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    /// `None` for content built by a resolver that has not been committed.
    pub revision: Option<RevisionId>,
    #[serde(default)]
    pub body: Body,
    #[serde(default)]
    pub deleted: bool,
}

impl Document {
    /// New, uncommitted, empty document.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            revision: None,
            body: Body::new(),
            deleted: false,
        }
    }

    /// New, uncommitted document with the given body.
    pub fn with_body(key: impl Into<String>, body: Body) -> Self {
        Self {
            body,
            ..Self::new(key)
        }
    }

    /// Snapshot of a stored revision.
    pub fn from_revision(key: impl Into<String>, revision: &Revision) -> Self {
        Self {
            key: key.into(),
            revision: Some(revision.id.clone()),
            body: revision.body.clone(),
            deleted: revision.deleted,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str)
    }

    /// Set a field, returning `self` for chaining.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.body.insert(field.into(), value.into());
        self
    }

    /// Generation of the stored revision, 0 if uncommitted.
    pub fn generation(&self) -> u64 {
        self.revision.as_ref().map_or(0, RevisionId::generation)
    }
}

/// A (key, revision) pair as listed by a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionRef {
    pub key: String,
    pub rev: RevisionId,
}

impl RevisionRef {
    pub fn new(key: impl Into<String>, rev: RevisionId) -> Self {
        Self {
            key: key.into(),
            rev,
        }
    }
}

impl fmt::Display for RevisionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.rev)
    }
}

/// A revision together with every ancestor reachable through its parents.
///
/// This is the unit of transfer between peers: the receiver grafts whatever
/// part of the branch it is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionBundle {
    pub key: String,
    pub revision: Revision,
    #[serde(default)]
    pub history: Vec<Revision>,
}

impl RevisionBundle {
    pub fn id(&self) -> &RevisionId {
        &self.revision.id
    }

    /// Whether `rev` is a strict ancestor of the bundled revision.
    pub fn descends_from(&self, rev: &RevisionId) -> bool {
        self.history.iter().any(|r| &r.id == rev)
    }

    /// All revisions, ancestors first (ascending generation).
    pub fn revisions_ascending(&self) -> Vec<&Revision> {
        let mut all: Vec<&Revision> = self.history.iter().chain(std::iter::once(&self.revision)).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Check that every parent link resolves inside the bundle or is absent
    /// only for roots.
    pub fn is_well_formed(&self) -> bool {
        let ids: std::collections::HashSet<&RevisionId> = self
            .history
            .iter()
            .chain(std::iter::once(&self.revision))
            .map(|r| &r.id)
            .collect();

        self.history
            .iter()
            .chain(std::iter::once(&self.revision))
            .all(|r| {
                r.parents.iter().all(|p| ids.contains(p))
                    && r.parents.iter().all(|p| p.generation() < r.generation())
            })
    }
}
