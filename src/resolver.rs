// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pluggable conflict resolution policy.
//!
//! A [`ConflictResolver`] receives a [`Conflict`] (local and remote snapshots,
//! `None` meaning that side is a tombstone) and returns the winning document,
//! or `None` to resolve to a deletion. The
//! [`ResolutionCoordinator`](crate::coordinator::ResolutionCoordinator) turns
//! the answer into a two-parent merge revision.
//!
//! Resolvers run on the blocking thread pool and may take as long as they
//! like: concurrent calls only ever happen for *different* keys.
//!
//! # Example
//!
//! ```rust
//! use replication_mesh::resolver::{from_fn, ConflictResolver, Delayed, DefaultResolver};
//! use std::time::Duration;
//!
//! // Remote always wins
//! let remote_wins = from_fn("remote-wins", |c| c.remote.clone());
//!
//! // Default policy with an artificial 50ms merge cost
//! let slow = Delayed::new(DefaultResolver, Duration::from_millis(50));
//! # let _ = (remote_wins.name(), slow.name());
//! ```

use crate::revision::{Document, RevisionId};
use std::sync::Arc;
use std::time::Duration;

/// Shared resolver handle as stored in link configs.
pub type ResolverRef = Arc<dyn ConflictResolver>;

/// Two leaf revisions of one key with no ancestor relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub key: String,
    /// Local snapshot, `None` if the local leaf is a tombstone.
    pub local: Option<Document>,
    /// Remote snapshot, `None` if the remote leaf is a tombstone.
    pub remote: Option<Document>,
    pub local_revision: RevisionId,
    pub remote_revision: RevisionId,
}

impl Conflict {
    /// Whether `rev` is one of the two sides.
    pub fn involves(&self, rev: &RevisionId) -> bool {
        &self.local_revision == rev || &self.remote_revision == rev
    }
}

/// Conflict resolution capability.
pub trait ConflictResolver: Send + Sync + 'static {
    /// Pick the winning state for `conflict`; `None` resolves to a deletion.
    fn resolve(&self, conflict: &Conflict) -> Option<Document>;

    /// Name used in logs and metrics.
    fn name(&self) -> &str {
        "custom"
    }
}

impl<T: ConflictResolver + ?Sized> ConflictResolver for Arc<T> {
    fn resolve(&self, conflict: &Conflict) -> Option<Document> {
        (**self).resolve(conflict)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Built-in policy: the side with the higher revision wins (generation first,
/// then the lexicographically larger digest). A winning tombstone deletes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl ConflictResolver for DefaultResolver {
    fn resolve(&self, conflict: &Conflict) -> Option<Document> {
        if conflict.remote_revision > conflict.local_revision {
            conflict.remote.clone()
        } else {
            conflict.local.clone()
        }
    }

    fn name(&self) -> &str {
        "default"
    }
}

/// Resolver built from a closure.
pub struct FnResolver<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named resolver.
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnResolver<F>
where
    F: Fn(&Conflict) -> Option<Document> + Send + Sync + 'static,
{
    FnResolver { name: name.into(), f }
}

impl<F> ConflictResolver for FnResolver<F>
where
    F: Fn(&Conflict) -> Option<Document> + Send + Sync + 'static,
{
    fn resolve(&self, conflict: &Conflict) -> Option<Document> {
        (self.f)(conflict)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Adds a fixed, blocking delay in front of another resolver.
///
/// Models slow merge logic. The delay blocks the worker thread it runs on,
/// which is always a blocking-pool thread, never a link's I/O loop.
#[derive(Debug, Clone)]
pub struct Delayed<R> {
    inner: R,
    delay: Duration,
}

impl<R: ConflictResolver> Delayed<R> {
    pub fn new(inner: R, delay: Duration) -> Self {
        Self { inner, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl<R: ConflictResolver> ConflictResolver for Delayed<R> {
    fn resolve(&self, conflict: &Conflict) -> Option<Document> {
        let resolved = self.inner.resolve(conflict);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        resolved
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::Body;
    use serde_json::json;

    fn doc(key: &str, rev: &RevisionId, name: &str) -> Document {
        let mut body = Body::new();
        body.insert("name".into(), json!(name));
        Document {
            key: key.into(),
            revision: Some(rev.clone()),
            body,
            deleted: false,
        }
    }

    fn conflict(local: RevisionId, remote: RevisionId) -> Conflict {
        Conflict {
            key: "doc1".into(),
            local: Some(doc("doc1", &local, "cat")),
            remote: Some(doc("doc1", &remote, "lion")),
            local_revision: local,
            remote_revision: remote,
        }
    }

    #[test]
    fn test_default_higher_generation_wins() {
        let c = conflict(RevisionId::new(3, "aaa"), RevisionId::new(2, "zzz"));
        let winner = DefaultResolver.resolve(&c).unwrap();
        assert_eq!(winner.get_str("name"), Some("cat"));
    }

    #[test]
    fn test_default_tie_larger_digest_wins() {
        let c = conflict(RevisionId::new(2, "aaa"), RevisionId::new(2, "bbb"));
        let winner = DefaultResolver.resolve(&c).unwrap();
        assert_eq!(winner.get_str("name"), Some("lion"));
    }

    #[test]
    fn test_default_winning_tombstone_deletes() {
        let mut c = conflict(RevisionId::new(2, "aaa"), RevisionId::new(3, "bbb"));
        c.remote = None;
        assert!(DefaultResolver.resolve(&c).is_none());
    }

    #[test]
    fn test_involves_both_sides_only() {
        let a = RevisionId::new(2, "aaa");
        let b = RevisionId::new(2, "bbb");
        let c1 = conflict(a.clone(), b.clone());
        assert!(c1.involves(&a) && c1.involves(&b));
        assert!(!c1.involves(&RevisionId::new(1, "root")));
    }

    #[test]
    fn test_fn_resolver() {
        let r = from_fn("remote-wins", |c: &Conflict| c.remote.clone());
        let c = conflict(RevisionId::new(9, "aaa"), RevisionId::new(2, "bbb"));
        assert_eq!(r.resolve(&c).unwrap().get_str("name"), Some("lion"));
        assert_eq!(r.name(), "remote-wins");
    }

    #[test]
    fn test_delayed_waits() {
        let r = Delayed::new(DefaultResolver, Duration::from_millis(20));
        let c = conflict(RevisionId::new(2, "aaa"), RevisionId::new(2, "bbb"));
        let start = std::time::Instant::now();
        assert!(r.resolve(&c).is_some());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(r.name(), "default");
    }

    #[test]
    fn test_arc_dyn_resolver() {
        let r: ResolverRef = Arc::new(DefaultResolver);
        let c = conflict(RevisionId::new(2, "aaa"), RevisionId::new(2, "bbb"));
        assert!(r.resolve(&c).is_some());
        assert_eq!(r.name(), "default");
    }
}
