// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One database in the mesh.
//!
//! A [`Peer`] is a [`RevisionStore`] plus the [`ResolutionCoordinator`] that
//! serializes every mutation of it. Local edits, applies from this peer's own
//! links, pushes from remote links and merge commits all go through the
//! coordinator.
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_mesh::config::CoordinatorSettings;
//! use replication_mesh::peer::Peer;
//! use replication_mesh::revision::Document;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Peer::new("db1", CoordinatorSettings::default());
//!
//! let mut doc = Document::new("doc1");
//! doc.set("name", "tiger");
//! let rev = db.save(&doc).await?;
//!
//! let stored = db.document("doc1").await?.expect("just saved");
//! assert_eq!(stored.revision, Some(rev));
//! # Ok(())
//! # }
//! ```

use crate::codec;
use crate::config::CoordinatorSettings;
use crate::coordinator::{ApplyOutcome, ClaimVerdict, LinkContext, Origin, ResolutionClaim, ResolutionCoordinator};
use crate::error::Result;
use crate::revision::{Body, Document, RevisionBundle, RevisionId, RevisionRef};
use crate::store::{ChangeBatch, MemoryRevisionStore, RevisionStore, StoreError};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A named database: store, coordinator and change notifications.
pub struct Peer {
    name: String,
    coordinator: Arc<ResolutionCoordinator>,
}

impl Peer {
    /// Peer backed by a fresh in-memory store.
    pub fn new(name: impl Into<String>, settings: CoordinatorSettings) -> Arc<Self> {
        Self::with_store(name, Arc::new(MemoryRevisionStore::new()), settings)
    }

    /// Peer backed by an existing store.
    pub fn with_store(name: impl Into<String>, store: Arc<dyn RevisionStore>, settings: CoordinatorSettings) -> Arc<Self> {
        let name = name.into();
        let coordinator = Arc::new(ResolutionCoordinator::new(name.clone(), store, &settings));
        Arc::new(Self { name, coordinator })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> &Arc<ResolutionCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn RevisionStore> {
        self.coordinator.store()
    }

    // =========================================================================
    // Local API
    // =========================================================================

    /// Local edit. `parent` must be the current revision (`None` for a new key).
    pub async fn put(&self, key: &str, body: Option<Body>, parent: Option<RevisionId>) -> Result<RevisionId> {
        self.coordinator.put(key, body, parent).await
    }

    /// Save `doc` on top of the revision it was read at.
    pub async fn save(&self, doc: &Document) -> Result<RevisionId> {
        let body = (!doc.deleted).then(|| doc.body.clone());
        self.put(&doc.key, body, doc.revision.clone()).await
    }

    /// Write a tombstone over the current revision.
    pub async fn delete(&self, key: &str) -> Result<RevisionId> {
        let current = self
            .current_revision(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.put(key, None, Some(current)).await
    }

    /// Current document, `None` if missing or deleted.
    pub async fn document(&self, key: &str) -> Result<Option<Document>> {
        let doc = self.store().get(key).await?;
        Ok(doc.filter(|d| !d.deleted))
    }

    pub async fn current_revision(&self, key: &str) -> Result<Option<RevisionId>> {
        Ok(self.store().current_revision(key).await?)
    }

    // =========================================================================
    // Replication endpoint
    // =========================================================================

    /// Change feed as seen by other peers (held-back keys filtered).
    pub async fn changes_since(&self, since: u64, limit: usize) -> Result<ChangeBatch> {
        self.coordinator.changes_since(since, limit).await
    }

    /// Which of `refs` this peer does not hold.
    pub async fn missing(&self, refs: &[RevisionRef]) -> Result<Vec<RevisionRef>> {
        let mut missing = Vec::new();
        for r in refs {
            if !self.store().contains(&r.key, &r.rev).await? {
                missing.push(r.clone());
            }
        }
        Ok(missing)
    }

    /// Encoded bundle for `key@rev`.
    pub async fn export_revision(&self, key: &str, rev: &RevisionId) -> Result<Vec<u8>> {
        let bundle = self
            .store()
            .history(key, rev)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{}@{}", key, rev)))?;
        codec::encode(&bundle)
    }

    /// Apply a bundle pushed by a remote's active link.
    pub async fn receive_push(&self, payload: &[u8]) -> Result<ApplyOutcome> {
        let bundle = codec::decode(payload)?;
        debug!(peer = %self.name, key = %bundle.key, rev = %bundle.id(), "Received push");
        self.coordinator.apply(bundle, Origin::Push, LinkContext::default()).await
    }

    /// Apply a bundle fetched by one of this peer's own links. A conflict is
    /// resolved with `link`'s resolver once `link.source` grants the claim.
    pub async fn apply_pulled(&self, bundle: RevisionBundle, link: LinkContext) -> Result<ApplyOutcome> {
        self.coordinator.apply(bundle, Origin::Pull, link).await
    }

    /// Answer a remote link asking to resolve a pair it pulled from here.
    pub async fn receive_claim(&self, claim: &ResolutionClaim) -> ClaimVerdict {
        debug!(peer = %self.name, key = %claim.key, pair = %claim.pair, claimant = %claim.claimant, "Received claim");
        self.coordinator.claim(claim).await
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Sequence hint receiver; changes on every store mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.coordinator.subscribe()
    }

    pub fn sequence_hint(&self) -> u64 {
        self.coordinator.sequence_hint()
    }

    pub fn in_flight_resolutions(&self) -> usize {
        self.coordinator.in_flight()
    }

    pub fn resolver_invocations(&self) -> u64 {
        self.coordinator.invocations()
    }

    /// Whether `key` is held back while a resolution settles.
    pub fn is_holding(&self, key: &str) -> bool {
        self.coordinator.is_held(key)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("sequence", &self.sequence_hint())
            .field("in_flight_resolutions", &self.in_flight_resolutions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationError;

    fn peer(name: &str) -> Arc<Peer> {
        Peer::new(name, CoordinatorSettings::default())
    }

    #[tokio::test]
    async fn test_save_read_delete() {
        let db = peer("db1");
        let mut doc = Document::new("doc1");
        doc.set("name", "tiger");
        let r1 = db.save(&doc).await.unwrap();
        assert_eq!(r1.generation(), 1);

        let mut stored = db.document("doc1").await.unwrap().unwrap();
        assert_eq!(stored.get_str("name"), Some("tiger"));
        stored.set("name", "cat");
        let r2 = db.save(&stored).await.unwrap();
        assert_eq!(r2.generation(), 2);

        let r3 = db.delete("doc1").await.unwrap();
        assert_eq!(r3.generation(), 3);
        assert!(db.document("doc1").await.unwrap().is_none());
        assert_eq!(db.current_revision("doc1").await.unwrap(), Some(r3));
    }

    #[tokio::test]
    async fn test_stale_save_fails() {
        let db = peer("db1");
        let mut doc = Document::new("doc1");
        doc.set("name", "tiger");
        db.save(&doc).await.unwrap();

        // Saving the unrevisioned copy again is a conflicting local edit.
        let err = db.save(&doc).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Storage(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_delete_missing_key() {
        let db = peer("db1");
        let err = db.delete("ghost").await.unwrap_err();
        assert!(matches!(err, ReplicationError::Storage(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_export_and_receive_push() {
        let a = peer("a");
        let b = peer("b");
        let mut doc = Document::new("doc1");
        doc.set("name", "tiger");
        let rev = a.save(&doc).await.unwrap();

        let refs = vec![RevisionRef::new("doc1", rev.clone())];
        assert_eq!(b.missing(&refs).await.unwrap().len(), 1);

        let payload = a.export_revision("doc1", &rev).await.unwrap();
        assert_eq!(b.receive_push(&payload).await.unwrap(), ApplyOutcome::Applied);
        assert!(b.missing(&refs).await.unwrap().is_empty());
        assert_eq!(b.sequence_hint(), 1);
    }

    #[tokio::test]
    async fn test_export_unknown_revision() {
        let a = peer("a");
        let err = a.export_revision("doc1", &RevisionId::new(1, "abc")).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Storage(StoreError::NotFound(_))));
    }
}
