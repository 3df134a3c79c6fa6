// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer resolution coordinator.
//!
//! Every mutation of a key on a peer (local edit, incoming apply, merge
//! commit) runs under that key's async mutex. Unrelated keys never contend.
//! A key's slot is dropped again once nothing is pending on it.
//!
//! # Exactly-once resolution
//!
//! When a pulled revision conflicts with the local leaf, the remote leaf is
//! grafted without moving the current pointer, the key is marked pending and
//! a resolution task is spawned. Until that task finishes:
//!
//! - further applies for the key are queued (`Deferred`) rather than grafted,
//!   so no second conflict can form on the same key
//! - the key is held back from this peer's change feed, so neither side of
//!   the conflict leaks to downstream peers
//!
//! Conflicting pushes from a remote's active link are refused (`Rejected`);
//! the pushing side will see this peer's leaf on its next pull.
//!
//! Peers that pulled the same pair from each other (two-way links, cycles)
//! would each resolve it. The task therefore claims the pair from the peer
//! it pulled the leaf from before invoking anything; a refused claim clears
//! the pending marker and the key waits, conflicted and hidden, for the
//! owner's merge to arrive as a fast-forward. A pair this peer granted is
//! never resolved here (`Claimed`).
//!
//! # Resolution task
//!
//! ```text
//! claim → bulkhead permit → resolver (blocking pool) → lineage check → commit
//!   │ refused                      │ panic                   │ foreign lineage
//!   └─ wait for owner's merge      └──── default policy ─────┘
//! commit: both leaves still present? ── yes → merge, drain deferred
//!                                    └─ no  → ResolverRace, rebuild, retry
//! ```
//!
//! # Feed filtering
//!
//! Held and conflicted keys are filtered out of [`changes_since`], but the
//! page's `last_sequence` still covers them, so a link's checkpoint can move
//! past a hidden entry. Releasing a hold therefore re-announces the key at a
//! fresh sequence.
//!
//! [`changes_since`]: ResolutionCoordinator::changes_since

mod resolution;
mod types;

pub use types::{
    ApplyOutcome, ClaimVerdict, ConflictPair, LinkContext, Origin, Ownership, PendingResolution, ResolutionClaim,
    ResolutionTracker,
};
pub(crate) use types::{DeferredApply, KeyState};

use crate::config::CoordinatorSettings;
use crate::error::Result;
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::resolver::{DefaultResolver, ResolverRef};
use crate::revision::{Body, RevisionBundle, RevisionId};
use crate::store::{ChangeBatch, RevisionStore};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info_span, warn, Instrument};

/// Serializes mutations per key and runs conflict resolutions for one peer.
pub struct ResolutionCoordinator {
    peer: String,
    store: Arc<dyn RevisionStore>,
    slots: DashMap<String, Arc<Mutex<KeyState>>>,
    /// Keys with a pending resolution or queued applies.
    held: DashSet<String>,
    bulkhead: Bulkhead,
    default_resolver: ResolverRef,
    in_flight: AtomicUsize,
    invocations: AtomicU64,
    failed: AtomicU64,
    /// Latest store sequence, for link wake-ups.
    changes: watch::Sender<u64>,
}

impl ResolutionCoordinator {
    pub fn new(peer: impl Into<String>, store: Arc<dyn RevisionStore>, settings: &CoordinatorSettings) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            peer: peer.into(),
            store,
            slots: DashMap::new(),
            held: DashSet::new(),
            bulkhead: Bulkhead::new(settings.max_concurrent_resolutions),
            default_resolver: Arc::new(DefaultResolver),
            in_flight: AtomicUsize::new(0),
            invocations: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            changes,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn store(&self) -> &Arc<dyn RevisionStore> {
        &self.store
    }

    /// Receiver that changes whenever the store's sequence advances.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Last sequence published to subscribers.
    pub fn sequence_hint(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Resolutions spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total resolver invocations on this peer (retries after a race and
    /// panicking calls included).
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Resolutions abandoned on a storage failure.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Whether `key` is held back from change feeds.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    /// Pending resolution for `key`, if any.
    pub async fn pending(&self, key: &str) -> Option<PendingResolution> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        let state = slot.lock().await;
        state.pending.clone()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<KeyState>> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(key.to_string()).or_default().value())
    }

    /// Drop the slot of `key` when no task references it and it carries no
    /// state. Callers must have released their own clone first.
    fn prune_slot(&self, key: &str) {
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().map_or(false, |state| state.is_idle())
        });
    }

    /// Bring the feed filter in line with `state`. A released key gets a
    /// fresh sequence and subscribers are woken.
    async fn refresh_hold(&self, key: &str, state: &KeyState) {
        if state.is_held() {
            self.held.insert(key.to_string());
            return;
        }
        if self.held.remove(key).is_none() {
            return;
        }
        if let Err(e) = self.store.touch(key).await {
            warn!(peer = %self.peer, key, error = %e, "Failed to re-announce released key");
        }
        self.publish_sequence().await;
    }

    async fn publish_sequence(&self) {
        match self.store.last_sequence().await {
            Ok(seq) => {
                self.changes.send_if_modified(|current| {
                    if seq > *current {
                        *current = seq;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => warn!(peer = %self.peer, error = %e, "Failed to read store sequence"),
        }
    }

    /// Local edit on `key`. `parent` must be the current revision.
    pub async fn put(&self, key: &str, body: Option<Body>, parent: Option<RevisionId>) -> Result<RevisionId> {
        let slot = self.slot(key);
        let guard = slot.lock().await;
        let result = self.store.put(key, body, parent).await;
        drop(guard);
        drop(slot);
        self.prune_slot(key);

        let rev = result?;
        debug!(peer = %self.peer, key, rev = %rev, "Local edit");
        self.publish_sequence().await;
        Ok(rev)
    }

    /// Change feed with conflicted and held keys filtered out.
    pub async fn changes_since(&self, since: u64, limit: usize) -> Result<ChangeBatch> {
        let mut batch = self.store.changes_since(since, limit).await?;
        batch
            .changes
            .retain(|change| !change.conflicted && !self.held.contains(&change.key));
        Ok(batch)
    }

    /// Apply a revision delivered by a link.
    ///
    /// For pulls, `link` supplies the resolver, the tracker credited with
    /// any resolution this apply starts, and the route for claiming it.
    /// Pushes pass `LinkContext::default()`.
    pub async fn apply(self: &Arc<Self>, bundle: RevisionBundle, origin: Origin, link: LinkContext) -> Result<ApplyOutcome> {
        let key = bundle.key.clone();
        let slot = self.slot(&key);
        let mut state = slot.lock().await;

        let result = self.apply_in_slot(&mut state, bundle, origin, link).await;
        self.refresh_hold(&key, &state).await;
        drop(state);
        drop(slot);
        self.prune_slot(&key);

        let outcome = result?;
        metrics::record_apply(&self.peer, outcome.as_str());
        Ok(outcome)
    }

    async fn apply_in_slot(
        self: &Arc<Self>,
        state: &mut KeyState,
        bundle: RevisionBundle,
        origin: Origin,
        link: LinkContext,
    ) -> Result<ApplyOutcome> {
        if self.store.contains(&bundle.key, bundle.id()).await? {
            return Ok(ApplyOutcome::Duplicate);
        }

        if state.pending.is_some() {
            debug!(peer = %self.peer, key = %bundle.key, rev = %bundle.id(), ?origin, "Resolution pending, deferring apply");
            state.deferred.push_back(DeferredApply { bundle, origin, link });
            metrics::record_deferred(&self.peer);
            return Ok(ApplyOutcome::Deferred);
        }

        let on_conflict = match origin {
            Origin::Pull => Some(link),
            Origin::Push => None,
        };
        self.apply_locked(state, bundle, on_conflict).await
    }

    /// Apply with the key's mutex held and no resolution pending.
    ///
    /// `on_conflict` of `None` refuses conflicting revisions. The caller
    /// refreshes the hold afterwards.
    async fn apply_locked(
        self: &Arc<Self>,
        state: &mut KeyState,
        bundle: RevisionBundle,
        on_conflict: Option<LinkContext>,
    ) -> Result<ApplyOutcome> {
        let key = bundle.key.clone();
        let incoming = bundle.id().clone();

        if self.store.contains(&key, &incoming).await? {
            return Ok(ApplyOutcome::Duplicate);
        }

        let current = self.store.current_revision(&key).await?;
        let local = match current {
            Some(local) if !bundle.descends_from(&local) => local,
            _ => {
                state.settle_grant(&bundle);
                self.store.graft(bundle, true).await?;
                debug!(peer = %self.peer, key = %key, rev = %incoming, "Applied revision");
                self.publish_sequence().await;
                return Ok(ApplyOutcome::Applied);
            }
        };

        let Some(link) = on_conflict else {
            debug!(peer = %self.peer, key = %key, local = %local, remote = %incoming, "Rejected conflicting push");
            return Ok(ApplyOutcome::Rejected);
        };

        if state.is_granted(&ConflictPair::new(local.clone(), incoming.clone())) {
            self.store.graft(bundle, false).await?;
            debug!(peer = %self.peer, key = %key, local = %local, remote = %incoming, "Pair claimed elsewhere, waiting for its merge");
            metrics::record_conflict_detected(&self.peer);
            self.publish_sequence().await;
            return Ok(ApplyOutcome::Claimed);
        }

        // Hold the key before the second leaf becomes visible.
        let owner = if link.source.is_some() {
            Ownership::Claiming
        } else {
            Ownership::Local
        };
        state.pending = Some(PendingResolution {
            local: local.clone(),
            remote: incoming.clone(),
            owner,
            started: Instant::now(),
        });
        self.held.insert(key.clone());

        if let Err(e) = self.store.graft(bundle, false).await {
            state.pending = None;
            return Err(e.into());
        }

        debug!(peer = %self.peer, key = %key, local = %local, remote = %incoming, "Conflict detected");
        metrics::record_conflict_detected(&self.peer);
        self.publish_sequence().await;
        self.spawn_resolution(key, local, incoming, link);
        Ok(ApplyOutcome::Conflict)
    }

    /// Answer a remote peer's request to be the one resolving a pair.
    pub async fn claim(&self, claim: &ResolutionClaim) -> ClaimVerdict {
        let slot = self.slot(&claim.key);
        let mut state = slot.lock().await;
        let verdict = state.judge_claim(&self.peer, claim);
        drop(state);
        drop(slot);
        self.prune_slot(&claim.key);

        debug!(
            peer = %self.peer,
            key = %claim.key,
            pair = %claim.pair,
            claimant = %claim.claimant,
            verdict = verdict.as_str(),
            "Answered claim"
        );
        metrics::record_claim_answered(&self.peer, verdict.as_str());
        verdict
    }

    fn spawn_resolution(self: &Arc<Self>, key: String, local: RevisionId, remote: RevisionId, link: LinkContext) {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_resolutions_in_flight(&self.peer, in_flight);
        if let Some(tracker) = &link.tracker {
            tracker.begin();
        }

        let span = info_span!("resolution", peer = %self.peer, key = %key);
        let this = Arc::clone(self);
        tokio::spawn(this.run_resolution(key, local, remote, link).instrument(span));
    }
}
