// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resolution task: claim, invoke the resolver, validate, commit, drain.

use super::{ClaimVerdict, ConflictPair, KeyState, LinkContext, Ownership, ResolutionClaim, ResolutionCoordinator};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resolver::{Conflict, ConflictResolver, ResolverRef};
use crate::revision::{Body, Document, RevisionId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What a commit attempt found.
enum Commit {
    Merged(RevisionId),
    /// Fewer than two leaves remain; nothing to merge.
    Settled,
    /// One side was superseded; resolve this pair instead.
    Raced { local: RevisionId, remote: RevisionId },
}

/// Accept a resolver's answer only if it belongs to this conflict.
///
/// A document for another key, or one carrying a revision that is neither
/// side of the conflict, is treated as the resolver declining.
pub(crate) fn check_lineage(conflict: &Conflict, output: &Option<Document>) -> std::result::Result<(), String> {
    let Some(doc) = output else {
        return Ok(());
    };
    if doc.key != conflict.key {
        return Err(format!("resolver returned key {:?} for {:?}", doc.key, conflict.key));
    }
    match &doc.revision {
        Some(rev) if !conflict.involves(rev) => Err(format!("resolver returned foreign revision {}", rev)),
        _ => Ok(()),
    }
}

impl ResolutionCoordinator {
    pub(super) async fn run_resolution(
        self: Arc<Self>,
        key: String,
        mut local: RevisionId,
        mut remote: RevisionId,
        link: LinkContext,
    ) {
        let started = Instant::now();
        let resolver = link
            .resolver
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_resolver));

        let result: Result<Option<RevisionId>> = if !self.claim_pair(&key, &local, &remote, &link, &resolver).await {
            Ok(None)
        } else {
            let _permit = match self.bulkhead.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    warn!(error = %e, "Resolution bulkhead closed, resolving without a slot");
                    None
                }
            };

            loop {
                let conflict = match self.build_conflict(&key, &local, &remote).await {
                    Ok(conflict) => conflict,
                    Err(e) => break Err(e),
                };
                let body = self.invoke(&resolver, conflict).await;

                match self.commit(&key, &local, &remote, body, &resolver).await {
                    Ok(Commit::Merged(rev)) => break Ok(Some(rev)),
                    Ok(Commit::Settled) => {
                        debug!("Conflict settled without a merge");
                        break Ok(None);
                    }
                    Ok(Commit::Raced { local: l, remote: r }) => {
                        local = l;
                        remote = r;
                    }
                    Err(e) => break Err(e),
                }
            }
        };

        let committed = match result {
            Ok(Some(rev)) => {
                info!(rev = %rev, elapsed_ms = started.elapsed().as_millis() as u64, "Conflict resolved");
                metrics::record_resolution_committed(&self.peer, started.elapsed());
                true
            }
            Ok(None) => true,
            Err(e) => {
                error!(error = %e, "Resolution failed, key left unresolved");
                self.failed.fetch_add(1, Ordering::SeqCst);
                metrics::record_resolution_failed(&self.peer);
                self.release(&key, &resolver).await;
                false
            }
        };

        if let Some(tracker) = &link.tracker {
            tracker.finish(committed);
        }
        self.prune_slot(&key);
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_resolutions_in_flight(&self.peer, remaining);
    }

    /// Claim the pair from the peer the remote leaf was pulled from.
    ///
    /// Returns whether this peer resolves it. Otherwise the pending marker is
    /// dropped and the key stays conflicted until the owner's merge arrives.
    /// An unreachable source counts as a grant.
    async fn claim_pair(
        self: &Arc<Self>,
        key: &str,
        local: &RevisionId,
        remote: &RevisionId,
        link: &LinkContext,
        resolver: &ResolverRef,
    ) -> bool {
        let Some(source) = &link.source else {
            return true;
        };
        let claim = ResolutionClaim {
            key: key.to_string(),
            pair: ConflictPair::new(local.clone(), remote.clone()),
            claimant: self.peer.clone(),
        };
        let verdict = match source.claim(claim.clone()).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(endpoint = source.endpoint(), error = %e, "Claim failed, resolving here");
                ClaimVerdict::Granted
            }
        };

        let slot = self.slot(key);
        let mut state = slot.lock().await;
        let yielded = state.pending.as_ref().map_or(true, |p| p.owner == Ownership::Yielded);
        if verdict == ClaimVerdict::Granted && !yielded {
            if let Some(pending) = state.pending.as_mut() {
                pending.owner = Ownership::Local;
            }
            return true;
        }

        if !state.is_granted(&claim.pair) {
            state.granted = Some(ResolutionClaim {
                claimant: source.endpoint().to_string(),
                ..claim
            });
        }
        let owner = state.granted.as_ref().map(|g| g.claimant.clone()).unwrap_or_default();
        info!(%owner, "Pair claimed elsewhere, waiting for its merge");
        metrics::record_resolution_yielded(&self.peer);

        state.pending = None;
        self.drain_deferred(key, &mut state, resolver).await;
        self.refresh_hold(key, &state).await;
        false
    }

    async fn build_conflict(&self, key: &str, local: &RevisionId, remote: &RevisionId) -> Result<Conflict> {
        let fetch = |rev: &RevisionId| {
            let rev = rev.clone();
            async move {
                self.store
                    .revision(key, &rev)
                    .await?
                    .ok_or_else(|| ReplicationError::Internal(format!("{}@{} vanished during resolution", key, rev)))
            }
        };
        let local_rev = fetch(local).await?;
        let remote_rev = fetch(remote).await?;

        let snapshot = |rev: &crate::revision::Revision| (!rev.deleted).then(|| Document::from_revision(key, rev));
        Ok(Conflict {
            key: key.to_string(),
            local: snapshot(&local_rev),
            remote: snapshot(&remote_rev),
            local_revision: local.clone(),
            remote_revision: remote.clone(),
        })
    }

    /// Run the resolver on the blocking pool. Returns the merge body, `None`
    /// for a tombstone.
    async fn invoke(&self, resolver: &ResolverRef, conflict: Conflict) -> Option<Body> {
        let started = Instant::now();
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let task_resolver = Arc::clone(resolver);
        let task_conflict = conflict.clone();
        let output = match tokio::task::spawn_blocking(move || task_resolver.resolve(&task_conflict)).await {
            Ok(output) => match check_lineage(&conflict, &output) {
                Ok(()) => output,
                Err(reason) => {
                    warn!(resolver = resolver.name(), %reason, "Resolver declined, using default policy");
                    metrics::record_resolver_fallback(&self.peer, "lineage");
                    self.default_resolver.resolve(&conflict)
                }
            },
            Err(e) => {
                warn!(resolver = resolver.name(), error = %e, "Resolver failed, using default policy");
                metrics::record_resolver_fallback(&self.peer, "panic");
                self.default_resolver.resolve(&conflict)
            }
        };
        metrics::record_resolver_invocation(&self.peer, resolver.name(), started.elapsed());

        output.and_then(|doc| (!doc.deleted).then_some(doc.body))
    }

    async fn commit(
        self: &Arc<Self>,
        key: &str,
        local: &RevisionId,
        remote: &RevisionId,
        body: Option<Body>,
        resolver: &ResolverRef,
    ) -> Result<Commit> {
        let slot = self.slot(key);
        let mut state = slot.lock().await;
        let leaves = self.store.leaves(key).await?;

        if leaves.contains(local) && leaves.contains(remote) {
            let merged = self.store.merge(key, local, remote, body).await?;
            state.pending = None;
            self.drain_deferred(key, &mut state, resolver).await;
            self.refresh_hold(key, &state).await;
            return Ok(Commit::Merged(merged));
        }

        let race = ReplicationError::ResolverRace {
            key: key.to_string(),
            message: format!("{} or {} is no longer a leaf", local, remote),
        };
        warn!(error = %race, leaves = leaves.len(), "Discarding stale resolver output");
        metrics::record_resolver_race(&self.peer);

        let current = self.store.current_revision(key).await?;
        let Some((local, remote)) = rebuild_pair(&leaves, current) else {
            state.pending = None;
            self.drain_deferred(key, &mut state, resolver).await;
            self.refresh_hold(key, &state).await;
            return Ok(Commit::Settled);
        };
        if let Some(pending) = state.pending.as_mut() {
            pending.local = local.clone();
            pending.remote = remote.clone();
        }
        Ok(Commit::Raced { local, remote })
    }

    /// Clear the pending marker after a failed resolution.
    async fn release(self: &Arc<Self>, key: &str, resolver: &ResolverRef) {
        let slot = self.slot(key);
        let mut state = slot.lock().await;
        state.pending = None;
        self.drain_deferred(key, &mut state, resolver).await;
        self.refresh_hold(key, &state).await;
    }

    /// Re-apply queued revisions in arrival order until one starts a new
    /// resolution. Queued pushes that now conflict are resolved with
    /// `resolver`.
    async fn drain_deferred(self: &Arc<Self>, key: &str, state: &mut KeyState, resolver: &ResolverRef) {
        while state.pending.is_none() {
            let Some(item) = state.deferred.pop_front() else {
                break;
            };
            let rev = item.bundle.id().clone();
            let link = LinkContext {
                resolver: item.link.resolver.or_else(|| Some(Arc::clone(resolver))),
                ..item.link
            };

            match self.apply_locked(state, item.bundle, Some(link)).await {
                Ok(outcome) => {
                    debug!(key, rev = %rev, origin = ?item.origin, %outcome, "Drained deferred apply");
                    metrics::record_apply(&self.peer, outcome.as_str());
                }
                Err(e) => warn!(key, rev = %rev, error = %e, "Deferred apply failed"),
            }
        }
    }
}

/// Pick the pair to resolve after a race: the current revision if it is a
/// leaf (else the highest leaf) against the highest other leaf. `None` once
/// fewer than two leaves remain.
fn rebuild_pair(leaves: &[RevisionId], current: Option<RevisionId>) -> Option<(RevisionId, RevisionId)> {
    if leaves.len() < 2 {
        return None;
    }
    let local = current
        .filter(|c| leaves.contains(c))
        .or_else(|| leaves.last().cloned())?;
    let remote = leaves.iter().rev().find(|l| **l != local).cloned()?;
    Some((local, remote))
}
