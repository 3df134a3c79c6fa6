// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordinator types.
//!
//! # Apply outcomes
//!
//! ```text
//!                      incoming bundle
//!                            │
//!           already held? ───┼──→ Duplicate
//!     resolution pending? ───┼──→ Deferred   (queued, drained after commit)
//!  new key / fast-forward? ──┼──→ Applied
//!                            │
//!                 conflicting leaf
//!                 ├── Push origin ──→ Rejected   (nothing stored)
//!                 └── Pull origin
//!                     ├── pair claimed elsewhere ──→ Claimed   (leaf grafted, wait for merge)
//!                     └── otherwise ───────────────→ Conflict  (leaf grafted, resolution spawned)
//! ```
//!
//! # Claims
//!
//! Before invoking its resolver, a peer asks the peer it pulled the
//! conflicting leaf from to grant it the pair. The remote refuses if it is
//! resolving the same pair itself, or has granted it to someone else. When
//! both sides are still waiting on their own claims, the peer with the lower
//! name keeps the pair.

use crate::resolver::ResolverRef;
use crate::revision::{RevisionBundle, RevisionId};
use crate::transport::Transport;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Which side of a link delivered a revision to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Fetched by one of this peer's own (active) links.
    Pull,
    /// Pushed to this peer by a remote's active link.
    Push,
}

/// Result of applying one incoming revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
    Conflict,
    Deferred,
    Rejected,
    /// Conflicting leaf kept; another peer resolves the pair.
    Claimed,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Conflict => "conflict",
            Self::Deferred => "deferred",
            Self::Rejected => "rejected",
            Self::Claimed => "claimed",
        }
    }
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two conflicting leaves, lower id first, so every peer names a pair the
/// same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictPair {
    pub low: RevisionId,
    pub high: RevisionId,
}

impl ConflictPair {
    pub fn new(a: RevisionId, b: RevisionId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

impl std::fmt::Display for ConflictPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.low, self.high)
    }
}

/// Request to be the only peer that resolves `pair` on `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionClaim {
    pub key: String,
    pub pair: ConflictPair,
    pub claimant: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimVerdict {
    Granted,
    Refused,
}

impl ClaimVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Refused => "refused",
        }
    }
}

/// Who will run the resolver for a pending pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Waiting for the source peer to answer our claim.
    Claiming,
    /// This peer resolves.
    Local,
    /// Granted to a remote claimant while our own claim was outstanding.
    Yielded,
}

/// The conflicting pair a resolution is working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResolution {
    pub local: RevisionId,
    pub remote: RevisionId,
    pub owner: Ownership,
    pub started: Instant,
}

impl PendingResolution {
    pub fn pair(&self) -> ConflictPair {
        ConflictPair::new(self.local.clone(), self.remote.clone())
    }
}

/// What a pulling link hands over with each revision.
#[derive(Clone, Default)]
pub struct LinkContext {
    /// Resolver for conflicts this revision starts (`None`: default policy).
    pub resolver: Option<ResolverRef>,
    /// Credited with any resolution this revision starts.
    pub tracker: Option<Arc<ResolutionTracker>>,
    /// Way back to the peer the revision came from, for claims.
    pub source: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("resolver", &self.resolver.as_ref().map(|r| r.name()))
            .field("source", &self.source.as_ref().map(|s| s.endpoint()))
            .finish()
    }
}

/// An apply that arrived while its key was being resolved.
pub(crate) struct DeferredApply {
    pub bundle: RevisionBundle,
    pub origin: Origin,
    pub link: LinkContext,
}

/// Per-key state, guarded by that key's mutex.
#[derive(Default)]
pub(crate) struct KeyState {
    pub pending: Option<PendingResolution>,
    pub deferred: VecDeque<DeferredApply>,
    /// Pair this peer leaves to another peer.
    pub granted: Option<ResolutionClaim>,
}

impl KeyState {
    /// Whether the key must be held back from change feeds.
    pub fn is_held(&self) -> bool {
        self.pending.is_some() || !self.deferred.is_empty()
    }

    /// Nothing worth keeping the slot for.
    pub fn is_idle(&self) -> bool {
        !self.is_held() && self.granted.is_none()
    }

    /// Whether `pair` belongs to another peer.
    pub fn is_granted(&self, pair: &ConflictPair) -> bool {
        self.granted.as_ref().map_or(false, |g| &g.pair == pair)
    }

    /// Answer a remote peer's claim on one of this key's pairs. `peer` is
    /// this peer's name.
    pub fn judge_claim(&mut self, peer: &str, claim: &ResolutionClaim) -> ClaimVerdict {
        if let Some(granted) = self.granted.as_ref().filter(|g| g.pair == claim.pair) {
            return if granted.claimant == claim.claimant {
                ClaimVerdict::Granted
            } else {
                ClaimVerdict::Refused
            };
        }

        if let Some(pending) = self.pending.as_mut().filter(|p| p.pair() == claim.pair) {
            match pending.owner {
                Ownership::Local | Ownership::Yielded => return ClaimVerdict::Refused,
                Ownership::Claiming if peer < claim.claimant.as_str() => return ClaimVerdict::Refused,
                Ownership::Claiming => pending.owner = Ownership::Yielded,
            }
        }

        self.granted = Some(claim.clone());
        ClaimVerdict::Granted
    }

    /// Forget a grant once a revision covering both of its leaves is stored.
    pub fn settle_grant(&mut self, merged: &RevisionBundle) {
        if self
            .granted
            .as_ref()
            .map_or(false, |g| merged.descends_from(&g.pair.low) && merged.descends_from(&g.pair.high))
        {
            self.granted = None;
        }
    }
}

/// Counters for the resolutions one link triggered.
///
/// The link reports itself busy while `in_flight() > 0`.
#[derive(Debug, Default)]
pub struct ResolutionTracker {
    in_flight: AtomicUsize,
    resolved: AtomicU64,
    failed: AtomicU64,
}

impl ResolutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn finish(&self, committed: bool) {
        if committed {
            self.resolved.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolutions that ended with a committed merge (or found nothing left
    /// to merge).
    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Resolutions abandoned on a storage failure.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(ApplyOutcome::Applied.to_string(), "applied");
        assert_eq!(ApplyOutcome::Conflict.to_string(), "conflict");
        assert_eq!(ApplyOutcome::Rejected.as_str(), "rejected");
        assert_eq!(ApplyOutcome::Claimed.to_string(), "claimed");
    }

    #[test]
    fn test_key_state_held() {
        let mut state = KeyState::default();
        assert!(!state.is_held());
        state.pending = Some(pending("a", "b", Ownership::Local));
        assert!(state.is_held());
        assert!(!state.is_idle());
    }

    fn pending(local: &str, remote: &str, owner: Ownership) -> PendingResolution {
        PendingResolution {
            local: RevisionId::new(2, local),
            remote: RevisionId::new(2, remote),
            owner,
            started: Instant::now(),
        }
    }

    fn claim(claimant: &str) -> ResolutionClaim {
        ResolutionClaim {
            key: "doc1".into(),
            pair: ConflictPair::new(RevisionId::new(2, "b"), RevisionId::new(2, "a")),
            claimant: claimant.into(),
        }
    }

    #[test]
    fn test_pair_order_independent() {
        let a = RevisionId::new(2, "a");
        let b = RevisionId::new(3, "b");
        assert_eq!(ConflictPair::new(a.clone(), b.clone()), ConflictPair::new(b.clone(), a.clone()));
        assert_eq!(ConflictPair::new(b, a).to_string(), "2-a+3-b");
    }

    #[test]
    fn test_claim_granted_when_idle_and_sticky() {
        let mut state = KeyState::default();
        assert_eq!(state.judge_claim("hub", &claim("db2")), ClaimVerdict::Granted);
        assert!(state.is_granted(&claim("db2").pair));
        assert!(!state.is_idle());

        // Repeated by the same claimant, refused to anyone else.
        assert_eq!(state.judge_claim("hub", &claim("db2")), ClaimVerdict::Granted);
        assert_eq!(state.judge_claim("hub", &claim("db1")), ClaimVerdict::Refused);
    }

    #[test]
    fn test_claim_refused_while_resolving_locally() {
        let mut state = KeyState::default();
        state.pending = Some(pending("a", "b", Ownership::Local));
        assert_eq!(state.judge_claim("b", &claim("a")), ClaimVerdict::Refused);
        assert!(state.granted.is_none());
    }

    #[test]
    fn test_crossed_claims_lower_name_keeps_pair() {
        let mut on_a = KeyState::default();
        on_a.pending = Some(pending("a", "b", Ownership::Claiming));
        let mut on_b = KeyState::default();
        on_b.pending = Some(pending("b", "a", Ownership::Claiming));

        assert_eq!(on_a.judge_claim("a", &claim("b")), ClaimVerdict::Refused);
        assert_eq!(on_b.judge_claim("b", &claim("a")), ClaimVerdict::Granted);
        assert_eq!(on_a.pending.as_ref().map(|p| p.owner), Some(Ownership::Claiming));
        assert_eq!(on_b.pending.as_ref().map(|p| p.owner), Some(Ownership::Yielded));
    }

    #[test]
    fn test_claim_on_other_pair_is_granted() {
        let mut state = KeyState::default();
        state.pending = Some(pending("a", "c", Ownership::Local));
        assert_eq!(state.judge_claim("b", &claim("a")), ClaimVerdict::Granted);
    }

    #[test]
    fn test_tracker_counts() {
        let tracker = ResolutionTracker::new();
        tracker.begin();
        tracker.begin();
        assert_eq!(tracker.in_flight(), 2);

        tracker.finish(true);
        tracker.finish(false);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.resolved(), 1);
        assert_eq!(tracker.failed(), 1);
    }
}
