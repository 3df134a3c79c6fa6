// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport integration trait.
//!
//! A [`Transport`] is the active side's view of one remote endpoint: it can
//! list the remote's change feed, ask which revisions the remote lacks, fetch
//! encoded revision bundles, push bundles for the remote to apply, and claim
//! a conflicting pair before resolving it.
//!
//! The network implementation is someone else's problem. This crate ships a
//! [`LoopbackTransport`] that talks to an in-process [`Peer`] and can be made
//! unreachable to simulate a listener going away.
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_mesh::config::CoordinatorSettings;
//! use replication_mesh::peer::Peer;
//! use replication_mesh::transport::{LoopbackTransport, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = Peer::new("hub", CoordinatorSettings::default());
//! let transport = LoopbackTransport::new(hub);
//!
//! let batch = transport.list_changes(0, 100).await?;
//! println!("{} changes on {}", batch.changes.len(), transport.endpoint());
//!
//! transport.set_reachable(false); // listener stopped
//! assert!(transport.list_changes(0, 100).await.is_err());
//! # Ok(())
//! # }
//! ```

use crate::coordinator::{ApplyOutcome, ClaimVerdict, ResolutionClaim};
use crate::error::ReplicationError;
use crate::peer::Peer;
use crate::revision::{RevisionId, RevisionRef};
use crate::store::ChangeBatch;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Type alias for boxed transport futures.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Remote endpoint cannot be reached (listener down, connection refused,
    /// timeout). Transient.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Remote answered with something unusable. Not transient.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the call may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Remote verdict on one pushed revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAck {
    /// Stored as new key or fast-forward.
    Applied,
    /// Remote already had the revision.
    Duplicate,
    /// Remote is resolving this key; the revision is queued behind it.
    Deferred,
    /// Conflicting push refused by a passive endpoint; nothing stored.
    Rejected,
}

impl PushAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Deferred => "deferred",
            Self::Rejected => "rejected",
        }
    }
}

impl From<ApplyOutcome> for PushAck {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied => Self::Applied,
            ApplyOutcome::Duplicate => Self::Duplicate,
            // Accepted for resolution on the receiving side.
            ApplyOutcome::Conflict | ApplyOutcome::Deferred | ApplyOutcome::Claimed => Self::Deferred,
            ApplyOutcome::Rejected => Self::Rejected,
        }
    }
}

/// What the replication core needs from a connection to one remote endpoint.
pub trait Transport: Send + Sync + 'static {
    /// Name of the remote endpoint (for logs and status).
    fn endpoint(&self) -> &str;

    /// Remote changes after `since`. Keys that are conflicted or awaiting
    /// resolution on the remote are held back; `last_sequence` still covers
    /// them.
    fn list_changes(&self, since: u64, limit: usize) -> TransportFuture<'_, ChangeBatch>;

    /// Subset of `refs` the remote does not hold.
    fn missing(&self, refs: Vec<RevisionRef>) -> TransportFuture<'_, Vec<RevisionRef>>;

    /// Encoded bundle (revision plus ancestors) for `key@rev`.
    fn fetch_revision(&self, key: &str, rev: &RevisionId) -> TransportFuture<'_, Vec<u8>>;

    /// Hand an encoded bundle to the remote.
    fn push_revision(&self, key: &str, rev: &RevisionId, payload: Vec<u8>) -> TransportFuture<'_, PushAck>;

    /// Remote sequence hint. Endpoints that cannot push notifications return
    /// `None` and are polled.
    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        None
    }

    /// Ask the remote to leave `claim.pair` to the caller. Endpoints that do
    /// not track claims grant everything.
    fn claim(&self, claim: ResolutionClaim) -> TransportFuture<'_, ClaimVerdict> {
        let _ = claim;
        Box::pin(async { Ok(ClaimVerdict::Granted) })
    }
}

/// In-process transport to a [`Peer`].
///
/// Every call crosses the same boundary a network transport would: bundles
/// travel encoded, remote errors come back as [`TransportError`].
pub struct LoopbackTransport {
    remote: Arc<Peer>,
    reachable: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(remote: Arc<Peer>) -> Self {
        Self {
            remote,
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulate the remote listener stopping (`false`) or starting (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        debug!(endpoint = %self.remote.name(), reachable, "Loopback reachability changed");
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> &Arc<Peer> {
        &self.remote
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(TransportError::Unreachable(self.remote.name().to_string()))
        }
    }
}

/// Remote-side failures surface to the caller as protocol errors.
fn remote_error(err: ReplicationError) -> TransportError {
    TransportError::Protocol(err.to_string())
}

impl Transport for LoopbackTransport {
    fn endpoint(&self) -> &str {
        self.remote.name()
    }

    fn list_changes(&self, since: u64, limit: usize) -> TransportFuture<'_, ChangeBatch> {
        Box::pin(async move {
            self.check_reachable()?;
            self.remote.changes_since(since, limit).await.map_err(remote_error)
        })
    }

    fn missing(&self, refs: Vec<RevisionRef>) -> TransportFuture<'_, Vec<RevisionRef>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.remote.missing(&refs).await.map_err(remote_error)
        })
    }

    fn fetch_revision(&self, key: &str, rev: &RevisionId) -> TransportFuture<'_, Vec<u8>> {
        let key = key.to_string();
        let rev = rev.clone();
        Box::pin(async move {
            self.check_reachable()?;
            self.remote.export_revision(&key, &rev).await.map_err(remote_error)
        })
    }

    fn push_revision(&self, key: &str, rev: &RevisionId, payload: Vec<u8>) -> TransportFuture<'_, PushAck> {
        let target = RevisionRef::new(key, rev.clone());
        Box::pin(async move {
            self.check_reachable()?;
            let outcome = self.remote.receive_push(&payload).await.map_err(remote_error)?;
            debug!(endpoint = %self.remote.name(), revision = %target, ?outcome, "Push applied on remote");
            Ok(PushAck::from(outcome))
        })
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.remote.subscribe())
    }

    fn claim(&self, claim: ResolutionClaim) -> TransportFuture<'_, ClaimVerdict> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.remote.receive_claim(&claim).await)
        })
    }
}
