// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication link between a local [`Peer`] and one remote endpoint.
//!
//! A [`Replicator`] owns one background task that runs pull/push cycles
//! against its [`Transport`]. Conflicts found while pulling are handed to the
//! local peer's coordinator and resolved on the blocking pool; the link keeps
//! servicing other keys meanwhile.
//!
//! # Lifecycle
//!
//! - [`start()`](Replicator::start) is only valid from `Stopped` and may be
//!   called again after a stop
//! - [`stop()`](Replicator::stop) signals the task, which finishes the
//!   revision it is applying and exits; resolutions it triggered keep running
//! - [`status()`](Replicator::status) is lock-free and reports `Busy` while
//!   either side is known to be ahead of this link's checkpoints
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_mesh::checkpoint::CheckpointStore;
//! use replication_mesh::config::{CoordinatorSettings, LinkSettings};
//! use replication_mesh::peer::Peer;
//! use replication_mesh::replicator::{Activity, Replicator, ReplicatorConfig, ReplicatorType};
//! use replication_mesh::transport::LoopbackTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = Peer::new("hub", CoordinatorSettings::default());
//! let db = Peer::new("db1", CoordinatorSettings::default());
//!
//! let config = ReplicatorConfig::new(db, Arc::new(LoopbackTransport::new(hub)))
//!     .replicator_type(ReplicatorType::PushAndPull)
//!     .continuous(true)
//!     .settings(LinkSettings::for_testing());
//! let link = Replicator::new(config, Arc::new(CheckpointStore::in_memory()));
//!
//! link.start().await?;
//! link.wait_for_activity(Activity::Idle, Duration::from_secs(5)).await;
//! link.stop().await;
//! # Ok(())
//! # }
//! ```

mod status;
mod sync;

pub use status::{Activity, ReplicatorStatus, Transferred};

use crate::checkpoint::{checkpoint_id, CheckpointStore, Direction};
use crate::config::LinkSettings;
use crate::coordinator::ResolutionTracker;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::Peer;
use crate::resilience::RateLimiter;
use crate::resolver::ResolverRef;
use crate::transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};

/// Which directions a link replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorType {
    Push,
    Pull,
    PushAndPull,
}

impl ReplicatorType {
    pub fn pulls(&self) -> bool {
        matches!(self, Self::Pull | Self::PushAndPull)
    }

    pub fn pushes(&self) -> bool {
        matches!(self, Self::Push | Self::PushAndPull)
    }
}

/// Link configuration. Fixed once the link is created.
#[derive(Clone)]
pub struct ReplicatorConfig {
    pub local: Arc<Peer>,
    pub target: Arc<dyn Transport>,
    pub replicator_type: ReplicatorType,
    pub continuous: bool,
    /// Policy for conflicts this link pulls in. `None` uses the default.
    pub conflict_resolver: Option<ResolverRef>,
    pub settings: LinkSettings,
}

impl ReplicatorConfig {
    /// Continuous push-and-pull link with default settings.
    pub fn new(local: Arc<Peer>, target: Arc<dyn Transport>) -> Self {
        Self {
            local,
            target,
            replicator_type: ReplicatorType::PushAndPull,
            continuous: true,
            conflict_resolver: None,
            settings: LinkSettings::default(),
        }
    }

    pub fn replicator_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn conflict_resolver(mut self, resolver: ResolverRef) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    pub fn settings(mut self, settings: LinkSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl std::fmt::Debug for ReplicatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorConfig")
            .field("local", &self.local.name())
            .field("target", &self.target.endpoint())
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("conflict_resolver", &self.conflict_resolver.as_ref().map(|r| r.name().to_string()))
            .finish()
    }
}

/// State shared between the handle and the link task.
pub(crate) struct LinkShared {
    name: String,
    config: ReplicatorConfig,
    checkpoints: Arc<CheckpointStore>,
    tracker: Arc<ResolutionTracker>,
    rate_limiter: Option<RateLimiter>,
    status: watch::Sender<ReplicatorStatus>,
    /// Remote sequence hint, if the transport offers one.
    remote_hint: Option<watch::Receiver<u64>>,
    pull_checkpoint: AtomicU64,
    push_checkpoint: AtomicU64,
    pulled: AtomicU64,
    pushed: AtomicU64,
    deduplicated: AtomicU64,
    rejected: AtomicU64,
}

impl LinkShared {
    /// Update the published status. Counters are refreshed on every update.
    fn publish(&self, activity: Activity, error: Option<String>) {
        let transferred = Transferred {
            pulled: self.pulled.load(Ordering::SeqCst),
            pushed: self.pushed.load(Ordering::SeqCst),
            deduplicated: self.deduplicated.load(Ordering::SeqCst),
        };
        let rejected_pushes = self.rejected.load(Ordering::SeqCst);
        let unresolved_conflicts = self.unresolved(rejected_pushes);

        self.status.send_modify(|status| {
            status.activity = activity;
            status.transferred = transferred;
            status.rejected_pushes = rejected_pushes;
            status.unresolved_conflicts = unresolved_conflicts;
            status.error = error;
        });
        metrics::set_link_activity(&self.name, activity.as_str());
    }

    fn unresolved(&self, rejected_pushes: u64) -> u64 {
        // A pushing-only link never pulls the remote leaf, so nothing on
        // this side will resolve what the remote refused.
        let stranded = if self.config.replicator_type.pulls() { 0 } else { rejected_pushes };
        self.tracker.failed() + stranded
    }

    fn activity(&self) -> Activity {
        self.status.borrow().activity
    }

    /// Sequences either side is known to be ahead of this link.
    fn pending(&self) -> u64 {
        let kind = self.config.replicator_type;
        let mut pending = 0;
        if kind.pushes() {
            let local = self.config.local.sequence_hint();
            pending += local.saturating_sub(self.push_checkpoint.load(Ordering::SeqCst));
        }
        if kind.pulls() {
            if let Some(hint) = &self.remote_hint {
                let remote = *hint.borrow();
                pending += remote.saturating_sub(self.pull_checkpoint.load(Ordering::SeqCst));
            }
        }
        pending
    }

    async fn load_checkpoints(&self) {
        let pull = self.checkpoints.get_or_start(&checkpoint_id(&self.name, Direction::Pull)).await;
        let push = self.checkpoints.get_or_start(&checkpoint_id(&self.name, Direction::Push)).await;
        self.pull_checkpoint.fetch_max(pull, Ordering::SeqCst);
        self.push_checkpoint.fetch_max(push, Ordering::SeqCst);
    }

    async fn advance(&self, direction: Direction, sequence: u64) {
        let slot = match direction {
            Direction::Pull => &self.pull_checkpoint,
            Direction::Push => &self.push_checkpoint,
        };
        slot.fetch_max(sequence, Ordering::SeqCst);
        self.checkpoints.set(&checkpoint_id(&self.name, direction), sequence).await;
    }
}

struct RunningLink {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One replication link.
pub struct Replicator {
    shared: Arc<LinkShared>,
    running: Mutex<Option<RunningLink>>,
}

impl Replicator {
    /// Link named `"{local}->{endpoint}"`.
    pub fn new(config: ReplicatorConfig, checkpoints: Arc<CheckpointStore>) -> Self {
        let name = format!("{}->{}", config.local.name(), config.target.endpoint());
        Self::with_name(name, config, checkpoints)
    }

    /// Link with an explicit name; the name keys its checkpoints.
    pub fn with_name(name: impl Into<String>, config: ReplicatorConfig, checkpoints: Arc<CheckpointStore>) -> Self {
        let (status, _) = watch::channel(ReplicatorStatus::default());
        let rate_limiter = config.settings.rate_limit_config().map(RateLimiter::new);
        let remote_hint = config.target.subscribe();

        Self {
            shared: Arc::new(LinkShared {
                name: name.into(),
                config,
                checkpoints,
                tracker: Arc::new(ResolutionTracker::new()),
                rate_limiter,
                status,
                remote_hint,
                pull_checkpoint: AtomicU64::new(0),
                push_checkpoint: AtomicU64::new(0),
                pulled: AtomicU64::new(0),
                pushed: AtomicU64::new(0),
                deduplicated: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.shared.config
    }

    /// Resolutions this link triggered.
    pub fn tracker(&self) -> &Arc<ResolutionTracker> {
        &self.shared.tracker
    }

    /// Start the link task.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let activity = self.shared.activity();
        if activity != Activity::Stopped {
            return Err(ReplicationError::InvalidState {
                expected: Activity::Stopped.to_string(),
                actual: activity.to_string(),
            });
        }
        // A one-shot run that already finished leaves its handle behind.
        if let Some(previous) = running.take() {
            let _ = previous.handle.await;
        }

        info!(
            link = %self.shared.name,
            replicator_type = ?self.shared.config.replicator_type,
            continuous = self.shared.config.continuous,
            "Starting replicator"
        );
        self.shared.publish(Activity::Connecting, None);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("replicator", link = %self.shared.name);
        let handle = tokio::spawn(sync::run_link(Arc::clone(&self.shared), shutdown_rx).instrument(span));
        *running = Some(RunningLink { shutdown_tx, handle });
        Ok(())
    }

    /// Stop the link and wait for its task to exit.
    pub async fn stop(&self) {
        let Some(link) = self.running.lock().await.take() else {
            return;
        };
        let _ = link.shutdown_tx.send(true);
        if let Err(e) = link.handle.await {
            tracing::error!(link = %self.shared.name, error = %e, "Replicator task panicked");
        }

        let error = self.shared.status.borrow().error.clone();
        self.shared.publish(Activity::Stopped, error);
        info!(link = %self.shared.name, "Replicator stopped");
    }

    /// Current status. An idle link that is behind either side reports `Busy`.
    pub fn status(&self) -> ReplicatorStatus {
        let mut status = self.shared.status.borrow().clone();
        let pending = self.shared.pending();
        status.pending = pending;
        status.unresolved_conflicts = self.shared.unresolved(status.rejected_pushes);
        if status.activity == Activity::Idle && (pending > 0 || self.shared.tracker.in_flight() > 0) {
            status.activity = Activity::Busy;
        }
        status
    }

    /// Status updates as published by the link task (without the
    /// pending-work overlay applied by [`status()`](Self::status)).
    pub fn subscribe(&self) -> watch::Receiver<ReplicatorStatus> {
        self.shared.status.subscribe()
    }

    /// Poll until the link reports `level`. Returns `false` on timeout.
    pub async fn wait_for_activity(&self, level: Activity, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.status().activity == level {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("name", &self.shared.name)
            .field("activity", &self.shared.activity())
            .finish()
    }
}
