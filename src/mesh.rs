// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer mesh: peers, the links between them, and aggregate status.
//!
//! Links are created with [`Mesh::connect`]; the local peer owns the link
//! (runs its task and resolves the conflicts it pulls in), the remote peer is
//! reached through a [`LoopbackTransport`]. Star, chain, two-way and
//! triangle topologies resolve each conflict once: before resolving, a link
//! claims the pair from the peer it pulled from, and a refused claimant waits
//! for the owner's merge. Peers that see the same pair without a link between
//! them (cycles of four or more) can still both resolve it.
//!
//! # Peer status
//!
//! A peer's status aggregates every link touching it, at either end, plus
//! its own in-flight resolutions:
//!
//! ```text
//! resolution in flight or any link Busy   → Busy
//! else any link Connecting                → Connecting
//! else any link Offline                   → Offline
//! else any link Idle                      → Idle
//! else (no running link)                  → Stopped
//! ```
//!
//! Convergence is observed by polling: [`Mesh::is_converged`] holds when every
//! peer is idle and all peers hold the same current revision of a key.
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_mesh::config::MeshConfig;
//! use replication_mesh::mesh::{LinkSpec, Mesh};
//! use std::time::Duration;
//!
//! # async fn example() -> replication_mesh::Result<()> {
//! let mesh = Mesh::new(MeshConfig::for_testing()).await?;
//! let hub = mesh.add_peer("hub")?;
//! mesh.add_peer("db1")?;
//! mesh.add_peer("db2")?;
//! mesh.connect("db1", "hub", LinkSpec::default())?;
//! mesh.connect("db2", "hub", LinkSpec::default())?;
//!
//! mesh.start_all().await?;
//! hub.put("doc1", None, None).await?;
//! mesh.wait_until_converged("doc1", Duration::from_secs(10)).await;
//! mesh.stop_all().await;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::CheckpointStore;
use crate::config::{LinkSettings, MeshConfig};
use crate::error::{ReplicationError, Result};
use crate::peer::Peer;
use crate::replicator::{Activity, Replicator, ReplicatorConfig, ReplicatorStatus, ReplicatorType};
use crate::resolver::ResolverRef;
use crate::transport::LoopbackTransport;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How [`Mesh::connect`] builds a link.
#[derive(Clone)]
pub struct LinkSpec {
    pub replicator_type: ReplicatorType,
    pub continuous: bool,
    pub resolver: Option<ResolverRef>,
    /// Overrides the mesh-wide link settings.
    pub settings: Option<LinkSettings>,
}

impl Default for LinkSpec {
    fn default() -> Self {
        Self {
            replicator_type: ReplicatorType::PushAndPull,
            continuous: true,
            resolver: None,
            settings: None,
        }
    }
}

impl LinkSpec {
    pub fn of_type(replicator_type: ReplicatorType) -> Self {
        Self {
            replicator_type,
            ..Self::default()
        }
    }

    pub fn one_shot(mut self) -> Self {
        self.continuous = false;
        self
    }

    pub fn resolver(mut self, resolver: ResolverRef) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn settings(mut self, settings: LinkSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

#[derive(Clone)]
struct MeshLink {
    local: String,
    remote: String,
    replicator: Arc<Replicator>,
    transport: Arc<LoopbackTransport>,
}

struct FlushTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A set of peers and the links between them.
pub struct Mesh {
    config: MeshConfig,
    peers: DashMap<String, Arc<Peer>>,
    links: DashMap<String, MeshLink>,
    checkpoints: Arc<CheckpointStore>,
    flush: Mutex<Option<FlushTask>>,
}

impl Mesh {
    /// Empty mesh. Opens the checkpoint store described by `config`.
    pub async fn new(config: MeshConfig) -> Result<Self> {
        let checkpoints = Arc::new(CheckpointStore::open(&config.checkpoint).await?);
        Ok(Self {
            config,
            peers: DashMap::new(),
            links: DashMap::new(),
            checkpoints,
            flush: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Add a peer with a fresh in-memory store.
    pub fn add_peer(&self, name: &str) -> Result<Arc<Peer>> {
        self.insert_peer(Peer::new(name, self.config.coordinator.clone()))
    }

    /// Add an existing peer.
    pub fn insert_peer(&self, peer: Arc<Peer>) -> Result<Arc<Peer>> {
        let name = peer.name().to_string();
        if self.peers.contains_key(&name) {
            return Err(ReplicationError::Config(format!("peer {} already exists", name)));
        }
        self.peers.insert(name, Arc::clone(&peer));
        Ok(peer)
    }

    pub fn peer(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Create a link owned by `local` targeting `remote`. Returns its name.
    ///
    /// The link is created stopped.
    pub fn connect(&self, local: &str, remote: &str, options: LinkSpec) -> Result<String> {
        let local_peer = self
            .peer(local)
            .ok_or_else(|| ReplicationError::Config(format!("unknown peer {}", local)))?;
        let remote_peer = self
            .peer(remote)
            .ok_or_else(|| ReplicationError::Config(format!("unknown peer {}", remote)))?;
        if local == remote {
            return Err(ReplicationError::Config(format!("peer {} cannot link to itself", local)));
        }

        let name = format!("{}->{}", local, remote);
        if self.links.contains_key(&name) {
            return Err(ReplicationError::Config(format!("link {} already exists", name)));
        }

        let transport = Arc::new(LoopbackTransport::new(remote_peer));
        let mut config = ReplicatorConfig::new(local_peer, transport.clone())
            .replicator_type(options.replicator_type)
            .continuous(options.continuous)
            .settings(options.settings.unwrap_or_else(|| self.config.link.clone()));
        config.conflict_resolver = options.resolver;

        let replicator = Arc::new(Replicator::with_name(name.clone(), config, Arc::clone(&self.checkpoints)));
        debug!(link = %name, "Link created");
        self.links.insert(
            name.clone(),
            MeshLink {
                local: local.to_string(),
                remote: remote.to_string(),
                replicator,
                transport,
            },
        );
        Ok(name)
    }

    pub fn link(&self, name: &str) -> Option<Arc<Replicator>> {
        self.links.get(name).map(|l| Arc::clone(&l.replicator))
    }

    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.iter().map(|l| l.key().clone()).collect();
        names.sort();
        names
    }

    /// Start or stop `peer`'s listener: links targeting it see it as
    /// unreachable while stopped.
    pub fn set_listening(&self, peer: &str, listening: bool) {
        for link in self.links.iter().filter(|l| l.remote == peer) {
            link.transport.set_reachable(listening);
        }
        info!(peer, listening, "Listener toggled");
    }

    fn all_links(&self) -> Vec<MeshLink> {
        self.links.iter().map(|l| l.value().clone()).collect()
    }

    /// Start every stopped link and the checkpoint flush task.
    pub async fn start_all(&self) -> Result<()> {
        let links = self.all_links();
        let results = join_all(
            links
                .iter()
                .filter(|l| l.replicator.status().is_stopped())
                .map(|l| l.replicator.start()),
        )
        .await;

        self.spawn_flush_task().await;

        let started = results.iter().filter(|r| r.is_ok()).count();
        info!(started, total = links.len(), "Mesh links started");
        results.into_iter().collect()
    }

    /// Stop every link, then flush checkpoints.
    pub async fn stop_all(&self) {
        let links = self.all_links();
        join_all(links.iter().map(|l| l.replicator.stop())).await;

        if let Some(task) = self.flush.lock().await.take() {
            let _ = task.shutdown_tx.send(true);
            let _ = task.handle.await;
        }
        if let Err(e) = self.checkpoints.flush_dirty().await {
            warn!(error = %e, "Failed to flush checkpoints");
        }
        info!(links = links.len(), "Mesh links stopped");
    }

    /// Periodically persist dirty checkpoints while links run.
    async fn spawn_flush_task(&self) {
        let mut flush = self.flush.lock().await;
        if flush.is_some() || !self.checkpoints.is_persistent() {
            return;
        }

        let checkpoints = Arc::clone(&self.checkpoints);
        let interval = self.config.checkpoint.flush_interval_duration();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = checkpoints.flush_dirty().await {
                            warn!(error = %e, "Failed to flush checkpoints");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Checkpoint flush task stopping");
                        break;
                    }
                }
            }
        });

        debug!("Spawned checkpoint flush task");
        *flush = Some(FlushTask { shutdown_tx, handle });
    }

    /// Status of every link touching `peer`.
    pub fn link_statuses(&self, peer: &str) -> Vec<(String, ReplicatorStatus)> {
        let mut statuses: Vec<(String, ReplicatorStatus)> = self
            .links
            .iter()
            .filter(|l| l.local == peer || l.remote == peer)
            .map(|l| (l.key().clone(), l.replicator.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Aggregate activity of `peer`, `None` for an unknown peer.
    pub fn peer_status(&self, peer: &str) -> Option<Activity> {
        let handle = self.peer(peer)?;
        if handle.in_flight_resolutions() > 0 {
            return Some(Activity::Busy);
        }

        let activity = self
            .link_statuses(peer)
            .into_iter()
            .map(|(_, status)| status.activity)
            .filter(|a| *a != Activity::Stopped)
            .max_by_key(|a| precedence(*a))
            .unwrap_or(Activity::Stopped);
        Some(activity)
    }

    /// Every peer idle and holding the same current revision of `key`.
    pub async fn is_converged(&self, key: &str) -> bool {
        let peers: Vec<Arc<Peer>> = self.peers.iter().map(|p| Arc::clone(p.value())).collect();
        if peers.iter().any(|p| self.peer_status(p.name()) != Some(Activity::Idle)) {
            return false;
        }

        let mut revisions = Vec::with_capacity(peers.len());
        for peer in &peers {
            match peer.current_revision(key).await {
                Ok(rev) => revisions.push(rev),
                Err(_) => return false,
            }
        }
        revisions.windows(2).all(|pair| pair[0] == pair[1])
    }

    /// Poll [`is_converged`](Self::is_converged) until it holds. Returns
    /// `false` on timeout.
    pub async fn wait_until_converged(&self, key: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_converged(key).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Busy beats Connecting beats Offline beats Idle.
fn precedence(activity: Activity) -> u8 {
    match activity {
        Activity::Busy => 4,
        Activity::Connecting => 3,
        Activity::Offline => 2,
        Activity::Idle => 1,
        Activity::Stopped => 0,
    }
}
