// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Resolvers that count invocations or follow the reference policy
//! - Mesh/peer setup and polling helpers

#![allow(dead_code)]

use replication_mesh::config::MeshConfig;
use replication_mesh::mesh::Mesh;
use replication_mesh::peer::Peer;
use replication_mesh::resolver::{Conflict, ConflictResolver, DefaultResolver, Delayed, ResolverRef};
use replication_mesh::revision::{Body, Document, RevisionId};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn body(name: &str) -> Body {
    let mut b = Body::new();
    b.insert("name".into(), json!(name));
    b
}

/// Remote side wins on equal generations; anything else goes to the
/// default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameGenerationRemoteWins;

impl ConflictResolver for SameGenerationRemoteWins {
    fn resolve(&self, conflict: &Conflict) -> Option<Document> {
        if conflict.local_revision.generation() == conflict.remote_revision.generation() {
            conflict.remote.clone()
        } else {
            DefaultResolver.resolve(conflict)
        }
    }

    fn name(&self) -> &str {
        "same-generation-remote-wins"
    }
}

/// Wraps a resolver and counts every call, across all links sharing it.
pub struct CountingResolver {
    inner: ResolverRef,
    calls: Arc<AtomicUsize>,
    seen: std::sync::Mutex<Vec<Conflict>>,
}

impl CountingResolver {
    pub fn new(inner: ResolverRef) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Reference policy with `delay` of artificial merge latency.
    pub fn reference(delay: Duration) -> Arc<Self> {
        Self::new(Arc::new(Delayed::new(SameGenerationRemoteWins, delay)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.seen.lock().unwrap().clone()
    }
}

impl ConflictResolver for CountingResolver {
    fn resolve(&self, conflict: &Conflict) -> Option<Document> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(conflict.clone());
        self.inner.resolve(conflict)
    }

    fn name(&self) -> &str {
        "counting"
    }
}

pub async fn test_mesh(peers: &[&str]) -> Mesh {
    let mesh = Mesh::new(MeshConfig::for_testing()).await.unwrap();
    for name in peers {
        mesh.add_peer(name).unwrap();
    }
    mesh
}

pub fn peer(mesh: &Mesh, name: &str) -> Arc<Peer> {
    mesh.peer(name).unwrap()
}

/// Edit `key` on `peer` on top of its current revision.
pub async fn edit(peer: &Peer, key: &str, name: &str) -> RevisionId {
    let current = peer.current_revision(key).await.unwrap();
    peer.put(key, Some(body(name)), current).await.unwrap()
}

pub async fn name_on(peer: &Peer, key: &str) -> Option<String> {
    peer.document(key)
        .await
        .unwrap()
        .and_then(|d| d.get_str("name").map(str::to_string))
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Samples a peer's current revision in the background and records whether
/// it ever equals a revision that must not reach that peer as current.
pub struct Sentinel {
    stop: Arc<std::sync::atomic::AtomicBool>,
    violated: Arc<std::sync::atomic::AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Sentinel {
    pub fn spawn(peer: Arc<Peer>, key: &str, forbidden: RevisionId) -> Self {
        use std::sync::atomic::AtomicBool;

        let stop = Arc::new(AtomicBool::new(false));
        let violated = Arc::new(AtomicBool::new(false));
        let key = key.to_string();
        let (stop_flag, violated_flag) = (Arc::clone(&stop), Arc::clone(&violated));

        let handle = tokio::spawn(async move {
            while !stop_flag.load(Ordering::SeqCst) {
                if peer.current_revision(&key).await.unwrap().as_ref() == Some(&forbidden) {
                    violated_flag.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        Self { stop, violated, handle }
    }

    /// Stop sampling; `true` if the forbidden revision was ever current.
    pub async fn finish(self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.await.unwrap();
        self.violated.load(Ordering::SeqCst)
    }
}
