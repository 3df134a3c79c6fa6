// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the mesh handles unreachable listeners, misbehaving
//! resolvers and corrupt payloads without panics, deadlocks, or divergence.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use replication_mesh::checkpoint::CheckpointStore;
use replication_mesh::codec::{decode, encode, maybe_decompress, ZSTD_MAGIC};
use replication_mesh::config::LinkSettings;
use replication_mesh::error::ReplicationError;
use replication_mesh::mesh::LinkSpec;
use replication_mesh::replicator::{Activity, Replicator, ReplicatorConfig, ReplicatorType};
use replication_mesh::resolver::{from_fn, Conflict, ResolverRef};
use replication_mesh::revision::{Document, RevisionBundle, RevisionId, RevisionRef};
use replication_mesh::store::ChangeBatch;
use replication_mesh::transport::{LoopbackTransport, PushAck, Transport, TransportError, TransportFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Seed `doc1` on both peers, then fork it into "cat" on `a` and "lion" on
/// `b` while the link is stopped. Returns the two leaves.
async fn fork(mesh: &replication_mesh::Mesh) -> (RevisionId, RevisionId) {
    peer(mesh, "a").put("doc1", Some(body("tiger")), None).await.unwrap();
    mesh.start_all().await.unwrap();
    assert!(mesh.wait_until_converged("doc1", CONVERGE_TIMEOUT).await);
    mesh.stop_all().await;

    let cat = edit(&peer(mesh, "a"), "doc1", "cat").await;
    let lion = edit(&peer(mesh, "b"), "doc1", "lion").await;
    (cat, lion)
}

// =============================================================================
// Unreachable Listener
// =============================================================================

/// Test: a link started against a stopped listener goes offline, then
/// catches up once the listener returns
#[tokio::test]
async fn listener_down_at_start_recovers() {
    let mesh = test_mesh(&["a", "b"]).await;
    peer(&mesh, "b").put("doc1", Some(body("tiger")), None).await.unwrap();
    let name = mesh.connect("a", "b", LinkSpec::default()).unwrap();

    mesh.set_listening("b", false);
    mesh.start_all().await.unwrap();

    let link = mesh.link(&name).unwrap();
    assert!(link.wait_for_activity(Activity::Offline, CONVERGE_TIMEOUT).await);
    assert_eq!(mesh.peer_status("a"), Some(Activity::Offline));
    assert!(link.status().error.unwrap().contains("unreachable"));
    assert!(peer(&mesh, "a").document("doc1").await.unwrap().is_none());

    mesh.set_listening("b", true);
    assert!(mesh.wait_until_converged("doc1", CONVERGE_TIMEOUT).await);
    assert_eq!(name_on(&peer(&mesh, "a"), "doc1").await.as_deref(), Some("tiger"));
    assert!(link.status().error.is_none());

    mesh.stop_all().await;
}

/// Test: repeated start/stop cycles never wedge a link
#[tokio::test]
async fn link_rapid_start_stop_cycles() {
    let mesh = test_mesh(&["a", "b"]).await;
    let name = mesh.connect("a", "b", LinkSpec::default()).unwrap();
    let link = mesh.link(&name).unwrap();
    let a = peer(&mesh, "a");

    for i in 0..20 {
        a.put(&format!("doc{}", i), Some(body("tiger")), None).await.unwrap();
        link.start().await.unwrap();
        if i % 3 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        link.stop().await;
        assert!(link.status().is_stopped());
    }

    mesh.start_all().await.unwrap();
    assert!(mesh.wait_until_converged("doc19", CONVERGE_TIMEOUT).await);
    for i in 0..20 {
        assert!(peer(&mesh, "b").document(&format!("doc{}", i)).await.unwrap().is_some());
    }
    mesh.stop_all().await;
}

// =============================================================================
// Misbehaving Resolvers
// =============================================================================

/// Test: a panicking resolver falls back to the default policy
#[tokio::test]
async fn resolver_panic_uses_default() {
    let mesh = test_mesh(&["a", "b"]).await;
    let panicking: ResolverRef = Arc::new(from_fn("panicking", |_: &Conflict| -> Option<Document> {
        panic!("resolver exploded")
    }));
    mesh.connect("a", "b", LinkSpec::default().resolver(panicking)).unwrap();
    let (cat, lion) = fork(&mesh).await;

    mesh.start_all().await.unwrap();
    assert!(mesh.wait_until_converged("doc1", CONVERGE_TIMEOUT).await);

    let expected = if lion > cat { "lion" } else { "cat" };
    for name in ["a", "b"] {
        let p = peer(&mesh, name);
        assert_eq!(name_on(&p, "doc1").await.as_deref(), Some(expected));
        assert_eq!(p.current_revision("doc1").await.unwrap().unwrap().generation(), 3);
    }
    mesh.stop_all().await;
}

/// Test: a resolver answering with another document's content is ignored
#[tokio::test]
async fn resolver_foreign_document_uses_default() {
    let mesh = test_mesh(&["a", "b"]).await;
    let confused: ResolverRef = Arc::new(from_fn("confused", |_: &Conflict| {
        Some(Document::with_body("doc2", body("wrong")))
    }));
    mesh.connect("a", "b", LinkSpec::default().resolver(confused)).unwrap();
    let (cat, lion) = fork(&mesh).await;

    mesh.start_all().await.unwrap();
    assert!(mesh.wait_until_converged("doc1", CONVERGE_TIMEOUT).await);

    let expected = if lion > cat { "lion" } else { "cat" };
    assert_eq!(name_on(&peer(&mesh, "b"), "doc1").await.as_deref(), Some(expected));
    assert!(peer(&mesh, "a").document("doc2").await.unwrap().is_none());
    mesh.stop_all().await;
}

/// Test: stopping the link that triggered a resolution does not abandon it
#[tokio::test]
async fn stop_during_resolution_still_commits() {
    let mesh = test_mesh(&["a", "b"]).await;
    let resolver = CountingResolver::reference(Duration::from_millis(500));
    let name = mesh
        .connect("a", "b", LinkSpec::default().resolver(resolver.clone()))
        .unwrap();
    fork(&mesh).await;

    mesh.start_all().await.unwrap();
    let a = peer(&mesh, "a");
    let link = mesh.link(&name).unwrap();
    let watched = Arc::clone(&a);
    assert!(eventually(CONVERGE_TIMEOUT, || {
        let a = Arc::clone(&watched);
        async move { a.in_flight_resolutions() > 0 }
    })
    .await);

    link.stop().await;
    assert_eq!(mesh.peer_status("a"), Some(Activity::Busy));

    let watched = Arc::clone(&a);
    assert!(eventually(CONVERGE_TIMEOUT, || {
        let a = Arc::clone(&watched);
        async move { a.in_flight_resolutions() == 0 }
    })
    .await);
    assert_eq!(link.tracker().resolved(), 1);
    assert_eq!(resolver.calls(), 1);

    let rev = a.current_revision("doc1").await.unwrap().unwrap();
    assert_eq!(rev.generation(), 3);
    assert!(!a.is_holding("doc1"));

    // The merge reaches b once the link runs again.
    mesh.start_all().await.unwrap();
    assert!(mesh.wait_until_converged("doc1", CONVERGE_TIMEOUT).await);
    assert_eq!(resolver.calls(), 1);
    mesh.stop_all().await;
}

// =============================================================================
// Corrupted Data Handling
// =============================================================================

/// Test: corrupted zstd data returns an error instead of panicking
#[tokio::test]
async fn corrupted_zstd_no_panic() {
    let corrupted_payloads: &[&[u8]] = &[
        // Just magic header, no content
        &ZSTD_MAGIC,
        // Magic header with garbage
        &[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE],
        // Truncated frame header
        &[0x28, 0xB5, 0x2F, 0xFD, 0x20],
    ];

    for (i, payload) in corrupted_payloads.iter().enumerate() {
        assert!(maybe_decompress(payload).is_err(), "payload {} should fail", i);
        assert!(matches!(decode(payload), Err(ReplicationError::Codec(_))));
    }
}

/// Test: a bundle whose body was altered after encoding is refused
#[tokio::test]
async fn tampered_bundle_rejected() {
    let source = replication_mesh::Peer::new("source", Default::default());
    let rev = source.put("doc1", Some(body("tiger")), None).await.unwrap();
    let payload = source.export_revision("doc1", &rev).await.unwrap();

    let tampered = String::from_utf8(payload).unwrap().replace("tiger", "zebra");
    let err = decode(tampered.as_bytes()).unwrap_err();
    assert!(matches!(err, ReplicationError::Codec(ref m) if m.contains("digest")));

    let target = replication_mesh::Peer::new("target", Default::default());
    assert!(target.receive_push(tampered.as_bytes()).await.is_err());
    assert!(target.document("doc1").await.unwrap().is_none());
}

/// Test: garbage pushed over a transport surfaces as a protocol error
#[tokio::test]
async fn garbage_push_is_protocol_error() {
    let remote = replication_mesh::Peer::new("hub", Default::default());
    let transport = LoopbackTransport::new(Arc::clone(&remote));

    for payload in [Vec::new(), b"{".to_vec(), b"\x28\xb5\x2f\xfd\x00".to_vec(), vec![0xFF; 64]] {
        let err = transport
            .push_revision("doc1", &RevisionId::new(1, "abc"), payload)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
    assert_eq!(remote.sequence_hint(), 0);
}

/// Transport that serves garbage for every fetch.
struct GarbageFetch {
    inner: LoopbackTransport,
}

impl Transport for GarbageFetch {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn list_changes(&self, since: u64, limit: usize) -> TransportFuture<'_, ChangeBatch> {
        self.inner.list_changes(since, limit)
    }

    fn missing(&self, refs: Vec<RevisionRef>) -> TransportFuture<'_, Vec<RevisionRef>> {
        self.inner.missing(refs)
    }

    fn fetch_revision(&self, _key: &str, _rev: &RevisionId) -> TransportFuture<'_, Vec<u8>> {
        Box::pin(async { Ok(b"{\"key\":\"doc1\",\"revision\":null}".to_vec()) })
    }

    fn push_revision(&self, key: &str, rev: &RevisionId, payload: Vec<u8>) -> TransportFuture<'_, PushAck> {
        self.inner.push_revision(key, rev, payload)
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        self.inner.subscribe()
    }
}

/// Test: a remote serving undecodable bundles stops the link with an error
#[tokio::test]
async fn garbage_fetch_stops_link() {
    let local = replication_mesh::Peer::new("a", Default::default());
    let remote = replication_mesh::Peer::new("b", Default::default());
    remote.put("doc1", Some(body("tiger")), None).await.unwrap();

    let transport = Arc::new(GarbageFetch {
        inner: LoopbackTransport::new(Arc::clone(&remote)),
    });
    let config = ReplicatorConfig::new(Arc::clone(&local), transport)
        .replicator_type(ReplicatorType::Pull)
        .settings(LinkSettings::for_testing());
    let link = Replicator::new(config, Arc::new(CheckpointStore::in_memory()));

    link.start().await.unwrap();
    assert!(link.wait_for_activity(Activity::Stopped, CONVERGE_TIMEOUT).await);
    let status = link.status();
    assert!(status.error.unwrap().contains("Codec"));
    assert_eq!(status.transferred.pulled, 0);
    assert!(local.document("doc1").await.unwrap().is_none());
}

/// Test: a bundle that lies about its own history is refused
#[tokio::test]
async fn bundle_with_missing_history_rejected() {
    let source = replication_mesh::Peer::new("source", Default::default());
    source.put("doc1", Some(body("tiger")), None).await.unwrap();
    let rev = edit(&source, "doc1", "cat").await;

    let mut bundle: RevisionBundle = decode(&source.export_revision("doc1", &rev).await.unwrap()).unwrap();
    bundle.history.clear();
    let payload = encode(&bundle).unwrap();
    assert!(matches!(decode(&payload), Err(ReplicationError::Codec(_))));
}
