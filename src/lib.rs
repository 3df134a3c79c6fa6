//! # Replication Mesh
//!
//! Multi-peer document replication with exactly-once conflict resolution.
//!
//! ## Architecture
//!
//! Peers (databases) are connected pairwise by replication links in any
//! topology. Each link belongs to one peer and pulls from / pushes to one
//! remote endpoint:
//!
//! ```text
//! ┌──────────────────────────────── Peer ─────────────────────────────────────┐
//! │                                                                           │
//! │  ┌────────────┐   apply    ┌───────────────────────┐   commit   ┌───────┐ │
//! │  │ Replicator │──────────► │ ResolutionCoordinator │──────────► │ Store │ │
//! │  │ (per link) │  (Pull)    │  per-key slot mutex   │            │ (tree │ │
//! │  └─────┬──────┘            │  pending + deferred   │            │  +seq)│ │
//! │        │                   └──────────┬────────────┘            └───────┘ │
//! │        │ Transport                    │ spawn_blocking                    │
//! │        ▼                              ▼                                   │
//! │   remote Peer ◄── push (Push) ── ConflictResolver (user policy)           │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Exactly once**: a conflict is resolved only on the peer whose link
//!    pulled it in; conflicting pushes are refused, and a key with a pending
//!    resolution queues further revisions instead of forming new conflicts.
//! 2. **No early propagation**: a key is held back from its peer's change
//!    feed while a resolution is pending, so downstream peers see either the
//!    pre-conflict state or the merge.
//! 3. **Independent keys**: every lock is per key; a slow resolver never
//!    delays another key's applies.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_mesh::{LinkSpec, Mesh, MeshConfig};
//! use replication_mesh::resolver::{from_fn, ResolverRef};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> replication_mesh::Result<()> {
//!     let mesh = Mesh::new(MeshConfig::for_testing()).await?;
//!     for name in ["hub", "db1", "db2"] {
//!         mesh.add_peer(name)?;
//!     }
//!
//!     let remote_wins: ResolverRef = Arc::new(from_fn("remote-wins", |c| c.remote.clone()));
//!     mesh.connect("db1", "hub", LinkSpec::default().resolver(remote_wins.clone()))?;
//!     mesh.connect("db2", "hub", LinkSpec::default().resolver(remote_wins))?;
//!
//!     mesh.start_all().await?;
//!     mesh.wait_until_converged("doc1", Duration::from_secs(10)).await;
//!     mesh.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mesh;
pub mod metrics;
pub mod peer;
pub mod replicator;
pub mod resilience;
pub mod resolver;
pub mod revision;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use config::{CheckpointConfig, CoordinatorSettings, LinkSettings, MeshConfig};
pub use coordinator::{ApplyOutcome, ResolutionCoordinator};
pub use error::{ReplicationError, Result};
pub use mesh::{LinkSpec, Mesh};
pub use peer::Peer;
pub use replicator::{Activity, Replicator, ReplicatorConfig, ReplicatorStatus, ReplicatorType};
pub use resolver::{Conflict, ConflictResolver, DefaultResolver};
pub use revision::{Document, RevisionId};
pub use store::{MemoryRevisionStore, RevisionStore};
pub use transport::{LoopbackTransport, Transport};
