// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication mesh.
//!
//! Errors are categorized by the collaborator they come from (transport,
//! revision store, checkpoint database) and carry enough context to be
//! surfaced through a link's status.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Peer unreachable, request dropped, timeout |
//! | `ResolverRace` | Yes | Resolver output was stale against the committed tree |
//! | `Storage` | No | Revision store corruption or invariant violation |
//! | `Codec` | No | Revision payload could not be decoded |
//! | `Checkpoint` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Link or mesh state machine violation |
//! | `Shutdown` | No | Link is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! Conflicts are not errors: they are routed to the
//! [`ResolutionCoordinator`](crate::coordinator::ResolutionCoordinator) as an
//! [`ApplyOutcome`](crate::coordinator::ApplyOutcome).
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether a continuous link
//! should back off and try again. Non-retryable errors stop the link and are
//! reported in its status.

use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transport failure talking to the remote endpoint.
    ///
    /// Continuous links go `Offline` and retry with backoff.
    #[error("Transport error ({endpoint}): {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    /// Revision store failure.
    ///
    /// Treated as storage corruption: fatal for the link that hit it.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Resolver output was computed against a conflict that no longer matches
    /// the stored tree (a local edit or another merge landed first).
    #[error("Resolver race on {key}: {message}")]
    ResolverRace { key: String, message: String },

    /// Revision payload decode failure.
    #[error("Codec error: {0}")]
    Codec(String),

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Link is stopping.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a transport error with the endpoint it came from.
    pub fn transport(endpoint: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_transient(),
            Self::ResolverRace { .. } => true,
            Self::Storage(_) => false,
            Self::Codec(_) => false,
            Self::Checkpoint(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Storage(_) => "storage",
            Self::ResolverRace { .. } => "resolver_race",
            Self::Codec(_) => "codec",
            Self::Checkpoint(_) => "checkpoint",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_unreachable_is_retryable() {
        let err = ReplicationError::transport("hub", TransportError::Unreachable("hub".into()));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("hub"));
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_transport_protocol_error_not_retryable() {
        let err = ReplicationError::transport("hub", TransportError::Protocol("bad ack".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_not_retryable() {
        let err: ReplicationError = StoreError::Corrupt("dangling parent".into()).into();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("dangling parent"));
    }

    #[test]
    fn test_resolver_race_is_retryable() {
        let err = ReplicationError::ResolverRace {
            key: "doc1".to_string(),
            message: "local leaf superseded".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("doc1"));
    }

    #[test]
    fn test_not_retryable_codec() {
        let err = ReplicationError::Codec("truncated frame".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Stopped".to_string(),
            actual: "Busy".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Stopped"));
        assert!(err.to_string().contains("Busy"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!ReplicationError::Shutdown.is_retryable());
    }
}
