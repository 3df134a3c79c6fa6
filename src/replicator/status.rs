// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Link status types.
//!
//! # Activity transitions
//!
//! ```text
//!            start()
//! Stopped ───────────→ Connecting ──first cycle ok──→ Busy ⇄ Idle
//!    ↑                     │                            │      │
//!    │                     └──── transient error ───→ Offline ←┘
//!    │                                                  │ retry ok → Busy
//!    └──── stop() / one-shot done / fatal error ────────┘
//! ```

use serde::Serialize;

/// Coarse activity of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Activity {
    Stopped,
    /// Remote unreachable; retrying with backoff.
    Offline,
    /// Started, no cycle has succeeded yet.
    Connecting,
    Idle,
    /// Transferring, resolving, or known to be behind.
    Busy,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Offline => "Offline",
            Self::Connecting => "Connecting",
            Self::Idle => "Idle",
            Self::Busy => "Busy",
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Revisions moved by a link since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Transferred {
    pub pulled: u64,
    pub pushed: u64,
    /// Skipped because the receiving side already held them.
    pub deduplicated: u64,
}

/// Snapshot of one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicatorStatus {
    pub activity: Activity,
    /// Sequences known to be ahead of this link's checkpoints.
    pub pending: u64,
    pub transferred: Transferred,
    /// Conflicts this link could not get resolved: failed resolutions it
    /// triggered, plus rejected pushes on push-only links.
    pub unresolved_conflicts: u64,
    pub rejected_pushes: u64,
    /// Last error, kept until the next successful cycle.
    pub error: Option<String>,
}

impl Default for ReplicatorStatus {
    fn default() -> Self {
        Self {
            activity: Activity::Stopped,
            pending: 0,
            transferred: Transferred::default(),
            unresolved_conflicts: 0,
            rejected_pushes: 0,
            error: None,
        }
    }
}

impl ReplicatorStatus {
    pub fn is_idle(&self) -> bool {
        self.activity == Activity::Idle
    }

    pub fn is_stopped(&self) -> bool {
        self.activity == Activity::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_display() {
        assert_eq!(Activity::Busy.to_string(), "Busy");
        assert_eq!(Activity::Offline.as_str(), "Offline");
    }

    #[test]
    fn test_default_status_is_stopped() {
        let status = ReplicatorStatus::default();
        assert!(status.is_stopped());
        assert!(!status.is_idle());
        assert_eq!(status.transferred, Transferred::default());
        assert!(status.error.is_none());
    }

    #[test]
    fn test_status_serializes() {
        let json = serde_json::to_value(ReplicatorStatus::default()).unwrap();
        assert_eq!(json["activity"], "Stopped");
        assert_eq!(json["transferred"]["pulled"], 0);
    }
}
