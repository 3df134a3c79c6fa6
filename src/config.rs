// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for peers, links and checkpoints.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are humantime strings (`"250ms"`, `"5s"`).
//!
//! # Quick Start
//!
//! ```rust
//! use replication_mesh::config::MeshConfig;
//!
//! let config = MeshConfig::for_testing();
//! assert_eq!(config.checkpoint.sqlite_path, ":memory:");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MeshConfig
//! ├── coordinator: CoordinatorSettings   # per-peer resolution limits
//! ├── link: LinkSettings                 # defaults for every replicator
//! │   ├── batch_size / poll_interval
//! │   ├── retry_* (backoff for transient transport errors)
//! │   └── rate_limit_* (token bucket on applied revisions)
//! └── checkpoint: CheckpointConfig       # SQLite checkpoint persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! coordinator:
//!   max_concurrent_resolutions: 64
//! link:
//!   batch_size: 200
//!   poll_interval: "2s"
//!   retry_initial_delay: "500ms"
//!   retry_max_delay: "1m"
//! checkpoint:
//!   sqlite_path: "/var/lib/app/checkpoints.db"
//!   flush_interval: "5s"
//! ```

use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a [`Mesh`](crate::mesh::Mesh) needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    /// Defaults for links created by [`Mesh::connect`](crate::mesh::Mesh::connect).
    #[serde(default)]
    pub link: LinkSettings,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl MeshConfig {
    /// Fast polling, fast retries, in-memory checkpoints.
    pub fn for_testing() -> Self {
        Self {
            coordinator: CoordinatorSettings::default(),
            link: LinkSettings::for_testing(),
            checkpoint: CheckpointConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CoordinatorSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-peer resolution coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Maximum resolver invocations running at once on one peer.
    /// Further conflicts wait for a slot (they never block other keys' applies).
    #[serde(default = "default_max_concurrent_resolutions")]
    pub max_concurrent_resolutions: usize,
}

fn default_max_concurrent_resolutions() -> usize {
    64
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_resolutions: default_max_concurrent_resolutions(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LinkSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tuning for one replicator link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Maximum feed entries requested per page.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long an idle continuous link sleeps without a change hint before
    /// polling again (e.g. "1s").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// First backoff after a transient transport error.
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Backoff ceiling.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// Backoff growth per attempt. Anything below 1.0 is read as 1.0.
    #[serde(default = "default_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Token bucket on revisions applied by this link.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_retry_initial_delay() -> String {
    "500ms".to_string()
}

fn default_retry_max_delay() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            retry_backoff_factor: default_backoff_factor(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl LinkSettings {
    /// Short poll and retry intervals so tests converge quickly.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 50,
            poll_interval: "50ms".to_string(),
            retry_initial_delay: "10ms".to_string(),
            retry_max_delay: "200ms".to_string(),
            ..Self::default()
        }
    }

    /// Parse `poll_interval`, falling back to one second.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    /// Backoff schedule for transient errors. Links retry forever.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: humantime::parse_duration(&self.retry_initial_delay)
                .unwrap_or(Duration::from_millis(500)),
            max_delay: humantime::parse_duration(&self.retry_max_delay).unwrap_or(Duration::from_secs(30)),
            backoff_factor: if self.retry_backoff_factor >= 1.0 {
                self.retry_backoff_factor
            } else {
                1.0
            },
            ..RetryConfig::daemon()
        }
    }

    /// Rate limit for applied revisions, `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
///
/// Checkpoints record how far each link has scanned each side's change feed.
/// `":memory:"` keeps them in the cache only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// How often dirty checkpoints are written to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_checkpoints.db".to_string(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl CheckpointConfig {
    /// Cache-only checkpoints.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            flush_interval: default_flush_interval(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(5))
    }
}
