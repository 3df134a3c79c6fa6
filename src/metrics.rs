// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Revisions pulled, pushed and deduplicated per link
//! - Conflicts detected, claims answered, resolutions committed or yielded, resolver races
//! - Deferred and rejected applies
//! - Link activity and errors
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Revisions pulled and applied (or queued) by a link.
pub fn record_pulled(link: &str, count: usize) {
    counter!("replication_revisions_pulled_total", "link" => link.to_string()).increment(count as u64);
}

/// Revisions pushed to and accepted by the remote.
pub fn record_pushed(link: &str, count: usize) {
    counter!("replication_revisions_pushed_total", "link" => link.to_string()).increment(count as u64);
}

/// Revisions skipped because the receiving side already held them.
pub fn record_deduplicated(link: &str, count: usize) {
    counter!("replication_revisions_deduplicated_total", "link" => link.to_string()).increment(count as u64);
}

/// Pushes refused by a passive remote.
pub fn record_push_rejected(link: &str) {
    counter!("replication_push_rejected_total", "link" => link.to_string()).increment(1);
}

/// Outcome of one incoming apply on a peer.
pub fn record_apply(peer: &str, outcome: &str) {
    counter!(
        "replication_applies_total",
        "peer" => peer.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A conflict was detected and a resolution scheduled.
pub fn record_conflict_detected(peer: &str) {
    counter!("replication_conflicts_detected_total", "peer" => peer.to_string()).increment(1);
}

/// A claim answered for a remote peer, by verdict.
pub fn record_claim_answered(peer: &str, verdict: &str) {
    counter!(
        "replication_claims_answered_total",
        "peer" => peer.to_string(),
        "verdict" => verdict.to_string()
    )
    .increment(1);
}

/// A pending pair handed to another peer without invoking the resolver.
pub fn record_resolution_yielded(peer: &str) {
    counter!("replication_resolutions_yielded_total", "peer" => peer.to_string()).increment(1);
}

/// One resolver invocation.
pub fn record_resolver_invocation(peer: &str, resolver: &str, duration: Duration) {
    counter!(
        "replication_resolver_invocations_total",
        "peer" => peer.to_string(),
        "resolver" => resolver.to_string()
    )
    .increment(1);
    histogram!("replication_resolver_duration_seconds", "peer" => peer.to_string()).record(duration.as_secs_f64());
}

/// Resolver panicked or returned output with foreign lineage.
pub fn record_resolver_fallback(peer: &str, reason: &str) {
    counter!(
        "replication_resolver_fallbacks_total",
        "peer" => peer.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Merge committed; `elapsed` is time from detection to commit.
pub fn record_resolution_committed(peer: &str, elapsed: Duration) {
    counter!("replication_resolutions_total", "peer" => peer.to_string()).increment(1);
    histogram!("replication_resolution_latency_seconds", "peer" => peer.to_string()).record(elapsed.as_secs_f64());
}

/// Resolver output was stale by commit time.
pub fn record_resolver_race(peer: &str) {
    counter!("replication_resolver_races_total", "peer" => peer.to_string()).increment(1);
}

/// Resolution abandoned after a storage failure.
pub fn record_resolution_failed(peer: &str) {
    counter!("replication_resolutions_failed_total", "peer" => peer.to_string()).increment(1);
}

/// Apply queued behind a pending resolution.
pub fn record_deferred(peer: &str) {
    counter!("replication_deferred_applies_total", "peer" => peer.to_string()).increment(1);
}

/// Resolutions currently in flight on a peer.
pub fn set_resolutions_in_flight(peer: &str, count: usize) {
    gauge!("replication_resolutions_in_flight", "peer" => peer.to_string()).set(count as f64);
}

/// Link activity as a numeric gauge (0=stopped, 1=offline, 2=connecting, 3=idle, 4=busy).
pub fn set_link_activity(link: &str, activity: &str) {
    let value = match activity {
        "Stopped" => 0.0,
        "Offline" => 1.0,
        "Connecting" => 2.0,
        "Idle" => 3.0,
        "Busy" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_link_activity", "link" => link.to_string()).set(value);
}

/// One replication cycle (pull + push).
pub fn record_cycle(link: &str, duration: Duration) {
    histogram!("replication_cycle_duration_seconds", "link" => link.to_string()).record(duration.as_secs_f64());
}

/// Errors by type.
pub fn record_error(link: &str, error_type: &str) {
    counter!(
        "replication_errors_total",
        "link" => link.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Checkpoint flush batch.
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("replication_checkpoint_flushes_total").increment(1);
    counter!("replication_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Checkpoint SQLite retry (SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_checkpoint_retry(operation: &str) {
    counter!("replication_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}
