// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Link task: pull/push cycles with backoff.
//!
//! # Cycle
//!
//! ```text
//! pull: list remote changes since pull checkpoint
//!       → skip revisions already held → fetch → decode → rate limit → apply
//! push: list local changes since push checkpoint
//!       → revs-diff → push bundles → tally acks
//! ```
//!
//! Checkpoints advance to the scanned sequence once a page is fully handled.
//! A stop request is honored between revisions, never in the middle of an
//! apply: a cancelled apply could leave a key marked pending with no
//! resolution task behind it.
//!
//! # Waiting
//!
//! An idle continuous link sleeps until the local peer changes, the remote
//! sends a sequence hint, the poll interval elapses, or stop is requested.

use super::{Activity, LinkShared};
use crate::checkpoint::Direction;
use crate::codec;
use crate::coordinator::LinkContext;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::revision::RevisionRef;
use crate::transport::{PushAck, TransportError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one cycle.
#[derive(Debug, Default, Clone, Copy)]
struct CycleReport {
    /// Revisions applied locally or accepted by the remote.
    transferred: usize,
    /// A checkpoint moved, so another page may be waiting.
    advanced: bool,
}

impl CycleReport {
    fn did_work(&self) -> bool {
        self.transferred > 0 || self.advanced
    }
}

pub(super) async fn run_link(link: Arc<LinkShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let config = &link.config;
    let retry = config.settings.retry_config();
    let poll_interval = config.settings.poll_interval_duration();
    let mut local_rx = config.local.subscribe();
    let mut remote_rx = link.remote_hint.clone();

    link.load_checkpoints().await;
    info!(
        pull_checkpoint = link.pull_checkpoint.load(Ordering::SeqCst),
        push_checkpoint = link.push_checkpoint.load(Ordering::SeqCst),
        "Replicator running"
    );

    let mut attempt = 0usize;
    let mut final_error: Option<String> = None;

    loop {
        // A dropped handle counts as a stop request.
        if *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err() {
            break;
        }

        let report = match run_cycle(&link, &shutdown_rx).await {
            Ok(report) => report,
            Err(ReplicationError::Shutdown) => break,
            Err(e) => {
                metrics::record_error(&link.name, e.kind());
                if !(config.continuous && e.is_retryable() && retry.should_retry(attempt + 1)) {
                    error!(error = %e, "Replicator stopping on error");
                    final_error = Some(e.to_string());
                    break;
                }

                attempt += 1;
                let delay = retry.delay_for_attempt(attempt);
                warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Remote unreachable, retrying");
                link.publish(Activity::Offline, Some(e.to_string()));

                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        if attempt > 0 {
            info!(attempts = attempt, "Remote reachable again");
            attempt = 0;
        }

        if report.did_work() {
            link.publish(Activity::Busy, None);
            continue;
        }

        if !config.continuous {
            debug!("One-shot replication complete");
            break;
        }

        link.publish(Activity::Idle, None);
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = changed(Some(&mut local_rx)) => {}
            _ = changed(remote_rx.as_mut()) => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    if let Err(e) = link.checkpoints.flush_dirty().await {
        warn!(error = %e, "Failed to flush checkpoints on exit");
    }
    link.publish(Activity::Stopped, final_error);
    info!("Replicator task exiting");
}

/// Wait for a sequence hint. Never resolves for a missing or closed channel.
async fn changed(rx: Option<&mut watch::Receiver<u64>>) {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

fn transport_err(link: &LinkShared, source: TransportError) -> ReplicationError {
    ReplicationError::transport(link.config.target.endpoint(), source)
}

fn check_shutdown(shutdown_rx: &watch::Receiver<bool>) -> Result<()> {
    if *shutdown_rx.borrow() {
        Err(ReplicationError::Shutdown)
    } else {
        Ok(())
    }
}

async fn run_cycle(link: &LinkShared, shutdown_rx: &watch::Receiver<bool>) -> Result<CycleReport> {
    let started = Instant::now();
    let kind = link.config.replicator_type;
    let mut report = CycleReport::default();

    if kind.pulls() {
        let pulled = pull(link, shutdown_rx).await?;
        report.transferred += pulled.transferred;
        report.advanced |= pulled.advanced;
    }
    if kind.pushes() {
        let pushed = push(link, shutdown_rx).await?;
        report.transferred += pushed.transferred;
        report.advanced |= pushed.advanced;
    }

    metrics::record_cycle(&link.name, started.elapsed());
    Ok(report)
}

async fn pull(link: &LinkShared, shutdown_rx: &watch::Receiver<bool>) -> Result<CycleReport> {
    let local = &link.config.local;
    let target = &link.config.target;
    let since = link.pull_checkpoint.load(Ordering::SeqCst);

    let batch = target
        .list_changes(since, link.config.settings.batch_size)
        .await
        .map_err(|e| transport_err(link, e))?;

    let mut applied = 0usize;
    let mut skipped = 0usize;
    for change in &batch.changes {
        check_shutdown(shutdown_rx)?;
        if local.store().contains(&change.key, &change.rev).await? {
            skipped += 1;
            continue;
        }

        let payload = target
            .fetch_revision(&change.key, &change.rev)
            .await
            .map_err(|e| transport_err(link, e))?;
        let bundle = codec::decode(&payload)?;
        if bundle.key != change.key || bundle.id() != &change.rev {
            return Err(ReplicationError::Codec(format!(
                "asked for {}@{}, got {}@{}",
                change.key,
                change.rev,
                bundle.key,
                bundle.id()
            )));
        }

        if let Some(limiter) = &link.rate_limiter {
            limiter.acquire().await;
        }
        let outcome = local
            .apply_pulled(
                bundle,
                LinkContext {
                    resolver: link.config.conflict_resolver.clone(),
                    tracker: Some(Arc::clone(&link.tracker)),
                    source: Some(Arc::clone(&link.config.target)),
                },
            )
            .await?;
        debug!(key = %change.key, rev = %change.rev, %outcome, "Pulled revision");
        applied += 1;
    }

    if applied > 0 {
        link.pulled.fetch_add(applied as u64, Ordering::SeqCst);
        metrics::record_pulled(&link.name, applied);
    }
    if skipped > 0 {
        link.deduplicated.fetch_add(skipped as u64, Ordering::SeqCst);
        metrics::record_deduplicated(&link.name, skipped);
    }

    let advanced = batch.last_sequence > since;
    if advanced {
        link.advance(Direction::Pull, batch.last_sequence).await;
    }
    Ok(CycleReport {
        transferred: applied,
        advanced,
    })
}

async fn push(link: &LinkShared, shutdown_rx: &watch::Receiver<bool>) -> Result<CycleReport> {
    let local = &link.config.local;
    let target = &link.config.target;
    let since = link.push_checkpoint.load(Ordering::SeqCst);

    let batch = local.changes_since(since, link.config.settings.batch_size).await?;
    let advanced = batch.last_sequence > since;

    let mut accepted = 0usize;
    let mut skipped = 0usize;
    if !batch.changes.is_empty() {
        let refs: Vec<RevisionRef> = batch
            .changes
            .iter()
            .map(|c| RevisionRef::new(c.key.clone(), c.rev.clone()))
            .collect();
        let offered = refs.len();
        let missing = target.missing(refs).await.map_err(|e| transport_err(link, e))?;
        skipped += offered - missing.len().min(offered);

        for r in missing {
            check_shutdown(shutdown_rx)?;
            let payload = local.export_revision(&r.key, &r.rev).await?;
            let ack = target
                .push_revision(&r.key, &r.rev, payload)
                .await
                .map_err(|e| transport_err(link, e))?;
            debug!(key = %r.key, rev = %r.rev, ack = ack.as_str(), "Pushed revision");

            match ack {
                PushAck::Applied | PushAck::Deferred => accepted += 1,
                PushAck::Duplicate => skipped += 1,
                PushAck::Rejected => {
                    // The remote holds a conflicting leaf; the pull side (ours
                    // or the remote's own link) resolves it.
                    link.rejected.fetch_add(1, Ordering::SeqCst);
                    metrics::record_push_rejected(&link.name);
                }
            }
        }
    }

    if accepted > 0 {
        link.pushed.fetch_add(accepted as u64, Ordering::SeqCst);
        metrics::record_pushed(&link.name, accepted);
    }
    if skipped > 0 {
        link.deduplicated.fetch_add(skipped as u64, Ordering::SeqCst);
        metrics::record_deduplicated(&link.name, skipped);
    }
    if advanced {
        link.advance(Direction::Push, batch.last_sequence).await;
    }
    Ok(CycleReport {
        transferred: accepted,
        advanced,
    })
}
