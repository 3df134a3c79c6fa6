// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for link progress.
//!
//! A checkpoint is the highest change-feed sequence a link has fully scanned
//! in one direction (`pull` reads the remote feed, `push` reads the local
//! one). They are kept per link id in SQLite so a restarted link resumes
//! instead of rescanning from zero.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the id dirty
//! - `flush_dirty()` persists all dirty checkpoints in one pass
//! - the replicator flushes on its flush interval and when it stops
//!
//! A crash between `set()` and `flush_dirty()` loses at most one interval of
//! progress. Re-scanning is harmless: already-held revisions are skipped and
//! re-applying one is a duplicate.
//!
//! # In-memory mode
//!
//! A `sqlite_path` of `":memory:"` keeps checkpoints in the cache only.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff; the
//! cache is always updated first.

use crate::config::CheckpointConfig;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_checkpoint_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Which feed a checkpoint tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote feed, read by the pull half.
    Pull,
    /// Local feed, read by the push half.
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

/// Storage id for one link direction.
pub fn checkpoint_id(link: &str, direction: Direction) -> String {
    format!("{}/{}", link, direction.as_str())
}

/// Link checkpoint storage, optionally backed by SQLite.
pub struct CheckpointStore {
    /// `None` in memory-only mode.
    pool: Option<SqlitePool>,
    cache: RwLock<HashMap<String, u64>>,
    dirty: RwLock<HashSet<String>>,
    path: String,
}

impl CheckpointStore {
    /// Cache-only store.
    pub fn in_memory() -> Self {
        Self {
            pool: None,
            cache: RwLock::new(HashMap::new()),
            dirty: RwLock::new(HashSet::new()),
            path: ":memory:".to_string(),
        }
    }

    /// Open the store described by `config`.
    pub async fn open(config: &CheckpointConfig) -> Result<Self> {
        if config.is_in_memory() {
            Ok(Self::in_memory())
        } else {
            Self::new(&config.sqlite_path).await
        }
    }

    /// Open (creating if needed) a SQLite-backed store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT checkpoint_id, sequence FROM checkpoints")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (id, sequence) in rows {
            debug!(checkpoint = %id, sequence, "Loaded checkpoint from disk");
            cache.insert(id, sequence.max(0) as u64);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool: Some(pool),
            cache: RwLock::new(cache),
            dirty: RwLock::new(HashSet::new()),
            path: path_str,
        })
    }

    pub async fn get(&self, id: &str) -> Option<u64> {
        self.cache.read().await.get(id).copied()
    }

    /// Checkpoint, or 0 (start of the feed) on first sync.
    pub async fn get_or_start(&self, id: &str) -> u64 {
        self.get(id).await.unwrap_or(0)
    }

    /// Update a checkpoint in the cache and mark it for the next flush.
    /// Checkpoints never move backwards.
    pub async fn set(&self, id: &str, sequence: u64) {
        {
            let mut cache = self.cache.write().await;
            if matches!(cache.get(id), Some(&current) if current >= sequence) {
                return;
            }
            cache.insert(id.to_string(), sequence);
        }
        if self.pool.is_some() {
            self.dirty.write().await.insert(id.to_string());
        }
        debug!(checkpoint = %id, sequence, "Checkpoint updated (pending flush)");
    }

    /// Persist all dirty checkpoints. Returns how many were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };

        let dirty_ids: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty_ids.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, u64)> = {
            let cache = self.cache.read().await;
            dirty_ids
                .iter()
                .filter_map(|id| cache.get(id).map(|seq| (id.clone(), *seq)))
                .collect()
        };

        let mut flushed = 0;
        let mut errors = 0;

        for (id, sequence) in snapshot {
            let result = execute_with_retry("checkpoint_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (checkpoint_id, sequence, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(checkpoint_id) DO UPDATE SET
                        sequence = excluded.sequence,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&id)
                .bind(sequence as i64)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(checkpoint = %id, error = %e, "Failed to flush checkpoint");
                    self.dirty.write().await.insert(id);
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty checkpoints");
            crate::metrics::record_checkpoint_flush(flushed, errors);
        }
        if errors > 0 {
            return Err(ReplicationError::Internal(format!("Failed to flush {} checkpoints", errors)));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget a checkpoint (link removed, or a full rescan is wanted).
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.cache.write().await.remove(id);
        self.dirty.write().await.remove(id);

        if let Some(pool) = &self.pool {
            let id_owned = id.to_string();
            execute_with_retry("checkpoint_delete", || async {
                sqlx::query("DELETE FROM checkpoints WHERE checkpoint_id = ?")
                    .bind(&id_owned)
                    .execute(pool)
                    .await
            })
            .await?;
        }

        info!(checkpoint = %id, "Deleted checkpoint");
        Ok(())
    }

    pub async fn get_all(&self) -> HashMap<String, u64> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_persistent(&self) -> bool {
        self.pool.is_some()
    }

    /// Flush dirty checkpoints, truncate the WAL, close the pool.
    pub async fn close(&self) {
        let Some(pool) = &self.pool else {
            return;
        };

        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty checkpoints on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty checkpoints on close"),
            }
        }

        let wal = execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await;
        if let Err(e) = wal {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }

        pool.close().await;
        info!("Checkpoint store closed");
    }
}
