// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication checkpoints per collection.
//!
//! Each channel remembers two positions:
//! - `push_seq`: last local change sequence shipped to the remote
//! - `pull_since`: the remote's opaque `last_seq` after the last applied page
//!
//! Checkpoints live in the ledger database (`checkpoints` table) so a
//! restart resumes where the channel left off.
//!
//! # Debounced Writes
//!
//! - `set_push` / `set_pull` update the in-memory cache and mark the
//!   collection dirty
//! - `flush_dirty()` persists dirty checkpoints in a batch; the supervisor
//!   calls it periodically and on shutdown
//!
//! A crash between a set and the next flush replays up to one flush
//! interval of changes. Both directions are idempotent: the remote keeps a
//! revision it already has, and [`Ledger::merge_remote`] reports
//! `Unchanged` for a revision already in local history.
//!
//! ```text
//! pull page ──► merge_remote each doc ──► set_pull(last_seq)
//!               (crash here = re-pull page, idempotent)
//! ```

use crate::error::{LedgerError, Result};
use crate::ledger::{execute_with_retry, Ledger};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Where a collection's channel stands in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Checkpoint {
    pub push_seq: i64,
    /// Opaque remote sequence. Empty means "from the beginning".
    pub pull_since: String,
}

/// Persistent checkpoint storage sharing the ledger's SQLite pool.
pub struct CheckpointStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, Checkpoint>>>,
    dirty: Arc<RwLock<HashSet<String>>>,
}

impl CheckpointStore {
    /// Create the table if needed and load existing checkpoints.
    pub async fn open(ledger: &Ledger) -> Result<Self> {
        let pool = ledger.pool().clone();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                collection TEXT PRIMARY KEY,
                push_seq INTEGER NOT NULL,
                pull_since TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, String)> =
            sqlx::query_as("SELECT collection, push_seq, pull_since FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (collection, push_seq, pull_since) in rows {
            debug!(collection = %collection, push_seq, pull_since = %pull_since, "Loaded checkpoint");
            cache.insert(collection, Checkpoint { push_seq, pull_since });
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Checkpoint for `collection`, or the zero checkpoint on first sync.
    pub async fn get(&self, collection: &str) -> Checkpoint {
        self.cache.read().await.get(collection).cloned().unwrap_or_default()
    }

    pub async fn set_push(&self, collection: &str, push_seq: i64) {
        self.update(collection, |cp| cp.push_seq = cp.push_seq.max(push_seq)).await;
    }

    pub async fn set_pull(&self, collection: &str, pull_since: &str) {
        self.update(collection, |cp| cp.pull_since = pull_since.to_string()).await;
    }

    async fn update<F: FnOnce(&mut Checkpoint)>(&self, collection: &str, f: F) {
        {
            let mut cache = self.cache.write().await;
            f(cache.entry(collection.to_string()).or_default());
        }
        self.dirty.write().await.insert(collection.to_string());
        debug!(collection = %collection, "Checkpoint updated (pending flush)");
    }

    /// Persist all dirty checkpoints. Returns how many were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, Checkpoint)> = {
            let cache = self.cache.read().await;
            dirty
                .iter()
                .filter_map(|c| cache.get(c).map(|cp| (c.clone(), cp.clone())))
                .collect()
        };

        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;

        for (collection, cp) in &snapshot {
            let result = execute_with_retry("checkpoint_flush", move || async move {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (collection, push_seq, pull_since, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(collection) DO UPDATE SET
                        push_seq = excluded.push_seq,
                        pull_since = excluded.pull_since,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(collection)
                .bind(cp.push_seq)
                .bind(&cp.pull_since)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(collection = %collection, error = %e, "Failed to flush checkpoint");
                    self.dirty.write().await.insert(collection.clone());
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty checkpoints");
            crate::metrics::record_checkpoint_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(LedgerError::Internal(format!("Failed to flush {} checkpoints", errors)));
        }
        Ok(flushed)
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget a collection's progress so the next pass starts over.
    pub async fn reset(&self, collection: &str) -> Result<()> {
        self.cache.write().await.remove(collection);
        self.dirty.write().await.remove(collection);

        let pool = &self.pool;
        execute_with_retry("checkpoint_reset", move || async move {
            sqlx::query("DELETE FROM checkpoints WHERE collection = ?")
                .bind(collection)
                .execute(pool)
                .await
        })
        .await?;
        info!(collection = %collection, "Checkpoint reset");
        Ok(())
    }

    pub async fn get_all(&self) -> HashMap<String, Checkpoint> {
        self.cache.read().await.clone()
    }

    /// Flush anything pending before the ledger closes.
    pub async fn close(&self) {
        match self.flush_dirty().await {
            Ok(count) if count > 0 => info!(count, "Flushed dirty checkpoints on close"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to flush dirty checkpoints on close"),
        }
    }
}
