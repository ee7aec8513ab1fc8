// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local ledger: durable document store on SQLite.
//!
//! Accepts writes with no network, detects stale writes through revision
//! tokens, and keeps an ordered change log that drives both local observers
//! and replication.
//!
//! # Tables
//!
//! ```text
//! documents  id PK │ kind │ rev │ history (JSON, newest first) │ deleted │ body │ seq
//! changes    seq AUTOINCREMENT │ id │ rev │ kind │ deleted │ origin (local|replicated)
//! conflicts  (id, rev) PK │ history │ deleted │ body      -- non-winning leaves
//! ```
//!
//! # Optimistic writes
//!
//! [`Ledger::put`] is a compare-and-set on the revision: the write only
//! lands if the caller's `rev` is the stored current revision. The check and
//! the change-log append happen in one SQL transaction, and the row update
//! itself is conditional (`UPDATE ... WHERE rev = ?`), so two writers racing
//! on one document can never both succeed.
//!
//! # Replicated writes
//!
//! [`Ledger::merge_remote`] applies revisions pulled from the remote with
//! their ancestry. Concurrent edits keep the greater revision as current and
//! park the other in `conflicts`; nothing is silently dropped, and
//! reconciliation ([`Ledger::discard_conflicts`]) is a separate, explicit
//! step.

pub mod feed;
pub mod query;

pub use feed::{ChangeEvent, ChangeFeed, ChangeNotice, ChangeOrigin, ChangeRow, FeedCanceller};
pub use query::FindQuery;

use crate::config::LedgerStoreConfig;
use crate::document::{DocBody, DocKind, Document};
use crate::error::{LedgerError, Result};
use crate::revision::{extend_history, Revision};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction as SqlTransaction};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const NOTICE_CAPACITY: usize = 1024;

/// Compare-and-set transactions take the write lock up front, so a stale
/// read snapshot can never be upgraded.
const WRITE_TX: &str = "BEGIN IMMEDIATE";

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6. Extended
            // codes carry the primary code in the low byte (BUSY_SNAPSHOT = 517).
            if let Some(primary) = db_err.code().and_then(|c| c.parse::<i32>().ok()).map(|c| c & 0xff) {
                if primary == 5 || primary == 6 {
                    return true;
                }
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
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
                crate::metrics::sqlite_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn decode_err<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

fn decode_rev(s: &str) -> std::result::Result<Revision, sqlx::Error> {
    s.parse::<Revision>().map_err(decode_err)
}

fn decode_history(s: &str) -> std::result::Result<Vec<Revision>, sqlx::Error> {
    serde_json::from_str(s).map_err(decode_err)
}

fn encode_history(history: &[Revision]) -> std::result::Result<String, sqlx::Error> {
    serde_json::to_string(history).map_err(decode_err)
}

fn encode_body(body: Option<&DocBody>) -> Result<Option<String>> {
    body.map(serde_json::to_string).transpose().map_err(Into::into)
}

/// Deleted leaves never win over live ones; otherwise the greater revision wins.
pub(crate) fn wins(a: &Revision, a_deleted: bool, b: &Revision, b_deleted: bool) -> bool {
    if a_deleted != b_deleted {
        return !a_deleted;
    }
    a > b
}

/// One leaf revision with its ancestry, as exchanged with the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionRecord {
    pub id: String,
    pub rev: Revision,
    /// Newest first, starting with `rev`.
    pub history: Vec<Revision>,
    pub deleted: bool,
    /// `None` for tombstones.
    pub body: Option<DocBody>,
}

impl RevisionRecord {
    pub fn kind(&self) -> Option<DocKind> {
        self.body
            .as_ref()
            .map(DocBody::kind)
            .or_else(|| DocKind::from_id(&self.id))
    }

    pub fn into_document(self) -> Option<Document> {
        if self.deleted {
            return None;
        }
        self.body.map(|body| Document {
            id: self.id,
            rev: Some(self.rev),
            body,
        })
    }
}

/// Result of applying a replicated revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First time this id was seen locally.
    Inserted,
    /// The remote revision descends from ours and replaced it.
    FastForward,
    /// We already had this revision (or a descendant of it).
    Unchanged,
    /// Concurrent edit: `winner` is current, `loser` is stored as a conflict.
    Conflicted { winner: Revision, loser: Revision },
}

enum WriteOutcome {
    Written { rev: Revision, seq: i64 },
    Conflict,
    Missing,
}

type CurrentRow = (String, String, bool, Option<String>);

/// The station's local document store. Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    notices: broadcast::Sender<ChangeNotice>,
    path: String,
}

impl Ledger {
    /// Open (or create) the ledger described by `config`.
    pub async fn open(config: &LedgerStoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Opening ledger");

        let pool = if config.is_in_memory() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| LedgerError::Config(format!("Invalid SQLite path: {}", e)))?;
            // One connection that never recycles: the database lives in it.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let journal = if config.wal_mode {
                sqlx::sqlite::SqliteJournalMode::Wal
            } else {
                sqlx::sqlite::SqliteJournalMode::Delete
            };
            let options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                    .map_err(|e| LedgerError::Config(format!("Invalid SQLite path: {}", e)))?
                    .journal_mode(journal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
                    .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                rev TEXT NOT NULL,
                history TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                body TEXT,
                seq INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                rev TEXT NOT NULL,
                kind TEXT NOT NULL,
                deleted INTEGER NOT NULL,
                origin TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS changes_origin_kind ON changes (origin, kind, seq)",
            r#"
            CREATE TABLE IF NOT EXISTS conflicts (
                id TEXT NOT NULL,
                rev TEXT NOT NULL,
                history TEXT NOT NULL,
                deleted INTEGER NOT NULL,
                body TEXT,
                PRIMARY KEY (id, rev)
            )
            "#,
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let ledger = Self {
            pool,
            notices,
            path: config.sqlite_path.clone(),
        };

        let last_seq = ledger.last_seq().await?;
        if last_seq > 0 {
            info!(last_seq, "Restored ledger from previous run");
        }
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&LedgerStoreConfig::in_memory()).await
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Store `doc` if `doc.rev` is the current revision (`None` for new ids).
    ///
    /// Returns the new revision. Stale revisions fail with `Conflict`.
    pub async fn put(&self, doc: &Document) -> Result<Revision> {
        doc.body.validate()?;
        let kind = doc.kind();
        if DocKind::from_id(&doc.id) != Some(kind) {
            return Err(LedgerError::DataIntegrity(format!(
                "id '{}' is outside the {} namespace",
                doc.id, kind
            )));
        }

        let body = serde_json::to_value(&doc.body)?;
        let (id, expected, body_ref) = (doc.id.as_str(), doc.rev.as_ref(), &body);
        let outcome = execute_with_retry("ledger_put", move || {
            self.write_once(id, kind, expected, Some(body_ref))
        })
        .await?;

        match outcome {
            WriteOutcome::Written { rev, seq } => {
                debug!(id = %doc.id, rev = %rev, seq, "Document written");
                self.notify(seq, &doc.id, kind, ChangeOrigin::Local);
                Ok(rev)
            }
            WriteOutcome::Conflict => Err(LedgerError::conflict(&doc.id)),
            WriteOutcome::Missing => Err(LedgerError::NotFound(doc.id.clone())),
        }
    }

    /// Write a tombstone. Same optimistic rule as [`put`](Self::put).
    pub async fn remove(&self, id: &str, rev: &Revision) -> Result<Revision> {
        let kind = DocKind::from_id(id)
            .ok_or_else(|| LedgerError::DataIntegrity(format!("unknown id namespace '{}'", id)))?;

        let outcome = execute_with_retry("ledger_remove", move || self.write_once(id, kind, Some(rev), None)).await?;

        match outcome {
            WriteOutcome::Written { rev, seq } => {
                debug!(id = %id, rev = %rev, "Document removed");
                self.notify(seq, id, kind, ChangeOrigin::Local);
                Ok(rev)
            }
            WriteOutcome::Conflict => Err(LedgerError::conflict(id)),
            WriteOutcome::Missing => Err(LedgerError::NotFound(id.to_string())),
        }
    }

    /// One compare-and-set attempt. `body = None` writes a tombstone.
    async fn write_once(
        &self,
        id: &str,
        kind: DocKind,
        expected: Option<&Revision>,
        body: Option<&serde_json::Value>,
    ) -> std::result::Result<WriteOutcome, sqlx::Error> {
        let deleting = body.is_none();
        let mut tx = self.pool.begin_with(WRITE_TX).await?;

        let current: Option<(String, String, bool)> =
            sqlx::query_as("SELECT rev, history, deleted FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let (parent, history) = match &current {
            Some((rev, history, deleted)) => {
                let rev = decode_rev(rev)?;
                if deleting && *deleted {
                    return Ok(WriteOutcome::Missing);
                }
                // A tombstoned id may be recreated without naming the tombstone.
                let matches = expected == Some(&rev) || (*deleted && expected.is_none());
                if !matches {
                    return Ok(WriteOutcome::Conflict);
                }
                (Some(rev), decode_history(history)?)
            }
            None if deleting => return Ok(WriteOutcome::Missing),
            None if expected.is_some() => return Ok(WriteOutcome::Conflict),
            None => (None, Vec::new()),
        };

        let hashed = body.cloned().unwrap_or(serde_json::Value::Null);
        let new_rev = Revision::next(parent.as_ref(), &hashed, deleting);
        let new_history = encode_history(&extend_history(&history, &new_rev))?;
        let body_json = body.map(|b| b.to_string());

        let seq = Self::append_change(&mut tx, id, &new_rev, kind, deleting, ChangeOrigin::Local).await?;

        let result = match &parent {
            Some(parent) => {
                sqlx::query(
                    "UPDATE documents SET rev = ?, history = ?, deleted = ?, body = ?, seq = ? \
                     WHERE id = ? AND rev = ?",
                )
                .bind(new_rev.to_string())
                .bind(&new_history)
                .bind(deleting)
                .bind(&body_json)
                .bind(seq)
                .bind(id)
                .bind(parent.to_string())
                .execute(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    "INSERT INTO documents (id, kind, rev, history, deleted, body, seq) \
                     VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
                )
                .bind(id)
                .bind(kind.as_str())
                .bind(new_rev.to_string())
                .bind(&new_history)
                .bind(deleting)
                .bind(&body_json)
                .bind(seq)
                .execute(&mut *tx)
                .await?
            }
        };

        if result.rows_affected() != 1 {
            // Dropping `tx` rolls back the change row too.
            return Ok(WriteOutcome::Conflict);
        }

        tx.commit().await?;
        Ok(WriteOutcome::Written { rev: new_rev, seq })
    }

    async fn append_change(
        tx: &mut SqlTransaction<'_, Sqlite>,
        id: &str,
        rev: &Revision,
        kind: DocKind,
        deleted: bool,
        origin: ChangeOrigin,
    ) -> std::result::Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO changes (id, rev, kind, deleted, origin) VALUES (?, ?, ?, ?, ?)")
            .bind(id)
            .bind(rev.to_string())
            .bind(kind.as_str())
            .bind(deleted)
            .bind(origin.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(result.last_insert_rowid())
    }

    fn notify(&self, seq: i64, id: &str, kind: DocKind, origin: ChangeOrigin) {
        // No receivers is fine.
        let _ = self.notices.send(ChangeNotice {
            seq,
            id: id.to_string(),
            kind,
            origin,
        });
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current revision of `id`. Tombstones read as absent.
    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT rev, body FROM documents WHERE id = ? AND deleted = 0")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((rev, Some(body))) => Ok(Some(Document {
                id: id.to_string(),
                rev: Some(rev.parse()?),
                body: serde_json::from_str(&body)?,
            })),
            Some((_, None)) => Err(LedgerError::DataIntegrity(format!("live document {} has no body", id))),
            None => Ok(None),
        }
    }

    /// Range scan over one kind, then predicate / sort / limit.
    pub async fn find(&self, query: FindQuery) -> Result<Vec<Document>> {
        let (lo, hi) = query.id_range();
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, rev, body FROM documents WHERE id >= ? AND id < ? AND deleted = 0 ORDER BY id",
        )
        .bind(&lo)
        .bind(&hi)
        .fetch_all(&self.pool)
        .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for (id, rev, body) in rows {
            let Some(body) = body else { continue };
            let body: DocBody = match serde_json::from_str(&body) {
                Ok(body) => body,
                Err(e) => {
                    warn!(id = %id, error = %e, "Skipping undecodable document");
                    continue;
                }
            };
            if body.kind() != query.kind {
                warn!(id = %id, kind = %body.kind(), "Document stored outside its namespace");
                continue;
            }
            docs.push(Document {
                id,
                rev: Some(rev.parse()?),
                body,
            });
        }
        Ok(query.apply(docs))
    }

    /// Live documents of one kind.
    pub async fn count(&self, kind: DocKind) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents WHERE kind = ? AND deleted = 0")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Current leaf of `id`, tombstones included.
    pub async fn current_record(&self, id: &str) -> Result<Option<RevisionRecord>> {
        let row: Option<(String, String, bool, Option<String>)> =
            sqlx::query_as("SELECT rev, history, deleted, body FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|row| Self::record_from_row(id, row)).transpose()
    }

    /// The leaf `(id, rev)`, whether current or parked as a conflict.
    pub async fn leaf(&self, id: &str, rev: &Revision) -> Result<Option<RevisionRecord>> {
        if let Some(current) = self.current_record(id).await? {
            if &current.rev == rev {
                return Ok(Some(current));
            }
        }
        let row: Option<(String, String, bool, Option<String>)> =
            sqlx::query_as("SELECT rev, history, deleted, body FROM conflicts WHERE id = ? AND rev = ?")
                .bind(id)
                .bind(rev.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|row| Self::record_from_row(id, row)).transpose()
    }

    fn record_from_row(id: &str, (rev, history, deleted, body): CurrentRow) -> Result<RevisionRecord> {
        let body = match body {
            Some(b) if !deleted => Some(serde_json::from_str(&b)?),
            _ => None,
        };
        Ok(RevisionRecord {
            id: id.to_string(),
            rev: rev.parse()?,
            history: serde_json::from_str(&history)?,
            deleted,
            body,
        })
    }

    // =========================================================================
    // Change log
    // =========================================================================

    /// Live feed of changes after `since` (0 = from the beginning).
    pub fn changes(&self, since: i64) -> ChangeFeed {
        ChangeFeed::new(self.clone(), since)
    }

    /// Raw broadcast of committed writes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notices.subscribe()
    }

    /// Up to `limit` changes after `since`, with current documents.
    pub async fn changes_since(&self, since: i64, limit: i64) -> Result<Vec<ChangeEvent>> {
        let rows = self.change_rows("SELECT seq, id, rev, kind, deleted, origin FROM changes WHERE seq > ? ORDER BY seq LIMIT ?", since, &[], limit).await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let doc = if row.deleted { None } else { self.get(&row.id).await? };
            events.push(ChangeEvent {
                seq: row.seq,
                id: row.id,
                rev: row.rev,
                kind: row.kind,
                origin: row.origin,
                doc,
            });
        }
        Ok(events)
    }

    /// Local-origin change rows of the given kinds after `since`.
    pub async fn local_changes(&self, since: i64, kinds: &[DocKind], limit: i64) -> Result<Vec<ChangeRow>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT seq, id, rev, kind, deleted, origin FROM changes \
             WHERE seq > ? AND origin = 'local' AND kind IN ({}) ORDER BY seq LIMIT ?",
            vec!["?"; kinds.len()].join(", ")
        );
        self.change_rows(&sql, since, kinds, limit).await
    }

    /// Number of local-origin changes of the given kinds after `since`.
    pub async fn pending_local_changes(&self, since: i64, kinds: &[DocKind]) -> Result<u64> {
        if kinds.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM changes WHERE seq > ? AND origin = 'local' AND kind IN ({})",
            vec!["?"; kinds.len()].join(", ")
        );
        let mut query = sqlx::query_as::<_, (i64,)>(&sql).bind(since);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let (n,) = query.fetch_one(&self.pool).await?;
        Ok(n as u64)
    }

    async fn change_rows(&self, sql: &str, since: i64, kinds: &[DocKind], limit: i64) -> Result<Vec<ChangeRow>> {
        let mut query = sqlx::query_as::<_, (i64, String, String, String, bool, String)>(sql).bind(since);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(seq, id, rev, kind, deleted, origin)| {
                let kind = DocKind::from_name(&kind)
                    .ok_or_else(|| LedgerError::DataIntegrity(format!("unknown kind '{}' at seq {}", kind, seq)))?;
                Ok(ChangeRow {
                    seq,
                    id,
                    rev: rev.parse()?,
                    kind,
                    deleted,
                    origin: ChangeOrigin::from_name(&origin).ok_or_else(|| {
                        LedgerError::DataIntegrity(format!("unknown origin '{}' at seq {}", origin, seq))
                    })?,
                })
            })
            .collect()
    }

    /// Highest change sequence (0 for an empty ledger).
    pub async fn last_seq(&self) -> Result<i64> {
        let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    // =========================================================================
    // Replicated writes
    // =========================================================================

    /// Apply a revision received from the remote, keeping its ancestry.
    pub async fn merge_remote(&self, record: &RevisionRecord) -> Result<MergeOutcome> {
        let kind = record
            .kind()
            .ok_or_else(|| LedgerError::DataIntegrity(format!("cannot classify replicated id '{}'", record.id)))?;
        if let Some(body) = &record.body {
            body.validate()?;
        }
        let body_json = encode_body(record.body.as_ref())?;
        let ancestors = match record.history.split_first() {
            Some((first, rest)) if first == &record.rev => rest,
            _ => record.history.as_slice(),
        };
        let history = extend_history(ancestors, &record.rev);
        let history_json = encode_history(&history)?;

        let (history_ref, history_json_ref, body_ref) = (&history, history_json.as_str(), body_json.as_deref());
        let (outcome, seq) = execute_with_retry("ledger_merge", move || {
            self.merge_once(record, kind, history_ref, history_json_ref, body_ref)
        })
        .await?;

        if let Some(seq) = seq {
            self.notify(seq, &record.id, kind, ChangeOrigin::Replicated);
        }
        if let MergeOutcome::Conflicted { winner, loser } = &outcome {
            info!(id = %record.id, winner = %winner, loser = %loser, "Stored conflicting revision");
        }
        Ok(outcome)
    }

    async fn merge_once(
        &self,
        record: &RevisionRecord,
        kind: DocKind,
        history: &[Revision],
        history_json: &str,
        body_json: Option<&str>,
    ) -> std::result::Result<(MergeOutcome, Option<i64>), sqlx::Error> {
        let mut tx = self.pool.begin_with(WRITE_TX).await?;

        let current: Option<(String, String, bool, Option<String>)> =
            sqlx::query_as("SELECT rev, history, deleted, body FROM documents WHERE id = ?")
                .bind(&record.id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((cur_rev, cur_history, cur_deleted, cur_body)) = current else {
            let seq = Self::append_change(&mut tx, &record.id, &record.rev, kind, record.deleted, ChangeOrigin::Replicated).await?;
            sqlx::query(
                "INSERT INTO documents (id, kind, rev, history, deleted, body, seq) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(kind.as_str())
            .bind(record.rev.to_string())
            .bind(history_json)
            .bind(record.deleted)
            .bind(body_json)
            .bind(seq)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok((MergeOutcome::Inserted, Some(seq)));
        };

        let cur_rev_parsed = decode_rev(&cur_rev)?;
        let cur_history_parsed = decode_history(&cur_history)?;

        if cur_rev_parsed == record.rev || cur_history_parsed.contains(&record.rev) {
            return Ok((MergeOutcome::Unchanged, None));
        }

        let parked: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conflicts WHERE id = ? AND rev = ?")
            .bind(&record.id)
            .bind(record.rev.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if parked.is_some() {
            return Ok((MergeOutcome::Unchanged, None));
        }

        let descends = history.contains(&cur_rev_parsed);
        let remote_wins = descends || wins(&record.rev, record.deleted, &cur_rev_parsed, cur_deleted);

        if !remote_wins {
            if !record.deleted {
                Self::park_conflict(&mut tx, &record.id, &record.rev, history_json, record.deleted, body_json).await?;
                tx.commit().await?;
                return Ok((
                    MergeOutcome::Conflicted {
                        winner: cur_rev_parsed,
                        loser: record.rev.clone(),
                    },
                    None,
                ));
            }
            return Ok((MergeOutcome::Unchanged, None));
        }

        // Displaced live leaf that the remote never saw becomes a conflict.
        let conflicted = !descends && !cur_deleted;
        if conflicted {
            Self::park_conflict(&mut tx, &record.id, &cur_rev_parsed, &cur_history, cur_deleted, cur_body.as_deref()).await?;
        }

        // Parked leaves that the incoming revision descends from are resolved.
        let parked_revs: Vec<(String,)> = sqlx::query_as("SELECT rev FROM conflicts WHERE id = ?")
            .bind(&record.id)
            .fetch_all(&mut *tx)
            .await?;
        for (rev,) in parked_revs {
            if history.contains(&decode_rev(&rev)?) {
                sqlx::query("DELETE FROM conflicts WHERE id = ? AND rev = ?")
                    .bind(&record.id)
                    .bind(&rev)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let seq = Self::append_change(&mut tx, &record.id, &record.rev, kind, record.deleted, ChangeOrigin::Replicated).await?;
        sqlx::query("UPDATE documents SET rev = ?, history = ?, deleted = ?, body = ?, seq = ? WHERE id = ? AND rev = ?")
            .bind(record.rev.to_string())
            .bind(history_json)
            .bind(record.deleted)
            .bind(body_json)
            .bind(seq)
            .bind(&record.id)
            .bind(&cur_rev)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let outcome = if conflicted {
            MergeOutcome::Conflicted {
                winner: record.rev.clone(),
                loser: cur_rev_parsed,
            }
        } else {
            MergeOutcome::FastForward
        };
        Ok((outcome, Some(seq)))
    }

    async fn park_conflict(
        tx: &mut SqlTransaction<'_, Sqlite>,
        id: &str,
        rev: &Revision,
        history_json: &str,
        deleted: bool,
        body_json: Option<&str>,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO conflicts (id, rev, history, deleted, body) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id, rev) DO NOTHING",
        )
        .bind(id)
        .bind(rev.to_string())
        .bind(history_json)
        .bind(deleted)
        .bind(body_json)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Conflict reconciliation
    // =========================================================================

    /// Non-winning revisions stored for `id`.
    pub async fn conflicts(&self, id: &str) -> Result<Vec<RevisionRecord>> {
        let rows: Vec<(String, String, bool, Option<String>)> =
            sqlx::query_as("SELECT rev, history, deleted, body FROM conflicts WHERE id = ? ORDER BY rev")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(|row| Self::record_from_row(id, row)).collect()
    }

    /// Ids that currently have stored conflicts.
    pub async fn conflicted_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT id FROM conflicts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Drop every non-winning revision of `id`, keeping the current one.
    pub async fn discard_conflicts(&self, id: &str) -> Result<usize> {
        let id_owned = id.to_string();
        let pool = &self.pool;
        let result = execute_with_retry("ledger_discard_conflicts", || async {
            sqlx::query("DELETE FROM conflicts WHERE id = ?")
                .bind(&id_owned)
                .execute(pool)
                .await
        })
        .await?;
        let removed = result.rows_affected() as usize;
        if removed > 0 {
            info!(id = %id, removed, "Discarded conflicting revisions");
        }
        Ok(removed)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        if self.path == ":memory:" {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("ledger_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Ledger closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Member, Tariff, Transaction, TransactionStatus};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn tariff(vehicle_type: &str, base_rate: u64) -> Document {
        Document::new(DocBody::Tariff(Tariff {
            vehicle_type: vehicle_type.into(),
            base_rate,
            base_duration_minutes: 60,
            increment_rate: 3000,
            increment_minutes: 60,
            daily_maximum: Some(25000),
            member_rate: None,
        }))
    }

    fn open_tx(id: &str, plate: &str) -> Document {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        Document::new(DocBody::Transaction(Transaction {
            transaction_id: id.into(),
            plate: plate.into(),
            vehicle_type: "car".into(),
            entry_time: t,
            entry_gate: "entry-1".into(),
            entry_operator: "op0".into(),
            entry_fee: 0,
            exit_time: None,
            exit_gate: None,
            exit_operator: None,
            exit_fee: None,
            status: TransactionStatus::Open,
            barcode: None,
            entry_image: None,
            exit_image: None,
            created_at: t,
            updated_at: t,
        }))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let ledger = Ledger::in_memory().await.unwrap();
        let doc = tariff("car", 5000);

        let rev = ledger.put(&doc).await.unwrap();
        assert_eq!(rev.generation(), 1);

        let stored = ledger.get("tariff_car").await.unwrap().unwrap();
        assert_eq!(stored.rev, Some(rev));
        assert_eq!(stored.body, doc.body);
        assert!(ledger.get("tariff_bus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let ledger = Ledger::in_memory().await.unwrap();
        let mut doc = tariff("car", 5000);
        let r1 = ledger.put(&doc).await.unwrap();

        doc.rev = Some(r1.clone());
        let r2 = ledger.put(&doc).await.unwrap();
        assert!(r2 > r1);

        // Writing again with r1 is stale
        let err = ledger.put(&doc).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { .. }));

        // Creating an existing id without a revision is stale as well
        let err = ledger.put(&tariff("car", 1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_invalid_transaction_rejected() {
        let ledger = Ledger::in_memory().await.unwrap();
        let mut doc = open_tx("T1", "B1");
        doc.as_transaction_mut().unwrap().exit_fee = Some(5);
        let err = ledger.put(&doc).await.unwrap_err();
        assert!(matches!(err, LedgerError::DataIntegrity(_)));
        assert_eq!(ledger.last_seq().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_and_recreate() {
        let ledger = Ledger::in_memory().await.unwrap();
        let doc = tariff("car", 5000);
        let r1 = ledger.put(&doc).await.unwrap();

        let tomb = ledger.remove("tariff_car", &r1).await.unwrap();
        assert_eq!(tomb.generation(), 2);
        assert!(ledger.get("tariff_car").await.unwrap().is_none());
        assert!(matches!(
            ledger.remove("tariff_car", &tomb).await,
            Err(LedgerError::NotFound(_))
        ));

        let r3 = ledger.put(&doc).await.unwrap();
        assert_eq!(r3.generation(), 3);
    }

    #[tokio::test]
    async fn test_find_scans_kind_namespace() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.put(&open_tx("T1", "B1")).await.unwrap();
        ledger.put(&open_tx("T2", "B2")).await.unwrap();
        ledger.put(&open_tx("T3", "B1")).await.unwrap();
        ledger.put(&tariff("car", 5000)).await.unwrap();

        let all = ledger.find(FindQuery::kind(DocKind::Transaction)).await.unwrap();
        assert_eq!(all.len(), 3);

        let b1 = ledger
            .find(
                FindQuery::kind(DocKind::Transaction)
                    .filter(|d| d.as_transaction().map(|t| t.plate == "B1").unwrap_or(false))
                    .sort_by(|a, b| b.id.cmp(&a.id))
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(b1.len(), 1);
        assert_eq!(b1[0].id, "transaction_T3");

        assert_eq!(ledger.count(DocKind::Tariff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_changes_since_and_local_filter() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.put(&open_tx("T1", "B1")).await.unwrap();
        ledger.put(&tariff("car", 5000)).await.unwrap();

        let events = ledger.changes_since(0, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, DocKind::Transaction);
        assert!(events[0].doc.is_some());

        let tx_only = ledger.local_changes(0, &[DocKind::Transaction], 10).await.unwrap();
        assert_eq!(tx_only.len(), 1);
        assert_eq!(ledger.pending_local_changes(0, &[DocKind::Tariff]).await.unwrap(), 1);
        assert_eq!(ledger.pending_local_changes(events[1].seq, &[DocKind::Tariff]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_change_feed_live_and_cancel() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.put(&tariff("car", 5000)).await.unwrap();

        let mut feed = ledger.changes(0);
        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.id, "tariff_car");

        let writer = ledger.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.put(&tariff("bus", 8000)).await.unwrap();
        });

        let second = tokio::time::timeout(Duration::from_secs(2), feed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.id, "tariff_bus");
        handle.await.unwrap();

        let canceller = feed.canceller();
        let waiter = tokio::spawn(async move { feed.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_merge_remote_insert_and_fast_forward() {
        let source = Ledger::in_memory().await.unwrap();
        let target = Ledger::in_memory().await.unwrap();

        let mut doc = tariff("car", 5000);
        let r1 = source.put(&doc).await.unwrap();
        let rec1 = source.current_record("tariff_car").await.unwrap().unwrap();
        assert_eq!(target.merge_remote(&rec1).await.unwrap(), MergeOutcome::Inserted);
        assert_eq!(target.merge_remote(&rec1).await.unwrap(), MergeOutcome::Unchanged);

        doc.rev = Some(r1);
        source.put(&doc).await.unwrap();
        let rec2 = source.current_record("tariff_car").await.unwrap().unwrap();
        assert_eq!(target.merge_remote(&rec2).await.unwrap(), MergeOutcome::FastForward);

        // An older revision arriving late is ignored
        assert_eq!(target.merge_remote(&rec1).await.unwrap(), MergeOutcome::Unchanged);

        let events = target.changes_since(0, 10).await.unwrap();
        assert!(events.iter().all(|e| e.origin == ChangeOrigin::Replicated));
        assert_eq!(target.pending_local_changes(0, &[DocKind::Tariff]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_merge_concurrent_edits_store_conflict() {
        let a = Ledger::in_memory().await.unwrap();
        let b = Ledger::in_memory().await.unwrap();

        let base = tariff("car", 5000);
        a.put(&base).await.unwrap();
        let rec = a.current_record("tariff_car").await.unwrap().unwrap();
        b.merge_remote(&rec).await.unwrap();

        // Diverge
        let mut on_a = a.get("tariff_car").await.unwrap().unwrap();
        if let DocBody::Tariff(t) = &mut on_a.body {
            t.base_rate = 6000;
        }
        a.put(&on_a).await.unwrap();
        let mut on_b = b.get("tariff_car").await.unwrap().unwrap();
        if let DocBody::Tariff(t) = &mut on_b.body {
            t.base_rate = 7000;
        }
        b.put(&on_b).await.unwrap();

        let rec_a = a.current_record("tariff_car").await.unwrap().unwrap();
        let rec_b = b.current_record("tariff_car").await.unwrap().unwrap();

        let out_b = b.merge_remote(&rec_a).await.unwrap();
        let out_a = a.merge_remote(&rec_b).await.unwrap();
        assert!(matches!(out_a, MergeOutcome::Conflicted { .. }));
        assert!(matches!(out_b, MergeOutcome::Conflicted { .. }));

        // Both sides agree on the winner
        let win_a = a.get("tariff_car").await.unwrap().unwrap();
        let win_b = b.get("tariff_car").await.unwrap().unwrap();
        assert_eq!(win_a.rev, win_b.rev);
        assert_eq!(win_a.body, win_b.body);

        assert_eq!(a.conflicts("tariff_car").await.unwrap().len(), 1);
        assert_eq!(b.conflicted_ids().await.unwrap(), vec!["tariff_car".to_string()]);

        assert_eq!(a.discard_conflicts("tariff_car").await.unwrap(), 1);
        assert!(a.conflicts("tariff_car").await.unwrap().is_empty());
        assert!(a.get("tariff_car").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_leaf_finds_parked_revision() {
        let a = Ledger::in_memory().await.unwrap();
        let b = Ledger::in_memory().await.unwrap();
        let member = Document::new(DocBody::Member(Member {
            plate: "B1".into(),
            name: "x".into(),
            flat_rate: Some(0),
            active: true,
            valid_from: None,
            valid_until: None,
        }));
        a.put(&member).await.unwrap();
        let mut other = member.clone();
        if let DocBody::Member(m) = &mut other.body {
            m.name = "y".into();
        }
        b.put(&other).await.unwrap();

        let rec_b = b.current_record("member_B1").await.unwrap().unwrap();
        let outcome = a.merge_remote(&rec_b).await.unwrap();
        let MergeOutcome::Conflicted { loser, .. } = outcome else {
            panic!("expected conflict");
        };
        let leaf = a.leaf("member_B1", &loser).await.unwrap().unwrap();
        assert_eq!(leaf.rev, loser);
    }

    #[tokio::test]
    async fn test_ledger_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let config = LedgerStoreConfig {
            sqlite_path: path.to_string_lossy().to_string(),
            wal_mode: true,
        };

        {
            let ledger = Ledger::open(&config).await.unwrap();
            ledger.put(&tariff("car", 5000)).await.unwrap();
            ledger.close().await;
        }

        let ledger = Ledger::open(&config).await.unwrap();
        assert!(ledger.get("tariff_car").await.unwrap().is_some());
        assert_eq!(ledger.last_seq().await.unwrap(), 1);
    }

    fn on_disk(dir: &tempfile::TempDir) -> LedgerStoreConfig {
        LedgerStoreConfig {
            sqlite_path: dir.path().join("ledger.db").to_string_lossy().to_string(),
            wal_mode: true,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disk_concurrent_puts_on_one_revision() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(&on_disk(&dir)).await.unwrap();
        let mut doc = tariff("car", 5000);
        doc.rev = Some(ledger.put(&doc).await.unwrap());

        for round in 0..10u64 {
            let handles: Vec<_> = (0..6u64)
                .map(|i| {
                    let ledger = ledger.clone();
                    let mut doc = doc.clone();
                    tokio::spawn(async move {
                        if let DocBody::Tariff(t) = &mut doc.body {
                            t.base_rate = 6000 + round * 10 + i;
                        }
                        ledger.put(&doc).await
                    })
                })
                .collect();

            let mut winner = None;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(rev) => {
                        assert!(winner.is_none(), "two writers won round {}", round);
                        winner = Some(rev);
                    }
                    Err(LedgerError::Conflict { id }) => assert_eq!(id, "tariff_car"),
                    Err(e) => panic!("unexpected error in round {}: {}", round, e),
                }
            }
            doc = ledger.get("tariff_car").await.unwrap().unwrap();
            assert_eq!(doc.rev, winner);
        }
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_merge_remote_trims_long_history() {
        let ledger = Ledger::in_memory().await.unwrap();
        let doc = tariff("car", 5000);
        let body = serde_json::to_value(&doc.body).unwrap();

        let mut history: Vec<Revision> = Vec::new();
        for _ in 0..150 {
            let rev = Revision::next(history.first(), &body, false);
            history.insert(0, rev);
        }
        let record = RevisionRecord {
            id: "tariff_car".into(),
            rev: history[0].clone(),
            history: history.clone(),
            deleted: false,
            body: Some(doc.body.clone()),
        };

        assert_eq!(ledger.merge_remote(&record).await.unwrap(), MergeOutcome::Inserted);
        let stored = ledger.current_record("tariff_car").await.unwrap().unwrap();
        assert_eq!(stored.history.len(), crate::revision::MAX_HISTORY);
        assert_eq!(stored.history[0], history[0]);
        assert_eq!(stored.history[..], history[..crate::revision::MAX_HISTORY]);
    }

    #[tokio::test]
    async fn test_unknown_change_origin_is_rejected() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.put(&tariff("car", 5000)).await.unwrap();
        sqlx::query("UPDATE changes SET origin = 'mystery'")
            .execute(&ledger.pool)
            .await
            .unwrap();

        let err = ledger.changes_since(0, 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::DataIntegrity(_)), "got {:?}", err);
        assert_eq!(ChangeOrigin::from_name("local"), Some(ChangeOrigin::Local));
        assert_eq!(ChangeOrigin::from_name("mystery"), None);
    }
}
