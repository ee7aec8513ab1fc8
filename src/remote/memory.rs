// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote endpoint.
//!
//! Keeps every leaf revision per document (like the real remote), numbers
//! changes with a per-collection sequence and wakes long-polls on write.
//! Can be switched offline or told to reject credentials, which makes it
//! the backbone of offline demos and the replication tests.

use super::{BoxFuture, ChangesPage, ChangesRequest, RemoteConnector, RemoteInfo, RemoteStore, WireDocument};
use crate::config::SupervisorSettings;
use crate::document::SyncConfig;
use crate::error::{LedgerError, Result};
use crate::ledger::wins;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Default)]
struct DocEntry {
    leaves: Vec<WireDocument>,
    seq: u64,
}

impl DocEntry {
    fn winner(&self) -> Option<&WireDocument> {
        self.leaves.iter().fold(None, |best: Option<&WireDocument>, leaf| match best {
            Some(b) if !wins(&leaf.rev, leaf.deleted, &b.rev, b.deleted) => Some(b),
            _ => Some(leaf),
        })
    }

    fn knows(&self, doc: &WireDocument) -> bool {
        self.leaves
            .iter()
            .any(|leaf| leaf.rev == doc.rev || leaf.history().contains(&doc.rev))
    }
}

#[derive(Default)]
struct Collection {
    docs: HashMap<String, DocEntry>,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    collections: Mutex<HashMap<String, Collection>>,
    changed: Notify,
    offline: AtomicBool,
    reject_auth: AtomicBool,
    requests: AtomicU64,
}

/// Shared in-memory remote. Clones talk to the same store.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
    inner: Arc<Inner>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::Release);
        if !online {
            // Parked long-polls notice on their next check.
            self.inner.changed.notify_waiters();
        }
        debug!(online, "In-memory remote connectivity changed");
    }

    /// Reject every request with `AuthFailure`.
    pub fn set_reject_auth(&self, reject: bool) {
        self.inner.reject_auth.store(reject, Ordering::Release);
    }

    /// Requests served or refused so far.
    pub fn request_count(&self) -> u64 {
        self.inner.requests.load(Ordering::Relaxed)
    }

    /// Current winning revision of `id`.
    pub async fn winner(&self, collection: &str, id: &str) -> Option<WireDocument> {
        let collections = self.inner.collections.lock().await;
        collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .and_then(|d| d.winner().cloned())
    }

    /// Every leaf revision of `id`.
    pub async fn leaves(&self, collection: &str, id: &str) -> Vec<WireDocument> {
        let collections = self.inner.collections.lock().await;
        collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .map(|d| d.leaves.clone())
            .unwrap_or_default()
    }

    /// Ids whose winner is not deleted.
    pub async fn live_ids(&self, collection: &str) -> Vec<String> {
        let collections = self.inner.collections.lock().await;
        let mut ids: Vec<String> = collections
            .get(collection)
            .map(|c| {
                c.docs
                    .iter()
                    .filter(|(_, d)| d.winner().map(|w| !w.deleted).unwrap_or(false))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn check_access(&self) -> Result<()> {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        if self.inner.offline.load(Ordering::Acquire) {
            return Err(LedgerError::unreachable("memory", "remote offline"));
        }
        if self.inner.reject_auth.load(Ordering::Acquire) {
            return Err(LedgerError::AuthFailure("credentials rejected".into()));
        }
        Ok(())
    }

    async fn read_page(&self, collection: &str, since: u64, limit: usize) -> Result<ChangesPage> {
        let collections = self.inner.collections.lock().await;
        let coll = collections
            .get(collection)
            .ok_or_else(|| LedgerError::NotFound(format!("collection {}", collection)))?;

        let mut changed: Vec<(&u64, &DocEntry)> = coll
            .docs
            .values()
            .filter(|d| d.seq > since)
            .map(|d| (&d.seq, d))
            .collect();
        changed.sort_by_key(|(seq, _)| **seq);
        changed.truncate(limit.max(1));

        let last_seq = match changed.last() {
            Some((seq, _)) => **seq,
            None => coll.seq.max(since),
        };
        let docs = changed
            .into_iter()
            .flat_map(|(_, d)| d.leaves.iter().cloned())
            .collect();
        Ok(ChangesPage {
            docs,
            last_seq: last_seq.to_string(),
        })
    }
}

fn parse_seq(since: &str) -> u64 {
    since.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

impl RemoteStore for InMemoryRemote {
    fn info(&self, collection: &str) -> BoxFuture<'_, RemoteInfo> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.check_access()?;
            let mut collections = self.inner.collections.lock().await;
            let coll = collections.entry(collection).or_default();
            let doc_count = coll
                .docs
                .values()
                .filter(|d| d.winner().map(|w| !w.deleted).unwrap_or(false))
                .count() as u64;
            Ok(RemoteInfo {
                doc_count,
                update_seq: coll.seq.to_string(),
            })
        })
    }

    fn changes(&self, collection: &str, request: ChangesRequest) -> BoxFuture<'_, ChangesPage> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.check_access()?;
            let since = parse_seq(&request.since);

            // Register for wakeups before looking, so a write in between is seen.
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let page = self.read_page(&collection, since, request.limit).await?;
            if !page.docs.is_empty() {
                return Ok(page);
            }
            let Some(wait) = request.longpoll else {
                return Ok(page);
            };

            let _ = tokio::time::timeout(wait, notified).await;
            if self.inner.offline.load(Ordering::Acquire) {
                return Err(LedgerError::unreachable("memory", "remote offline"));
            }
            self.read_page(&collection, since, request.limit).await
        })
    }

    fn bulk_write(&self, collection: &str, docs: Vec<WireDocument>) -> BoxFuture<'_, usize> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.check_access()?;
            let mut written = 0;
            {
                let mut collections = self.inner.collections.lock().await;
                let coll = collections
                    .get_mut(&collection)
                    .ok_or_else(|| LedgerError::NotFound(format!("collection {}", collection)))?;

                for doc in docs {
                    let next_seq = coll.seq + 1;
                    let entry = coll.docs.entry(doc.id.clone()).or_default();
                    if entry.knows(&doc) {
                        continue;
                    }
                    let ancestry = doc.history();
                    entry.leaves.retain(|leaf| !ancestry.contains(&leaf.rev));
                    entry.leaves.push(doc);
                    entry.seq = next_seq;
                    coll.seq = next_seq;
                    written += 1;
                }
            }
            if written > 0 {
                self.inner.changed.notify_waiters();
            }
            Ok(written)
        })
    }
}

impl RemoteConnector for InMemoryRemote {
    fn connect(&self, _sync: &SyncConfig, _settings: &SupervisorSettings) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{Revision, RevisionPath};
    use serde_json::{json, Map};
    use std::time::Duration;

    fn wire(id: &str, history: &[&str]) -> WireDocument {
        let revs: Vec<Revision> = history.iter().map(|r| r.parse().unwrap()).collect();
        let mut fields = Map::new();
        fields.insert("type".into(), json!("tariff"));
        WireDocument {
            id: id.into(),
            rev: revs[0].clone(),
            deleted: false,
            revisions: RevisionPath::from_history(&revs),
            fields,
        }
    }

    fn req(since: &str) -> ChangesRequest {
        ChangesRequest {
            since: since.into(),
            limit: 100,
            longpoll: None,
        }
    }

    #[tokio::test]
    async fn test_write_and_read_changes() {
        let remote = InMemoryRemote::new();
        remote.info("tariffs").await.unwrap();

        let n = remote
            .bulk_write("tariffs", vec![wire("tariff_car", &["1-aa"]), wire("tariff_bus", &["1-bb"])])
            .await
            .unwrap();
        assert_eq!(n, 2);

        let page = remote.changes("tariffs", req("")).await.unwrap();
        assert_eq!(page.docs.len(), 2);
        assert_eq!(page.last_seq, "2");

        let empty = remote.changes("tariffs", req(&page.last_seq)).await.unwrap();
        assert!(empty.docs.is_empty());
        assert_eq!(empty.last_seq, "2");
    }

    #[tokio::test]
    async fn test_descendant_replaces_ancestor_leaf() {
        let remote = InMemoryRemote::new();
        remote.info("tariffs").await.unwrap();
        remote.bulk_write("tariffs", vec![wire("tariff_car", &["1-aa"])]).await.unwrap();
        remote
            .bulk_write("tariffs", vec![wire("tariff_car", &["2-cc", "1-aa"])])
            .await
            .unwrap();

        assert_eq!(remote.leaves("tariffs", "tariff_car").await.len(), 1);

        // Resending an ancestor is a no-op
        let n = remote.bulk_write("tariffs", vec![wire("tariff_car", &["1-aa"])]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_concurrent_leaves_kept_with_deterministic_winner() {
        let remote = InMemoryRemote::new();
        remote.info("tariffs").await.unwrap();
        remote.bulk_write("tariffs", vec![wire("tariff_car", &["2-aa", "1-00"])]).await.unwrap();
        remote.bulk_write("tariffs", vec![wire("tariff_car", &["2-bb", "1-00"])]).await.unwrap();

        assert_eq!(remote.leaves("tariffs", "tariff_car").await.len(), 2);
        let winner = remote.winner("tariffs", "tariff_car").await.unwrap();
        assert_eq!(winner.rev.to_string(), "2-bb");
        assert_eq!(remote.live_ids("tariffs").await, vec!["tariff_car".to_string()]);
    }

    #[tokio::test]
    async fn test_longpoll_wakes_on_write() {
        let remote = InMemoryRemote::new();
        remote.info("members").await.unwrap();

        let writer = remote.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut doc = wire("member_B1", &["1-aa"]);
            doc.fields.insert("type".into(), json!("member"));
            writer.bulk_write("members", vec![doc]).await.unwrap();
        });

        let page = remote
            .changes(
                "members",
                ChangesRequest {
                    since: "0".into(),
                    limit: 10,
                    longpoll: Some(Duration::from_secs(5)),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.docs.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_and_auth_failures() {
        let remote = InMemoryRemote::new();
        remote.set_online(false);
        let err = remote.info("tariffs").await.unwrap_err();
        assert!(matches!(err, LedgerError::RemoteUnreachable { .. }));
        assert!(err.is_retryable());

        remote.set_online(true);
        remote.set_reject_auth(true);
        let err = remote.info("tariffs").await.unwrap_err();
        assert!(matches!(err, LedgerError::AuthFailure(_)));
        assert_eq!(remote.request_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let remote = InMemoryRemote::new();
        let err = remote.changes("nope", req("")).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
