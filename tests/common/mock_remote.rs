// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Misbehaving remotes and connectors for integration and chaos tests.
//!
//! Each wraps an [`InMemoryRemote`] so that whatever does get through is
//! stored with the real semantics and can be inspected afterwards.

use gate_ledger::config::SupervisorSettings;
use gate_ledger::remote::{BoxFuture, ChangesPage, ChangesRequest, RemoteInfo, RemoteStore, WireDocument};
use gate_ledger::{InMemoryRemote, LedgerError, RemoteConnector, Result, SyncConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fails every `fail_every`-th call with `RemoteUnreachable`.
#[derive(Clone)]
pub struct FlakyRemote {
    pub inner: InMemoryRemote,
    fail_every: u64,
    calls: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl FlakyRemote {
    pub fn new(inner: InMemoryRemote, fail_every: u64) -> Self {
        Self {
            inner,
            fail_every: fail_every.max(1),
            calls: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Injected failures so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, operation: &str) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n % self.fail_every == 0 {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(LedgerError::unreachable(operation, "injected failure"));
        }
        Ok(())
    }
}

impl RemoteStore for FlakyRemote {
    fn info(&self, collection: &str) -> BoxFuture<'_, RemoteInfo> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.maybe_fail("info")?;
            self.inner.info(&collection).await
        })
    }

    fn changes(&self, collection: &str, request: ChangesRequest) -> BoxFuture<'_, ChangesPage> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.maybe_fail("changes")?;
            self.inner.changes(&collection, request).await
        })
    }

    fn bulk_write(&self, collection: &str, docs: Vec<WireDocument>) -> BoxFuture<'_, usize> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.maybe_fail("bulk_write")?;
            self.inner.bulk_write(&collection, docs).await
        })
    }
}

impl RemoteConnector for FlakyRemote {
    fn connect(&self, _sync: &SyncConfig, _settings: &SupervisorSettings) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(self.clone()))
    }
}

/// `info` never answers while stalled, wedging channels in `Connecting`.
#[derive(Clone, Default)]
pub struct StallingRemote {
    pub inner: InMemoryRemote,
    stalled: Arc<AtomicBool>,
    info_calls: Arc<AtomicU64>,
}

impl StallingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn info_calls(&self) -> u64 {
        self.info_calls.load(Ordering::SeqCst)
    }
}

impl RemoteStore for StallingRemote {
    fn info(&self, collection: &str) -> BoxFuture<'_, RemoteInfo> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.info_calls.fetch_add(1, Ordering::SeqCst);
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.info(&collection).await
        })
    }

    fn changes(&self, collection: &str, request: ChangesRequest) -> BoxFuture<'_, ChangesPage> {
        self.inner.changes(collection, request)
    }

    fn bulk_write(&self, collection: &str, docs: Vec<WireDocument>) -> BoxFuture<'_, usize> {
        self.inner.bulk_write(collection, docs)
    }
}

impl RemoteConnector for StallingRemote {
    fn connect(&self, _sync: &SyncConfig, _settings: &SupervisorSettings) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Connector that only accepts `memory://` remotes, like a station whose
/// operator typed a broken URL.
#[derive(Clone, Default)]
pub struct MemoryOnlyConnector {
    pub inner: InMemoryRemote,
}

impl MemoryOnlyConnector {
    pub fn new(inner: InMemoryRemote) -> Self {
        Self { inner }
    }
}

impl RemoteConnector for MemoryOnlyConnector {
    fn connect(&self, sync: &SyncConfig, settings: &SupervisorSettings) -> Result<Arc<dyn RemoteStore>> {
        if !sync.remote_url.starts_with("memory://") {
            return Err(LedgerError::Config(format!("unsupported remote '{}'", sync.remote_url)));
        }
        self.inner.connect(sync, settings)
    }
}
