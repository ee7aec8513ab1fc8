// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication supervisor.
//!
//! Owns one channel per replicated collection and the tasks around them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     ReplicationSupervisor                        │
//! │                                                                  │
//! │  Continuous mode                     Periodic mode               │
//! │  ┌────────────────────────────┐      ┌─────────────────────────┐ │
//! │  │ channel: transactions      │      │ timer (sync_interval)   │ │
//! │  │ channel: tariffs           │      │  └─ bounded pass,       │ │
//! │  │ channel: members           │      │     retried w/ backoff  │ │
//! │  └──────────┬─────────────────┘      └─────────────────────────┘ │
//! │             │ watch<ChannelStatus>                               │
//! │  ┌──────────▼─────────────────┐      ┌─────────────────────────┐ │
//! │  │ health monitor             │      │ checkpoint flusher      │ │
//! │  │ restarts stale channels    │      │ (both modes)            │ │
//! │  └────────────────────────────┘      └─────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrent edits pulled from the remote are stored as conflicts by the
//! ledger and counted per channel; resolving them is left to the caller.

mod channel;
mod health;
mod periodic;
pub mod types;

pub use types::{ChannelState, ChannelStatus, CollectionSpec, PassReport, SupervisorState, SyncStatus, COLLECTIONS};

use crate::checkpoint::CheckpointStore;
use crate::config::SupervisorSettings;
use crate::document::SyncConfig;
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::metrics;
use crate::remote::{RemoteConnector, RemoteStore};
use channel::{run_channel, ChannelContext};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for each task before aborting it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct ChannelTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the supervisor and its background tasks.
pub(crate) struct Core {
    ledger: Ledger,
    checkpoints: Arc<CheckpointStore>,
    settings: SupervisorSettings,
    /// Status senders outlive channel restarts, so watchers keep receiving.
    statuses: Vec<(CollectionSpec, Arc<watch::Sender<ChannelStatus>>)>,
    channels: DashMap<&'static str, ChannelTask>,
    remote: RwLock<Option<Arc<dyn RemoteStore>>>,
    /// Serializes bounded passes (periodic ticks and `sync_now`).
    pass_lock: Mutex<()>,
}

impl Core {
    fn new(ledger: Ledger, checkpoints: Arc<CheckpointStore>, settings: SupervisorSettings) -> Self {
        let statuses = COLLECTIONS
            .iter()
            .map(|spec| (*spec, Arc::new(watch::channel(ChannelStatus::new(spec.name)).0)))
            .collect();
        Self {
            ledger,
            checkpoints,
            settings,
            statuses,
            channels: DashMap::new(),
            remote: RwLock::new(None),
            pass_lock: Mutex::new(()),
        }
    }

    pub(crate) fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn status_sender(&self, name: &str) -> Option<&Arc<watch::Sender<ChannelStatus>>> {
        self.statuses.iter().find(|(spec, _)| spec.name == name).map(|(_, tx)| tx)
    }

    /// Snapshot of every channel that currently has a running task.
    pub(crate) fn running_channels(&self) -> Vec<(CollectionSpec, ChannelStatus)> {
        self.statuses
            .iter()
            .filter(|(spec, _)| self.channels.contains_key(spec.name))
            .map(|(spec, tx)| (*spec, tx.borrow().clone()))
            .collect()
    }

    async fn context(&self, spec: CollectionSpec) -> Option<ChannelContext> {
        let remote = self.remote.read().await.clone()?;
        let status = Arc::clone(self.status_sender(spec.name)?);
        Some(ChannelContext::new(
            spec,
            self.ledger.clone(),
            remote,
            Arc::clone(&self.checkpoints),
            self.settings.clone(),
            status,
        ))
    }

    async fn spawn_channel(&self, spec: CollectionSpec) -> bool {
        let Some(ctx) = self.context(spec).await else {
            warn!(collection = spec.name, "No remote configured, channel not started");
            return false;
        };
        ctx.set_state(ChannelState::Idle);
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_channel(ctx, cancel_rx));
        self.channels.insert(spec.name, ChannelTask { cancel, handle });
        debug!(collection = spec.name, "Spawned replication channel");
        true
    }

    /// Cancel and abort a channel's task, then start a fresh one.
    pub(crate) async fn restart_channel(&self, spec: CollectionSpec) -> bool {
        if let Some((_, task)) = self.channels.remove(spec.name) {
            let _ = task.cancel.send(true);
            task.handle.abort();
        }
        if let Some(tx) = self.status_sender(spec.name) {
            tx.send_modify(|s| s.restarts += 1);
        }
        metrics::record_channel_restart(spec.name);
        self.spawn_channel(spec).await
    }

    async fn stop_channels(&self) {
        let names: Vec<&'static str> = self.channels.iter().map(|entry| *entry.key()).collect();
        for name in names {
            let Some((_, task)) = self.channels.remove(name) else {
                continue;
            };
            let _ = task.cancel.send(true);
            let abort = task.handle.abort_handle();
            match tokio::time::timeout(DRAIN_TIMEOUT, task.handle).await {
                Ok(Ok(())) => debug!(collection = name, "Channel stopped"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(collection = name, error = %e, "Channel task panicked"),
                Err(_) => {
                    warn!(collection = name, "Channel did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        for (spec, tx) in &self.statuses {
            tx.send_modify(|s| {
                s.state = ChannelState::Stopped;
                s.last_event_ms = crate::clock::epoch_millis();
            });
            metrics::set_channel_state(spec.name, "Stopped");
        }
    }

    /// Bounded pass over every collection. The caller holds `pass_lock`.
    ///
    /// A failing collection does not stop the others; the first error is
    /// returned after all have been tried.
    pub(crate) async fn pass_locked(&self, track_state: bool, mode: &str) -> Result<PassReport> {
        let start = Instant::now();
        let mut total = PassReport::default();
        let mut first_error = None;

        for spec in COLLECTIONS {
            let Some(ctx) = self.context(spec).await else {
                return Err(LedgerError::Config("replication is not configured".into()));
            };
            match ctx.bounded_pass(track_state).await {
                Ok(report) => total.absorb(report),
                Err(e) => {
                    warn!(collection = spec.name, error = %e, "Sync pass failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        metrics::record_sync_pass(mode, first_error.is_none(), start.elapsed());
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    mode,
                    pushed = total.pushed,
                    pulled = total.pulled,
                    conflicts = total.conflicts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sync pass complete"
                );
                Ok(total)
            }
        }
    }
}

#[derive(Default)]
struct Runtime {
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
    sync: Option<SyncConfig>,
}

/// Runs replication for one station.
pub struct ReplicationSupervisor {
    core: Arc<Core>,
    connector: Arc<dyn RemoteConnector>,
    state_tx: watch::Sender<SupervisorState>,
    runtime: Mutex<Runtime>,
}

impl ReplicationSupervisor {
    pub fn new(
        ledger: Ledger,
        checkpoints: Arc<CheckpointStore>,
        connector: Arc<dyn RemoteConnector>,
        settings: SupervisorSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Self {
            core: Arc::new(Core::new(ledger, checkpoints, settings)),
            connector,
            state_tx,
            runtime: Mutex::new(Runtime::default()),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);
        metrics::set_supervisor_state(&state.to_string());
    }

    /// Start replicating with `sync`. A disabled config leaves the
    /// supervisor `Idle`.
    pub async fn start(&self, sync: SyncConfig) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        match self.state() {
            SupervisorState::Stopped => return Err(LedgerError::Shutdown),
            SupervisorState::Continuous | SupervisorState::Periodic => {
                return Err(LedgerError::InvalidState {
                    expected: "Idle".to_string(),
                    actual: self.state().to_string(),
                })
            }
            SupervisorState::Idle => {}
        }
        self.launch(&mut runtime, sync).await
    }

    /// Tear down the current channels and start again with `sync`.
    pub async fn reconfigure(&self, sync: SyncConfig) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if self.state() == SupervisorState::Stopped {
            return Err(LedgerError::Shutdown);
        }
        info!(enabled = sync.is_enabled(), continuous = sync.continuous, "Reconfiguring replication");
        self.halt(&mut runtime).await;
        self.launch(&mut runtime, sync).await
    }

    /// Stop everything and flush checkpoints. Idempotent.
    pub async fn shutdown(&self) {
        let mut runtime = self.runtime.lock().await;
        if self.state() == SupervisorState::Stopped {
            return;
        }
        info!("Shutting down replication supervisor");
        self.halt(&mut runtime).await;
        self.set_state(SupervisorState::Stopped);
        info!("Replication supervisor stopped");
    }

    async fn launch(&self, runtime: &mut Runtime, sync: SyncConfig) -> Result<()> {
        runtime.sync = Some(sync.clone());
        if !sync.is_enabled() {
            info!("Replication disabled (auto-sync off or no remote configured)");
            self.set_state(SupervisorState::Idle);
            return Ok(());
        }

        let remote = match self.connector.connect(&sync, &self.core.settings) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(remote = %sync.remote_url, error = %e, "Cannot connect to remote, replication left idle");
                self.set_state(SupervisorState::Idle);
                return Err(e);
            }
        };
        *self.core.remote.write().await = Some(remote);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runtime.handles.push(spawn_checkpoint_flush(
            Arc::clone(&self.core.checkpoints),
            self.core.settings.checkpoint_flush_duration(),
            shutdown_rx.clone(),
        ));

        if sync.continuous {
            for spec in COLLECTIONS {
                self.core.spawn_channel(spec).await;
            }
            if self.core.settings.health.enabled {
                let core = Arc::clone(&self.core);
                let rx = shutdown_rx.clone();
                runtime.handles.push(tokio::spawn(health::run_health_monitor(core, rx)));
            }
            self.set_state(SupervisorState::Continuous);
        } else {
            let core = Arc::clone(&self.core);
            let interval = sync.sync_interval();
            let retries = sync.retry_attempts;
            runtime
                .handles
                .push(tokio::spawn(periodic::run_periodic(core, interval, retries, shutdown_rx)));
            self.set_state(SupervisorState::Periodic);
        }

        runtime.shutdown_tx = Some(shutdown_tx);
        info!(
            remote = %sync.remote_url,
            mode = %self.state(),
            collections = COLLECTIONS.len(),
            "Replication started"
        );
        Ok(())
    }

    async fn halt(&self, runtime: &mut Runtime) {
        if let Some(tx) = runtime.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        // Background tasks first: the health monitor may still be respawning a channel.
        let handles = std::mem::take(&mut runtime.handles);
        for (i, handle) in handles.into_iter().enumerate() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    abort.abort();
                }
            }
        }

        self.core.stop_channels().await;
        self.core.checkpoints.close().await;
        *self.core.remote.write().await = None;
    }

    /// Run one bounded pass now, whatever the mode.
    pub async fn sync_now(&self) -> Result<PassReport> {
        let track_state = match self.state() {
            SupervisorState::Stopped => return Err(LedgerError::Shutdown),
            SupervisorState::Idle => {
                return Err(LedgerError::Config("replication is not enabled".into()));
            }
            // Live channels own their state; a manual pass only moves counters.
            SupervisorState::Continuous => false,
            SupervisorState::Periodic => true,
        };
        let _guard = self.core.pass_lock.lock().await;
        self.core.pass_locked(track_state, "manual").await
    }

    /// The sync settings the supervisor was last started with.
    pub async fn sync_config(&self) -> Option<SyncConfig> {
        self.runtime.lock().await.sync.clone()
    }

    pub fn channel_status(&self, collection: &str) -> Option<ChannelStatus> {
        self.core.status_sender(collection).map(|tx| tx.borrow().clone())
    }

    /// Subscribe to a channel's status updates.
    pub fn watch_channel(&self, collection: &str) -> Option<watch::Receiver<ChannelStatus>> {
        self.core.status_sender(collection).map(|tx| tx.subscribe())
    }

    /// Aggregate status across channels, with the local push backlog.
    pub async fn status(&self) -> Result<SyncStatus> {
        let channels: Vec<ChannelStatus> = self.core.statuses.iter().map(|(_, tx)| tx.borrow().clone()).collect();

        let mut pending_changes = 0;
        for spec in COLLECTIONS {
            let checkpoint = self.core.checkpoints.get(spec.name).await;
            pending_changes += self.core.ledger.pending_local_changes(checkpoint.push_seq, spec.kinds).await?;
        }
        metrics::set_pending_changes(pending_changes);

        Ok(SyncStatus {
            state: self.state(),
            connected: channels.iter().any(|c| c.state.is_connected()),
            sync_active: channels
                .iter()
                .any(|c| matches!(c.state, ChannelState::Connecting | ChannelState::Active)),
            last_sync: channels.iter().filter_map(|c| c.last_synced).max(),
            error_message: channels
                .iter()
                .find(|c| c.state == ChannelState::Error)
                .and_then(|c| c.last_error.clone()),
            docs_synced: channels.iter().map(|c| c.docs_synced).sum(),
            pending_changes,
            channels,
        })
    }
}

/// Periodically flush dirty checkpoints to SQLite.
fn spawn_checkpoint_flush(
    checkpoints: Arc<CheckpointStore>,
    flush_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = checkpoints.flush_dirty().await {
                        warn!(error = %e, "Failed to flush checkpoints");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Checkpoint flush task stopping");
                        break;
                    }
                }
            }
        }
    })
}
