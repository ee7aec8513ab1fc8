// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication channel: a collection's push and pull against the remote.
//!
//! # Push
//!
//! 1. Read local-origin change rows after the `push_seq` checkpoint
//! 2. Resolve each `(id, rev)` to its leaf (skipping revisions that were
//!    superseded locally before they could be shipped)
//! 3. `bulk_write` with ancestry, then advance `push_seq`
//!
//! # Pull
//!
//! 1. Read a change page after the `pull_since` checkpoint
//! 2. `merge_remote` every document of an accepted kind
//! 3. Advance `pull_since` to the page's `last_seq`
//!
//! Replicated writes are logged with origin `replicated` and never pushed
//! back, so a document echoed by the remote costs one `Unchanged` merge.
//!
//! # Continuous Loop
//!
//! ```text
//! Connecting ──info──► Active: push/pull until nothing moves
//!                        │
//!                        ▼
//!                      Paused: select! {
//!                        local notice    → Active
//!                        remote longpoll → Active (docs) / heartbeat (empty)
//!                      }
//! any error ──► Error ──backoff(attempt)──► Connecting
//! ```
//!
//! Cancellation is checked around the whole session, so a channel stuck in
//! a remote call still stops promptly.

use super::types::{ChannelState, ChannelStatus, CollectionSpec, PassReport};
use crate::checkpoint::CheckpointStore;
use crate::config::SupervisorSettings;
use crate::error::{LedgerError, Result};
use crate::ledger::{ChangeNotice, ChangeOrigin, Ledger, MergeOutcome};
use crate::metrics;
use crate::remote::{ChangesRequest, RemoteStore, WireDocument};
use crate::resilience::with_timeout;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// Result of one pull page.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PullOutcome {
    /// Documents in the page (any kind).
    pub received: usize,
    /// Documents that changed the local ledger.
    pub applied: usize,
    pub conflicts: usize,
    /// Whether the remote sequence advanced.
    pub advanced: bool,
}

/// Everything a channel needs, shared by the continuous task and by
/// bounded passes.
#[derive(Clone)]
pub(crate) struct ChannelContext {
    pub spec: CollectionSpec,
    ledger: Ledger,
    remote: Arc<dyn RemoteStore>,
    checkpoints: Arc<CheckpointStore>,
    settings: SupervisorSettings,
    status: Arc<watch::Sender<ChannelStatus>>,
}

impl ChannelContext {
    pub fn new(
        spec: CollectionSpec,
        ledger: Ledger,
        remote: Arc<dyn RemoteStore>,
        checkpoints: Arc<CheckpointStore>,
        settings: SupervisorSettings,
        status: Arc<watch::Sender<ChannelStatus>>,
    ) -> Self {
        Self {
            spec,
            ledger,
            remote,
            checkpoints,
            settings,
            status,
        }
    }

    fn name(&self) -> &'static str {
        self.spec.name
    }

    // =========================================================================
    // Status publishing
    // =========================================================================

    pub fn set_state(&self, state: ChannelState) {
        let mut changed = false;
        self.status.send_modify(|s| {
            changed = s.state != state;
            s.state = state;
            s.last_event_ms = crate::clock::epoch_millis();
        });
        if changed {
            debug!(collection = self.name(), state = %state, "Channel state changed");
            metrics::set_channel_state(self.name(), &state.to_string());
        }
    }

    /// Refresh liveness without changing state (an empty long-poll).
    fn heartbeat(&self) {
        self.status.send_modify(|s| s.last_event_ms = crate::clock::epoch_millis());
    }

    fn record_progress(&self, pushed: usize, pull: &PullOutcome) {
        self.status.send_modify(|s| {
            s.docs_pushed += pushed as u64;
            s.docs_pulled += pull.applied as u64;
            s.docs_synced += (pushed + pull.applied) as u64;
            s.conflicts += pull.conflicts as u64;
            s.last_synced = Some(chrono::Utc::now());
            s.last_event_ms = crate::clock::epoch_millis();
        });
    }

    fn record_connected(&self) {
        self.status.send_modify(|s| {
            s.attempt = 0;
            s.last_error = None;
        });
    }

    /// Enter `Error` and return the backoff to wait before reconnecting.
    fn record_failure(&self, error: &LedgerError) -> Duration {
        let mut attempt = 0;
        self.status.send_modify(|s| {
            attempt = s.attempt;
            s.attempt = s.attempt.saturating_add(1);
            s.last_error = Some(error.to_string());
        });
        self.set_state(ChannelState::Error);
        metrics::record_remote_error(self.name(), error_label(error));
        self.settings.backoff_policy().delay_for_attempt(attempt)
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    /// Check (or create) the remote collection.
    pub async fn connect(&self) -> Result<()> {
        let info = with_timeout(
            "info",
            self.settings.request_timeout_duration(),
            self.remote.info(self.name()),
        )
        .await?;
        debug!(collection = self.name(), doc_count = info.doc_count, update_seq = %info.update_seq, "Remote collection ready");
        Ok(())
    }

    /// Ship one batch of local changes. Returns `(rows consumed, docs sent)`.
    pub async fn push_batch(&self) -> Result<(usize, usize)> {
        let checkpoint = self.checkpoints.get(self.name()).await;
        let rows = self
            .ledger
            .local_changes(checkpoint.push_seq, self.spec.kinds, self.settings.batch_size as i64)
            .await?;
        let Some(last_seq) = rows.last().map(|r| r.seq) else {
            return Ok((0, 0));
        };

        let mut seen = HashSet::new();
        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            if !seen.insert((row.id.as_str(), row.rev.clone())) {
                continue;
            }
            // Superseded before it was shipped: the newer row carries its history.
            if let Some(record) = self.ledger.leaf(&row.id, &row.rev).await? {
                docs.push(WireDocument::from_record(&record)?);
            }
        }

        let sent = docs.len();
        if sent > 0 {
            let accepted = with_timeout(
                "bulk_write",
                self.settings.request_timeout_duration(),
                self.remote.bulk_write(self.name(), docs),
            )
            .await?;
            if accepted < sent {
                debug!(collection = self.name(), sent, accepted, "Remote already had some revisions");
            }
            metrics::record_docs_pushed(self.name(), sent);
        }

        self.checkpoints.set_push(self.name(), last_seq).await;
        debug!(collection = self.name(), rows = rows.len(), sent, push_seq = last_seq, "Pushed batch");
        Ok((rows.len(), sent))
    }

    /// Apply one page of remote changes.
    pub async fn pull_batch(&self, longpoll: Option<Duration>) -> Result<PullOutcome> {
        let checkpoint = self.checkpoints.get(self.name()).await;
        let timeout = self.settings.request_timeout_duration() + longpoll.unwrap_or_default();
        let page = with_timeout(
            "changes",
            timeout,
            self.remote.changes(
                self.name(),
                ChangesRequest {
                    since: checkpoint.pull_since.clone(),
                    limit: self.settings.batch_size,
                    longpoll,
                },
            ),
        )
        .await?;

        let mut outcome = PullOutcome {
            received: page.docs.len(),
            advanced: page.last_seq != checkpoint.pull_since,
            ..Default::default()
        };

        for doc in page.docs {
            if !self.spec.accepts(doc.kind()) {
                continue;
            }
            let id = doc.id.clone();
            let record = match doc.into_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(collection = self.name(), id = %id, error = %e, "Skipping undecodable remote document");
                    continue;
                }
            };
            match self.ledger.merge_remote(&record).await {
                Ok(MergeOutcome::Unchanged) => {}
                Ok(MergeOutcome::Conflicted { .. }) => {
                    outcome.applied += 1;
                    outcome.conflicts += 1;
                    metrics::record_merge_conflict(self.name());
                }
                Ok(_) => outcome.applied += 1,
                Err(LedgerError::DataIntegrity(msg)) => {
                    warn!(collection = self.name(), id = %id, error = %msg, "Rejected invalid remote document");
                }
                Err(e) => return Err(e),
            }
        }

        if outcome.applied > 0 {
            metrics::record_docs_pulled(self.name(), outcome.applied);
        }
        if outcome.advanced {
            self.checkpoints.set_pull(self.name(), &page.last_seq).await;
        }
        debug!(
            collection = self.name(),
            received = outcome.received,
            applied = outcome.applied,
            conflicts = outcome.conflicts,
            last_seq = %page.last_seq,
            "Pulled page"
        );
        Ok(outcome)
    }

    /// Push and pull until neither direction moves, or `max_rounds` is spent.
    pub async fn drain(&self, max_rounds: Option<usize>) -> Result<PassReport> {
        let mut report = PassReport::default();
        let mut rounds = 0;
        loop {
            let (rows, sent) = self.push_batch().await?;
            let pull = self.pull_batch(None).await?;
            self.record_progress(sent, &pull);
            report.absorb(PassReport {
                pushed: sent as u64,
                pulled: pull.applied as u64,
                conflicts: pull.conflicts as u64,
            });

            rounds += 1;
            let idle = rows == 0 && pull.received == 0 && !pull.advanced;
            if idle || max_rounds.is_some_and(|max| rounds >= max) {
                return Ok(report);
            }
        }
    }

    /// One bounded pass, as run by the periodic timer and `sync_now()`.
    ///
    /// With `track_state` the channel walks Connecting → Active → Paused
    /// (or Error); otherwise only counters move.
    pub async fn bounded_pass(&self, track_state: bool) -> Result<PassReport> {
        if track_state {
            self.set_state(ChannelState::Connecting);
        }
        let result = async {
            self.connect().await?;
            if track_state {
                self.record_connected();
                self.set_state(ChannelState::Active);
            }
            self.drain(Some(self.settings.max_batches_per_pass.max(1))).await
        }
        .await;

        match &result {
            Ok(_) if track_state => self.set_state(ChannelState::Paused),
            Ok(_) => {}
            Err(e) if track_state => {
                self.record_failure(e);
            }
            Err(_) => {}
        }
        result
    }
}

fn error_label(error: &LedgerError) -> &'static str {
    match error {
        LedgerError::RemoteUnreachable { .. } => "unreachable",
        LedgerError::AuthFailure(_) => "auth",
        LedgerError::RemoteProtocol { .. } => "protocol",
        LedgerError::Store(_) => "store",
        _ => "other",
    }
}

/// Wait for a committed local write of one of `spec`'s kinds.
async fn next_local_change(notices: &mut broadcast::Receiver<ChangeNotice>, spec: CollectionSpec) {
    loop {
        match notices.recv().await {
            Ok(notice) if notice.origin == ChangeOrigin::Local && spec.kinds.contains(&notice.kind) => return,
            Ok(_) => continue,
            // Missed notices may include ours; the push reads the table anyway.
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Connect, then alternate between catching up and waiting. Only returns
/// on error; cancellation drops the future.
async fn run_session(
    ctx: &ChannelContext,
    notices: &mut broadcast::Receiver<ChangeNotice>,
    heartbeat: Duration,
) -> Result<Infallible> {
    ctx.connect().await?;
    ctx.record_connected();
    info!("Channel connected");

    loop {
        ctx.set_state(ChannelState::Active);
        let start = Instant::now();
        let report = ctx.drain(None).await?;
        if report.moved() > 0 {
            info!(
                pushed = report.pushed,
                pulled = report.pulled,
                conflicts = report.conflicts,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Channel caught up"
            );
        }
        ctx.set_state(ChannelState::Paused);

        // Stay Paused across empty long-polls.
        loop {
            tokio::select! {
                _ = next_local_change(notices, ctx.spec) => break,
                pulled = ctx.pull_batch(Some(heartbeat)) => {
                    let pull = pulled?;
                    if pull.received > 0 || pull.advanced {
                        ctx.record_progress(0, &pull);
                        break;
                    }
                    ctx.heartbeat();
                }
            }
        }
    }
}

/// Run a continuous channel until `cancel_rx` flips to `true`.
pub(crate) async fn run_channel(ctx: ChannelContext, mut cancel_rx: watch::Receiver<bool>) {
    let span = info_span!("channel", collection = ctx.name());

    async move {
        info!("Starting replication channel");
        let heartbeat = ctx.settings.heartbeat_duration();
        let mut notices = ctx.ledger.subscribe();

        loop {
            if *cancel_rx.borrow() {
                break;
            }

            ctx.set_state(ChannelState::Connecting);
            let error = tokio::select! {
                biased;
                _ = cancel_rx.changed() => break,
                result = run_session(&ctx, &mut notices, heartbeat) => match result {
                    Ok(never) => match never {},
                    Err(e) => e,
                },
            };

            let delay = ctx.record_failure(&error);
            warn!(error = %error, delay_ms = delay.as_millis() as u64, "Channel error, backing off");
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Replication channel stopped");
    }
    .instrument(span)
    .await
}
