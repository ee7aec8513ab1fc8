// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The station context: one per gate process.
//!
//! Owns the ledger, the writer, the exit processor, the replication
//! supervisor and the gate actuator. Nothing here is global; tests open as
//! many stations as they like side by side.
//!
//! # Lifecycle
//!
//! ```text
//! Station::open(config)   ledger + default settings, nothing running
//!        │
//!        ▼
//! start()                 supervisor started from stored sync settings
//!        │
//!        ▼
//! update_settings(patch)  sync change → supervisor.reconfigure()
//!        │
//!        ▼
//! shutdown()              supervisor stopped, checkpoints flushed, ledger closed
//! ```
//!
//! Exit processing never waits on replication: a station with the remote
//! down keeps working from its local ledger.

use crate::checkpoint::CheckpointStore;
use crate::clock::{Clock, SystemClock};
use crate::config::StationConfig;
use crate::document::{DocBody, Document, GateSettings, Member, SettingsPatch, Tariff, Transaction, SETTINGS_ID};
use crate::error::{LedgerError, Result};
use crate::exit::{EntryRequest, ExitProcessor, ExitReceipt, ExitRequest, ExitStats};
use crate::gate::{GateActuator, NoOpGate};
use crate::ledger::{Ledger, RevisionRecord};
use crate::remote::{HttpConnector, RemoteConnector};
use crate::replication::{PassReport, ReplicationSupervisor, SupervisorState, SyncStatus};
use crate::writer::ConflictSafeWriter;
use chrono::NaiveDate;
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A document with concurrent revisions parked by replication.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictSet {
    pub id: String,
    /// The revision the ledger currently serves.
    pub current: Option<RevisionRecord>,
    /// Losing leaves, kept until reconciled.
    pub conflicts: Vec<RevisionRecord>,
}

/// Collaborators a station can be opened with. Defaults are the system
/// clock, the HTTP remote and a gate without hardware.
pub struct StationBuilder {
    config: StationConfig,
    clock: Arc<dyn Clock>,
    connector: Arc<dyn RemoteConnector>,
    gate: Arc<dyn GateActuator>,
}

impl StationBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn gate(mut self, gate: Arc<dyn GateActuator>) -> Self {
        self.gate = gate;
        self
    }

    pub async fn open(self) -> Result<Station> {
        let StationBuilder {
            config,
            clock,
            connector,
            gate,
        } = self;

        let ledger = Ledger::open(&config.ledger).await?;
        let checkpoints = Arc::new(CheckpointStore::open(&ledger).await?);
        let writer = ConflictSafeWriter::new(ledger.clone(), config.writer.retry(), Arc::clone(&clock));
        let exits = ExitProcessor::new(writer.clone(), Arc::clone(&clock), config.fee.clone());
        let supervisor = ReplicationSupervisor::new(ledger.clone(), checkpoints, connector, config.supervisor.clone());

        let station = Station {
            config,
            ledger,
            writer,
            exits,
            supervisor,
            gate,
            clock,
            started: AtomicBool::new(false),
        };
        station.ensure_settings().await?;

        info!(
            station_id = %station.config.station_id,
            ledger = %station.ledger.path(),
            "Station opened"
        );
        Ok(station)
    }
}

pub struct Station {
    config: StationConfig,
    ledger: Ledger,
    writer: ConflictSafeWriter,
    exits: ExitProcessor,
    supervisor: ReplicationSupervisor,
    gate: Arc<dyn GateActuator>,
    clock: Arc<dyn Clock>,
    started: AtomicBool,
}

impl Station {
    pub fn builder(config: StationConfig) -> StationBuilder {
        StationBuilder {
            config,
            clock: Arc::new(SystemClock),
            connector: Arc::new(HttpConnector),
            gate: Arc::new(NoOpGate::new()),
        }
    }

    /// Open with default collaborators.
    pub async fn open(config: StationConfig) -> Result<Self> {
        Self::builder(config).open().await
    }

    async fn ensure_settings(&self) -> Result<()> {
        if self.ledger.get(SETTINGS_ID).await?.is_some() {
            return Ok(());
        }
        match self
            .writer
            .create(DocBody::Settings(GateSettings::new(self.clock.now())))
            .await
        {
            Ok(_) => {
                info!("Created default gate settings");
                Ok(())
            }
            // Created concurrently; either copy is a valid default.
            Err(LedgerError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.config.station_id
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn supervisor(&self) -> &ReplicationSupervisor {
        &self.supervisor
    }

    pub fn gate(&self) -> &Arc<dyn GateActuator> {
        &self.gate
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start replication from the stored sync settings.
    pub async fn start(&self) -> Result<()> {
        let settings = self.settings().await?;
        self.supervisor.start(settings.sync).await?;
        self.started.store(true, Ordering::Release);
        info!(station_id = %self.config.station_id, replication = %self.supervisor.state(), "Station started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!(station_id = %self.config.station_id, "Shutting down station");
        self.supervisor.shutdown().await;
        self.started.store(false, Ordering::Release);
        self.ledger.close().await;
    }

    // =========================================================================
    // Operator API
    // =========================================================================

    pub async fn find_open_transaction(&self, identifier: &str) -> Result<Option<Transaction>> {
        Ok(self
            .exits
            .find_open_transaction(identifier)
            .await?
            .and_then(|doc| doc.as_transaction().cloned()))
    }

    pub async fn process_exit(&self, identifier: &str, operator_id: &str, gate_id: &str) -> Result<ExitReceipt> {
        self.process_exit_with(ExitRequest {
            identifier: identifier.to_string(),
            operator_id: operator_id.to_string(),
            gate_id: gate_id.to_string(),
            exit_image: None,
        })
        .await
    }

    /// Close the stay and, when configured, raise the barrier. A gate
    /// failure is logged; the exit stays recorded.
    pub async fn process_exit_with(&self, request: ExitRequest) -> Result<ExitReceipt> {
        let receipt = self.exits.process_exit_with(request).await?;

        match self.settings().await {
            Ok(settings) if settings.open_gate_on_exit => {
                if let Err(e) = self.gate.open(Some(settings.gate_timeout())).await {
                    warn!(
                        transaction_id = %receipt.transaction.transaction_id,
                        error = %e,
                        "Gate failed to open after exit"
                    );
                }
            }
            Ok(_) => debug!("Gate left closed (open_gate_on_exit is off)"),
            Err(e) => warn!(error = %e, "Could not read gate settings after exit"),
        }
        Ok(receipt)
    }

    pub async fn record_entry(&self, request: EntryRequest) -> Result<Transaction> {
        self.exits.record_entry(request).await
    }

    pub async fn exit_stats(&self, day: NaiveDate) -> Result<ExitStats> {
        self.exits.exit_stats(day).await
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        self.supervisor.status().await
    }

    pub async fn sync_now(&self) -> Result<PassReport> {
        self.supervisor.sync_now().await
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn settings(&self) -> Result<GateSettings> {
        self.ledger
            .get(SETTINGS_ID)
            .await?
            .as_ref()
            .and_then(Document::as_settings)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(SETTINGS_ID.to_string()))
    }

    /// Apply a partial update. A changed sync section restarts replication
    /// with the new values (if the station has been started).
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<GateSettings> {
        let before = self.settings().await?;
        let doc = self
            .writer
            .update(SETTINGS_ID, None, |doc| {
                let settings = doc
                    .as_settings_mut()
                    .ok_or_else(|| LedgerError::DataIntegrity(format!("{} is not a settings document", SETTINGS_ID)))?;
                settings.apply(&patch);
                Ok(())
            })
            .await?;
        let after = doc
            .as_settings()
            .cloned()
            .ok_or_else(|| LedgerError::DataIntegrity(format!("{} is not a settings document", SETTINGS_ID)))?;
        info!(
            gate_timeout_sec = after.gate_timeout_sec,
            open_gate_on_exit = after.open_gate_on_exit,
            "Settings updated"
        );

        let running = self.started.load(Ordering::Acquire) && self.supervisor.state() != SupervisorState::Stopped;
        if after.sync != before.sync && running {
            self.supervisor.reconfigure(after.sync.clone()).await?;
        }
        Ok(after)
    }

    // =========================================================================
    // Reference data
    // =========================================================================

    pub async fn upsert_tariff(&self, tariff: Tariff) -> Result<Document> {
        tariff.validate()?;
        self.writer.upsert(DocBody::Tariff(tariff)).await
    }

    pub async fn upsert_member(&self, member: Member) -> Result<Document> {
        self.writer.upsert(DocBody::Member(member)).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Documents holding conflicting revisions from replication.
    pub async fn conflicts(&self) -> Result<Vec<ConflictSet>> {
        let ids = self.ledger.conflicted_ids().await?;
        try_join_all(ids.into_iter().map(|id| async move {
            Ok::<_, LedgerError>(ConflictSet {
                current: self.ledger.current_record(&id).await?,
                conflicts: self.ledger.conflicts(&id).await?,
                id,
            })
        }))
        .await
    }

    /// Accept the current revision of `id` and drop its losing leaves.
    pub async fn discard_conflicts(&self, id: &str) -> Result<usize> {
        let dropped = self.ledger.discard_conflicts(id).await?;
        info!(id = %id, dropped, "Conflicts discarded");
        Ok(dropped)
    }
}
