// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Gate Ledger
//!
//! A local-first replicated transaction ledger for unattended parking gate
//! stations.
//!
//! ## Architecture
//!
//! Every station keeps a complete SQLite ledger and operates fully offline.
//! A replication supervisor reconciles it with a central CouchDB-compatible
//! remote whenever the remote is reachable:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                                Station                                    │
//! │                                                                           │
//! │  ┌───────────────┐   ┌────────────────────┐   ┌────────────────────────┐  │
//! │  │ ExitProcessor │──►│ ConflictSafeWriter │──►│ Ledger (SQLite)        │  │
//! │  │ + fee engine  │   │ (optimistic retry) │   │ documents / changes /  │  │
//! │  └───────┬───────┘   └────────────────────┘   │ conflicts / checkpoints│  │
//! │          │                                    └───────────┬────────────┘  │
//! │          ▼                                                │ change feed   │
//! │  ┌───────────────┐                            ┌───────────▼────────────┐  │
//! │  │ GateActuator  │                            │ ReplicationSupervisor  │  │
//! │  └───────────────┘                            │ channel per collection │  │
//! │                                               │ health monitor         │  │
//! │                                               └───────────┬────────────┘  │
//! └───────────────────────────────────────────────────────────┼───────────────┘
//!                                                             ▼
//!                                                   remote (HTTP / in-memory)
//! ```
//!
//! ## Guarantees
//!
//! 1. **At most one exit per entry**: the close runs inside the writer's
//!    optimistic loop and re-checks `OPEN` on every attempt.
//! 2. **No silent loss**: concurrent edits from other stations are kept as
//!    conflict revisions until reconciled.
//! 3. **Offline first**: replication failures never reach the exit path.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gate_ledger::{Station, StationConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let station = Station::open(StationConfig::default()).await.expect("Failed to open station");
//!     station.start().await.expect("Failed to start");
//!
//!     match station.process_exit("B1234XY", "op1", "gate1").await {
//!         Ok(receipt) => println!("Fee: {}", receipt.fee.amount),
//!         Err(e) => eprintln!("Exit rejected: {}", e),
//!     }
//!
//!     station.shutdown().await;
//! }
//! ```

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod exit;
pub mod fee;
pub mod gate;
pub mod ledger;
pub mod metrics;
pub mod remote;
pub mod replication;
pub mod resilience;
pub mod revision;
pub mod station;
pub mod writer;

// Re-exports for convenience
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{LedgerStoreConfig, StationConfig, SupervisorSettings, WriterPolicy};
pub use document::{
    DocBody, DocKind, Document, ExitDetails, GateSettings, Member, SettingsPatch, SyncConfig, Tariff, Transaction,
    TransactionStatus,
};
pub use error::{LedgerError, Result};
pub use exit::{EntryRequest, ExitProcessor, ExitReceipt, ExitRequest, ExitStats};
pub use fee::{compute_fee, FeeBasis, FeePolicy, FeeQuote};
pub use gate::{GateActuator, GateStatus, NoOpGate};
pub use ledger::{FindQuery, Ledger, MergeOutcome, RevisionRecord};
pub use remote::{HttpConnector, InMemoryRemote, RemoteConnector, RemoteStore};
pub use replication::{ChannelState, ChannelStatus, ReplicationSupervisor, SupervisorState, SyncStatus};
pub use revision::Revision;
pub use station::{ConflictSet, Station, StationBuilder};
pub use writer::ConflictSafeWriter;
