// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication state types.
//!
//! # Channel State Transitions
//!
//! ```text
//!         start()
//! Idle ───────────→ Connecting ──(info ok)──→ Active ⇄ Paused
//!  ↑                   ↑   │                    │        │
//!  │ health restart    │   └───────┐            │        │
//!  │                   │ backoff   ↓            ↓        ↓
//!  └── (any state)     └────────── Error ←──────┴────────┘
//!
//! shutdown() / reconfigure(): any state → Stopped
//! ```
//!
//! - **Idle**: created, task not yet running (also right after a forced restart).
//! - **Connecting**: checking (or creating) the remote collection.
//! - **Active**: moving documents in either direction.
//! - **Paused**: caught up; waiting for a local change or a remote long-poll.
//! - **Error**: last attempt failed; waiting out the backoff delay.
//! - **Stopped**: terminal for this channel instance.

use crate::document::DocKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// State of one replication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelState {
    Idle,
    Connecting,
    Active,
    Paused,
    Error,
    Stopped,
}

impl ChannelState {
    /// States in which the remote was reachable on the last attempt.
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Active | ChannelState::Paused)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "Idle"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Active => write!(f, "Active"),
            ChannelState::Paused => write!(f, "Paused"),
            ChannelState::Error => write!(f, "Error"),
            ChannelState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Lifecycle of the supervisor as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    /// Not replicating: not started yet, or sync disabled in settings.
    Idle,
    /// Long-lived channels per collection.
    Continuous,
    /// Timer-driven bounded passes.
    Periodic,
    /// Shut down. Cannot be restarted.
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "Idle"),
            SupervisorState::Continuous => write!(f, "Continuous"),
            SupervisorState::Periodic => write!(f, "Periodic"),
            SupervisorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A named remote collection and the document kinds it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub kinds: &'static [DocKind],
}

impl CollectionSpec {
    pub fn accepts(&self, kind: Option<DocKind>) -> bool {
        kind.map(|k| self.kinds.contains(&k)).unwrap_or(false)
    }
}

/// Replicated collections. Settings are station-local and have none.
pub const COLLECTIONS: [CollectionSpec; 3] = [
    CollectionSpec {
        name: "transactions",
        kinds: &[DocKind::Transaction],
    },
    CollectionSpec {
        name: "tariffs",
        kinds: &[DocKind::Tariff],
    },
    CollectionSpec {
        name: "members",
        kinds: &[DocKind::Member],
    },
];

/// Snapshot of one channel, published through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub collection: String,
    pub state: ChannelState,
    /// Last time a push or pull completed.
    pub last_synced: Option<DateTime<Utc>>,
    /// Documents moved in either direction since the supervisor started.
    pub docs_synced: u64,
    pub docs_pushed: u64,
    pub docs_pulled: u64,
    /// Replicated revisions that ended up as stored conflicts.
    pub conflicts: u64,
    pub last_error: Option<String>,
    /// Epoch millis of the last state change, transfer or heartbeat.
    pub last_event_ms: u64,
    /// Consecutive failed attempts (drives backoff).
    pub attempt: u32,
    /// Forced restarts by the health monitor.
    pub restarts: u32,
}

impl ChannelStatus {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            state: ChannelState::Idle,
            last_synced: None,
            docs_synced: 0,
            docs_pushed: 0,
            docs_pulled: 0,
            conflicts: 0,
            last_error: None,
            last_event_ms: crate::clock::epoch_millis(),
            attempt: 0,
            restarts: 0,
        }
    }

    pub fn millis_since_event(&self) -> u64 {
        crate::clock::epoch_millis().saturating_sub(self.last_event_ms)
    }
}

/// Aggregate replication status shown to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SupervisorState,
    /// At least one collection reached the remote on its last attempt.
    pub connected: bool,
    /// Some channel is currently connecting or transferring.
    pub sync_active: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub docs_synced: u64,
    /// Local changes not yet pushed.
    pub pending_changes: u64,
    pub channels: Vec<ChannelStatus>,
}

/// Outcome of a bounded sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PassReport {
    pub pushed: u64,
    pub pulled: u64,
    pub conflicts: u64,
}

impl PassReport {
    pub fn absorb(&mut self, other: PassReport) {
        self.pushed += other.pushed;
        self.pulled += other.pulled;
        self.conflicts += other.conflicts;
    }

    pub fn moved(&self) -> u64 {
        self.pushed + self.pulled
    }
}
