// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Exit processing outcomes and fees
//! - Optimistic write conflicts
//! - Replication channel state, restarts and throughput
//! - Merge conflicts surfaced by pulls
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `gate_ledger_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only emits; installing a recorder/exporter is the host's job.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a successful exit and the fee charged.
pub fn record_exit_processed(gate_id: &str, fee: u64) {
    counter!("gate_ledger_exits_processed_total", "gate_id" => gate_id.to_string()).increment(1);
    histogram!("gate_ledger_exit_fee", "gate_id" => gate_id.to_string()).record(fee as f64);
}

/// Record a rejected exit (`no_open_transaction`, `already_closed`, ...).
pub fn record_exit_rejected(reason: &str) {
    counter!("gate_ledger_exits_rejected_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_entry_recorded(gate_id: &str) {
    counter!("gate_ledger_entries_recorded_total", "gate_id" => gate_id.to_string()).increment(1);
}

/// Record a lost revision race in the conflict-safe writer.
pub fn record_writer_conflict() {
    counter!("gate_ledger_writer_conflicts_total").increment(1);
}

/// Record a fee fallback because the tariff was missing.
pub fn record_fee_default(vehicle_type: &str) {
    counter!("gate_ledger_fee_default_total", "vehicle_type" => vehicle_type.to_string()).increment(1);
}

/// Record a channel state transition.
pub fn set_channel_state(collection: &str, state: &str) {
    gauge!("gate_ledger_channel_state", "collection" => collection.to_string(), "state" => state.to_string()).set(1.0);
    counter!("gate_ledger_channel_transitions_total", "collection" => collection.to_string(), "state" => state.to_string()).increment(1);
}

/// Record a forced restart by the health monitor.
pub fn record_channel_restart(collection: &str) {
    counter!("gate_ledger_channel_restarts_total", "collection" => collection.to_string()).increment(1);
}

pub fn record_docs_pushed(collection: &str, count: usize) {
    counter!("gate_ledger_docs_pushed_total", "collection" => collection.to_string()).increment(count as u64);
}

pub fn record_docs_pulled(collection: &str, count: usize) {
    counter!("gate_ledger_docs_pulled_total", "collection" => collection.to_string()).increment(count as u64);
}

/// Record a concurrent-edit conflict stored during a pull.
pub fn record_merge_conflict(collection: &str) {
    counter!("gate_ledger_merge_conflicts_total", "collection" => collection.to_string()).increment(1);
}

/// Record remote call latency.
pub fn record_remote_latency(collection: &str, operation: &str, duration: Duration) {
    histogram!(
        "gate_ledger_remote_latency_seconds",
        "collection" => collection.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_remote_error(collection: &str, error_type: &str) {
    counter!("gate_ledger_remote_errors_total", "collection" => collection.to_string(), "error_type" => error_type.to_string()).increment(1);
}

/// Record a periodic / manual pass.
pub fn record_sync_pass(mode: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("gate_ledger_sync_passes_total", "mode" => mode.to_string(), "status" => status).increment(1);
    histogram!("gate_ledger_sync_pass_duration_seconds", "mode" => mode.to_string()).record(duration.as_secs_f64());
}

/// Record a checkpoint flush.
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("gate_ledger_checkpoint_flushes_total").increment(1);
    counter!("gate_ledger_checkpoints_flushed_total").increment(flushed as u64);
    if errors > 0 {
        counter!("gate_ledger_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Record a SQLite busy retry.
pub fn sqlite_retries_total(operation: &str) {
    counter!("gate_ledger_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Set pending (unpushed) local changes.
pub fn set_pending_changes(count: u64) {
    gauge!("gate_ledger_pending_changes").set(count as f64);
}

/// Set supervisor state.
pub fn set_supervisor_state(state: &str) {
    gauge!("gate_ledger_supervisor_state", "state" => state.to_string()).set(1.0);
}
