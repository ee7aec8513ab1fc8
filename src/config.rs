// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a gate station.
//!
//! This is process-level configuration: where the ledger lives, how the
//! replication supervisor paces itself, fee fallbacks and writer retry
//! budget. The *remote* replication target (URL, credentials, interval) is
//! not here; it lives in the station-local `settings_gate` document as a
//! [`SyncConfig`](crate::document::SyncConfig) so operators can change it at
//! runtime.
//!
//! # Configuration Structure
//!
//! ```text
//! StationConfig
//! ├── station_id: String            # Gate station identity (logging)
//! ├── ledger: LedgerStoreConfig     # SQLite file + WAL
//! ├── supervisor: SupervisorSettings
//! │   ├── health: HealthConfig      # stale-channel watchdog
//! │   ├── backoff: BackoffConfig    # min(base * 2^n, ceiling)
//! │   ├── request_timeout           # per remote call
//! │   ├── heartbeat                 # long-poll window while Paused
//! │   └── batch_size / max_batches_per_pass / checkpoint_flush
//! ├── fee: FeePolicy                # default fee when tariff missing
//! └── writer: WriterPolicy          # optimistic retry budget + jitter
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "station_id": "exit-gate-1",
//!   "ledger": { "sqlite_path": "/var/lib/gate/ledger.db" },
//!   "supervisor": {
//!     "health": { "check_interval": "60s", "stale_threshold": "3m" },
//!     "backoff": { "base": "1s", "ceiling": "10s" },
//!     "request_timeout": "30s"
//!   },
//!   "fee": { "default_fee": 5000 }
//! }
//! ```

use crate::fee::FeePolicy;
use crate::resilience::{BackoffPolicy, ConflictRetry};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// StationConfig: passed to Station::open()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to [`Station::open()`](crate::Station::open).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Identity of this gate station. Used in log fields only.
    pub station_id: String,

    #[serde(default)]
    pub ledger: LedgerStoreConfig,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub fee: FeePolicy,

    #[serde(default)]
    pub writer: WriterPolicy,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_id: "gate.station.default".to_string(),
            ledger: LedgerStoreConfig::default(),
            supervisor: SupervisorSettings::default(),
            fee: FeePolicy::default(),
            writer: WriterPolicy::default(),
        }
    }
}

impl StationConfig {
    /// In-memory ledger and fast timers, for tests.
    pub fn for_testing(station_id: &str) -> Self {
        Self {
            station_id: station_id.to_string(),
            ledger: LedgerStoreConfig::in_memory(),
            supervisor: SupervisorSettings::for_testing(),
            fee: FeePolicy::default(),
            writer: WriterPolicy::for_testing(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LedgerStoreConfig: local SQLite file
// ═══════════════════════════════════════════════════════════════════════════════

/// Local ledger persistence.
///
/// Documents, the change log, conflict revisions and replication
/// checkpoints all live in this one SQLite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStoreConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for LedgerStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "gate_ledger.db".to_string(),
            wal_mode: true,
        }
    }
}

impl LedgerStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SupervisorSettings: replication pacing
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the replication supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Timeout for each individual remote call (e.g. "30s").
    /// Independent of the backoff delay between attempts.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Long-poll window used while a channel is Paused (e.g. "25s").
    /// An empty long-poll counts as a heartbeat.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,

    /// Documents per push or pull batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on batches per direction in one periodic / manual pass.
    #[serde(default = "default_max_batches_per_pass")]
    pub max_batches_per_pass: usize,

    /// How often dirty checkpoints are flushed to SQLite.
    #[serde(default = "default_checkpoint_flush")]
    pub checkpoint_flush: String,
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_heartbeat() -> String {
    "25s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_max_batches_per_pass() -> usize {
    50
}

fn default_checkpoint_flush() -> String {
    "5s".to_string()
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            backoff: BackoffConfig::default(),
            request_timeout: default_request_timeout(),
            heartbeat: default_heartbeat(),
            batch_size: default_batch_size(),
            max_batches_per_pass: default_max_batches_per_pass(),
            checkpoint_flush: default_checkpoint_flush(),
        }
    }
}

impl SupervisorSettings {
    /// Millisecond-scale timers so tests observe state changes quickly.
    pub fn for_testing() -> Self {
        Self {
            health: HealthConfig {
                enabled: true,
                check_interval: "100ms".to_string(),
                stale_threshold: "2s".to_string(),
            },
            backoff: BackoffConfig {
                base: "20ms".to_string(),
                ceiling: "200ms".to_string(),
            },
            request_timeout: "1s".to_string(),
            heartbeat: "200ms".to_string(),
            batch_size: 50,
            max_batches_per_pass: 20,
            checkpoint_flush: "100ms".to_string(),
        }
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_or(&self.request_timeout, Duration::from_secs(30))
    }

    pub fn heartbeat_duration(&self) -> Duration {
        parse_or(&self.heartbeat, Duration::from_secs(25))
    }

    pub fn checkpoint_flush_duration(&self) -> Duration {
        parse_or(&self.checkpoint_flush, Duration::from_secs(5))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff.policy()
    }
}

/// Stale-channel watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether to run the health monitor in continuous mode.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often channels are inspected.
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// A channel with no event for this long is force-restarted.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold: String,
}

fn default_check_interval() -> String {
    "60s".to_string()
}

fn default_stale_threshold() -> String {
    "3m".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_check_interval(),
            stale_threshold: default_stale_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval_duration(&self) -> Duration {
        parse_or(&self.check_interval, Duration::from_secs(60))
    }

    pub fn stale_threshold_duration(&self) -> Duration {
        parse_or(&self.stale_threshold, Duration::from_secs(180))
    }
}

/// Exponential backoff for channels in `Error`.
///
/// Actual delay = min(base * 2^attempt, ceiling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base: String,

    #[serde(default = "default_backoff_ceiling")]
    pub ceiling: String,
}

fn default_backoff_base() -> String {
    "1s".to_string()
}

fn default_backoff_ceiling() -> String {
    "10s".to_string()
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: default_backoff_base(),
            ceiling: default_backoff_ceiling(),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: parse_or(&self.base, Duration::from_secs(1)),
            ceiling: parse_or(&self.ceiling, Duration::from_secs(10)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WriterPolicy: optimistic concurrency budget
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry budget for the conflict-safe writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterPolicy {
    /// Total attempts (first try included) before `UpdateConflict`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lower bound of the randomized delay between attempts (ms).
    #[serde(default = "default_min_jitter_ms")]
    pub min_jitter_ms: u64,

    /// Upper bound of the randomized delay between attempts (ms).
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_jitter_ms() -> u64 {
    20
}

fn default_max_jitter_ms() -> u64 {
    80
}

impl Default for WriterPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_jitter_ms: default_min_jitter_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl WriterPolicy {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            min_jitter_ms: 1,
            max_jitter_ms: 5,
        }
    }

    pub fn retry(&self) -> ConflictRetry {
        ConflictRetry::new(
            self.max_attempts,
            Duration::from_millis(self.min_jitter_ms),
            Duration::from_millis(self.max_jitter_ms),
        )
    }
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_config_defaults() {
        let config = StationConfig::default();
        assert_eq!(config.ledger.sqlite_path, "gate_ledger.db");
        assert!(config.ledger.wal_mode);
        assert_eq!(config.fee.default_fee, 5000);
        assert_eq!(config.writer.max_attempts, 3);
    }

    #[test]
    fn test_for_testing_uses_memory() {
        let config = StationConfig::for_testing("gate-1");
        assert_eq!(config.station_id, "gate-1");
        assert!(config.ledger.is_in_memory());
        assert!(config.supervisor.request_timeout_duration() < Duration::from_secs(5));
    }

    #[test]
    fn test_health_defaults() {
        let health = HealthConfig::default();
        assert_eq!(health.check_interval_duration(), Duration::from_secs(60));
        assert_eq!(health.stale_threshold_duration(), Duration::from_secs(180));
    }

    #[test]
    fn test_duration_strings_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let settings = SupervisorSettings {
                request_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(settings.request_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let settings = SupervisorSettings {
            request_timeout: "soon".to_string(),
            heartbeat: "whenever".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.request_timeout_duration(), Duration::from_secs(30));
        assert_eq!(settings.heartbeat_duration(), Duration::from_secs(25));
    }

    #[test]
    fn test_backoff_config_to_policy() {
        let policy = BackoffConfig::default().policy();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.ceiling, Duration::from_secs(10));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{
            "station_id": "exit-2",
            "supervisor": { "health": { "stale_threshold": "90s" } },
            "fee": { "default_fee": 7000 }
        }"#;
        let config: StationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.station_id, "exit-2");
        assert_eq!(
            config.supervisor.health.stale_threshold_duration(),
            Duration::from_secs(90)
        );
        assert_eq!(config.supervisor.health.check_interval, "60s");
        assert_eq!(config.supervisor.batch_size, 100);
        assert_eq!(config.fee.default_fee, 7000);
        assert_eq!(config.ledger.sqlite_path, "gate_ledger.db");
    }

    #[test]
    fn test_writer_policy_retry() {
        let retry = WriterPolicy::default().retry();
        assert_eq!(retry.max_attempts(), 3);
    }
}
