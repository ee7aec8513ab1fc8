// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the gate ledger.
//!
//! Errors are split between business outcomes the operator sees
//! (`NoOpenTransaction`, `AlreadyClosed`), optimistic concurrency signals
//! (`Conflict`, `UpdateConflict`) and infrastructure failures (SQLite, the
//! remote endpoint).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Conflict` | Yes | Stale revision on put (retried by the writer) |
//! | `RemoteUnreachable` | Yes | Network failure, timeout, 5xx from the remote |
//! | `UpdateConflict` | No | Writer gave up after its retry budget |
//! | `NotFound` | No | Required document is absent |
//! | `NoOpenTransaction` | No | No OPEN stay matches the identifier |
//! | `AlreadyClosed` | No | The stay was closed by another exit |
//! | `AuthFailure` | No | Remote rejected credentials (channel still backs off) |
//! | `RemoteProtocol` | No | Remote answered with an unexpected status or body |
//! | `DataIntegrity` | No | Document violates a ledger invariant |
//! | `Store` | No | Local SQLite errors |
//! | `Serialization` | No | JSON encode/decode failure |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle misuse |
//! | `Shutdown` | No | Supervisor is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`LedgerError::is_retryable()`] is consulted by the replication channels
//! to decide between backoff-and-retry and surfacing the error. `Conflict`
//! is never shown to the operator: the [`ConflictSafeWriter`](crate::writer::ConflictSafeWriter)
//! consumes it and turns exhaustion into `UpdateConflict`.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in the ledger, the exit path or replication.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The supplied revision is not the document's current revision.
    #[error("Revision conflict on {id}")]
    Conflict { id: String },

    /// The conflict-safe writer exhausted its attempts.
    #[error("Update conflict on {id} after {attempts} attempts")]
    UpdateConflict { id: String, attempts: u32 },

    #[error("Document not found: {0}")]
    NotFound(String),

    /// No OPEN transaction matches the scanned identifier.
    #[error("No open transaction for '{identifier}'")]
    NoOpenTransaction { identifier: String },

    /// The transaction was closed by a concurrent exit.
    #[error("Transaction {transaction_id} is already closed")]
    AlreadyClosed { transaction_id: String },

    /// Network failure, timeout or server error talking to the remote.
    #[error("Remote unreachable ({operation}): {message}")]
    RemoteUnreachable { operation: String, message: String },

    /// The remote rejected our credentials.
    #[error("Remote rejected credentials: {0}")]
    AuthFailure(String),

    /// The remote answered, but not in a way we understand.
    #[error("Remote protocol error ({operation}, status {status}): {message}")]
    RemoteProtocol {
        operation: String,
        status: u16,
        message: String,
    },

    /// A document violates a ledger invariant, or required data is missing.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Local SQLite error.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Ledger store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. `start()` on a running supervisor).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Shutdown in progress")]
    Shutdown,

    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    pub fn unreachable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteUnreachable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::RemoteUnreachable { .. } => true, // Network errors are retryable
            Self::UpdateConflict { .. } => false,
            Self::NotFound(_) => false,
            Self::NoOpenTransaction { .. } => false,
            Self::AlreadyClosed { .. } => false,
            Self::AuthFailure(_) => false,
            Self::RemoteProtocol { .. } => false,
            Self::DataIntegrity(_) => false,
            Self::Store(_) => false, // Local DB issues need attention
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// True for errors that belong to the replication transport rather than
    /// to the ledger itself. Channels move to `Error` and back off on these.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnreachable { .. } | Self::AuthFailure(_) | Self::RemoteProtocol { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_conflict() {
        let err = LedgerError::conflict("transaction_abc");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("transaction_abc"));
    }

    #[test]
    fn test_is_retryable_remote_unreachable() {
        let err = LedgerError::unreachable("_changes", "connection refused");
        assert!(err.is_retryable());
        assert!(err.is_remote());
        assert!(err.to_string().contains("_changes"));
    }

    #[test]
    fn test_not_retryable_update_conflict() {
        let err = LedgerError::UpdateConflict {
            id: "settings_gate".to_string(),
            attempts: 3,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_not_retryable_business_errors() {
        let err = LedgerError::NoOpenTransaction {
            identifier: "UNKNOWN123".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("UNKNOWN123"));

        let err = LedgerError::AlreadyClosed {
            transaction_id: "T1".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_remote());
    }

    #[test]
    fn test_auth_failure_is_remote_but_not_retryable() {
        let err = LedgerError::AuthFailure("401 Unauthorized".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_remote());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = LedgerError::InvalidState {
            expected: "Stopped".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Stopped"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_serialization_from_serde() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: LedgerError = parse.unwrap_err().into();
        assert!(matches!(err, LedgerError::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
