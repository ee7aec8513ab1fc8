// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: backoff, optimistic-conflict retry, call timeouts.
//!
//! - [`BackoffPolicy`]: `min(base * 2^attempt, ceiling)` for replication
//!   channels sitting in `Error`, and for retried periodic passes.
//! - [`ConflictRetry`]: the one retry loop for optimistic writes. Retries
//!   only on [`LedgerError::Conflict`], sleeps a randomized delay between
//!   attempts, and reports exhaustion as [`LedgerError::UpdateConflict`].
//! - [`with_timeout`]: bounds a single remote call, independent of backoff.
//!
//! # Example
//!
//! ```rust
//! use gate_ledger::resilience::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
//! assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
//! ```

use crate::error::{LedgerError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Exponential backoff
// =============================================================================

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    /// Delay before reconnecting after `attempt` consecutive failures
    /// (0-indexed: the first failure waits `base`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms).min(self.ceiling)
    }
}

// =============================================================================
// Optimistic conflict retry
// =============================================================================

/// Bounded retry for read-modify-write cycles that lose a revision race.
#[derive(Debug, Clone)]
pub struct ConflictRetry {
    max_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(20), Duration::from_millis(80))
    }
}

impl ConflictRetry {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        let max_delay = max_delay.max(min_delay);
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// A random delay inside `[min_delay, max_delay]`.
    pub fn jitter(&self) -> Duration {
        let lo = self.min_delay.as_millis() as u64;
        let hi = self.max_delay.as_millis() as u64;
        if hi <= lo {
            return self.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the
    /// attempt budget is spent.
    ///
    /// `op` receives the 1-indexed attempt number and must re-read whatever
    /// state it depends on: every attempt starts from a fresh snapshot.
    pub async fn run<F, Fut, T>(&self, id: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(LedgerError::Conflict { .. }) if attempt < self.max_attempts => {
                    let delay = self.jitter();
                    debug!(id = %id, attempt, delay_ms = delay.as_millis() as u64, "Revision conflict, retrying");
                    crate::metrics::record_writer_conflict();
                    tokio::time::sleep(delay).await;
                }
                Err(LedgerError::Conflict { .. }) => {
                    crate::metrics::record_writer_conflict();
                    return Err(LedgerError::UpdateConflict {
                        id: id.to_string(),
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Per-call timeout
// =============================================================================

/// Bound one remote call. Elapsed timeouts become `RemoteUnreachable`.
pub async fn with_timeout<T, Fut>(operation: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::unreachable(
            operation,
            format!("timed out after {:?}", timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_for_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_for_attempt_caps_at_ceiling() {
        let policy = BackoffPolicy::default();
        // Huge attempt counts saturate instead of overflowing
        assert_eq!(policy.delay_for_attempt(63), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let retry = ConflictRetry::new(3, Duration::from_millis(20), Duration::from_millis(80));
        for _ in 0..100 {
            let d = retry.jitter();
            assert!(d >= Duration::from_millis(20) && d <= Duration::from_millis(80));
        }
    }

    #[test]
    fn test_conflict_retry_clamps() {
        let retry = ConflictRetry::new(0, Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(retry.max_attempts(), 1);
        assert_eq!(retry.jitter(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_run_retries_conflicts_then_succeeds() {
        let retry = ConflictRetry::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let result = retry
            .run("doc_1", move |attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(LedgerError::conflict("doc_1"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_exhaustion_is_update_conflict() {
        let retry = ConflictRetry::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let err = retry
            .run("settings_gate", |_| async { Err::<(), _>(LedgerError::conflict("settings_gate")) })
            .await
            .unwrap_err();

        match err {
            LedgerError::UpdateConflict { id, attempts } => {
                assert_eq!(id, "settings_gate");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected UpdateConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_does_not_retry_business_errors() {
        let retry = ConflictRetry::default();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry
            .run("transaction_1", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LedgerError::AlreadyClosed {
                        transaction_id: "1".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::AlreadyClosed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let err = with_timeout("info", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LedgerError::RemoteUnreachable { .. }));
        assert!(err.to_string().contains("info"));
    }
}
