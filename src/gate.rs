// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gate actuator integration.
//!
//! The physical driver (serial relay, GPIO, sensor polling) lives outside
//! this crate. The station only needs to open the barrier after an exit and
//! to report what the barrier is doing.
//!
//! # Example
//!
//! ```rust,no_run
//! use gate_ledger::gate::{GateActuator, GateStatus};
//! use gate_ledger::remote::BoxFuture;
//! use std::time::Duration;
//!
//! struct RelayGate;
//!
//! impl GateActuator for RelayGate {
//!     fn open(&self, _auto_close: Option<Duration>) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn close(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn status(&self) -> BoxFuture<'_, GateStatus> {
//!         Box::pin(async { Ok(GateStatus::Closed) })
//!     }
//! }
//! ```

use crate::remote::BoxFuture;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// What the barrier is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateStatus {
    Closed,
    Opening,
    Open,
    Closing,
    Error,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Closed => write!(f, "Closed"),
            GateStatus::Opening => write!(f, "Opening"),
            GateStatus::Open => write!(f, "Open"),
            GateStatus::Closing => write!(f, "Closing"),
            GateStatus::Error => write!(f, "Error"),
        }
    }
}

/// Barrier control.
pub trait GateActuator: Send + Sync + 'static {
    /// Raise the barrier; lower it again after `auto_close` if given.
    fn open(&self, auto_close: Option<Duration>) -> BoxFuture<'_, ()>;

    fn close(&self) -> BoxFuture<'_, ()>;

    fn status(&self) -> BoxFuture<'_, GateStatus>;

    /// Open for `duration`, then close (maintenance check).
    fn test(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.open(None).await?;
            tokio::time::sleep(duration).await;
            self.close().await
        })
    }
}

/// Actuator without hardware. Records status transitions so tests and
/// headless stations can see what would have happened.
#[derive(Debug, Clone)]
pub struct NoOpGate {
    inner: Arc<Mutex<NoOpState>>,
}

#[derive(Debug)]
struct NoOpState {
    status: GateStatus,
    transitions: Vec<GateStatus>,
    /// Bumped on every command so a stale auto-close does not fire.
    generation: u64,
}

impl Default for NoOpGate {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NoOpState {
                status: GateStatus::Closed,
                transitions: Vec::new(),
                generation: 0,
            })),
        }
    }
}

impl NoOpGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status the gate has passed through, oldest first.
    pub fn transitions(&self) -> Vec<GateStatus> {
        self.with_state(|s| s.transitions.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NoOpState) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn transition(state: &mut NoOpState, steps: &[GateStatus]) {
        for step in steps {
            state.status = *step;
            state.transitions.push(*step);
        }
    }
}

impl GateActuator for NoOpGate {
    fn open(&self, auto_close: Option<Duration>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let generation = self.with_state(|s| {
                s.generation += 1;
                Self::transition(s, &[GateStatus::Opening, GateStatus::Open]);
                s.generation
            });
            debug!(?auto_close, "Gate opened (no-op)");

            if let Some(delay) = auto_close {
                let gate = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    gate.with_state(|s| {
                        if s.generation == generation && s.status == GateStatus::Open {
                            Self::transition(s, &[GateStatus::Closing, GateStatus::Closed]);
                        }
                    });
                });
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                s.generation += 1;
                if s.status != GateStatus::Closed {
                    Self::transition(s, &[GateStatus::Closing, GateStatus::Closed]);
                }
            });
            debug!("Gate closed (no-op)");
            Ok(())
        })
    }

    fn status(&self) -> BoxFuture<'_, GateStatus> {
        Box::pin(async move { Ok(self.with_state(|s| s.status)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_close_transitions() {
        let gate = NoOpGate::new();
        assert_eq!(gate.status().await.unwrap(), GateStatus::Closed);

        gate.open(None).await.unwrap();
        assert_eq!(gate.status().await.unwrap(), GateStatus::Open);

        gate.close().await.unwrap();
        assert_eq!(
            gate.transitions(),
            vec![GateStatus::Opening, GateStatus::Open, GateStatus::Closing, GateStatus::Closed]
        );

        // Closing a closed gate records nothing
        gate.close().await.unwrap();
        assert_eq!(gate.transitions().len(), 4);
    }

    #[tokio::test]
    async fn test_auto_close() {
        let gate = NoOpGate::new();
        gate.open(Some(Duration::from_millis(20))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gate.status().await.unwrap(), GateStatus::Closed);
    }

    #[tokio::test]
    async fn test_reopen_cancels_earlier_auto_close() {
        let gate = NoOpGate::new();
        gate.open(Some(Duration::from_millis(20))).await.unwrap();
        gate.open(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gate.status().await.unwrap(), GateStatus::Open);
    }

    #[tokio::test]
    async fn test_gate_test_cycle() {
        let gate = NoOpGate::new();
        gate.test(Duration::from_millis(5)).await.unwrap();
        assert_eq!(gate.status().await.unwrap(), GateStatus::Closed);
        assert_eq!(gate.transitions().len(), 4);
    }
}
