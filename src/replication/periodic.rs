// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timer-driven replication.
//!
//! Every `sync_interval` one bounded pass runs over all collections. A tick
//! that finds a pass still running (its own, or a manual `sync_now`) is
//! skipped. A failed pass is retried up to `retry_attempts` times with the
//! channel backoff between attempts.

use super::Core;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub(crate) async fn run_periodic(
    core: Arc<Core>,
    interval: Duration,
    retry_attempts: u32,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_s = interval.as_secs(), retry_attempts, "Starting periodic replication");
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let Ok(_guard) = core.pass_lock.try_lock() else {
                    debug!("Sync pass already running, skipping tick");
                    continue;
                };
                if !run_with_retries(&core, retry_attempts, &mut shutdown_rx).await {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("Periodic replication stopped");
}

/// Returns `false` when shutdown interrupted the retries.
async fn run_with_retries(core: &Core, retry_attempts: u32, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let backoff = core.settings().backoff_policy();
    let mut attempt = 0;
    loop {
        match core.pass_locked(true, "periodic").await {
            Ok(_) => return true,
            Err(e) if attempt < retry_attempts => {
                let delay = backoff.delay_for_attempt(attempt);
                attempt += 1;
                warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Periodic sync failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return false;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, attempts = attempt + 1, "Periodic sync failed, waiting for next interval");
                return true;
            }
        }
    }
}
